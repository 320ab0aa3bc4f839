//! Inbound request normalization.
//!
//! Clients may send loosely-formed requests: no `jsonrpc`, no `id`, a bare
//! method name. Before dispatch every request object is turned into a proper
//! JSON-RPC 2.0 envelope.

use serde_json::{Map, Value};

use stackrun_contract::JSONRPC_VERSION;

/// Service used for method names without an explicit `Service.` prefix.
pub const DEFAULT_SERVICE: &str = "Default";

/// Inbound document after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    /// Top-level `id` of the inbound document; identifies the task.
    pub task_id: String,
    /// The `req` member: one envelope or an ordered batch of envelopes.
    pub reqs: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("request is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("request must be a JSON object")]
    NotAnObject,
    #[error("request has no 'req' field")]
    MissingReq,
}

/// Return `container[key]` as a string, generating and storing a UUID if absent.
///
/// Existing values are coerced to strings and written back, so repeated calls
/// always see the same id.
pub fn ensure_id(container: &mut Map<String, Value>, key: &str) -> String {
    let id = match container.get(key) {
        Some(Value::String(s)) => return s.clone(),
        Some(other) => other.to_string(),
        None => uuid::Uuid::new_v4().to_string(),
    };
    container.insert(key.to_string(), Value::String(id.clone()));
    id
}

/// Parse and normalize a raw inbound document.
pub fn normalize(raw: &str, default_service: &str) -> Result<NormalizedRequest, EnvelopeError> {
    let input: Value = serde_json::from_str(raw)?;
    let Value::Object(mut input) = input else {
        return Err(EnvelopeError::NotAnObject);
    };

    let task_id = ensure_id(&mut input, "id");
    let reqs = input.remove("req").ok_or(EnvelopeError::MissingReq)?;

    let reqs = match reqs {
        Value::Array(reqs) => Value::Array(
            reqs.into_iter()
                .map(|req| normalize_one(req, default_service))
                .collect(),
        ),
        req => normalize_one(req, default_service),
    };

    Ok(NormalizedRequest { task_id, reqs })
}

/// Normalize a single request object. Non-objects pass through untouched so
/// the dispatcher can report them as invalid requests.
pub fn normalize_one(req: Value, default_service: &str) -> Value {
    let Value::Object(mut req) = req else {
        return req;
    };

    req.entry("jsonrpc")
        .or_insert_with(|| Value::String(JSONRPC_VERSION.to_string()));
    ensure_id(&mut req, "id");

    if let Some(Value::String(method)) = req.get_mut("method")
        && !method.contains('.')
    {
        *method = qualify(method, default_service);
    }

    Value::Object(req)
}

fn qualify(method: &str, default_service: &str) -> String {
    format!("{default_service}.{method}")
}
