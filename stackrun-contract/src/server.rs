//! JSON-RPC 2.0 dispatch against a [`Contract`].
//!
//! The server validates each request against the contract and hands resolved
//! calls to an [`ExternalCaller`]. Batches are processed sequentially and the
//! responses keep request order.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::contract::Contract;
use crate::error::{CallError, DispatchError, ERR_INVALID_RESP, RpcError};

pub const JSONRPC_VERSION: &str = "2.0";

/// Capability used for every method the contract resolves to the external implementation.
#[async_trait]
pub trait ExternalCaller: Send + Sync {
    async fn forward(&self, method: &str, params: Value, task_id: &str)
    -> Result<Value, CallError>;
}

pub struct Server {
    contract: Contract,
}

impl Server {
    pub fn new(contract: Contract) -> Self {
        Self { contract }
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    /// Dispatch a single request object or a batch.
    ///
    /// Per-request failures become error objects in the response. Only a
    /// [`CallError::Fatal`] from the caller aborts the dispatch.
    pub async fn call(
        &self,
        request: Value,
        task_id: &str,
        caller: &dyn ExternalCaller,
    ) -> Result<Value, DispatchError> {
        match request {
            Value::Array(reqs) if reqs.is_empty() => Ok(error_response(
                Value::Null,
                RpcError::invalid_request("Invalid Request: empty batch"),
            )),
            Value::Array(reqs) => {
                tracing::debug!(batch_size = reqs.len(), "Dispatching batch request");
                let mut responses = Vec::with_capacity(reqs.len());
                for req in reqs {
                    responses.push(self.call_one(req, task_id, caller).await?);
                }
                Ok(Value::Array(responses))
            }
            req => self.call_one(req, task_id, caller).await,
        }
    }

    async fn call_one(
        &self,
        request: Value,
        task_id: &str,
        caller: &dyn ExternalCaller,
    ) -> Result<Value, DispatchError> {
        let Value::Object(req) = request else {
            return Ok(error_response(
                Value::Null,
                RpcError::invalid_request("Invalid Request: not an object"),
            ));
        };
        let id = req.get("id").cloned().unwrap_or(Value::Null);

        let (method, params) = match self.validate(&req) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected request");
                return Ok(error_response(id, e));
            }
        };

        tracing::debug!(%method, %task_id, "Forwarding call");
        match caller.forward(&method, params, task_id).await {
            Ok(result) => match self.check_result(&method, &result) {
                Ok(()) => Ok(success_response(id, result)),
                Err(e) => Ok(error_response(id, e)),
            },
            Err(CallError::Rpc(e)) => {
                tracing::info!(%method, code = e.code, message = %e.message, "Call returned an error");
                Ok(error_response(id, e))
            }
            Err(CallError::Fatal(source)) => Err(DispatchError::Caller { method, source }),
        }
    }

    fn validate(&self, req: &Map<String, Value>) -> Result<(String, Value), RpcError> {
        let method = req
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_request("Invalid Request: missing method"))?;

        let func = self
            .contract
            .function(method)
            .ok_or_else(|| RpcError::method_not_found(method))?;

        let params = match req.get("params") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(params)) => params.clone(),
            Some(_) => {
                return Err(RpcError::invalid_params(
                    "Invalid params: params must be an array",
                ));
            }
        };

        if params.len() != func.params.len() {
            return Err(RpcError::invalid_params(format!(
                "Function '{}' expects {} param(s). {} given.",
                method,
                func.params.len(),
                params.len()
            )));
        }

        for (decl, value) in func.params.iter().zip(&params) {
            decl.ty.check(value).map_err(|e| {
                RpcError::invalid_params(format!(
                    "Function '{}' invalid param '{}': {}",
                    method, decl.name, e
                ))
            })?;
        }

        Ok((method.to_string(), Value::Array(params)))
    }

    fn check_result(&self, method: &str, result: &Value) -> Result<(), RpcError> {
        let Some(returns) = self.contract.function(method).and_then(|f| f.returns.as_ref())
        else {
            return Ok(());
        };
        returns.check(result).map_err(|e| {
            RpcError::new(
                ERR_INVALID_RESP,
                format!("Function '{method}' invalid response: {e}"),
            )
        })
    }
}

fn success_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

fn error_response(id: Value, error: RpcError) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": error.code, "message": error.message },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const IDL: &str = r#"[
        {"type": "interface", "name": "Default", "functions": [
            {"name": "echo", "params": [{"name": "x", "type": "string"}], "returns": {"type": "string"}},
            {"name": "add", "params": [{"name": "a", "type": "int"}, {"name": "b", "type": "int"}], "returns": {"type": "int"}},
            {"name": "fail", "params": []},
            {"name": "crash", "params": []}
        ]}
    ]"#;

    /// Caller that implements the contract in-process and records every call.
    #[derive(Default)]
    struct RecordingCaller {
        calls: Mutex<Vec<(String, Value, String)>>,
    }

    #[async_trait]
    impl ExternalCaller for RecordingCaller {
        async fn forward(
            &self,
            method: &str,
            params: Value,
            task_id: &str,
        ) -> Result<Value, CallError> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_string(), params.clone(), task_id.to_string()));
            match method {
                "Default.echo" => Ok(params[0].clone()),
                "Default.add" => Ok(json!(params[0].as_i64().unwrap() + params[1].as_i64().unwrap())),
                "Default.fail" => Err(CallError::Rpc(RpcError::new(99, "boom"))),
                _ => Err(CallError::Fatal("shim exited with code 2".into())),
            }
        }
    }

    fn server() -> Server {
        Server::new(Contract::from_json(IDL).unwrap())
    }

    #[tokio::test]
    async fn single_request_succeeds() {
        let caller = RecordingCaller::default();
        let resp = server()
            .call(
                json!({"jsonrpc": "2.0", "id": "1", "method": "Default.echo", "params": ["hi"]}),
                "task-1",
                &caller,
            )
            .await
            .unwrap();

        insta::assert_json_snapshot!(resp, @r#"
        {
          "id": "1",
          "jsonrpc": "2.0",
          "result": "hi"
        }
        "#);
        let calls = caller.calls.lock().unwrap();
        assert_eq!(calls[0].0, "Default.echo");
        assert_eq!(calls[0].2, "task-1");
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let caller = RecordingCaller::default();
        let resp = server()
            .call(
                json!([
                    {"id": "a", "method": "Default.add", "params": [1, 2]},
                    {"id": "b", "method": "Default.echo", "params": ["second"]}
                ]),
                "task-1",
                &caller,
            )
            .await
            .unwrap();

        assert_eq!(resp[0]["id"], "a");
        assert_eq!(resp[0]["result"], 3);
        assert_eq!(resp[1]["id"], "b");
        assert_eq!(resp[1]["result"], "second");
    }

    #[tokio::test]
    async fn unknown_method_is_not_forwarded() {
        let caller = RecordingCaller::default();
        let resp = server()
            .call(json!({"id": "1", "method": "Default.nope"}), "t", &caller)
            .await
            .unwrap();

        assert_eq!(resp["error"]["code"], -32601);
        assert!(caller.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_arity_and_type_are_invalid_params() {
        let caller = RecordingCaller::default();
        let srv = server();

        let resp = srv
            .call(json!({"id": "1", "method": "Default.add", "params": [1]}), "t", &caller)
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32602);
        assert_eq!(
            resp["error"]["message"],
            "Function 'Default.add' expects 2 param(s). 1 given."
        );

        let resp = srv
            .call(json!({"id": "2", "method": "Default.echo", "params": [5]}), "t", &caller)
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32602);

        let resp = srv
            .call(json!({"id": "3", "method": "Default.echo", "params": {"x": "hi"}}), "t", &caller)
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], -32602);
        assert!(caller.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rpc_errors_become_error_objects() {
        let caller = RecordingCaller::default();
        let resp = server()
            .call(json!({"id": "1", "method": "Default.fail", "params": []}), "t", &caller)
            .await
            .unwrap();

        insta::assert_json_snapshot!(resp, @r#"
        {
          "error": {
            "code": 99,
            "message": "boom"
          },
          "id": "1",
          "jsonrpc": "2.0"
        }
        "#);
    }

    #[tokio::test]
    async fn fatal_errors_abort_the_batch() {
        let caller = RecordingCaller::default();
        let err = server()
            .call(
                json!([
                    {"id": "1", "method": "Default.crash", "params": []},
                    {"id": "2", "method": "Default.echo", "params": ["never"]}
                ]),
                "t",
                &caller,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Default.crash"));
        assert_eq!(caller.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests() {
        let caller = RecordingCaller::default();
        let srv = server();

        let resp = srv.call(json!([]), "t", &caller).await.unwrap();
        assert_eq!(resp["error"]["code"], -32600);

        let resp = srv.call(json!("nope"), "t", &caller).await.unwrap();
        assert_eq!(resp["error"]["code"], -32600);
        assert_eq!(resp["id"], Value::Null);

        let resp = srv.call(json!({"id": "x"}), "t", &caller).await.unwrap();
        assert_eq!(resp["error"]["code"], -32600);
        assert_eq!(resp["id"], "x");
    }

    #[tokio::test]
    async fn result_type_is_checked() {
        struct WrongType;

        #[async_trait]
        impl ExternalCaller for WrongType {
            async fn forward(&self, _: &str, _: Value, _: &str) -> Result<Value, CallError> {
                Ok(json!(42))
            }
        }

        let resp = server()
            .call(json!({"id": "1", "method": "Default.echo", "params": ["hi"]}), "t", &WrongType)
            .await
            .unwrap();
        assert_eq!(resp["error"]["code"], ERR_INVALID_RESP);
    }
}
