use thiserror::Error;

/// Reserved JSON-RPC 2.0 error codes, plus the contract library's own range.
pub const ERR_INVALID_REQ: i64 = -32600;
pub const ERR_METHOD_NOT_FOUND: i64 = -32601;
pub const ERR_INVALID_PARAMS: i64 = -32602;
/// The implementation returned a value that does not match the declared return type.
pub const ERR_INVALID_RESP: i64 = -32001;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("failed to read contract file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse contract: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate interface '{0}' in contract")]
    DuplicateInterface(String),

    #[error("duplicate function '{function}' on interface '{interface}'")]
    DuplicateFunction { interface: String, function: String },
}

/// A JSON-RPC error object, as embedded in a response.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_REQ, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ERR_METHOD_NOT_FOUND,
            format!("Method or service {method} not found"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ERR_INVALID_PARAMS, message)
    }
}

/// Failure reported by an [`ExternalCaller`](crate::ExternalCaller).
#[derive(Debug, Error)]
pub enum CallError {
    /// Reported back to the client as a JSON-RPC error object for this request only.
    #[error(transparent)]
    Rpc(RpcError),

    /// Aborts the whole dispatch; no response is produced.
    #[error("{0}")]
    Fatal(Box<dyn std::error::Error + Send + Sync + 'static>),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("call to {method} failed: {source}")]
    Caller {
        method: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

pub type Result<T> = std::result::Result<T, ContractError>;
