//! Wire types exchanged with the shim over the channel pair.
//!
//! One request document is written per nested call and one response document
//! is read back. Both are plain JSON with no framing: the writer closes its end
//! to mark the end of the document.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request written to the shim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShimRequest {
    pub method: String,
    pub params: Value,
    #[serde(rename = "taskId")]
    pub task_id: String,
}

/// Response read back from the shim: either `{"result": ...}` or
/// `{"error": <code>, "msg": "..."}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ShimResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<i64>,
    #[serde(default)]
    pub msg: Option<String>,
}

/// What a response means once the exit status has been checked.
#[derive(Debug, Clone, PartialEq)]
pub enum ShimOutcome {
    Result(Value),
    Error { code: i64, message: String },
}

impl ShimResponse {
    pub fn into_outcome(self) -> ShimOutcome {
        match self.error {
            Some(code) => ShimOutcome::Error {
                code,
                message: self.msg.unwrap_or_default(),
            },
            None => ShimOutcome::Result(self.result.unwrap_or(Value::Null)),
        }
    }
}
