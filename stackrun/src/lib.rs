//! stackrun: serve one JSON-RPC request through a language shim subprocess.

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod forwarder;
pub mod invocation;
pub mod stack;
pub mod store;
mod task;

pub use config::BridgeConfig;
pub use envelope::{DEFAULT_SERVICE, NormalizedRequest, ensure_id, normalize};
pub use forwarder::{ForwardError, ShimForwarder};
pub use invocation::{BridgeError, BridgeState, EXIT_FAILURE, EXIT_OK, InvocationBridge};
pub use stack::{ShimStack, Stack, StackError};
pub use store::{LocalStore, Store, StoreError};
pub use task::TaskContext;

/// stackrun version from Cargo.toml
pub const STACKRUN_VERSION: &str = env!("CARGO_PKG_VERSION");
