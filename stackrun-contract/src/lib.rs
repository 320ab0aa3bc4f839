//! stackrun-contract: service contracts and JSON-RPC 2.0 dispatch.

pub mod contract;
pub mod error;
pub mod server;
pub mod types;

pub use contract::Contract;
pub use error::{CallError, ContractError, DispatchError, ERR_METHOD_NOT_FOUND, RpcError};
pub use server::{ExternalCaller, JSONRPC_VERSION, Server};
