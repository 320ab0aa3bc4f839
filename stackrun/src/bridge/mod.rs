//! IPC bridge between the invocation and the shim subprocess.
//!
//! - **protocol**: request/response documents exchanged with the shim
//! - **transport**: the FIFO channel pair those documents travel over

pub mod protocol;
pub mod transport;
