//! API Module
//!
//! JSON-over-HTTP transport of the plugin services.

pub mod rpc;
pub mod server;

pub use rpc::{router, RpcError, RpcState, TIMEOUT_HEADER};
pub use server::RpcServer;
