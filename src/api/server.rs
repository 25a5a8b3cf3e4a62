//! RPC Server
//!
//! Binds the RPC router to a TCP listener and serves it until the shutdown
//! token fires. In-flight requests see the same token through their
//! [`RequestContext`](crate::retry::RequestContext).

use super::rpc::{router, RpcState};
use crate::error::{Error, Result};
use std::net::SocketAddr;
use tracing::info;

pub struct RpcServer {
    addr: SocketAddr,
    state: RpcState,
}

impl RpcServer {
    pub fn new(addr: SocketAddr, state: RpcState) -> Self {
        Self { addr, state }
    }

    /// Serve until the state's shutdown token is cancelled
    pub async fn run(self) -> Result<()> {
        let shutdown = self.state.shutdown.clone();
        let app = router(self.state);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind RPC server on {}: {}", self.addr, e)))?;
        info!("RPC server listening on {}", self.addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("RPC server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("RPC server error: {}", e)))?;

        Ok(())
    }
}
