//! Agent HTTP server

use std::future::Future;
use std::net::SocketAddr;

use anyhow::Result;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use ota_core::OtaManager;

use crate::api::{create_router, ApiState};

/// Serves the command API for one [`OtaManager`].
pub struct AgentServer {
    manager: OtaManager,
    listen_addr: SocketAddr,
}

impl AgentServer {
    pub fn new(manager: OtaManager, listen_addr: SocketAddr) -> Self {
        Self {
            manager,
            listen_addr,
        }
    }

    /// Serve until `shutdown` resolves, then wait for the running operation
    /// to reach a safe point.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = create_router(ApiState {
            manager: self.manager.clone(),
        })
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        info!("HTTP server listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        self.manager.shutdown().await;
        info!("Agent stopped");
        Ok(())
    }
}
