//! HTTP server exposing the exec service.
//!
//! The server binds its listener up front so the port is known before any
//! request is served; the port is advertised in terminal listings as the
//! WebSocket port.

pub mod error;
pub mod routes;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::service::ExecService;

pub use error::ApiError;
pub use routes::{create_router, AppState};

/// Errors from starting or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The accept loop failed.
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
}

/// A bound HTTP server, ready to serve.
pub struct ExecServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    service: Arc<ExecService>,
}

impl ExecServer {
    /// Bind the configured address and build the router.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let service = Arc::new(ExecService::new(config.exec.clone()));
        let router = create_router(AppState {
            service: Arc::clone(&service),
            pty: config.pty.clone(),
            port: local_addr.port(),
        });

        tracing::info!(addr = %local_addr, "Exec server bound");

        Ok(Self {
            listener,
            local_addr,
            router,
            service,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The service behind the routes.
    pub fn service(&self) -> Arc<ExecService> {
        Arc::clone(&self.service)
    }

    /// Serve until `shutdown` resolves.
    ///
    /// On shutdown every running stream is cancelled and its process reaped
    /// before in-flight connections are drained.
    pub async fn serve<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let service = self.service;
        let graceful = async move {
            shutdown.await;
            service.shutdown().await;
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(graceful)
            .await
            .map_err(ServerError::Serve)?;

        tracing::info!("Exec server stopped");
        Ok(())
    }
}
