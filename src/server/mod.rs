//! HTTP/WebSocket server
//!
//! Accepts client WebSocket connections on `/` and `/ws` and hands each one
//! to the [`TransportBridge`]. `/health` reports liveness; an optional
//! static directory is served for everything else.

pub mod handlers;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::relay::TransportBridge;
use crate::session::SessionConnector;

/// Shared by every handler
pub struct AppState<C> {
    pub bridge: TransportBridge<C>,
    pub config: Arc<AppConfig>,
}

/// Relay server for one remote-session connector
pub struct RelayServer<C> {
    state: Arc<AppState<C>>,
}

impl<C: SessionConnector> RelayServer<C> {
    pub fn new(connector: C, config: AppConfig) -> Self {
        let config = Arc::new(config);
        let bridge = TransportBridge::new(Arc::new(connector), Arc::clone(&config));
        Self {
            state: Arc::new(AppState { bridge, config }),
        }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let router = Router::new()
            .route("/", get(handlers::root::<C>))
            .route("/ws", get(handlers::websocket::<C>))
            .route("/health", get(handlers::health));

        let router = match &self.state.config.server.static_dir {
            Some(dir) => router.fallback_service(ServeDir::new(dir)),
            None => router,
        };

        router
            .with_state(Arc::clone(&self.state))
            .layer(CorsLayer::permissive())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let server = &self.state.config.server;
        format!("{}:{}", server.bind_address, server.http_port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid bind address: {}", e)))
    }

    /// Serve until the listener fails
    pub async fn serve(self) -> Result<()> {
        let addr = self.bind_addr()?;
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Relay listening on {}", addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}
