//! REST API server for NetPulse.
//!
//! Exposes the dispatcher over HTTP: asynchronous device operations, bulk
//! submission, job polling and cancellation, worker inventory, and a
//! synchronous connection test. Every route except `/health` requires the
//! configured API key.
//!
//! # Example
//!
//! ```rust,ignore
//! use netpulse::api::ApiServer;
//!
//! let server = ApiServer::new(config, dispatcher);
//! server.run(shutdown_signal()).await?;
//! ```

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod types;

use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use state::AppState;
pub use types::*;

/// The main API server.
pub struct ApiServer {
    config: Arc<Config>,
    state: Arc<AppState>,
}

impl ApiServer {
    /// Creates the server around a dispatcher.
    pub fn new(config: Arc<Config>, dispatcher: Dispatcher) -> Self {
        let state = Arc::new(AppState::new(dispatcher, config.clone()));
        Self { config, state }
    }

    /// Builds the router with all routes and layers.
    pub fn router(&self) -> Router {
        let mut app = routes::api_routes(self.state.clone());

        if self.config.server.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
            app = app.layer(cors);
        }

        app.layer(TraceLayer::new_for_http())
    }

    /// Runs the server until the shutdown future resolves.
    pub async fn run(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = self.config.server.bind_address();
        let router = self.router();

        info!(addr = %addr, "Starting NetPulse API server");

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind '{}': {}", addr, e)))?;

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(Error::Io)
    }

    /// Shared state, for embedding in tests.
    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }
}
