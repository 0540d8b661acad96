//! Web server module.

mod handlers;

pub use handlers::*;

use crate::bus::Bus;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::decoder::PayloadDecoderExecutor;
use crate::ingest::IngestService;
use crate::sender::Senders;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub bus: Bus,
    pub ingest: IngestService,
    pub executor: PayloadDecoderExecutor,
    pub senders: Arc<Senders>,
}

/// HTTP surface of the relay.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        store: Arc<Store>,
        bus: Bus,
        executor: PayloadDecoderExecutor,
        senders: Arc<Senders>,
    ) -> Self {
        let ingest = IngestService::new(store.clone(), bus.clone());
        Self {
            state: AppState {
                config,
                store,
                bus,
                ingest,
                executor,
                senders,
            },
        }
    }

    /// Build the router with all routes.
    pub(crate) fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        let mut router = Router::new()
            // Ingestion
            .route("/receive-data", post(handlers::handle_receive_data))
            .route(
                "/sigfox-callback/data/uplink",
                post(handlers::handle_sigfox_uplink),
            )
            // Decoder development
            .route(
                "/test-payload-decoder",
                post(handlers::handle_test_payload_decoder),
            )
            // Data targets
            .route(
                "/data-targets/{id}/test-connection",
                post(handlers::handle_test_connection),
            )
            .route("/data-targets/{id}/log", get(handlers::handle_delivery_log));

        if self.state.config.diagnostic_routes {
            tracing::warn!("Diagnostic bus injection routes are enabled");
            router = router
                .route("/kafka/rawRequest/{id}", post(handlers::handle_inject_raw))
                .route(
                    "/kafka/transformedPayload",
                    post(handlers::handle_inject_transformed),
                );
        }

        router
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
