//! HTTP server

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{self, AppState};
use crate::Orchestrator;

/// HTTP API Server
pub struct Server {
    router: Router,
    addr: SocketAddr,
}

impl Server {
    pub fn new(orchestrator: Arc<Orchestrator>, addr: SocketAddr) -> Self {
        Self {
            router: router(orchestrator),
            addr,
        }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        tracing::info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.router).await
    }

    /// Run until `shutdown` resolves
    pub async fn run_until(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Result<(), std::io::Error> {
        tracing::info!("Starting API server on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
    }
}

/// Build the API router
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let state: AppState = orchestrator;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/health", get(handlers::health))

        // Service templates
        .route(
            "/api/v1/service_templates",
            get(handlers::list_templates).post(handlers::create_template),
        )
        .route(
            "/api/v1/service_templates/:id",
            get(handlers::get_template).delete(handlers::delete_template),
        )
        .route("/api/v1/service_templates/:id/instantiate", post(handlers::instantiate))

        // Services
        .route("/api/v1/services", get(handlers::list_services))
        .route(
            "/api/v1/services/:id",
            get(handlers::get_service).delete(handlers::delete_service),
        )
        .route("/api/v1/services/:id/recover", post(handlers::recover_service))
        .route("/api/v1/services/:id/shutdown", post(handlers::shutdown_service))
        .route("/api/v1/services/:id/roles/:role/scale", post(handlers::scale_role))

        // Typed operations
        .route("/api/v1/operations", post(handlers::operation))

        // Reconcile
        .route("/api/v1/reconcile", post(handlers::reconcile))

        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
