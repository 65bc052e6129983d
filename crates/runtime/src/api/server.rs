//! HTTP server assembly: router, layers, OpenAPI documentation.

use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::routes;
use super::sse;
use super::types::AppState;
use crate::config::RuntimeConfig;
use crate::llm::boundary::{LlmBoundary, ModelBoundary};
use crate::pipeline::StepPipeline;
use crate::store::{RuntimeStore, SqliteStore};
use crate::story::catalog::StoryCatalog;
use crate::telemetry::TelemetryStore;
use crate::types::EngineError;

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    paths(
        routes::create_session,
        routes::get_session,
        routes::step,
        routes::health,
        routes::debug_telemetry,
    ),
    components(schemas(
        crate::pipeline::SessionCreateRequest,
        crate::pipeline::SessionCreateResponse,
        crate::pipeline::SessionStateResponse,
        crate::pipeline::StepRequest,
        crate::pipeline::StepResponse,
        crate::pipeline::ChoiceOut,
        crate::pipeline::ChoiceLockReasonOut,
        crate::pipeline::CurrentNodeOut,
        super::types::ErrorBody,
        super::types::ErrorDetail,
        super::types::HealthResponse,
        crate::telemetry::TelemetrySnapshot,
    )),
    tags(
        (name = "sessions", description = "Session lifecycle endpoints"),
        (name = "steps", description = "Step execution endpoints"),
        (name = "system", description = "Health and debug endpoints")
    ),
    info(
        title = "Fabula Runtime API",
        description = "HTTP API for the Fabula interactive-fiction runtime",
        version = "1.0.0"
    )
)]
pub struct ApiDoc;

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpApiConfig {
    pub bind_address: String,
    pub port: u16,
    pub enable_cors: bool,
    pub enable_tracing: bool,
}

impl Default for HttpApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8000,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

impl HttpApiConfig {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
            ..Self::default()
        }
    }
}

/// The HTTP API server.
pub struct HttpApiServer {
    http_config: HttpApiConfig,
    state: AppState,
}

impl HttpApiServer {
    /// Wire the full engine from configuration: SQLite store, built-in story
    /// catalog, and the real-or-fake model boundary.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, EngineError> {
        let config = Arc::new(config);
        let store: Arc<dyn RuntimeStore> = Arc::new(
            SqliteStore::open(&config.database_url)
                .map_err(|err| EngineError::Internal(err.to_string()))?,
        );
        let catalog = Arc::new(StoryCatalog::with_builtin());
        let boundary: Arc<dyn ModelBoundary> = Arc::new(LlmBoundary::from_config(&config));
        let pipeline = Arc::new(StepPipeline::new(
            store,
            catalog,
            boundary,
            Arc::clone(&config),
        ));

        Ok(Self {
            http_config: HttpApiConfig::from_runtime(&config),
            state: AppState {
                pipeline,
                telemetry: Arc::new(TelemetryStore::new()),
                config,
                start_time: Instant::now(),
            },
        })
    }

    pub fn with_state(http_config: HttpApiConfig, state: AppState) -> Self {
        Self { http_config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/api/v1/sessions", post(routes::create_session))
            .route("/api/v1/sessions/:session_id", get(routes::get_session))
            .route("/api/v1/sessions/:session_id/step", post(routes::step))
            .route(
                "/api/v1/sessions/:session_id/step/stream",
                post(sse::step_stream),
            )
            .route("/api/v1/health", get(routes::health))
            .route("/api/v1/debug/telemetry", get(routes::debug_telemetry))
            .with_state(self.state.clone());

        router = router
            .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

        if self.http_config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        if self.http_config.enable_cors {
            let allowed_origins: Vec<HeaderValue> = self
                .state
                .config
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            let cors = CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
                .allow_credentials(false);
            router = router.layer(cors);
        }

        router.layer(axum::middleware::from_fn(
            super::middleware::security_headers_middleware,
        ))
    }

    /// Bind and serve until the process exits.
    pub async fn start(&self) -> Result<(), EngineError> {
        let addr = format!("{}:{}", self.http_config.bind_address, self.http_config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| EngineError::Internal(format!("failed to bind to {addr}: {err}")))?;
        tracing::info!("runtime API server listening on {addr}");

        axum::serve(listener, self.router())
            .await
            .map_err(|err| EngineError::Internal(format!("server error: {err}")))?;
        Ok(())
    }
}
