pub mod api;
pub mod client;
pub mod config;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::UploadConfig;
use crate::services::upload_service::UploadService;
use axum::{
    Router,
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::health::health_check,
        api::handlers::upload::init_upload_handler,
        api::handlers::upload::list_pending_sessions_handler,
        api::handlers::upload::session_status_handler,
        api::handlers::upload::upload_chunk_handler,
        api::handlers::upload::complete_upload_handler,
        api::handlers::upload::abort_upload_handler,
    ),
    components(
        schemas(
            api::handlers::health::HealthResponse,
            models::Destination,
            models::InitUploadRequest,
            models::InitUploadResponse,
            models::ChunkAck,
            models::CompleteUploadRequest,
            models::CompleteUploadResponse,
            models::SessionStatusResponse,
            models::ApiErrorBody,
            models::ErrorCode,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "uploads", description = "Resumable chunked lecture uploads"),
        (name = "system", description = "Health and diagnostics")
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "jwt",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub uploads: Arc<UploadService>,
    pub config: UploadConfig,
}

impl AppState {
    pub fn new(uploads: Arc<UploadService>) -> Self {
        let config = uploads.config().clone();
        Self { uploads, config }
    }
}

fn cors_layer(config: &UploadConfig) -> CorsLayer {
    let origin = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn create_app(state: AppState) -> Router {
    let auth = || from_fn_with_state(state.clone(), api::middleware::auth::auth_middleware);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/uploads",
            post(api::handlers::upload::init_upload_handler)
                .get(api::handlers::upload::list_pending_sessions_handler)
                .layer(auth()),
        )
        .route(
            "/uploads/:session_id",
            get(api::handlers::upload::session_status_handler)
                .delete(api::handlers::upload::abort_upload_handler)
                .layer(auth()),
        )
        .route(
            "/uploads/:session_id/chunks/:chunk_index",
            put(api::handlers::upload::upload_chunk_handler)
                // Small buffer so oversized chunks reach the service and get a typed 413.
                .layer(axum::extract::DefaultBodyLimit::max(
                    state.config.max_chunk_size + 1024 * 1024,
                ))
                .layer(auth()),
        )
        .route(
            "/uploads/:session_id/complete",
            post(api::handlers::upload::complete_upload_handler).layer(auth()),
        )
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors_layer(&state.config))
        .with_state(state)
}
