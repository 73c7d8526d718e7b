pub mod auth;
pub mod handlers;
pub mod uploads;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request},
    routing::{delete, get, post, put},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;

pub use auth::PublisherAuth;
pub use handlers::{
    assets, clear_cache, health, list_runtime_versions, list_updates, manifest, AppState,
};
pub use uploads::{
    complete_upload, create_rollback, initiate_upload, request_upload_urls, upload_file,
};

/// Largest accepted upload body (512 MiB)
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

/// Full HTTP surface. Every request runs in a span carrying a fresh
/// `request_id`.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Expo Updates client protocol
        .route("/manifest", get(manifest))
        .route("/assets", get(assets))
        // Publishing
        .route("/uploads/initiate", post(initiate_upload))
        .route("/uploads/urls", post(request_upload_urls))
        .route("/uploads/complete", post(complete_upload))
        .route("/uploads/:branch/:runtime_version/:update_id", put(upload_file))
        .route("/rollbacks", post(create_rollback))
        // Read-only listings
        .route("/api/branches/:branch/runtime-versions", get(list_runtime_versions))
        .route(
            "/api/branches/:branch/runtime-versions/:runtime_version/updates",
            get(list_updates),
        )
        .route("/api/cache", delete(clear_cache))
        .route("/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request| {
            tracing::info_span!(
                "request",
                request_id = %Uuid::new_v4(),
                method = %request.method(),
                uri = %request.uri(),
            )
        }))
}
