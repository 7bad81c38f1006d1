use crate::collectors::cache::CollectorCache;
use crate::exporter::GIT_COMMIT_HASH;
use axum::{Extension, Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use std::sync::Arc;

/// `GET /health`
///
/// Reports build identity and configuration counts. Connections are opened
/// per scrape cycle, so there is no database ping here.
pub async fn health(Extension(cache): Extension<Arc<CollectorCache>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "commit": GIT_COMMIT_HASH,
            "targets": cache.target_count(),
            "cached_instances": cache.len().await,
        })),
    )
}
