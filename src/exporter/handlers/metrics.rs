use crate::collectors::cache::CollectorCache;
use crate::collectors::instance::ScrapeFlags;
use axum::{
    Extension,
    extract::{Query, RawQuery},
    http::{StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

/// Query parameters recognized on `/metrics`. Every other parameter is
/// ignored for parsing but still part of the instance cache key.
#[derive(Debug, Default, Deserialize)]
pub struct ScrapeParams {
    pub target: Option<String>,
    #[serde(default, deserialize_with = "truthy")]
    pub tablerows: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub tablebytes: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub indexbytes: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub lobbytes: bool,
    #[serde(default, deserialize_with = "truthy")]
    pub recovery: bool,
}

/// A toggle is on only for the literal value `true`; anything else reads as
/// off rather than failing the request.
fn truthy<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(String::deserialize(deserializer)? == "true")
}

impl ScrapeParams {
    #[must_use]
    pub const fn flags(&self) -> ScrapeFlags {
        ScrapeFlags {
            tablerows: self.tablerows,
            tablebytes: self.tablebytes,
            indexbytes: self.indexbytes,
            lobbytes: self.lobbytes,
            recovery: self.recovery,
        }
    }
}

/// `GET /metrics`
///
/// The raw query string is the cache key, so each distinct request shape
/// keeps its own registry and metric families across scrapes.
pub async fn metrics(
    RawQuery(raw): RawQuery,
    Query(params): Query<ScrapeParams>,
    Extension(cache): Extension<Arc<CollectorCache>>,
) -> impl IntoResponse {
    let key = raw.unwrap_or_default();

    let instance = match cache
        .resolve(&key, params.target.as_deref(), params.flags())
        .await
    {
        Ok(instance) => instance,
        Err(e) => {
            error!(error = %e, key, "failed to build collector instance");
            return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
        }
    };

    match instance.scrape().await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, key, "scrape failed");
            (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response()
        }
    }
}
