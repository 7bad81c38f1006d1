use crate::collectors::cache::CollectorCache;
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    response::Html,
    routing::get,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{Span, error, info, info_span};
use ulid::Ulid;

mod handlers;
mod shutdown;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = if let Some(hash) = built_info::GIT_COMMIT_HASH {
    hash
} else {
    ":-("
};

const LANDING_PAGE: &str = r#"<html>
<head><title>Prometheus multi-target PostgreSQL exporter</title></head>
<body>
<h1>Prometheus multi-target PostgreSQL exporter</h1>
<p><a href='/metrics'>Metrics</a></p>
<p><a href='/metrics?target=database name'>Metrics for one database only</a></p>
<p><a href='/metrics?tablerows=true'>Metrics with tablerows</a></p>
<p><a href='/metrics?tablebytes=true'>Metrics with tablebytes</a></p>
<p><a href='/metrics?indexbytes=true'>Metrics with indexbytes</a></p>
<p><a href='/metrics?lobbytes=true'>Metrics with lobbytes</a></p>
<p><a href='/metrics?recovery=true'>Metrics with recovery</a></p>
</body>
</html>"#;

/// Start the exporter HTTP server and block until shutdown.
///
/// # Errors
///
/// Returns an error if the listen address is invalid or binding fails.
pub async fn new(port: u16, listen: Option<String>, cache: CollectorCache) -> Result<()> {
    let cache = Arc::new(cache);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(make_span)
        .on_response(on_response);

    let app = Router::new()
        .route("/metrics", get(handlers::metrics))
        .route("/health", get(handlers::health).options(handlers::health))
        .route("/", get(landing))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(trace_layer)
                .layer(Extension(Arc::clone(&cache))),
        );

    let (listener, bind_addr) = match listen {
        Some(addr) => {
            // Try to parse as IpAddr to validate and determine type
            match addr.parse::<std::net::IpAddr>() {
                Ok(ip) => {
                    let bind_addr = format!("{ip}:{port}");
                    (
                        TcpListener::bind(&bind_addr)
                            .await
                            .with_context(|| format!("Failed to bind to {bind_addr}"))?,
                        if ip.is_ipv6() {
                            format!("[{ip}]:{port}")
                        } else {
                            bind_addr.clone()
                        },
                    )
                }
                Err(_) => {
                    return Err(anyhow!(
                        "Invalid IP address: '{}'. Expected IPv4 (e.g., 0.0.0.0, 127.0.0.1) or IPv6 (e.g., ::, ::1)",
                        addr
                    ));
                }
            }
        }
        None => {
            // Auto: try IPv6 first, fallback to IPv4
            match TcpListener::bind(format!("::0:{port}")).await {
                Ok(l) => (l, format!("[::]:{port}")),
                Err(_) => (
                    TcpListener::bind(format!("0.0.0.0:{port}")).await?,
                    format!("0.0.0.0:{port}"),
                ),
            }
        }
    };

    println!(
        "{} {} - Listening on {bind_addr}\n\nConfigured targets:\n{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        format_list(
            &cache
                .targets()
                .iter()
                .map(|t| format!("{}/{}", t.name, t.instance))
                .collect::<Vec<_>>()
        ),
    );

    if let Err(e) = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await
    {
        error!(error=%e, "server error");
    }

    info!("shutting down");

    Ok(())
}

async fn landing() -> Html<&'static str> {
    Html(LANDING_PAGE)
}

// Helper to format a list of items with a leading dash and indentation for the
// start up message
fn format_list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn make_span(request: &Request<Body>) -> Span {
    let method = request.method().as_str();

    let path = request.uri().path();

    let target = request.uri().to_string();

    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none");

    let user_agent = request
        .headers()
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    info_span!(
        "http.server.request",
        http.method = method,
        http.route = path,
        http.target = target,
        http.user_agent = user_agent,
        request_id = request_id,
    )
}

fn on_response<B>(response: &axum::http::Response<B>, latency: Duration, span: &Span) {
    #[allow(clippy::cast_possible_truncation)]
    let elapsed_ms = latency.as_millis() as u64;

    info!(
        parent: span,
        status = response.status().as_u16(),
        elapsed_ms,
        "request completed"
    );
}
