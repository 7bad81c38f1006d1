use anyhow::Result;
use serde_json::Value;

mod common;

#[tokio::test]
async fn test_health_endpoint_returns_ok() -> Result<()> {
    let port = common::get_available_port();
    let cache = common::test_cache(vec![
        common::unreachable_target("orders"),
        common::unreachable_target("billing"),
    ]);

    let handle = tokio::spawn(async move { pgtargets_exporter::exporter::new(port, None, cache).await });

    assert!(
        common::wait_for_server(port, 50).await,
        "Server failed to start"
    );

    let client = reqwest::Client::new();
    let response = client
        .get(format!("{}/health", common::get_test_url(port)))
        .send()
        .await?;

    assert_eq!(response.status(), 200);

    let body: Value = response.json().await?;
    assert_eq!(body["name"], env!("CARGO_PKG_NAME"));
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(body["targets"], 2);
    assert_eq!(body["cached_instances"], 0);
    assert!(body["commit"].is_string());

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_health_counts_cached_instances() -> Result<()> {
    let port = common::get_available_port();
    let cache = common::test_cache(vec![common::unreachable_target("orders")]);

    let handle = tokio::spawn(async move { pgtargets_exporter::exporter::new(port, None, cache).await });

    assert!(common::wait_for_server(port, 50).await);

    let client = reqwest::Client::new();
    let base = common::get_test_url(port);

    client.get(format!("{base}/metrics")).send().await?;
    client
        .get(format!("{base}/metrics?tablerows=true"))
        .send()
        .await?;

    let body: Value = client
        .get(format!("{base}/health"))
        .send()
        .await?
        .json()
        .await?;

    assert_eq!(body["cached_instances"], 2);

    handle.abort();

    Ok(())
}

#[tokio::test]
async fn test_health_endpoint_options_request() -> Result<()> {
    let port = common::get_available_port();
    let cache = common::test_cache(vec![common::unreachable_target("orders")]);

    let handle = tokio::spawn(async move { pgtargets_exporter::exporter::new(port, None, cache).await });

    assert!(common::wait_for_server(port, 50).await);

    let client = reqwest::Client::new();
    let response = client
        .request(
            reqwest::Method::OPTIONS,
            format!("{}/health", common::get_test_url(port)),
        )
        .send()
        .await?;

    assert_eq!(response.status(), 200);

    handle.abort();

    Ok(())
}
