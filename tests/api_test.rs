use std::sync::Arc;

use udp_spool_proxy::api::{router, ApiState};
use udp_spool_proxy::config::Config;
use udp_spool_proxy::ProxyStats;

const CONFIG_YAML: &str = r#"
udp:
  listeners:
    - port: 2056
      dataset_id: d1
receiver:
  base_url: "http://receiver:8080/ingest/{tenantid}/{datasetid}"
tenant_id: acme-tenant-0001
bearer_token: super-secret-token-value
"#;

async fn serve_api(state: Arc<ApiState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn health_reports_status_and_stats() {
    let config = Arc::new(Config::from_yaml(CONFIG_YAML).unwrap());
    let stats = Arc::new(ProxyStats::new());
    stats.record_message(42);

    let base = serve_api(Arc::new(ApiState {
        config,
        stats,
        spool: None,
    }))
    .await;

    let health: serde_json::Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(health["status"], "ok");
    assert_eq!(health["udp"]["listeners"][0]["port"], 2056);
    assert_eq!(health["stats"]["messages_received"], 1);
    assert_eq!(health["stats"]["bytes_received"], 42);
}

#[tokio::test]
async fn config_echo_masks_sensitive_fields() {
    let config = Arc::new(Config::from_yaml(CONFIG_YAML).unwrap());
    let base = serve_api(Arc::new(ApiState {
        config,
        stats: Arc::new(ProxyStats::new()),
        spool: None,
    }))
    .await;

    let echo: serde_json::Value = reqwest::get(format!("{base}/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(echo["tenant_id"], "acme***0001");
    assert_eq!(echo["bearer_token"], "supe***alue");
    assert_eq!(echo["receiver"]["retry_count"], 3);
    assert_eq!(echo["udp"]["listeners"][0]["dataset_id"], "d1");
}

#[tokio::test]
async fn stats_endpoint_returns_snapshot() {
    let config = Arc::new(Config::from_yaml(CONFIG_YAML).unwrap());
    let stats = Arc::new(ProxyStats::new());
    stats.record_batch_forwarded(100);

    let base = serve_api(Arc::new(ApiState {
        config,
        stats,
        spool: None,
    }))
    .await;

    let snapshot: serde_json::Value = reqwest::get(format!("{base}/stats"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(snapshot["batches_forwarded"], 1);
    assert_eq!(snapshot["bytes_forwarded"], 100);
}
