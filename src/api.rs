use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::config::{mask_secret, Config};
use crate::spool::{Spool, SpoolTotals};
use crate::stats::{ProxyStats, StatsSnapshot};

/// Read-only management surface: health, stats, and a masked config echo.
pub struct ApiState {
    pub config: Arc<Config>,
    pub stats: Arc<ProxyStats>,
    pub spool: Option<Arc<Spool>>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/config", get(config_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service_name: String,
    version: String,
    timestamp: String,
    udp: UdpHealth,
    receiver: ReceiverHealth,
    spool: Option<SpoolTotals>,
    stats: StatsSnapshot,
}

#[derive(Serialize)]
struct UdpHealth {
    enabled: bool,
    host: String,
    listeners: Vec<ListenerEcho>,
}

#[derive(Serialize)]
struct ListenerEcho {
    port: u16,
    dataset_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<String>,
}

#[derive(Serialize)]
struct ReceiverHealth {
    base_url: String,
    timeout_seconds: u64,
    retry_count: u32,
}

async fn health_handler(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let config = &state.config;
    Json(HealthResponse {
        status: "ok",
        service_name: config.app.name.clone(),
        version: config.app.version.clone(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        udp: UdpHealth {
            enabled: config.udp.enabled,
            host: config.udp.host.clone(),
            listeners: config
                .udp
                .listeners
                .iter()
                .map(|l| ListenerEcho {
                    port: l.port,
                    dataset_id: l.dataset_id.clone(),
                    tenant_id: l.tenant_id.as_deref().map(mask_secret),
                })
                .collect(),
        },
        receiver: ReceiverHealth {
            base_url: config.receiver.base_url.clone(),
            timeout_seconds: config.receiver.timeout_seconds,
            retry_count: config.receiver.retry_count,
        },
        spool: state.spool.as_ref().map(|s| s.totals()),
        stats: state.stats.snapshot(),
    })
}

async fn stats_handler(State(state): State<Arc<ApiState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

#[derive(Serialize)]
struct ConfigResponse {
    app: AppEcho,
    server: ServerEcho,
    udp: UdpEcho,
    receiver: ReceiverEcho,
    tenant_id: String,
    bearer_token: Option<String>,
    spooling: SpoolingEcho,
    soc: SocEcho,
}

#[derive(Serialize)]
struct AppEcho {
    name: String,
    version: String,
}

#[derive(Serialize)]
struct ServerEcho {
    api_port: u16,
}

#[derive(Serialize)]
struct UdpEcho {
    enabled: bool,
    host: String,
    listeners: Vec<ListenerEcho>,
    read_buffer_size_bytes: usize,
    max_batch_lines: u64,
    max_batch_bytes: u64,
    batch_timeout_seconds: u64,
    enable_compression: bool,
    compression_level: u32,
}

#[derive(Serialize)]
struct ReceiverEcho {
    base_url: String,
    timeout_seconds: u64,
    retry_count: u32,
    retry_delay_seconds: u64,
}

#[derive(Serialize)]
struct SpoolingEcho {
    enabled: bool,
    directory: String,
    max_size_bytes: u64,
    retry_attempts: u32,
    retry_interval_seconds: u64,
    cleanup_interval_seconds: u64,
    cleanup_failed_records: bool,
}

#[derive(Serialize)]
struct SocEcho {
    enabled: bool,
    endpoint: String,
    timeout: u64,
}

async fn config_handler(State(state): State<Arc<ApiState>>) -> Json<ConfigResponse> {
    let config = &state.config;
    Json(ConfigResponse {
        app: AppEcho {
            name: config.app.name.clone(),
            version: config.app.version.clone(),
        },
        server: ServerEcho {
            api_port: config.server.api_port,
        },
        udp: UdpEcho {
            enabled: config.udp.enabled,
            host: config.udp.host.clone(),
            listeners: config
                .udp
                .listeners
                .iter()
                .map(|l| ListenerEcho {
                    port: l.port,
                    dataset_id: l.dataset_id.clone(),
                    tenant_id: l.tenant_id.as_deref().map(mask_secret),
                })
                .collect(),
            read_buffer_size_bytes: config.udp.read_buffer_size_bytes,
            max_batch_lines: config.udp.max_batch_lines,
            max_batch_bytes: config.udp.max_batch_bytes,
            batch_timeout_seconds: config.udp.batch_timeout_seconds,
            enable_compression: config.udp.enable_compression,
            compression_level: config.udp.compression_level,
        },
        receiver: ReceiverEcho {
            base_url: config.receiver.base_url.clone(),
            timeout_seconds: config.receiver.timeout_seconds,
            retry_count: config.receiver.retry_count,
            retry_delay_seconds: config.receiver.retry_delay_seconds,
        },
        tenant_id: mask_secret(&config.tenant_id),
        bearer_token: config.bearer_token.as_deref().map(mask_secret),
        spooling: SpoolingEcho {
            enabled: config.spooling.enabled,
            directory: config.spooling.directory.clone(),
            max_size_bytes: config.spooling.max_size_bytes,
            retry_attempts: config.spooling.retry_attempts,
            retry_interval_seconds: config.spooling.retry_interval_seconds,
            cleanup_interval_seconds: config.spooling.cleanup_interval_seconds,
            cleanup_failed_records: config.spooling.cleanup_failed_records,
        },
        soc: SocEcho {
            enabled: config.soc.enabled,
            endpoint: config.soc.endpoint.clone(),
            timeout: config.soc.timeout,
        },
    })
}
