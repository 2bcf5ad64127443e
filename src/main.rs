#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::signal;
use tokio::sync::Notify;
use tracing::{error, info, warn, Level};

use udp_spool_proxy::alerts::{AlertSink, LogAlertSink, SocAlertClient, SocAlertConfig};
use udp_spool_proxy::api::{self, ApiState};
use udp_spool_proxy::bufpool::BufferPool;
use udp_spool_proxy::config::Config;
use udp_spool_proxy::listener::{ListenerBinding, ListenerPool};
use udp_spool_proxy::pipeline::{
    Batcher, BatcherConfig, EncoderConfig, ForwardWorker, ForwarderConfig, HttpForwarder,
};
use udp_spool_proxy::spool::{Spool, SpoolConfig};
use udp_spool_proxy::stats::ProxyStats;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(version, about = "UDP ingestion proxy: batches datagrams into NDJSON and forwards them over HTTP")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.validate_config {
        println!("configuration OK: {}", cli.config.display());
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_max_level(log_level(&config.logging.level))
        .with_target(false)
        .init();

    info!("starting {} {}", config.app.name, config.app.version);
    config.print_config();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("startup failed: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let stats = Arc::new(ProxyStats::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_notify = Arc::new(Notify::new());

    let alerts: Arc<dyn AlertSink> = if config.soc.enabled {
        Arc::new(SocAlertClient::new(SocAlertConfig {
            endpoint: config.soc.endpoint.clone(),
            timeout: config.soc_timeout(),
            service: config.app.name.clone(),
            version: config.app.version.clone(),
        })?)
    } else {
        Arc::new(LogAlertSink)
    };

    let spool = if config.spooling.enabled {
        Some(Spool::open(
            SpoolConfig {
                directory: PathBuf::from(&config.spooling.directory),
                max_size_bytes: config.spooling.max_size_bytes,
                retry_attempts: config.spooling.retry_attempts,
                retry_interval: config.spool_retry_interval(),
                cleanup_interval: config.spool_cleanup_interval(),
                cleanup_failed_records: config.spooling.cleanup_failed_records,
            },
            Arc::clone(&alerts),
        )?)
    } else {
        info!("spooling is disabled");
        None
    };

    let mut handles = Vec::new();
    let mut ingress = None;

    if config.udp.enabled {
        let forwarder = Arc::new(HttpForwarder::new(ForwarderConfig {
            base_url: config.receiver.base_url.clone(),
            timeout: config.receiver_timeout(),
            retry_count: config.receiver.retry_count,
            retry_delay: config.retry_delay(),
            bearer_token: config.bearer_token.clone(),
            user_agent: format!("{}/{}", config.app.name, config.app.version),
        })?);

        if let Some(spool) = &spool {
            handles.extend(spool.spawn_workers(
                Arc::clone(&forwarder),
                config.udp.enable_compression,
                Arc::clone(&stats),
                Arc::clone(&shutdown),
                Arc::clone(&shutdown_notify),
            ));
        }

        let (batch_tx, batch_rx) = async_channel::bounded(64);
        let (batcher, handle) = Batcher::new(
            BatcherConfig {
                max_batch_lines: config.udp.max_batch_lines,
                max_batch_bytes: config.udp.max_batch_bytes,
                batch_timeout: config.batch_timeout(),
            },
            batch_tx,
            Arc::clone(&stats),
        );
        handles.push(tokio::spawn(batcher.run()));

        let worker = ForwardWorker::new(
            batch_rx,
            forwarder,
            EncoderConfig {
                enable_compression: config.udp.enable_compression,
                compression_level: config.udp.compression_level,
            },
            spool.clone(),
            Arc::clone(&stats),
            Arc::clone(&alerts),
        );
        handles.push(tokio::spawn(worker.run()));

        let buffers = Arc::new(BufferPool::new(config.udp.read_buffer_size_bytes));
        let bindings: Vec<ListenerBinding> = config
            .udp
            .listeners
            .iter()
            .map(|entry| ListenerBinding {
                port: entry.port,
                dataset_id: entry.dataset_id.clone(),
                tenant_id: entry
                    .tenant_id
                    .clone()
                    .unwrap_or_else(|| config.tenant_id.clone()),
            })
            .collect();

        let pool = ListenerPool::new(
            config.udp.host.clone(),
            config.udp.read_buffer_size_bytes,
            bindings,
            buffers,
            handle.clone(),
            Arc::clone(&stats),
            Arc::clone(&alerts),
            Arc::clone(&shutdown),
        );
        handles.extend(pool.start()?);
        ingress = Some(handle);
    } else {
        info!("UDP ingest is disabled");
    }

    let api_state = Arc::new(ApiState {
        config: Arc::clone(&config),
        stats: Arc::clone(&stats),
        spool: spool.clone(),
    });
    let api_addr = format!("0.0.0.0:{}", config.server.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr).await?;
    info!("management API listening on {api_addr}");

    axum::serve(api_listener, api::router(api_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Reverse order: stop accepting datagrams, drain the batcher, let the
    // forwarder finish, stop the spool workers.
    info!("stopping services");
    shutdown.store(true, Ordering::SeqCst);
    shutdown_notify.notify_waiters();
    if let Some(ingress) = &ingress {
        ingress.close();
    }

    let drain_start = Instant::now();
    for handle in handles {
        let remaining = SHUTDOWN_DEADLINE.saturating_sub(drain_start.elapsed());
        if remaining.is_zero() {
            warn!("shutdown deadline reached, aborting remaining tasks");
            handle.abort();
        } else {
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("task panicked during shutdown: {e}"),
                Err(_) => warn!("task did not stop within the deadline"),
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}

fn log_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
