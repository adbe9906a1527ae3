use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use viaduct::config::{self, Config};
use viaduct::metrics;
use viaduct::pool::ConnectionPool;
use viaduct::router::{PassthroughRouter, Router};
use viaduct::server::ServerRegistry;
use viaduct::session::{Service, Session};
use viaduct::worker::Workers;

/// Global connection counter for generating unique session IDs
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Graceful shutdown timeout (wait for sessions to close)
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between pool sweeps on the main worker.
const POOL_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = load_config()?;

    let workers = Workers::start(config.global.threads);
    let registry = Arc::new(ServerRegistry::from_configs(&config.servers));
    let pool = ConnectionPool::new();
    let service = Service::new(config.service.clone());
    let router: Arc<dyn Router> = Arc::new(PassthroughRouter);

    info!(
        workers = workers.count(),
        servers = registry.len(),
        "Viaduct proxy configured"
    );

    if config.metrics.enabled {
        let metrics_addr = config.metrics.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(&metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    // Periodic pool sweep, posted through the main worker like every other
    // cross-cutting mutation.
    {
        let workers = workers.clone();
        let pool = pool.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(POOL_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let pool = pool.clone();
                workers.post_to_main(move || {
                    pool.sweep();
                });
            }
        });
    }

    let addr = format!(
        "{}:{}",
        config.service.listen_addr, config.service.listen_port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Viaduct proxy listening");

    // Track active sessions for graceful shutdown
    let mut sessions: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }

            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(v) => v,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
                let worker = workers.assign();

                info!(session_id, peer = %peer_addr, worker = %worker, "New connection");
                metrics::metrics().record_connection_accepted();

                let session = Session::new(
                    session_id,
                    worker,
                    Some(peer_addr),
                    service.clone(),
                    router.clone(),
                    registry.clone(),
                    pool.clone(),
                    workers.clone(),
                    &config.global,
                );

                sessions.spawn(Workers::scope(worker, async move {
                    if let Err(e) = session.run(stream).await {
                        warn!(session_id, error = %e, "Session ended with error");
                    }
                    metrics::metrics().record_connection_closed();
                }));
            }
        }
    }

    // Graceful shutdown: wait for active sessions to complete
    let active_count = sessions.len();
    if active_count > 0 {
        info!(
            active_sessions = active_count,
            timeout_secs = GRACEFUL_SHUTDOWN_TIMEOUT.as_secs(),
            "Waiting for active sessions to complete"
        );

        let shutdown_deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;

        loop {
            if sessions.is_empty() {
                info!("All sessions completed gracefully");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep_until(shutdown_deadline) => {
                    warn!(
                        remaining_sessions = sessions.len(),
                        "Graceful shutdown timeout, aborting remaining sessions"
                    );
                    sessions.abort_all();
                    break;
                }

                Some(result) = sessions.join_next() => {
                    if let Err(e) = result {
                        if !e.is_cancelled() {
                            error!(error = %e, "Session task panicked");
                        }
                    }
                }
            }
        }
    }

    info!("Viaduct proxy shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn load_config() -> anyhow::Result<Config> {
    let config_paths = ["config/viaduct.toml", "viaduct.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path, "Loaded configuration");
                return Ok(config);
            }
            Err(e) => {
                warn!(path, error = %e, "Failed to load config");
            }
        }
    }

    anyhow::bail!("no usable configuration found; provide viaduct.toml")
}
