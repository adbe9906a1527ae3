//! Prometheus metrics.
//!
//! Exposed over a small HTTP endpoint for scraping.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    pub registry: Registry,

    // Client side
    /// Total client connections accepted
    pub connections_total: IntCounter,
    /// Current active client connections
    pub connections_active: IntGauge,
    /// Sessions that passed authentication
    pub sessions_total: IntCounter,

    // Backend side
    /// Backend connections opened
    pub backend_connects_total: IntCounter,
    /// Backend failures funnelled to the error handler, by kind
    pub backend_errors_total: IntCounterVec,
    /// COM_CHANGE_USER exchanges (client-initiated and pool adoption)
    pub change_user_total: IntCounter,
    /// Servers put into maintenance by the core
    pub server_maintenance_total: IntCounter,

    // Connection pool
    pub pool_hits_total: IntCounter,
    pub pool_misses_total: IntCounter,
    pub pool_returns_total: IntCounter,
    pub pool_evictions_total: IntCounter,
    pub pool_idle: IntGauge,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "viaduct_connections_total",
            "Client connections accepted",
        ))
        .unwrap();
        let connections_active = IntGauge::with_opts(Opts::new(
            "viaduct_connections_active",
            "Active client connections",
        ))
        .unwrap();
        let sessions_total = IntCounter::with_opts(Opts::new(
            "viaduct_sessions_total",
            "Sessions that passed authentication",
        ))
        .unwrap();
        let backend_connects_total = IntCounter::with_opts(Opts::new(
            "viaduct_backend_connects_total",
            "Backend connections opened",
        ))
        .unwrap();
        let backend_errors_total = IntCounterVec::new(
            Opts::new(
                "viaduct_backend_errors_total",
                "Backend failures funnelled to the error handler",
            ),
            &["kind"],
        )
        .unwrap();
        let change_user_total = IntCounter::with_opts(Opts::new(
            "viaduct_change_user_total",
            "COM_CHANGE_USER exchanges",
        ))
        .unwrap();
        let server_maintenance_total = IntCounter::with_opts(Opts::new(
            "viaduct_server_maintenance_total",
            "Servers put into maintenance by the core",
        ))
        .unwrap();
        let pool_hits_total = IntCounter::with_opts(Opts::new(
            "viaduct_pool_hits_total",
            "Backend connections adopted from the pool",
        ))
        .unwrap();
        let pool_misses_total = IntCounter::with_opts(Opts::new(
            "viaduct_pool_misses_total",
            "Backend acquisitions that had to open a fresh connection",
        ))
        .unwrap();
        let pool_returns_total = IntCounter::with_opts(Opts::new(
            "viaduct_pool_returns_total",
            "Backend connections returned to the pool",
        ))
        .unwrap();
        let pool_evictions_total = IntCounter::with_opts(Opts::new(
            "viaduct_pool_evictions_total",
            "Pooled connections discarded",
        ))
        .unwrap();
        let pool_idle = IntGauge::with_opts(Opts::new(
            "viaduct_pool_idle",
            "Idle connections currently pooled",
        ))
        .unwrap();

        registry.register(Box::new(connections_total.clone())).unwrap();
        registry.register(Box::new(connections_active.clone())).unwrap();
        registry.register(Box::new(sessions_total.clone())).unwrap();
        registry
            .register(Box::new(backend_connects_total.clone()))
            .unwrap();
        registry
            .register(Box::new(backend_errors_total.clone()))
            .unwrap();
        registry.register(Box::new(change_user_total.clone())).unwrap();
        registry
            .register(Box::new(server_maintenance_total.clone()))
            .unwrap();
        registry.register(Box::new(pool_hits_total.clone())).unwrap();
        registry.register(Box::new(pool_misses_total.clone())).unwrap();
        registry.register(Box::new(pool_returns_total.clone())).unwrap();
        registry
            .register(Box::new(pool_evictions_total.clone()))
            .unwrap();
        registry.register(Box::new(pool_idle.clone())).unwrap();

        Self {
            registry,
            connections_total,
            connections_active,
            sessions_total,
            backend_connects_total,
            backend_errors_total,
            change_user_total,
            server_maintenance_total,
            pool_hits_total,
            pool_misses_total,
            pool_returns_total,
            pool_evictions_total,
            pool_idle,
        }
    }

    pub fn record_connection_accepted(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn record_session_started(&self) {
        self.sessions_total.inc();
    }

    pub fn record_backend_connect(&self) {
        self.backend_connects_total.inc();
    }

    pub fn record_backend_error(&self, kind: &str) {
        self.backend_errors_total.with_label_values(&[kind]).inc();
    }

    pub fn record_change_user(&self) {
        self.change_user_total.inc();
    }

    pub fn record_server_maintenance(&self) {
        self.server_maintenance_total.inc();
    }

    pub fn record_pool_hit(&self) {
        self.pool_hits_total.inc();
        self.pool_idle.dec();
    }

    pub fn record_pool_miss(&self) {
        self.pool_misses_total.inc();
    }

    pub fn record_pool_return(&self) {
        self.pool_returns_total.inc();
        self.pool_idle.inc();
    }

    pub fn record_pool_eviction(&self) {
        self.pool_evictions_total.inc();
        self.pool_idle.dec();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(addr: &str) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tracing::{error, info};

    async fn handle_request(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        match req.uri().path() {
            "/metrics" => {
                let body = metrics().gather();
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                    .body(Full::new(Bytes::from(body)))
                    .unwrap())
            }
            "/health" => Ok(Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("OK")))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("Not Found")))
                .unwrap()),
        }
    }

    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(handle_request))
                .await
            {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
