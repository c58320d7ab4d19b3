use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "asflow";

/// Prometheus metrics for importer health.
///
/// All metrics use the "asflow" namespace and are grouped by the pipeline
/// stage that updates them.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Flow source ===
    /// Total flow records decoded from datagrams.
    pub flows_received: Counter,
    /// Total datagrams (or datagram tails) that failed to decode.
    pub flow_decode_errors: Counter,
    /// Records waiting in the source channel.
    pub flow_channel_length: Gauge,

    // === Aggregation ===
    /// Records that matched no catalog interface.
    pub flows_unmatched: Counter,
    /// Bucket updates applied to the open window.
    pub bucket_updates: Counter,
    /// Windows closed by the scheduler.
    pub windows_closed: Counter,
    /// Buckets per closed window.
    pub window_buckets: Histogram,

    // === Queue ===
    /// Closed windows waiting for the writer.
    pub window_queue_depth: Gauge,

    // === Writer ===
    /// Store connection state (1=connected, 0=disconnected).
    pub store_connected: Gauge,
    /// Failed connection attempts.
    pub store_connect_failures: Counter,
    /// Failed window transactions.
    pub window_write_failures: Counter,
    /// Committed window transactions.
    pub windows_written: Counter,
    /// Rows committed to the store.
    pub rows_written: Counter,
    /// Duration of committed window transactions.
    pub window_write_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let flows_received = Counter::with_opts(
            Opts::new("flows_received_total", "Total flow records decoded.").namespace(NAMESPACE),
        )?;
        let flow_decode_errors = Counter::with_opts(
            Opts::new(
                "flow_decode_errors_total",
                "Total flow datagrams that failed to decode.",
            )
            .namespace(NAMESPACE),
        )?;
        let flow_channel_length = Gauge::with_opts(
            Opts::new(
                "flow_channel_length",
                "Flow records waiting for the aggregator.",
            )
            .namespace(NAMESPACE),
        )?;
        let flows_unmatched = Counter::with_opts(
            Opts::new(
                "flows_unmatched_total",
                "Flow records matching no catalog interface.",
            )
            .namespace(NAMESPACE),
        )?;
        let bucket_updates = Counter::with_opts(
            Opts::new(
                "bucket_updates_total",
                "Bucket updates applied to the open window.",
            )
            .namespace(NAMESPACE),
        )?;
        let windows_closed = Counter::with_opts(
            Opts::new("windows_closed_total", "Aggregation windows closed.").namespace(NAMESPACE),
        )?;
        let window_buckets = Histogram::with_opts(
            HistogramOpts::new("window_buckets", "Buckets per closed window.")
                .namespace(NAMESPACE)
                .buckets(vec![
                    1.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0,
                ]),
        )?;
        let window_queue_depth = Gauge::with_opts(
            Opts::new(
                "window_queue_depth",
                "Closed windows waiting for the writer.",
            )
            .namespace(NAMESPACE),
        )?;
        let store_connected = Gauge::with_opts(
            Opts::new(
                "store_connected",
                "Whether the writer holds a live store connection (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let store_connect_failures = Counter::with_opts(
            Opts::new(
                "store_connect_failures_total",
                "Failed store connection attempts.",
            )
            .namespace(NAMESPACE),
        )?;
        let window_write_failures = Counter::with_opts(
            Opts::new(
                "window_write_failures_total",
                "Window transactions that failed and will be retried.",
            )
            .namespace(NAMESPACE),
        )?;
        let windows_written = Counter::with_opts(
            Opts::new("windows_written_total", "Window transactions committed.")
                .namespace(NAMESPACE),
        )?;
        let rows_written = Counter::with_opts(
            Opts::new("rows_written_total", "Rows committed to the store.").namespace(NAMESPACE),
        )?;
        let window_write_duration = Histogram::with_opts(
            HistogramOpts::new(
                "window_write_duration_seconds",
                "Duration of committed window transactions.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        registry.register(Box::new(flows_received.clone()))?;
        registry.register(Box::new(flow_decode_errors.clone()))?;
        registry.register(Box::new(flow_channel_length.clone()))?;
        registry.register(Box::new(flows_unmatched.clone()))?;
        registry.register(Box::new(bucket_updates.clone()))?;
        registry.register(Box::new(windows_closed.clone()))?;
        registry.register(Box::new(window_buckets.clone()))?;
        registry.register(Box::new(window_queue_depth.clone()))?;
        registry.register(Box::new(store_connected.clone()))?;
        registry.register(Box::new(store_connect_failures.clone()))?;
        registry.register(Box::new(window_write_failures.clone()))?;
        registry.register(Box::new(windows_written.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(window_write_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            flows_received,
            flow_decode_errors,
            flow_channel_length,
            flows_unmatched,
            bucket_updates,
            windows_closed,
            window_buckets,
            window_queue_depth,
            store_connected,
            store_connect_failures,
            window_write_failures,
            windows_written,
            rows_written,
            window_write_duration,
        })
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz and returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("listening on {}", self.addr))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
