pub mod postgres;
pub mod queue;
pub mod writer;

use anyhow::Result;
use chrono::{DateTime, Utc};

/// One persisted row: a single bucket of a completed window.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficRow {
    /// Window close time.
    pub time: DateTime<Utc>,
    /// Average bits per second over the aggregation period.
    pub bandwidth: f32,
    pub iface: String,
    pub ingress: bool,
    pub remote_asn: i64,
    pub local_asn: i64,
}

/// Durable destination for completed windows.
///
/// Implementations own a single connection. The writer drives them through
/// connect, schema bootstrap and per-window transactions, and calls
/// `disconnect` after any failure before reconnecting.
pub trait Store: Send {
    /// Opens a connection and verifies it is alive.
    fn connect(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Creates the destination table if it does not exist.
    fn ensure_schema(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Writes all rows in one transaction. Either every row is committed or
    /// none is.
    fn write_window(
        &mut self,
        rows: &[TrafficRow],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Drops the connection, if any.
    fn disconnect(&mut self);
}
