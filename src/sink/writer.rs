//! Durable window writer.
//!
//! Consumes completed windows in order and persists each one through a
//! [`Store`]. A window leaves the writer only once its transaction has
//! committed; on any failure the connection is dropped, the writer backs
//! off and reconnects, and the same window is written again from scratch.
//! Nothing is ever discarded, so a commit whose acknowledgement is lost
//! can produce duplicate rows (at-least-once delivery).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::queue::WindowReceiver;
use super::{Store, TrafficRow};
use crate::aggregate::cache::CompletedWindow;
use crate::export::health::HealthMetrics;

/// Converts a completed window into rows stamped with its close time.
///
/// Bandwidth is the accumulated bit count averaged over `period`, in bits
/// per second.
pub fn window_rows(window: &CompletedWindow, period: Duration) -> Vec<TrafficRow> {
    let secs = period.as_secs_f64();

    window
        .buckets
        .iter()
        .map(|(key, bits)| TrafficRow {
            time: window.closed_at,
            bandwidth: (*bits as f64 / secs) as f32,
            iface: key.iface.name.clone(),
            ingress: key.ingress,
            remote_asn: i64::from(key.remote_asn),
            local_asn: i64::from(key.local_asn),
        })
        .collect()
}

/// Delay policy between reconnection attempts.
pub trait Backoff: Send {
    /// Delay before the next attempt. `attempt` counts failures in the
    /// current outage, starting at 1.
    fn delay(&mut self, attempt: u32) -> Duration;
}

/// Waits the same interval after every failure.
#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&mut self, _attempt: u32) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Disconnected,
    Connected,
    Writing,
}

impl WriterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Writing => "writing",
        }
    }
}

#[derive(Error, Debug)]
pub enum WriterError {
    /// The destination table could not be created. Not retried.
    #[error("ensuring destination schema")]
    Schema(#[source] anyhow::Error),
}

/// Owns the store connection and drains the window queue into it.
pub struct DurableWriter<S, B> {
    store: S,
    backoff: B,
    period: Duration,
    state: WriterState,
    schema_ready: bool,
    health: Option<Arc<HealthMetrics>>,
}

impl<S: Store, B: Backoff> DurableWriter<S, B> {
    pub fn new(store: S, backoff: B, period: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            store,
            backoff,
            period,
            state: WriterState::Disconnected,
            schema_ready: false,
            health,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Writes windows until the queue is closed and empty.
    ///
    /// Returns an error only when schema bootstrap fails on the first
    /// successful connection. Connection and write failures are retried
    /// indefinitely, but a closed and empty queue ends the run even while
    /// the store is unreachable.
    pub async fn run(&mut self, mut queue: WindowReceiver) -> Result<(), WriterError> {
        let mut pending: Option<CompletedWindow> = None;

        loop {
            if self.state == WriterState::Disconnected {
                if pending.is_some() {
                    self.connect().await?;
                } else {
                    // Nothing to write yet: stop reconnecting once the queue
                    // closes, and pick up a window that arrives meanwhile.
                    tokio::select! {
                        biased;

                        next = queue.recv() => match next {
                            Some(window) => pending = Some(window),
                            None => break,
                        },

                        res = self.connect() => res?,
                    }
                    continue;
                }
            }

            let window = match pending.take() {
                Some(window) => window,
                None => match queue.recv().await {
                    Some(window) => window,
                    None => break,
                },
            };

            if !self.write(&window).await {
                pending = Some(window);
            }
        }

        info!("window queue closed, writer stopping");
        self.store.disconnect();
        self.transition(WriterState::Disconnected);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), WriterError> {
        let mut attempt: u32 = 0;

        loop {
            match self.store.connect().await {
                Ok(()) => break,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    if let Some(h) = &self.health {
                        h.store_connect_failures.inc();
                    }
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt,
                        retry_in = ?delay,
                        error = %format!("{e:#}"),
                        "store connection failed",
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        info!(attempts = attempt + 1, "store connected");

        if !self.schema_ready {
            if let Err(e) = self.store.ensure_schema().await {
                self.store.disconnect();
                return Err(WriterError::Schema(e));
            }
            self.schema_ready = true;
            info!("destination schema ready");
        }

        self.transition(WriterState::Connected);
        Ok(())
    }

    /// Writes one window. Returns false if it must be retried.
    async fn write(&mut self, window: &CompletedWindow) -> bool {
        self.transition(WriterState::Writing);

        let rows = window_rows(window, self.period);
        let started = std::time::Instant::now();

        match self.store.write_window(&rows).await {
            Ok(()) => {
                self.transition(WriterState::Connected);
                if let Some(h) = &self.health {
                    h.windows_written.inc();
                    h.rows_written.inc_by(rows.len() as f64);
                    h.window_write_duration
                        .observe(started.elapsed().as_secs_f64());
                }
                debug!(
                    generation = window.generation,
                    rows = rows.len(),
                    elapsed = ?started.elapsed(),
                    "window committed",
                );
                true
            }
            Err(e) => {
                if let Some(h) = &self.health {
                    h.window_write_failures.inc();
                }
                let delay = self.backoff.delay(1);
                warn!(
                    generation = window.generation,
                    rows = rows.len(),
                    retry_in = ?delay,
                    error = %format!("{e:#}"),
                    "window write failed, reconnecting",
                );
                self.store.disconnect();
                self.transition(WriterState::Disconnected);
                tokio::time::sleep(delay).await;
                false
            }
        }
    }

    fn transition(&mut self, next: WriterState) {
        if self.state == next {
            return;
        }
        debug!(from = self.state.as_str(), to = next.as_str(), "writer state");
        self.state = next;

        if let Some(h) = &self.health {
            let connected = if next == WriterState::Disconnected { 0.0 } else { 1.0 };
            h.store_connected.set(connected);
        }
    }
}
