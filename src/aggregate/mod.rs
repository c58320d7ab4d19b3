//! Per-window traffic aggregation.
//!
//! The [`Aggregator`] is the only owner of the open window. It matches
//! each flow record against the interface catalog, adds the sampled bit
//! estimate to the matching buckets, and at each cutover hands the window
//! to the writer queue by value.

pub mod cache;
pub mod key;
pub mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::InterfaceCatalog;
use crate::config::AggregationConfig;
use crate::export::health::HealthMetrics;
use crate::flow::FlowRecord;
use crate::sink::queue::{QueueClosed, WindowSender};

use cache::AggregationCache;
use key::TrafficKey;
use scheduler::WindowScheduler;

/// Owns the open window and its cutover schedule. The only producer on
/// the window queue.
pub struct Aggregator {
    catalog: Arc<InterfaceCatalog>,
    cache: AggregationCache,
    scheduler: WindowScheduler,
    queue: WindowSender,
    health: Option<Arc<HealthMetrics>>,
}

impl Aggregator {
    /// Opens the first window now.
    pub fn new(
        catalog: Arc<InterfaceCatalog>,
        cfg: &AggregationConfig,
        queue: WindowSender,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            catalog,
            cache: AggregationCache::new(Utc::now()),
            scheduler: WindowScheduler::new(cfg.period, cfg.cutover, Instant::now()),
            queue,
            health,
        }
    }

    pub fn cache(&self) -> &AggregationCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &WindowScheduler {
        &self.scheduler
    }

    /// Accumulates one flow record. Returns the number of buckets updated:
    /// 0 when no catalogued interface matches, 2 when the record entered
    /// and left through catalogued interfaces.
    pub fn ingest(&mut self, flow: &FlowRecord) -> usize {
        let matches = self.catalog.matches(flow);

        if matches.is_empty() {
            if let Some(h) = &self.health {
                h.flows_unmatched.inc();
            }
            return 0;
        }

        for m in matches.iter() {
            self.cache.accumulate(TrafficKey::from(m), m.bits(flow.bytes));
        }

        let updated = matches.len();
        if let Some(h) = &self.health {
            h.bucket_updates.inc_by(updated as f64);
        }
        updated
    }

    /// Closes the open window and enqueues it for writing.
    ///
    /// Empty windows are discarded. The next window opens immediately, so
    /// records arriving while a bounded queue applies backpressure land in
    /// it.
    pub async fn cutover(&mut self) -> Result<(), QueueClosed> {
        let window = self.cache.drain(Utc::now());
        self.scheduler.reset(Instant::now());

        if let Some(h) = &self.health {
            h.windows_closed.inc();
        }

        if window.is_empty() {
            debug!(generation = window.generation, "window closed empty, skipping");
            return Ok(());
        }

        if let Some(h) = &self.health {
            h.window_buckets.observe(window.len() as f64);
        }
        info!(
            generation = window.generation,
            buckets = window.len(),
            total_bits = window.total_bits(),
            "window closed",
        );

        self.queue.send(window).await
    }

    /// Consumes flow records until cancelled or the flow channel closes,
    /// cutting windows over as they come due. The partial window is
    /// flushed to the queue before returning; dropping the aggregator then
    /// closes the queue.
    pub async fn run(
        mut self,
        mut flows: mpsc::Receiver<FlowRecord>,
        ctx: CancellationToken,
    ) -> Result<()> {
        info!(
            period = ?self.scheduler.period(),
            cutover = self.scheduler.mode().as_str(),
            interfaces = self.catalog.len(),
            "aggregator started",
        );

        loop {
            let deadline = self.scheduler.deadline();
            let timer = self.scheduler.uses_timer();

            tokio::select! {
                biased;

                _ = ctx.cancelled() => {
                    // Count what the sources already delivered.
                    flows.close();
                    while let Ok(flow) = flows.try_recv() {
                        self.ingest(&flow);
                    }
                    break;
                }

                _ = tokio::time::sleep_until(deadline), if timer => {
                    self.cutover().await.context("handing window to writer")?;
                }

                flow = flows.recv() => {
                    let Some(flow) = flow else {
                        debug!("flow channel closed");
                        break;
                    };

                    self.ingest(&flow);

                    let backlog = flows.len();
                    if let Some(h) = &self.health {
                        h.flow_channel_length.set(backlog as f64);
                    }
                    if backlog > 1 {
                        debug!(backlog, "flow records waiting");
                    }

                    if self.scheduler.is_due(Instant::now()) {
                        self.cutover().await.context("handing window to writer")?;
                    }
                }
            }
        }

        if !self.cache.is_empty() {
            info!(
                generation = self.cache.generation(),
                buckets = self.cache.len(),
                "flushing partial window",
            );
            self.cutover().await.context("flushing final window")?;
        }

        info!("aggregator stopped");
        Ok(())
    }
}
