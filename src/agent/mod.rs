use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::Aggregator;
use crate::catalog::InterfaceCatalog;
use crate::config::Settings;
use crate::export::health::HealthMetrics;
use crate::flow::udp::UdpFlowSource;
use crate::sink::postgres::PostgresStore;
use crate::sink::queue::window_queue;
use crate::sink::writer::{DurableWriter, FixedBackoff, WriterError};
use crate::sink::Store;

/// Agent wires the flow source, aggregator, window queue, durable writer
/// and health server together and owns their lifecycles.
pub struct Agent {
    cfg: Settings,
    catalog: Arc<InterfaceCatalog>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
    flow_addr: Option<SocketAddr>,
    sources: Vec<JoinHandle<()>>,
    aggregator: Option<JoinHandle<Result<()>>>,
    writer: Option<JoinHandle<Result<(), WriterError>>>,
}

enum Finished {
    Aggregator(Result<Result<()>, JoinError>),
    Writer(Result<Result<(), WriterError>, JoinError>),
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Settings, catalog: Arc<InterfaceCatalog>) -> Result<Self> {
        let health = Arc::new(
            HealthMetrics::new(&cfg.health.bind_addr()).context("creating health metrics")?,
        );

        Ok(Self {
            cfg,
            catalog,
            health,
            cancel: CancellationToken::new(),
            flow_addr: None,
            sources: Vec::new(),
            aggregator: None,
            writer: None,
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Address the flow source is bound to, once started.
    pub fn flow_addr(&self) -> Option<SocketAddr> {
        self.flow_addr
    }

    /// Starts all components, persisting to the configured PostgreSQL
    /// database.
    pub async fn start(&mut self) -> Result<()> {
        let store = PostgresStore::new(self.cfg.database.clone());
        self.start_with_store(store).await
    }

    /// Starts all components with the given store.
    pub async fn start_with_store<S>(&mut self, store: S) -> Result<()>
    where
        S: Store + 'static,
    {
        if self.aggregator.is_some() || self.writer.is_some() {
            bail!("agent already started");
        }

        // 0. Health server first so health checks respond during startup.
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let health = Some(Arc::clone(&self.health));

        // 1. Bind the flow socket before spawning anything that depends on it.
        let source = UdpFlowSource::bind(&self.cfg.netflow, health.clone())
            .await
            .context("starting flow source")?;
        self.flow_addr = Some(source.local_addr()?);

        // 2. Writer: sole owner of the store connection.
        let (queue_tx, queue_rx) = window_queue(
            self.cfg.queue.max_pending,
            self.cfg.queue.warn_depth,
            health.clone(),
        );
        let mut writer = DurableWriter::new(
            store,
            FixedBackoff(self.cfg.database.retry_interval),
            self.cfg.aggregation.period,
            health.clone(),
        );
        self.writer = Some(tokio::spawn(async move { writer.run(queue_rx).await }));

        // 3. Aggregator: sole owner of the open window.
        let (flow_tx, flow_rx) = mpsc::channel(self.cfg.netflow.channel_capacity);
        let aggregator = Aggregator::new(
            Arc::clone(&self.catalog),
            &self.cfg.aggregation,
            queue_tx,
            health,
        );
        self.aggregator = Some(tokio::spawn(
            aggregator.run(flow_rx, self.cancel.child_token()),
        ));

        // 4. Flow receivers.
        self.sources = source.start(flow_tx, self.cancel.child_token());

        info!(
            interfaces = self.catalog.len(),
            period = ?self.cfg.aggregation.period,
            cutover = self.cfg.aggregation.cutover.as_str(),
            flow_addr = ?self.flow_addr,
            "agent started",
        );

        Ok(())
    }

    /// Waits until the aggregator or the writer stops on its own.
    ///
    /// During normal operation neither does, so this only returns on a
    /// fatal error such as a schema bootstrap failure.
    pub async fn wait(&mut self) -> Result<()> {
        let (Some(aggregator), Some(writer)) = (self.aggregator.as_mut(), self.writer.as_mut())
        else {
            bail!("agent is not running");
        };

        let finished = tokio::select! {
            res = aggregator => Finished::Aggregator(res),
            res = writer => Finished::Writer(res),
        };

        match finished {
            Finished::Aggregator(res) => {
                self.aggregator = None;
                task_result("aggregator", res)
            }
            Finished::Writer(res) => {
                self.writer = None;
                task_result("writer", res.map(|r| r.map_err(anyhow::Error::from)))
            }
        }
    }

    /// Gracefully stops all components.
    ///
    /// The aggregator flushes its partial window and closes the queue; the
    /// writer then drains what is queued. Whatever is still unwritten when
    /// the shutdown timeout expires is abandoned.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        for source in self.sources.drain(..) {
            if let Err(e) = source.await {
                warn!(error = %e, "flow receiver task join failed");
            }
        }

        let mut aggregator = self.aggregator.take();
        let mut writer = self.writer.take();

        let drain = async {
            if let Some(handle) = aggregator.as_mut() {
                if let Err(e) = task_result("aggregator", handle.await) {
                    error!(error = %format!("{e:#}"), "aggregator stopped with error");
                }
                aggregator = None;
            }
            if let Some(handle) = writer.as_mut() {
                if let Err(e) = task_result("writer", handle.await.map(|r| r.map_err(anyhow::Error::from))) {
                    error!(error = %format!("{e:#}"), "writer stopped with error");
                }
                writer = None;
            }
        };

        if tokio::time::timeout(self.cfg.shutdown_timeout, drain).await.is_err() {
            let unwritten = self.health.window_queue_depth.get() as usize;
            warn!(
                timeout = ?self.cfg.shutdown_timeout,
                unwritten_windows = unwritten,
                "shutdown timed out, abandoning unwritten windows",
            );
            if let Some(handle) = aggregator.take() {
                handle.abort();
            }
            if let Some(handle) = writer.take() {
                handle.abort();
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        info!("agent stopped");
        Ok(())
    }
}

fn task_result(name: &str, res: Result<Result<()>, JoinError>) -> Result<()> {
    match res {
        Ok(inner) => inner.with_context(|| format!("{name} task failed")),
        Err(e) => Err(e).with_context(|| format!("{name} task panicked or was cancelled")),
    }
}
