//! FIFO handoff of completed windows from the aggregator to the writer.
//!
//! Single producer, single consumer. Windows are never dropped or
//! reordered. By default the queue is unbounded: when the writer falls
//! behind the backlog grows and is reported through [`WindowSender::depth`]
//! and the `window_queue_depth` gauge. A bound turns that into
//! backpressure on the aggregator instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::aggregate::cache::CompletedWindow;
use crate::export::health::HealthMetrics;

/// The writer side of the queue has gone away.
#[derive(Error, Debug)]
#[error("window queue closed; window {} not delivered", .0.generation)]
pub struct QueueClosed(pub CompletedWindow);

enum Tx {
    Unbounded(mpsc::UnboundedSender<CompletedWindow>),
    Bounded(mpsc::Sender<CompletedWindow>),
}

enum Rx {
    Unbounded(mpsc::UnboundedReceiver<CompletedWindow>),
    Bounded(mpsc::Receiver<CompletedWindow>),
}

/// Shared backlog counter.
struct Depth {
    pending: AtomicUsize,
    warn_depth: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl Depth {
    fn incr(&self) -> usize {
        let depth = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(h) = &self.health {
            h.window_queue_depth.set(depth as f64);
        }
        depth
    }

    fn decr(&self) {
        let depth = self.pending.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if let Some(h) = &self.health {
            h.window_queue_depth.set(depth as f64);
        }
    }
}

/// Producer half, owned by the aggregator.
pub struct WindowSender {
    tx: Tx,
    depth: Arc<Depth>,
}

/// Consumer half, owned by the writer.
pub struct WindowReceiver {
    rx: Rx,
    depth: Arc<Depth>,
}

/// Creates a window queue. `max_pending == 0` means unbounded.
pub fn window_queue(
    max_pending: usize,
    warn_depth: usize,
    health: Option<Arc<HealthMetrics>>,
) -> (WindowSender, WindowReceiver) {
    let depth = Arc::new(Depth {
        pending: AtomicUsize::new(0),
        warn_depth: warn_depth.max(1),
        health,
    });

    let (tx, rx) = if max_pending == 0 {
        let (tx, rx) = mpsc::unbounded_channel();
        (Tx::Unbounded(tx), Rx::Unbounded(rx))
    } else {
        let (tx, rx) = mpsc::channel(max_pending);
        (Tx::Bounded(tx), Rx::Bounded(rx))
    };

    (
        WindowSender {
            tx,
            depth: Arc::clone(&depth),
        },
        WindowReceiver { rx, depth },
    )
}

impl WindowSender {
    /// Enqueues a window. Waits for space only when the queue is bounded.
    ///
    /// Cancel-safe: if the future is dropped while waiting for space, the
    /// window is dropped with it and the depth is left untouched.
    pub async fn send(&self, window: CompletedWindow) -> Result<(), QueueClosed> {
        // Count before the window becomes visible so the receiver never
        // observes a negative depth.
        let depth = match &self.tx {
            Tx::Unbounded(tx) => {
                let depth = self.depth.incr();
                if let Err(e) = tx.send(window) {
                    self.depth.decr();
                    return Err(QueueClosed(e.0));
                }
                depth
            }
            Tx::Bounded(tx) => {
                let Ok(permit) = tx.reserve().await else {
                    return Err(QueueClosed(window));
                };
                let depth = self.depth.incr();
                permit.send(window);
                depth
            }
        };

        if depth >= self.depth.warn_depth && depth % self.depth.warn_depth == 0 {
            warn!(depth, "writer is falling behind, windows are queueing up");
        }

        Ok(())
    }

    /// Windows enqueued and not yet taken by the writer.
    pub fn depth(&self) -> usize {
        self.depth.pending.load(Ordering::Acquire)
    }
}

impl WindowReceiver {
    /// Waits for the next window. Returns `None` once the sender is dropped
    /// and every queued window has been taken.
    pub async fn recv(&mut self) -> Option<CompletedWindow> {
        let window = match &mut self.rx {
            Rx::Unbounded(rx) => rx.recv().await,
            Rx::Bounded(rx) => rx.recv().await,
        };

        if window.is_some() {
            self.depth.decr();
        }

        window
    }

    /// Windows enqueued and not yet taken.
    pub fn depth(&self) -> usize {
        self.depth.pending.load(Ordering::Acquire)
    }
}
