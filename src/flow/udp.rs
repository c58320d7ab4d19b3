use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetflowConfig;
use crate::export::health::HealthMetrics;

use super::parse::parse_datagram;
use super::FlowRecord;

/// Largest UDP payload we accept.
const MAX_DATAGRAM: usize = 65_535;

/// Receives decoded flow datagrams on a UDP socket.
///
/// Several receiver tasks may share the socket; every decoded record is
/// forwarded into one bounded channel consumed by the aggregator. When the
/// channel is full the receivers wait, and the kernel socket buffer absorbs
/// (or drops) the excess.
pub struct UdpFlowSource {
    socket: Arc<UdpSocket>,
    workers: usize,
    health: Option<Arc<HealthMetrics>>,
}

impl UdpFlowSource {
    /// Binds the listen socket.
    pub async fn bind(cfg: &NetflowConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let socket = UdpSocket::bind(&cfg.address)
            .await
            .with_context(|| format!("binding flow socket {}", cfg.address))?;

        Ok(Self {
            socket: Arc::new(socket),
            workers: cfg.workers.max(1),
            health,
        })
    }

    /// Returns the bound socket address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("getting flow socket address")
    }

    /// Spawns the receiver tasks.
    pub fn start(self, tx: mpsc::Sender<FlowRecord>, ctx: CancellationToken) -> Vec<JoinHandle<()>> {
        if let Ok(addr) = self.local_addr() {
            info!(%addr, workers = self.workers, "flow source started");
        }

        (0..self.workers)
            .map(|worker| {
                let socket = Arc::clone(&self.socket);
                let tx = tx.clone();
                let ctx = ctx.clone();
                let health = self.health.clone();
                tokio::spawn(receive_loop(worker, socket, tx, ctx, health))
            })
            .collect()
    }
}

async fn receive_loop(
    worker: usize,
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<FlowRecord>,
    ctx: CancellationToken,
    health: Option<Arc<HealthMetrics>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (len, peer) = tokio::select! {
            _ = ctx.cancelled() => {
                debug!(worker, "flow receiver stopped");
                return;
            }
            res = socket.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    warn!(worker, error = %e, "flow socket receive failed");
                    continue;
                }
            },
        };

        let (flows, err) = parse_datagram(&buf[..len]);
        if let Some(e) = err {
            if let Some(h) = &health {
                h.flow_decode_errors.inc();
            }
            debug!(worker, %peer, error = %e, "dropping undecodable flow data");
        }

        if let Some(h) = &health {
            h.flows_received.inc_by(flows.len() as f64);
        }

        for flow in flows {
            if tx.send(flow).await.is_err() {
                debug!(worker, "flow channel closed, receiver exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_cfg() -> NetflowConfig {
        NetflowConfig {
            address: "127.0.0.1:0".to_string(),
            workers: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_datagram_forwarded_to_channel() {
        let source = UdpFlowSource::bind(&local_cfg(), None).await.expect("bind");
        let addr = source.local_addr().expect("addr");
        let (tx, mut rx) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let handles = source.start(tx, ctx.clone());
        assert_eq!(handles.len(), 2);

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client");
        let payload = concat!(
            r#"{"sampler_address":"10.0.0.1","in_if":1,"out_if":2,"bytes":10,"src_as":1,"dst_as":2}"#,
            "\n",
            r#"{"sampler_address":"10.0.0.1","in_if":2,"out_if":1,"bytes":20,"src_as":2,"dst_as":1}"#,
        );
        client.send_to(payload.as_bytes(), addr).await.expect("send");

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timely")
            .expect("flow");
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timely")
            .expect("flow");
        assert_eq!(first.bytes, 10);
        assert_eq!(second.bytes, 20);

        ctx.cancel();
        for h in handles {
            h.await.expect("receiver join");
        }
    }

    #[tokio::test]
    async fn test_bad_datagram_counted_not_forwarded() {
        let health = Arc::new(HealthMetrics::new("127.0.0.1:0").expect("metrics"));
        let cfg = NetflowConfig {
            workers: 1,
            ..local_cfg()
        };
        let source = UdpFlowSource::bind(&cfg, Some(Arc::clone(&health)))
            .await
            .expect("bind");
        let addr = source.local_addr().expect("addr");
        let (tx, mut rx) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let handles = source.start(tx, ctx.clone());

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client");
        client.send_to(b"garbage", addr).await.expect("send");
        client
            .send_to(br#"{"sampler_address":"10.0.0.1","bytes":5}"#, addr)
            .await
            .expect("send");

        let flow = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timely")
            .expect("flow");
        assert_eq!(flow.bytes, 5);
        assert_eq!(health.flow_decode_errors.get() as u64, 1);

        ctx.cancel();
        for h in handles {
            h.await.expect("receiver join");
        }
    }
}
