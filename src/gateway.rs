//! The top-level gateway handle (spec.md §2, §5).
//!
//! Wires the buffer pool, DNS cache, and flow tracker together behind one
//! `Gateway`, generalized from the teacher's `TransparentProxyEngine`: a
//! `Mutex`-guarded `running` flag plus start/stop, except state here is
//! spread across the collaborators it owns rather than a single inner
//! struct, since each collaborator (tracker, cache, pool) already
//! synchronizes itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::config::GatewayConfig;
use crate::dns_cache::DnsCache;
use crate::envelope::UdpEnvelope;
use crate::pool::BufferPool;
use crate::tracker::FlowTracker;
use crate::worker;

/// A primary envelope plus its ordered fragments, submitted to the
/// TUN-outbound channel as a single item so that a batch from one flow can
/// never interleave with a batch from another on the shared channel
/// (spec.md §5: "primary+fragments must be enqueued back-to-back without
/// interleaving"). The writer on the receiving end must write every
/// envelope in a batch, in order, before moving on to the next one.
pub type OutboundBatch = Vec<UdpEnvelope>;

/// Collaborators shared by every flow worker and the ingress handler.
/// Cloning is cheap: every field is an `Arc` or a `Copy` config struct.
#[derive(Clone)]
pub struct GatewayContext {
    pub cfg: GatewayConfig,
    pub tracker: Arc<FlowTracker>,
    pub dns_cache: Arc<DnsCache>,
    pub pool: Arc<BufferPool>,
    /// Channel fed by flow workers and the ingress handler; drained by
    /// whatever TUN-writer task the embedder supplies.
    pub outbound: mpsc::Sender<OutboundBatch>,
    pub stopped: Arc<AtomicBool>,
}

/// Owns the gateway's shared state and hands out the channel the caller's
/// TUN-writer task reads from.
pub struct Gateway {
    ctx: GatewayContext,
    outbound_rx: Option<mpsc::Receiver<OutboundBatch>>,
}

impl Gateway {
    /// Builds a gateway with its own buffer pool, DNS cache, and flow
    /// tracker. `outbound_queue_depth` bounds the TUN-outbound channel
    /// shared by every flow worker.
    pub fn new(cfg: GatewayConfig, outbound_queue_depth: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_queue_depth);
        let ctx = GatewayContext {
            pool: Arc::new(BufferPool::new(cfg.mtu, outbound_queue_depth)),
            dns_cache: Arc::new(DnsCache::new()),
            tracker: Arc::new(FlowTracker::new()),
            outbound: outbound_tx,
            stopped: Arc::new(AtomicBool::new(false)),
            cfg,
        };
        Self {
            ctx,
            outbound_rx: Some(outbound_rx),
        }
    }

    /// The collaborators shared by the ingress handler and every flow
    /// worker. Clone this into whatever drives [`crate::ingress`].
    pub fn context(&self) -> GatewayContext {
        self.ctx.clone()
    }

    /// Takes the receiving half of the TUN-outbound channel. Returns
    /// `None` if already taken — there is exactly one TUN-writer task per
    /// gateway.
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<OutboundBatch>> {
        self.outbound_rx.take()
    }

    pub fn dns_cache(&self) -> &DnsCache {
        &self.ctx.dns_cache
    }

    pub fn tracker(&self) -> &FlowTracker {
        &self.ctx.tracker
    }

    pub fn pool(&self) -> &BufferPool {
        &self.ctx.pool
    }

    /// An owned handle to the shared buffer pool, for callers that need to
    /// move it into a spawned task rather than borrow it.
    pub fn pool_handle(&self) -> Arc<BufferPool> {
        self.ctx.pool.clone()
    }

    /// Sets the global `stopped` flag every flow worker polls at the top
    /// of its loop, then proactively wakes every currently-tracked flow so
    /// idle ones don't wait out their next idle timer to notice. Flows
    /// woken this way tear down via the peer-quit path, which skips
    /// clearing the tracker itself (spec.md §4.6: "the caller that
    /// signaled owns cleanup") — since `stop` is that caller, it clears
    /// every entry here instead.
    pub fn stop(&self) {
        if self.ctx.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("gateway stopping");
        for handle in self.ctx.tracker.handles() {
            worker::request_peer_quit(&handle);
        }
        self.ctx.tracker.clear_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.stopped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_gateway_hands_out_outbound_receiver_exactly_once() {
        let mut gateway = Gateway::new(GatewayConfig::default(), 16);
        assert!(gateway.take_outbound().is_some());
        assert!(gateway.take_outbound().is_none());
    }

    #[test]
    fn context_shares_the_same_collaborators() {
        let gateway = Gateway::new(GatewayConfig::default(), 16);
        let a = gateway.context();
        let b = gateway.context();
        assert!(Arc::ptr_eq(&a.tracker, &b.tracker));
        assert!(Arc::ptr_eq(&a.dns_cache, &b.dns_cache));
        assert!(Arc::ptr_eq(&a.pool, &b.pool));
    }

    #[test]
    fn stop_is_idempotent_and_visible_via_is_stopped() {
        let gateway = Gateway::new(GatewayConfig::default(), 16);
        assert!(!gateway.is_stopped());
        gateway.stop();
        gateway.stop();
        assert!(gateway.is_stopped());
    }

    #[tokio::test]
    async fn stop_signals_and_clears_every_tracked_flow() {
        use crate::tracker::FlowFingerprint;
        use std::net::Ipv4Addr;
        use tokio_util::sync::CancellationToken;

        let gateway = Gateway::new(GatewayConfig::default(), 16);
        let fingerprint = FlowFingerprint {
            local_ip: Ipv4Addr::new(10, 0, 0, 5),
            local_port: 4000,
            remote_ip: Ipv4Addr::new(203, 0, 113, 9),
            remote_port: 53,
        };
        let cancel = CancellationToken::new();
        let (inbound, _inbound_rx) = mpsc::channel(1);
        let handle = crate::tracker::FlowHandle { inbound, cancel: cancel.clone() };
        gateway.tracker().get_or_create(fingerprint, || handle);
        assert_eq!(gateway.tracker().len(), 1);

        gateway.stop();

        assert!(cancel.is_cancelled());
        assert!(gateway.tracker().is_empty());
    }
}
