//! Flow Worker (spec.md §4.6).
//!
//! Each flow gets one cooperative task, grounded in the teacher's UDP
//! flow service (`tproxy_rs::udp::service`): a `tokio::select!` loop
//! forwarding datagrams between a channel and a relay socket until either
//! side closes. This worker generalizes that two-arm loop to the full
//! five-event loop the gateway needs, and replaces the original's
//! sentinel-channel-close signaling with a single cancellation token (the
//! "quit by other" source, fired externally by [`request_peer_quit`]),
//! plus a separate reader-shutdown token for tearing down the relay
//! reader task specifically (spec.md §9 redesign).

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::UdpEnvelope;
use crate::error::RelayError;
use crate::gateway::GatewayContext;
use crate::synth;
use crate::tracker::{FlowFingerprint, FlowHandle};

/// Why a worker tore down. Recorded for logging and to decide whether
/// teardown clears the tracker entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuitReason {
    RelayDialFailed,
    RelayWriteFailed,
    IdleTimeout,
    ReaderClosed,
    DnsOneShotDone,
    PeerQuit,
}

impl QuitReason {
    /// `PeerQuit` is the one reason whose teardown must not touch the
    /// tracker — the caller that fired it already owns that cleanup.
    fn clears_tracker(self) -> bool {
        !matches!(self, Self::PeerQuit)
    }
}

/// Spawns the worker task for `fingerprint` and returns the handle the
/// tracker stores. Called with the tracker's registry lock held (via
/// [`FlowTracker::get_or_create`]), so this must not block.
pub fn spawn(fingerprint: FlowFingerprint, ctx: GatewayContext) -> FlowHandle {
    let (inbound_tx, inbound_rx) = mpsc::channel(ctx.cfg.inbound_queue_depth);
    let peer_quit = CancellationToken::new();
    let handle = FlowHandle {
        inbound: inbound_tx,
        cancel: peer_quit.clone(),
    };

    tokio::spawn(run(fingerprint, ctx, inbound_rx, peer_quit));

    handle
}

/// Asks an already-running flow to quit without the caller owning tracker
/// cleanup — used by [`crate::gateway::Gateway::stop`] to proactively wake
/// every flow rather than rely solely on the global `stopped` poll.
pub fn request_peer_quit(handle: &FlowHandle) {
    handle.cancel.cancel();
}

async fn run(
    fingerprint: FlowFingerprint,
    ctx: GatewayContext,
    inbound: mpsc::Receiver<UdpEnvelope>,
    peer_quit: CancellationToken,
) {
    let reader_shutdown = CancellationToken::new();
    let remote = SocketAddr::new(IpAddr::V4(fingerprint.remote_ip), fingerprint.remote_port);

    let socket = match time::timeout(ctx.cfg.relay_connect_timeout, dial(remote)).await {
        Ok(Ok(socket)) => Arc::new(socket),
        Ok(Err(err)) => {
            warn!(flow = %fingerprint, error = %err, "relay dial failed");
            teardown(&fingerprint, &ctx, &reader_shutdown, QuitReason::RelayDialFailed, inbound).await;
            return;
        }
        Err(_) => {
            warn!(flow = %fingerprint, error = %RelayError::Timeout, "relay dial timed out");
            teardown(&fingerprint, &ctx, &reader_shutdown, QuitReason::RelayDialFailed, inbound).await;
            return;
        }
    };

    let (relay_tx, relay_rx) = mpsc::channel::<Vec<u8>>(ctx.cfg.inbound_queue_depth);
    tokio::spawn(reader_task(
        socket.clone(),
        relay_tx,
        ctx.cfg.relay_initial_deadline,
        reader_shutdown.clone(),
    ));

    drive(fingerprint, ctx, socket, relay_rx, inbound, peer_quit, reader_shutdown).await;
}

async fn dial(remote: SocketAddr) -> Result<UdpSocket, RelayError> {
    let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(RelayError::Bind)?;
    socket.connect(remote).await.map_err(RelayError::Connect)?;
    Ok(socket)
}

/// Forwards relay datagrams onto `tx` until `shutdown` fires or the socket
/// errors. The first receive is bounded by `initial_deadline` (spec.md
/// §4.6 step 2: "arm a 10-second deadline... clear the deadline" once it
/// succeeds); every receive after that is unbounded, since ongoing
/// staleness is the main loop's 1-second idle timer's job, not the
/// reader's.
async fn reader_task(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<Vec<u8>>,
    initial_deadline: Duration,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; 64 * 1024];

    let first = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = time::timeout(initial_deadline, socket.recv(&mut buf)) => result,
    };
    match first {
        Ok(Ok(n)) => {
            if tx.send(buf[..n].to_vec()).await.is_err() {
                return;
            }
        }
        _ => return,
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            result = socket.recv(&mut buf) => {
                match result {
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    fingerprint: FlowFingerprint,
    ctx: GatewayContext,
    socket: Arc<UdpSocket>,
    mut relay_rx: mpsc::Receiver<Vec<u8>>,
    mut inbound: mpsc::Receiver<UdpEnvelope>,
    peer_quit: CancellationToken,
    reader_shutdown: CancellationToken,
) {
    loop {
        if ctx.stopped.load(Ordering::Relaxed) {
            // Fast-path global shutdown: intentionally leaks queued
            // envelopes rather than pay for a drain on every flow.
            return;
        }

        let idle = time::sleep(ctx.cfg.idle_timeout);
        tokio::pin!(idle);

        tokio::select! {
            () = &mut idle => {
                teardown(&fingerprint, &ctx, &reader_shutdown, QuitReason::IdleTimeout, inbound).await;
                return;
            }
            () = peer_quit.cancelled() => {
                teardown(&fingerprint, &ctx, &reader_shutdown, QuitReason::PeerQuit, inbound).await;
                return;
            }
            relay_datagram = relay_rx.recv() => {
                match relay_datagram {
                    Some(payload) => {
                        handle_relay_datagram(&fingerprint, &ctx, &payload).await;
                        if fingerprint.remote_port == ctx.cfg.dns_port {
                            ctx.dns_cache.store(&payload);
                            teardown(&fingerprint, &ctx, &reader_shutdown, QuitReason::DnsOneShotDone, inbound).await;
                            return;
                        }
                    }
                    None => {
                        teardown(&fingerprint, &ctx, &reader_shutdown, QuitReason::ReaderClosed, inbound).await;
                        return;
                    }
                }
            }
            inbound_packet = inbound.recv() => {
                match inbound_packet {
                    Some(envelope) => {
                        if let Err(err) = socket.send(envelope.udp_payload()).await {
                            warn!(flow = %fingerprint, error = %RelayError::Send(err), "relay write failed");
                            envelope.release(&ctx.pool);
                            teardown(&fingerprint, &ctx, &reader_shutdown, QuitReason::RelayWriteFailed, inbound).await;
                            return;
                        }
                        envelope.release(&ctx.pool);
                    }
                    None => {
                        teardown(&fingerprint, &ctx, &reader_shutdown, QuitReason::PeerQuit, inbound).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_relay_datagram(fingerprint: &FlowFingerprint, ctx: &GatewayContext, payload: &[u8]) {
    let (primary, fragments) = match synth::synthesize_response(
        fingerprint.local_ip,
        fingerprint.remote_ip,
        fingerprint.local_port,
        fingerprint.remote_port,
        payload,
        &ctx.cfg,
        &ctx.pool,
    ) {
        Ok(envelopes) => envelopes,
        Err(err) => {
            warn!(flow = %fingerprint, error = %err, "failed to synthesize response");
            return;
        }
    };

    // Submitted as one batch so another flow's packet can never land on
    // the shared outbound channel between the primary and its fragments
    // (spec.md §5).
    let mut batch = Vec::with_capacity(1 + fragments.len());
    batch.push(primary);
    batch.extend(fragments);
    let _ = ctx.outbound.send(batch).await;
}

/// Closes the reader task, drains and releases any envelopes still queued
/// in `inbound`, and — unless `reason` says otherwise — removes this
/// flow's tracker entry.
async fn teardown(
    fingerprint: &FlowFingerprint,
    ctx: &GatewayContext,
    reader_shutdown: &CancellationToken,
    reason: QuitReason,
    mut inbound: mpsc::Receiver<UdpEnvelope>,
) {
    reader_shutdown.cancel();
    inbound.close();
    while let Ok(envelope) = inbound.try_recv() {
        envelope.release(&ctx.pool);
    }
    if reason.clears_tracker() {
        ctx.tracker.clear(fingerprint);
    }
    debug!(flow = %fingerprint, ?reason, "flow torn down");
}
