//! UDP Ingress Handler (spec.md §4.7).
//!
//! The entry point called with each inbound UDP datagram read from TUN.
//! Consults the DNS cache first: a hit is answered directly from the
//! cache, a miss is forwarded through the flow tracker to a relay (spec.md
//! §4.7 steps 1 and 3). Everything that isn't a DNS lookup is dropped
//! instead of forwarded — preserving the reference behavior flagged in
//! spec.md §9 open question 1. This looks backwards for a general-purpose
//! gateway, but it's the observed behavior, not a bug introduced here; a
//! reimplementation that "fixed" it would no longer match the system it's
//! replacing.

use std::net::Ipv4Addr;

use tracing::{trace, warn};

use crate::codec;
use crate::envelope::UdpEnvelope;
use crate::gateway::GatewayContext;
use crate::synth;
use crate::tracker::FlowFingerprint;
use crate::worker;

/// Parses and dispatches one inbound wire-format IPv4+UDP datagram.
///
/// Non-UDP or malformed datagrams, and any error synthesizing a DNS cache
/// hit's response, are logged and dropped — ingress never propagates an
/// error to its caller (spec.md §7).
pub async fn handle(wire: &[u8], ctx: &GatewayContext) {
    let envelope = match UdpEnvelope::from_wire(wire, &ctx.pool) {
        Ok(envelope) => envelope,
        Err(err) => {
            trace!(error = %err, "dropping unparsable inbound datagram");
            return;
        }
    };

    if envelope.ip.protocol != codec::PROTO_UDP {
        envelope.release(&ctx.pool);
        return;
    }

    if envelope.udp.dst_port == ctx.cfg.dns_port {
        if let Some(response) = ctx.dns_cache.query(envelope.udp_payload()) {
            respond_from_cache(&envelope, &response, ctx).await;
            envelope.release(&ctx.pool);
            return;
        }
        // Cache miss: not done yet (spec.md §4.7 step 1 only sets `done`
        // on a hit) — fall through to the flow tracker so the query is
        // actually forwarded through the relay (step 3).
        dispatch_to_flow(envelope, ctx).await;
        return;
    }

    // Every other destination port is dropped: the reference
    // implementation only ever forwards DNS lookups through the relay.
    envelope.release(&ctx.pool);
}

async fn respond_from_cache(request: &UdpEnvelope, response_payload: &[u8], ctx: &GatewayContext) {
    let local_ip: Ipv4Addr = request.ip.src;
    let remote_ip: Ipv4Addr = request.ip.dst;

    let (primary, fragments) = match synth::synthesize_response(
        local_ip,
        remote_ip,
        request.udp.src_port,
        request.udp.dst_port,
        response_payload,
        &ctx.cfg,
        &ctx.pool,
    ) {
        Ok(envelopes) => envelopes,
        Err(err) => {
            warn!(error = %err, "failed to synthesize cached dns response");
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

/// Dispatches an envelope destined for a live (or not-yet-created) flow:
/// looks up or creates the flow worker and hands it the envelope. Reached
/// both for a DNS cache miss (`handle` falling through to step 3) and by
/// embedders that flip the "non-DNS is dropped" policy above.
pub async fn dispatch_to_flow(envelope: UdpEnvelope, ctx: &GatewayContext) {
    let fingerprint = FlowFingerprint {
        local_ip: envelope.ip.src,
        local_port: envelope.udp.src_port,
        remote_ip: envelope.ip.dst,
        remote_port: envelope.udp.dst_port,
    };

    let handle = ctx
        .tracker
        .get_or_create(fingerprint, || worker::spawn(fingerprint, ctx.clone()));

    if handle.cancel.is_cancelled() {
        // The worker owning this fingerprint is already tearing down;
        // respect its termination signal rather than enqueue behind it
        // (spec.md §4.6, "inbound queue discipline").
        envelope.release(&ctx.pool);
        return;
    }

    if handle.inbound.send(envelope).await.is_err() {
        // Channel closed between the cancellation check and the send —
        // the buffer was already moved into the channel, so there is
        // nothing left to release; the worker's own teardown drains and
        // releases whatever is still queued.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self as wire_codec, Ipv4Header, UdpHeader};
    use crate::config::GatewayConfig;
    use crate::dns_cache::DnsCache;
    use crate::pool::BufferPool;
    use crate::tracker::FlowTracker;
    use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;

    fn test_context(cfg: GatewayConfig) -> (GatewayContext, mpsc::Receiver<crate::gateway::OutboundBatch>) {
        let (outbound, outbound_rx) = mpsc::channel(16);
        let ctx = GatewayContext {
            pool: Arc::new(BufferPool::new(cfg.mtu, 16)),
            dns_cache: Arc::new(DnsCache::new()),
            tracker: Arc::new(FlowTracker::new()),
            outbound,
            stopped: Arc::new(AtomicBool::new(false)),
            cfg,
        };
        (ctx, outbound_rx)
    }

    fn build_dns_query_wire(id: u16, local: Ipv4Addr, remote: Ipv4Addr, local_port: u16, remote_port: u16) -> Vec<u8> {
        let mut msg = Message::new();
        let mut header = Header::new();
        header.set_message_type(MessageType::Query);
        header.set_op_code(OpCode::Query);
        header.set_id(id);
        *msg.header_mut() = header;
        msg.add_query(Query::query(
            Name::from_str("example.com.").expect("name"),
            RecordType::A,
        ));
        let payload = msg.to_vec().expect("serializes");

        let checksum = wire_codec::udp_checksum(local, remote, local_port, remote_port, &payload);
        let udp = UdpHeader {
            src_port: local_port,
            dst_port: remote_port,
            length: (8 + payload.len()) as u16,
            checksum,
        };
        let ip = Ipv4Header {
            identification: 1,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: wire_codec::PROTO_UDP,
            src: local,
            dst: remote,
        };
        let mut buf = vec![0u8; 20 + 8 + payload.len()];
        wire_codec::serialize_ipv4(&ip, &mut buf, (8 + payload.len()) as u16);
        wire_codec::serialize_udp(&udp, &mut buf[20..]);
        buf[28..].copy_from_slice(&payload);
        buf
    }

    fn build_dns_response(id: u16, ttl: u32, addr: Ipv4Addr) -> Vec<u8> {
        let mut msg = Message::new();
        let mut header = Header::new();
        header.set_message_type(MessageType::Response);
        header.set_op_code(OpCode::Query);
        header.set_response_code(ResponseCode::NoError);
        header.set_id(id);
        *msg.header_mut() = header;
        let name = Name::from_str("example.com.").expect("name");
        msg.add_query(Query::query(name.clone(), RecordType::A));
        msg.add_answer(Record::from_rdata(name, ttl, RData::A(A(addr))));
        msg.to_vec().expect("serializes")
    }

    /// Builds a `NoError` response reusing the transaction id and question
    /// from a raw request wire, standing in for a live upstream resolver.
    fn build_dns_response_for_request(request: &[u8]) -> Vec<u8> {
        let request = Message::from_vec(request).expect("parses request");
        let mut msg = Message::new();
        let mut header = Header::new();
        header.set_message_type(MessageType::Response);
        header.set_op_code(OpCode::Query);
        header.set_response_code(ResponseCode::NoError);
        header.set_id(request.id());
        *msg.header_mut() = header;
        let question = request.queries().first().expect("has question").clone();
        let name = question.name().clone();
        msg.add_query(question);
        msg.add_answer(Record::from_rdata(name, 300, RData::A(A(Ipv4Addr::new(93, 184, 216, 34)))));
        msg.to_vec().expect("serializes")
    }

    #[tokio::test]
    async fn dns_cache_hit_enqueues_synthesized_response() {
        let (ctx, mut outbound_rx) = test_context(GatewayConfig::default());
        let local = Ipv4Addr::new(10, 0, 0, 5);
        let remote = Ipv4Addr::new(8, 8, 8, 8);

        ctx.dns_cache
            .store(&build_dns_response(1, 300, Ipv4Addr::new(93, 184, 216, 34)));

        let wire = build_dns_query_wire(42, local, remote, 5353, 53);
        handle(&wire, &ctx).await;

        let batch = outbound_rx.try_recv().expect("response enqueued");
        let response = batch.first().expect("batch has a primary envelope");
        assert_eq!(response.ip.src, remote);
        assert_eq!(response.ip.dst, local);
        assert_eq!(response.udp.dst_port, 5353);

        let parsed = Message::from_vec(response.udp_payload()).expect("parses");
        assert_eq!(parsed.id(), 42);

        // A cache hit is answered directly; no flow is created for it.
        assert!(ctx.tracker.is_empty());
    }

    #[tokio::test]
    async fn dns_cache_miss_forwards_query_through_a_flow_and_populates_the_cache() {
        // §4.7 step 1 only sets `done` on a *hit*; a miss must fall through
        // to step 3 and actually reach a relay, not get dropped in place.
        let relay = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.expect("bind loopback relay");
        let relay_port = relay.local_addr().expect("addr").port();

        let mut cfg = GatewayConfig::default();
        cfg.dns_port = relay_port; // stand in for port 53 without a privileged bind
        let (ctx, mut outbound_rx) = test_context(cfg);

        let local = Ipv4Addr::new(10, 0, 0, 5);
        let remote = Ipv4Addr::LOCALHOST;

        let responder = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (n, peer) = relay.recv_from(&mut buf).await.expect("recv query");
            let response = build_dns_response_for_request(&buf[..n]);
            relay.send_to(&response, peer).await.expect("send response");
        });

        let wire = build_dns_query_wire(55, local, remote, 5353, relay_port);
        handle(&wire, &ctx).await;

        // The miss must have created a flow immediately, synchronously
        // within `handle` — not dropped the packet in place.
        assert_eq!(ctx.tracker.len(), 1);
        assert!(outbound_rx.try_recv().is_err());

        responder.await.expect("responder task panicked");

        let batch = tokio::time::timeout(std::time::Duration::from_secs(1), outbound_rx.recv())
            .await
            .expect("response synthesized before timeout")
            .expect("outbound channel open");
        let response = batch.first().expect("batch has a primary envelope");
        assert_eq!(response.ip.src, remote);
        assert_eq!(response.ip.dst, local);
        assert_eq!(response.udp.dst_port, 5353);
        let parsed = Message::from_vec(response.udp_payload()).expect("parses");
        assert_eq!(parsed.id(), 55);

        assert_eq!(ctx.dns_cache.len(), 1);

        // DNS flows are one-shot: the worker tears itself down right after
        // relaying the single response.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !ctx.tracker.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("flow tears down after its one-shot dns response");
    }

    #[tokio::test]
    async fn non_dns_udp_is_dropped_without_creating_a_flow() {
        let (ctx, mut outbound_rx) = test_context(GatewayConfig::default());
        let local = Ipv4Addr::new(10, 0, 0, 5);
        let remote = Ipv4Addr::new(8, 8, 8, 8);
        let payload = b"not dns";

        let checksum = wire_codec::udp_checksum(local, remote, 40000, 1234, payload);
        let udp = UdpHeader {
            src_port: 40000,
            dst_port: 1234,
            length: (8 + payload.len()) as u16,
            checksum,
        };
        let ip = Ipv4Header {
            identification: 1,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: wire_codec::PROTO_UDP,
            src: local,
            dst: remote,
        };
        let mut buf = vec![0u8; 28 + payload.len()];
        wire_codec::serialize_ipv4(&ip, &mut buf, (8 + payload.len()) as u16);
        wire_codec::serialize_udp(&udp, &mut buf[20..]);
        buf[28..].copy_from_slice(payload);

        handle(&buf, &ctx).await;

        assert!(outbound_rx.try_recv().is_err());
        assert!(ctx.tracker.is_empty());
    }

    #[tokio::test]
    async fn malformed_datagram_is_dropped_without_panicking() {
        let (ctx, mut outbound_rx) = test_context(GatewayConfig::default());
        handle(&[0u8; 4], &ctx).await;
        assert!(outbound_rx.try_recv().is_err());
    }
}
