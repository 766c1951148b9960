//! Response Synthesizer (spec.md §4.3).
//!
//! Builds wire-ready IPv4(+UDP) datagrams for data flowing back toward TUN,
//! fragmenting when the payload exceeds MTU. The backward buffer-layout
//! trick (write the payload at the tail of the buffer, then the UDP header
//! immediately before it, then the IPv4 header immediately before that) is
//! spec.md's own description of the original's memory-reuse strategy;
//! ported here, with the original's scratch-pseudo-header trick replaced by
//! [`codec::udp_checksum`] computing over non-contiguous parts directly —
//! there's no need to stage the pseudo-header inside the buffer at all when
//! the checksum routine already walks multiple slices.

use std::net::Ipv4Addr;

use crate::codec::{self, Ipv4Header, UdpHeader, IPV4_HEADER_LEN, PROTO_UDP, UDP_HEADER_LEN};
use crate::config::GatewayConfig;
use crate::envelope::UdpEnvelope;
use crate::error::PacketError;
use crate::pool::BufferPool;

/// Largest payload this synthesizer will attempt to fragment. IPv4 total
/// length is a 16-bit field, so the absolute ceiling is `65535 - 28`; kept
/// here as an explicit guard rather than silently overflowing a `u16`.
pub const MAX_PAYLOAD: usize = u16::MAX as usize - IPV4_HEADER_LEN - UDP_HEADER_LEN;

/// Produces the primary envelope and, if the payload doesn't fit in a
/// single datagram, the ordered list of fragments that follow it. Callers
/// MUST submit the primary and then the fragments to TUN in that order
/// (spec.md §5: "primary+fragments must be enqueued back-to-back").
pub fn synthesize_response(
    local_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
    local_port: u16,
    remote_port: u16,
    payload: &[u8],
    cfg: &GatewayConfig,
    pool: &BufferPool,
) -> Result<(UdpEnvelope, Vec<UdpEnvelope>), PacketError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(PacketError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let header_len = GatewayConfig::header_len();
    let max_unfragmented = cfg.max_unfragmented_payload();
    let identification = codec::next_ipid();
    let checksum = codec::udp_checksum(remote_ip, local_ip, remote_port, local_port, payload);
    let udp_length = (UDP_HEADER_LEN + payload.len()) as u16;

    if payload.len() <= max_unfragmented {
        let mut buffer = pool.acquire();
        let mtu = buffer.len();
        let payload_start = mtu - payload.len();
        let udp_start = payload_start - UDP_HEADER_LEN;
        let ip_start = udp_start - IPV4_HEADER_LEN;

        buffer[payload_start..].copy_from_slice(payload);

        let udp = UdpHeader {
            src_port: remote_port,
            dst_port: local_port,
            length: udp_length,
            checksum,
        };
        codec::serialize_udp(&udp, &mut buffer[udp_start..payload_start]);

        let ip = Ipv4Header {
            identification,
            more_fragments: false,
            fragment_offset: 0,
            ttl: cfg.ttl_default,
            protocol: PROTO_UDP,
            src: remote_ip,
            dst: local_ip,
        };
        codec::serialize_ipv4(&ip, &mut buffer[ip_start..udp_start], udp_length);

        let envelope = UdpEnvelope::from_synthesized(ip, udp, buffer, ip_start, mtu);
        return Ok((envelope, Vec::new()));
    }

    // Primary fragment: forward layout, UDP header + first chunk, MF set.
    let first_chunk_len = max_unfragmented;
    let mut buffer = pool.acquire();
    buffer[header_len..header_len + first_chunk_len]
        .copy_from_slice(&payload[..first_chunk_len]);

    let udp = UdpHeader {
        src_port: remote_port,
        dst_port: local_port,
        length: udp_length,
        checksum,
    };
    codec::serialize_udp(&udp, &mut buffer[IPV4_HEADER_LEN..header_len]);

    let primary_ip = Ipv4Header {
        identification,
        more_fragments: true,
        fragment_offset: 0,
        ttl: cfg.ttl_default,
        protocol: PROTO_UDP,
        src: remote_ip,
        dst: local_ip,
    };
    let contained = (UDP_HEADER_LEN + first_chunk_len) as u16;
    codec::serialize_ipv4(&primary_ip, &mut buffer[..IPV4_HEADER_LEN], contained);

    let primary = UdpEnvelope::from_synthesized(
        primary_ip,
        udp,
        buffer,
        0,
        header_len + first_chunk_len,
    );

    // Remaining fragments: raw payload continuation, no UDP header.
    let frag_body_size = ((cfg.mtu - IPV4_HEADER_LEN) / 8) * 8;
    let offset_units_per_fragment = (frag_body_size / 8) as u16;
    let mut fragments = Vec::new();
    let mut offset_units = offset_units_per_fragment;
    let mut rest = &payload[first_chunk_len..];

    while !rest.is_empty() {
        let take = rest.len().min(frag_body_size);
        let (chunk, remainder) = rest.split_at(take);
        let is_last = remainder.is_empty();

        let mut buffer = pool.acquire();
        buffer[IPV4_HEADER_LEN..IPV4_HEADER_LEN + take].copy_from_slice(chunk);

        let frag_ip = Ipv4Header {
            identification,
            more_fragments: !is_last,
            fragment_offset: offset_units,
            ttl: cfg.ttl_default,
            protocol: PROTO_UDP,
            src: remote_ip,
            dst: local_ip,
        };
        codec::serialize_ipv4(&frag_ip, &mut buffer[..IPV4_HEADER_LEN], take as u16);

        fragments.push(UdpEnvelope::from_synthesized(
            frag_ip,
            udp,
            buffer,
            0,
            IPV4_HEADER_LEN + take,
        ));

        offset_units += offset_units_per_fragment;
        rest = remainder;
    }

    Ok((primary, fragments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::checksum16;

    fn ips() -> (Ipv4Addr, Ipv4Addr) {
        (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(203, 0, 113, 9))
    }

    #[test]
    fn fits_in_one_datagram() {
        let cfg = GatewayConfig::default();
        let pool = BufferPool::new(cfg.mtu, 8);
        let (local, remote) = ips();
        let payload = b"short dns answer";

        let (primary, fragments) =
            synthesize_response(local, remote, 5353, 53, payload, &cfg, &pool).expect("ok");

        assert!(fragments.is_empty());
        assert_eq!(primary.wire().len(), payload.len() + 28);
        assert!(!primary.ip.more_fragments);
        assert_eq!(primary.ip.fragment_offset, 0);
        assert_eq!(checksum16(&primary.wire()[..IPV4_HEADER_LEN]), 0);
        assert_eq!(primary.udp_payload(), payload);
    }

    #[test]
    fn large_payload_is_fragmented_in_order_and_covers_input() {
        let cfg = GatewayConfig::default();
        let pool = BufferPool::new(cfg.mtu, 16);
        let (local, remote) = ips();
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

        let (primary, fragments) =
            synthesize_response(local, remote, 5353, 53, &payload, &cfg, &pool).expect("ok");

        assert!(primary.ip.more_fragments);
        assert_eq!(primary.ip.fragment_offset, 0);
        assert_eq!(primary.wire().len(), cfg.mtu);

        let mut reassembled = primary.udp_payload().to_vec();
        let mut prev_offset = 0u16;
        for (idx, frag) in fragments.iter().enumerate() {
            assert!(frag.ip.fragment_offset > prev_offset);
            prev_offset = frag.ip.fragment_offset;
            let is_last = idx == fragments.len() - 1;
            assert_eq!(frag.ip.more_fragments, !is_last);
            let ip_bytes = &frag.wire()[IPV4_HEADER_LEN..];
            reassembled.extend_from_slice(ip_bytes);
        }

        assert_eq!(reassembled, payload);
        assert!(!fragments.last().expect("has fragments").ip.more_fragments);
    }

    #[test]
    fn fragment_count_matches_expected_ceiling() {
        let cfg = GatewayConfig::default();
        let pool = BufferPool::new(cfg.mtu, 16);
        let (local, remote) = ips();
        let payload = vec![7u8; 3000];

        let (_primary, fragments) =
            synthesize_response(local, remote, 1, 2, &payload, &cfg, &pool).expect("ok");

        let frag_body_size = ((cfg.mtu - IPV4_HEADER_LEN) / 8) * 8;
        let remaining = payload.len() - cfg.max_unfragmented_payload();
        let expected = remaining.div_ceil(frag_body_size);
        assert_eq!(fragments.len(), expected);
    }
}
