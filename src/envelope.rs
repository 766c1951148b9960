//! The UDP packet envelope (spec.md §3).
//!
//! Bundles parsed IPv4/UDP header records with an owned buffer and a "wire"
//! view aliasing the relevant suffix of that buffer. Buffers drawn from the
//! [`BufferPool`](crate::pool::BufferPool) and buffers copied from an
//! oversized wire datagram are kept distinguishable so that release returns
//! pool buffers but simply drops heap buffers (spec.md §9, "Buffer
//! ownership").

use crate::codec::{self, Ipv4Header, UdpHeader, IPV4_HEADER_LEN, UDP_HEADER_LEN};
use crate::error::PacketError;
use crate::pool::{BufferPool, PoolBuffer};

enum EnvelopeBuffer {
    /// Drawn from a [`BufferPool`]; must be released back to it exactly
    /// once.
    Pooled(PoolBuffer),
    /// Allocated directly because the wire datagram exceeded MTU; dropped
    /// normally, never returned to a pool.
    Heap(Vec<u8>),
}

impl EnvelopeBuffer {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Pooled(b) => b,
            Self::Heap(b) => b,
        }
    }

}

/// A parsed-or-synthesized IPv4/UDP datagram, ready to be written to TUN or
/// inspected by a flow worker.
pub struct UdpEnvelope {
    pub ip: Ipv4Header,
    pub udp: UdpHeader,
    buffer: EnvelopeBuffer,
    wire_start: usize,
    wire_end: usize,
}

impl UdpEnvelope {
    /// Deep-copies a wire-format IPv4+UDP datagram into an envelope. Uses a
    /// pool buffer when the datagram fits within `pool`'s MTU, otherwise
    /// allocates a heap buffer sized to the datagram.
    pub fn from_wire(wire: &[u8], pool: &BufferPool) -> Result<Self, PacketError> {
        let (ip, ip_payload) = codec::parse_ipv4(wire)?;
        let (udp, _) = codec::parse_udp(ip_payload)?;

        let mtu_buf = pool.acquire();
        let buffer = if wire.len() <= mtu_buf.len() {
            let mut buf = mtu_buf;
            buf[..wire.len()].copy_from_slice(wire);
            EnvelopeBuffer::Pooled(buf)
        } else {
            pool.release(mtu_buf);
            EnvelopeBuffer::Heap(wire.to_vec())
        };

        Ok(Self {
            ip,
            udp,
            buffer,
            wire_start: 0,
            wire_end: wire.len(),
        })
    }

    /// Builds an envelope around a pool buffer that a synthesizer has
    /// already laid out in place, aliasing `buffer[wire_start..wire_end]` as
    /// the wire view.
    pub(crate) fn from_synthesized(
        ip: Ipv4Header,
        udp: UdpHeader,
        buffer: PoolBuffer,
        wire_start: usize,
        wire_end: usize,
    ) -> Self {
        Self {
            ip,
            udp,
            buffer: EnvelopeBuffer::Pooled(buffer),
            wire_start,
            wire_end,
        }
    }

    /// The complete wire-ready IPv4 datagram.
    pub fn wire(&self) -> &[u8] {
        &self.buffer.as_slice()[self.wire_start..self.wire_end]
    }

    /// The UDP payload carried in this datagram. Only the primary fragment
    /// (`fragment_offset == 0`) carries a UDP header; continuation
    /// fragments are raw payload bytes right after the IPv4 header, with no
    /// notion of a "UDP payload" slice of their own, so this returns empty
    /// for them.
    pub fn udp_payload(&self) -> &[u8] {
        if self.ip.fragment_offset != 0 {
            return &[];
        }
        let wire = self.wire();
        let offset = IPV4_HEADER_LEN + UDP_HEADER_LEN;
        if wire.len() <= offset {
            &[]
        } else {
            &wire[offset..]
        }
    }

    /// The raw bytes following the IPv4 header: for the primary fragment
    /// this is the UDP header plus its payload chunk, for a continuation
    /// fragment it is a contiguous slice of the original payload.
    pub fn ip_payload(&self) -> &[u8] {
        let wire = self.wire();
        if wire.len() <= IPV4_HEADER_LEN {
            &[]
        } else {
            &wire[IPV4_HEADER_LEN..]
        }
    }

    /// Releases the envelope's buffer exactly once: returns it to `pool` if
    /// it was drawn from one, otherwise drops it.
    pub fn release(self, pool: &BufferPool) {
        if let EnvelopeBuffer::Pooled(buf) = self.buffer {
            pool.release(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{serialize_ipv4, serialize_udp, udp_checksum, PROTO_UDP};
    use std::net::Ipv4Addr;

    fn build_wire(payload: &[u8]) -> Vec<u8> {
        let src = Ipv4Addr::new(10, 0, 0, 1);
        let dst = Ipv4Addr::new(10, 0, 0, 2);
        let checksum = udp_checksum(src, dst, 1234, 53, payload);
        let udp = UdpHeader {
            src_port: 1234,
            dst_port: 53,
            length: (UDP_HEADER_LEN + payload.len()) as u16,
            checksum,
        };
        let ip = Ipv4Header {
            identification: 7,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: PROTO_UDP,
            src,
            dst,
        };
        let mut buf = vec![0u8; IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len()];
        serialize_ipv4(&ip, &mut buf, (UDP_HEADER_LEN + payload.len()) as u16);
        serialize_udp(&udp, &mut buf[IPV4_HEADER_LEN..]);
        buf[IPV4_HEADER_LEN + UDP_HEADER_LEN..].copy_from_slice(payload);
        buf
    }

    #[test]
    fn from_wire_uses_pool_buffer_when_it_fits() {
        let pool = BufferPool::new(1500, 4);
        let wire = build_wire(b"hello");
        let env = UdpEnvelope::from_wire(&wire, &pool).expect("parses");
        assert_eq!(env.udp_payload(), b"hello");
        assert_eq!(env.wire(), wire.as_slice());
        env.release(&pool);
        assert_eq!(pool.stats().0 + pool.stats().1, 1);
    }

    #[test]
    fn from_wire_uses_heap_buffer_when_oversized() {
        let pool = BufferPool::new(16, 4);
        let wire = build_wire(&vec![0xAB; 64]);
        let env = UdpEnvelope::from_wire(&wire, &pool).expect("parses");
        assert_eq!(env.wire().len(), wire.len());
        // releasing a heap-backed envelope must not touch the pool
        let (hits_before, misses_before) = pool.stats();
        env.release(&pool);
        assert_eq!(pool.stats(), (hits_before, misses_before));
    }
}
