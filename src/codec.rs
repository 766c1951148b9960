//! IPv4/UDP packet codec (spec.md §4.2).
//!
//! This crate is specified to treat packet parsing/serialization as an
//! external collaborator, but since no TUN/codec collaborator ships in this
//! workspace it is implemented here so the whole pipeline is independently
//! testable. Checksum and header-layout routines are grounded in
//! `oathgate-net`'s `Ipv4Header` and `BitRipple-Inc/tunnel_inserter`'s
//! pseudo-header checksum; the MF flag is modeled as a named `bool` field
//! (REDESIGN FLAGS: don't pack flags into a raw byte at the struct level).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};

use crate::error::PacketError;

pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const PROTO_UDP: u8 = 17;

/// Parsed (or about-to-be-serialized) IPv4 header fields.
///
/// `version` and IHL are not carried as fields: every header this crate
/// serializes has no options (IHL fixed at 5); on parse, the caller only
/// ever needs the header length to locate the payload, which [`parse_ipv4`]
/// returns directly as a payload slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub identification: u16,
    pub more_fragments: bool,
    /// Fragment offset in 8-byte units, per RFC 791.
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

/// Parses an IPv4 header from `bytes`, returning the header and a slice of
/// `bytes` containing everything after the header (options included, if
/// any — the transport-layer view, not yet UDP-specific).
pub fn parse_ipv4(bytes: &[u8]) -> Result<(Ipv4Header, &[u8]), PacketError> {
    if bytes.len() < IPV4_HEADER_LEN {
        return Err(PacketError::Truncated {
            need: IPV4_HEADER_LEN,
            have: bytes.len(),
        });
    }

    let version = bytes[0] >> 4;
    if version != 4 {
        return Err(PacketError::InvalidField("version"));
    }

    let ihl = bytes[0] & 0x0F;
    if ihl < 5 {
        return Err(PacketError::InvalidField("ihl"));
    }
    let header_len = usize::from(ihl) * 4;
    if bytes.len() < header_len {
        return Err(PacketError::Truncated {
            need: header_len,
            have: bytes.len(),
        });
    }

    let total_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if total_length > bytes.len() {
        return Err(PacketError::LengthMismatch {
            declared: total_length,
            actual: bytes.len(),
        });
    }

    let identification = u16::from_be_bytes([bytes[4], bytes[5]]);
    let flags_frag = u16::from_be_bytes([bytes[6], bytes[7]]);
    let more_fragments = flags_frag & 0x2000 != 0;
    let fragment_offset = flags_frag & 0x1FFF;
    let ttl = bytes[8];
    let protocol = bytes[9];
    let src = Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]);
    let dst = Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]);

    let header = Ipv4Header {
        identification,
        more_fragments,
        fragment_offset,
        ttl,
        protocol,
        src,
        dst,
    };
    Ok((header, &bytes[header_len..total_length]))
}

/// Parses a UDP header from `bytes`, returning the header and the payload
/// slice that follows it.
pub fn parse_udp(bytes: &[u8]) -> Result<(UdpHeader, &[u8]), PacketError> {
    if bytes.len() < UDP_HEADER_LEN {
        return Err(PacketError::Truncated {
            need: UDP_HEADER_LEN,
            have: bytes.len(),
        });
    }

    let src_port = u16::from_be_bytes([bytes[0], bytes[1]]);
    let dst_port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let length = u16::from_be_bytes([bytes[4], bytes[5]]);
    let checksum = u16::from_be_bytes([bytes[6], bytes[7]]);

    if usize::from(length) > bytes.len() {
        return Err(PacketError::LengthMismatch {
            declared: usize::from(length),
            actual: bytes.len(),
        });
    }

    let header = UdpHeader {
        src_port,
        dst_port,
        length,
        checksum,
    };
    Ok((header, &bytes[UDP_HEADER_LEN..usize::from(length).max(UDP_HEADER_LEN)]))
}

/// Writes a 20-byte IPv4 header into `dst[0..20]`. `contained_length` is the
/// number of bytes following the header that are *actually transmitted in
/// this datagram* — for a fragment that may be less than the full payload
/// (spec.md §4.3: the IPv4 total-length/checksum count only transmitted
/// bytes).
pub fn serialize_ipv4(hdr: &Ipv4Header, dst: &mut [u8], contained_length: u16) {
    debug_assert!(dst.len() >= IPV4_HEADER_LEN);

    let total_length = IPV4_HEADER_LEN as u16 + contained_length;
    let flags_frag = (u16::from(hdr.more_fragments) << 13) | (hdr.fragment_offset & 0x1FFF);

    dst[0] = (4 << 4) | 5;
    dst[1] = 0;
    dst[2..4].copy_from_slice(&total_length.to_be_bytes());
    dst[4..6].copy_from_slice(&hdr.identification.to_be_bytes());
    dst[6..8].copy_from_slice(&flags_frag.to_be_bytes());
    dst[8] = hdr.ttl;
    dst[9] = hdr.protocol;
    dst[10..12].copy_from_slice(&[0, 0]);
    dst[12..16].copy_from_slice(&hdr.src.octets());
    dst[16..20].copy_from_slice(&hdr.dst.octets());

    let csum = checksum16(&dst[..IPV4_HEADER_LEN]);
    dst[10..12].copy_from_slice(&csum.to_be_bytes());
}

/// Writes an 8-byte UDP header into `dst[0..8]`. `checksum` must already be
/// computed (typically via [`udp_checksum`]) since it covers the full
/// original payload even when this particular datagram only carries the
/// first fragment of it.
pub fn serialize_udp(hdr: &UdpHeader, dst: &mut [u8]) {
    debug_assert!(dst.len() >= UDP_HEADER_LEN);
    dst[0..2].copy_from_slice(&hdr.src_port.to_be_bytes());
    dst[2..4].copy_from_slice(&hdr.dst_port.to_be_bytes());
    dst[4..6].copy_from_slice(&hdr.length.to_be_bytes());
    dst[6..8].copy_from_slice(&hdr.checksum.to_be_bytes());
}

/// Writes the 12-byte IPv4 pseudo-header used by the UDP checksum.
pub fn write_pseudo_header(dst: &mut [u8], src: Ipv4Addr, dst_ip: Ipv4Addr, protocol: u8, length: u16) {
    debug_assert!(dst.len() >= 12);
    dst[0..4].copy_from_slice(&src.octets());
    dst[4..8].copy_from_slice(&dst_ip.octets());
    dst[8] = 0;
    dst[9] = protocol;
    dst[10..12].copy_from_slice(&length.to_be_bytes());
}

/// Computes the UDP checksum over the pseudo-header, UDP header (with its
/// checksum field zeroed), and the full payload. Per RFC 768, a computed
/// value of zero is transmitted as all-ones (zero means "no checksum").
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> u16 {
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;

    let mut pseudo = [0u8; 12];
    write_pseudo_header(&mut pseudo, src, dst, PROTO_UDP, udp_len);

    let mut header = [0u8; UDP_HEADER_LEN];
    header[0..2].copy_from_slice(&src_port.to_be_bytes());
    header[2..4].copy_from_slice(&dst_port.to_be_bytes());
    header[4..6].copy_from_slice(&udp_len.to_be_bytes());
    // checksum field left zero

    let sum = checksum16_parts(&[&pseudo, &header, payload]);
    if sum == 0 {
        0xFFFF
    } else {
        sum
    }
}

/// The next process-wide IPv4 identification value, wrapping on overflow.
pub fn next_ipid() -> u16 {
    static COUNTER: AtomicU16 = AtomicU16::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Internet one's-complement checksum (RFC 1071) over a single buffer.
pub fn checksum16(data: &[u8]) -> u16 {
    checksum16_parts(&[data])
}

/// Internet one's-complement checksum over the concatenation of several
/// buffers, without needing to actually concatenate them.
fn checksum16_parts(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut carry: Option<u8> = None;

    for part in parts {
        let mut chunk = *part;
        if let Some(hi) = carry.take() {
            if let Some((&lo, rest)) = chunk.split_first() {
                sum += u32::from(u16::from_be_bytes([hi, lo]));
                chunk = rest;
            } else {
                carry = Some(hi);
                continue;
            }
        }
        while chunk.len() >= 2 {
            sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
            chunk = &chunk[2..];
        }
        if let Some(&b) = chunk.first() {
            carry = Some(b);
        }
    }

    if let Some(hi) = carry {
        sum += u32::from(hi) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}
