use std::fmt;

/// Failures from the packet codec: parsing wire bytes or laying out a
/// synthesized datagram.
///
/// Every caller in this crate treats these as per-packet or per-flow
/// failures (spec.md §7) — none of them is ever propagated to a gateway
/// user; they are logged and the packet or flow is dropped.
#[derive(Debug)]
pub enum PacketError {
    /// Buffer shorter than a fixed-size header requires.
    Truncated { need: usize, have: usize },
    /// The IPv4 header's declared length disagrees with the buffer.
    LengthMismatch { declared: usize, actual: usize },
    /// A field outside its protocol-defined range (e.g. IHL < 5).
    InvalidField(&'static str),
    /// Payload would not fit in the destination buffer even after
    /// choosing the backward-fragmentation layout.
    PayloadTooLarge { len: usize, max: usize },
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { need, have } => {
                write!(f, "truncated packet: need {need} bytes, have {have}")
            }
            Self::LengthMismatch { declared, actual } => {
                write!(f, "length mismatch: header declares {declared}, buffer has {actual}")
            }
            Self::InvalidField(name) => write!(f, "invalid field: {name}"),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds maximum {max}")
            }
        }
    }
}

impl std::error::Error for PacketError {}

/// Failures dialing or using the relay socket for a flow.
///
/// See spec.md §7 for the disposition of each variant: all of them tear
/// down the owning flow and none of them propagate further.
#[derive(Debug)]
pub enum RelayError {
    Connect(std::io::Error),
    Bind(std::io::Error),
    Send(std::io::Error),
    Recv(std::io::Error),
    Timeout,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(err) => write!(f, "relay connect failed: {err}"),
            Self::Bind(err) => write!(f, "relay bind failed: {err}"),
            Self::Send(err) => write!(f, "relay send failed: {err}"),
            Self::Recv(err) => write!(f, "relay recv failed: {err}"),
            Self::Timeout => write!(f, "relay operation timed out"),
        }
    }
}

impl std::error::Error for RelayError {}
