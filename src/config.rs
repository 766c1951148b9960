use std::time::Duration;

/// Tunable constants for the gateway (spec.md §6).
///
/// The defaults match the reference behavior exactly; callers embedding
/// this crate in a larger tun2socks binary may override any of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Maximum transmission unit in bytes. Buffers drawn from the pool and
    /// synthesized primary fragments are exactly this size.
    pub mtu: usize,
    /// Destination port that routes a flow through the DNS cache instead
    /// of (only) a relay socket.
    pub dns_port: u16,
    /// A flow with no activity in either direction for this long is torn
    /// down.
    pub idle_timeout: Duration,
    /// Timeout for the initial relay dial.
    pub relay_connect_timeout: Duration,
    /// Deadline armed on the relay socket between dial and the reader task
    /// coming up, then cleared.
    pub relay_initial_deadline: Duration,
    /// Bound on the per-flow inbound-from-TUN queue.
    pub inbound_queue_depth: usize,
    /// TTL written into synthesized IPv4 headers.
    pub ttl_default: u8,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mtu: 1500,
            dns_port: 53,
            idle_timeout: Duration::from_secs(1),
            relay_connect_timeout: Duration::from_secs(1),
            relay_initial_deadline: Duration::from_secs(10),
            inbound_queue_depth: 100,
            ttl_default: 64,
        }
    }
}

impl GatewayConfig {
    /// Bytes of IPv4 + UDP header preceding any payload (20 + 8).
    pub const fn header_len() -> usize {
        28
    }

    /// Maximum payload that fits unfragmented given this config's MTU.
    pub fn max_unfragmented_payload(&self) -> usize {
        self.mtu - Self::header_len()
    }
}
