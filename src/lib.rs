//! Userspace layer-3 gateway core: bridges a TUN interface to a SOCKS
//! relay, scoped to UDP packet forwarding, IPv4 response synthesis, and a
//! DNS answer cache.
//!
//! This crate does not own a TUN device or a SOCKS client — those are
//! external collaborators an embedder supplies. What it owns is the path
//! in between: parse what arrived from TUN ([`ingress`]), track and relay
//! each UDP flow ([`tracker`], [`worker`]), cache DNS answers
//! ([`dns_cache`]), and synthesize wire-ready responses back toward TUN
//! ([`synth`]). [`Gateway`] wires all of it together behind one handle.

pub mod codec;
pub mod config;
pub mod dns_cache;
pub mod envelope;
pub mod error;
pub mod gateway;
pub mod ingress;
pub mod pool;
pub mod synth;
pub mod tracker;
pub mod worker;

pub use config::GatewayConfig;
pub use envelope::UdpEnvelope;
pub use error::{PacketError, RelayError};
pub use gateway::{Gateway, GatewayContext};
