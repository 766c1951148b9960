//! Minimal end-to-end demonstration of the gateway: primes the DNS cache
//! with a canned answer, feeds a synthetic DNS query in through the
//! ingress handler as if it had just arrived from TUN, and prints the
//! synthesized response datagram that comes back out.
//!
//! Run with `cargo run --example loopback_gateway`.

use std::net::Ipv4Addr;
use std::str::FromStr;

use anyhow::Context;
use hickory_proto::op::{Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::Level;

use udpgate::codec::{self, Ipv4Header, UdpHeader};
use udpgate::{Gateway, GatewayConfig};

fn build_dns_query(id: u16, client: Ipv4Addr, resolver: Ipv4Addr, client_port: u16) -> anyhow::Result<Vec<u8>> {
    let mut message = Message::new();
    let mut header = Header::new();
    header.set_message_type(MessageType::Query);
    header.set_op_code(OpCode::Query);
    header.set_id(id);
    *message.header_mut() = header;
    message.add_query(Query::query(Name::from_str("example.com.")?, RecordType::A));
    let dns_payload = message.to_vec().context("serialize dns query")?;

    let checksum = codec::udp_checksum(client, resolver, client_port, 53, &dns_payload);
    let udp = UdpHeader {
        src_port: client_port,
        dst_port: 53,
        length: (8 + dns_payload.len()) as u16,
        checksum,
    };
    let ip = Ipv4Header {
        identification: 1,
        more_fragments: false,
        fragment_offset: 0,
        ttl: 64,
        protocol: codec::PROTO_UDP,
        src: client,
        dst: resolver,
    };

    let mut wire = vec![0u8; 28 + dns_payload.len()];
    codec::serialize_ipv4(&ip, &mut wire, (8 + dns_payload.len()) as u16);
    codec::serialize_udp(&udp, &mut wire[20..]);
    wire[28..].copy_from_slice(&dns_payload);
    Ok(wire)
}

fn build_dns_answer(id: u16, ttl: u32, addr: Ipv4Addr) -> anyhow::Result<Vec<u8>> {
    let mut message = Message::new();
    let mut header = Header::new();
    header.set_message_type(MessageType::Response);
    header.set_op_code(OpCode::Query);
    header.set_response_code(ResponseCode::NoError);
    header.set_id(id);
    *message.header_mut() = header;
    let name = Name::from_str("example.com.")?;
    message.add_query(Query::query(name.clone(), RecordType::A));
    message.add_answer(Record::from_rdata(name, ttl, RData::A(A(addr))));
    message.to_vec().context("serialize dns answer")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber).context("set global tracing subscriber")?;

    let mut gateway = Gateway::new(GatewayConfig::default(), 16);
    let mut outbound = gateway.take_outbound().context("outbound receiver already taken")?;
    let pool = gateway.pool_handle();

    let writer = tokio::spawn(async move {
        while let Some(batch) = outbound.recv().await {
            for envelope in batch {
                tracing::info!(
                    bytes = envelope.wire().len(),
                    from = %envelope.ip.src,
                    to = %envelope.ip.dst,
                    "would write datagram to tun"
                );
                envelope.release(&pool);
            }
        }
    });

    let client = Ipv4Addr::new(10, 0, 0, 2);
    let resolver = Ipv4Addr::new(10, 0, 0, 1);

    let answer = build_dns_answer(1, 300, Ipv4Addr::new(93, 184, 216, 34))?;
    gateway.dns_cache().store(&answer);

    let query = build_dns_query(42, client, resolver, 5353)?;
    udpgate::ingress::handle(&query, &gateway.context()).await;

    gateway.stop();
    drop(gateway);
    writer.await.context("outbound writer task panicked")?;

    Ok(())
}
