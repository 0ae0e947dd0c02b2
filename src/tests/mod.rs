//! Scenario tests against an in-memory zone store. Each test seeds the
//! schema itself; the engine tests talk to a live loop over loopback
//! sockets.

use crate::config::ConfigFile;
use crate::db::{self, SqlPool};
use crate::engine::{Engine, EngineEvent};
use crate::enums::{RecordClass, RecordType};
use crate::{Header, Question};
use packed_struct::PackedStruct;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

mod dnssec_assembly;
mod forwarding;
mod resolution;

/// A fresh in-memory store with the schema applied.
pub(crate) async fn memory_pool() -> SqlPool {
    let pool = db::get_memory_conn().await.expect("failed to open memory store");
    db::create_tables(&pool).await.expect("failed to create tables");
    pool
}

/// The `example.com.` zone the scenarios run against: serial 42,
/// negative-TTL 1200, transfers open to loopback.
pub(crate) async fn seed_zone(pool: &SqlPool) -> i64 {
    sqlx::query(
        "INSERT INTO soa (id, origin, ns, mbox, serial, refresh, retry, expire, minimum, ttl, active, xfer) \
         VALUES (1, 'example.com', 'ns1.example.com', 'hostmaster.example.com', 42, 28800, 7200, 604800, 1200, 3600, 1, '127.0.0.0/8')",
    )
    .execute(pool)
    .await
    .expect("failed to insert soa");

    let rows: Vec<(&str, &str, &str, i64, i64)> = vec![
        ("", "NS", "ns1.example.com", 0, 3600),
        ("ns1", "A", "203.0.113.53", 0, 3600),
        ("www", "A", "203.0.113.5", 0, 300),
        ("alias", "CNAME", "www.example.com", 0, 300),
        ("mail", "MX", "mx1.example.com", 10, 300),
        ("mail", "MX", "mx2.example.com", 20, 300),
        ("mx1", "A", "203.0.113.25", 0, 300),
        ("mx2", "A", "203.0.113.26", 0, 300),
        ("txt", "TXT", "hello world", 0, 300),
        ("sub", "NS", "ns.sub.example.com", 0, 3600),
        ("ns.sub", "A", "203.0.113.54", 0, 3600),
        ("*.w", "A", "203.0.113.77", 0, 300),
        ("_sip._tcp", "SRV", "5 5060 sip.example.com", 10, 300),
        ("sip", "A", "203.0.113.60", 0, 300),
    ];
    for (name, rrtype, data, aux, ttl) in rows {
        insert_rr(pool, 1, name, rrtype, data, aux, ttl, 1, 42).await;
    }
    1
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn insert_rr(
    pool: &SqlPool,
    zone: i64,
    name: &str,
    rrtype: &str,
    data: &str,
    aux: i64,
    ttl: i64,
    active: i64,
    serial: i64,
) {
    sqlx::query(
        "INSERT INTO rr (zone, name, type, data, aux, ttl, active, stamp, serial) \
         VALUES (?, ?, ?, ?, ?, ?, ?, strftime('%s','now'), ?)",
    )
    .bind(zone)
    .bind(name)
    .bind(rrtype)
    .bind(data)
    .bind(aux)
    .bind(ttl)
    .bind(active)
    .bind(serial)
    .execute(pool)
    .await
    .expect("failed to insert rr");
}

pub(crate) async fn allow_recursion(pool: &SqlPool) {
    sqlx::query(
        "INSERT INTO access_control (target, type, value, action, priority, enabled) \
         VALUES ('recursion', 'network', '127.0.0.0/8', 'allow', 10, 1)",
    )
    .execute(pool)
    .await
    .expect("failed to insert acl row");
}

/// Raw wire query bytes the way a stub resolver would build them.
pub(crate) fn build_query(
    id: u16,
    qname: &str,
    qtype: RecordType,
    recursion_desired: bool,
    edns_do: Option<bool>,
) -> Vec<u8> {
    let header = Header {
        id,
        recursion_desired,
        qdcount: 1,
        arcount: match edns_do {
            Some(_) => 1,
            None => 0,
        },
        ..Default::default()
    };
    let mut buf = header.pack().expect("failed to pack header").to_vec();
    buf.extend(
        Question {
            qname: qname.to_string(),
            qtype,
            qclass: RecordClass::Internet,
        }
        .to_bytes(),
    );
    if let Some(do_bit) = edns_do {
        buf.push(0); // root owner
        buf.extend((RecordType::OPT as u16).to_be_bytes());
        buf.extend(4096u16.to_be_bytes());
        let ttl: u32 = match do_bit {
            true => 0x8000,
            false => 0,
        };
        buf.extend(ttl.to_be_bytes());
        buf.extend(0u16.to_be_bytes());
    }
    buf
}

pub(crate) fn test_config() -> ConfigFile {
    ConfigFile {
        address: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    }
}

/// Boot an engine on ephemeral loopback ports and hand back its address
/// and event channel.
pub(crate) async fn spawn_engine(
    config: ConfigFile,
    pool: SqlPool,
) -> (SocketAddr, mpsc::Sender<EngineEvent>) {
    let (engine, event_rx) = Engine::build(config, pool)
        .await
        .expect("failed to build engine");
    let addr = engine.local_addr().expect("no local addr");
    let event_tx = engine.event_sender();
    tokio::spawn(engine.run(event_rx));
    (addr, event_tx)
}

/// One UDP round trip with a receive timeout.
pub(crate) async fn udp_roundtrip(server: SocketAddr, query: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("failed to bind client socket");
    socket
        .send_to(query, server)
        .await
        .expect("failed to send query");
    let mut buf = [0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a reply")
        .expect("recv failed");
    buf[0..len].to_vec()
}
