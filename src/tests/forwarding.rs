//! Forwarder behaviour against a scripted upstream on loopback: happy
//! path, bailiwick rejection, the recursion gate and reply caching.

use super::*;
use crate::enums::{PacketType, Rcode};
use crate::message::{Message, Reply, ReplyRecord};
use crate::resourcerecord::InternalResourceRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Clone, Copy)]
enum UpstreamScript {
    /// Answer every query with one in-tree A record
    Honest,
    /// Attach an ADDITIONAL A for a name far outside the bailiwick
    Poisoned,
    /// Never answer at all
    Silent,
}

/// A scripted resolver on an ephemeral loopback port.
async fn scripted_upstream(script: UpstreamScript, hits: Arc<AtomicUsize>) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = socket.local_addr().expect("addr");
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            hits.fetch_add(1, Ordering::SeqCst);
            if matches!(script, UpstreamScript::Silent) {
                continue;
            }
            let Ok(query) = Message::parse(&buf[0..len]) else {
                continue;
            };
            let Some(question) = query.question().cloned() else {
                continue;
            };
            let mut reply = Reply::empty(&query.header, Some(question.clone()), Rcode::NoError);
            reply.header.recursion_available = true;
            reply.answers.push(ReplyRecord::new(
                question.qname.clone(),
                InternalResourceRecord::A {
                    address: 0xc6336407, // 198.51.100.7
                    ttl: 60,
                },
            ));
            if matches!(script, UpstreamScript::Poisoned) {
                reply.additionals.push(ReplyRecord::new(
                    "evil.attacker.tld",
                    InternalResourceRecord::A {
                        address: 0x7f000001,
                        ttl: 60,
                    },
                ));
            }
            let Ok(bytes) = reply.as_bytes(512) else {
                continue;
            };
            let _ = socket.send_to(&bytes, peer).await;
        }
    });
    addr
}

fn forwarding_config(upstream: SocketAddr) -> ConfigFile {
    let mut config = test_config();
    config.upstream_servers = vec![upstream.to_string()];
    config.forward_timeout_ms = 200;
    config.forward_retries = 2;
    config
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forwarded_answer_restores_client_id() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    allow_recursion(&pool).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = scripted_upstream(UpstreamScript::Honest, hits.clone()).await;
    let (server, _tx) = spawn_engine(forwarding_config(upstream), pool).await;

    let query = build_query(0xbeef, "far.other-zone.net", RecordType::A, true, None);
    let reply = udp_roundtrip(server, &query).await;
    let msg = Message::parse(&reply).expect("reply must parse");

    assert_eq!(msg.header.id, 0xbeef, "client id restored over the internal id");
    assert_eq!(msg.header.qr, PacketType::Answer);
    assert_eq!(msg.header.rcode, Rcode::NoError);
    assert_eq!(msg.header.ancount, 1);
    assert_eq!(msg.answers[0].rdata, vec![198, 51, 100, 7]);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forwarded_answer_is_cached() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    allow_recursion(&pool).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = scripted_upstream(UpstreamScript::Honest, hits.clone()).await;
    let (server, _tx) = spawn_engine(forwarding_config(upstream), pool).await;

    let first = udp_roundtrip(
        server,
        &build_query(0x0a0a, "cacheme.other-zone.net", RecordType::A, true, None),
    )
    .await;
    let second = udp_roundtrip(
        server,
        &build_query(0x0b0b, "cacheme.other-zone.net", RecordType::A, true, None),
    )
    .await;

    assert_eq!(&first[2..], &second[2..], "identical apart from the id");
    assert_eq!(
        hits.load(Ordering::SeqCst),
        1,
        "the second answer must come from the reply cache"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bailiwick_violation_ends_in_servfail() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    allow_recursion(&pool).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = scripted_upstream(UpstreamScript::Poisoned, hits.clone()).await;
    let (server, _tx) = spawn_engine(forwarding_config(upstream), pool).await;

    let query = build_query(0x0c0c, "bank.example.net", RecordType::A, true, None);
    let reply = udp_roundtrip(server, &query).await;
    let msg = Message::parse(&reply).expect("reply must parse");

    assert_eq!(
        msg.header.rcode,
        Rcode::ServFail,
        "a poisoned reply is dropped, never forwarded"
    );
    assert!(
        !msg
            .additionals
            .iter()
            .any(|r| r.name.contains("attacker")),
        "nothing out of bailiwick reaches the client"
    );
    assert!(
        hits.load(Ordering::SeqCst) >= 2,
        "the poisoned upstream should have been retried"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upstream_silence_ends_in_servfail() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    allow_recursion(&pool).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = scripted_upstream(UpstreamScript::Silent, hits.clone()).await;
    let (server, _tx) = spawn_engine(forwarding_config(upstream), pool).await;

    let query = build_query(0x0d0d, "quiet.other-zone.net", RecordType::A, true, None);
    let reply = udp_roundtrip(server, &query).await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert_eq!(msg.header.rcode, Rcode::ServFail);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recursion_needs_the_acl() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    // no recursion allow-rule seeded: the restrictive default applies
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = scripted_upstream(UpstreamScript::Honest, hits.clone()).await;
    let (server, _tx) = spawn_engine(forwarding_config(upstream), pool).await;

    let query = build_query(0x0e0e, "far.other-zone.net", RecordType::A, true, None);
    let reply = udp_roundtrip(server, &query).await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert_eq!(msg.header.rcode, Rcode::Refused);
    assert_eq!(hits.load(Ordering::SeqCst), 0, "nothing may reach the upstream");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rd_clear_is_not_forwarded() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    allow_recursion(&pool).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = scripted_upstream(UpstreamScript::Honest, hits.clone()).await;
    let (server, _tx) = spawn_engine(forwarding_config(upstream), pool).await;

    let query = build_query(0x0f0f, "far.other-zone.net", RecordType::A, false, None);
    let reply = udp_roundtrip(server, &query).await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert_eq!(msg.header.rcode, Rcode::Refused);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_zones_never_forward() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    allow_recursion(&pool).await;
    let hits = Arc::new(AtomicUsize::new(0));
    let upstream = scripted_upstream(UpstreamScript::Honest, hits.clone()).await;
    let (server, _tx) = spawn_engine(forwarding_config(upstream), pool).await;

    // RD set, but the name is ours: answer locally, authoritative
    let query = build_query(0x1010, "www.example.com", RecordType::A, true, None);
    let reply = udp_roundtrip(server, &query).await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert!(msg.header.authoritative);
    assert_eq!(msg.answers[0].rdata, vec![203, 0, 113, 5]);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}
