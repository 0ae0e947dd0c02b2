//! Resolver behaviour straight against the store, no sockets.

use super::*;
use crate::enums::Rcode;
use crate::error::SableError;
use crate::resolver::{self, Resolution};

#[tokio::test]
async fn test_unknown_name_is_not_local() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    let result = resolver::resolve(&pool, "www.somewhere.net", RecordType::A, 0)
        .await
        .expect("resolve failed");
    assert!(matches!(result, Resolution::NotLocal));
}

#[tokio::test]
async fn test_apex_soa_query() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    let result = resolver::resolve(&pool, "example.com", RecordType::SOA, 0)
        .await
        .expect("resolve failed");
    let Resolution::Authoritative(auth) = result else {
        panic!("expected an authoritative answer");
    };
    assert_eq!(auth.rcode, Rcode::NoError);
    assert!(auth.aa);
    assert_eq!(auth.answers.len(), 1);
    assert_eq!(auth.answers[0].name, "example.com");
}

#[tokio::test]
async fn test_closest_enclosing_zone_wins() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    // a deeper zone shadowing part of example.com
    sqlx::query(
        "INSERT INTO soa (id, origin, ns, mbox, serial, refresh, retry, expire, minimum, ttl, active, xfer) \
         VALUES (2, 'deep.example.com', 'ns1.deep.example.com', 'hostmaster.deep.example.com', 7, 28800, 7200, 604800, 600, 3600, 1, '')",
    )
    .execute(&pool)
    .await
    .expect("insert deep zone");
    insert_rr(&pool, 2, "www", "A", "198.51.100.1", 0, 120, 1, 7).await;

    let result = resolver::resolve(&pool, "www.deep.example.com", RecordType::A, 0)
        .await
        .expect("resolve failed");
    let Resolution::Authoritative(auth) = result else {
        panic!("expected an authoritative answer");
    };
    assert_eq!(auth.zone.origin, "deep.example.com");
    assert_eq!(auth.answers.len(), 1);
}

#[tokio::test]
async fn test_cname_loop_gives_servfail_kind() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    insert_rr(&pool, 1, "ping", "CNAME", "pong.example.com", 0, 60, 1, 42).await;
    insert_rr(&pool, 1, "pong", "CNAME", "ping.example.com", 0, 60, 1, 42).await;

    let result = resolver::resolve(&pool, "ping.example.com", RecordType::A, 0).await;
    assert!(matches!(result, Err(SableError::CnameLoop)));
}

#[tokio::test]
async fn test_cname_to_other_local_zone() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    sqlx::query(
        "INSERT INTO soa (id, origin, ns, mbox, serial, refresh, retry, expire, minimum, ttl, active, xfer) \
         VALUES (2, 'example.org', 'ns1.example.org', 'hostmaster.example.org', 3, 28800, 7200, 604800, 600, 3600, 1, '')",
    )
    .execute(&pool)
    .await
    .expect("insert second zone");
    insert_rr(&pool, 2, "target", "A", "198.51.100.9", 0, 60, 1, 3).await;
    insert_rr(&pool, 1, "hop", "CNAME", "target.example.org", 0, 60, 1, 42).await;

    let result = resolver::resolve(&pool, "hop.example.com", RecordType::A, 0)
        .await
        .expect("resolve failed");
    let Resolution::Authoritative(auth) = result else {
        panic!("expected an authoritative answer");
    };
    assert_eq!(auth.answers.len(), 2, "CNAME plus the cross-zone A");
    assert_eq!(auth.answers[1].name, "target.example.org");
}

#[tokio::test]
async fn test_inactive_zone_is_invisible() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    sqlx::query("UPDATE soa SET active = 0 WHERE id = 1")
        .execute(&pool)
        .await
        .expect("deactivate");
    let result = resolver::resolve(&pool, "www.example.com", RecordType::A, 0)
        .await
        .expect("resolve failed");
    assert!(matches!(result, Resolution::NotLocal));
}

#[tokio::test]
async fn test_tombstoned_rows_do_not_answer() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    insert_rr(&pool, 1, "ghost", "A", "203.0.113.66", 0, 300, 0, 43).await;
    let result = resolver::resolve(&pool, "ghost.example.com", RecordType::A, 0)
        .await
        .expect("resolve failed");
    let Resolution::Authoritative(auth) = result else {
        panic!("expected an authoritative answer");
    };
    assert_eq!(auth.rcode, Rcode::NameError, "deleted rows don't exist");
}
