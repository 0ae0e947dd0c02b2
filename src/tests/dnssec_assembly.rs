//! DNSSEC response assembly: the three-way gate, RRSIG attachment, DNSKEY
//! answers and NSEC3 denial - all served from precomputed store rows.

use super::*;
use crate::enums::Rcode;
use crate::message::Message;
use base64::Engine as _;

async fn seed_dnssec(pool: &crate::db::SqlPool) {
    sqlx::query("INSERT INTO dnssec_config (zone_id, dnssec_enabled, nsec_mode) VALUES (1, 1, 'nsec3')")
        .execute(pool)
        .await
        .expect("insert dnssec_config");

    let fake_sig = base64::engine::general_purpose::STANDARD.encode([0x5a; 64]);
    let fake_key = base64::engine::general_purpose::STANDARD.encode([0x6b; 32]);

    for (name, rrtype) in [("www", "A"), ("", "SOA"), ("", "DNSKEY")] {
        sqlx::query(
            "INSERT INTO dnssec_signatures \
             (zone_id, name, type, algorithm, labels, original_ttl, signature_expiration, \
              signature_inception, key_tag, signer_name, signature) \
             VALUES (1, ?, ?, 13, 3, 300, 1800000000, 1600000000, 4711, 'example.com', ?)",
        )
        .bind(name)
        .bind(rrtype)
        .bind(&fake_sig)
        .execute(pool)
        .await
        .expect("insert signature");
    }

    sqlx::query(
        "INSERT INTO dnssec_keys (zone_id, algorithm, key_tag, key_type, public_key, active) \
         VALUES (1, 13, 4711, 'KSK', ?, 1), (1, 13, 4712, 'ZSK', ?, 1)",
    )
    .bind(&fake_key)
    .bind(&fake_key)
    .execute(pool)
    .await
    .expect("insert keys");

    sqlx::query(
        "INSERT INTO dnssec_nsec3 (zone_id, hash_algorithm, flags, iterations, salt, hash, next_hash, types) \
         VALUES (1, 1, 0, 10, 'cafe', 'p0gm30uqcnsn24', 'deadbeef', 'A TXT RRSIG')",
    )
    .execute(pool)
    .await
    .expect("insert nsec3");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_do_bit_gates_signatures() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    seed_dnssec(&pool).await;
    let mut config = test_config();
    config.dnssec_enabled = true;
    config.reply_cache_enabled = false;
    let (server, _tx) = spawn_engine(config, pool).await;

    // DO=1: signatures ride along
    let reply = udp_roundtrip(
        server,
        &build_query(0x01, "www.example.com", RecordType::A, false, Some(true)),
    )
    .await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert!(
        msg.answers.iter().any(|r| r.rrtype == RecordType::RRSIG),
        "DO=1 should attach the RRSIG"
    );

    // EDNS but DO=0: no signatures
    let reply = udp_roundtrip(
        server,
        &build_query(0x02, "www.example.com", RecordType::A, false, Some(false)),
    )
    .await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert!(!msg.answers.iter().any(|r| r.rrtype == RecordType::RRSIG));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_global_flag_gates_signatures() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    seed_dnssec(&pool).await;
    let mut config = test_config();
    config.dnssec_enabled = false;
    let (server, _tx) = spawn_engine(config, pool).await;

    let reply = udp_roundtrip(
        server,
        &build_query(0x03, "www.example.com", RecordType::A, false, Some(true)),
    )
    .await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert!(
        !msg.answers.iter().any(|r| r.rrtype == RecordType::RRSIG),
        "the global switch wins over the zone flag"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zone_flag_gates_signatures() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    // no dnssec_config row at all for the zone
    let mut config = test_config();
    config.dnssec_enabled = true;
    let (server, _tx) = spawn_engine(config, pool).await;

    let reply = udp_roundtrip(
        server,
        &build_query(0x04, "www.example.com", RecordType::A, false, Some(true)),
    )
    .await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert!(!msg.answers.iter().any(|r| r.rrtype == RecordType::RRSIG));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dnskey_answer_carries_keys_and_sig() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    seed_dnssec(&pool).await;
    let mut config = test_config();
    config.dnssec_enabled = true;
    let (server, _tx) = spawn_engine(config, pool).await;

    let reply = udp_roundtrip(
        server,
        &build_query(0x05, "example.com", RecordType::DNSKEY, false, Some(true)),
    )
    .await;
    let msg = Message::parse(&reply).expect("reply must parse");
    let dnskeys: Vec<_> = msg
        .answers
        .iter()
        .filter(|r| r.rrtype == RecordType::DNSKEY)
        .collect();
    assert_eq!(dnskeys.len(), 2);
    // flags: 257 for the KSK, 256 for the ZSK
    let mut flags: Vec<u16> = dnskeys
        .iter()
        .map(|r| u16::from_be_bytes([r.rdata[0], r.rdata[1]]))
        .collect();
    flags.sort_unstable();
    assert_eq!(flags, vec![256, 257]);
    // protocol byte is always 3
    assert!(dnskeys.iter().all(|r| r.rdata[2] == 3));
    assert!(msg.answers.iter().any(|r| r.rrtype == RecordType::RRSIG));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nxdomain_carries_nsec3_and_soa_rrsig() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    seed_dnssec(&pool).await;
    let mut config = test_config();
    config.dnssec_enabled = true;
    let (server, _tx) = spawn_engine(config, pool).await;

    let reply = udp_roundtrip(
        server,
        &build_query(0x06, "missing.example.com", RecordType::A, false, Some(true)),
    )
    .await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert_eq!(msg.header.rcode, Rcode::NameError);

    let nsec3 = msg
        .authorities
        .iter()
        .find(|r| r.rrtype == RecordType::NSEC3)
        .expect("NXDOMAIN should carry an NSEC3 proof");
    assert_eq!(nsec3.name, "p0gm30uqcnsn24.example.com");
    // rdata: alg, flags, iterations, salt-len + salt
    assert_eq!(nsec3.rdata[0], 1);
    assert_eq!(u16::from_be_bytes([nsec3.rdata[2], nsec3.rdata[3]]), 10);
    assert_eq!(nsec3.rdata[4], 2, "two salt bytes");
    assert_eq!(&nsec3.rdata[5..7], &[0xca, 0xfe]);

    assert!(
        msg.authorities.iter().any(|r| r.rrtype == RecordType::RRSIG),
        "the SOA's signature must ride along"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expired_signatures_are_not_served() {
    let pool = memory_pool().await;
    seed_zone(&pool).await;
    sqlx::query("INSERT INTO dnssec_config (zone_id, dnssec_enabled, nsec_mode) VALUES (1, 1, 'nsec3')")
        .execute(&pool)
        .await
        .expect("insert dnssec_config");
    let stale = base64::engine::general_purpose::STANDARD.encode([0x11; 64]);
    sqlx::query(
        "INSERT INTO dnssec_signatures \
         (zone_id, name, type, algorithm, labels, original_ttl, signature_expiration, \
          signature_inception, key_tag, signer_name, signature) \
         VALUES (1, 'www', 'A', 13, 3, 300, 1000000, 900000, 4711, 'example.com', ?)",
    )
    .bind(&stale)
    .execute(&pool)
    .await
    .expect("insert stale signature");

    let mut config = test_config();
    config.dnssec_enabled = true;
    let (server, _tx) = spawn_engine(config, pool).await;

    let reply = udp_roundtrip(
        server,
        &build_query(0x07, "www.example.com", RecordType::A, false, Some(true)),
    )
    .await;
    let msg = Message::parse(&reply).expect("reply must parse");
    assert!(
        !msg.answers.iter().any(|r| r.rrtype == RecordType::RRSIG),
        "expired signatures stay in the store"
    );
}
