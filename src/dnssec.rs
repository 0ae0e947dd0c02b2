//! DNSSEC response assembly. The signing pipeline writes RRSIG/NSEC3/key
//! rows into the store; this module only decodes and serves them, guarded
//! by the global flag, the per-zone flag and the client's DO bit.

use crate::db::{self, DnssecKeyRow, Nsec3Row, RrsigRow, SoaRow, SqlPool};
use crate::enums::RecordType;
use crate::error::SableError;
use crate::message::{Reply, ReplyRecord};
use crate::resourcerecord::{DomainName, InternalResourceRecord};
use crate::zones;
use base64::Engine;
use log::warn;

/// How many signatures we'll attach per RRset.
pub const RRSIG_CAP: i64 = 4;
/// How many NSEC3 rows an NXDOMAIN proof may carry.
pub const NSEC3_CAP: i64 = 8;
/// DNSKEY flag bits: zone key, and zone key + SEP for KSK/CSK material.
const DNSKEY_FLAGS_ZSK: u16 = 256;
const DNSKEY_FLAGS_SEP: u16 = 257;

/// All base64 fields in the store come through here.
pub fn decode64(input: &str) -> Result<Vec<u8>, SableError> {
    base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|e| SableError::InvalidName(format!("bad base64 in store: {e:?}")))
}

/// All hex fields in the store come through here.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, SableError> {
    match input.trim() {
        // the conventional spelling of an empty salt
        "-" | "" => Ok(vec![]),
        trimmed => hex::decode(trimmed)
            .map_err(|e| SableError::InvalidName(format!("bad hex in store: {e:?}"))),
    }
}

fn rrsig_record(row: &RrsigRow) -> Result<InternalResourceRecord, SableError> {
    Ok(InternalResourceRecord::RRSIG {
        type_covered: RecordType::from(row.rrtype.as_str()) as u16,
        algorithm: row.algorithm as u8,
        labels: row.labels as u8,
        original_ttl: row.original_ttl as u32,
        expiration: row.signature_expiration as u32,
        inception: row.signature_inception as u32,
        key_tag: row.key_tag as u16,
        signer: DomainName::from(row.signer_name.as_str()),
        signature: decode64(&row.signature)?,
        ttl: row.original_ttl as u32,
    })
}

fn dnskey_record(row: &DnssecKeyRow, ttl: u32) -> Result<InternalResourceRecord, SableError> {
    let flags = match row.key_type.as_str() {
        "KSK" | "CSK" => DNSKEY_FLAGS_SEP,
        _ => DNSKEY_FLAGS_ZSK,
    };
    Ok(InternalResourceRecord::DNSKEY {
        flags,
        protocol: 3,
        algorithm: row.algorithm as u8,
        public_key: decode64(&row.public_key)?,
        ttl,
    })
}

fn nsec3_record(row: &Nsec3Row, ttl: u32) -> Result<InternalResourceRecord, SableError> {
    let types: Vec<RecordType> = row
        .types
        .split_whitespace()
        .map(RecordType::from)
        .filter(|t| !matches!(t, RecordType::InvalidType))
        .collect();
    Ok(InternalResourceRecord::NSEC3 {
        hash_algorithm: row.hash_algorithm as u8,
        flags: row.flags as u8,
        iterations: row.iterations as u16,
        salt: decode_hex(&row.salt)?,
        next_hash: decode_hex(&row.next_hash)?,
        types,
        ttl,
    })
}

/// Fetch the unexpired signatures covering one RRset and convert them,
/// dropping rows that fail to decode rather than failing the reply.
async fn signatures_for(
    pool: &SqlPool,
    zone: &SoaRow,
    owner: &str,
    rrtype: RecordType,
    now: i64,
) -> Result<Vec<ReplyRecord>, SableError> {
    let relative = zones::relative_name(owner, &zone.origin);
    let rows = db::rrsigs_for(pool, zone.id, &relative, rrtype, now, RRSIG_CAP).await?;
    let mut out = vec![];
    for row in rows {
        match rrsig_record(&row) {
            Ok(record) => out.push(ReplyRecord::new(owner, record)),
            Err(err) => warn!(
                "Skipping undecodable RRSIG for {owner}/{rrtype} (key tag {}): {err}",
                row.key_tag
            ),
        }
    }
    Ok(out)
}

/// The distinct (owner, type) RRsets in a section, in first-seen order.
fn rrsets(records: &[ReplyRecord]) -> Vec<(String, RecordType)> {
    let mut seen: Vec<(String, RecordType)> = vec![];
    for entry in records {
        let key = (entry.name.clone(), RecordType::from(&entry.record));
        if !seen.contains(&key) {
            seen.push(key);
        }
    }
    seen
}

/// Attach DNSSEC records to an assembled reply. `global_enabled` is the
/// server switch; the zone's own flag and the DO bit complete the gate.
pub async fn augment_reply(
    pool: &SqlPool,
    reply: &mut Reply,
    zone: &SoaRow,
    qtype: RecordType,
    global_enabled: bool,
    do_bit: bool,
    nxdomain: bool,
    now: i64,
) -> Result<(), SableError> {
    if !global_enabled || !do_bit {
        return Ok(());
    }
    if !db::zone_dnssec_enabled(pool, zone.id).await? {
        return Ok(());
    }

    // a DNSKEY query pulls the key material itself
    if qtype == RecordType::DNSKEY {
        let key_ttl = zone.ttl as u32;
        for row in db::dnssec_keys_active(pool, zone.id).await? {
            match dnskey_record(&row, key_ttl) {
                Ok(record) => reply
                    .answers
                    .push(ReplyRecord::new(zone.origin.clone(), record)),
                Err(err) => warn!(
                    "Skipping undecodable DNSKEY for zone {} (key tag {}): {err}",
                    zone.origin, row.key_tag
                ),
            }
        }
    }

    // sign every RRset already present, section by section
    let mut extra_answers = vec![];
    for (owner, rrtype) in rrsets(&reply.answers) {
        extra_answers.extend(signatures_for(pool, zone, &owner, rrtype, now).await?);
    }
    reply.answers.extend(extra_answers);

    let mut extra_authorities = vec![];
    for (owner, rrtype) in rrsets(&reply.authorities) {
        extra_authorities.extend(signatures_for(pool, zone, &owner, rrtype, now).await?);
    }
    reply.authorities.extend(extra_authorities);

    // authenticated denial: precomputed NSEC3 chain entries plus the SOA's
    // signature ride in AUTHORITY
    if nxdomain {
        let nsec3_ttl = zone.minimum as u32;
        for row in db::nsec3_rows(pool, zone.id, NSEC3_CAP).await? {
            let owner = format!("{}.{}", row.hash.to_lowercase(), zone.origin);
            match nsec3_record(&row, nsec3_ttl) {
                Ok(record) => reply.authorities.push(ReplyRecord::new(owner, record)),
                Err(err) => warn!(
                    "Skipping undecodable NSEC3 row for zone {}: {err}",
                    zone.origin
                ),
            }
        }
    }

    Ok(())
}
