//! Zone transfers. AXFR frames the whole zone between two copies of the
//! SOA; IXFR compares the cost of a delta against a full transfer and sends
//! whichever is smaller, in the RFC 1995 layout. The periodic garbage
//! collector expires tombstoned rows so deltas stay bounded.

use crate::acl::{AccessControl, xfer_list_allows};
use crate::db::{self, RrRow, SoaRow, SqlPool};
use crate::enums::{AclSurface, Protocol, Rcode, RecordType};
use crate::error::SableError;
use crate::message::{Message, Reply, ReplyRecord};
use crate::resourcerecord::InternalResourceRecord;
use crate::tsig::{self, TsigContext};
use crate::zones::absolute_name;
use crate::Question;
use log::{debug, info, warn};

/// The fixed framing overhead of a delta reply (two SOAs at the edges, the
/// old-SOA and new-SOA separators) versus a full transfer (the two edge
/// SOAs).
const DELTA_OVERHEAD: i64 = 4;
const FULL_OVERHEAD: i64 = 2;

/// What the decision tree picked; tests assert on this shape.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferPlan {
    /// Client is current - lone SOA
    UpToDate,
    /// Store can't produce deltas - lone SOA forces the client to AXFR
    SoaOnly,
    /// Delta would cost at least as much as the full zone
    Full,
    Delta,
}

/// Sizes both transfer shapes in record counts and picks the cheaper one.
pub fn choose_plan(
    client_serial: u32,
    zone_serial: u32,
    has_delta_columns: bool,
    deleted: i64,
    added: i64,
    full: i64,
) -> TransferPlan {
    if client_serial == zone_serial {
        return TransferPlan::UpToDate;
    }
    if !has_delta_columns {
        return TransferPlan::SoaOnly;
    }
    let delta_size = deleted + added + DELTA_OVERHEAD;
    let full_size = full + FULL_OVERHEAD;
    match delta_size >= full_size {
        true => TransferPlan::Full,
        false => TransferPlan::Delta,
    }
}

/// Pulls the client's current serial out of the IXFR request's AUTHORITY
/// SOA. Names inside the rdata may be compressed, so the parse re-reads
/// from the raw message.
pub fn client_serial(raw: &[u8], msg: &Message) -> Result<u32, SableError> {
    let soa = msg
        .authorities
        .iter()
        .find(|r| r.rrtype == RecordType::SOA)
        .ok_or_else(|| {
            SableError::MalformedTransfer("IXFR request carries no AUTHORITY SOA".to_string())
        })?;
    let (_, mname_len) = crate::utils::read_name(raw, soa.rdata_offset)?;
    let (_, rname_len) = crate::utils::read_name(raw, soa.rdata_offset + mname_len)?;
    let serial_at = soa.rdata_offset + mname_len + rname_len;
    if raw.len() < serial_at + 4 {
        return Err(SableError::MalformedTransfer("short SOA rdata".to_string()));
    }
    Ok(u32::from_be_bytes([
        raw[serial_at],
        raw[serial_at + 1],
        raw[serial_at + 2],
        raw[serial_at + 3],
    ]))
}

/// Message-shape rules for transfer requests: one question, no answers, at
/// most one authority (IXFR's SOA), and nothing in ADDITIONAL beyond
/// OPT/TSIG.
fn validate_shape(msg: &Message, qtype: RecordType) -> Result<(), SableError> {
    if msg.questions.len() != 1 {
        return Err(SableError::MultipleQuestions);
    }
    if !msg.answers.is_empty() {
        return Err(SableError::MalformedTransfer(
            "transfer request with answers".to_string(),
        ));
    }
    let authority_budget = match qtype {
        RecordType::IXFR => 1,
        _ => 0,
    };
    if msg.authorities.len() > authority_budget {
        return Err(SableError::MalformedTransfer(
            "unexpected AUTHORITY records".to_string(),
        ));
    }
    for record in &msg.additionals {
        if !matches!(record.rrtype, RecordType::OPT | RecordType::TSIG) {
            return Err(SableError::MalformedTransfer(format!(
                "unexpected {} in ADDITIONAL",
                record.rrtype
            )));
        }
    }
    Ok(())
}

fn rows_as_records(zone: &SoaRow, rows: &[RrRow]) -> Vec<ReplyRecord> {
    rows.iter()
        .filter_map(|row| match InternalResourceRecord::try_from(row) {
            Ok(record) => Some(ReplyRecord::new(
                absolute_name(&row.name, &zone.origin),
                record,
            )),
            Err(err) => {
                warn!("Dropping rr id={} from transfer: {err}", row.id);
                None
            }
        })
        .collect()
}

/// An SOA record carrying a specific serial, for the delta separators.
fn soa_with_serial(zone: &SoaRow, serial: u32) -> ReplyRecord {
    let mut record = zone.soa_record(false);
    if let InternalResourceRecord::SOA { serial: s, .. } = &mut record {
        *s = serial;
    }
    ReplyRecord::new(zone.origin.clone(), record)
}

/// Handles an IXFR or AXFR question end to end: shape checks, TSIG, the
/// transfer ACLs, then the decision tree. The TSIG context, when present,
/// comes back so the encoded reply can be signed.
pub async fn handle_transfer(
    pool: &SqlPool,
    raw: &[u8],
    msg: &Message,
    question: &Question,
    peer: std::net::IpAddr,
    acl: &AccessControl,
    protocol: Protocol,
    now: i64,
) -> Result<(Reply, Option<TsigContext>), SableError> {
    let qtype = question.qtype;
    validate_shape(msg, qtype)?;

    // full transfers don't fit a datagram
    if qtype == RecordType::AXFR && protocol == Protocol::Udp {
        return Err(SableError::MalformedTransfer(
            "AXFR requires a stream transport".to_string(),
        ));
    }

    let zone = db::zone_by_origin(pool, &question.qname)
        .await?
        .ok_or(SableError::NoAuthority)?;

    // TSIG before ACL: a signed request from a denied peer should still get
    // the NOTAUTH its bad signature earns
    let tsig_context = match msg.tsig_record() {
        Some(record) => {
            let key_row = db::tsig_key(pool, &record.name)
                .await?
                .ok_or_else(|| SableError::TsigBadKey(record.name.clone()))?;
            Some(tsig::verify_request(raw, msg, &key_row, now)?)
        }
        None => None,
    };

    let surface = match qtype {
        RecordType::IXFR => AclSurface::Ixfr,
        _ => AclSurface::Axfr,
    };
    if !acl.allows(surface, peer) || !xfer_list_allows(&zone.xfer, peer) {
        debug!("Transfer of {} refused for {peer}", zone.origin);
        return Err(SableError::AclDenied);
    }

    let mut reply = Reply::empty(&msg.header, Some(question.clone()), Rcode::NoError);
    reply.header.authoritative = true;
    // transfer replies are transaction-specific, never cached
    reply.cacheable = false;

    let plan = match qtype {
        RecordType::AXFR => TransferPlan::Full,
        _ => {
            let serial = client_serial(raw, msg)?;
            let has_delta_columns = db::rr_has_delta_columns(pool).await?;
            let (deleted, added, full) = match has_delta_columns {
                true => db::ixfr_counts(pool, zone.id, serial as i64).await?,
                false => (0, 0, 0),
            };
            let plan = choose_plan(
                serial,
                zone.serial as u32,
                has_delta_columns,
                deleted,
                added,
                full,
            );
            if plan == TransferPlan::Delta {
                let (deleted_rows, added_rows) =
                    db::ixfr_deltas(pool, zone.id, serial as i64).await?;
                // RFC 1995: current SOA, old SOA, deletions, new SOA,
                // additions, current SOA
                reply.answers.push(soa_with_serial(&zone, zone.serial as u32));
                reply.answers.push(soa_with_serial(&zone, serial));
                reply.answers.extend(rows_as_records(&zone, &deleted_rows));
                reply.answers.push(soa_with_serial(&zone, zone.serial as u32));
                reply.answers.extend(rows_as_records(&zone, &added_rows));
                reply.answers.push(soa_with_serial(&zone, zone.serial as u32));
                info!(
                    "IXFR {} for {peer}: delta {} deletes / {} adds (serial {serial} -> {})",
                    zone.origin,
                    deleted_rows.len(),
                    added_rows.len(),
                    zone.serial
                );
            }
            plan
        }
    };

    match plan {
        TransferPlan::UpToDate | TransferPlan::SoaOnly => {
            reply.answers.push(soa_with_serial(&zone, zone.serial as u32));
        }
        TransferPlan::Full => {
            let rows = db::zone_records_active(pool, zone.id).await?;
            reply.answers.push(soa_with_serial(&zone, zone.serial as u32));
            reply.answers.extend(rows_as_records(&zone, &rows));
            reply.answers.push(soa_with_serial(&zone, zone.serial as u32));
            info!(
                "{qtype} {} for {peer}: full transfer, {} records",
                zone.origin,
                rows.len()
            );
        }
        TransferPlan::Delta => {}
    }

    Ok((reply, tsig_context))
}

/// The periodic tombstone collector. Never runs on the request path.
pub async fn run_gc(pool: &SqlPool, now: i64) -> Result<u64, SableError> {
    let removed = db::expire_deleted_rows(pool, now).await?;
    if removed > 0 {
        info!("Transfer GC expired {removed} tombstoned rows");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_up_to_date() {
        assert_eq!(choose_plan(42, 42, true, 5, 5, 100), TransferPlan::UpToDate);
    }

    #[test]
    fn test_plan_without_delta_columns() {
        assert_eq!(choose_plan(40, 42, false, 0, 0, 0), TransferPlan::SoaOnly);
    }

    #[test]
    fn test_plan_prefers_small_delta() {
        // delta = 2 + 3 + 4 = 9, full = 100 + 2 = 102
        assert_eq!(choose_plan(40, 42, true, 2, 3, 100), TransferPlan::Delta);
    }

    #[test]
    fn test_plan_falls_back_to_full_when_delta_is_big() {
        // delta = 60 + 60 + 4 = 124, full = 100 + 2 = 102
        assert_eq!(choose_plan(40, 42, true, 60, 60, 100), TransferPlan::Full);
        // the boundary: equal cost goes to full
        assert_eq!(choose_plan(40, 42, true, 49, 49, 100), TransferPlan::Full);
    }
}
