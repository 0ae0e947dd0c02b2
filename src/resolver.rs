//! Authoritative resolution against the zone store: exact lookups, CNAME
//! chasing, referrals with glue, wildcard synthesis and the NXDOMAIN/NODATA
//! split. The forwarder handles everything outside our zones.

use crate::db::{self, RrRow, SoaRow, SqlPool};
use crate::enums::{Rcode, RecordType};
use crate::error::SableError;
use crate::message::ReplyRecord;
use crate::resourcerecord::InternalResourceRecord;
use crate::zones::{self, absolute_name};
use crate::MAX_CNAME_CHAIN;
use log::{debug, warn};

/// A finished authoritative answer, ready for DNSSEC augmentation and
/// encoding.
#[derive(Clone, Debug)]
pub struct Authoritative {
    pub zone: SoaRow,
    pub rcode: Rcode,
    /// Referrals leave AA clear
    pub aa: bool,
    pub nxdomain: bool,
    pub answers: Vec<ReplyRecord>,
    pub authorities: Vec<ReplyRecord>,
    pub additionals: Vec<ReplyRecord>,
}

#[derive(Clone, Debug)]
pub enum Resolution {
    Authoritative(Box<Authoritative>),
    /// No local zone encloses the name; recursion or REFUSED
    NotLocal,
}

/// Convert store rows, dropping the ones that don't parse instead of
/// failing the whole reply.
fn rows_to_records(rows: &[RrRow]) -> Vec<InternalResourceRecord> {
    rows.iter()
        .filter_map(|row| match InternalResourceRecord::try_from(row) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("Dropping rr id={} from reply: {err}", row.id);
                None
            }
        })
        .collect()
}

/// Orders an RRset for the wire: MX by preference, SRV by priority then
/// weight, address records rotated by `rotate` for round-robin spread.
fn order_rrset(mut records: Vec<InternalResourceRecord>, rotate: usize) -> Vec<InternalResourceRecord> {
    if records.len() < 2 {
        return records;
    }
    let rotatable = records
        .iter()
        .all(|r| r.is_type(RecordType::A) || r.is_type(RecordType::AAAA));
    if rotatable {
        let len = records.len();
        records.rotate_left(rotate % len);
        return records;
    }
    records.sort_by_key(|r| r.sort_key());
    records
}

/// A and AAAA glue for one target name, if we're authoritative for it.
async fn glue_for(
    pool: &SqlPool,
    target: &str,
    rotate: usize,
) -> Result<Vec<ReplyRecord>, SableError> {
    let mut out = vec![];
    if let Some((zone, relative)) = zones::find_closest_zone(pool, target).await? {
        for rrtype in [RecordType::A, RecordType::AAAA] {
            let rows = db::records_exact(pool, zone.id, &relative, rrtype).await?;
            for record in order_rrset(rows_to_records(&rows), rotate) {
                out.push(ReplyRecord::new(target, record));
            }
        }
    }
    Ok(out)
}

/// For every NS, MX and SRV target already in the reply, resolve A/AAAA
/// within the local zones and append to ADDITIONAL.
async fn populate_additionals(
    pool: &SqlPool,
    answers: &[ReplyRecord],
    authorities: &[ReplyRecord],
    rotate: usize,
) -> Result<Vec<ReplyRecord>, SableError> {
    let mut targets: Vec<String> = vec![];
    for entry in answers.iter().chain(authorities.iter()) {
        if let Some(target) = entry.record.glue_target() {
            if !targets.iter().any(|t| t == target) {
                targets.push(target.to_string());
            }
        }
    }
    let mut additionals = vec![];
    for target in targets {
        additionals.extend(glue_for(pool, &target, rotate).await?);
    }
    Ok(additionals)
}

/// Walks the candidate wildcard owners for `relative`, nearest first:
/// `a.b.c` tries `*.b.c`, `*.c`, `*`.
fn wildcard_candidates(relative: &str) -> Vec<String> {
    let mut out = vec![];
    if relative.is_empty() {
        return out;
    }
    let labels: Vec<&str> = relative.split('.').collect();
    for skip in 1..labels.len() {
        out.push(format!("*.{}", labels[skip..].join(".")));
    }
    out.push("*".to_string());
    out
}

/// The names strictly between the apex and the query name where a
/// delegation could hang. Nearest the query first so the deepest subzone
/// wins; includes the query name itself for NS sets below the apex.
fn delegation_candidates(relative: &str) -> Vec<String> {
    let mut out = vec![];
    if relative.is_empty() {
        return out;
    }
    let labels: Vec<&str> = relative.split('.').collect();
    for skip in 0..labels.len() {
        out.push(labels[skip..].join("."));
    }
    out
}

/// Resolve one question against the zone store. `rotate` feeds the
/// round-robin ordering of address RRsets.
pub async fn resolve(
    pool: &SqlPool,
    qname: &str,
    qtype: RecordType,
    rotate: usize,
) -> Result<Resolution, SableError> {
    let mut current = qname.to_string();
    let mut chain = 0usize;
    let mut answers: Vec<ReplyRecord> = vec![];
    let mut authorities: Vec<ReplyRecord> = vec![];
    let mut outcome: Option<(SoaRow, Rcode, bool, bool)> = None; // (zone, rcode, aa, nxdomain)

    'chase: loop {
        let Some((zone, relative)) = zones::find_closest_zone(pool, &current).await? else {
            if answers.is_empty() {
                return Ok(Resolution::NotLocal);
            }
            // a CNAME led outside our zones; serve what we have and let the
            // client chase the rest
            debug!("CNAME target {current} is outside local zones, stopping chase");
            break 'chase;
        };

        // the apex SOA lives in the soa table, not in rr
        if relative.is_empty() && matches!(qtype, RecordType::SOA | RecordType::ANY) {
            answers.push(ReplyRecord::new(zone.origin.clone(), zone.soa_record(false)));
            if qtype == RecordType::SOA {
                outcome = Some((zone, Rcode::NoError, true, false));
                break 'chase;
            }
        }

        // step 3: exact (zone, name, type) lookup
        let rows = db::records_exact(pool, zone.id, &relative, qtype).await?;
        let records = order_rrset(rows_to_records(&rows), rotate);
        if !records.is_empty() {
            for record in records {
                answers.push(ReplyRecord::new(current.clone(), record));
            }
            outcome = Some((zone, Rcode::NoError, true, false));
            break 'chase;
        }

        // step 4: CNAME at the name restarts the resolve at its target
        if !matches!(qtype, RecordType::CNAME | RecordType::ANY) {
            let cname_rows = db::records_exact(pool, zone.id, &relative, RecordType::CNAME).await?;
            if let Some(cname) = rows_to_records(&cname_rows).into_iter().next() {
                let target = match &cname {
                    InternalResourceRecord::CNAME { cname, .. } => cname.name.clone(),
                    _ => unreachable!("CNAME lookup returned a non-CNAME"),
                };
                answers.push(ReplyRecord::new(current.clone(), cname));
                chain += 1;
                if chain > MAX_CNAME_CHAIN {
                    return Err(SableError::CnameLoop);
                }
                current = target;
                continue 'chase;
            }
        }

        // step 5: a delegated subzone answers with a referral, AA clear
        if qtype != RecordType::NS {
            for candidate in delegation_candidates(&relative) {
                let ns_rows = db::records_exact(pool, zone.id, &candidate, RecordType::NS).await?;
                let ns_records = rows_to_records(&ns_rows);
                if !ns_records.is_empty() {
                    let owner = absolute_name(&candidate, &zone.origin);
                    for record in ns_records {
                        authorities.push(ReplyRecord::new(owner.clone(), record));
                    }
                    outcome = Some((zone, Rcode::NoError, false, false));
                    break 'chase;
                }
            }
        }

        // step 6: wildcard walk toward the apex, first match wins
        let mut matched_wildcard = false;
        for candidate in wildcard_candidates(&relative) {
            let rows = db::records_exact(pool, zone.id, &candidate, qtype).await?;
            let records = order_rrset(rows_to_records(&rows), rotate);
            if !records.is_empty() {
                // wildcard answers wear the query name as owner
                for record in records {
                    answers.push(ReplyRecord::new(current.clone(), record));
                }
                matched_wildcard = true;
                break;
            }
        }
        if matched_wildcard {
            outcome = Some((zone, Rcode::NoError, true, false));
            break 'chase;
        }

        // step 7: NXDOMAIN if the name is nowhere in the zone, NODATA if it
        // exists without the requested type; the SOA rides in AUTHORITY
        // (unless an ANY answer already carries it)
        let exists = db::name_exists(pool, zone.id, &relative).await?;
        if !(qtype == RecordType::ANY && !answers.is_empty()) {
            authorities.push(ReplyRecord::new(zone.origin.clone(), zone.soa_record(true)));
        }
        let rcode = match exists || !answers.is_empty() {
            true => Rcode::NoError,
            false => Rcode::NameError,
        };
        let nxdomain = rcode == Rcode::NameError;
        outcome = Some((zone, rcode, true, nxdomain));
        break 'chase;
    }

    let (zone, rcode, aa, nxdomain) = match outcome {
        Some(value) => value,
        // a chase that ran out of local zones mid-way
        None => match zones::find_closest_zone(pool, qname).await? {
            Some((zone, _)) => (zone, Rcode::NoError, true, false),
            None => return Ok(Resolution::NotLocal),
        },
    };

    let additionals = populate_additionals(pool, &answers, &authorities, rotate).await?;

    Ok(Resolution::Authoritative(Box::new(Authoritative {
        zone,
        rcode,
        aa,
        nxdomain,
        answers,
        authorities,
        additionals,
    })))
}
