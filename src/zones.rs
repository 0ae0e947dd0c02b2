//! Zone location: mapping a query name onto the deepest zone of authority
//! holding it, and converting between absolute and apex-relative names.

use crate::db::{self, SoaRow, SqlPool};
use crate::error::SableError;
use crate::resourcerecord::{DomainName, InternalResourceRecord};
use log::trace;

/// Walks the label suffixes of `qname` from deepest to shallowest and
/// returns the first zone whose apex matches - the closest enclosing zone -
/// plus the query name relative to that apex.
pub async fn find_closest_zone(
    pool: &SqlPool,
    qname: &str,
) -> Result<Option<(SoaRow, String)>, SableError> {
    let labels: Vec<&str> = qname.split('.').collect();
    for skip in 0..labels.len() {
        let candidate = labels[skip..].join(".");
        if let Some(zone) = db::zone_by_origin(pool, &candidate).await? {
            let relative = relative_name(qname, &candidate);
            trace!("{qname} sits in zone {} as {relative:?}", zone.origin);
            return Ok(Some((zone, relative)));
        }
    }
    Ok(None)
}

/// The owner name relative to the zone apex; the apex itself is the empty
/// label sequence.
pub fn relative_name(qname: &str, origin: &str) -> String {
    if qname == origin {
        return String::new();
    }
    qname
        .strip_suffix(&format!(".{origin}"))
        .unwrap_or(qname)
        .to_string()
}

/// Re-attach a relative owner to its apex.
pub fn absolute_name(relative: &str, origin: &str) -> String {
    match relative.is_empty() {
        true => origin.to_string(),
        false => format!("{relative}.{origin}"),
    }
}

impl SoaRow {
    /// The SOA as a servable record, for AUTHORITY sections and transfer
    /// framing. Negative answers carry the `minimum` TTL per RFC 2308.
    pub fn soa_record(&self, negative: bool) -> InternalResourceRecord {
        let ttl = match negative {
            true => self.minimum as u32,
            false => self.ttl as u32,
        };
        InternalResourceRecord::SOA {
            mname: DomainName::from(self.ns.as_str()),
            rname: DomainName::from(self.mbox.as_str()),
            serial: self.serial as u32,
            refresh: self.refresh as u32,
            retry: self.retry as u32,
            expire: self.expire as u32,
            minimum: self.minimum as u32,
            ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_name() {
        assert_eq!(relative_name("www.example.com", "example.com"), "www");
        assert_eq!(relative_name("example.com", "example.com"), "");
        assert_eq!(
            relative_name("a.b.example.com", "example.com"),
            "a.b".to_string()
        );
    }

    #[test]
    fn test_absolute_name() {
        assert_eq!(absolute_name("www", "example.com"), "www.example.com");
        assert_eq!(absolute_name("", "example.com"), "example.com");
    }
}
