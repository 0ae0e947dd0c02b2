//! Request-surface access control. Rules load from the `access_control`
//! table ordered by ascending priority; the first CIDR match decides.

use crate::db::AclRow;
use crate::enums::{AclAction, AclSurface};
use ipnet::IpNet;
use log::warn;
use std::net::IpAddr;

#[derive(Clone, Debug)]
pub struct AclRule {
    pub surface: AclSurface,
    pub net: IpNet,
    pub action: AclAction,
    pub priority: i64,
}

#[derive(Clone, Debug, Default)]
pub struct AccessControl {
    /// Kept sorted by ascending priority; ties keep store order
    rules: Vec<AclRule>,
}

impl AccessControl {
    /// Builds the rule list from store rows. Country and ASN rule types
    /// need the geo sidecar the admin plane owns, so they're skipped here
    /// with a warning rather than silently matching nothing.
    pub fn from_rows(rows: &[AclRow]) -> Self {
        let mut rules: Vec<AclRule> = vec![];
        for row in rows {
            match row.rule_type.as_str() {
                "ip" | "network" => {}
                other => {
                    warn!("ACL rule type {other:?} is not evaluated in the query engine, skipping");
                    continue;
                }
            }
            let net: IpNet = match row.value.parse() {
                Ok(value) => value,
                // bare addresses are a /32 or /128
                Err(_) => match row.value.parse::<IpAddr>() {
                    Ok(addr) => IpNet::from(addr),
                    Err(err) => {
                        warn!("Skipping unparseable ACL value {:?}: {err:?}", row.value);
                        continue;
                    }
                },
            };
            rules.push(AclRule {
                surface: AclSurface::from(row.target.as_str()),
                net,
                action: AclAction::from(row.action.as_str()),
                priority: row.priority,
            });
        }
        rules.sort_by_key(|r| r.priority);
        AccessControl { rules }
    }

    /// First matching rule by ascending priority decides; no match falls to
    /// the surface default.
    pub fn decide(&self, surface: AclSurface, client: IpAddr) -> AclAction {
        for rule in &self.rules {
            if rule.surface == surface && rule.net.contains(&client) {
                return rule.action;
            }
        }
        match surface.default_allow() {
            true => AclAction::Allow,
            false => AclAction::Deny,
        }
    }

    pub fn allows(&self, surface: AclSurface, client: IpAddr) -> bool {
        self.decide(surface, client) == AclAction::Allow
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Zone transfer lists live on the `soa.xfer` column as a comma separated
/// CIDR list. An empty list means the zone is never handed out.
pub fn xfer_list_allows(xfer: &str, client: IpAddr) -> bool {
    for entry in xfer.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry == "*" {
            return true;
        }
        if let Ok(net) = entry.parse::<IpNet>() {
            if net.contains(&client) {
                return true;
            }
            continue;
        }
        if let Ok(addr) = entry.parse::<IpAddr>() {
            if addr == client {
                return true;
            }
        }
    }
    false
}
