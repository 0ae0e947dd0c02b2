//! The encoded-reply cache. A hit copies the stored bytes and stamps the
//! caller's transaction id and RD bit over them, so two identical queries
//! inside the window differ only in id.

use crate::enums::{RecordClass, RecordType};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct CacheKey {
    /// Lowercased query name
    pub qname: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

#[derive(Clone, Debug)]
struct CachedReply {
    body: Vec<u8>,
    expires: Instant,
}

#[derive(Debug)]
pub struct ReplyCache {
    entries: HashMap<CacheKey, CachedReply>,
    /// TTLs above this still expire here
    ttl_cap: Duration,
    enabled: bool,
}

impl ReplyCache {
    pub fn new(ttl_cap: Duration, enabled: bool) -> Self {
        ReplyCache {
            entries: HashMap::new(),
            ttl_cap,
            enabled,
        }
    }

    /// Store an encoded reply. `min_ttl` is the smallest TTL among the
    /// answered records; expiry is the smaller of that and the cap.
    pub fn insert(&mut self, key: CacheKey, body: Vec<u8>, min_ttl: u32, now: Instant) {
        if !self.enabled || body.len() < crate::HEADER_BYTES {
            return;
        }
        let ttl = Duration::from_secs(min_ttl as u64).min(self.ttl_cap);
        if ttl.is_zero() {
            return;
        }
        self.entries.insert(
            key,
            CachedReply {
                body,
                expires: now + ttl,
            },
        );
    }

    /// A copy of the cached reply re-addressed to the incoming request:
    /// its id, and its RD bit into the flags byte.
    pub fn lookup(
        &mut self,
        key: &CacheKey,
        id: u16,
        recursion_desired: bool,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let entry = self.entries.get(key)?;
        if entry.expires <= now {
            self.entries.remove(key);
            return None;
        }
        let mut body = entry.body.clone();
        body[0..2].copy_from_slice(&id.to_be_bytes());
        match recursion_desired {
            true => body[2] |= 0x01,
            false => body[2] &= !0x01,
        }
        Some(body)
    }

    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
