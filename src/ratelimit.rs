//! Per-client sliding-window rate limiting. Crossing the window maximum
//! answers REFUSED; the table sweeps itself so one-shot clients don't
//! accumulate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Stale entries are swept this often.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug)]
struct RateEntry {
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_queries: u32,
    entries: HashMap<IpAddr, RateEntry>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_queries: u32) -> Self {
        RateLimiter {
            window,
            max_queries,
            entries: HashMap::new(),
        }
    }

    /// Counts the query and says whether it may proceed. The boundary query
    /// that starts a fresh window always passes.
    pub fn check(&mut self, client: IpAddr, now: Instant) -> bool {
        let entry = self.entries.entry(client).or_insert(RateEntry {
            window_start: now,
            count: 0,
            last_seen: now,
        });
        if now.duration_since(entry.window_start) >= self.window {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count += 1;
        entry.last_seen = now;
        entry.count <= self.max_queries
    }

    /// Drop clients not seen for two window widths.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let cutoff = self.window * 2;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) < cutoff);
        before - self.entries.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries.len()
    }
}
