//! The recursive forwarder: upstream server bookkeeping, the per-protocol
//! master state, internal-id correlation and bailiwick validation of what
//! comes back (CWE-350 - never trust a resolver you only met by address).

use crate::enums::{MasterState, RecordType, TimeoutSchedule};
use crate::error::SableError;
use crate::message::Message;
use crate::scheduler::TaskId;
use crate::utils::is_subdomain;
use log::{debug, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::net::tcp::OwnedWriteHalf;

/// One configured upstream resolver and its health history. Mutated only by
/// the forwarder on each transaction.
#[derive(Debug)]
pub struct Upstream {
    pub addr: SocketAddr,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
    pub last_success: Option<Instant>,
}

impl Upstream {
    pub fn new(addr: SocketAddr) -> Self {
        Upstream {
            addr,
            healthy: true,
            consecutive_failures: 0,
            last_failure: None,
            last_success: None,
        }
    }
}

/// Round-robin cursor over the upstreams with failure-aware skipping.
#[derive(Debug)]
pub struct UpstreamPool {
    pub servers: Vec<Upstream>,
    cursor: usize,
    retry_interval: Duration,
}

impl UpstreamPool {
    pub fn new(addrs: Vec<SocketAddr>, retry_interval: Duration) -> Self {
        UpstreamPool {
            servers: addrs.into_iter().map(Upstream::new).collect(),
            cursor: 0,
            retry_interval,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Picks the next upstream. Unhealthy servers are skipped until the
    /// retry interval elapses, at which point the flag clears and they get
    /// another go. With every server unhealthy the cursor's current pick is
    /// used anyway - trying beats dropping.
    pub fn select(&mut self, now: Instant) -> Option<usize> {
        if self.servers.is_empty() {
            return None;
        }
        for _ in 0..self.servers.len() {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % self.servers.len();
            let server = &mut self.servers[index];
            if !server.healthy {
                let waited_out = server
                    .last_failure
                    .map(|at| now.duration_since(at) >= self.retry_interval)
                    .unwrap_or(true);
                if !waited_out {
                    continue;
                }
                server.healthy = true;
            }
            return Some(index);
        }
        let index = self.cursor;
        self.cursor = (self.cursor + 1) % self.servers.len();
        Some(index)
    }

    pub fn mark_failed(&mut self, index: usize, now: Instant) {
        if let Some(server) = self.servers.get_mut(index) {
            server.healthy = false;
            server.consecutive_failures += 1;
            server.last_failure = Some(now);
            debug!(
                "Upstream {} marked failed ({} consecutive)",
                server.addr, server.consecutive_failures
            );
        }
    }

    pub fn mark_ok(&mut self, index: usize, now: Instant) {
        if let Some(server) = self.servers.get_mut(index) {
            server.healthy = true;
            server.consecutive_failures = 0;
            server.last_success = Some(now);
        }
    }
}

/// Retry policy for forwarded queries.
#[derive(Clone, Copy, Debug)]
pub struct ForwardPolicy {
    pub base_timeout: Duration,
    pub max_retries: u32,
    pub schedule: TimeoutSchedule,
}

impl ForwardPolicy {
    pub fn deadline_for(&self, attempt: u32, now: Instant) -> Instant {
        now + self.schedule.delay(self.base_timeout, attempt)
    }
}

/// A query in flight to an upstream, keyed by its rewritten internal id.
#[derive(Clone, Copy, Debug)]
pub struct PendingQuery {
    pub task: TaskId,
    pub upstream: usize,
    pub sent_at: Instant,
}

/// The per-protocol forwarder master. It owns its socket; the pending map
/// holds task ids - borrowed references revalidated against the live task
/// table before use. Tasks waiting on the master stay on their scheduler
/// priority queues in NEED_RECURSIVE_FWD and poll the master's state.
#[derive(Debug, Default)]
pub struct UdpMaster {
    pub socket: Option<Arc<UdpSocket>>,
    pub state: MasterState,
    pub pending: HashMap<u16, PendingQuery>,
}

#[derive(Debug, Default)]
pub struct TcpMaster {
    pub state: MasterState,
    /// Write half of the upstream stream; the read half lives in a reader
    /// task feeding frames back to the engine
    pub writer: Option<OwnedWriteHalf>,
    pub upstream: Option<usize>,
    pub pending: HashMap<u16, PendingQuery>,
}

impl TcpMaster {
    /// Drop the connection state after an error or peer reset. Pending
    /// queries stay put - their timeouts drive the retry.
    pub fn reset(&mut self) {
        self.state = MasterState::Closed;
        self.writer = None;
        self.upstream = None;
    }
}

/// Picks an internal id no other in-flight upstream query is using.
pub fn allocate_internal_id(pending: &HashMap<u16, PendingQuery>) -> u16 {
    loop {
        let id: u16 = rand::random();
        if !pending.contains_key(&id) {
            return id;
        }
    }
}

/// Stamps a transaction id over the first two bytes of a wire message.
pub fn rewrite_id(buf: &mut [u8], id: u16) {
    if buf.len() >= 2 {
        buf[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

/// Bailiwick validation of an upstream reply for the query `qname`:
/// every ANSWER CNAME/NS target and every ADDITIONAL A/AAAA owner must sit
/// inside the queried name's subtree. A reply that fails is dropped whole
/// and the upstream penalised.
pub fn bailiwick_ok(msg: &Message, qname: &str) -> bool {
    for record in &msg.answers {
        if matches!(record.rrtype, RecordType::CNAME | RecordType::NS) {
            match &record.target {
                Some(target) if is_subdomain(target, qname) => {}
                Some(target) => {
                    warn!(
                        "Bailiwick: {} target {target} escapes {qname}, rejecting reply",
                        record.rrtype
                    );
                    return false;
                }
                None => {
                    warn!("Bailiwick: unparseable {} target, rejecting reply", record.rrtype);
                    return false;
                }
            }
        }
    }
    for record in &msg.additionals {
        if matches!(record.rrtype, RecordType::A | RecordType::AAAA)
            && !is_subdomain(&record.name, qname)
        {
            warn!(
                "Bailiwick: ADDITIONAL {} for {} escapes {qname}, rejecting reply",
                record.rrtype, record.name
            );
            return false;
        }
    }
    true
}

/// Builds the raw wire query we send upstream: same question, fresh id,
/// RD set, no EDNS frills.
pub fn upstream_query(question: &crate::Question, internal_id: u16) -> Result<Vec<u8>, SableError> {
    use packed_struct::PackedStruct;
    let header = crate::Header {
        id: internal_id,
        recursion_desired: true,
        qdcount: 1,
        ..Default::default()
    };
    let mut buf: Vec<u8> = header
        .pack()
        .map_err(|e| SableError::BytePacking(format!("{e:?}")))?
        .to_vec();
    buf.extend(question.to_bytes());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::RecordClass;
    use crate::message::{Reply, ReplyRecord};
    use crate::resourcerecord::{DomainName, InternalResourceRecord};
    use crate::{Header, Question};

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, last], 53))
    }

    #[test]
    fn test_round_robin_cycles() {
        let mut pool = UpstreamPool::new(
            vec![addr(1), addr(2), addr(3)],
            Duration::from_secs(30),
        );
        let now = Instant::now();
        let picks: Vec<usize> = (0..4).filter_map(|_| pool.select(now)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_failed_upstream_is_skipped_until_interval() {
        let mut pool = UpstreamPool::new(vec![addr(1), addr(2)], Duration::from_secs(30));
        let now = Instant::now();
        assert_eq!(pool.select(now), Some(0));
        pool.mark_failed(0, now);
        // cursor wraps past the sick server
        assert_eq!(pool.select(now), Some(1));
        assert_eq!(pool.select(now + Duration::from_secs(1)), Some(1));
        // after the retry interval the flag clears and it's eligible again
        let later = now + Duration::from_secs(31);
        assert_eq!(pool.select(later), Some(0));
        assert!(pool.servers[0].healthy);
    }

    #[test]
    fn test_all_unhealthy_still_selects() {
        let mut pool = UpstreamPool::new(vec![addr(1), addr(2)], Duration::from_secs(30));
        let now = Instant::now();
        pool.mark_failed(0, now);
        pool.mark_failed(1, now);
        // better to try than to drop
        assert!(pool.select(now + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn test_failure_counters() {
        let mut pool = UpstreamPool::new(vec![addr(1)], Duration::from_secs(30));
        let now = Instant::now();
        pool.mark_failed(0, now);
        pool.mark_failed(0, now);
        assert_eq!(pool.servers[0].consecutive_failures, 2);
        pool.mark_ok(0, now);
        assert_eq!(pool.servers[0].consecutive_failures, 0);
        assert!(pool.servers[0].last_success.is_some());
    }

    #[test]
    fn test_allocate_internal_id_avoids_pending() {
        let mut pending: HashMap<u16, PendingQuery> = HashMap::new();
        let stub = PendingQuery {
            task: TaskId(1),
            upstream: 0,
            sent_at: Instant::now(),
        };
        // occupy most of the space to force collisions
        for id in 0..=u16::MAX - 16 {
            pending.insert(id, stub);
        }
        for _ in 0..32 {
            let id = allocate_internal_id(&pending);
            assert!(!pending.contains_key(&id));
        }
    }

    fn forwarded_reply(qname: &str, extra_owner: &str) -> Vec<u8> {
        let question = Question {
            qname: qname.to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let header = Header {
            id: 99,
            qdcount: 1,
            ..Default::default()
        };
        let mut reply = Reply::empty(&header, Some(question), crate::enums::Rcode::NoError);
        reply.answers.push(ReplyRecord::new(
            qname,
            InternalResourceRecord::A {
                address: 0x7f000001,
                ttl: 60,
            },
        ));
        reply.additionals.push(ReplyRecord::new(
            extra_owner,
            InternalResourceRecord::A {
                address: 0x7f000002,
                ttl: 60,
            },
        ));
        reply.as_bytes(4096).expect("encode")
    }

    #[test]
    fn test_bailiwick_accepts_in_tree_glue() {
        let raw = forwarded_reply("bank.example.net", "www.bank.example.net");
        let msg = Message::parse(&raw).expect("parse");
        assert!(bailiwick_ok(&msg, "bank.example.net"));
    }

    #[test]
    fn test_bailiwick_rejects_stray_additional() {
        let raw = forwarded_reply("bank.example.net", "evil.attacker.tld");
        let msg = Message::parse(&raw).expect("parse");
        assert!(!bailiwick_ok(&msg, "bank.example.net"));
    }

    #[test]
    fn test_bailiwick_rejects_escaping_cname() {
        let question = Question {
            qname: "bank.example.net".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let header = Header {
            id: 7,
            qdcount: 1,
            ..Default::default()
        };
        let mut reply = Reply::empty(&header, Some(question), crate::enums::Rcode::NoError);
        reply.answers.push(ReplyRecord::new(
            "bank.example.net",
            InternalResourceRecord::CNAME {
                cname: DomainName::from("phish.attacker.tld"),
                ttl: 60,
            },
        ));
        let raw = reply.as_bytes(4096).expect("encode");
        let msg = Message::parse(&raw).expect("parse");
        assert!(!bailiwick_ok(&msg, "bank.example.net"));
    }

    #[test]
    fn test_upstream_query_shape() {
        let question = Question {
            qname: "out.example.org".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let mut buf = upstream_query(&question, 0xabcd).expect("build");
        let msg = Message::parse(&buf).expect("parse");
        assert_eq!(msg.header.id, 0xabcd);
        assert!(msg.header.recursion_desired);
        assert_eq!(msg.questions[0].qname, "out.example.org");
        rewrite_id(&mut buf, 0x1111);
        assert_eq!(&buf[0..2], &[0x11, 0x11]);
    }
}
