//! The query engine: one task owning every piece of mutable state, running
//! a cooperative loop whose unit of work is a [Task]. Each iteration
//! gathers I/O and timer events, drains the ready queues by priority, runs
//! the periodic jobs, and reaps finished tasks.

use crate::acl::AccessControl;
use crate::config::ConfigFile;
use crate::db::{self, SqlPool};
use crate::enums::{
    AclSurface, MasterState, OpCode, Protocol, Rcode, RecordClass, RecordType, TaskKind,
    TaskPriority,
};
use crate::error::SableError;
use crate::forwarder::{
    ForwardPolicy, PendingQuery, TcpMaster, UdpMaster, UpstreamPool, allocate_internal_id,
    bailiwick_ok, rewrite_id, upstream_query,
};
use crate::message::{Message, Reply, ReplyRecord, udp_budget};
use crate::ratelimit::{RateLimiter, SWEEP_INTERVAL};
use crate::replycache::{CacheKey, ReplyCache};
use crate::resolver::{self, Resolution};
use crate::resourcerecord::{DNSCharString, InternalResourceRecord};
use crate::scheduler::{
    PeriodicKind, PeriodicTask, StreamHandle, Task, TaskId, TaskQueues, TaskState,
};
use crate::tsig;
use crate::packet_dumper::{self, Leg};
use crate::utils::wire_u16;
use crate::xfer;
use crate::{Header, Question, REPLY_TIMEOUT_MS, TCP_PAYLOAD_MAX, UDP_BUFFER_SIZE};
use log::{debug, error, info, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::instrument;

/// Everything the listeners and spawned helpers feed back into the loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// A TCP client connected; a task parks in NEED_READ until its first
    /// frame completes
    StreamOpen {
        stream_id: u64,
        peer: SocketAddr,
        responder: mpsc::Sender<Vec<u8>>,
    },
    /// A complete length-prefixed frame from a client connection
    StreamFrame { stream_id: u64, bytes: Vec<u8> },
    StreamClosed { stream_id: u64 },
    /// Outcome of the TCP master's non-blocking connect
    UpstreamTcpConnected { result: std::io::Result<TcpStream> },
    /// A complete frame read off the upstream TCP stream
    UpstreamTcpFrame { bytes: Vec<u8> },
    UpstreamTcpClosed,
}

#[derive(Debug, Default)]
pub struct EngineCounters {
    pub queries: u64,
    pub cache_hits: u64,
    pub forwards: u64,
    pub refused: u64,
    pub servfail: u64,
    pub nxdomain: u64,
    pub formerr: u64,
    pub notauth: u64,
}

enum StepOutcome {
    /// Finished or parked on an event; nothing more to do this drain
    Settled,
    /// Still waiting on a master; goes back on its queue for next drain
    Requeue,
}

pub struct Engine {
    config: ConfigFile,
    pool: SqlPool,
    /// Client-facing datagram socket
    udp: Arc<UdpSocket>,
    event_tx: mpsc::Sender<EngineEvent>,
    tasks: HashMap<TaskId, Task>,
    queues: TaskQueues,
    next_task_id: u64,
    /// stream_id -> (peer, reply channel) for live client connections
    streams: HashMap<u64, (SocketAddr, mpsc::Sender<Vec<u8>>)>,
    /// stream_id -> the task parked in NEED_READ for that connection
    stream_tasks: HashMap<u64, TaskId>,
    udp_master: UdpMaster,
    tcp_master: TcpMaster,
    upstreams: UpstreamPool,
    policy: ForwardPolicy,
    acl: AccessControl,
    ratelimit: RateLimiter,
    cache: ReplyCache,
    periodics: Vec<PeriodicTask>,
    /// Round-robin cursor for address RRset rotation
    rotate: usize,
    counters: EngineCounters,
}

impl Engine {
    /// Binds the sockets, loads the ACL snapshot and schedules the
    /// periodic jobs. Failure to bind or to reach the store is fatal.
    pub async fn build(
        config: ConfigFile,
        pool: SqlPool,
    ) -> Result<(Engine, mpsc::Receiver<EngineEvent>), SableError> {
        let udp = Arc::new(UdpSocket::bind(config.dns_listener_address()?).await?);
        info!("Started UDP listener on {}", udp.local_addr()?);

        let mut udp_master = UdpMaster::default();
        let upstream_addrs = config.upstream_addrs()?;
        if !upstream_addrs.is_empty() {
            let bind_addr = match upstream_addrs[0] {
                SocketAddr::V4(_) => "0.0.0.0:0",
                SocketAddr::V6(_) => "[::]:0",
            };
            udp_master.socket = Some(Arc::new(UdpSocket::bind(bind_addr).await?));
            udp_master.state = MasterState::Connected;
            info!("Forwarding enabled, upstreams: {upstream_addrs:?}");
        }

        let acl = AccessControl::from_rows(&db::acl_rows(&pool).await?);
        if acl.is_empty() {
            debug!("No ACL rules loaded; surface defaults apply");
        }

        let now = Instant::now();
        let periodics = vec![
            PeriodicTask::new(
                PeriodicKind::IxfrGc,
                Duration::from_secs(config.ixfr_gc_interval),
                now,
            ),
            PeriodicTask::new(PeriodicKind::RateSweep, SWEEP_INTERVAL, now),
            PeriodicTask::new(PeriodicKind::CachePrune, Duration::from_secs(60), now),
            PeriodicTask::new(PeriodicKind::Stats, Duration::from_secs(300), now),
        ];

        let (event_tx, event_rx) = mpsc::channel(1024);

        let engine = Engine {
            upstreams: UpstreamPool::new(
                upstream_addrs,
                Duration::from_secs(config.upstream_retry_interval),
            ),
            policy: config.forward_policy(),
            ratelimit: RateLimiter::new(
                Duration::from_secs(config.rate_limit_window),
                config.rate_limit_max,
            ),
            cache: ReplyCache::new(
                Duration::from_secs(config.reply_cache_ttl_cap),
                config.reply_cache_enabled,
            ),
            config,
            pool,
            udp,
            event_tx,
            tasks: HashMap::new(),
            queues: TaskQueues::default(),
            next_task_id: 1,
            streams: HashMap::new(),
            stream_tasks: HashMap::new(),
            udp_master,
            tcp_master: TcpMaster::default(),
            acl,
            periodics,
            rotate: 0,
            counters: EngineCounters::default(),
        };
        Ok((engine, event_rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SableError> {
        Ok(self.udp.local_addr()?)
    }

    pub fn event_sender(&self) -> mpsc::Sender<EngineEvent> {
        self.event_tx.clone()
    }

    fn alloc_task_id(&mut self) -> TaskId {
        let id = TaskId(self.next_task_id);
        self.next_task_id += 1;
        id
    }

    /// The reply size budget for one task's transport.
    fn budget_for(&self, task: &Task) -> usize {
        match task.protocol {
            Protocol::Tcp => TCP_PAYLOAD_MAX,
            Protocol::Udp => udp_budget(task.edns.as_ref(), self.config.udp_payload_cap as usize),
        }
    }

    /// The single-threaded cooperative loop.
    #[instrument(level = "info", skip_all)]
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<EngineEvent>,
    ) -> Result<(), SableError> {
        let mut client_buf = [0u8; UDP_BUFFER_SIZE];
        let mut upstream_buf = [0u8; UDP_BUFFER_SIZE];
        loop {
            let now = Instant::now();
            let deadline = tokio::time::Instant::from_std(self.next_deadline(now));
            let udp = self.udp.clone();
            let master_socket = self.udp_master.socket.clone();

            tokio::select! {
                result = udp.recv_from(&mut client_buf) => {
                    match result {
                        Ok((len, peer)) => self.accept_datagram(client_buf[0..len].to_vec(), peer),
                        Err(err) => error!("Error receiving datagram: {err:?}"),
                    }
                }
                result = async {
                    match &master_socket {
                        Some(socket) => socket.recv_from(&mut upstream_buf).await,
                        None => std::future::pending::<std::io::Result<(usize, SocketAddr)>>().await,
                    }
                } => {
                    match result {
                        Ok((len, source)) => {
                            self.handle_upstream_reply(
                                upstream_buf[0..len].to_vec(),
                                Some(source),
                                false,
                            );
                        }
                        Err(err) => warn!("Error receiving from upstream socket: {err:?}"),
                    }
                }
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event),
                        None => {
                            info!("Event channel closed, engine shutting down");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {}
            }

            self.drain_ready().await;
            self.run_periodics().await;
            self.check_task_timeouts();
            self.reap();
        }
        Ok(())
    }

    fn accept_datagram(&mut self, bytes: Vec<u8>, peer: SocketAddr) {
        trace!("{} bytes received from {peer:?}", bytes.len());
        self.counters.queries += 1;
        let id = self.alloc_task_id();
        let now = Instant::now();
        let task = Task::new(
            id,
            Protocol::Udp,
            peer,
            TaskState::NeedQuestion { raw: bytes },
            now + Duration::from_millis(REPLY_TIMEOUT_MS),
        );
        self.tasks.insert(id, task);
        self.queues.push(TaskPriority::Normal, id);
    }

    fn handle_event(&mut self, event: EngineEvent) {
        let now = Instant::now();
        match event {
            EngineEvent::StreamOpen {
                stream_id,
                peer,
                responder,
            } => {
                self.streams.insert(stream_id, (peer, responder.clone()));
                let id = self.alloc_task_id();
                let mut task = Task::new(
                    id,
                    Protocol::Tcp,
                    peer,
                    TaskState::NeedRead,
                    now + Duration::from_secs(self.config.tcp_client_timeout),
                );
                task.stream = Some(StreamHandle {
                    stream_id,
                    responder,
                });
                self.tasks.insert(id, task);
                self.stream_tasks.insert(stream_id, id);
            }
            EngineEvent::StreamFrame { stream_id, bytes } => {
                let Some((peer, responder)) = self.streams.get(&stream_id).cloned() else {
                    debug!("Frame for unknown stream {stream_id}, dropping");
                    return;
                };
                self.counters.queries += 1;
                let deadline = now + Duration::from_millis(REPLY_TIMEOUT_MS);
                // the first frame wakes the parked NEED_READ task; pipelined
                // frames each get a task of their own
                let id = match self.stream_tasks.remove(&stream_id) {
                    Some(id) if self.tasks.contains_key(&id) => {
                        if let Some(task) = self.tasks.get_mut(&id) {
                            task.kind = TaskKind::Normal;
                            task.transition(TaskState::NeedQuestion { raw: bytes }, deadline);
                        }
                        id
                    }
                    _ => {
                        let id = self.alloc_task_id();
                        let mut task = Task::new(
                            id,
                            Protocol::Tcp,
                            peer,
                            TaskState::NeedQuestion { raw: bytes },
                            deadline,
                        );
                        task.stream = Some(StreamHandle {
                            stream_id,
                            responder,
                        });
                        self.tasks.insert(id, task);
                        id
                    }
                };
                self.queues.push(TaskPriority::Normal, id);
            }
            EngineEvent::StreamClosed { stream_id } => {
                self.streams.remove(&stream_id);
                if let Some(id) = self.stream_tasks.remove(&stream_id) {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        // a client that never sent a full frame
                        task.transition(TaskState::NeedCleanup, now);
                    }
                }
            }
            EngineEvent::UpstreamTcpConnected { result } => match result {
                Ok(stream) => {
                    let (mut reader, writer) = stream.into_split();
                    self.tcp_master.writer = Some(writer);
                    self.tcp_master.state = MasterState::Connected;
                    debug!("TCP master connected to upstream");
                    let tx = self.event_tx.clone();
                    tokio::spawn(async move {
                        loop {
                            let len = match reader.read_u16().await {
                                Ok(value) => value as usize,
                                Err(_) => break,
                            };
                            let mut buf = vec![0u8; len];
                            if reader.read_exact(&mut buf).await.is_err() {
                                break;
                            }
                            if tx
                                .send(EngineEvent::UpstreamTcpFrame { bytes: buf })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        let _ = tx.send(EngineEvent::UpstreamTcpClosed).await;
                    });
                }
                Err(err) => {
                    warn!("TCP master connect failed: {err:?}");
                    if let Some(index) = self.tcp_master.upstream {
                        self.upstreams.mark_failed(index, now);
                    }
                    self.tcp_master.reset();
                }
            },
            EngineEvent::UpstreamTcpFrame { bytes } => {
                self.handle_upstream_reply(bytes, None, true);
            }
            EngineEvent::UpstreamTcpClosed => {
                debug!("TCP master connection closed");
                self.tcp_master.reset();
            }
        }
    }

    /// Drain the ready queues high to low, running each task once. Tasks
    /// still waiting on a master go back for the next iteration.
    async fn drain_ready(&mut self) {
        let mut requeue: Vec<TaskId> = vec![];
        while let Some(id) = self.queues.pop_next() {
            if let StepOutcome::Requeue = self.step_task(id).await {
                requeue.push(id);
            }
        }
        for id in requeue {
            if let Some(task) = self.tasks.get(&id) {
                self.queues.push(task.priority, id);
            }
        }
    }

    /// Advance one task through its state machine until it completes or
    /// parks on an event.
    async fn step_task(&mut self, id: TaskId) -> StepOutcome {
        let Some(mut task) = self.tasks.remove(&id) else {
            return StepOutcome::Settled;
        };
        let outcome = loop {
            match &task.state {
                TaskState::NeedRead => break StepOutcome::Settled,
                TaskState::NeedQuestion { .. } => {
                    if let Err(err) = self.stage_question(&mut task).await {
                        self.error_reply(&mut task, &err);
                    }
                }
                TaskState::NeedAnswer { .. } => {
                    if let Err(err) = self.stage_answer(&mut task).await {
                        self.error_reply(&mut task, &err);
                    }
                }
                TaskState::NeedRecursiveFwd => {
                    let now = Instant::now();
                    let wants_tcp = task.fwd_tcp || task.protocol == Protocol::Tcp;
                    let ready = match wants_tcp {
                        true => self.tcp_master.state == MasterState::Connected,
                        false => self.udp_master.state == MasterState::Connected,
                    };
                    match ready {
                        true => task.transition(
                            TaskState::NeedRecursiveFwdWrite,
                            self.policy.deadline_for(task.retries + 1, now),
                        ),
                        false => {
                            if wants_tcp {
                                self.start_tcp_connect(now);
                            }
                            break StepOutcome::Requeue;
                        }
                    }
                }
                TaskState::NeedRecursiveFwdWrite => match self.forward_send(&mut task).await {
                    Ok(true) => break StepOutcome::Settled,
                    Ok(false) => break StepOutcome::Requeue,
                    Err(err) => self.error_reply(&mut task, &err),
                },
                TaskState::NeedRecursiveFwdRetry { .. } => break StepOutcome::Settled,
                TaskState::NeedWrite { .. } => {
                    let TaskState::NeedWrite { bytes } =
                        std::mem::replace(&mut task.state, TaskState::NeedCleanup)
                    else {
                        unreachable!("state checked in match arm");
                    };
                    self.send_reply(&mut task, bytes).await;
                }
                TaskState::NeedCleanup => break StepOutcome::Settled,
            }
        };
        if !matches!(task.state, TaskState::NeedCleanup) {
            self.tasks.insert(id, task);
        }
        outcome
    }

    /// Parse + guards: decode, ACL, opcode gate, rate limit, CHAOS beacon,
    /// reply-cache lookup. Leaves the task in NEED_ANSWER or NEED_WRITE.
    async fn stage_question(&mut self, task: &mut Task) -> Result<(), SableError> {
        let TaskState::NeedQuestion { raw } =
            std::mem::replace(&mut task.state, TaskState::NeedCleanup)
        else {
            return Err(SableError::Send("stage_question on wrong state".to_string()));
        };
        if let Some(id) = wire_u16(&raw, 0) {
            task.client_id = id;
        }
        if self.config.capture_packets {
            tokio::spawn(packet_dumper::capture(
                raw.clone(),
                Leg::Query,
                task.peer,
                task.client_id,
            ));
        }

        let msg = Message::parse(&raw)?;
        task.client_id = msg.header.id;
        task.client_header = Some(msg.header.clone());
        task.edns = msg.edns;

        if msg.header.qdcount != 1 {
            return Err(SableError::MultipleQuestions);
        }
        let question = msg.questions[0].clone();
        crate::utils::normalise_name(&question.qname)?;
        task.question = Some(question.clone());
        trace!("task {:?} question: {question}", task.id);

        if !self.acl.allows(AclSurface::Query, task.peer.ip()) {
            return Err(SableError::AclDenied);
        }

        match msg.header.opcode {
            OpCode::Query => {}
            OpCode::Notify => {
                return self.notify_ack(task, &msg);
            }
            other => return Err(SableError::OpcodeNotImplemented(other as u8)),
        }

        if !self.ratelimit.check(task.peer.ip(), Instant::now()) {
            return Err(SableError::RateLimited);
        }

        if question.qclass == RecordClass::Chaos {
            return self.chaos_reply(task, &question);
        }

        if !question.qtype.supported() && !question.qtype.is_transfer() {
            return Err(SableError::TypeNotImplemented);
        }

        // the cache only ever holds plain, unsigned lookups
        let cache_eligible = question.qclass == RecordClass::Internet
            && !question.qtype.is_transfer()
            && msg.tsig_record().is_none();
        if cache_eligible {
            let key = CacheKey {
                qname: question.qname.clone(),
                qtype: question.qtype,
                qclass: question.qclass,
            };
            if let Some(bytes) = self.cache.lookup(
                &key,
                task.client_id,
                msg.header.recursion_desired,
                Instant::now(),
            ) {
                trace!("Reply cache hit for {question}");
                self.counters.cache_hits += 1;
                task.cacheable = false;
                task.transition(
                    TaskState::NeedWrite { bytes },
                    Instant::now() + Duration::from_millis(REPLY_TIMEOUT_MS),
                );
                return Ok(());
            }
        }

        task.transition(
            TaskState::NeedAnswer { msg, raw },
            Instant::now() + Duration::from_millis(REPLY_TIMEOUT_MS),
        );
        Ok(())
    }

    /// NOTIFY is validated against its own surface and acknowledged empty;
    /// zone refresh belongs to the transfer daemon.
    fn notify_ack(&mut self, task: &mut Task, msg: &Message) -> Result<(), SableError> {
        if !self.acl.allows(AclSurface::Notify, task.peer.ip()) {
            return Err(SableError::AclDenied);
        }
        info!(
            "NOTIFY from {} for {:?}",
            task.peer,
            task.question.as_ref().map(|q| q.qname.as_str())
        );
        let mut reply = Reply::empty(&msg.header, task.question.clone(), Rcode::NoError);
        reply.header.authoritative = true;
        self.finalize_reply(task, reply)
    }

    /// version.bind / version.server in class CHAOS, behind a config
    /// switch. Everything else CHAOS gets REFUSED.
    fn chaos_reply(&mut self, task: &mut Task, question: &Question) -> Result<(), SableError> {
        let wants_version = matches!(question.qname.as_str(), "version.bind" | "version.server")
            && matches!(question.qtype, RecordType::TXT | RecordType::ANY);
        if !(self.config.serve_version && wants_version) {
            return Err(SableError::AclDenied);
        }
        let header = task
            .client_header
            .clone()
            .unwrap_or_default();
        let mut reply = Reply::empty(&header, Some(question.clone()), Rcode::NoError);
        reply.header.authoritative = true;
        reply.answers.push(ReplyRecord {
            name: question.qname.clone(),
            class: RecordClass::Chaos,
            record: InternalResourceRecord::TXT {
                txtdata: DNSCharString::from(
                    format!(
                        "sabledns {} on {}",
                        env!("CARGO_PKG_VERSION"),
                        self.config.hostname
                    )
                    .as_str(),
                ),
                ttl: 0,
            },
        });
        task.cacheable = false;
        self.finalize_reply(task, reply)
    }

    /// Resolve locally or hand off to the forwarder. Transfers take their
    /// own path through the xfer engine.
    async fn stage_answer(&mut self, task: &mut Task) -> Result<(), SableError> {
        let TaskState::NeedAnswer { msg, raw } =
            std::mem::replace(&mut task.state, TaskState::NeedCleanup)
        else {
            return Err(SableError::Send("stage_answer on wrong state".to_string()));
        };
        let question = task
            .question
            .clone()
            .ok_or_else(|| SableError::Send("no question in NEED_ANSWER".to_string()))?;

        if question.qtype.is_transfer() {
            let now_unix = chrono::Utc::now().timestamp();
            let (reply, tsig_context) = xfer::handle_transfer(
                &self.pool,
                &raw,
                &msg,
                &question,
                task.peer.ip(),
                &self.acl,
                task.protocol,
                now_unix,
            )
            .await?;
            let mut bytes = reply.as_bytes(self.budget_for(task))?;
            if let Some(context) = tsig_context {
                bytes = tsig::sign_reply(bytes, &context, now_unix)?;
            }
            task.cacheable = false;
            task.transition(
                TaskState::NeedWrite { bytes },
                Instant::now() + Duration::from_millis(REPLY_TIMEOUT_MS),
            );
            return Ok(());
        }

        match resolver::resolve(&self.pool, &question.qname, question.qtype, self.rotate).await? {
            Resolution::Authoritative(auth) => {
                self.rotate = self.rotate.wrapping_add(1);
                let header = msg.header.clone();
                let mut reply = Reply::empty(&header, Some(question.clone()), auth.rcode);
                reply.header.authoritative = auth.aa;
                reply.header.recursion_available = self.config.recursion_enabled();
                reply.answers = auth.answers;
                reply.authorities = auth.authorities;
                reply.additionals = auth.additionals;
                reply.cacheable = auth.rcode == Rcode::NoError;
                crate::dnssec::augment_reply(
                    &self.pool,
                    &mut reply,
                    &auth.zone,
                    question.qtype,
                    self.config.dnssec_enabled,
                    task.edns.map(|e| e.do_bit).unwrap_or(false),
                    auth.nxdomain,
                    chrono::Utc::now().timestamp(),
                )
                .await?;
                // the cache key carries no DO bit, so signed replies must
                // not be replayed to clients that never asked for them
                let signed = reply
                    .answers
                    .iter()
                    .chain(reply.authorities.iter())
                    .any(|r| {
                        matches!(
                            RecordType::from(&r.record),
                            RecordType::RRSIG | RecordType::NSEC3 | RecordType::DNSKEY
                        )
                    });
                if signed {
                    reply.cacheable = false;
                }
                self.finalize_reply(task, reply)
            }
            Resolution::NotLocal => {
                let rd = msg.header.recursion_desired;
                let permitted = rd
                    && self.config.recursion_enabled()
                    && self.acl.allows(AclSurface::Recursion, task.peer.ip());
                if !permitted {
                    return Err(SableError::NoAuthority);
                }
                // forwarded queries hold resources longer; they run low
                self.counters.forwards += 1;
                task.priority = TaskPriority::Low;
                task.transition(
                    TaskState::NeedRecursiveFwd,
                    self.policy.deadline_for(1, Instant::now()),
                );
                Ok(())
            }
        }
    }

    /// Encode, stamp the cache metadata and queue the bytes for the
    /// client.
    fn finalize_reply(&mut self, task: &mut Task, mut reply: Reply) -> Result<(), SableError> {
        if let Some(edns) = &task.edns {
            reply.edns_payload = Some(self.config.udp_payload_cap);
            reply.do_bit = edns.do_bit;
        }
        let bytes = reply.as_bytes(self.budget_for(task))?;
        task.cacheable = task.cacheable && reply.cacheable;
        task.cache_ttl = reply
            .answers
            .iter()
            .chain(reply.authorities.iter())
            .map(|r| r.record.ttl())
            .min();
        task.transition(
            TaskState::NeedWrite { bytes },
            Instant::now() + Duration::from_millis(REPLY_TIMEOUT_MS),
        );
        Ok(())
    }

    /// Turn any error into a valid reply: client id and question kept,
    /// rcode from the error kind, counts otherwise empty.
    fn error_reply(&mut self, task: &mut Task, err: &SableError) {
        debug!("task {:?} failed: {err}", task.id);
        let header = task.client_header.clone().unwrap_or_else(|| Header {
            id: task.client_id,
            ..Default::default()
        });
        let reply = Reply::from_error(&header, task.question.clone(), err);
        task.cacheable = false;
        match reply.as_bytes(self.budget_for(task)) {
            Ok(bytes) => task.transition(
                TaskState::NeedWrite { bytes },
                Instant::now() + Duration::from_millis(REPLY_TIMEOUT_MS),
            ),
            Err(encode_err) => {
                error!("Failed to encode error reply: {encode_err}");
                task.state = TaskState::NeedCleanup;
            }
        }
    }

    /// Kick off the TCP master's non-blocking connect if it's closed.
    fn start_tcp_connect(&mut self, now: Instant) {
        if self.tcp_master.state != MasterState::Closed {
            return;
        }
        let Some(index) = self.upstreams.select(now) else {
            return;
        };
        let addr = self.upstreams.servers[index].addr;
        self.tcp_master.state = MasterState::Connecting;
        self.tcp_master.upstream = Some(index);
        debug!("TCP master connecting to {addr}");
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = TcpStream::connect(addr).await;
            let _ = tx.send(EngineEvent::UpstreamTcpConnected { result }).await;
        });
    }

    /// Send the task's question upstream under a fresh internal id.
    /// Ok(true) = sent and awaiting the reply; Ok(false) = would block or
    /// the master dropped, try again next drain.
    async fn forward_send(&mut self, task: &mut Task) -> Result<bool, SableError> {
        let now = Instant::now();
        let question = task
            .question
            .clone()
            .ok_or_else(|| SableError::Send("no question to forward".to_string()))?;
        let attempt = task.retries + 1;
        let wants_tcp = task.fwd_tcp || task.protocol == Protocol::Tcp;

        if wants_tcp {
            if self.tcp_master.state != MasterState::Connected {
                task.transition(TaskState::NeedRecursiveFwd, task.deadline);
                return Ok(false);
            }
            let index = self
                .tcp_master
                .upstream
                .ok_or(SableError::Timeout)?;
            let internal_id = allocate_internal_id(&self.tcp_master.pending);
            let query = upstream_query(&question, internal_id)?;
            let mut framed = (query.len() as u16).to_be_bytes().to_vec();
            framed.extend(query);
            let Some(writer) = self.tcp_master.writer.as_ref() else {
                task.transition(TaskState::NeedRecursiveFwd, task.deadline);
                return Ok(false);
            };
            match writer.try_write(&framed) {
                Ok(n) if n == framed.len() => {
                    self.tcp_master.pending.insert(
                        internal_id,
                        PendingQuery {
                            task: task.id,
                            upstream: index,
                            sent_at: now,
                        },
                    );
                    task.transition(
                        TaskState::NeedRecursiveFwdRetry {
                            internal_id,
                            upstream: index,
                        },
                        self.policy.deadline_for(attempt, now),
                    );
                    Ok(true)
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    // not writable yet; leave the state alone and yield
                    Ok(false)
                }
                Ok(_) | Err(_) => {
                    // short write or reset: tear the connection down and let
                    // the retry path bring it back
                    self.tcp_master.reset();
                    self.upstreams.mark_failed(index, now);
                    task.transition(TaskState::NeedRecursiveFwd, task.deadline);
                    Ok(false)
                }
            }
        } else {
            let Some(index) = self.upstreams.select(now) else {
                return Err(SableError::Timeout);
            };
            let addr = self.upstreams.servers[index].addr;
            let internal_id = allocate_internal_id(&self.udp_master.pending);
            let query = upstream_query(&question, internal_id)?;
            let socket = self
                .udp_master
                .socket
                .clone()
                .ok_or(SableError::Timeout)?;
            if let Err(err) = socket.send_to(&query, addr).await {
                warn!("Failed to send to upstream {addr}: {err:?}");
                self.upstreams.mark_failed(index, now);
                // the timeout path owns the retry budget
                task.transition(
                    TaskState::NeedRecursiveFwd,
                    self.policy.deadline_for(attempt, now),
                );
                return Ok(false);
            }
            self.udp_master.pending.insert(
                internal_id,
                PendingQuery {
                    task: task.id,
                    upstream: index,
                    sent_at: now,
                },
            );
            task.transition(
                TaskState::NeedRecursiveFwdRetry {
                    internal_id,
                    upstream: index,
                },
                self.policy.deadline_for(attempt, now),
            );
            Ok(true)
        }
    }

    /// Correlate an upstream reply with its pending internal id, validate
    /// it, and hand the bytes to the waiting client task.
    fn handle_upstream_reply(&mut self, bytes: Vec<u8>, source: Option<SocketAddr>, via_tcp: bool) {
        if bytes.len() < crate::HEADER_BYTES {
            return;
        }
        let internal_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let pending_map = match via_tcp {
            true => &mut self.tcp_master.pending,
            false => &mut self.udp_master.pending,
        };
        let Some(pending) = pending_map.remove(&internal_id) else {
            debug!("Upstream reply with no pending id {internal_id}, dropping");
            return;
        };
        let now = Instant::now();

        // the datagram master checks the sender address as well as the id
        if let Some(source) = source {
            let expected = self.upstreams.servers.get(pending.upstream).map(|s| s.addr);
            if expected != Some(source) {
                warn!("Upstream reply from unexpected source {source}, dropping");
                match via_tcp {
                    true => self.tcp_master.pending.insert(internal_id, pending),
                    false => self.udp_master.pending.insert(internal_id, pending),
                };
                return;
            }
        }

        // the pending entry is a borrowed reference; revalidate it
        let Some(mut task) = self.tasks.remove(&pending.task) else {
            debug!("Pending reply for reaped task, dropping");
            return;
        };
        let state_matches = matches!(
            &task.state,
            TaskState::NeedRecursiveFwdRetry { internal_id: id, .. } if *id == internal_id
        );
        if !state_matches {
            self.tasks.insert(task.id, task);
            return;
        }

        let qname = task
            .question
            .as_ref()
            .map(|q| q.qname.clone())
            .unwrap_or_default();

        match Message::parse(&bytes) {
            Ok(msg)
                if msg.header.qr == crate::enums::PacketType::Answer
                    && msg
                        .question()
                        .map(|q| q.qname == qname)
                        .unwrap_or(false) =>
            {
                if !bailiwick_ok(&msg, &qname) {
                    // poisoned or sloppy; penalise and wait out the retry
                    self.upstreams.mark_failed(pending.upstream, now);
                    task.cacheable = false;
                    self.tasks.insert(task.id, task);
                    return;
                }
                if msg.header.truncated && !via_tcp {
                    debug!("Upstream answer for {qname} truncated, retrying over TCP");
                    task.fwd_tcp = true;
                    task.transition(
                        TaskState::NeedRecursiveFwd,
                        self.policy.deadline_for(task.retries + 1, now),
                    );
                    let id = task.id;
                    let priority = task.priority;
                    self.tasks.insert(id, task);
                    self.queues.push(priority, id);
                    return;
                }
                self.upstreams.mark_ok(pending.upstream, now);
                if self.config.capture_packets {
                    let upstream_addr = self.upstreams.servers[pending.upstream].addr;
                    tokio::spawn(packet_dumper::capture(
                        bytes.clone(),
                        Leg::Upstream,
                        upstream_addr,
                        internal_id,
                    ));
                }
                let mut out = bytes;
                rewrite_id(&mut out, task.client_id);
                task.cache_ttl = msg.answers.iter().map(|r| r.ttl).min();
                task.transition(
                    TaskState::NeedWrite { bytes: out },
                    now + Duration::from_millis(REPLY_TIMEOUT_MS),
                );
                let id = task.id;
                let priority = task.priority;
                self.tasks.insert(id, task);
                self.queues.push(priority, id);
            }
            _ => {
                debug!("Unparseable or mismatched upstream reply for {qname}");
                self.upstreams.mark_failed(pending.upstream, now);
                task.cacheable = false;
                self.tasks.insert(task.id, task);
            }
        }
    }

    /// Ship the reply and book-keep: counters by rcode, cache insert for
    /// validated answers, optional capture.
    async fn send_reply(&mut self, task: &mut Task, bytes: Vec<u8>) {
        let rcode = bytes
            .get(3)
            .map(|b| Rcode::from(b & 0x0f))
            .unwrap_or(Rcode::ServFail);
        match rcode {
            Rcode::Refused => self.counters.refused += 1,
            Rcode::ServFail => self.counters.servfail += 1,
            Rcode::NameError => self.counters.nxdomain += 1,
            Rcode::FormatError => self.counters.formerr += 1,
            Rcode::NotAuth => self.counters.notauth += 1,
            _ => {}
        }

        let truncated = bytes.get(2).map(|b| b & 0x02 != 0).unwrap_or(false);
        if task.cacheable && rcode == Rcode::NoError && !truncated {
            if let (Some(question), Some(min_ttl)) = (&task.question, task.cache_ttl) {
                if question.qclass == RecordClass::Internet {
                    self.cache.insert(
                        CacheKey {
                            qname: question.qname.clone(),
                            qtype: question.qtype,
                            qclass: question.qclass,
                        },
                        bytes.clone(),
                        min_ttl,
                        Instant::now(),
                    );
                }
            }
        }

        if self.config.capture_packets {
            tokio::spawn(packet_dumper::capture(
                bytes.clone(),
                Leg::Reply,
                task.peer,
                task.client_id,
            ));
        }

        match task.protocol {
            Protocol::Udp => {
                if let Err(err) = self.udp.send_to(&bytes, task.peer).await {
                    warn!("Failed to send reply to {:?}: {err:?}", task.peer);
                }
            }
            Protocol::Tcp => {
                if let Some(stream) = &task.stream {
                    // a disconnected client doesn't un-cache the answer
                    if stream.responder.send(bytes).await.is_err() {
                        debug!("Client stream {} went away before the reply", stream.stream_id);
                    }
                }
            }
        }
    }

    /// Walk every task whose deadline passed and run its timeout path:
    /// retry, error out, or clean up.
    fn check_task_timeouts(&mut self) {
        let now = Instant::now();
        let due: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, task)| task.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            let Some(mut task) = self.tasks.remove(&id) else {
                continue;
            };
            match &task.state {
                TaskState::NeedRead => {
                    debug!("Stream client {:?} never completed a frame", task.peer);
                    if let Some(stream) = &task.stream {
                        self.stream_tasks.remove(&stream.stream_id);
                    }
                    continue; // dropped
                }
                TaskState::NeedRecursiveFwd | TaskState::NeedRecursiveFwdWrite => {
                    task.retries += 1;
                    if task.retries >= self.policy.max_retries {
                        self.error_reply(&mut task, &SableError::Timeout);
                        self.queues.push(task.priority, id);
                    } else {
                        task.transition(
                            TaskState::NeedRecursiveFwd,
                            self.policy.deadline_for(task.retries + 1, now),
                        );
                        self.queues.push(task.priority, id);
                    }
                }
                TaskState::NeedRecursiveFwdRetry {
                    internal_id,
                    upstream,
                } => {
                    let internal_id = *internal_id;
                    let upstream = *upstream;
                    self.udp_master.pending.remove(&internal_id);
                    self.tcp_master.pending.remove(&internal_id);
                    task.retries += 1;
                    if task.retries >= self.policy.max_retries {
                        // at the limit: the upstream eats the blame and the
                        // client gets SERVFAIL
                        self.upstreams.mark_failed(upstream, now);
                        self.error_reply(&mut task, &SableError::Timeout);
                    } else {
                        task.transition(
                            TaskState::NeedRecursiveFwdWrite,
                            self.policy.deadline_for(task.retries + 1, now),
                        );
                    }
                    self.queues.push(task.priority, id);
                }
                TaskState::NeedQuestion { .. }
                | TaskState::NeedAnswer { .. }
                | TaskState::NeedWrite { .. } => {
                    warn!("task {id:?} stalled in {}, reaping", task.state.label());
                    continue; // dropped
                }
                TaskState::NeedCleanup => continue,
            }
            self.tasks.insert(id, task);
        }
    }

    async fn run_periodics(&mut self) {
        let now = Instant::now();
        for index in 0..self.periodics.len() {
            if !self.periodics[index].due(now) {
                continue;
            }
            let kind = self.periodics[index].kind;
            match kind {
                PeriodicKind::IxfrGc => {
                    if let Err(err) = xfer::run_gc(&self.pool, chrono::Utc::now().timestamp()).await
                    {
                        warn!("Transfer GC failed: {err}");
                    }
                }
                PeriodicKind::RateSweep => {
                    let swept = self.ratelimit.sweep(now);
                    if swept > 0 {
                        debug!("Rate limiter swept {swept} idle clients");
                    }
                }
                PeriodicKind::CachePrune => {
                    let pruned = self.cache.prune(now);
                    if pruned > 0 {
                        debug!("Reply cache dropped {pruned} expired entries");
                    }
                }
                PeriodicKind::Stats => {
                    info!(
                        "engine stats: queries={} cache_hits={} forwards={} refused={} servfail={} nxdomain={} cache_size={} ratelimit_clients={}",
                        self.counters.queries,
                        self.counters.cache_hits,
                        self.counters.forwards,
                        self.counters.refused,
                        self.counters.servfail,
                        self.counters.nxdomain,
                        self.cache.len(),
                        self.ratelimit.tracked_clients(),
                    );
                }
            }
            self.periodics[index].reschedule(now);
        }
    }

    /// Reap every task that reached NEED_CLEANUP this iteration.
    fn reap(&mut self) {
        self.tasks
            .retain(|_, task| !matches!(task.state, TaskState::NeedCleanup));
    }

    /// The next instant the loop must wake at: the soonest task deadline
    /// or periodic job, clamped so a hot loop can't spin.
    fn next_deadline(&self, now: Instant) -> Instant {
        let mut next = now + Duration::from_secs(1);
        for task in self.tasks.values() {
            if task.deadline < next {
                next = task.deadline;
            }
        }
        for job in &self.periodics {
            if job.next_run < next {
                next = job.next_run;
            }
        }
        next.max(now + Duration::from_millis(10))
    }
}

static STREAM_IDS: AtomicU64 = AtomicU64::new(1);

/// main handler for the TCP side of things
///
/// Ref <https://www.rfc-editor.org/rfc/rfc7766>
pub async fn tcp_server(
    listener: TcpListener,
    event_tx: mpsc::Sender<EngineEvent>,
) -> Result<(), SableError> {
    info!("Started TCP listener on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(value) => value,
            Err(err) => {
                error!("Couldn't accept TCP connection: {err:?}");
                continue;
            }
        };
        debug!("TCP connection from {peer:?}");
        let stream_id = STREAM_IDS.fetch_add(1, Ordering::Relaxed);
        let tx = event_tx.clone();
        tokio::spawn(async move {
            tcp_conn_handler(stream, peer, stream_id, tx).await;
        });
    }
}

/// Reads length-prefixed frames off a client connection into the engine,
/// and writes the engine's replies back with their own length prefix.
async fn tcp_conn_handler(
    stream: TcpStream,
    peer: SocketAddr,
    stream_id: u64,
    event_tx: mpsc::Sender<EngineEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(16);

    if event_tx
        .send(EngineEvent::StreamOpen {
            stream_id,
            peer,
            responder: reply_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    tokio::spawn(async move {
        while let Some(bytes) = reply_rx.recv().await {
            let length = bytes.len() as u16;
            if writer.write_all(&length.to_be_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    loop {
        // the first two bytes of a tcp query is the message length
        // ref <https://www.rfc-editor.org/rfc/rfc7766#section-8>
        let length = match reader.read_u16().await {
            Ok(value) => value as usize,
            Err(_) => break,
        };
        let mut buf = vec![0u8; length];
        if reader.read_exact(&mut buf).await.is_err() {
            break;
        }
        if event_tx
            .send(EngineEvent::StreamFrame {
                stream_id,
                bytes: buf,
            })
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = event_tx.send(EngineEvent::StreamClosed { stream_id }).await;
}
