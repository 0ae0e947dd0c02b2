//! The unit of work for one query lifecycle, and the kind-indexed priority
//! queues the engine drains. State is a tagged variant carrying exactly the
//! scratch that state needs, so teardown is just dropping the task.

use crate::enums::{Protocol, TaskKind, TaskPriority};
use crate::message::{Edns, Message};
use crate::{Header, Question};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

/// Where a stream task sends its reply frames; `stream_id` keys the
/// connection in the engine's table.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    pub stream_id: u64,
    pub responder: mpsc::Sender<Vec<u8>>,
}

#[derive(Debug)]
pub enum TaskState {
    /// Stream accepted, a full frame hasn't arrived yet
    NeedRead,
    /// Raw message in hand, not yet parsed or past the guards
    NeedQuestion { raw: Vec<u8> },
    /// Parsed; ready for the resolver or the transfer engine
    NeedAnswer { msg: Message, raw: Vec<u8> },
    /// Parked until the forwarder master is usable
    NeedRecursiveFwd,
    /// Master is up; (re)send the query upstream
    NeedRecursiveFwdWrite,
    /// Sent; awaiting the correlated reply or the retry deadline
    NeedRecursiveFwdRetry { internal_id: u16, upstream: usize },
    /// Encoded reply ready to go to the client
    NeedWrite { bytes: Vec<u8> },
    /// Finished one way or another; the reaper takes it from here
    NeedCleanup,
}

impl TaskState {
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::NeedRead => "NEED_READ",
            TaskState::NeedQuestion { .. } => "NEED_QUESTION",
            TaskState::NeedAnswer { .. } => "NEED_ANSWER",
            TaskState::NeedRecursiveFwd => "NEED_RECURSIVE_FWD",
            TaskState::NeedRecursiveFwdWrite => "NEED_RECURSIVE_FWD_WRITE",
            TaskState::NeedRecursiveFwdRetry { .. } => "NEED_RECURSIVE_FWD_RETRY",
            TaskState::NeedWrite { .. } => "NEED_WRITE",
            TaskState::NeedCleanup => "NEED_CLEANUP",
        }
    }
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    /// The client's transaction id, restored into every reply
    pub client_id: u16,
    pub protocol: Protocol,
    pub peer: SocketAddr,
    pub priority: TaskPriority,
    pub kind: TaskKind,
    pub state: TaskState,
    /// Every transition moves this; the loop fires the timeout path when it
    /// passes without the expected event
    pub deadline: Instant,
    pub retries: u32,
    pub question: Option<Question>,
    pub client_header: Option<Header>,
    pub edns: Option<Edns>,
    pub stream: Option<StreamHandle>,
    /// Cleared by anything that makes the eventual reply unsafe to cache
    pub cacheable: bool,
    /// Smallest TTL among the answered records, set when the reply is built
    pub cache_ttl: Option<u32>,
    /// A TC'd upstream reply flips the retry onto the TCP master
    pub fwd_tcp: bool,
}

impl Task {
    pub fn new(
        id: TaskId,
        protocol: Protocol,
        peer: SocketAddr,
        state: TaskState,
        deadline: Instant,
    ) -> Self {
        let kind = match state {
            TaskState::NeedRead => TaskKind::Io,
            _ => TaskKind::Normal,
        };
        Task {
            id,
            client_id: 0,
            protocol,
            peer,
            priority: TaskPriority::Normal,
            kind,
            state,
            deadline,
            retries: 0,
            question: None,
            client_header: None,
            edns: None,
            stream: None,
            cacheable: true,
            cache_ttl: None,
            fwd_tcp: false,
        }
    }

    /// Move to a new state, stamping the next deadline.
    pub fn transition(&mut self, state: TaskState, deadline: Instant) {
        log::trace!(
            "task {:?}: {} -> {}",
            self.id,
            self.state.label(),
            state.label()
        );
        self.state = state;
        self.deadline = deadline;
    }
}

/// The ready queues, indexed by priority. One drain visits high, then
/// normal, then low, running each task once.
#[derive(Debug, Default)]
pub struct TaskQueues {
    ready: [VecDeque<TaskId>; 3],
}

impl TaskQueues {
    pub fn push(&mut self, priority: TaskPriority, id: TaskId) {
        self.ready[priority as usize].push_back(id);
    }

    pub fn pop_next(&mut self) -> Option<TaskId> {
        for queue in self.ready.iter_mut() {
            if let Some(id) = queue.pop_front() {
                return Some(id);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.ready.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The timer-driven housekeeping jobs sharing the loop with query tasks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeriodicKind {
    /// Expire tombstoned rr rows past the zone's expire window
    IxfrGc,
    /// Sweep idle rate-limit entries
    RateSweep,
    /// Drop expired reply-cache entries
    CachePrune,
    /// Log engine counters
    Stats,
}

#[derive(Debug)]
pub struct PeriodicTask {
    pub kind: PeriodicKind,
    pub next_run: Instant,
    pub interval: Duration,
}

impl PeriodicTask {
    pub fn new(kind: PeriodicKind, interval: Duration, now: Instant) -> Self {
        PeriodicTask {
            kind,
            next_run: now + interval,
            interval,
        }
    }

    pub fn due(&self, now: Instant) -> bool {
        self.next_run <= now
    }

    pub fn reschedule(&mut self, now: Instant) {
        self.next_run = now + self.interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_priority_order() {
        let mut queues = TaskQueues::default();
        queues.push(TaskPriority::Low, TaskId(3));
        queues.push(TaskPriority::High, TaskId(1));
        queues.push(TaskPriority::Normal, TaskId(2));
        queues.push(TaskPriority::High, TaskId(4));
        let drained: Vec<TaskId> = std::iter::from_fn(|| queues.pop_next()).collect();
        assert_eq!(drained, vec![TaskId(1), TaskId(4), TaskId(2), TaskId(3)]);
        assert!(queues.is_empty());
    }

    #[test]
    fn test_task_transition_updates_deadline() {
        let now = Instant::now();
        let mut task = Task::new(
            TaskId(1),
            Protocol::Udp,
            SocketAddr::from(([127, 0, 0, 1], 4053)),
            TaskState::NeedQuestion { raw: vec![] },
            now,
        );
        assert_eq!(task.kind, TaskKind::Normal);
        let later = now + Duration::from_secs(2);
        task.transition(TaskState::NeedCleanup, later);
        assert_eq!(task.deadline, later);
        assert!(matches!(task.state, TaskState::NeedCleanup));
    }

    #[test]
    fn test_stream_tasks_start_on_the_io_queue_kind() {
        let now = Instant::now();
        let task = Task::new(
            TaskId(9),
            Protocol::Tcp,
            SocketAddr::from(([127, 0, 0, 1], 4053)),
            TaskState::NeedRead,
            now,
        );
        assert_eq!(task.kind, TaskKind::Io);
    }

    #[test]
    fn test_periodic_due_and_reschedule() {
        let now = Instant::now();
        let mut job = PeriodicTask::new(PeriodicKind::RateSweep, Duration::from_secs(300), now);
        assert!(!job.due(now));
        assert!(job.due(now + Duration::from_secs(301)));
        job.reschedule(now + Duration::from_secs(301));
        assert!(!job.due(now + Duration::from_secs(302)));
    }
}
