//! Two-tier priority command queue.
//!
//! Foreground commands always run before background commands. Within a
//! tier commands run in submission order, tracked by a monotonic sequence.

mod worker;

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::Result;
use crate::listener::Listener;

pub use worker::Worker;
pub(crate) use worker::on_worker_thread;

/// Work item executed by the worker. Kept behind an `Arc` so a command can
/// be re-queued after a retryable failure.
pub type Work = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Priority tier of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Interactive, user-triggered work.
    Foreground,
    /// Periodic or automatic work.
    Background,
}

impl Priority {
    const fn rank(self) -> u8 {
        match self {
            Self::Foreground => 0,
            Self::Background => 1,
        }
    }
}

/// A queued unit of work.
#[derive(Clone)]
pub struct Command {
    work: Work,
    listener: Option<Arc<dyn Listener>>,
    description: String,
    priority: Priority,
    sequence: u64,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("description", &self.description)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Command {
    /// Human-readable description, used in logs.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Priority tier.
    #[must_use]
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// Submission sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    fn key(&self) -> (u8, u64) {
        (self.priority.rank(), self.sequence)
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Command {}

impl PartialOrd for Command {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Command {
    // BinaryHeap pops the greatest element; the smallest key must win.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Blocking priority queue shared by submitters and the worker.
pub struct CommandQueue {
    heap: Mutex<BinaryHeap<Command>>,
    ready: Condvar,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("closed", &self.closed.load(AtomicOrdering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            ready: Condvar::new(),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Locks the heap. A panic while the lock was held cannot leave the heap
    /// half-updated, so a poisoned lock is taken over as is.
    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Command>> {
        self.heap.lock().unwrap_or_else(|poisoned| {
            warn!("Command queue lock poisoned, recovering");
            self.heap.clear_poison();
            poisoned.into_inner()
        })
    }

    /// Enqueues new work and returns its sequence number.
    pub fn submit(
        &self,
        description: impl Into<String>,
        listener: Option<Arc<dyn Listener>>,
        work: Work,
        priority: Priority,
    ) -> u64 {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        self.put(Command {
            work,
            listener,
            description: description.into(),
            priority,
            sequence,
        });
        sequence
    }

    /// Puts a command back, keeping its original sequence.
    ///
    /// Commands put after [`close`](Self::close) are dropped.
    pub fn put(&self, command: Command) {
        if self.closed.load(AtomicOrdering::SeqCst) {
            warn!(command = %command.description, "Queue closed, dropping command");
            return;
        }
        self.heap().push(command);
        self.ready.notify_one();
    }

    /// Blocks until a command is available or the queue is closed.
    pub fn take(&self) -> Option<Command> {
        let mut heap = self.heap();
        loop {
            if self.closed.load(AtomicOrdering::SeqCst) {
                return None;
            }
            if let Some(command) = heap.pop() {
                return Some(command);
            }
            heap = self
                .ready
                .wait(heap)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap().len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue, dropping queued commands and waking the worker.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.heap().clear();
        self.ready.notify_all();
    }

    /// Returns true once [`close`](Self::close) was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }
}
