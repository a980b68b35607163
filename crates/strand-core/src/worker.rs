//! Worker handles, messages and worker lifecycle state.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Reason;
use crate::ids::WorkerId;
use crate::mailbox::{Job, Mailbox};

/// Worker lifecycle.
///
/// Transitions only move forward:
/// - Starting -> Running (module initialized)
/// - Starting -> Terminated (initialization failed)
/// - Running -> Terminated (terminated, closed itself, or went idle with no handles left)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Running,
    Terminated,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Application data, delivered to `onmessage`.
    Data,
    /// Explicit error channel, delivered to `onerror`.
    Error,
}

/// One mailbox entry. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct Message {
    data: serde_json::Value,
    source: Option<WeakWorker>,
    kind: MessageKind,
}

impl Message {
    pub fn new(data: serde_json::Value, source: Option<WeakWorker>, kind: MessageKind) -> Self {
        Self { data, source, kind }
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    pub fn source(&self) -> Option<&WeakWorker> {
        self.source.as_ref()
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub(crate) fn into_event(self) -> (MessageKind, MessageEvent) {
        (
            self.kind,
            MessageEvent {
                data: self.data,
                source: self.source,
            },
        )
    }
}

/// What `onmessage` / `onerror` receive.
///
/// `source` is the sending worker, usable to reply. It is `None` for messages posted from
/// outside any worker and for errors raised by the worker's own handlers.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub data: serde_json::Value,
    pub source: Option<WeakWorker>,
}

impl MessageEvent {
    /// Builds the event for an error that escaped one of the worker's own handlers.
    pub(crate) fn uncaught(reason: Reason) -> Self {
        Self {
            data: reason,
            source: None,
        }
    }
}

/// State shared between a worker's handles and its event loop.
pub(crate) struct WorkerShared {
    id: WorkerId,
    module: String,
    pub(crate) mailbox: Mailbox<Message>,
    state: Mutex<WorkerState>,
    state_changed: Condvar,
    /// Live `Worker` handles. The loop exits when idle and this reaches zero.
    handles: AtomicUsize,
}

impl WorkerShared {
    pub(crate) fn new(id: WorkerId, module: String) -> Self {
        Self {
            id,
            module,
            mailbox: Mailbox::new(),
            state: Mutex::new(WorkerState::Starting),
            state_changed: Condvar::new(),
            handles: AtomicUsize::new(0),
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn module(&self) -> &str {
        &self.module
    }

    fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> WorkerState {
        *self.lock_state()
    }

    pub(crate) fn set_state(&self, next: WorkerState) {
        let mut state = self.lock_state();
        if state.is_terminal() {
            return;
        }
        *state = next;
        drop(state);
        self.state_changed.notify_all();
    }

    pub(crate) fn handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }
}

/// Strong handle to a worker.
///
/// Cloning is cheap. While any handle exists the worker stays alive even when idle;
/// explicit [`Worker::terminate`] stops it regardless.
pub struct Worker {
    shared: Arc<WorkerShared>,
}

impl Worker {
    pub(crate) fn from_shared(shared: Arc<WorkerShared>) -> Self {
        shared.handles.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }

    /// Id of this worker, stable for its whole life.
    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    /// Name of the module this worker was spawned from.
    pub fn module(&self) -> &str {
        &self.shared.module
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Whether the event loop has exited (or never started).
    pub fn is_terminated(&self) -> bool {
        self.state().is_terminal()
    }

    /// Enqueues a data message for `onmessage`. Never blocks.
    ///
    /// When called from a worker thread the event's `source` is that worker.
    pub fn post_message(&self, data: serde_json::Value) {
        self.post(data, MessageKind::Data);
    }

    /// Enqueues an error message for `onerror`. Never blocks.
    pub fn post_error(&self, data: serde_json::Value) {
        self.post(data, MessageKind::Error);
    }

    fn post(&self, data: serde_json::Value, kind: MessageKind) {
        let message = Message::new(data, current(), kind);
        if !self.shared.mailbox.post(message) {
            debug!(worker_id = %self.shared.id, ?kind, "Worker terminated, dropping message.");
        }
    }

    pub(crate) fn post_job(&self, job: Job) -> bool {
        self.shared.mailbox.post_job(job)
    }

    /// Stops the event loop after the current callback. Pending messages are dropped.
    ///
    /// Idempotent.
    pub fn terminate(&self) {
        let dropped = self.shared.mailbox.close();
        if dropped > 0 {
            debug!(worker_id = %self.shared.id, dropped, "Dropped pending mailbox entries on terminate.");
        }
    }

    /// Blocks until the worker's event loop has exited or `timeout` elapses.
    ///
    /// A timeout too large to represent as a deadline waits without bound.
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.lock_state();
        while !state.is_terminal() {
            state = match deadline {
                None => self
                    .shared
                    .state_changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    let (guard, _) = self
                        .shared
                        .state_changed
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard
                }
            };
        }
        true
    }

    /// Non-owning reference to this worker.
    pub fn downgrade(&self) -> WeakWorker {
        WeakWorker::from_shared(&self.shared)
    }
}

impl Clone for Worker {
    fn clone(&self) -> Self {
        Self::from_shared(Arc::clone(&self.shared))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.shared.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last handle: an idle loop may now exit.
            self.shared.mailbox.wake();
        }
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Worker {}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.shared.id)
            .field("module", &self.shared.module)
            .field("state", &self.state())
            .finish()
    }
}

/// Reference to a worker that does not keep it alive.
///
/// This is what message events carry as `source`.
#[derive(Clone)]
pub struct WeakWorker {
    id: WorkerId,
    shared: Weak<WorkerShared>,
}

impl WeakWorker {
    pub(crate) fn from_shared(shared: &Arc<WorkerShared>) -> Self {
        Self {
            id: shared.id,
            shared: Arc::downgrade(shared),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Returns a strong handle unless the worker is gone or terminated.
    pub fn upgrade(&self) -> Option<Worker> {
        let shared = self.shared.upgrade()?;
        if shared.state().is_terminal() {
            return None;
        }
        Some(Worker::from_shared(shared))
    }

    /// Current state without taking a handle; gone workers report `Terminated`.
    pub fn state(&self) -> WorkerState {
        self.shared
            .upgrade()
            .map_or(WorkerState::Terminated, |shared| shared.state())
    }
}

impl fmt::Debug for WeakWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakWorker").field(&self.id).finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<WeakWorker>> = const { RefCell::new(None) };
}

/// The worker whose event loop runs on this thread, if any.
pub fn current() -> Option<WeakWorker> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) fn set_current(worker: Option<WeakWorker>) {
    CURRENT.with(|current| *current.borrow_mut() = worker);
}
