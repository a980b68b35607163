//! Event loop - single-threaded dispatch for one worker.
//!
//! # Loop step
//! 1. run queued jobs (promise continuations)
//! 2. fire the earliest due timer
//! 3. dispatch one message
//! 4. otherwise sleep until one of the above, or exit when no timers remain and no
//!    handle references the worker
//!
//! Callbacks never overlap within one loop. Errors escaping a handler are routed to the
//! worker's own `onerror`, never to the sender and never out of the thread.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::SyncSender;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::error::{ModuleLoadError, Reason, UncaughtWorkerError, panic_reason};
use crate::ids::{TimerId, WorkerId};
use crate::mailbox::{Delivery, Job};
use crate::module::Module;
use crate::runtime::Runtime;
use crate::timer::{FiredTimer, TimerRegistry};
use crate::worker::{
    self, Message, MessageEvent, MessageKind, WeakWorker, Worker, WorkerShared, WorkerState,
};

pub(crate) type MessageHandler =
    Box<dyn FnMut(&mut WorkerScope<'_>, MessageEvent) -> Result<(), Reason>>;

pub(crate) type TimerCallback = Box<dyn FnMut(&mut WorkerScope<'_>) -> Result<(), Reason>>;

/// A replaceable handler slot.
///
/// The handler is taken out while it runs; `version` tells whether it was replaced (or
/// cleared) during the call, in which case the replacement wins.
#[derive(Default)]
struct HandlerSlot {
    handler: Option<MessageHandler>,
    version: u64,
}

impl HandlerSlot {
    fn set(&mut self, handler: Option<MessageHandler>) {
        self.handler = handler;
        self.version += 1;
    }

    fn take(&mut self) -> Option<(MessageHandler, u64)> {
        self.handler.take().map(|handler| (handler, self.version))
    }

    fn restore(&mut self, handler: MessageHandler, version: u64) {
        if self.version == version {
            self.handler = Some(handler);
        }
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Message,
    Error,
}

pub(crate) struct LoopState {
    timers: TimerRegistry<TimerCallback>,
    onmessage: HandlerSlot,
    onerror: HandlerSlot,
}

impl LoopState {
    fn new() -> Self {
        Self {
            timers: TimerRegistry::new(),
            onmessage: HandlerSlot::default(),
            onerror: HandlerSlot::default(),
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut HandlerSlot {
        match slot {
            Slot::Message => &mut self.onmessage,
            Slot::Error => &mut self.onerror,
        }
    }
}

/// What worker code sees while one of its callbacks runs.
pub struct WorkerScope<'a> {
    shared: &'a Arc<WorkerShared>,
    runtime: &'a Runtime,
    state: &'a mut LoopState,
}

impl WorkerScope<'_> {
    /// Id of the worker running this callback.
    pub fn id(&self) -> WorkerId {
        self.shared.id()
    }

    /// Name of the module this worker runs.
    pub fn module(&self) -> &str {
        self.shared.module()
    }

    /// Non-owning reference to the current worker (does not keep it alive).
    pub fn this(&self) -> WeakWorker {
        WeakWorker::from_shared(self.shared)
    }

    /// The runtime that owns this worker.
    pub fn runtime(&self) -> &Runtime {
        self.runtime
    }

    /// Spawns a registered module as a new worker.
    pub fn spawn(&self, module: &str) -> Result<Worker, ModuleLoadError> {
        self.runtime.spawn(module)
    }

    /// Replaces the data handler. Takes effect for the next message, even when called
    /// from inside the running handler.
    pub fn set_onmessage<F>(&mut self, handler: F)
    where
        F: FnMut(&mut WorkerScope<'_>, MessageEvent) -> Result<(), Reason> + 'static,
    {
        self.state.onmessage.set(Some(Box::new(handler)));
    }

    /// Replaces the error handler. It receives error messages and errors escaping
    /// this worker's own callbacks.
    pub fn set_onerror<F>(&mut self, handler: F)
    where
        F: FnMut(&mut WorkerScope<'_>, MessageEvent) -> Result<(), Reason> + 'static,
    {
        self.state.onerror.set(Some(Box::new(handler)));
    }

    /// Later data messages are dropped until a new handler is set.
    pub fn clear_onmessage(&mut self) {
        self.state.onmessage.set(None);
    }

    pub fn clear_onerror(&mut self) {
        self.state.onerror.set(None);
    }

    /// Runs `callback` once after `delay`.
    pub fn set_timeout<F>(&mut self, delay: Duration, callback: F) -> TimerId
    where
        F: FnOnce(&mut WorkerScope<'_>) -> Result<(), Reason> + 'static,
    {
        let mut callback = Some(callback);
        self.state.timers.after(
            delay,
            Box::new(move |scope: &mut WorkerScope<'_>| match callback.take() {
                Some(callback) => callback(scope),
                None => Ok(()),
            }),
        )
    }

    /// Runs `callback` every `period`, anchored to the first scheduled time.
    pub fn set_interval<F>(&mut self, period: Duration, callback: F) -> TimerId
    where
        F: FnMut(&mut WorkerScope<'_>) -> Result<(), Reason> + 'static,
    {
        self.state.timers.every(period, Box::new(callback))
    }

    /// Cancels a pending timeout. Returns `false` if it already fired or was cleared.
    pub fn clear_timeout(&mut self, id: TimerId) -> bool {
        self.state.timers.cancel(id)
    }

    /// Cancels an interval. Cancelling from inside its own callback stops it too.
    pub fn clear_interval(&mut self, id: TimerId) -> bool {
        self.state.timers.cancel(id)
    }

    /// Stops this worker once the current callback returns.
    pub fn close(&mut self) {
        self.shared.mailbox.close();
    }
}

pub(crate) struct EventLoop {
    shared: Arc<WorkerShared>,
    runtime: Runtime,
    state: LoopState,
}

impl EventLoop {
    pub(crate) fn new(shared: Arc<WorkerShared>, runtime: Runtime) -> Self {
        Self {
            shared,
            runtime,
            state: LoopState::new(),
        }
    }

    fn id(&self) -> WorkerId {
        self.shared.id()
    }

    fn with_scope<R>(&mut self, f: impl FnOnce(&mut WorkerScope<'_>) -> R) -> R {
        let mut scope = WorkerScope {
            shared: &self.shared,
            runtime: &self.runtime,
            state: &mut self.state,
        };
        f(&mut scope)
    }

    /// Builds this worker's own instance of `module`.
    pub(crate) fn init(&mut self, module: &dyn Module) -> Result<(), Reason> {
        self.with_scope(|scope| {
            catch_unwind(AssertUnwindSafe(|| module.init(scope)))
                .unwrap_or_else(|payload| Err(panic_reason(payload)))
        })
    }

    pub(crate) fn run(mut self) {
        debug!(worker_id = %self.id(), module = self.shared.module(), "Event loop starting.");

        loop {
            let deadline = self.state.timers.next_deadline();
            let delivery = {
                let shared = &self.shared;
                let timers = &self.state.timers;
                // Timers too far out to have a deadline still count as pending work.
                shared
                    .mailbox
                    .recv(deadline, || shared.handles() > 0 || !timers.is_empty())
            };

            match delivery {
                Delivery::Job(job) => self.run_job(job),
                Delivery::Timeout => {
                    if let Some(fired) = self.state.timers.pop_due(Instant::now()) {
                        self.fire_timer(fired);
                    }
                }
                Delivery::Message(message) => self.dispatch(message),
                Delivery::Idle => {
                    debug!(worker_id = %self.id(), "No pending work and no handles left, stopping.");
                    break;
                }
                Delivery::Closed => {
                    debug!(worker_id = %self.id(), "Mailbox closed, stopping.");
                    break;
                }
            }
        }

        self.shutdown();
    }

    fn run_job(&mut self, job: Job) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
            warn!(worker_id = %self.id(), reason = %panic_reason(payload), "Job panicked.");
        }
    }

    fn fire_timer(&mut self, fired: FiredTimer<TimerCallback>) {
        let FiredTimer {
            id,
            scheduled_for,
            mut callback,
        } = fired;

        let result = self.with_scope(|scope| {
            catch_unwind(AssertUnwindSafe(|| callback(scope)))
                .unwrap_or_else(|payload| Err(panic_reason(payload)))
        });

        self.state.timers.finish(FiredTimer {
            id,
            scheduled_for,
            callback,
        });

        if let Err(reason) = result {
            self.uncaught(reason);
        }
    }

    fn dispatch(&mut self, message: Message) {
        let (kind, event) = message.into_event();
        match kind {
            MessageKind::Data => match self.call_handler(Slot::Message, event) {
                None => debug!(worker_id = %self.id(), "No onmessage handler, dropping message."),
                Some(Ok(())) => {}
                Some(Err(reason)) => self.uncaught(reason),
            },
            MessageKind::Error => {
                let data = event.data.clone();
                match self.call_handler(Slot::Error, event) {
                    None => error!(worker_id = %self.id(), error = %data, "Unhandled error message."),
                    Some(Ok(())) => {}
                    Some(Err(reason)) => {
                        error!(worker_id = %self.id(), error = %reason, "onerror handler failed.")
                    }
                }
            }
        }
    }

    /// Routes an error that escaped one of this worker's own handlers.
    fn uncaught(&mut self, reason: Reason) {
        let err = UncaughtWorkerError {
            worker: self.id(),
            reason,
        };
        match self.call_handler(Slot::Error, MessageEvent::uncaught(err.reason.clone())) {
            None => error!(worker_id = %self.id(), error = %err, "Uncaught error with no onerror handler."),
            Some(Ok(())) => debug!(worker_id = %self.id(), "Uncaught error handled by onerror."),
            Some(Err(reason)) => {
                error!(worker_id = %self.id(), error = %err, onerror_error = %reason, "onerror handler failed.")
            }
        }
    }

    fn call_handler(&mut self, slot: Slot, event: MessageEvent) -> Option<Result<(), Reason>> {
        let (mut handler, version) = self.state.slot_mut(slot).take()?;
        let result = self.with_scope(|scope| {
            catch_unwind(AssertUnwindSafe(|| handler(scope, event)))
                .unwrap_or_else(|payload| Err(panic_reason(payload)))
        });
        self.state.slot_mut(slot).restore(handler, version);
        Some(result)
    }

    pub(crate) fn shutdown(self) {
        let Self { shared, state, .. } = self;
        shared.mailbox.close();
        shared.set_state(WorkerState::Terminated);
        // Handlers and timers may own handles to other workers.
        drop(state);
        worker::set_current(None);
        debug!(worker_id = %shared.id(), "Event loop stopped.");
    }
}

/// Body of a worker thread: initialize the module, report back, then run the loop.
pub(crate) fn run_worker(
    shared: Arc<WorkerShared>,
    runtime: Runtime,
    module: Arc<dyn Module>,
    init_tx: SyncSender<Result<(), Reason>>,
) {
    worker::set_current(Some(WeakWorker::from_shared(&shared)));
    let mut event_loop = EventLoop::new(shared, runtime);

    match event_loop.init(module.as_ref()) {
        Ok(()) => {
            event_loop.shared.set_state(WorkerState::Running);
            if init_tx.send(Ok(())).is_err() {
                // Nobody holds a handle to a worker whose spawn timed out.
                debug!(worker_id = %event_loop.id(), "Spawner gave up waiting for initialization.");
                event_loop.shutdown();
                return;
            }
            event_loop.run();
        }
        Err(reason) => {
            warn!(worker_id = %event_loop.id(), module = module.name(), error = %reason, "Module failed to initialize.");
            // Terminated before the spawner hears about it, so no live handle escapes.
            event_loop.shutdown();
            let _ = init_tx.send(Err(reason));
        }
    }
}
