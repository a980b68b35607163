//! Promise / Deferred - single-value async results with propagating rejection.
//!
//! # State machine
//! - Pending -> Fulfilled(value)
//! - Pending -> Rejected(reason)
//!
//! Both are terminal. Settling happens under a lock, so under concurrent
//! `resolve`/`reject` from different threads exactly one wins; the rest are no-ops.
//!
//! # Continuations
//! `then` / `catch` / `then_or_else` register a continuation and return a derived
//! promise. Continuations never run inline with the call that attached them: they are
//! queued as jobs on the event loop of the worker that attached them (or on a shared
//! background thread outside workers). A handler that fails or panics rejects the
//! derived promise; a missing handler passes the outcome through unchanged. Returning
//! `Next::Adopt(inner)` makes the derived promise follow `inner`, and adoption is
//! itself just another queued continuation, so long chains never recurse.

mod scheduler;

use std::future::{Future, IntoFuture};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::warn;

use self::scheduler::Scheduler;
use crate::error::{Reason, UnhandledRejection, panic_reason};

/// Public view of a promise's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// What a continuation returns on success.
pub enum Next<T> {
    /// Fulfill the derived promise with this value.
    Value(T),
    /// Make the derived promise adopt this promise's eventual outcome.
    Adopt(Promise<T>),
}

type Outcome<T> = Result<T, Reason>;

struct Reaction<T> {
    scheduler: Scheduler,
    callback: Box<dyn FnOnce(Outcome<T>) + Send>,
}

enum State<T> {
    Pending(Vec<Reaction<T>>),
    Fulfilled(T),
    Rejected(Reason),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
    /// Set once anything has subscribed to or waited on the outcome.
    handled: AtomicBool,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let State::Rejected(reason) = state
            && !*self.handled.get_mut()
        {
            report_unhandled(UnhandledRejection {
                reason: reason.clone(),
            });
        }
    }
}

type RejectionHook = Arc<dyn Fn(&UnhandledRejection) + Send + Sync>;

static UNHANDLED_REJECTION_HOOK: RwLock<Option<RejectionHook>> = RwLock::new(None);

/// Installs a process-wide hook called for every unhandled rejection, in addition to
/// the `warn` log. Replaces any previous hook.
pub fn set_unhandled_rejection_hook<F>(hook: F)
where
    F: Fn(&UnhandledRejection) + Send + Sync + 'static,
{
    let mut slot = UNHANDLED_REJECTION_HOOK
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    *slot = Some(Arc::new(hook));
}

/// Restores the default: unhandled rejections are logged at `warn`.
pub fn clear_unhandled_rejection_hook() {
    let mut slot = UNHANDLED_REJECTION_HOOK
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    *slot = None;
}

fn report_unhandled(rejection: UnhandledRejection) {
    warn!(reason = %rejection.reason, "Promise rejected with no handler attached.");
    let hook = UNHANDLED_REJECTION_HOOK
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(hook) = hook {
        hook(&rejection);
    }
}

/// Read side of a single-value async result.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Write side paired 1:1 with a [`Promise`].
///
/// Clones settle the same promise; only the first `resolve`/`reject` takes effect.
pub struct Deferred<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// A fresh pending pair.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                settled: Condvar::new(),
                handled: AtomicBool::new(false),
            }),
        }
    }

    /// The read side. Every call returns a handle to the same promise.
    pub fn promise(&self) -> Promise<T> {
        Promise {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Fulfills the promise. Returns `false` if it was already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Rejects the promise. Returns `false` if it was already settled.
    pub fn reject(&self, reason: Reason) -> bool {
        self.settle(Err(reason))
    }

    fn settle(&self, outcome: Outcome<T>) -> bool {
        let reactions = {
            let mut state = self.inner.lock();
            if !matches!(*state, State::Pending(_)) {
                return false;
            }
            let settled = match &outcome {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(reason) => State::Rejected(reason.clone()),
            };
            match std::mem::replace(&mut *state, settled) {
                State::Pending(reactions) => reactions,
                State::Fulfilled(_) | State::Rejected(_) => Vec::new(),
            }
        };
        self.inner.settled.notify_all();

        for reaction in reactions {
            let outcome = outcome.clone();
            let callback = reaction.callback;
            reaction
                .scheduler
                .schedule(Box::new(move || callback(outcome)));
        }
        true
    }

    /// Follows `source` until it settles.
    fn adopt(self, source: Promise<T>) {
        if Arc::ptr_eq(&self.inner, &source.inner) {
            self.reject(Reason::String("a promise cannot adopt itself".to_string()));
            return;
        }
        source.subscribe(Scheduler::current(), move |outcome| {
            self.settle(outcome);
        });
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// An already fulfilled promise.
    pub fn resolved(value: T) -> Self {
        let deferred = Deferred::new();
        deferred.resolve(value);
        deferred.promise()
    }

    /// An already rejected promise.
    pub fn rejected(reason: Reason) -> Self {
        let deferred = Deferred::new();
        deferred.reject(reason);
        deferred.promise()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> PromiseState {
        match &*self.inner.lock() {
            State::Pending(_) => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.state() != PromiseState::Pending
    }

    fn subscribe<F>(&self, scheduler: Scheduler, callback: F)
    where
        F: FnOnce(Outcome<T>) + Send + 'static,
    {
        self.inner.handled.store(true, Ordering::SeqCst);
        let mut state = self.inner.lock();
        let outcome = match &mut *state {
            State::Pending(reactions) => {
                reactions.push(Reaction {
                    scheduler,
                    callback: Box::new(callback),
                });
                return;
            }
            State::Fulfilled(value) => Ok(value.clone()),
            State::Rejected(reason) => Err(reason.clone()),
        };
        drop(state);
        scheduler.schedule(Box::new(move || callback(outcome)));
    }

    /// Runs `on_fulfilled` with the value; rejections pass through.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Next<U>, Reason> + Send + 'static,
    {
        self.then_or_else(on_fulfilled, Err)
    }

    /// Runs `on_rejected` with the reason; fulfillment passes through.
    pub fn catch<G>(&self, on_rejected: G) -> Promise<T>
    where
        G: FnOnce(Reason) -> Result<Next<T>, Reason> + Send + 'static,
    {
        self.then_or_else(|value| Ok(Next::Value(value)), on_rejected)
    }

    /// Registers both continuations; whichever runs decides the derived promise.
    pub fn then_or_else<U, F, G>(&self, on_fulfilled: F, on_rejected: G) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<Next<U>, Reason> + Send + 'static,
        G: FnOnce(Reason) -> Result<Next<U>, Reason> + Send + 'static,
    {
        let deferred = Deferred::new();
        let derived = deferred.promise();

        self.subscribe(Scheduler::current(), move |outcome| {
            let next = catch_unwind(AssertUnwindSafe(move || match outcome {
                Ok(value) => on_fulfilled(value),
                Err(reason) => on_rejected(reason),
            }))
            .unwrap_or_else(|payload| Err(panic_reason(payload)));

            match next {
                Ok(Next::Value(value)) => {
                    deferred.resolve(value);
                }
                Ok(Next::Adopt(inner)) => deferred.adopt(inner),
                Err(reason) => {
                    deferred.reject(reason);
                }
            }
        });

        derived
    }

    /// Blocks the calling thread until the promise settles or `timeout` elapses.
    ///
    /// Do not call this on a worker thread for a promise that only that worker's own
    /// continuations can settle.
    /// A timeout too large to represent as a deadline waits without bound.
    pub fn wait(&self, timeout: Duration) -> Option<Outcome<T>> {
        self.inner.handled.store(true, Ordering::SeqCst);
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.lock();
        loop {
            match &*state {
                State::Fulfilled(value) => return Some(Ok(value.clone())),
                State::Rejected(reason) => return Some(Err(reason.clone())),
                State::Pending(_) => {}
            }
            state = match deadline {
                None => self
                    .inner
                    .settled
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let (guard, _) = self
                        .inner
                        .settled
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    guard
                }
            };
        }
    }

    /// Fulfills with every value in order once all fulfill; rejects with the first
    /// rejection.
    pub fn all(promises: impl IntoIterator<Item = Promise<T>>) -> Promise<Vec<T>> {
        let promises: Vec<Promise<T>> = promises.into_iter().collect();
        if promises.is_empty() {
            return Promise::resolved(Vec::new());
        }

        let deferred = Deferred::new();
        let derived = deferred.promise();
        let slots = Arc::new(Mutex::new((vec![None; promises.len()], promises.len())));

        for (index, promise) in promises.iter().enumerate() {
            let deferred = deferred.clone();
            let slots = Arc::clone(&slots);
            promise.subscribe(Scheduler::current(), move |outcome| match outcome {
                Ok(value) => {
                    let mut guard = slots.lock().unwrap_or_else(PoisonError::into_inner);
                    let (values, remaining) = &mut *guard;
                    values[index] = Some(value);
                    *remaining -= 1;
                    if *remaining == 0 {
                        let values = values.iter_mut().filter_map(Option::take).collect();
                        drop(guard);
                        deferred.resolve(values);
                    }
                }
                Err(reason) => {
                    deferred.reject(reason);
                }
            });
        }

        derived
    }
}

impl<T> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.lock() {
            State::Pending(_) => PromiseState::Pending,
            State::Fulfilled(_) => PromiseState::Fulfilled,
            State::Rejected(_) => PromiseState::Rejected,
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

/// Future returned by awaiting a [`Promise`].
///
/// Resolves to `Err` if every [`Deferred`] is dropped without settling.
pub struct PromiseFuture<T> {
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> Future for PromiseFuture<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(Reason::String(
                    "promise dropped before settling".to_string(),
                ))
            })
        })
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Outcome<T>;
    type IntoFuture = PromiseFuture<T>;

    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        self.subscribe(Scheduler::Background, move |outcome| {
            let _ = tx.send(outcome);
        });
        PromiseFuture { rx }
    }
}
