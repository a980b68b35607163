//! strand-core
//!
//! Isolated workers with message passing, in-process.
//!
//! # Modules
//! - **runtime**: worker registry (spawn, lookup, counts, shutdown)
//! - **worker**: handles, messages, lifecycle state
//! - **event_loop**: per-worker dispatch of jobs, timers and messages; `WorkerScope`
//! - **module**: worker entry points and their registry
//! - **timer**: delayed / repeating callbacks without drift
//! - **mailbox**: the blocking FIFO in front of each loop
//! - **promise**: `Promise` / `Deferred` with continuations scheduled on the owning loop
//! - **semaphore**: counting semaphore for cross-worker coordination
//! - **config**, **error**, **ids**, **observability**

pub mod config;
pub mod error;
pub mod event_loop;
pub mod ids;
pub mod mailbox;
pub mod module;
pub mod observability;
pub mod promise;
pub mod runtime;
pub mod semaphore;
pub mod timer;
pub mod worker;

pub use config::RuntimeConfig;
pub use error::{
    ConfigError, ModuleLoadError, Reason, RegistryError, UncaughtWorkerError, UnhandledRejection,
};
pub use event_loop::WorkerScope;
pub use ids::{TimerId, WorkerId};
pub use module::{Module, ModuleRegistry, module_fn};
pub use observability::WorkerCounts;
pub use promise::{
    Deferred, Next, Promise, PromiseFuture, PromiseState, clear_unhandled_rejection_hook,
    set_unhandled_rejection_hook,
};
pub use runtime::Runtime;
pub use semaphore::Semaphore;
pub use worker::{MessageEvent, MessageKind, WeakWorker, Worker, WorkerState};
