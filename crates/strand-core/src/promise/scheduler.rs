//! Where promise continuations run.

use std::convert::Infallible;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};

use tracing::{debug, error, warn};

use crate::error::panic_reason;
use crate::mailbox::{Delivery, Job, Mailbox};
use crate::worker::{self, Worker};

const BACKGROUND_THREAD_NAME: &str = "strand-promise-jobs";

/// Captured when a continuation is attached.
///
/// Continuations attached on a worker thread run on that worker's event loop; the
/// handle keeps the worker alive until they have been queued. Everything else runs
/// on one shared background thread.
pub(crate) enum Scheduler {
    Worker(Worker),
    Background,
}

impl Scheduler {
    pub(crate) fn current() -> Self {
        worker::current()
            .and_then(|weak| weak.upgrade())
            .map_or(Scheduler::Background, Scheduler::Worker)
    }

    pub(crate) fn schedule(self, job: Job) {
        match self {
            Scheduler::Worker(worker) => {
                if !worker.post_job(job) {
                    debug!(worker_id = %worker.id(), "Worker terminated, dropping promise continuation.");
                }
            }
            Scheduler::Background => schedule_background(job),
        }
    }
}

fn schedule_background(job: Job) {
    match background() {
        Some(mailbox) => {
            mailbox.post_job(job);
        }
        None => run_job(job),
    }
}

/// Lazily started job thread. `None` if the thread could not be spawned, in which case
/// jobs run inline on the settling thread.
fn background() -> Option<&'static Arc<Mailbox<Infallible>>> {
    static BACKGROUND: OnceLock<Option<Arc<Mailbox<Infallible>>>> = OnceLock::new();
    BACKGROUND
        .get_or_init(|| {
            let mailbox = Arc::new(Mailbox::new());
            let jobs = Arc::clone(&mailbox);
            let spawned = std::thread::Builder::new()
                .name(BACKGROUND_THREAD_NAME.to_string())
                .spawn(move || {
                    loop {
                        match jobs.recv(None, || true) {
                            Delivery::Job(job) => run_job(job),
                            Delivery::Message(never) => match never {},
                            Delivery::Closed => break,
                            Delivery::Timeout | Delivery::Idle => {}
                        }
                    }
                });
            match spawned {
                Ok(_) => Some(mailbox),
                Err(e) => {
                    error!(error = %e, "Failed to start promise job thread, running continuations inline.");
                    None
                }
            }
        })
        .as_ref()
}

fn run_job(job: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        warn!(reason = %panic_reason(payload), "Promise job panicked.");
    }
}
