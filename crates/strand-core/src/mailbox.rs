//! Mailbox - the FIFO queue in front of one event loop.
//!
//! Any thread may post; only the owning loop receives. Blocking receive is a
//! `Mutex` + `Condvar` pair, so an idle loop sleeps without burning CPU.
//!
//! # 学習ポイント
//! - メッセージとジョブ（promise の継続）を別々の FIFO で持つ
//! - deadline 付きの blocking recv（`wait_timeout`）
//! - close 後の post は false を返して捨てる

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A unit of deferred work, e.g. a promise continuation.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// What [`Mailbox::recv`] handed back.
pub enum Delivery<M> {
    Job(Job),
    Message(M),
    /// The deadline passed before (or while) anything else was pending.
    Timeout,
    /// Empty, no deadline, and the keep-alive check said nobody can post anymore.
    Idle,
    /// The mailbox was closed; pending entries are gone.
    Closed,
}

struct MailboxState<M> {
    messages: VecDeque<M>,
    jobs: VecDeque<Job>,
    closed: bool,
}

/// Thread-safe FIFO of messages plus a separate FIFO of jobs.
///
/// Jobs are always handed out before messages. Queues are unbounded.
pub struct Mailbox<M> {
    state: Mutex<MailboxState<M>>,
    available: Condvar,
}

impl<M> Mailbox<M> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MailboxState {
                messages: VecDeque::new(),
                jobs: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueues a message. Returns `false` (and drops it) if the mailbox is closed.
    ///
    /// # 実装
    /// 1. Mutex をロック
    /// 2. close 済みなら false
    /// 3. メッセージを push_back
    /// 4. Condvar で待機中の loop に通知
    pub fn post(&self, message: M) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.messages.push_back(message);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Enqueues a job. Returns `false` (and drops it) if the mailbox is closed.
    pub fn post_job(&self, job: Job) -> bool {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            drop(job);
            return false;
        }
        state.jobs.push_back(job);
        drop(state);
        self.available.notify_one();
        true
    }

    /// Takes the next item, blocking until there is one.
    ///
    /// Order of precedence: closed, jobs, an expired `deadline`, messages. With no
    /// deadline and nothing queued, `keep_alive` is consulted (under the lock) and
    /// `Delivery::Idle` is returned once it reports `false`.
    pub fn recv(&self, deadline: Option<Instant>, keep_alive: impl Fn() -> bool) -> Delivery<M> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Delivery::Closed;
            }
            if let Some(job) = state.jobs.pop_front() {
                return Delivery::Job(job);
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Delivery::Timeout;
            }
            if let Some(message) = state.messages.pop_front() {
                return Delivery::Message(message);
            }

            match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let (guard, _) = self
                        .available
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
                None => {
                    if !keep_alive() {
                        return Delivery::Idle;
                    }
                    state = self
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Closes the mailbox and drops everything still queued. Idempotent.
    ///
    /// Returns how many entries were dropped.
    pub fn close(&self) -> usize {
        let (messages, jobs) = {
            let mut state = self.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.messages),
                std::mem::take(&mut state.jobs),
            )
        };
        self.available.notify_all();
        // Dropped outside the lock: jobs may own handles whose drop wakes this mailbox.
        messages.len() + jobs.len()
    }

    /// Makes a blocked `recv` re-check its keep-alive condition.
    pub fn wake(&self) {
        let _guard = self.lock();
        self.available.notify_all();
    }

    /// close 済みかどうか
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Queued messages plus queued jobs.
    pub fn len(&self) -> usize {
        let state = self.lock();
        state.messages.len() + state.jobs.len()
    }

    /// No message and no job queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M> Default for Mailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn expect_message<M>(delivery: Delivery<M>) -> M {
        match delivery {
            Delivery::Message(m) => m,
            _ => panic!("expected a message"),
        }
    }

    #[test]
    fn messages_come_out_in_arrival_order() {
        let mailbox = Mailbox::new();
        for i in 0..5 {
            assert!(mailbox.post(i));
        }
        let received: Vec<i32> = (0..5)
            .map(|_| expect_message(mailbox.recv(None, || true)))
            .collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn jobs_take_precedence_over_messages() {
        let mailbox = Mailbox::new();
        mailbox.post("message");
        mailbox.post_job(Box::new(|| {}));

        assert!(matches!(mailbox.recv(None, || true), Delivery::Job(_)));
        assert_eq!(expect_message(mailbox.recv(None, || true)), "message");
    }

    #[test]
    fn expired_deadline_beats_queued_messages() {
        let mailbox = Mailbox::new();
        mailbox.post(1);
        let past = Instant::now();
        assert!(matches!(mailbox.recv(Some(past), || true), Delivery::Timeout));
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn recv_times_out_when_empty() {
        let mailbox: Mailbox<()> = Mailbox::new();
        let start = Instant::now();
        let delivery = mailbox.recv(Some(start + Duration::from_millis(50)), || true);
        assert!(matches!(delivery, Delivery::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn close_drops_pending_and_rejects_new_posts() {
        let mailbox = Mailbox::new();
        mailbox.post(1);
        mailbox.post(2);
        assert_eq!(mailbox.close(), 2);
        assert_eq!(mailbox.close(), 0);
        assert!(!mailbox.post(3));
        assert!(!mailbox.post_job(Box::new(|| {})));
        assert!(matches!(mailbox.recv(None, || true), Delivery::Closed));
    }

    #[test]
    fn idle_when_keep_alive_is_false() {
        let mailbox: Mailbox<()> = Mailbox::new();
        assert!(matches!(mailbox.recv(None, || false), Delivery::Idle));
    }

    #[test]
    fn post_from_other_thread_wakes_recv() {
        let mailbox = Arc::new(Mailbox::new());
        let sender = {
            let mailbox = Arc::clone(&mailbox);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                mailbox.post("hello");
            })
        };
        assert_eq!(expect_message(mailbox.recv(None, || true)), "hello");
        sender.join().unwrap();
    }

    #[test]
    fn wake_rechecks_keep_alive() {
        let mailbox: Arc<Mailbox<()>> = Arc::new(Mailbox::new());
        let alive = Arc::new(AtomicBool::new(true));
        let waker = {
            let mailbox = Arc::clone(&mailbox);
            let alive = Arc::clone(&alive);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                alive.store(false, Ordering::SeqCst);
                mailbox.wake();
            })
        };
        let delivery = mailbox.recv(None, || alive.load(Ordering::SeqCst));
        assert!(matches!(delivery, Delivery::Idle));
        waker.join().unwrap();
    }
}
