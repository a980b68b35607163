//! Semaphore - スレッド間で共有するカウンティングセマフォ
//!
//! # 学習ポイント
//! - Mutex + Condvar による blocking wait
//! - チケットキューによる FIFO な待機者の解放
//! - timeout 時にカウントを変えずに抜ける

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

struct SemaphoreState {
    count: usize,
    /// Tickets of blocked waiters, oldest first.
    waiters: VecDeque<u64>,
    next_ticket: u64,
}

struct SemaphoreInner {
    state: Mutex<SemaphoreState>,
    changed: Condvar,
}

/// A counting semaphore.
///
/// Clones share the same count, so one clone can be handed to a worker while another
/// stays with the controlling thread. Blocked waiters are served in FIFO order: the
/// oldest waiter takes permits first, and later waiters queue behind it even if they
/// ask for fewer.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

impl Semaphore {
    /// 初期カウント `initial` の Semaphore を作成
    pub fn new(initial: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                state: Mutex::new(SemaphoreState {
                    count: initial,
                    waiters: VecDeque::new(),
                    next_ticket: 0,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until one permit is available, then takes it.
    pub fn wait(&self) {
        self.acquire(1, None);
    }

    /// Blocks until `permits` are available or `timeout` elapses.
    ///
    /// Returns `true` with the permits taken, or `false` with the count unchanged.
    /// A timeout too large to represent as a deadline waits without bound.
    pub fn try_wait(&self, timeout: Duration, permits: usize) -> bool {
        self.acquire(permits, Instant::now().checked_add(timeout))
    }

    /// Adds `permits` to the count and wakes waiters.
    pub fn signal(&self, permits: usize) {
        if permits == 0 {
            return;
        }
        let mut state = self.lock();
        state.count = state.count.saturating_add(permits);
        drop(state);
        self.inner.changed.notify_all();
    }

    /// `signal(1)` と同じ
    pub fn signal_one(&self) {
        self.signal(1);
    }

    /// Current count.
    pub fn available(&self) -> usize {
        self.lock().count
    }

    /// # 実装
    /// 1. 待機者がいなくてカウントが足りれば即座に取る
    /// 2. 足りなければチケットを発行して待機キューに並ぶ
    /// 3. 先頭かつカウントが足りた時点で取り、次の待機者を起こす
    /// 4. deadline を過ぎたらチケットを外して false（`None` は無期限）
    fn acquire(&self, permits: usize, deadline: Option<Instant>) -> bool {
        let mut state = self.lock();
        if state.waiters.is_empty() && state.count >= permits {
            state.count -= permits;
            return true;
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiters.push_back(ticket);

        loop {
            if state.waiters.front() == Some(&ticket) && state.count >= permits {
                state.waiters.pop_front();
                state.count -= permits;
                let more_waiters = !state.waiters.is_empty();
                drop(state);
                if more_waiters {
                    // The next waiter may be satisfiable by what is left.
                    self.inner.changed.notify_all();
                }
                return true;
            }

            match deadline {
                None => {
                    state = self
                        .inner
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiters.retain(|t| *t != ticket);
                        drop(state);
                        // Leaving may have promoted another waiter to the head.
                        self.inner.changed.notify_all();
                        return false;
                    }
                    let (guard, _) = self
                        .inner
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Semaphore")
            .field("count", &state.count)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
