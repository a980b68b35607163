//! Timer registry: delayed and repeating callbacks for one event loop.
//!
//! # 学習ポイント
//! - BinaryHeap を min-heap として使う（`Ord` を逆順に実装）
//! - HashMap を正とし、heap の古いエントリは遅延削除する
//! - 繰り返しタイマーは「前回の予定時刻 + period」で再登録するのでずれが蓄積しない
//! - `Instant` で表せない期限のタイマーは登録だけされ、発火しない

use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use crate::ids::TimerId;

/// Repeating timers never re-arm faster than this.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Below this heap size stale entries are left for `prune`.
const COMPACT_MIN_HEAP: usize = 64;

/// Heap entry. The heap only holds ids; `TimerRegistry::timers` is the source of truth.
///
/// Reverse ordering so `BinaryHeap` acts as a min-heap on `(due, seq)`: earliest first,
/// and earlier registration first on ties.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTimer {
    due: Instant,
    seq: u64,
    id: TimerId,
}

impl PartialOrd for ScheduledTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerEntry<F> {
    /// `None` while the callback is being run by the loop.
    callback: Option<F>,
    period: Option<Duration>,
    /// `None` when the due time lies beyond what `Instant` can represent: the timer
    /// stays registered (and cancellable) but never fires.
    due: Option<Instant>,
    /// Registration order, kept across re-arms.
    seq: u64,
}

/// A timer taken out of the registry to be run.
///
/// Hand it back through [`TimerRegistry::finish`] once the callback returns so repeating
/// timers can re-arm.
pub struct FiredTimer<F> {
    pub id: TimerId,
    /// The time this firing was scheduled for (not when it actually ran).
    pub scheduled_for: Instant,
    pub callback: F,
}

/// Pending timers of one event loop.
///
/// Generic over the callback type so the registry knows nothing about workers.
/// Cancelled timers leave stale heap entries behind; they are skipped lazily.
pub struct TimerRegistry<F> {
    next_id: u64,
    next_seq: u64,
    queue: BinaryHeap<ScheduledTimer>,
    timers: HashMap<TimerId, TimerEntry<F>>,
}

impl<F> TimerRegistry<F> {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            next_seq: 0,
            queue: BinaryHeap::new(),
            timers: HashMap::new(),
        }
    }

    /// One-shot timer, fires once `delay` has elapsed and is then removed.
    pub fn after(&mut self, delay: Duration, callback: F) -> TimerId {
        self.after_at(Instant::now(), delay, callback)
    }

    /// [`TimerRegistry::after`] measured from an explicit `now`.
    pub fn after_at(&mut self, now: Instant, delay: Duration, callback: F) -> TimerId {
        self.insert(now.checked_add(delay), None, callback)
    }

    /// Repeating timer, fires every `period`.
    pub fn every(&mut self, period: Duration, callback: F) -> TimerId {
        self.every_at(Instant::now(), period, callback)
    }

    /// [`TimerRegistry::every`] measured from an explicit `now`.
    pub fn every_at(&mut self, now: Instant, period: Duration, callback: F) -> TimerId {
        let period = period.max(MIN_INTERVAL);
        self.insert(now.checked_add(period), Some(period), callback)
    }

    fn insert(&mut self, due: Option<Instant>, period: Option<Duration>, callback: F) -> TimerId {
        let id = TimerId::new(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.timers.insert(
            id,
            TimerEntry {
                callback: Some(callback),
                period,
                due,
                seq,
            },
        );
        if let Some(due) = due {
            self.queue.push(ScheduledTimer { due, seq, id });
        }
        id
    }

    /// Removes a timer. Returns `false` if it already fired or was cancelled.
    ///
    /// Cancelling a repeating timer while its callback runs stops it from re-arming.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let removed = self.timers.remove(&id).is_some();
        if removed {
            self.compact();
        }
        removed
    }

    /// Earliest pending due time. `None` when nothing can fire.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.prune();
        self.queue.peek().map(|entry| entry.due)
    }

    /// Takes the earliest timer whose due time is `<= now`.
    ///
    /// # 実装
    /// 1. 無効になった heap 先頭を捨てる
    /// 2. 先頭がまだ期限前なら `None`
    /// 3. 繰り返しタイマーは map に残したまま callback だけ取り出す
    /// 4. 一回きりのタイマーは map から取り除く
    pub fn pop_due(&mut self, now: Instant) -> Option<FiredTimer<F>> {
        self.prune();
        if self.queue.peek()?.due > now {
            return None;
        }

        let scheduled = self.queue.pop()?;
        let entry = self.timers.get_mut(&scheduled.id)?;
        let callback = if entry.period.is_some() {
            entry.callback.take()?
        } else {
            self.timers.remove(&scheduled.id)?.callback?
        };

        Some(FiredTimer {
            id: scheduled.id,
            scheduled_for: scheduled.due,
            callback,
        })
    }

    /// Returns a fired timer after its callback completed.
    ///
    /// Repeating timers re-arm at `scheduled_for + period`, so running late never
    /// shifts later targets. One-shot and cancelled timers are dropped.
    pub fn finish(&mut self, fired: FiredTimer<F>) {
        let Some(entry) = self.timers.get_mut(&fired.id) else {
            return;
        };
        let Some(period) = entry.period else {
            return;
        };

        entry.due = fired.scheduled_for.checked_add(period);
        entry.callback = Some(fired.callback);
        if let Some(due) = entry.due {
            self.queue.push(ScheduledTimer {
                due,
                seq: entry.seq,
                id: fired.id,
            });
        }
    }

    /// Number of live timers (pending or in flight).
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// No timer is registered, including ones that can never fire.
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Whether a heap entry still refers to a pending firing.
    fn is_live(timers: &HashMap<TimerId, TimerEntry<F>>, scheduled: &ScheduledTimer) -> bool {
        timers.get(&scheduled.id).is_some_and(|entry| {
            entry.due == Some(scheduled.due) && entry.callback.is_some()
        })
    }

    fn prune(&mut self) {
        while let Some(top) = self.queue.peek() {
            if Self::is_live(&self.timers, top) {
                break;
            }
            self.queue.pop();
        }
    }

    /// Drops stale heap entries once they outnumber live timers.
    ///
    /// Keeps `cancel`-heavy patterns (re-arming a long timeout on every message) from
    /// growing the heap for the whole delay window.
    fn compact(&mut self) {
        if self.queue.len() < COMPACT_MIN_HEAP || self.queue.len() <= 2 * self.timers.len() {
            return;
        }
        let timers = &self.timers;
        self.queue.retain(|scheduled| Self::is_live(timers, scheduled));
    }
}

impl<F> Default for TimerRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}
