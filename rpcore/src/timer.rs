/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Ordered expiry of deadlines.
//!
//! Timers are sharded by pointer hash across 32 shards.  Each shard keeps a
//! min-heap of timers inside its current queue window and an unordered
//! overflow list of timers beyond it; the window width adapts to the observed
//! distribution of deadlines.  Shards are kept sorted by their earliest
//! deadline so a check only probes shards that could possibly have expired
//! work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::exec::{Closure, ExecCtx};
use crate::poll::Poller;

const LOG2_NUM_SHARDS: usize = 5;
const NUM_SHARDS: usize = 1 << LOG2_NUM_SHARDS;
const ADD_DEADLINE_SCALE: f64 = 0.33;
const MIN_QUEUE_WINDOW_DURATION: f64 = 0.01;
const MAX_QUEUE_WINDOW_DURATION: f64 = 1.0;

const INVALID_HEAP_INDEX: usize = usize::MAX;

/// A time-decaying weighted average.  Samples accumulate in a batch; each
/// update mixes the batch average into the running mean, regressing towards
/// the initial value when samples stop arriving.
pub(crate) struct TimeAveragedStats {
    init_avg: f64,
    regress_weight: f64,
    persistence_factor: f64,
    batch_total_value: f64,
    batch_num_samples: f64,
    aggregate_total_weight: f64,
    aggregate_weighted_avg: f64,
}

impl TimeAveragedStats {
    pub(crate) fn new(init_avg: f64, regress_weight: f64, persistence_factor: f64) -> Self {
        TimeAveragedStats {
            init_avg,
            regress_weight,
            persistence_factor,
            batch_total_value: 0.0,
            batch_num_samples: 0.0,
            aggregate_total_weight: 0.0,
            aggregate_weighted_avg: init_avg,
        }
    }

    pub(crate) fn add_sample(&mut self, value: f64) {
        self.batch_total_value += value;
        self.batch_num_samples += 1.0;
    }

    pub(crate) fn update_average(&mut self) -> f64 {
        let mut weighted_sum = self.batch_total_value;
        let mut total_weight = self.batch_num_samples;
        if self.regress_weight > 0.0 {
            weighted_sum += self.regress_weight * self.init_avg;
            total_weight += self.regress_weight;
        }
        if self.persistence_factor > 0.0 {
            let prev_sample_weight = self.persistence_factor * self.aggregate_total_weight;
            weighted_sum += prev_sample_weight * self.aggregate_weighted_avg;
            total_weight += prev_sample_weight;
        }
        self.aggregate_weighted_avg = if total_weight > 0.0 {
            weighted_sum / total_weight
        } else {
            self.init_avg
        };
        self.aggregate_total_weight = total_weight;
        self.batch_num_samples = 0.0;
        self.batch_total_value = 0.0;
        self.aggregate_weighted_avg
    }
}

struct TimerCore {
    /// Set by exactly one of expiry or cancellation.
    triggered: bool,
    closure: Option<Closure>,
    /// Position in the shard heap, or INVALID_HEAP_INDEX while on the
    /// overflow list (or in neither).
    heap_index: usize,
}

struct TimerState {
    deadline: Instant,
    core: Mutex<TimerCore>,
}

/// Handle to an armed timer.  The list borrows the timer between `init` and
/// its terminal callback; the handle stays valid for `cancel` throughout.
pub struct Timer {
    state: Arc<TimerState>,
}

impl Timer {
    pub fn deadline(&self) -> Instant {
        self.state.deadline
    }
}

/// Cheap, but good enough, pointer hash for sharding.
fn shard_idx(state: &Arc<TimerState>) -> usize {
    let x = Arc::as_ptr(state) as usize;
    ((x >> 4) ^ (x >> 9) ^ (x >> 14)) & (NUM_SHARDS - 1)
}

struct HeapEntry {
    deadline: Instant,
    state: Arc<TimerState>,
}

/// Explicit min-heap storing each timer's position so removal by handle is
/// O(log n).
struct TimerHeap {
    entries: Vec<HeapEntry>,
}

impl TimerHeap {
    fn new() -> Self {
        TimerHeap {
            entries: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn set_index(&self, i: usize) {
        self.entries[i].state.core.lock().heap_index = i;
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.entries[i].deadline >= self.entries[parent].deadline {
                break;
            }
            self.entries.swap(i, parent);
            self.set_index(i);
            i = parent;
        }
        self.set_index(i);
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let mut smallest = i;
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.entries.len()
                    && self.entries[child].deadline < self.entries[smallest].deadline
                {
                    smallest = child;
                }
            }
            if smallest == i {
                break;
            }
            self.entries.swap(i, smallest);
            self.set_index(i);
            i = smallest;
        }
        self.set_index(i);
    }

    /// Adds a timer; returns true if it became the new earliest entry.
    fn add(&mut self, state: Arc<TimerState>) -> bool {
        let ptr = Arc::as_ptr(&state);
        let deadline = state.deadline;
        self.entries.push(HeapEntry { deadline, state });
        self.sift_up(self.entries.len() - 1);
        std::ptr::eq(Arc::as_ptr(&self.entries[0].state), ptr)
    }

    fn top(&self) -> Option<&HeapEntry> {
        self.entries.first()
    }

    fn remove_at(&mut self, i: usize) {
        let last = self.entries.len() - 1;
        self.entries.swap(i, last);
        self.entries.pop();
        if i < self.entries.len() {
            self.set_index(i);
            self.sift_up(i);
            self.sift_down(i);
        }
    }

    fn pop(&mut self) -> Option<Arc<TimerState>> {
        if self.entries.is_empty() {
            return None;
        }
        let state = self.entries[0].state.clone();
        self.remove_at(0);
        Some(state)
    }

    fn drain(&mut self) -> Vec<Arc<TimerState>> {
        self.entries.drain(..).map(|e| e.state).collect()
    }
}

struct ShardCore {
    stats: TimeAveragedStats,
    /// All and only timers with deadlines below this are in the heap.
    queue_deadline_cap: Instant,
    heap: TimerHeap,
    /// Timers whose deadline is at or beyond the cap.
    list: Vec<Arc<TimerState>>,
}

impl ShardCore {
    fn compute_min_deadline(&self) -> Instant {
        match self.heap.top() {
            Some(entry) => entry.deadline,
            None => self.queue_deadline_cap,
        }
    }

    /// Called when the heap is empty and `now` has reached the cap: widen
    /// the window from the deadline statistics and pull overflow timers
    /// under the new cap into the heap.  Returns whether the heap is
    /// non-empty afterwards.
    fn refill_queue(&mut self, now: Instant) -> bool {
        let computed = self.stats.update_average() * ADD_DEADLINE_SCALE;
        let delta = computed.clamp(MIN_QUEUE_WINDOW_DURATION, MAX_QUEUE_WINDOW_DURATION);
        self.queue_deadline_cap =
            now.max(self.queue_deadline_cap) + Duration::from_secs_f64(delta);
        let cap = self.queue_deadline_cap;
        let mut i = 0;
        while i < self.list.len() {
            if self.list[i].deadline < cap {
                let state = self.list.swap_remove(i);
                self.heap.add(state);
            } else {
                i += 1;
            }
        }
        !self.heap.is_empty()
    }

    /// Pops the next timer with deadline <= now, marking it triggered, or
    /// returns None.
    fn pop_one(&mut self, now: Instant) -> Option<Arc<TimerState>> {
        loop {
            if self.heap.is_empty() {
                if now < self.queue_deadline_cap {
                    return None;
                }
                if !self.refill_queue(now) {
                    return None;
                }
            }
            let top = self.heap.top().expect("refilled heap is non-empty");
            if top.deadline > now {
                return None;
            }
            let state = self.heap.pop().expect("heap top exists");
            let mut core = state.core.lock();
            core.triggered = true;
            core.heap_index = INVALID_HEAP_INDEX;
            drop(core);
            return Some(state);
        }
    }
}

struct TimerShard {
    core: Mutex<ShardCore>,
}

struct ShardQueue {
    /// Shard ids sorted by min_deadline; only `order[0]` need be probed.
    order: [usize; NUM_SHARDS],
    /// Shard id -> index in `order`.
    position: [usize; NUM_SHARDS],
    min_deadline: [Instant; NUM_SHARDS],
}

impl ShardQueue {
    fn swap_adjacent(&mut self, first: usize) {
        self.order.swap(first, first + 1);
        self.position[self.order[first]] = first;
        self.position[self.order[first + 1]] = first + 1;
    }

    /// Bubbles a shard towards its sorted position after its min_deadline
    /// changed.
    fn note_deadline_change(&mut self, shard: usize) {
        let mut pos = self.position[shard];
        while pos > 0 && self.min_deadline[shard] < self.min_deadline[self.order[pos - 1]] {
            self.swap_adjacent(pos - 1);
            pos -= 1;
        }
        while pos < NUM_SHARDS - 1 && self.min_deadline[shard] > self.min_deadline[self.order[pos + 1]]
        {
            self.swap_adjacent(pos);
            pos += 1;
        }
    }
}

/// The sharded timer list.  Deadlines are monotonic [`Instant`]s; `now` is
/// always supplied by the caller so tests can drive time explicitly.
pub struct TimerList {
    shards: Vec<TimerShard>,
    queue: Mutex<ShardQueue>,
    /// Allow only one expiry sweep at once; contended checkers back off.
    checker: Mutex<()>,
    poller: Mutex<Option<Arc<dyn Poller>>>,
    shut_down: AtomicBool,
}

impl TimerList {
    pub fn new(now: Instant) -> Self {
        let mut order = [0usize; NUM_SHARDS];
        let mut position = [0usize; NUM_SHARDS];
        for i in 0..NUM_SHARDS {
            order[i] = i;
            position[i] = i;
        }
        let shards = (0..NUM_SHARDS)
            .map(|_| TimerShard {
                core: Mutex::new(ShardCore {
                    stats: TimeAveragedStats::new(1.0 / ADD_DEADLINE_SCALE, 0.1, 0.5),
                    queue_deadline_cap: now,
                    heap: TimerHeap::new(),
                    list: Vec::new(),
                }),
            })
            .collect();
        TimerList {
            shards,
            queue: Mutex::new(ShardQueue {
                order,
                position,
                min_deadline: [now; NUM_SHARDS],
            }),
            checker: Mutex::new(()),
            poller: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Attaches the poller to kick when the earliest pending deadline moves
    /// up, so a blocked consumer re-evaluates its sleep.
    pub fn attach_poller(&self, poller: Arc<dyn Poller>) {
        *self.poller.lock() = Some(poller);
    }

    fn kick_poller(&self) {
        if let Some(p) = self.poller.lock().as_ref() {
            p.kick(None);
        }
    }

    /// Arms a timer.  The closure runs exactly once: with `success=true` when
    /// the deadline is reached (immediately if it already passed), with
    /// `success=false` on cancellation or list shutdown.
    pub fn init(
        &self,
        ctx: &mut ExecCtx,
        now: Instant,
        deadline: Instant,
        closure: Closure,
    ) -> Timer {
        let state = Arc::new(TimerState {
            deadline,
            core: Mutex::new(TimerCore {
                triggered: false,
                closure: None,
                heap_index: INVALID_HEAP_INDEX,
            }),
        });
        if self.shut_down.load(Ordering::Acquire) {
            state.core.lock().triggered = true;
            ctx.enqueue(closure, false);
            return Timer { state };
        }
        if deadline <= now {
            state.core.lock().triggered = true;
            ctx.enqueue(closure, true);
            return Timer { state };
        }
        state.core.lock().closure = Some(closure);

        let sidx = shard_idx(&state);
        let is_first = {
            let mut core = self.shards[sidx].core.lock();
            core.stats
                .add_sample((deadline - now).as_secs_f64());
            if deadline < core.queue_deadline_cap {
                core.heap.add(state.clone())
            } else {
                core.list.push(state.clone());
                false
            }
        };

        // The deadline may have lowered the shard's minimum; adjust the
        // shard queue and wake the poller if the global front moved up.
        if is_first {
            let mut queue = self.queue.lock();
            if deadline < queue.min_deadline[sidx] {
                let old_front = queue.min_deadline[queue.order[0]];
                queue.min_deadline[sidx] = deadline;
                queue.note_deadline_change(sidx);
                let kick = queue.order[0] == sidx && deadline < old_front;
                drop(queue);
                if kick {
                    self.kick_poller();
                }
            }
        }
        Timer { state }
    }

    /// Cancels a pending timer; its closure is enqueued with
    /// `success=false`.  No-op if the timer already fired or was cancelled —
    /// the `triggered` bit makes the race with expiry unambiguous.
    pub fn cancel(&self, ctx: &mut ExecCtx, timer: &Timer) {
        let sidx = shard_idx(&timer.state);
        let mut shard = self.shards[sidx].core.lock();
        let (closure, heap_index) = {
            let mut core = timer.state.core.lock();
            if core.triggered {
                return;
            }
            core.triggered = true;
            (core.closure.take(), core.heap_index)
        };
        if heap_index != INVALID_HEAP_INDEX {
            shard.heap.remove_at(heap_index);
        } else {
            shard
                .list
                .retain(|s| !Arc::ptr_eq(s, &timer.state));
        }
        drop(shard);
        if let Some(closure) = closure {
            ctx.enqueue(closure, false);
        }
    }

    /// Advances a shard at the front of the queue: first settles its
    /// minimum (a shard whose heap ran dry advertises its old window cap
    /// until refilled), then pops one expired timer only if the recorded
    /// minimum was accurate.  Returning a changed minimum without popping
    /// lets the sweep re-sort and fire the globally earliest timer first.
    fn pop_front_timer(
        &self,
        ctx: &mut ExecCtx,
        sidx: usize,
        now: Instant,
        recorded_min: Instant,
    ) -> (bool, Instant) {
        let mut shard = self.shards[sidx].core.lock();
        if shard.heap.is_empty() && now >= shard.queue_deadline_cap {
            shard.refill_queue(now);
        }
        let min = shard.compute_min_deadline();
        if min != recorded_min || min >= now {
            return (false, min);
        }
        match shard.pop_one(now) {
            Some(state) => {
                let closure = state.core.lock().closure.take();
                if let Some(closure) = closure {
                    ctx.enqueue(closure, true);
                }
                (true, shard.compute_min_deadline())
            }
            None => {
                debug_assert!(false, "settled front shard had nothing to pop");
                (false, now)
            }
        }
    }

    /// Runs every timer whose deadline is at or before `now`, earliest
    /// first.  Updates `next` (if given) with the earliest still-pending
    /// deadline.  When a sweep is already in progress on another thread,
    /// shortens `next` so the caller retries shortly, and reports no work
    /// done.
    pub fn check(&self, ctx: &mut ExecCtx, now: Instant, next: Option<&mut Instant>) -> bool {
        let Some(_checker) = self.checker.try_lock() else {
            if let Some(next) = next {
                *next = (*next).min(now + Duration::from_millis(1));
            }
            return false;
        };
        let mut ran_any = false;
        let mut queue = self.queue.lock();
        while queue.min_deadline[queue.order[0]] < now {
            let front = queue.order[0];
            let recorded = queue.min_deadline[front];
            let (fired, new_min) = self.pop_front_timer(ctx, front, now, recorded);
            ran_any |= fired;
            queue.min_deadline[front] = new_min;
            queue.note_deadline_change(front);
        }
        if let Some(next) = next {
            *next = (*next).min(queue.min_deadline[queue.order[0]]);
        }
        ran_any
    }

    /// Cancels every remaining timer: each closure runs once with
    /// `success=false`.  Timers armed afterwards fail immediately.
    pub fn shutdown(&self, ctx: &mut ExecCtx) {
        self.shut_down.store(true, Ordering::Release);
        for shard in &self.shards {
            let mut core = shard.core.lock();
            let mut all = core.heap.drain();
            all.append(&mut core.list);
            drop(core);
            for state in all {
                let closure = {
                    let mut c = state.core.lock();
                    if c.triggered {
                        continue;
                    }
                    c.triggered = true;
                    c.heap_index = INVALID_HEAP_INDEX;
                    c.closure.take()
                };
                if let Some(closure) = closure {
                    ctx.enqueue(closure, false);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn recording_closure(
        order: &Arc<StdMutex<Vec<(&'static str, bool)>>>,
        tag: &'static str,
    ) -> Closure {
        let order = order.clone();
        Closure::new("record", move |_, success| {
            order.lock().unwrap().push((tag, success));
        })
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut ctx = ExecCtx::new();
        timers.init(
            &mut ctx,
            t0,
            t0 + Duration::from_millis(50),
            recording_closure(&order, "t1"),
        );
        timers.init(
            &mut ctx,
            t0,
            t0 + Duration::from_millis(30),
            recording_closure(&order, "t2"),
        );
        timers.init(
            &mut ctx,
            t0,
            t0 + Duration::from_millis(40),
            recording_closure(&order, "t3"),
        );
        assert!(timers.check(&mut ctx, t0 + Duration::from_millis(60), None));
        ctx.finish();
        assert_eq!(
            *order.lock().unwrap(),
            vec![("t2", true), ("t3", true), ("t1", true)]
        );
    }

    #[test]
    fn past_deadline_fires_immediately() {
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut ctx = ExecCtx::new();
        timers.init(&mut ctx, t0, t0, recording_closure(&order, "t"));
        ctx.finish();
        assert_eq!(*order.lock().unwrap(), vec![("t", true)]);
    }

    #[test]
    fn cancel_before_deadline_fires_with_failure() {
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut ctx = ExecCtx::new();
        let timer = timers.init(
            &mut ctx,
            t0,
            t0 + Duration::from_secs(10),
            recording_closure(&order, "t"),
        );
        timers.cancel(&mut ctx, &timer);
        // Second cancel is a no-op.
        timers.cancel(&mut ctx, &timer);
        ctx.finish();
        assert_eq!(*order.lock().unwrap(), vec![("t", false)]);

        let mut ctx = ExecCtx::new();
        assert!(!timers.check(&mut ctx, t0 + Duration::from_secs(20), None));
        ctx.finish();
        assert_eq!(order.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancel_after_expiry_is_a_no_op() {
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut ctx = ExecCtx::new();
        let timer = timers.init(
            &mut ctx,
            t0,
            t0 + Duration::from_millis(5),
            recording_closure(&order, "t"),
        );
        assert!(timers.check(&mut ctx, t0 + Duration::from_millis(10), None));
        timers.cancel(&mut ctx, &timer);
        ctx.finish();
        assert_eq!(*order.lock().unwrap(), vec![("t", true)]);
    }

    #[test]
    fn every_armed_timer_eventually_fires_exactly_once() {
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let count = Arc::new(AtomicUsize::new(0));
        let mut ctx = ExecCtx::new();
        // Spread deadlines far beyond the queue window so the overflow list
        // and refill path are exercised.
        for i in 0..200u64 {
            let count = count.clone();
            timers.init(
                &mut ctx,
                t0,
                t0 + Duration::from_millis(10 * i + 1),
                Closure::new("bump", move |_, success| {
                    assert!(success);
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        let mut now = t0;
        for _ in 0..40 {
            now += Duration::from_millis(60);
            timers.check(&mut ctx, now, None);
        }
        timers.check(&mut ctx, t0 + Duration::from_secs(10), None);
        ctx.finish();
        assert_eq!(count.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn check_reports_next_pending_deadline() {
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let mut ctx = ExecCtx::new();
        timers.init(
            &mut ctx,
            t0,
            t0 + Duration::from_millis(500),
            Closure::noop(),
        );
        let mut next = t0 + Duration::from_secs(60);
        timers.check(&mut ctx, t0 + Duration::from_millis(1), Some(&mut next));
        ctx.finish();
        assert!(next <= t0 + Duration::from_millis(500));
    }

    #[test]
    fn contended_check_shortens_next() {
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let guard = timers.checker.lock();
        let mut ctx = ExecCtx::new();
        let mut next = t0 + Duration::from_secs(60);
        let ran = timers.check(&mut ctx, t0, Some(&mut next));
        drop(guard);
        assert!(!ran);
        assert_eq!(next, t0 + Duration::from_millis(1));
        ctx.finish();
    }

    #[test]
    fn shutdown_cancels_remaining_timers() {
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut ctx = ExecCtx::new();
        for tag in ["a", "b"] {
            timers.init(
                &mut ctx,
                t0,
                t0 + Duration::from_secs(5),
                recording_closure(&order, tag),
            );
        }
        timers.shutdown(&mut ctx);
        // Arming after shutdown fails closed.
        timers.init(
            &mut ctx,
            t0,
            t0 + Duration::from_secs(5),
            recording_closure(&order, "late"),
        );
        ctx.finish();
        let fired = order.lock().unwrap().clone();
        assert_eq!(fired.len(), 3);
        assert!(fired.iter().all(|(_, success)| !success));
    }

    // Cancellation racing expiry: the closure runs exactly once, with the
    // success value of whichever side took the triggered bit.
    #[test]
    fn cancel_races_expiry_fires_exactly_once() {
        for _ in 0..50 {
            let t0 = Instant::now();
            let timers = Arc::new(TimerList::new(t0));
            let count = Arc::new(AtomicUsize::new(0));
            let mut ctx = ExecCtx::new();
            let count2 = count.clone();
            let timer = Arc::new(timers.init(
                &mut ctx,
                t0,
                t0 + Duration::from_micros(50),
                Closure::new("bump", move |_, _| {
                    count2.fetch_add(1, Ordering::SeqCst);
                }),
            ));
            let timers2 = timers.clone();
            let timer2 = timer.clone();
            let canceller = std::thread::spawn(move || {
                let mut ctx = ExecCtx::new();
                timers2.cancel(&mut ctx, &timer2);
                ctx.finish();
            });
            timers.check(&mut ctx, t0 + Duration::from_secs(1), None);
            canceller.join().unwrap();
            ctx.finish();
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn earlier_deadline_kicks_the_attached_poller() {
        use crate::poll::{CondvarPoller, Poller, WorkResult, Worker};
        let t0 = Instant::now();
        let timers = TimerList::new(t0);
        let poller = Arc::new(CondvarPoller::new());
        timers.attach_poller(poller.clone());
        let mut ctx = ExecCtx::new();
        // Warm the queue windows so the next timer lands in a heap.
        timers.init(
            &mut ctx,
            t0,
            t0 + Duration::from_millis(500),
            Closure::noop(),
        );
        timers.check(&mut ctx, t0 + Duration::from_millis(600), None);
        ctx.flush();
        // This deadline undercuts every shard minimum: the poller is kicked
        // so a blocked consumer re-evaluates its sleep.
        timers.init(
            &mut ctx,
            t0 + Duration::from_millis(600),
            t0 + Duration::from_millis(605),
            Closure::noop(),
        );
        let worker = Worker::new();
        assert_eq!(poller.work(&worker, Instant::now()), WorkResult::Kick);
        ctx.finish();
    }

    #[test]
    fn time_averaged_stats_regresses_towards_init() {
        let mut stats = TimeAveragedStats::new(1000.0, 0.5, 0.4);
        assert_eq!(stats.update_average(), 1000.0);
        stats.add_sample(0.0);
        let avg = stats.update_average();
        assert!(avg < 1000.0);
        // With no further samples the average climbs back towards init_avg.
        let rebound = stats.update_average();
        assert!(rebound > avg);
    }
}
