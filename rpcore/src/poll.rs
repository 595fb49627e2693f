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

//! Blocking and wakeup.
//!
//! A [`Poller`] is the only place a consumer may block.  Completion queues
//! park their consumers inside `work` and producers wake them with `kick`;
//! kicks are sticky, so a kick delivered before the target parks is consumed
//! by its next `work` call rather than lost.  OS-level pollers (epoll, IOCP)
//! plug in behind the same trait; [`CondvarPoller`] is the in-process
//! backend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::exec::{Closure, ExecCtx};

/// Outcome of one `work` call.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkResult {
    /// The deadline elapsed with nothing to do.
    Timeout,
    /// The worker was kicked; the caller should re-examine its state.
    Kick,
    /// The poller performed I/O work on the caller's behalf.
    Work,
}

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// An opaque registration token for a set of I/O interests.  The in-process
/// backend only tracks identity; OS backends map this to real handle sets.
#[derive(Clone, Debug)]
pub struct PollEntity {
    id: u64,
}

impl PollEntity {
    pub fn new() -> Self {
        PollEntity {
            id: NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for PollEntity {
    fn default() -> Self {
        PollEntity::new()
    }
}

impl PartialEq for PollEntity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PollEntity {}

struct WorkerCore {
    kicked: bool,
}

struct WorkerInner {
    mu: Mutex<WorkerCore>,
    cv: Condvar,
}

/// A blocked consumer's identity.  Created by each thread that calls into
/// `work`; a kick aimed at a worker is remembered until that worker next
/// parks.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    pub fn new() -> Self {
        Worker {
            inner: Arc::new(WorkerInner {
                mu: Mutex::new(WorkerCore { kicked: false }),
                cv: Condvar::new(),
            }),
        }
    }

    fn kick(&self) {
        let mut core = self.inner.mu.lock();
        core.kicked = true;
        self.inner.cv.notify_one();
    }

    pub(crate) fn same_as(&self, other: &Worker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Worker {
    fn default() -> Self {
        Worker::new()
    }
}

pub trait Poller: Send + Sync {
    /// Blocks the calling worker until it is kicked, work is performed on
    /// its behalf, or the deadline elapses.
    fn work(&self, worker: &Worker, deadline: Instant) -> WorkResult;

    /// Wakes a specific worker, or any one blocked worker when `None`.  A
    /// kick with no worker parked is remembered and consumed by the next
    /// `work` call.
    fn kick(&self, worker: Option<&Worker>);

    /// Wakes everyone, fails future `work` calls fast, and enqueues
    /// `on_done` once the poller will never block a consumer again.
    fn shutdown(&self, ctx: &mut ExecCtx, on_done: Closure);

    fn add_entity(&self, entity: &PollEntity);
    fn del_entity(&self, entity: &PollEntity);
}

struct CondvarPollerState {
    waiters: Vec<Worker>,
    entities: Vec<PollEntity>,
    /// Kicks issued while nobody was parked.
    pending_kicks: usize,
    shut_down: bool,
}

/// The in-process poller: parks workers on per-worker condvars.  There is no
/// I/O here, so `work` never returns [`WorkResult::Work`].
pub struct CondvarPoller {
    state: Mutex<CondvarPollerState>,
}

impl CondvarPoller {
    pub fn new() -> Self {
        CondvarPoller {
            state: Mutex::new(CondvarPollerState {
                waiters: Vec::new(),
                entities: Vec::new(),
                pending_kicks: 0,
                shut_down: false,
            }),
        }
    }
}

impl Default for CondvarPoller {
    fn default() -> Self {
        CondvarPoller::new()
    }
}

impl Poller for CondvarPoller {
    fn work(&self, worker: &Worker, deadline: Instant) -> WorkResult {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return WorkResult::Kick;
            }
            if state.pending_kicks > 0 {
                state.pending_kicks -= 1;
                return WorkResult::Kick;
            }
            state.waiters.push(worker.clone());
        }

        let result = {
            let mut core = worker.inner.mu.lock();
            loop {
                if core.kicked {
                    core.kicked = false;
                    break WorkResult::Kick;
                }
                if Instant::now() >= deadline {
                    break WorkResult::Timeout;
                }
                worker.inner.cv.wait_until(&mut core, deadline);
            }
        };

        let mut state = self.state.lock();
        state.waiters.retain(|w| !w.same_as(worker));
        result
    }

    fn kick(&self, worker: Option<&Worker>) {
        match worker {
            Some(worker) => worker.kick(),
            None => {
                let mut state = self.state.lock();
                match state.waiters.last() {
                    Some(w) => w.kick(),
                    None => state.pending_kicks += 1,
                }
            }
        }
    }

    fn shutdown(&self, ctx: &mut ExecCtx, on_done: Closure) {
        let waiters = {
            let mut state = self.state.lock();
            state.shut_down = true;
            std::mem::take(&mut state.waiters)
        };
        for w in &waiters {
            w.kick();
        }
        ctx.enqueue(on_done, true);
    }

    fn add_entity(&self, entity: &PollEntity) {
        self.state.lock().entities.push(entity.clone());
    }

    fn del_entity(&self, entity: &PollEntity) {
        let mut state = self.state.lock();
        if let Some(pos) = state.entities.iter().position(|e| e == entity) {
            state.entities.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn kick_before_work_is_not_lost() {
        let poller = CondvarPoller::new();
        poller.kick(None);
        let worker = Worker::new();
        let result = poller.work(&worker, Instant::now() + Duration::from_secs(5));
        assert_eq!(result, WorkResult::Kick);
    }

    #[test]
    fn work_times_out() {
        let poller = CondvarPoller::new();
        let worker = Worker::new();
        let result = poller.work(&worker, Instant::now() + Duration::from_millis(10));
        assert_eq!(result, WorkResult::Timeout);
    }

    #[test]
    fn targeted_kick_wakes_the_worker() {
        let poller = Arc::new(CondvarPoller::new());
        let worker = Worker::new();
        let poller2 = poller.clone();
        let worker2 = worker.clone();
        let handle = std::thread::spawn(move || {
            poller2.work(&worker2, Instant::now() + Duration::from_secs(10))
        });
        // Sticky flag: correct whether the kick lands before or after park.
        poller.kick(Some(&worker));
        assert_eq!(handle.join().unwrap(), WorkResult::Kick);
    }

    #[test]
    fn shutdown_unblocks_and_completes() {
        let poller = Arc::new(CondvarPoller::new());
        let worker = Worker::new();
        let poller2 = poller.clone();
        let worker2 = worker.clone();
        let handle = std::thread::spawn(move || {
            poller2.work(&worker2, Instant::now() + Duration::from_secs(10))
        });
        std::thread::sleep(Duration::from_millis(20));
        let done = Arc::new(AtomicBool::new(false));
        let done2 = done.clone();
        let mut ctx = ExecCtx::new();
        poller.shutdown(
            &mut ctx,
            Closure::new("poller_down", move |_, _| done2.store(true, Ordering::SeqCst)),
        );
        ctx.finish();
        assert_eq!(handle.join().unwrap(), WorkResult::Kick);
        assert!(done.load(Ordering::SeqCst));
        // Workers never block once shut down.
        assert_eq!(
            poller.work(&Worker::new(), Instant::now() + Duration::from_secs(10)),
            WorkResult::Kick
        );
    }

    #[test]
    fn entities_register_and_unregister() {
        let poller = CondvarPoller::new();
        let e = PollEntity::new();
        poller.add_entity(&e);
        assert_eq!(poller.state.lock().entities.len(), 1);
        poller.del_entity(&e);
        assert!(poller.state.lock().entities.is_empty());
    }
}
