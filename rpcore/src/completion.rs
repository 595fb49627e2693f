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

//! The completion queue: the single event sink through which every
//! user-issued operation reports back.
//!
//! Producers pair `begin_op`/`end_op` one-to-one per user operation;
//! consumers call `next` or `pluck` with a monotonic deadline.  Shutdown
//! waits for every begun operation to end, then delivers the remaining
//! events followed by exactly one `QueueShutdown` per consumer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::warn;

use crate::exec::{Closure, ExecCtx};
use crate::poll::{CondvarPoller, Poller, Worker};

/// Maximum number of concurrently blocked `pluck` callers per queue.
pub const MAX_PLUCKERS: usize = 6;

/// Opaque user tag attached to each operation.
pub type Tag = usize;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum EventKind {
    /// An operation begun with `begin_op` finished.
    OpComplete,
    /// The queue shut down; no further events will be delivered.
    QueueShutdown,
    /// The deadline elapsed (also returned when the plucker table is full).
    QueueTimeout,
}

/// A dequeued completion.  `tag` and `success` are meaningful only for
/// [`EventKind::OpComplete`].
#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    pub tag: Tag,
    pub success: bool,
}

impl Event {
    fn shutdown() -> Event {
        Event {
            kind: EventKind::QueueShutdown,
            tag: 0,
            success: false,
        }
    }

    fn timeout() -> Event {
        Event {
            kind: EventKind::QueueTimeout,
            tag: 0,
            success: false,
        }
    }
}

struct CompletionRecord {
    tag: Tag,
    success: bool,
    /// Runs when the event is dequeued, releasing whatever backing state the
    /// producer parked behind the operation.
    done: Option<Closure>,
}

struct CqState {
    completed: VecDeque<CompletionRecord>,
    /// Number of begun-but-not-ended operations, plus one self-reference
    /// released by `shutdown`.
    pending_events: usize,
    shutdown: bool,
    shutdown_called: bool,
    pluckers: Vec<(Tag, Worker)>,
    #[cfg(debug_assertions)]
    outstanding_tags: Vec<Tag>,
}

pub struct CompletionQueue {
    poller: Arc<dyn Poller>,
    state: Mutex<CqState>,
}

impl CompletionQueue {
    pub fn new() -> Arc<Self> {
        CompletionQueue::with_poller(Arc::new(CondvarPoller::new()))
    }

    pub fn with_poller(poller: Arc<dyn Poller>) -> Arc<Self> {
        Arc::new(CompletionQueue {
            poller,
            state: Mutex::new(CqState {
                completed: VecDeque::new(),
                pending_events: 1,
                shutdown: false,
                shutdown_called: false,
                pluckers: Vec::new(),
                #[cfg(debug_assertions)]
                outstanding_tags: Vec::new(),
            }),
        })
    }

    pub fn poller(&self) -> &Arc<dyn Poller> {
        &self.poller
    }

    /// Registers the start of an operation that will later post `tag`.
    /// Must not be called after `shutdown`.
    pub fn begin_op(&self, tag: Tag) {
        let mut state = self.state.lock();
        assert!(
            !state.shutdown_called,
            "begin_op after completion queue shutdown"
        );
        state.pending_events += 1;
        #[cfg(debug_assertions)]
        state.outstanding_tags.push(tag);
    }

    /// Posts the completion for a begun operation.  If this was the last
    /// pending operation and shutdown was requested, the queue enters
    /// shutdown and the poller is torn down.
    pub fn end_op(&self, ctx: &mut ExecCtx, tag: Tag, success: bool, done: Option<Closure>) {
        let mut state = self.state.lock();
        #[cfg(debug_assertions)]
        {
            let pos = state
                .outstanding_tags
                .iter()
                .position(|t| *t == tag)
                .expect("end_op without matching begin_op");
            state.outstanding_tags.swap_remove(pos);
        }
        state.completed.push_back(CompletionRecord { tag, success, done });
        state.pending_events -= 1;
        if state.pending_events == 0 {
            debug_assert!(!state.shutdown);
            debug_assert!(state.shutdown_called);
            state.shutdown = true;
            drop(state);
            self.poller
                .shutdown(ctx, Closure::new("cq_poller_down", |_, _| {}));
        } else {
            let plucker = state
                .pluckers
                .iter()
                .find(|(t, _)| *t == tag)
                .map(|(_, w)| w.clone());
            drop(state);
            match plucker {
                Some(worker) => self.poller.kick(Some(&worker)),
                None => self.poller.kick(None),
            }
        }
    }

    /// Blocks until an event is available, the queue shuts down, or the
    /// deadline elapses.
    pub fn next(&self, deadline: Instant) -> Event {
        let mut ctx = ExecCtx::new();
        let worker = Worker::new();
        let mut first_loop = true;
        let event = loop {
            {
                let mut state = self.state.lock();
                if let Some(rec) = state.completed.pop_front() {
                    drop(state);
                    if let Some(done) = rec.done {
                        done.run(&mut ctx, rec.success);
                    }
                    break Event {
                        kind: EventKind::OpComplete,
                        tag: rec.tag,
                        success: rec.success,
                    };
                }
                if state.shutdown {
                    break Event::shutdown();
                }
            }
            if !first_loop && Instant::now() >= deadline {
                break Event::timeout();
            }
            first_loop = false;
            self.poller.work(&worker, deadline);
        };
        ctx.finish();
        event
    }

    /// Blocks until the event for `tag` specifically is available.  At most
    /// [`MAX_PLUCKERS`] callers may wait concurrently; beyond that the call
    /// fails fast with a timeout event.
    pub fn pluck(&self, tag: Tag, deadline: Instant) -> Event {
        let mut ctx = ExecCtx::new();
        let worker = Worker::new();
        let mut first_loop = true;
        let event = loop {
            {
                let mut state = self.state.lock();
                if let Some(pos) = state.completed.iter().position(|r| r.tag == tag) {
                    let rec = state.completed.remove(pos).expect("position in bounds");
                    drop(state);
                    if let Some(done) = rec.done {
                        done.run(&mut ctx, rec.success);
                    }
                    break Event {
                        kind: EventKind::OpComplete,
                        tag: rec.tag,
                        success: rec.success,
                    };
                }
                if state.shutdown {
                    break Event::shutdown();
                }
                if state.pluckers.len() >= MAX_PLUCKERS {
                    warn!(
                        "too many outstanding completion queue pluck calls: maximum is {}",
                        MAX_PLUCKERS
                    );
                    break Event::timeout();
                }
                state.pluckers.push((tag, worker.clone()));
            }
            if !first_loop && Instant::now() >= deadline {
                self.del_plucker(tag, &worker);
                break Event::timeout();
            }
            first_loop = false;
            self.poller.work(&worker, deadline);
            self.del_plucker(tag, &worker);
        };
        ctx.finish();
        event
    }

    fn del_plucker(&self, tag: Tag, worker: &Worker) {
        let mut state = self.state.lock();
        if let Some(pos) = state
            .pluckers
            .iter()
            .position(|(t, w)| *t == tag && w.same_as(worker))
        {
            state.pluckers.swap_remove(pos);
        }
    }

    /// Begins shutdown: idempotent.  Already-begun operations still deliver
    /// their events; once they drain, consumers each receive one
    /// `QueueShutdown`.
    pub fn shutdown(&self, ctx: &mut ExecCtx) {
        let mut state = self.state.lock();
        if state.shutdown_called {
            return;
        }
        state.shutdown_called = true;
        state.pending_events -= 1;
        if state.pending_events == 0 {
            debug_assert!(!state.shutdown);
            state.shutdown = true;
            drop(state);
            self.poller
                .shutdown(ctx, Closure::new("cq_poller_down", |_, _| {}));
        }
    }
}
