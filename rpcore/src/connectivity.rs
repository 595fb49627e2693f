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

//! Connectivity state tracking with edge-delivered watchers.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::exec::{Closure, ExecCtx};

/// The state of a channel, subchannel, or LB policy.
///
/// Transitions flow Idle -> Connecting -> Ready, with TransientFailure and
/// Connecting alternating while connections fail.  Any state may move to
/// Shutdown; nothing leaves Shutdown.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ConnectivityState {
    Idle = 0,
    Connecting = 1,
    Ready = 2,
    TransientFailure = 3,
    Shutdown = 4,
}

impl ConnectivityState {
    fn from_u8(v: u8) -> ConnectivityState {
        match v {
            0 => ConnectivityState::Idle,
            1 => ConnectivityState::Connecting,
            2 => ConnectivityState::Ready,
            3 => ConnectivityState::TransientFailure,
            _ => ConnectivityState::Shutdown,
        }
    }
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// A shared slot holding the state a watcher last observed.  The tracker
/// writes the new state through the cell immediately before scheduling the
/// watcher's notification, so the callback reads its cell to learn what
/// changed.
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectivityState) -> Arc<Self> {
        Arc::new(StateCell(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> ConnectivityState {
        ConnectivityState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectivityState) {
        self.0.store(state as u8, Ordering::Release)
    }
}

struct TrackerInner {
    current: ConnectivityState,
    watchers: Vec<(Arc<StateCell>, Closure)>,
}

/// Level-triggered state with edge-delivered watchers: each registration
/// receives at most one notification, fired the first time the current state
/// differs from the watcher's observed value.
pub struct ConnectivityTracker {
    name: String,
    inner: Mutex<TrackerInner>,
}

impl ConnectivityTracker {
    pub fn new(name: impl Into<String>, init: ConnectivityState) -> Self {
        ConnectivityTracker {
            name: name.into(),
            inner: Mutex::new(TrackerInner {
                current: init,
                watchers: Vec::new(),
            }),
        }
    }

    pub fn check(&self) -> ConnectivityState {
        self.inner.lock().current
    }

    /// Registers `notify` to run when the state differs from `*observed`.
    /// If it already differs, the current state is written through the cell
    /// and the closure enqueued immediately.  Returns whether the current
    /// state was Idle, which callers use to decide whether to start
    /// connecting.
    pub fn notify_on_state_change(
        &self,
        ctx: &mut ExecCtx,
        observed: &Arc<StateCell>,
        notify: Closure,
    ) -> bool {
        let mut inner = self.inner.lock();
        trace!(
            tracker = %self.name,
            from = %observed.get(),
            cur = %inner.current,
            "connectivity watch"
        );
        if inner.current != observed.get() {
            observed.set(inner.current);
            ctx.enqueue(notify, true);
        } else {
            inner.watchers.push((observed.clone(), notify));
        }
        inner.current == ConnectivityState::Idle
    }

    /// Publishes a new state.  Every watcher whose observed value differs
    /// has the new state written through its cell and its closure enqueued;
    /// the rest stay registered.  No transition leaves Shutdown.
    pub fn set(&self, ctx: &mut ExecCtx, state: ConnectivityState, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.current == state {
            return;
        }
        debug_assert!(
            inner.current != ConnectivityState::Shutdown,
            "connectivity transition out of Shutdown"
        );
        trace!(
            tracker = %self.name,
            from = %inner.current,
            to = %state,
            reason,
            "connectivity set"
        );
        inner.current = state;
        let mut kept = Vec::new();
        for (observed, notify) in inner.watchers.drain(..) {
            if observed.get() != state {
                observed.set(state);
                ctx.enqueue(notify, true);
            } else {
                kept.push((observed, notify));
            }
        }
        inner.watchers = kept;
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
