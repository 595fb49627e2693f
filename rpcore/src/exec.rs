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

//! Deferred closure execution.
//!
//! Every state machine in this crate mutates under a component-local lock,
//! queues its follow-up work onto an [`ExecCtx`], releases the lock, and only
//! then lets the queued callbacks run.  Running callbacks inline would either
//! deadlock (callbacks routinely re-acquire the lock that scheduled them) or
//! re-enter a state machine mid-transition.

use std::collections::VecDeque;
use std::fmt;

/// A bound callback: invoked at most once with a success bit chosen by
/// whoever schedules it.
///
/// Ownership transfers into the [`ExecCtx`] on enqueue and into the callback
/// on invocation, so a closure structurally cannot run twice or sit in two
/// queues at once.
pub struct Closure {
    name: &'static str,
    f: Box<dyn FnOnce(&mut ExecCtx, bool) + Send>,
}

impl Closure {
    pub fn new<F>(name: &'static str, f: F) -> Self
    where
        F: FnOnce(&mut ExecCtx, bool) + Send + 'static,
    {
        Closure {
            name,
            f: Box::new(f),
        }
    }

    /// A closure that ignores its success bit and does nothing.  Useful as a
    /// placeholder for optional notifications.
    pub fn noop() -> Self {
        Closure::new("noop", |_, _| {})
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Consumes the closure, invoking the callback.
    pub fn run(self, ctx: &mut ExecCtx, success: bool) {
        (self.f)(ctx, success)
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Closure({})", self.name)
    }
}

/// An ordered batch of closures, each paired with the success value it will
/// be run with.  Used wherever a component accumulates waiters under a lock
/// and releases them in one motion.
#[derive(Default)]
pub struct ClosureList {
    items: Vec<(Closure, bool)>,
}

impl ClosureList {
    pub fn new() -> Self {
        ClosureList::default()
    }

    pub fn add(&mut self, closure: Closure, success: bool) {
        self.items.push((closure, success));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Moves every queued closure onto `ctx`, emptying the list.
    pub fn drain_onto(&mut self, ctx: &mut ExecCtx) {
        for (closure, success) in self.items.drain(..) {
            ctx.enqueue(closure, success);
        }
    }
}

impl fmt::Debug for ClosureList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClosureList(len={})", self.items.len())
    }
}

/// A per-thread batch of pending closures.
///
/// An ExecCtx is created at the top of each externally driven operation
/// (an API call, a poller wakeup, a timer check) and passed explicitly down
/// through every function that may need to defer work.  Callbacks receive
/// the context they are running under and may enqueue further closures; those
/// extend the same flush.
#[derive(Default)]
pub struct ExecCtx {
    queue: VecDeque<(Closure, bool)>,
}

impl ExecCtx {
    pub fn new() -> Self {
        ExecCtx::default()
    }

    /// Appends a closure to the pending queue.  O(1), never blocks, never
    /// runs the closure inline.
    pub fn enqueue(&mut self, closure: Closure, success: bool) {
        self.queue.push_back((closure, success));
    }

    /// Appends an entire list, preserving its order.
    pub fn enqueue_list(&mut self, list: &mut ClosureList) {
        list.drain_onto(self);
    }

    /// Runs queued closures until the queue is empty.  Returns whether any
    /// closure ran.  Closures enqueued by a running callback are picked up
    /// by the same flush, in enqueue order.
    pub fn flush(&mut self) -> bool {
        let mut did_work = false;
        while let Some((closure, success)) = self.queue.pop_front() {
            did_work = true;
            closure.run(self, success);
        }
        did_work
    }

    /// Flushes and consumes the context.  The queue is empty afterwards by
    /// construction; a non-empty queue here would mean `flush` lost work.
    pub fn finish(mut self) {
        self.flush();
        debug_assert!(self.queue.is_empty());
    }
}

impl fmt::Debug for ExecCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecCtx(pending={})", self.queue.len())
    }
}
