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

//! The round-robin policy: rotate picks across every currently-Ready
//! subchannel.
//!
//! Ready subchannels live on a circular doubly-linked list with a dummy
//! root; a cursor advances exactly once per satisfied pick.  Subchannels
//! join at the tail on their first Ready transition and are unlinked the
//! moment they leave Ready.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::client::load_balancing::{
    LbConfig, LbPolicy, LbPolicyArgs, LbPolicyBuilder, PendingPick, PickTarget,
};
use crate::client::subchannel::Subchannel;
use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCell};
use crate::exec::{Closure, ExecCtx};
use crate::ops::Metadata;
use crate::poll::PollEntity;

pub static POLICY_NAME: &str = "round_robin";

pub struct RoundRobinBuilder;

impl LbPolicyBuilder for RoundRobinBuilder {
    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn build(&self, args: LbPolicyArgs, _config: Option<&LbConfig>) -> Arc<dyn LbPolicy> {
        RoundRobinPolicy::new(args.subchannels)
    }
}

const ROOT: usize = 0;

struct ReadyNode {
    subchannel: Option<Arc<Subchannel>>,
    next: usize,
    prev: usize,
}

/// Circular doubly-linked list of Ready subchannels over a slab, with the
/// dummy root at index 0.
struct ReadyList {
    nodes: Vec<ReadyNode>,
    free: Vec<usize>,
}

impl ReadyList {
    fn new() -> Self {
        ReadyList {
            nodes: vec![ReadyNode {
                subchannel: None,
                next: ROOT,
                prev: ROOT,
            }],
            free: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.nodes[ROOT].next == ROOT
    }

    /// Appends at the tail, so new subchannels go to the end of the
    /// rotation.
    fn add_tail(&mut self, subchannel: Arc<Subchannel>) -> usize {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.nodes.push(ReadyNode {
                    subchannel: None,
                    next: ROOT,
                    prev: ROOT,
                });
                self.nodes.len() - 1
            }
        };
        let prev = self.nodes[ROOT].prev;
        trace!(node = idx, subchannel = %subchannel.key(), "ready list add");
        self.nodes[idx] = ReadyNode {
            subchannel: Some(subchannel),
            next: ROOT,
            prev,
        };
        self.nodes[prev].next = idx;
        self.nodes[ROOT].prev = idx;
        idx
    }

    fn remove(&mut self, idx: usize) {
        debug_assert_ne!(idx, ROOT);
        trace!(node = idx, "ready list remove");
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[idx].subchannel = None;
        self.free.push(idx);
    }

    /// The next real node after `from`, skipping the dummy root; ROOT when
    /// the list is empty.
    fn next_real(&self, from: usize) -> usize {
        let mut n = self.nodes[from].next;
        if n == ROOT {
            n = self.nodes[ROOT].next;
        }
        n
    }

    fn subchannel(&self, idx: usize) -> Option<Arc<Subchannel>> {
        self.nodes[idx].subchannel.clone()
    }
}

struct RrSubchannelData {
    subchannel: Arc<Subchannel>,
    cell: Arc<StateCell>,
    ready_node: Option<usize>,
}

struct RrInner {
    subchannels: Vec<RrSubchannelData>,
    ready_list: ReadyList,
    /// Cursor into the ready list; advances exactly once per satisfied pick.
    last_pick: usize,
    started_picking: bool,
    shut_down: bool,
    pending: Vec<PendingPick>,
}

pub struct RoundRobinPolicy {
    tracker: ConnectivityTracker,
    inner: Mutex<RrInner>,
    weak_self: Weak<RoundRobinPolicy>,
}

impl RoundRobinPolicy {
    pub fn new(subchannels: Vec<Arc<Subchannel>>) -> Arc<Self> {
        assert!(!subchannels.is_empty(), "round_robin needs subchannels");
        let data = subchannels
            .into_iter()
            .map(|subchannel| RrSubchannelData {
                subchannel,
                cell: StateCell::new(ConnectivityState::Idle),
                ready_node: None,
            })
            .collect();
        Arc::new_cyclic(|weak_self| RoundRobinPolicy {
            tracker: ConnectivityTracker::new("round_robin", ConnectivityState::Idle),
            inner: Mutex::new(RrInner {
                subchannels: data,
                ready_list: ReadyList::new(),
                last_pick: ROOT,
                started_picking: false,
                shut_down: false,
                pending: Vec::new(),
            }),
            weak_self: weak_self.clone(),
        })
    }

    fn watch(&self, ctx: &mut ExecCtx, sc: Arc<Subchannel>, cell: Arc<StateCell>) {
        let weak = self.weak_self.clone();
        let sc2 = sc.clone();
        sc.notify_on_state_change(
            ctx,
            &cell,
            Closure::new("rr_connectivity_changed", move |ctx, _| {
                if let Some(policy) = weak.upgrade() {
                    policy.on_connectivity_changed(ctx, &sc2);
                }
            }),
        );
    }

    fn start_picking_locked(&self, ctx: &mut ExecCtx, inner: &mut RrInner) {
        inner.started_picking = true;
        for data in &inner.subchannels {
            data.cell.set(ConnectivityState::Idle);
            self.watch(ctx, data.subchannel.clone(), data.cell.clone());
        }
    }

    /// Advances the cursor once and returns the subchannel at the node after
    /// it; None when nothing is Ready.
    fn pick_ready_locked(inner: &mut RrInner) -> Option<Arc<Subchannel>> {
        if inner.ready_list.is_empty() {
            return None;
        }
        inner.last_pick = inner.ready_list.next_real(inner.last_pick);
        let node = inner.ready_list.next_real(inner.last_pick);
        inner.ready_list.subchannel(node)
    }

    /// The subchannel a pick would use, without advancing the cursor.
    fn peek_ready_locked(inner: &RrInner) -> Option<Arc<Subchannel>> {
        if inner.ready_list.is_empty() {
            return None;
        }
        let after_cursor = inner.ready_list.next_real(inner.last_pick);
        let node = inner.ready_list.next_real(after_cursor);
        inner.ready_list.subchannel(node)
    }

    /// Ready while anything is on the ready list; TransientFailure (or the
    /// event's own state) while subchannels remain; Shutdown with none left.
    fn publish_aggregate_locked(
        &self,
        ctx: &mut ExecCtx,
        inner: &RrInner,
        fallback: ConnectivityState,
        reason: &str,
    ) {
        let state = if !inner.ready_list.is_empty() {
            ConnectivityState::Ready
        } else if inner.subchannels.is_empty() {
            ConnectivityState::Shutdown
        } else {
            fallback
        };
        self.tracker.set(ctx, state, reason);
    }

    fn fail_pending_locked(ctx: &mut ExecCtx, inner: &mut RrInner) {
        for pp in inner.pending.drain(..) {
            pp.target.set(None);
            ctx.enqueue(pp.on_complete, false);
        }
    }

    fn unlink_locked(inner: &mut RrInner, idx: usize) {
        if let Some(node) = inner.subchannels[idx].ready_node.take() {
            if node == inner.last_pick {
                // Cursor falls back to the dummy root.
                inner.last_pick = ROOT;
            }
            inner.ready_list.remove(node);
        }
    }

    fn on_connectivity_changed(&self, ctx: &mut ExecCtx, sc: &Arc<Subchannel>) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        let inner = &mut *inner;
        let Some(idx) = inner
            .subchannels
            .iter()
            .position(|d| Arc::ptr_eq(&d.subchannel, sc))
        else {
            return;
        };
        let state = inner.subchannels[idx].cell.get();
        match state {
            ConnectivityState::Ready => {
                if inner.subchannels[idx].ready_node.is_none() {
                    let node = inner.ready_list.add_tail(sc.clone());
                    inner.subchannels[idx].ready_node = Some(node);
                }
                self.publish_aggregate_locked(ctx, inner, state, "connecting_ready");
                if !inner.pending.is_empty() {
                    // One advance serves every waiting suitor, replicating
                    // what a pick would have done.
                    if let Some(selected) = Self::pick_ready_locked(inner) {
                        let conn = selected.connection();
                        for pp in inner.pending.drain(..) {
                            if let Some(pollent) = &pp.pollent {
                                for d in &inner.subchannels {
                                    d.subchannel.del_interested_party(pollent);
                                }
                            }
                            pp.target.set(conn.clone());
                            ctx.enqueue(pp.on_complete, conn.is_some());
                        }
                    }
                }
                self.watch(ctx, sc.clone(), inner.subchannels[idx].cell.clone());
            }
            ConnectivityState::Connecting | ConnectivityState::Idle => {
                Self::unlink_locked(inner, idx);
                self.publish_aggregate_locked(ctx, inner, state, "connecting_changed");
                self.watch(ctx, sc.clone(), inner.subchannels[idx].cell.clone());
            }
            ConnectivityState::TransientFailure => {
                // Renew the notification, then drop out of the rotation.
                self.watch(ctx, sc.clone(), inner.subchannels[idx].cell.clone());
                Self::unlink_locked(inner, idx);
                self.publish_aggregate_locked(
                    ctx,
                    inner,
                    state,
                    "connecting_transient_failure",
                );
            }
            ConnectivityState::Shutdown => {
                Self::unlink_locked(inner, idx);
                inner.subchannels.swap_remove(idx);
                if inner.subchannels.is_empty() {
                    self.tracker
                        .set(ctx, ConnectivityState::Shutdown, "no_more_channels");
                    Self::fail_pending_locked(ctx, inner);
                } else {
                    self.publish_aggregate_locked(
                        ctx,
                        inner,
                        ConnectivityState::TransientFailure,
                        "subchannel_failed",
                    );
                }
            }
        }
    }
}

impl LbPolicy for RoundRobinPolicy {
    fn pick(
        &self,
        ctx: &mut ExecCtx,
        pollent: Option<&PollEntity>,
        _initial_metadata: &Metadata,
        target: &PickTarget,
        on_complete: Closure,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            drop(inner);
            target.set(None);
            ctx.enqueue(on_complete, false);
            return false;
        }
        if let Some(selected) = Self::pick_ready_locked(&mut inner) {
            if let Some(conn) = selected.connection() {
                drop(inner);
                trace!(subchannel = %selected.key(), "round robin pick");
                target.set(Some(conn));
                return true;
            }
        }
        if !inner.started_picking {
            self.start_picking_locked(ctx, &mut inner);
        }
        if let Some(pollent) = pollent {
            for d in &inner.subchannels {
                d.subchannel.add_interested_party(pollent);
            }
        }
        inner.pending.push(PendingPick {
            pollent: pollent.cloned(),
            target: target.clone(),
            on_complete,
        });
        false
    }

    fn cancel_pick(&self, ctx: &mut ExecCtx, target: &PickTarget) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let mut kept = Vec::new();
        for pp in inner.pending.drain(..) {
            if pp.target.same_as(target) {
                if let Some(pollent) = &pp.pollent {
                    for d in &inner.subchannels {
                        d.subchannel.del_interested_party(pollent);
                    }
                }
                pp.target.set(None);
                ctx.enqueue(pp.on_complete, false);
            } else {
                kept.push(pp);
            }
        }
        inner.pending = kept;
    }

    fn exit_idle(&self, ctx: &mut ExecCtx) {
        let mut inner = self.inner.lock();
        if !inner.started_picking && !inner.shut_down {
            self.start_picking_locked(ctx, &mut inner);
        }
    }

    fn ping_one(&self, ctx: &mut ExecCtx, on_ack: Closure) {
        let conn = {
            let inner = self.inner.lock();
            Self::peek_ready_locked(&inner).and_then(|sc| sc.connection())
        };
        match conn {
            Some(conn) => conn.ping(ctx, on_ack),
            None => ctx.enqueue(on_ack, false),
        }
    }

    fn shutdown(&self, ctx: &mut ExecCtx) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        inner.shut_down = true;
        Self::fail_pending_locked(ctx, &mut inner);
        self.tracker.set(ctx, ConnectivityState::Shutdown, "shutdown");
    }

    fn check_connectivity(&self) -> ConnectivityState {
        self.tracker.check()
    }

    fn notify_on_state_change(
        &self,
        ctx: &mut ExecCtx,
        observed: &Arc<StateCell>,
        notify: Closure,
    ) {
        self.tracker.notify_on_state_change(ctx, observed, notify);
    }
}
