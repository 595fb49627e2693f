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

//! The client channel: resolver -> LB policy -> subchannel routing, plus the
//! per-call state machine that buffers stream operations until a
//! configuration and a pick are available.
//!
//! Lock order: the channel's configuration lock is acquired before any
//! call's state lock when both are needed; neither is ever held across a
//! user callback.

use std::error::Error;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::debug;
use url::Url;

use crate::client::call_holder::{HolderCall, PickSubchannel, SubchannelCallHolder};
use crate::client::load_balancing::{LbPolicy, PickTarget};
use crate::client::name_resolution::{
    new_config_slot, ConfigSlot, Resolver, ResolverArgs, ResolverRegistry,
};
use crate::args::ChannelArgs;
use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCell};
use crate::exec::{Closure, ClosureList, ExecCtx};
use crate::ops::{Metadata, StreamOp};
use crate::poll::PollEntity;
use crate::status::{Code, Status};
use crate::timer::{Timer, TimerList};

struct ChannelConfigState {
    resolver: Option<Arc<dyn Resolver>>,
    lb_policy: Option<Arc<dyn LbPolicy>>,
    /// Slot the resolver writes the next configuration into.
    incoming_config: ConfigSlot,
    /// Calls (and idle-exits) waiting for the first usable configuration.
    waiting_for_config: ClosureList,
    started_resolving: bool,
    exit_idle_when_lb_arrives: bool,
}

pub struct ClientChannel {
    target: Url,
    timers: Arc<TimerList>,
    tracker: ConnectivityTracker,
    config: Mutex<ChannelConfigState>,
    weak_self: Weak<ClientChannel>,
}

impl ClientChannel {
    pub fn new(target: Url, resolver: Arc<dyn Resolver>, timers: Arc<TimerList>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| ClientChannel {
            tracker: ConnectivityTracker::new(
                format!("client_channel:{}", target),
                ConnectivityState::Idle,
            ),
            target,
            timers,
            config: Mutex::new(ChannelConfigState {
                resolver: Some(resolver),
                lb_policy: None,
                incoming_config: new_config_slot(),
                waiting_for_config: ClosureList::new(),
                started_resolving: false,
                exit_idle_when_lb_arrives: false,
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// Builds a channel for a target string, dispatching the URI scheme to a
    /// registered resolver.
    pub fn for_target(
        target: &str,
        registry: &ResolverRegistry,
        channel_args: ChannelArgs,
        timers: Arc<TimerList>,
    ) -> Result<Arc<Self>, Box<dyn Error + Send + Sync>> {
        let url = Url::parse(target)?;
        let builder = registry
            .get(url.scheme())
            .ok_or_else(|| format!("no resolver registered for scheme {:?}", url.scheme()))?;
        let resolver = builder.build(&url, ResolverArgs { channel_args })?;
        Ok(ClientChannel::new(url, resolver, timers))
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Requires `cfg.resolver` present; kicks off the first `next`.
    fn start_resolving_locked(&self, ctx: &mut ExecCtx, cfg: &mut ChannelConfigState) {
        debug_assert!(!cfg.started_resolving);
        cfg.started_resolving = true;
        let resolver = cfg.resolver.clone().expect("resolver present");
        let slot = cfg.incoming_config.clone();
        let weak = self.weak_self.clone();
        resolver.next(
            ctx,
            &slot,
            Closure::new("on_config_changed", move |ctx, success| {
                if let Some(chan) = weak.upgrade() {
                    chan.on_config_changed(ctx, success);
                }
            }),
        );
    }

    /// Resolver delivered (or failed to deliver) a configuration: swap the
    /// LB policy, release waiting calls, follow the new policy's
    /// connectivity, and re-arm the resolver.
    fn on_config_changed(&self, ctx: &mut ExecCtx, success: bool) {
        let mut cfg = self.config.lock();
        let incoming = cfg.incoming_config.lock().take();
        let new_lb = incoming.and_then(|c| c.lb_policy);
        let old_lb = std::mem::replace(&mut cfg.lb_policy, new_lb.clone());
        if new_lb.is_some() || cfg.resolver.is_none() {
            let mut waiters = std::mem::take(&mut cfg.waiting_for_config);
            ctx.enqueue_list(&mut waiters);
        }
        let mut exit_idle = false;
        if new_lb.is_some() && cfg.exit_idle_when_lb_arrives {
            cfg.exit_idle_when_lb_arrives = false;
            exit_idle = true;
        }
        let state = new_lb
            .as_ref()
            .map(|lb| lb.check_connectivity())
            .unwrap_or(ConnectivityState::TransientFailure);

        if success && cfg.resolver.is_some() {
            self.tracker.set(ctx, state, "new_lb+resolver");
            if let Some(lb) = &new_lb {
                self.watch_lb_policy(ctx, lb.clone(), state);
            }
            let resolver = cfg.resolver.clone().expect("resolver present");
            let slot = cfg.incoming_config.clone();
            drop(cfg);
            let weak = self.weak_self.clone();
            resolver.next(
                ctx,
                &slot,
                Closure::new("on_config_changed", move |ctx, success| {
                    if let Some(chan) = weak.upgrade() {
                        chan.on_config_changed(ctx, success);
                    }
                }),
            );
        } else {
            let old_resolver = cfg.resolver.take();
            self.tracker
                .set(ctx, ConnectivityState::Shutdown, "resolver_gone");
            drop(cfg);
            if let Some(resolver) = old_resolver {
                resolver.shutdown(ctx);
            }
        }

        if exit_idle {
            if let Some(lb) = &new_lb {
                lb.exit_idle(ctx);
            }
        }
        if let Some(old) = old_lb {
            debug!(channel = %self.target, "shutting down superseded LB policy");
            old.shutdown(ctx);
        }
    }

    /// One watcher per LB policy generation; a state change from a policy
    /// that has since been replaced is ignored.
    fn watch_lb_policy(&self, ctx: &mut ExecCtx, lb: Arc<dyn LbPolicy>, current: ConnectivityState) {
        self.watch_lb_policy_with_cell(ctx, lb, StateCell::new(current));
    }

    fn watch_lb_policy_with_cell(
        &self,
        ctx: &mut ExecCtx,
        lb: Arc<dyn LbPolicy>,
        cell: Arc<StateCell>,
    ) {
        let weak = self.weak_self.clone();
        let lb2 = lb.clone();
        let cell2 = cell.clone();
        lb.notify_on_state_change(
            ctx,
            &cell,
            Closure::new("on_lb_state_changed", move |ctx, _| {
                if let Some(chan) = weak.upgrade() {
                    chan.on_lb_state_changed(ctx, &lb2, &cell2);
                }
            }),
        );
    }

    fn on_lb_state_changed(
        &self,
        ctx: &mut ExecCtx,
        lb: &Arc<dyn LbPolicy>,
        cell: &Arc<StateCell>,
    ) {
        let cfg = self.config.lock();
        let is_current = cfg
            .lb_policy
            .as_ref()
            .map(|cur| Arc::ptr_eq(cur, lb))
            .unwrap_or(false);
        if !is_current {
            return;
        }
        let state = cell.get();
        if self.tracker.check() != ConnectivityState::Shutdown {
            self.tracker.set(ctx, state, "lb_changed");
        }
        if state == ConnectivityState::TransientFailure {
            // Hint the resolver that connections are failing; it may choose
            // to re-resolve.
            if let Some(resolver) = cfg.resolver.clone() {
                resolver.channel_saw_error(ctx, self.target.as_str());
            }
        }
        drop(cfg);
        if state != ConnectivityState::Shutdown {
            self.watch_lb_policy_with_cell(ctx, lb.clone(), cell.clone());
        }
    }

    /// Returns the current state; when `try_to_connect` is set and the
    /// channel is Idle, nudges the LB policy out of idleness (or records
    /// that it should be nudged the moment one arrives).
    pub fn check_connectivity_state(
        &self,
        ctx: &mut ExecCtx,
        try_to_connect: bool,
    ) -> ConnectivityState {
        let out = self.tracker.check();
        if out == ConnectivityState::Idle && try_to_connect {
            let mut cfg = self.config.lock();
            if let Some(lb) = cfg.lb_policy.clone() {
                drop(cfg);
                lb.exit_idle(ctx);
            } else {
                cfg.exit_idle_when_lb_arrives = true;
                if !cfg.started_resolving && cfg.resolver.is_some() {
                    self.start_resolving_locked(ctx, &mut cfg);
                }
            }
        }
        out
    }

    pub fn watch_connectivity_state(
        &self,
        ctx: &mut ExecCtx,
        observed: &Arc<StateCell>,
        notify: Closure,
    ) {
        self.tracker.notify_on_state_change(ctx, observed, notify);
    }

    /// Tears the channel down: the resolver and LB policy are shut down,
    /// queued calls are released (and will cancel, finding neither), and the
    /// channel state becomes Shutdown.
    pub fn disconnect(&self, ctx: &mut ExecCtx) {
        let (old_resolver, old_lb, mut waiters) = {
            let mut cfg = self.config.lock();
            (
                cfg.resolver.take(),
                cfg.lb_policy.take(),
                std::mem::take(&mut cfg.waiting_for_config),
            )
        };
        self.tracker
            .set(ctx, ConnectivityState::Shutdown, "disconnect");
        ctx.enqueue_list(&mut waiters);
        if let Some(resolver) = old_resolver {
            resolver.shutdown(ctx);
        }
        if let Some(lb) = old_lb {
            lb.shutdown(ctx);
        }
    }

    /// Creates a call on this channel.  The optional deadline is enforced by
    /// a timer that cancels the call with DeadlineExceeded.
    pub fn create_call(
        self: &Arc<Self>,
        ctx: &mut ExecCtx,
        pollent: Option<PollEntity>,
        deadline: Option<Instant>,
    ) -> Arc<Call> {
        let call = Arc::new_cyclic(|weak_self| {
            let picker = Arc::new(CallPicker {
                channel: Arc::downgrade(self),
                pollent: pollent.clone(),
            });
            Call {
                channel: self.clone(),
                holder: SubchannelCallHolder::new(picker, pollent.clone()),
                pollent,
                state: Mutex::new(CallState {
                    phase: CallPhase::Created,
                    waiting_op: StreamOp::default(),
                    cancel_status: Status::cancelled(),
                    deadline_timer: None,
                }),
                weak_self: weak_self.clone(),
            }
        });
        if let Some(deadline) = deadline {
            let weak = Arc::downgrade(&call);
            let timer = self.timers.init(
                ctx,
                Instant::now(),
                deadline,
                Closure::new("call_deadline", move |ctx, success| {
                    if !success {
                        return;
                    }
                    if let Some(call) = weak.upgrade() {
                        call.start_op(
                            ctx,
                            StreamOp::cancel(Status::with_message(
                                Code::DeadlineExceeded,
                                "Deadline Exceeded",
                            )),
                        );
                    }
                }),
            );
            call.state.lock().deadline_timer = Some(timer);
        }
        call
    }
}

/// Per-call routing state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum CallPhase {
    Created,
    WaitingForSend,
    WaitingForConfig,
    WaitingForPick,
    WaitingForCall,
    Active,
    Cancelled,
}

struct CallState {
    phase: CallPhase,
    /// Stream ops held until dispatch; at most one send and one recv arm.
    waiting_op: StreamOp,
    /// The status synthesized for ops arriving after cancellation.
    cancel_status: Status,
    deadline_timer: Option<Timer>,
}

/// A call routed through a [`ClientChannel`].  Stream ops buffer through the
/// queueing stages (waiting-for-send / config / pick / call) and flow to the
/// subchannel call once Active; a cancellation in any state reaches the
/// recv-side completion with a Cancelled status exactly once.
pub struct Call {
    channel: Arc<ClientChannel>,
    holder: Arc<SubchannelCallHolder>,
    pollent: Option<PollEntity>,
    state: Mutex<CallState>,
    weak_self: Weak<Call>,
}

/// Merges a newly arrived op into the buffered one.  The displaced
/// `on_consumed` closure, if any, is returned so the caller can still
/// complete it.
fn merge_into_waiting_op(waiting: &mut StreamOp, mut new_op: StreamOp) -> Option<Closure> {
    debug_assert!(
        waiting.send.is_none() || new_op.send.is_none(),
        "at most one send batch may buffer"
    );
    debug_assert!(
        waiting.recv.is_none() || new_op.recv.is_none(),
        "at most one recv batch may buffer"
    );
    if new_op.send.is_some() {
        waiting.send = new_op.send.take();
        waiting.on_done_send = new_op.on_done_send.take();
    }
    if new_op.recv.is_some() {
        waiting.recv = new_op.recv.take();
        waiting.on_done_recv = new_op.on_done_recv.take();
    }
    let mut displaced = None;
    if let Some(consumed) = new_op.on_consumed.take() {
        displaced = waiting.on_consumed.replace(consumed);
    }
    // A cancellation overrides whatever was buffered.
    if let Some(status) = new_op.cancel_with_status.take() {
        waiting.cancel_with_status = Some(status);
    }
    if new_op.bind_pollent.is_some() {
        waiting.bind_pollent = new_op.bind_pollent.take();
    }
    displaced
}

impl Call {
    /// Single entry point for stream operations on the call.
    pub fn start_op(&self, ctx: &mut ExecCtx, op: StreamOp) {
        self.perform_op(ctx, op, false);
    }

    /// Convenience cancellation.
    pub fn cancel(&self, ctx: &mut ExecCtx) {
        self.start_op(ctx, StreamOp::cancel(Status::cancelled()));
    }

    pub fn holder(&self) -> &Arc<SubchannelCallHolder> {
        &self.holder
    }

    fn perform_op(&self, ctx: &mut ExecCtx, op: StreamOp, continuation: bool) {
        let mut st = self.state.lock();
        match st.phase {
            CallPhase::Active => {
                debug_assert!(!continuation);
                drop(st);
                self.holder.perform_op(ctx, op);
            }
            CallPhase::Cancelled => {
                let status = st.cancel_status.clone();
                drop(st);
                op.finish_with_cancellation(ctx, &status);
            }
            CallPhase::WaitingForSend => {
                debug_assert!(!continuation);
                if let Some(displaced) = merge_into_waiting_op(&mut st.waiting_op, op) {
                    ctx.enqueue(displaced, true);
                }
                if st.waiting_op.send.is_none() && st.waiting_op.cancel_with_status.is_none() {
                    return;
                }
                let op = std::mem::take(&mut st.waiting_op);
                self.continue_created(ctx, st, op);
            }
            CallPhase::WaitingForConfig | CallPhase::WaitingForPick | CallPhase::WaitingForCall => {
                if continuation {
                    self.continue_created(ctx, st, op);
                    return;
                }
                if let Some(status) = op.cancel_with_status.clone() {
                    let prev = st.phase;
                    st.phase = CallPhase::Cancelled;
                    st.cancel_status = status.clone();
                    let op2 = std::mem::take(&mut st.waiting_op);
                    drop(st);
                    // Take the holder word so a racing install loses; if a
                    // call slipped in first, the cancel flows to it.
                    if let Some(installed) = self.holder.cancel() {
                        installed.process_op(ctx, StreamOp::cancel(status.clone()));
                    }
                    if prev == CallPhase::WaitingForPick {
                        self.cancel_pick_async(ctx);
                    }
                    op.finish_with_cancellation(ctx, &status);
                    op2.finish_with_cancellation(ctx, &status);
                } else {
                    if let Some(displaced) = merge_into_waiting_op(&mut st.waiting_op, op) {
                        ctx.enqueue(displaced, true);
                    }
                }
            }
            CallPhase::Created => self.continue_created(ctx, st, op),
        }
    }

    /// State 6 of the routing machine: dispatch a (possibly re-entered) op.
    fn continue_created(
        &self,
        ctx: &mut ExecCtx,
        mut st: MutexGuard<'_, CallState>,
        op: StreamOp,
    ) {
        if let Some(status) = op.cancel_with_status.clone() {
            st.phase = CallPhase::Cancelled;
            st.cancel_status = status.clone();
            drop(st);
            self.holder.cancel();
            op.finish_with_cancellation(ctx, &status);
            return;
        }
        st.waiting_op = op;
        if st.waiting_op.send.is_none() {
            // Nothing to pick an endpoint with yet.
            st.phase = CallPhase::WaitingForSend;
            return;
        }
        drop(st);
        self.route(ctx);
    }

    /// Consults the channel configuration for a buffered send-carrying op:
    /// pick against the LB policy, wait for config, or fail if the channel
    /// is disconnected.
    fn route(&self, ctx: &mut ExecCtx) {
        let chan = &self.channel;
        let mut cfg = chan.config.lock();
        if let Some(lb) = cfg.lb_policy.clone() {
            drop(cfg);
            let md = {
                let mut st = self.state.lock();
                if st.phase == CallPhase::Cancelled {
                    let status = st.cancel_status.clone();
                    let op = std::mem::take(&mut st.waiting_op);
                    drop(st);
                    op.finish_with_cancellation(ctx, &status);
                    return;
                }
                st.phase = CallPhase::WaitingForPick;
                st.waiting_op
                    .initial_metadata()
                    .cloned()
                    .unwrap_or_default()
            };
            let weak = self.weak_self.clone();
            let on_pick = Closure::new("picked_target", move |ctx, _| {
                if let Some(call) = weak.upgrade() {
                    call.picked_target(ctx);
                }
            });
            if lb.pick(ctx, self.pollent.as_ref(), &md, self.holder.target(), on_pick) {
                self.picked_target(ctx);
            }
        } else if cfg.resolver.is_some() {
            {
                let mut st = self.state.lock();
                if st.phase == CallPhase::Cancelled {
                    let status = st.cancel_status.clone();
                    let op = std::mem::take(&mut st.waiting_op);
                    drop(st);
                    drop(cfg);
                    op.finish_with_cancellation(ctx, &status);
                    return;
                }
                st.phase = CallPhase::WaitingForConfig;
            }
            let weak = self.weak_self.clone();
            cfg.waiting_for_config.add(
                Closure::new("continue_after_config", move |ctx, _| {
                    if let Some(call) = weak.upgrade() {
                        call.on_config_ready(ctx);
                    }
                }),
                true,
            );
            if !cfg.started_resolving {
                chan.start_resolving_locked(ctx, &mut cfg);
            }
        } else {
            // Channel has been disconnected.
            drop(cfg);
            let (op, status) = {
                let mut st = self.state.lock();
                st.phase = CallPhase::Cancelled;
                (
                    std::mem::take(&mut st.waiting_op),
                    st.cancel_status.clone(),
                )
            };
            self.holder.cancel();
            op.finish_with_cancellation(ctx, &status);
        }
    }

    /// A configuration (or channel disconnection) arrived: re-enter the
    /// state machine with the buffered op.
    fn on_config_ready(&self, ctx: &mut ExecCtx) {
        let op = {
            let mut st = self.state.lock();
            if st.phase != CallPhase::WaitingForConfig {
                return;
            }
            std::mem::take(&mut st.waiting_op)
        };
        self.perform_op(ctx, op, true);
    }

    /// The LB pick completed, successfully or not.
    fn picked_target(&self, ctx: &mut ExecCtx) {
        let Some(conn) = self.holder.target().get() else {
            // Treat a failed pick like a cancellation with Unavailable.
            let op = {
                let mut st = self.state.lock();
                st.waiting_op.cancel_with_status =
                    Some(Status::unavailable("no ready subchannel"));
                std::mem::take(&mut st.waiting_op)
            };
            self.perform_op(ctx, op, true);
            return;
        };
        {
            let mut st = self.state.lock();
            match st.phase {
                CallPhase::Cancelled => {
                    let status = st.cancel_status.clone();
                    let op = std::mem::take(&mut st.waiting_op);
                    drop(st);
                    op.finish_with_cancellation(ctx, &status);
                    return;
                }
                CallPhase::WaitingForPick => st.phase = CallPhase::WaitingForCall,
                other => {
                    debug_assert!(false, "pick completed in phase {:?}", other);
                    return;
                }
            }
        }
        let call = conn.create_call(ctx, self.pollent.as_ref());
        match self.holder.install(call) {
            Ok(_) => self.started_call(ctx),
            Err(_) => {
                // Cancellation won the word; the just-created call is gone.
                let (op, status) = {
                    let mut st = self.state.lock();
                    (
                        std::mem::take(&mut st.waiting_op),
                        st.cancel_status.clone(),
                    )
                };
                op.finish_with_cancellation(ctx, &status);
            }
        }
    }

    fn started_call(&self, ctx: &mut ExecCtx) {
        let mut st = self.state.lock();
        match st.phase {
            CallPhase::Cancelled => {
                let status = st.cancel_status.clone();
                drop(st);
                if let HolderCall::Call(call) = self.holder.call() {
                    call.process_op(ctx, StreamOp::cancel(status));
                }
            }
            CallPhase::WaitingForCall => {
                st.phase = CallPhase::Active;
                let op = std::mem::take(&mut st.waiting_op);
                drop(st);
                if !op.is_empty() {
                    self.holder.perform_op(ctx, op);
                }
            }
            other => debug_assert!(false, "started call in phase {:?}", other),
        }
    }

    /// The LB pick must be withdrawn outside the call's state lock.
    fn cancel_pick_async(&self, ctx: &mut ExecCtx) {
        let chan = Arc::downgrade(&self.channel);
        let target = self.holder.target().clone();
        ctx.enqueue(
            Closure::new("cancel_lb_pick", move |ctx, _| {
                if let Some(chan) = chan.upgrade() {
                    let lb = chan.config.lock().lb_policy.clone();
                    if let Some(lb) = lb {
                        lb.cancel_pick(ctx, &target);
                    }
                }
            }),
            true,
        );
    }

    /// Disarms the deadline timer (used once the call has terminated).
    pub fn clear_deadline(&self, ctx: &mut ExecCtx) {
        let timer = self.state.lock().deadline_timer.take();
        if let Some(timer) = timer {
            self.channel.timers.cancel(ctx, &timer);
        }
    }
}

/// Lets a call's holder drive picks through the channel's current policy.
struct CallPicker {
    channel: Weak<ClientChannel>,
    pollent: Option<PollEntity>,
}

impl PickSubchannel for CallPicker {
    fn pick(
        &self,
        ctx: &mut ExecCtx,
        initial_metadata: Option<&Metadata>,
        target: &PickTarget,
        on_ready: Option<Closure>,
    ) -> bool {
        let Some(chan) = self.channel.upgrade() else {
            return false;
        };
        let lb = chan.config.lock().lb_policy.clone();
        match (initial_metadata, lb) {
            (None, Some(lb)) => {
                lb.cancel_pick(ctx, target);
                false
            }
            (Some(md), Some(lb)) => lb.pick(
                ctx,
                self.pollent.as_ref(),
                md,
                target,
                on_ready.unwrap_or_else(Closure::noop),
            ),
            _ => false,
        }
    }
}
