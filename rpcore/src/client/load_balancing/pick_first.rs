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

//! The pick-first policy: probe subchannels in array order until one becomes
//! Ready, pin it while it stays Ready, and hand it to every pick.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::client::load_balancing::{
    LbConfig, LbPolicy, LbPolicyArgs, LbPolicyBuilder, PendingPick, PickTarget,
};
use crate::client::subchannel::Subchannel;
use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCell};
use crate::exec::{Closure, ExecCtx};
use crate::ops::Metadata;
use crate::poll::PollEntity;

pub static POLICY_NAME: &str = "pick_first";

/// JSON configuration accepted by pick_first.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PickFirstConfig {
    /// Randomize the probe order instead of always starting with the first
    /// resolved address.
    pub shuffle_address_list: bool,
}

pub struct PickFirstBuilder;

impl LbPolicyBuilder for PickFirstBuilder {
    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn build(&self, args: LbPolicyArgs, config: Option<&LbConfig>) -> Arc<dyn LbPolicy> {
        let mut subchannels = args.subchannels;
        if let Some(config) = config.and_then(|c| c.get::<PickFirstConfig>()) {
            if config.shuffle_address_list {
                subchannels.shuffle(&mut rand::rng());
            }
        }
        PickFirstPolicy::new(subchannels)
    }

    fn parse_config(
        &self,
        config: &serde_json::Value,
    ) -> Result<Option<LbConfig>, Box<dyn std::error::Error + Send + Sync>> {
        let parsed: PickFirstConfig = serde_json::from_value(config.clone())?;
        Ok(Some(LbConfig::new(Box::new(parsed))))
    }
}

struct PfInner {
    subchannels: Vec<Arc<Subchannel>>,
    /// Which subchannel is being probed.
    checking_subchannel: usize,
    /// That subchannel's last observed connectivity, shared with the watcher.
    checking_connectivity: Arc<StateCell>,
    selected: Option<Arc<Subchannel>>,
    started_picking: bool,
    shut_down: bool,
    pending: Vec<PendingPick>,
}

pub struct PickFirstPolicy {
    tracker: ConnectivityTracker,
    inner: Mutex<PfInner>,
    /// Handle to the owning Arc, for hanging watcher closures off `&self`.
    weak_self: Weak<PickFirstPolicy>,
}

impl PickFirstPolicy {
    pub fn new(subchannels: Vec<Arc<Subchannel>>) -> Arc<Self> {
        assert!(!subchannels.is_empty(), "pick_first needs subchannels");
        Arc::new_cyclic(|weak_self| PickFirstPolicy {
            tracker: ConnectivityTracker::new("pick_first", ConnectivityState::Idle),
            inner: Mutex::new(PfInner {
                subchannels,
                checking_subchannel: 0,
                checking_connectivity: StateCell::new(ConnectivityState::Idle),
                selected: None,
                started_picking: false,
                shut_down: false,
                pending: Vec::new(),
            }),
            weak_self: weak_self.clone(),
        })
    }

    fn watch(&self, ctx: &mut ExecCtx, sc: Arc<Subchannel>, cell: Arc<StateCell>) {
        let weak = self.weak_self.clone();
        sc.notify_on_state_change(
            ctx,
            &cell,
            Closure::new("pf_connectivity_changed", move |ctx, _| {
                if let Some(policy) = weak.upgrade() {
                    policy.on_connectivity_changed(ctx);
                }
            }),
        );
    }

    fn watch_checking_locked(&self, ctx: &mut ExecCtx, inner: &PfInner) {
        let sc = inner.subchannels[inner.checking_subchannel].clone();
        self.watch(ctx, sc, inner.checking_connectivity.clone());
    }

    fn start_picking_locked(&self, ctx: &mut ExecCtx, inner: &mut PfInner) {
        inner.started_picking = true;
        inner.checking_subchannel = 0;
        inner.checking_connectivity.set(ConnectivityState::Idle);
        self.watch_checking_locked(ctx, inner);
    }

    fn add_interested_parties_locked(inner: &PfInner) {
        let sc = &inner.subchannels[inner.checking_subchannel];
        for pp in &inner.pending {
            if let Some(pollent) = &pp.pollent {
                sc.add_interested_party(pollent);
            }
        }
    }

    fn del_interested_parties_locked(inner: &PfInner) {
        let sc = &inner.subchannels[inner.checking_subchannel];
        for pp in &inner.pending {
            if let Some(pollent) = &pp.pollent {
                sc.del_interested_party(pollent);
            }
        }
    }

    fn fail_pending_locked(ctx: &mut ExecCtx, inner: &mut PfInner) {
        for pp in inner.pending.drain(..) {
            pp.target.set(None);
            ctx.enqueue(pp.on_complete, false);
        }
    }

    fn on_connectivity_changed(&self, ctx: &mut ExecCtx) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        if let Some(selected) = inner.selected.clone() {
            let state = inner.checking_connectivity.get();
            match state {
                ConnectivityState::Ready => {
                    self.tracker.set(ctx, state, "selected_ready");
                    self.watch(ctx, selected, inner.checking_connectivity.clone());
                }
                ConnectivityState::Shutdown => {
                    // The pinned endpoint is gone for good; drop it and
                    // resume probing what remains.
                    inner.selected = None;
                    if let Some(pos) = inner
                        .subchannels
                        .iter()
                        .position(|sc| Arc::ptr_eq(sc, &selected))
                    {
                        inner.subchannels.swap_remove(pos);
                    }
                    if inner.subchannels.is_empty() {
                        self.tracker
                            .set(ctx, ConnectivityState::Shutdown, "no_more_channels");
                        Self::fail_pending_locked(ctx, &mut inner);
                        return;
                    }
                    self.tracker
                        .set(ctx, ConnectivityState::TransientFailure, "selected_gone");
                    inner.checking_subchannel %= inner.subchannels.len();
                    let probe = inner.subchannels[inner.checking_subchannel].clone();
                    let state = probe.check_connectivity(ctx, false);
                    inner.checking_connectivity.set(state);
                    self.drive_locked(ctx, &mut inner);
                }
                other => {
                    // Left Ready: unpin and go back to probing from the
                    // current index.
                    inner.selected = None;
                    self.tracker.set(ctx, other, "selected_changed");
                    inner.checking_subchannel %= inner.subchannels.len();
                    let probe = inner.subchannels[inner.checking_subchannel].clone();
                    let state = probe.check_connectivity(ctx, false);
                    inner.checking_connectivity.set(state);
                    self.drive_locked(ctx, &mut inner);
                }
            }
            return;
        }
        self.drive_locked(ctx, &mut inner);
    }

    /// The probe loop: reacts to the checking subchannel's state, advancing
    /// through the array until something is worth waiting on.
    fn drive_locked(&self, ctx: &mut ExecCtx, inner: &mut PfInner) {
        loop {
            match inner.checking_connectivity.get() {
                ConnectivityState::Ready => {
                    self.tracker
                        .set(ctx, ConnectivityState::Ready, "connecting_ready");
                    let selected = inner.subchannels[inner.checking_subchannel].clone();
                    inner.selected = Some(selected.clone());
                    let conn = selected.connection();
                    for pp in inner.pending.drain(..) {
                        if let Some(pollent) = &pp.pollent {
                            selected.del_interested_party(pollent);
                        }
                        pp.target.set(conn.clone());
                        ctx.enqueue(pp.on_complete, conn.is_some());
                    }
                    self.watch(ctx, selected, inner.checking_connectivity.clone());
                    return;
                }
                ConnectivityState::TransientFailure => {
                    self.tracker.set(
                        ctx,
                        ConnectivityState::TransientFailure,
                        "connecting_transient_failure",
                    );
                    Self::del_interested_parties_locked(inner);
                    inner.checking_subchannel =
                        (inner.checking_subchannel + 1) % inner.subchannels.len();
                    let probe = inner.subchannels[inner.checking_subchannel].clone();
                    let state = probe.check_connectivity(ctx, false);
                    inner.checking_connectivity.set(state);
                    Self::add_interested_parties_locked(inner);
                    if state == ConnectivityState::TransientFailure {
                        self.watch_checking_locked(ctx, inner);
                        return;
                    }
                    // A different state: re-enter the loop on it.
                }
                state @ (ConnectivityState::Connecting | ConnectivityState::Idle) => {
                    self.tracker.set(ctx, state, "connecting_changed");
                    self.watch_checking_locked(ctx, inner);
                    return;
                }
                ConnectivityState::Shutdown => {
                    Self::del_interested_parties_locked(inner);
                    let idx = inner.checking_subchannel;
                    inner.subchannels.swap_remove(idx);
                    if inner.subchannels.is_empty() {
                        self.tracker
                            .set(ctx, ConnectivityState::Shutdown, "no_more_channels");
                        Self::fail_pending_locked(ctx, inner);
                        return;
                    }
                    self.tracker.set(
                        ctx,
                        ConnectivityState::TransientFailure,
                        "subchannel_failed",
                    );
                    inner.checking_subchannel %= inner.subchannels.len();
                    let probe = inner.subchannels[inner.checking_subchannel].clone();
                    let state = probe.check_connectivity(ctx, false);
                    inner.checking_connectivity.set(state);
                    Self::add_interested_parties_locked(inner);
                }
            }
        }
    }
}

impl LbPolicy for PickFirstPolicy {
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
        if let Some(selected) = inner.selected.clone() {
            if let Some(conn) = selected.connection() {
                drop(inner);
                target.set(Some(conn));
                return true;
            }
        }
        if !inner.started_picking {
            self.start_picking_locked(ctx, &mut inner);
        }
        if let Some(pollent) = pollent {
            inner.subchannels[inner.checking_subchannel].add_interested_party(pollent);
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
        let checking = inner.checking_subchannel;
        let mut kept = Vec::new();
        let drained: Vec<_> = inner.pending.drain(..).collect();
        for pp in drained {
            if pp.target.same_as(target) {
                if let Some(pollent) = &pp.pollent {
                    inner.subchannels[checking].del_interested_party(pollent);
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
            inner.selected.as_ref().and_then(|sc| sc.connection())
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
        Self::del_interested_parties_locked(&inner);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::subchannel::SubchannelArgs;
    use crate::client::test_utils::{ManualConnector, TestTransport};
    use crate::timer::TimerList;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn make_subchannel(addr: &str) -> (Arc<Subchannel>, Arc<ManualConnector>) {
        let timers = Arc::new(TimerList::new(Instant::now()));
        let connector = ManualConnector::new();
        let sc = Subchannel::new(SubchannelArgs::new(addr, connector.clone(), timers));
        (sc, connector)
    }

    fn pending_pick(completions: &Arc<Mutex<Vec<bool>>>) -> Closure {
        let completions = completions.clone();
        Closure::new("pick_done", move |_, success| {
            completions.lock().push(success);
        })
    }

    #[test]
    fn builder_is_registered() {
        let registry = crate::client::load_balancing::LbPolicyRegistry::new();
        let builder = registry.get_policy(POLICY_NAME).unwrap();
        assert_eq!(builder.name(), "pick_first");
    }

    #[test]
    fn config_parses_shuffle_flag() {
        let builder = PickFirstBuilder;
        let config = builder
            .parse_config(&serde_json::json!({ "shuffleAddressList": true }))
            .unwrap()
            .unwrap();
        assert!(config.get::<PickFirstConfig>().unwrap().shuffle_address_list);
        // Unknown or absent fields keep the default.
        let config = builder
            .parse_config(&serde_json::json!({}))
            .unwrap()
            .unwrap();
        assert!(!config.get::<PickFirstConfig>().unwrap().shuffle_address_list);
        assert!(builder.parse_config(&serde_json::json!("bogus")).is_err());
    }

    #[test]
    fn build_without_shuffle_probes_in_resolved_order() {
        let (a, ca) = make_subchannel("a:0");
        let (b, cb) = make_subchannel("b:0");
        let builder = PickFirstBuilder;
        let policy = builder.build(
            crate::client::load_balancing::LbPolicyArgs {
                subchannels: vec![a, b],
            },
            None,
        );
        let mut ctx = ExecCtx::new();
        policy.exit_idle(&mut ctx);
        ctx.finish();
        assert_eq!(ca.attempt_count(), 1);
        assert_eq!(cb.attempt_count(), 0);
    }

    // With subchannels A, B, C where only C ever becomes Ready, every pick
    // must target C.
    #[test]
    fn probes_in_order_until_ready() {
        let (a, ca) = make_subchannel("a:1");
        let (b, cb) = make_subchannel("b:1");
        let (c, cc) = make_subchannel("c:1");
        let policy = PickFirstPolicy::new(vec![a, b, c.clone()]);

        let mut ctx = ExecCtx::new();
        let target = PickTarget::new();
        let completions = Arc::new(Mutex::new(Vec::new()));
        let immediate = policy.pick(
            &mut ctx,
            None,
            &Metadata::new(),
            &target,
            pending_pick(&completions),
        );
        assert!(!immediate);
        ctx.flush();

        // Probing starts at A.
        assert_eq!(ca.attempt_count(), 1);
        assert_eq!(cb.attempt_count(), 0);
        ca.fail_next(&mut ctx);
        ctx.flush();
        assert_eq!(cb.attempt_count(), 1);
        cb.fail_next(&mut ctx);
        ctx.flush();
        assert_eq!(cc.attempt_count(), 1);
        assert_eq!(policy.check_connectivity(), ConnectivityState::Connecting);

        cc.succeed_next(&mut ctx, TestTransport::new());
        ctx.finish();
        assert_eq!(policy.check_connectivity(), ConnectivityState::Ready);
        assert_eq!(*completions.lock(), vec![true]);
        let picked = target.get().unwrap();
        assert!(Arc::ptr_eq(&picked, &c.connection().unwrap()));

        // Subsequent picks are immediate and also target C.
        let mut ctx = ExecCtx::new();
        for _ in 0..3 {
            let target = PickTarget::new();
            let immediate = policy.pick(
                &mut ctx,
                None,
                &Metadata::new(),
                &target,
                Closure::noop(),
            );
            assert!(immediate);
            assert!(Arc::ptr_eq(&target.get().unwrap(), &c.connection().unwrap()));
        }
        ctx.finish();
    }

    #[test]
    fn selected_leaving_ready_resumes_probing() {
        let (a, ca) = make_subchannel("a:2");
        let policy = PickFirstPolicy::new(vec![a.clone()]);
        let mut ctx = ExecCtx::new();
        policy.exit_idle(&mut ctx);
        ctx.flush();
        let transport = TestTransport::new();
        ca.succeed_next(&mut ctx, transport.clone());
        ctx.flush();
        assert_eq!(policy.check_connectivity(), ConnectivityState::Ready);
        let first_conn = a.connection().unwrap();

        // The transport starts failing: the subchannel reconnects, the
        // policy unpins and follows the probe.
        transport.set_state(&mut ctx, ConnectivityState::TransientFailure);
        ctx.flush();
        assert_eq!(policy.check_connectivity(), ConnectivityState::Connecting);
        ca.succeed_next(&mut ctx, TestTransport::new());
        ctx.finish();
        assert_eq!(policy.check_connectivity(), ConnectivityState::Ready);

        let mut ctx = ExecCtx::new();
        let target = PickTarget::new();
        assert!(policy.pick(&mut ctx, None, &Metadata::new(), &target, Closure::noop()));
        let picked = target.get().unwrap();
        assert!(!Arc::ptr_eq(&picked, &first_conn));
        ctx.finish();
    }

    #[test]
    fn cancel_pick_fails_only_that_pick() {
        let (a, _ca) = make_subchannel("a:3");
        let policy = PickFirstPolicy::new(vec![a]);
        let mut ctx = ExecCtx::new();
        let completions = Arc::new(Mutex::new(Vec::new()));
        let t1 = PickTarget::new();
        let t2 = PickTarget::new();
        policy.pick(&mut ctx, None, &Metadata::new(), &t1, pending_pick(&completions));
        policy.pick(&mut ctx, None, &Metadata::new(), &t2, pending_pick(&completions));
        ctx.flush();
        policy.cancel_pick(&mut ctx, &t1);
        ctx.finish();
        assert_eq!(*completions.lock(), vec![false]);
        assert!(t1.get().is_none());
        // t2 is still pending.
        let mut ctx = ExecCtx::new();
        policy.shutdown(&mut ctx);
        ctx.finish();
        assert_eq!(*completions.lock(), vec![false, false]);
    }

    #[test]
    fn shutdown_fails_pending_picks() {
        let (a, _ca) = make_subchannel("a:4");
        let policy = PickFirstPolicy::new(vec![a]);
        let mut ctx = ExecCtx::new();
        let completions = Arc::new(Mutex::new(Vec::new()));
        let target = PickTarget::new();
        policy.pick(&mut ctx, None, &Metadata::new(), &target, pending_pick(&completions));
        ctx.flush();
        policy.shutdown(&mut ctx);
        ctx.finish();
        assert_eq!(*completions.lock(), vec![false]);
        assert_eq!(policy.check_connectivity(), ConnectivityState::Shutdown);

        // Picks after shutdown fail immediately.
        let mut ctx = ExecCtx::new();
        let target = PickTarget::new();
        let immediate = policy.pick(&mut ctx, None, &Metadata::new(), &target, pending_pick(&completions));
        ctx.finish();
        assert!(!immediate);
        assert_eq!(*completions.lock(), vec![false, false]);
    }

    #[test]
    fn fatally_failed_subchannels_are_removed() {
        let (a, _ca) = make_subchannel("a:5");
        let (b, _cb) = make_subchannel("b:5");
        let policy = PickFirstPolicy::new(vec![a.clone(), b.clone()]);
        let mut ctx = ExecCtx::new();
        let completions = Arc::new(Mutex::new(Vec::new()));
        let target = PickTarget::new();
        policy.pick(&mut ctx, None, &Metadata::new(), &target, pending_pick(&completions));
        ctx.flush();

        a.shutdown(&mut ctx);
        ctx.flush();
        // The probe moved on to B, which began connecting.
        assert_eq!(policy.check_connectivity(), ConnectivityState::Connecting);
        b.shutdown(&mut ctx);
        ctx.finish();
        // No subchannels remain: aggregate is Shutdown and the pick failed.
        assert_eq!(policy.check_connectivity(), ConnectivityState::Shutdown);
        assert_eq!(*completions.lock(), vec![false]);
    }

    #[test]
    fn ping_one_requires_a_selection() {
        let (a, ca) = make_subchannel("a:6");
        let policy = PickFirstPolicy::new(vec![a]);
        let acks = Arc::new(AtomicUsize::new(0));
        let fails = Arc::new(AtomicUsize::new(0));
        let mut ctx = ExecCtx::new();
        let (acks2, fails2) = (acks.clone(), fails.clone());
        policy.ping_one(
            &mut ctx,
            Closure::new("ping", move |_, success| {
                if success {
                    acks2.fetch_add(1, Ordering::SeqCst);
                } else {
                    fails2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        ctx.flush();
        assert_eq!(fails.load(Ordering::SeqCst), 1);

        policy.exit_idle(&mut ctx);
        ctx.flush();
        let transport = TestTransport::new();
        ca.succeed_next(&mut ctx, transport.clone());
        ctx.flush();
        let (acks2, fails2) = (acks.clone(), fails.clone());
        policy.ping_one(
            &mut ctx,
            Closure::new("ping", move |_, success| {
                if success {
                    acks2.fetch_add(1, Ordering::SeqCst);
                } else {
                    fails2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        ctx.finish();
        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(transport.ping_count(), 1);
    }
}
