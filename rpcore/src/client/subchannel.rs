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

//! Subchannels: the connection lifecycle for a single endpoint.
//!
//! A subchannel is keyed by (address, channel-args fingerprint) and shared
//! across channels through the [`SubchannelPool`].  It runs at most one
//! connect attempt at a time, publishes an active [`Connection`] on success,
//! and walks an exponential backoff schedule between failed attempts.  Calls
//! created while no connection exists queue until the first Ready.

use std::fmt::{self, Debug, Display};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, trace};

use crate::args::ChannelArgs;
use crate::client::transport::{Transport, TransportStream};
use crate::connectivity::{ConnectivityState, ConnectivityTracker, StateCell};
use crate::exec::{Closure, ExecCtx};
use crate::ops::{StreamOp, TransportOp};
use crate::poll::PollEntity;
use crate::stack::Filter;
use crate::timer::{Timer, TimerList};

/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Inputs to one connect attempt.
pub struct ConnectArgs {
    pub address: String,
    pub args: ChannelArgs,
    pub deadline: Instant,
    /// Poll entities interested in the connection being set up.
    pub interested_parties: Vec<PollEntity>,
}

/// Filled in by the connector before `on_done` runs.  A missing transport
/// means the attempt failed.
#[derive(Default)]
pub struct ConnectResult {
    pub transport: Option<Arc<dyn Transport>>,
    /// Extra filters the connector contributes to the channel stack.
    pub filters: Vec<Arc<dyn Filter>>,
}

pub type ConnectResultSlot = Arc<Mutex<ConnectResult>>;

/// Establishes transports.  The connector owns enforcement of the attempt
/// deadline it is handed.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        ctx: &mut ExecCtx,
        args: ConnectArgs,
        result: &ConnectResultSlot,
        on_done: Closure,
    );

    fn shutdown(&self, ctx: &mut ExecCtx);
}

/// A channel stack bound to a live transport.  Holds its own refcount,
/// distinct from the subchannel's: replacing a subchannel's active
/// connection does not tear down calls pinned to the old one.
pub struct Connection {
    filters: Vec<Arc<dyn Filter>>,
    transport: Arc<dyn Transport>,
}

impl Connection {
    pub(crate) fn new(filters: Vec<Arc<dyn Filter>>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Connection { filters, transport })
    }

    /// Creates a call carried on this connection's channel stack.
    pub fn create_call(
        self: &Arc<Self>,
        ctx: &mut ExecCtx,
        pollent: Option<&PollEntity>,
    ) -> Arc<SubchannelCall> {
        let stream = self.transport.init_stream(ctx, pollent);
        Arc::new(SubchannelCall {
            connection: self.clone(),
            stream,
        })
    }

    /// Runs a control-plane op down the stack and into the transport.
    pub fn process_op(&self, ctx: &mut ExecCtx, mut op: TransportOp) {
        for filter in &self.filters {
            filter.start_op(ctx, &mut op);
        }
        self.transport.perform_op(ctx, op);
    }

    pub fn ping(&self, ctx: &mut ExecCtx, on_ack: Closure) {
        self.process_op(
            ctx,
            TransportOp {
                ping: Some(on_ack),
                ..Default::default()
            },
        );
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

/// A single call on a specific connection.  The call pins its connection
/// alive past any subchannel state transitions.
pub struct SubchannelCall {
    connection: Arc<Connection>,
    stream: Arc<dyn TransportStream>,
}

impl SubchannelCall {
    /// Runs a stream op through the connection's filters into the transport.
    pub fn process_op(&self, ctx: &mut ExecCtx, mut op: StreamOp) {
        for filter in &self.connection.filters {
            filter.start_stream_op(ctx, &mut op);
        }
        self.connection
            .transport
            .perform_stream_op(ctx, &self.stream, op);
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn stream(&self) -> &Arc<dyn TransportStream> {
        &self.stream
    }
}

/// Shared out-slot a pending `create_call` fills once the connection exists.
pub type CallSlot = Arc<Mutex<Option<Arc<SubchannelCall>>>>;

pub fn new_call_slot() -> CallSlot {
    Arc::new(Mutex::new(None))
}

/// Identity of a subchannel in the pool.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubchannelKey {
    pub address: String,
    pub args_fingerprint: u64,
}

impl Display for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Debug for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:016x}", self.address, self.args_fingerprint)
    }
}

/// Pacing for reconnect attempts: delays grow geometrically from
/// `initial_backoff` towards `max_backoff`, each smeared by `jitter` in
/// both directions.
#[derive(Clone, Debug)]
pub struct ReconnectOptions {
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max_backoff: Duration,
}

impl Default for ReconnectOptions {
    /// The defaults from
    /// https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
    fn default() -> Self {
        ReconnectOptions {
            initial_backoff: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max_backoff: Duration::from_secs(120),
        }
    }
}

/// Where the subchannel currently sits on its backoff curve.  Lives inside
/// the subchannel lock with the rest of the reconnect state, so the delay
/// for attempt n is just a function of the failure count.
struct ReconnectSchedule {
    options: ReconnectOptions,
    consecutive_failures: u32,
}

impl ReconnectSchedule {
    /// Out-of-range options are pulled to the nearest usable value rather
    /// than failing subchannel construction.
    fn new(mut options: ReconnectOptions) -> Self {
        if options.multiplier < 1.0 {
            options.multiplier = 1.0;
        }
        options.jitter = options.jitter.clamp(0.0, 1.0);
        if options.max_backoff < options.initial_backoff {
            options.max_backoff = options.initial_backoff;
        }
        ReconnectSchedule {
            options,
            consecutive_failures: 0,
        }
    }

    /// The delay before the next attempt, advancing the curve.
    fn next_delay(&mut self) -> Duration {
        let exponent = self.consecutive_failures.min(63) as i32;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let unjittered = (self.options.initial_backoff.as_secs_f64()
            * self.options.multiplier.powi(exponent))
        .min(self.options.max_backoff.as_secs_f64());
        if self.options.jitter == 0.0 {
            return Duration::from_secs_f64(unjittered);
        }
        let spread = 1.0 + self.options.jitter * rand::rng().random_range(-1.0..=1.0);
        Duration::from_secs_f64(unjittered * spread)
    }

    /// The connection made it to Ready: the next failure starts over from
    /// the initial delay.
    fn reset(&mut self) {
        self.consecutive_failures = 0;
    }
}

pub struct SubchannelArgs {
    pub address: String,
    pub args: ChannelArgs,
    pub filters: Vec<Arc<dyn Filter>>,
    pub connector: Arc<dyn Connector>,
    pub timers: Arc<TimerList>,
    pub reconnect: ReconnectOptions,
    pub connect_timeout: Duration,
}

impl SubchannelArgs {
    pub fn new(
        address: impl Into<String>,
        connector: Arc<dyn Connector>,
        timers: Arc<TimerList>,
    ) -> Self {
        SubchannelArgs {
            address: address.into(),
            args: ChannelArgs::new(),
            filters: Vec::new(),
            connector,
            timers,
            reconnect: ReconnectOptions::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

struct WaitingForConnect {
    pollent: Option<PollEntity>,
    target: CallSlot,
    notify: Closure,
}

struct SubchannelInner {
    connecting: bool,
    shut_down: bool,
    /// Bumped each time a connection publishes; stale transport watchers
    /// compare against it and drop out.
    active_version: usize,
    backoff_timer: Option<Timer>,
    reconnect: ReconnectSchedule,
    waiting: Vec<WaitingForConnect>,
    interested_parties: Vec<PollEntity>,
}

pub struct Subchannel {
    key: SubchannelKey,
    args: ChannelArgs,
    filters: Vec<Arc<dyn Filter>>,
    connector: Arc<dyn Connector>,
    timers: Arc<TimerList>,
    connect_timeout: Duration,
    tracker: ConnectivityTracker,
    active: ArcSwapOption<Connection>,
    inner: Mutex<SubchannelInner>,
}

impl Subchannel {
    pub fn new(args: SubchannelArgs) -> Arc<Self> {
        let key = SubchannelKey {
            address: args.address.clone(),
            args_fingerprint: args.args.fingerprint(),
        };
        Arc::new(Subchannel {
            tracker: ConnectivityTracker::new(
                format!("subchannel:{}", key),
                ConnectivityState::Idle,
            ),
            key,
            args: args.args,
            filters: args.filters,
            connector: args.connector,
            timers: args.timers,
            connect_timeout: args.connect_timeout,
            active: ArcSwapOption::empty(),
            inner: Mutex::new(SubchannelInner {
                connecting: false,
                shut_down: false,
                active_version: 0,
                backoff_timer: None,
                reconnect: ReconnectSchedule::new(args.reconnect),
                waiting: Vec::new(),
                interested_parties: Vec::new(),
            }),
        })
    }

    pub fn key(&self) -> &SubchannelKey {
        &self.key
    }

    pub fn address(&self) -> &str {
        &self.key.address
    }

    /// The current active connection, if Ready.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.active.load_full()
    }

    /// Returns the current state; when `try_connect` is set and the
    /// subchannel is Idle, begins a connect attempt.
    pub fn check_connectivity(self: &Arc<Self>, ctx: &mut ExecCtx, try_connect: bool) -> ConnectivityState {
        let state = self.tracker.check();
        if try_connect && state == ConnectivityState::Idle {
            self.maybe_start_connecting(ctx);
        }
        state
    }

    /// Watcher registration; registering against an Idle subchannel kicks
    /// off a connection attempt, which is how LB policies start probes.
    pub fn notify_on_state_change(
        self: &Arc<Self>,
        ctx: &mut ExecCtx,
        observed: &Arc<StateCell>,
        notify: Closure,
    ) {
        let was_idle = self.tracker.notify_on_state_change(ctx, observed, notify);
        if was_idle {
            self.maybe_start_connecting(ctx);
        }
    }

    pub fn add_interested_party(&self, pollent: &PollEntity) {
        self.inner.lock().interested_parties.push(pollent.clone());
    }

    pub fn del_interested_party(&self, pollent: &PollEntity) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner
            .interested_parties
            .iter()
            .position(|e| e == pollent)
        {
            inner.interested_parties.swap_remove(pos);
        }
    }

    /// Creates a call.  Immediate when an active connection exists; otherwise
    /// the request queues until the subchannel first reaches Ready (starting
    /// an attempt if none is in flight), and `notify` runs once `target` is
    /// filled.
    pub fn create_call(
        self: &Arc<Self>,
        ctx: &mut ExecCtx,
        pollent: Option<&PollEntity>,
        target: &CallSlot,
        notify: Closure,
    ) {
        if let Some(conn) = self.active.load_full() {
            let call = conn.create_call(ctx, pollent);
            *target.lock() = Some(call);
            ctx.enqueue(notify, true);
            return;
        }
        let mut inner = self.inner.lock();
        if inner.shut_down {
            drop(inner);
            ctx.enqueue(notify, false);
            return;
        }
        inner.waiting.push(WaitingForConnect {
            pollent: pollent.cloned(),
            target: target.clone(),
            notify,
        });
        if let Some(pollent) = pollent {
            inner.interested_parties.push(pollent.clone());
        }
        let start = !inner.connecting;
        if start {
            inner.connecting = true;
        }
        drop(inner);
        if start {
            self.start_connect(ctx);
        }
    }

    fn maybe_start_connecting(self: &Arc<Self>, ctx: &mut ExecCtx) {
        let mut inner = self.inner.lock();
        if inner.shut_down || inner.connecting {
            return;
        }
        inner.connecting = true;
        drop(inner);
        self.start_connect(ctx);
    }

    /// Launches the connector.  Callers must have set `connecting` already.
    fn start_connect(self: &Arc<Self>, ctx: &mut ExecCtx) {
        self.tracker
            .set(ctx, ConnectivityState::Connecting, "connecting");
        let interested = self.inner.lock().interested_parties.clone();
        let args = ConnectArgs {
            address: self.key.address.clone(),
            args: self.args.clone(),
            deadline: Instant::now() + self.connect_timeout,
            interested_parties: interested,
        };
        let result: ConnectResultSlot = Arc::new(Mutex::new(ConnectResult::default()));
        let weak = Arc::downgrade(self);
        let result2 = result.clone();
        let on_done = Closure::new("subchannel_connected", move |ctx, _| {
            if let Some(sc) = weak.upgrade() {
                sc.on_connected(ctx, &result2);
            }
        });
        self.connector.connect(ctx, args, &result, on_done);
    }

    fn on_connected(self: &Arc<Self>, ctx: &mut ExecCtx, result: &ConnectResultSlot) {
        let outcome = {
            let mut slot = result.lock();
            ConnectResult {
                transport: slot.transport.take(),
                filters: std::mem::take(&mut slot.filters),
            }
        };
        match outcome.transport {
            Some(transport) => self.publish_transport(ctx, transport, outcome.filters),
            None => self.on_connect_failed(ctx),
        }
    }

    fn publish_transport(
        self: &Arc<Self>,
        ctx: &mut ExecCtx,
        transport: Arc<dyn Transport>,
        extra_filters: Vec<Arc<dyn Filter>>,
    ) {
        // Final filter list: the subchannel's chain, then the connector's
        // contribution; the transport itself is the terminal stage.
        let mut filters = self.filters.clone();
        filters.extend(extra_filters);
        let conn = Connection::new(filters, transport);

        let (version, waiting) = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                // An attempt that completes after shutdown drops the new
                // transport rather than adopting it.
                drop(inner);
                debug!(subchannel = %self.key, "dropping transport connected after shutdown");
                conn.process_op(ctx, TransportOp::disconnect());
                return;
            }
            inner.connecting = false;
            inner.active_version += 1;
            inner.reconnect.reset();
            (inner.active_version, std::mem::take(&mut inner.waiting))
        };
        self.active.store(Some(conn.clone()));
        self.tracker.set(ctx, ConnectivityState::Ready, "connected");

        // Watch the transport for failure so the subchannel can reconnect
        // or deactivate.
        self.watch_transport(ctx, &conn, version, ConnectivityState::Ready);

        for w in waiting {
            let call = conn.create_call(ctx, w.pollent.as_ref());
            *w.target.lock() = Some(call);
            ctx.enqueue(w.notify, true);
        }
    }

    fn watch_transport(
        self: &Arc<Self>,
        ctx: &mut ExecCtx,
        conn: &Arc<Connection>,
        version: usize,
        observed: ConnectivityState,
    ) {
        let cell = StateCell::new(observed);
        let weak = Arc::downgrade(self);
        let cell2 = cell.clone();
        let closure = Closure::new("subchannel_transport_state", move |ctx, success| {
            if !success {
                return;
            }
            if let Some(sc) = weak.upgrade() {
                sc.on_transport_state_changed(ctx, version, cell2.get());
            }
        });
        conn.process_op(
            ctx,
            TransportOp {
                connectivity_watch: Some((cell, closure)),
                ..Default::default()
            },
        );
    }

    fn on_transport_state_changed(
        self: &Arc<Self>,
        ctx: &mut ExecCtx,
        version: usize,
        state: ConnectivityState,
    ) {
        let conn = self.active.load_full();
        let mut inner = self.inner.lock();
        if inner.shut_down || inner.active_version != version {
            return;
        }
        trace!(subchannel = %self.key, state = %state, "transport state change");
        match state {
            ConnectivityState::Idle
            | ConnectivityState::Connecting
            | ConnectivityState::Ready => {
                // Still healthy: keep watching.
                drop(inner);
                if let Some(conn) = conn {
                    self.watch_transport(ctx, &conn, version, state);
                }
            }
            ConnectivityState::TransientFailure => {
                // Starting to go wrong: reconnect without deactivating, so
                // in-flight calls on the old connection continue.
                if !inner.connecting {
                    inner.connecting = true;
                    drop(inner);
                    self.start_connect(ctx);
                }
            }
            ConnectivityState::Shutdown => {
                // The transport is gone; deactivate and return to Idle.
                drop(inner);
                self.active.store(None);
                let next = if self.inner.lock().connecting {
                    ConnectivityState::Connecting
                } else {
                    ConnectivityState::Idle
                };
                self.tracker.set(ctx, next, "transport_closed");
            }
        }
    }

    fn on_connect_failed(self: &Arc<Self>, ctx: &mut ExecCtx) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        inner.connecting = false;
        // Walk the backoff curve; reaching Ready resets it.
        let delay = inner.reconnect.next_delay();
        drop(inner);
        self.tracker
            .set(ctx, ConnectivityState::TransientFailure, "connect_failed");

        let now = Instant::now();
        let weak = Arc::downgrade(self);
        let timer = self.timers.init(
            ctx,
            now,
            now + delay,
            Closure::new("subchannel_backoff", move |ctx, success| {
                if !success {
                    return;
                }
                if let Some(sc) = weak.upgrade() {
                    sc.on_backoff_expired(ctx);
                }
            }),
        );
        self.inner.lock().backoff_timer = Some(timer);
    }

    fn on_backoff_expired(self: &Arc<Self>, ctx: &mut ExecCtx) {
        let mut inner = self.inner.lock();
        inner.backoff_timer = None;
        if inner.shut_down || inner.connecting {
            return;
        }
        inner.connecting = true;
        drop(inner);
        self.start_connect(ctx);
    }

    /// Terminal shutdown: fails queued calls, cancels the backoff timer,
    /// drops the active connection reference (calls pinned to it proceed),
    /// and moves the tracker to Shutdown.
    pub fn shutdown(self: &Arc<Self>, ctx: &mut ExecCtx) {
        let (waiting, timer) = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            (
                std::mem::take(&mut inner.waiting),
                inner.backoff_timer.take(),
            )
        };
        if let Some(timer) = timer {
            self.timers.cancel(ctx, &timer);
        }
        for w in waiting {
            *w.target.lock() = None;
            ctx.enqueue(w.notify, false);
        }
        self.connector.shutdown(ctx);
        self.active.store(None);
        self.tracker.set(ctx, ConnectivityState::Shutdown, "shutdown");
    }
}

impl Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({:?})", self.key)
    }
}

/// The subchannel index: shares subchannels across channels by identity.
/// Holds weak references; a subchannel lives as long as some channel or LB
/// policy holds it.
pub struct SubchannelPool {
    subchannels: RwLock<BTreeMap<SubchannelKey, Weak<Subchannel>>>,
}

impl SubchannelPool {
    pub fn new() -> Arc<Self> {
        Arc::new(SubchannelPool {
            subchannels: RwLock::new(BTreeMap::new()),
        })
    }

    /// Returns the pooled subchannel for the args' identity, creating and
    /// registering one if needed.
    pub fn subchannel_for(&self, args: SubchannelArgs) -> Arc<Subchannel> {
        let key = SubchannelKey {
            address: args.address.clone(),
            args_fingerprint: args.args.fingerprint(),
        };
        if let Some(existing) = self.subchannels.read().get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let mut map = self.subchannels.write();
        // Double-checked: another thread may have registered meanwhile.
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        trace!(key = %key, "creating pooled subchannel");
        let sc = Subchannel::new(args);
        map.insert(key, Arc::downgrade(&sc));
        sc
    }

    /// Drops dead entries.
    pub fn prune(&self) {
        self.subchannels
            .write()
            .retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.subchannels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_utils::{ManualConnector, TestTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<TimerList>, Arc<ManualConnector>, Arc<Subchannel>) {
        let timers = Arc::new(TimerList::new(Instant::now()));
        let connector = ManualConnector::new();
        let sc = Subchannel::new(SubchannelArgs::new(
            "ipv4:127.0.0.1:50051",
            connector.clone(),
            timers.clone(),
        ));
        (timers, connector, sc)
    }

    #[test]
    fn starts_idle() {
        let (_timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        assert_eq!(
            sc.check_connectivity(&mut ctx, false),
            ConnectivityState::Idle
        );
        ctx.finish();
        assert_eq!(connector.attempt_count(), 0);
    }

    #[test]
    fn try_connect_reaches_ready() {
        let (_timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        assert_eq!(
            sc.check_connectivity(&mut ctx, true),
            ConnectivityState::Idle
        );
        ctx.flush();
        assert_eq!(sc.check_connectivity(&mut ctx, false), ConnectivityState::Connecting);
        assert_eq!(connector.attempt_count(), 1);
        connector.succeed_next(&mut ctx, TestTransport::new());
        ctx.finish();
        assert_eq!(
            sc.check_connectivity(&mut ExecCtx::new(), false),
            ConnectivityState::Ready
        );
        assert!(sc.connection().is_some());
    }

    #[test]
    fn create_call_is_immediate_when_ready() {
        let (_timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        sc.check_connectivity(&mut ctx, true);
        connector.succeed_next(&mut ctx, TestTransport::new());
        ctx.flush();

        let slot = new_call_slot();
        let done = Arc::new(AtomicUsize::new(0));
        let done2 = done.clone();
        sc.create_call(
            &mut ctx,
            None,
            &slot,
            Closure::new("ready", move |_, success| {
                assert!(success);
                done2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        ctx.finish();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(slot.lock().is_some());
    }

    #[test]
    fn queued_calls_drain_when_connection_publishes() {
        let (_timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        let slots: Vec<CallSlot> = (0..3).map(|_| new_call_slot()).collect();
        let done = Arc::new(AtomicUsize::new(0));
        for slot in &slots {
            let done = done.clone();
            sc.create_call(
                &mut ctx,
                None,
                slot,
                Closure::new("queued", move |_, success| {
                    assert!(success);
                    done.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        ctx.flush();
        // One attempt in flight for all three waiters.
        assert_eq!(connector.attempt_count(), 1);
        assert_eq!(done.load(Ordering::SeqCst), 0);

        connector.succeed_next(&mut ctx, TestTransport::new());
        ctx.finish();
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(slots.iter().all(|s| s.lock().is_some()));
        // All calls share the single published connection.
        let conn = slots[0].lock().as_ref().unwrap().connection().clone();
        assert!(slots
            .iter()
            .all(|s| Arc::ptr_eq(s.lock().as_ref().unwrap().connection(), &conn)));
    }

    #[test]
    fn failure_backs_off_then_retries() {
        let (timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        sc.check_connectivity(&mut ctx, true);
        ctx.flush();
        assert_eq!(connector.attempt_count(), 1);

        connector.fail_next(&mut ctx);
        ctx.flush();
        assert_eq!(
            sc.check_connectivity(&mut ctx, false),
            ConnectivityState::TransientFailure
        );
        // No new attempt until the backoff timer fires.
        assert_eq!(connector.attempt_count(), 1);

        // Base delay is 1s +/- 20% jitter; firing well past that retries.
        timers.check(&mut ctx, Instant::now() + Duration::from_secs(5), None);
        ctx.flush();
        assert_eq!(connector.attempt_count(), 2);
        assert_eq!(
            sc.check_connectivity(&mut ctx, false),
            ConnectivityState::Connecting
        );
        connector.succeed_next(&mut ctx, TestTransport::new());
        ctx.finish();
        assert_eq!(
            sc.check_connectivity(&mut ExecCtx::new(), false),
            ConnectivityState::Ready
        );
    }

    #[test]
    fn reconnect_delays_grow_and_cap() {
        let mut schedule = ReconnectSchedule::new(ReconnectOptions {
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
            max_backoff: Duration::from_secs(15),
        });
        for _ in 0..2 {
            assert_eq!(schedule.next_delay(), Duration::from_secs(1));
            assert_eq!(schedule.next_delay(), Duration::from_secs(2));
            assert_eq!(schedule.next_delay(), Duration::from_secs(4));
            assert_eq!(schedule.next_delay(), Duration::from_secs(8));
            // Capped from here on.
            assert_eq!(schedule.next_delay(), Duration::from_secs(15));
            assert_eq!(schedule.next_delay(), Duration::from_secs(15));
            // Reaching Ready starts the curve over.
            schedule.reset();
        }
    }

    #[test]
    fn reconnect_jitter_stays_in_band() {
        let mut schedule = ReconnectSchedule::new(ReconnectOptions {
            initial_backoff: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.2,
            max_backoff: Duration::from_secs(15),
        });
        // 0.8s..1.2s, then 1.6s..2.4s.
        let delay = schedule.next_delay();
        assert!(delay >= Duration::from_millis(799) && delay <= Duration::from_millis(1201));
        let delay = schedule.next_delay();
        assert!(delay >= Duration::from_millis(1599) && delay <= Duration::from_millis(2401));
    }

    #[test]
    fn degenerate_reconnect_options_are_sanitized() {
        let schedule = ReconnectSchedule::new(ReconnectOptions {
            initial_backoff: Duration::from_secs(10),
            multiplier: 0.25,
            jitter: 7.0,
            max_backoff: Duration::from_secs(1),
        });
        assert_eq!(schedule.options.multiplier, 1.0);
        assert_eq!(schedule.options.jitter, 1.0);
        assert_eq!(schedule.options.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn at_most_one_attempt_in_flight() {
        let (_timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        sc.check_connectivity(&mut ctx, true);
        sc.check_connectivity(&mut ctx, true);
        let slot = new_call_slot();
        sc.create_call(&mut ctx, None, &slot, Closure::noop());
        ctx.finish();
        assert_eq!(connector.attempt_count(), 1);
    }

    #[test]
    fn shutdown_fails_waiting_calls_and_is_terminal() {
        let (_timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        let slot = new_call_slot();
        let failed = Arc::new(AtomicUsize::new(0));
        let failed2 = failed.clone();
        sc.create_call(
            &mut ctx,
            None,
            &slot,
            Closure::new("waiting", move |_, success| {
                assert!(!success);
                failed2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        sc.shutdown(&mut ctx);
        ctx.finish();
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert!(slot.lock().is_none());
        assert_eq!(
            sc.check_connectivity(&mut ExecCtx::new(), false),
            ConnectivityState::Shutdown
        );
        assert!(connector.is_shut_down());
    }

    #[test]
    fn transport_connected_after_shutdown_is_dropped() {
        let (_timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        sc.check_connectivity(&mut ctx, true);
        ctx.flush();
        sc.shutdown(&mut ctx);
        ctx.flush();
        let transport = TestTransport::new();
        connector.succeed_next(&mut ctx, transport.clone());
        ctx.finish();
        assert!(sc.connection().is_none());
        assert!(transport.is_disconnected());
    }

    #[test]
    fn transport_failure_triggers_reconnect_without_deactivation() {
        let (_timers, connector, sc) = setup();
        let mut ctx = ExecCtx::new();
        sc.check_connectivity(&mut ctx, true);
        let transport = TestTransport::new();
        connector.succeed_next(&mut ctx, transport.clone());
        ctx.flush();
        let conn_before = sc.connection().unwrap();

        transport.set_state(&mut ctx, ConnectivityState::TransientFailure);
        ctx.flush();
        // Reconnect attempt launched; old connection still published.
        assert_eq!(connector.attempt_count(), 2);
        assert!(Arc::ptr_eq(&sc.connection().unwrap(), &conn_before));

        connector.succeed_next(&mut ctx, TestTransport::new());
        ctx.finish();
        let conn_after = sc.connection().unwrap();
        assert!(!Arc::ptr_eq(&conn_before, &conn_after));
    }

    // The channel stack runs every filter, subchannel-supplied ones before
    // connector-supplied ones, with the transport as the terminal stage.
    #[test]
    fn filters_run_in_stack_order() {
        struct StampFilter(&'static str);

        impl Filter for StampFilter {
            fn name(&self) -> &'static str {
                self.0
            }

            fn start_stream_op(&self, _ctx: &mut ExecCtx, op: &mut StreamOp) {
                if let Some(send) = &mut op.send {
                    if let Some(md) = &mut send.initial_metadata {
                        md.append("filter", self.0);
                    }
                }
            }
        }

        let timers = Arc::new(TimerList::new(Instant::now()));
        let connector = ManualConnector::new();
        let mut args = SubchannelArgs::new("ipv4:127.0.0.1:50051", connector.clone(), timers);
        args.filters = vec![Arc::new(StampFilter("subchannel"))];
        let sc = Subchannel::new(args);

        let mut ctx = ExecCtx::new();
        sc.check_connectivity(&mut ctx, true);
        ctx.flush();
        let transport = TestTransport::new();
        let (slot, on_done) = connector
            .take_pending()
            .expect("connect attempt outstanding");
        {
            let mut result = slot.lock();
            result.transport = Some(transport.clone());
            result.filters = vec![Arc::new(StampFilter("connector"))];
        }
        ctx.enqueue(on_done, true);
        ctx.flush();

        let slot = new_call_slot();
        sc.create_call(&mut ctx, None, &slot, Closure::noop());
        ctx.flush();
        let call = slot.lock().clone().unwrap();
        let mut md = crate::ops::Metadata::new();
        md.append(":path", "/svc/Method");
        call.process_op(&mut ctx, StreamOp::send_initial_metadata(md));
        ctx.finish();

        let ops = transport.take_stream_ops();
        assert_eq!(ops.len(), 1);
        let md = ops[0].1.initial_metadata().unwrap();
        let stamps: Vec<&str> = md
            .iter()
            .filter(|(k, _)| *k == "filter")
            .map(|(_, v)| v)
            .collect();
        assert_eq!(stamps, vec!["subchannel", "connector"]);
    }

    #[test]
    fn pool_shares_by_identity() {
        let timers = Arc::new(TimerList::new(Instant::now()));
        let connector = ManualConnector::new();
        let pool = SubchannelPool::new();
        let a = pool.subchannel_for(SubchannelArgs::new(
            "ipv4:10.0.0.1:443",
            connector.clone(),
            timers.clone(),
        ));
        let b = pool.subchannel_for(SubchannelArgs::new(
            "ipv4:10.0.0.1:443",
            connector.clone(),
            timers.clone(),
        ));
        assert!(Arc::ptr_eq(&a, &b));
        let mut other = SubchannelArgs::new("ipv4:10.0.0.2:443", connector.clone(), timers.clone());
        other.args = ChannelArgs::new().set_int("max_frame_size", 1024);
        let c = pool.subchannel_for(other);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);
        drop((a, b, c));
        pool.prune();
        assert!(pool.is_empty());
    }
}
