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

//! Server dispatch: matching inbound streams to application requests.
//!
//! Each registered method (plus a catch-all for everything else) owns a
//! request matcher: a lock-free stack of requested-call tokens on one side
//! and a list of arrived-but-unmatched calls on the other.  A call lives on
//! exactly one side at any instant.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::client::transport::{IncomingStream, Transport, TransportStream};
use crate::completion::{CompletionQueue, Tag};
use crate::connectivity::{ConnectivityState, StateCell};
use crate::exec::{Closure, ExecCtx};
use crate::ops::{Metadata, TransportOp};
use crate::status::Status;

/// Tokens preallocated per server for `request_call`.
pub const MAX_REQUESTED_CALLS: usize = 32768;

const EMPTY_INDEX: u32 = u32::MAX;

/// Treiber stack over a fixed slab of indices, with an ABA generation
/// counter packed beside the head index.
pub(crate) struct LockFreeStack {
    head: AtomicU64,
    next: Vec<AtomicU32>,
}

fn pack(index: u32, generation: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

impl LockFreeStack {
    pub(crate) fn new(capacity: usize) -> Self {
        LockFreeStack {
            head: AtomicU64::new(pack(EMPTY_INDEX, 0)),
            next: (0..capacity).map(|_| AtomicU32::new(EMPTY_INDEX)).collect(),
        }
    }

    /// Pushes an index; returns whether the stack was empty beforehand.
    pub(crate) fn push(&self, index: u32) -> bool {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (old_index, generation) = unpack(head);
            self.next[index as usize].store(old_index, Ordering::Relaxed);
            let new_head = pack(index, generation.wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return old_index == EMPTY_INDEX;
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let (index, generation) = unpack(head);
            if index == EMPTY_INDEX {
                return None;
            }
            let next = self.next[index as usize].load(Ordering::Relaxed);
            let new_head = pack(next, generation.wrapping_add(1));
            if self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(index);
            }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum ServerCallState {
    NotStarted,
    Pending,
    Activated,
    Zombied,
}

/// A stream that arrived at the server, with its routing metadata parsed
/// out of the initial metadata batch.
pub struct ServerCall {
    stream: Arc<dyn TransportStream>,
    path: String,
    host: Option<String>,
    deadline: Option<Instant>,
    initial_metadata: Metadata,
    state: Mutex<ServerCallState>,
}

impl ServerCall {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn initial_metadata(&self) -> &Metadata {
        &self.initial_metadata
    }

    pub fn stream(&self) -> &Arc<dyn TransportStream> {
        &self.stream
    }

    fn zombify(&self) {
        *self.state.lock() = ServerCallState::Zombied;
    }

    fn is_zombied(&self) -> bool {
        *self.state.lock() == ServerCallState::Zombied
    }
}

/// Everything the application learns when its request matches a stream.
pub struct CallDetails {
    pub call: Arc<ServerCall>,
    pub path: String,
    pub host: Option<String>,
    pub deadline: Option<Instant>,
    pub initial_metadata: Metadata,
}

/// Filled in when the matched completion is delivered.
pub type RequestSlot = Arc<Mutex<Option<CallDetails>>>;

pub fn new_request_slot() -> RequestSlot {
    Arc::new(Mutex::new(None))
}

struct RequestedCall {
    cq: Arc<CompletionQueue>,
    tag: Tag,
    slot: RequestSlot,
}

/// The pairing structure between application requests and arrived streams.
struct RequestMatcher {
    /// Ready request tokens (indices into the server's requested-call slab).
    requests: LockFreeStack,
    /// Streams that arrived with no request outstanding.  Guarded by the
    /// per-matcher call lock; arrivals pop-or-append under it so a request
    /// and an arrival can never miss each other.
    pending: Mutex<VecDeque<Arc<ServerCall>>>,
}

impl RequestMatcher {
    fn new(capacity: usize) -> Self {
        RequestMatcher {
            requests: LockFreeStack::new(capacity),
            pending: Mutex::new(VecDeque::new()),
        }
    }
}

/// Identifies a registered method to `request_registered_call`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MethodId(usize);

struct RegisteredMethod {
    method: String,
    host: Option<String>,
    matcher: RequestMatcher,
}

struct MethodTableEntry {
    host: Option<String>,
    method: String,
    id: usize,
}

/// Per-server lookup table from (host, method) to registered-method slot,
/// using open addressing over 2x slots with the probe ceiling recorded.
struct MethodTable {
    slots: Vec<Option<MethodTableEntry>>,
    max_probes: usize,
}

fn kv_hash(host: Option<&str>, method: &str) -> usize {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let host_hash = host
        .map(|h| {
            let mut hasher = DefaultHasher::new();
            h.hash(&mut hasher);
            hasher.finish() as usize
        })
        .unwrap_or(0);
    let mut hasher = DefaultHasher::new();
    method.hash(&mut hasher);
    let method_hash = hasher.finish() as usize;
    host_hash.rotate_left(2) ^ method_hash
}

impl MethodTable {
    fn build(methods: &[Arc<RegisteredMethod>]) -> Self {
        let nslots = (2 * methods.len()).max(1);
        let mut table = MethodTable {
            slots: (0..nslots).map(|_| None).collect(),
            max_probes: 0,
        };
        for (id, rm) in methods.iter().enumerate() {
            let hash = kv_hash(rm.host.as_deref(), &rm.method);
            let mut probes = 0;
            while table.slots[(hash + probes) % nslots].is_some() {
                probes += 1;
            }
            table.slots[(hash + probes) % nslots] = Some(MethodTableEntry {
                host: rm.host.clone(),
                method: rm.method.clone(),
                id,
            });
            table.max_probes = table.max_probes.max(probes);
        }
        table
    }

    fn lookup(&self, host: Option<&str>, method: &str) -> Option<usize> {
        let nslots = self.slots.len();
        let hash = kv_hash(host, method);
        for i in 0..=self.max_probes {
            match &self.slots[(hash + i) % nslots] {
                Some(entry)
                    if entry.host.as_deref() == host && entry.method == method =>
                {
                    return Some(entry.id)
                }
                Some(_) => continue,
                None => break,
            }
        }
        None
    }
}

struct ChannelRecord {
    transport: Arc<dyn Transport>,
}

struct ListenerRecord {
    listener: Arc<dyn Listener>,
    destroyed: bool,
}

struct ShutdownTag {
    cq: Arc<CompletionQueue>,
    tag: Tag,
}

struct ServerGlobal {
    cqs: Vec<Arc<CompletionQueue>>,
    channels: Vec<ChannelRecord>,
    listeners: Vec<ListenerRecord>,
    shutdown_tags: Vec<ShutdownTag>,
    shutdown_published: bool,
    started: bool,
    last_shutdown_message: Option<Instant>,
}

/// Something that accepts connections for a server and turns them into
/// transports.
pub trait Listener: Send + Sync {
    fn start(&self, ctx: &mut ExecCtx, server: &Arc<Server>);
    /// Stop listening; `on_done` runs once the listener is fully torn down.
    fn destroy(&self, ctx: &mut ExecCtx, on_done: Closure);
}

pub struct Server {
    global: Mutex<ServerGlobal>,
    shutdown_flag: AtomicBool,
    registered: Mutex<Vec<Arc<RegisteredMethod>>>,
    method_table: Mutex<Option<MethodTable>>,
    unregistered_matcher: RequestMatcher,
    requested_calls: Vec<Mutex<Option<RequestedCall>>>,
    request_freelist: LockFreeStack,
    weak_self: Weak<Server>,
}

impl Server {
    pub fn new() -> Arc<Self> {
        Server::with_request_capacity(MAX_REQUESTED_CALLS)
    }

    /// `capacity` bounds the number of concurrently outstanding
    /// `request_call`s across all methods.
    pub fn with_request_capacity(capacity: usize) -> Arc<Self> {
        let freelist = LockFreeStack::new(capacity);
        for i in (0..capacity as u32).rev() {
            freelist.push(i);
        }
        Arc::new_cyclic(|weak_self| Server {
            global: Mutex::new(ServerGlobal {
                cqs: Vec::new(),
                channels: Vec::new(),
                listeners: Vec::new(),
                shutdown_tags: Vec::new(),
                shutdown_published: false,
                started: false,
                last_shutdown_message: None,
            }),
            shutdown_flag: AtomicBool::new(false),
            registered: Mutex::new(Vec::new()),
            method_table: Mutex::new(None),
            unregistered_matcher: RequestMatcher::new(capacity),
            requested_calls: (0..capacity).map(|_| Mutex::new(None)).collect(),
            request_freelist: freelist,
            weak_self: weak_self.clone(),
        })
    }

    /// Registers a method (with an optional exact host; None matches any
    /// authority).  Must happen before `start`.
    pub fn register_method(&self, method: impl Into<String>, host: Option<String>) -> MethodId {
        assert!(
            !self.global.lock().started,
            "methods must be registered before the server starts"
        );
        let mut registered = self.registered.lock();
        let id = registered.len();
        registered.push(Arc::new(RegisteredMethod {
            method: method.into(),
            host,
            matcher: RequestMatcher::new(self.requested_calls.len()),
        }));
        MethodId(id)
    }

    pub fn register_completion_queue(&self, cq: Arc<CompletionQueue>) {
        let mut global = self.global.lock();
        assert!(!global.started, "queues must be registered before start");
        global.cqs.push(cq);
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        let mut global = self.global.lock();
        assert!(!global.started, "listeners must be added before start");
        global.listeners.push(ListenerRecord {
            listener,
            destroyed: false,
        });
    }

    pub fn start(self: &Arc<Self>, ctx: &mut ExecCtx) {
        let listeners: Vec<Arc<dyn Listener>> = {
            let mut global = self.global.lock();
            assert!(!global.started, "server started twice");
            global.started = true;
            *self.method_table.lock() = Some(MethodTable::build(&self.registered.lock()));
            global.listeners.iter().map(|l| l.listener.clone()).collect()
        };
        for listener in listeners {
            listener.start(ctx, self);
        }
    }

    /// Attaches an established server-side transport: new inbound streams
    /// flow into the matcher, and the channel is torn down when the
    /// transport dies.
    pub fn add_transport(self: &Arc<Self>, ctx: &mut ExecCtx, transport: Arc<dyn Transport>) {
        {
            let mut global = self.global.lock();
            global.channels.push(ChannelRecord {
                transport: transport.clone(),
            });
        }
        let weak = self.weak_self.clone();
        transport.set_accept_stream(Some(Arc::new(
            move |ctx: &mut ExecCtx, incoming: IncomingStream| {
                if let Some(server) = weak.upgrade() {
                    server.on_stream_arrived(ctx, incoming);
                }
            },
        )));

        // Watch the transport so a dead channel is removed and shutdown can
        // complete.
        let cell = StateCell::new(ConnectivityState::Ready);
        let weak = self.weak_self.clone();
        let transport2 = transport.clone();
        let cell2 = cell.clone();
        let watch = Closure::new("server_channel_state", move |ctx, success| {
            if !success {
                return;
            }
            if cell2.get() == ConnectivityState::Shutdown {
                if let Some(server) = weak.upgrade() {
                    server.destroy_channel(ctx, &transport2);
                }
            }
        });
        transport.perform_op(
            ctx,
            TransportOp {
                connectivity_watch: Some((cell, watch)),
                ..Default::default()
            },
        );
    }

    fn destroy_channel(&self, ctx: &mut ExecCtx, transport: &Arc<dyn Transport>) {
        let mut global = self.global.lock();
        global
            .channels
            .retain(|c| !Arc::ptr_eq(&c.transport, transport));
        self.maybe_finish_shutdown(ctx, &mut global);
    }

    /// A new server-side stream, with initial metadata already read so
    /// `:path` and `:authority` are known.
    fn on_stream_arrived(&self, ctx: &mut ExecCtx, incoming: IncomingStream) {
        let mut metadata = incoming.initial_metadata;
        let Some(path) = metadata.remove(":path") else {
            // Not a routable stream; nothing to match it against.
            debug!("dropping inbound stream without :path");
            return;
        };
        let host = metadata.remove(":authority");
        let call = Arc::new(ServerCall {
            stream: incoming.stream,
            path,
            host,
            deadline: metadata.deadline,
            initial_metadata: metadata,
            state: Mutex::new(ServerCallState::NotStarted),
        });
        self.start_new_rpc(ctx, call);
    }

    fn start_new_rpc(&self, ctx: &mut ExecCtx, call: Arc<ServerCall>) {
        let table = self.method_table.lock();
        let registered = self.registered.lock();
        let method_id = table
            .as_ref()
            .and_then(|t| {
                t.lookup(call.host.as_deref(), &call.path)
                    .or_else(|| t.lookup(None, &call.path))
            });
        match method_id {
            Some(id) => {
                let rm = registered[id].clone();
                drop(registered);
                drop(table);
                self.finish_start_new_rpc(ctx, call, &rm.matcher);
            }
            None => {
                drop(registered);
                drop(table);
                self.finish_start_new_rpc(ctx, call, &self.unregistered_matcher);
            }
        }
    }

    fn finish_start_new_rpc(
        &self,
        ctx: &mut ExecCtx,
        call: Arc<ServerCall>,
        matcher: &RequestMatcher,
    ) {
        if self.shutdown_flag.load(Ordering::Acquire) {
            call.zombify();
            return;
        }
        // Pop-or-append atomically with respect to the request side's
        // pending walk, so neither side can strand the other.
        let token = {
            let mut pending = matcher.pending.lock();
            match matcher.requests.pop() {
                Some(token) => Some(token),
                None => {
                    *call.state.lock() = ServerCallState::Pending;
                    pending.push_back(call.clone());
                    None
                }
            }
        };
        if let Some(token) = token {
            self.begin_call(ctx, call, token);
        }
    }

    fn begin_call(&self, ctx: &mut ExecCtx, call: Arc<ServerCall>, token: u32) {
        let rc = self.requested_calls[token as usize]
            .lock()
            .take()
            .expect("token maps to an outstanding request");
        *call.state.lock() = ServerCallState::Activated;
        *rc.slot.lock() = Some(CallDetails {
            path: call.path.clone(),
            host: call.host.clone(),
            deadline: call.deadline,
            initial_metadata: call.initial_metadata.clone(),
            call,
        });
        let weak = self.weak_self.clone();
        rc.cq.end_op(
            ctx,
            rc.tag,
            true,
            Some(Closure::new("return_request_token", move |_, _| {
                if let Some(server) = weak.upgrade() {
                    server.request_freelist.push(token);
                }
            })),
        );
    }

    /// Requests the next call for a registered method (or any unregistered
    /// call when `method` is None).  The completion for `tag` fires on `cq`
    /// when a stream matches.
    pub fn request_call(
        &self,
        ctx: &mut ExecCtx,
        method: Option<MethodId>,
        cq: Arc<CompletionQueue>,
        tag: Tag,
        slot: RequestSlot,
    ) {
        cq.begin_op(tag);
        if self.shutdown_flag.load(Ordering::Acquire) {
            cq.end_op(ctx, tag, false, None);
            return;
        }
        let Some(token) = self.request_freelist.pop() else {
            warn!("out of request-call tokens; failing the request");
            cq.end_op(ctx, tag, false, None);
            return;
        };
        *self.requested_calls[token as usize].lock() = Some(RequestedCall { cq, tag, slot });

        let rm = method.map(|MethodId(id)| self.registered.lock()[id].clone());
        let matcher = match &rm {
            Some(rm) => &rm.matcher,
            None => &self.unregistered_matcher,
        };

        if matcher.requests.push(token) {
            // First token after emptiness: drain any calls that arrived
            // while no request was outstanding.
            loop {
                let matched = {
                    let mut pending = matcher.pending.lock();
                    if pending.is_empty() {
                        break;
                    }
                    match matcher.requests.pop() {
                        Some(token) => pending.pop_front().map(|call| (call, token)),
                        None => break,
                    }
                };
                if let Some((call, token)) = matched {
                    if call.is_zombied() {
                        // A zombied call consumed no request; put the token
                        // back.
                        self.request_freelist.push(token);
                        continue;
                    }
                    self.begin_call(ctx, call, token);
                }
            }
        }
    }

    fn kill_matcher_requests(&self, ctx: &mut ExecCtx, matcher: &RequestMatcher) {
        while let Some(token) = matcher.requests.pop() {
            if let Some(rc) = self.requested_calls[token as usize].lock().take() {
                rc.cq.end_op(ctx, rc.tag, false, None);
            }
            self.request_freelist.push(token);
        }
        let mut pending = matcher.pending.lock();
        for call in pending.drain(..) {
            call.zombify();
        }
    }

    fn kill_pending_work(&self, ctx: &mut ExecCtx) {
        self.kill_matcher_requests(ctx, &self.unregistered_matcher);
        let registered = self.registered.lock().clone();
        for rm in registered {
            self.kill_matcher_requests(ctx, &rm.matcher);
        }
    }

    fn maybe_finish_shutdown(&self, ctx: &mut ExecCtx, global: &mut ServerGlobal) {
        if !self.shutdown_flag.load(Ordering::Acquire) || global.shutdown_published {
            return;
        }
        let listeners_alive = global.listeners.iter().filter(|l| !l.destroyed).count();
        if !global.channels.is_empty() || listeners_alive > 0 {
            let now = Instant::now();
            let should_log = global
                .last_shutdown_message
                .map(|t| now.duration_since(t).as_secs() >= 1)
                .unwrap_or(true);
            if should_log {
                global.last_shutdown_message = Some(now);
                debug!(
                    channels = global.channels.len(),
                    listeners = listeners_alive,
                    "waiting for channels and listeners to be destroyed before shutting down"
                );
            }
            return;
        }
        global.shutdown_published = true;
        for st in global.shutdown_tags.drain(..) {
            st.cq.end_op(ctx, st.tag, true, None);
        }
    }

    /// Begins server shutdown: fails every outstanding request token,
    /// zombifies unmatched calls, says goodbye on every channel, destroys
    /// listeners, and posts `tag` to `cq` once everything has torn down.
    pub fn shutdown_and_notify(&self, ctx: &mut ExecCtx, cq: &Arc<CompletionQueue>, tag: Tag) {
        cq.begin_op(tag);
        let (channels, listeners) = {
            let mut global = self.global.lock();
            global.shutdown_tags.push(ShutdownTag {
                cq: cq.clone(),
                tag,
            });
            if self.shutdown_flag.swap(true, Ordering::AcqRel) {
                // Second caller: just wait alongside the first.
                self.maybe_finish_shutdown(ctx, &mut global);
                return;
            }
            let channels: Vec<Arc<dyn Transport>> = global
                .channels
                .iter()
                .map(|c| c.transport.clone())
                .collect();
            let listeners: Vec<Arc<dyn Listener>> = global
                .listeners
                .iter()
                .map(|l| l.listener.clone())
                .collect();
            (channels, listeners)
        };

        self.kill_pending_work(ctx);

        for transport in channels {
            transport.perform_op(
                ctx,
                TransportOp {
                    goaway: Some(Status::unavailable("Server shutdown")),
                    disconnect: true,
                    ..Default::default()
                },
            );
        }
        for (i, listener) in listeners.into_iter().enumerate() {
            let weak = self.weak_self.clone();
            listener.destroy(
                ctx,
                Closure::new("listener_destroyed", move |ctx, _| {
                    if let Some(server) = weak.upgrade() {
                        let mut global = server.global.lock();
                        if let Some(record) = global.listeners.get_mut(i) {
                            record.destroyed = true;
                        }
                        server.maybe_finish_shutdown(ctx, &mut global);
                    }
                }),
            );
        }
        let mut global = self.global.lock();
        self.maybe_finish_shutdown(ctx, &mut global);
    }

    /// The softer variant: disconnect every channel but do not begin
    /// teardown.
    pub fn cancel_all_calls(&self, ctx: &mut ExecCtx) {
        let channels: Vec<Arc<dyn Transport>> = self
            .global
            .lock()
            .channels
            .iter()
            .map(|c| c.transport.clone())
            .collect();
        for transport in channels {
            transport.perform_op(ctx, TransportOp::disconnect());
        }
    }
}
