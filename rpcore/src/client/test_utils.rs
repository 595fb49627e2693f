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

//! Shared stubs for driving subchannels, LB policies, and channels from
//! tests: a hand-cranked connector and a transport that records everything
//! it is asked to do.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::subchannel::{ConnectArgs, Connector, ConnectResultSlot};
use crate::client::transport::{AcceptStreamFn, IncomingStream, Transport, TransportStream};
use crate::connectivity::{ConnectivityState, ConnectivityTracker};
use crate::exec::{Closure, ExecCtx};
use crate::ops::{Metadata, StreamOp, TransportOp};
use crate::poll::PollEntity;

/// A connector whose attempts complete only when the test says so.
pub(crate) struct ManualConnector {
    state: Mutex<ManualConnectorState>,
}

struct ManualConnectorState {
    pending: VecDeque<(ConnectResultSlot, Closure)>,
    attempts: usize,
    shut_down: bool,
}

impl ManualConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ManualConnector {
            state: Mutex::new(ManualConnectorState {
                pending: VecDeque::new(),
                attempts: 0,
                shut_down: false,
            }),
        })
    }

    pub(crate) fn attempt_count(&self) -> usize {
        self.state.lock().attempts
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Hands the oldest outstanding attempt to the test to complete by
    /// hand (to fill in connector-contributed filters, say).
    pub(crate) fn take_pending(&self) -> Option<(ConnectResultSlot, Closure)> {
        self.state.lock().pending.pop_front()
    }

    /// Completes the oldest outstanding attempt with a transport.
    pub(crate) fn succeed_next(&self, ctx: &mut ExecCtx, transport: Arc<TestTransport>) {
        let (slot, on_done) = self
            .state
            .lock()
            .pending
            .pop_front()
            .expect("no outstanding connect attempt");
        slot.lock().transport = Some(transport);
        ctx.enqueue(on_done, true);
    }

    /// Completes the oldest outstanding attempt with a failure.
    pub(crate) fn fail_next(&self, ctx: &mut ExecCtx) {
        let (_slot, on_done) = self
            .state
            .lock()
            .pending
            .pop_front()
            .expect("no outstanding connect attempt");
        ctx.enqueue(on_done, false);
    }
}

impl Connector for ManualConnector {
    fn connect(
        &self,
        ctx: &mut ExecCtx,
        _args: ConnectArgs,
        result: &ConnectResultSlot,
        on_done: Closure,
    ) {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.shut_down {
            drop(state);
            ctx.enqueue(on_done, false);
            return;
        }
        state.pending.push_back((result.clone(), on_done));
    }

    fn shutdown(&self, _ctx: &mut ExecCtx) {
        self.state.lock().shut_down = true;
    }
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct TestStream {
    pub(crate) id: u64,
}

impl TransportStream for TestStream {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct TestTransportInner {
    disconnected: bool,
    streams_created: usize,
    stream_ops: Vec<(Arc<dyn TransportStream>, StreamOp)>,
    accept_cb: Option<AcceptStreamFn>,
    pings: usize,
}

/// Records stream creation and every op submitted; connectivity is driven
/// by the test through `set_state`.
pub(crate) struct TestTransport {
    tracker: ConnectivityTracker,
    inner: Mutex<TestTransportInner>,
}

impl TestTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(TestTransport {
            tracker: ConnectivityTracker::new("test_transport", ConnectivityState::Ready),
            inner: Mutex::new(TestTransportInner {
                disconnected: false,
                streams_created: 0,
                stream_ops: Vec::new(),
                accept_cb: None,
                pings: 0,
            }),
        })
    }

    pub(crate) fn set_state(&self, ctx: &mut ExecCtx, state: ConnectivityState) {
        self.tracker.set(ctx, state, "test");
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.inner.lock().disconnected
    }

    pub(crate) fn streams_created(&self) -> usize {
        self.inner.lock().streams_created
    }

    pub(crate) fn ping_count(&self) -> usize {
        self.inner.lock().pings
    }

    pub(crate) fn take_stream_ops(&self) -> Vec<(Arc<dyn TransportStream>, StreamOp)> {
        std::mem::take(&mut self.inner.lock().stream_ops)
    }

    pub(crate) fn stream_op_count(&self) -> usize {
        self.inner.lock().stream_ops.len()
    }

    /// Simulates an inbound stream arriving with the given initial metadata.
    pub(crate) fn arrive_stream(&self, ctx: &mut ExecCtx, initial_metadata: Metadata) {
        let cb = self.inner.lock().accept_cb.clone();
        let stream: Arc<dyn TransportStream> = Arc::new(TestStream {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
        });
        let cb = cb.expect("no accept-stream callback installed");
        cb(
            ctx,
            IncomingStream {
                stream,
                initial_metadata,
            },
        );
    }
}

impl Transport for TestTransport {
    fn init_stream(
        &self,
        _ctx: &mut ExecCtx,
        _pollent: Option<&PollEntity>,
    ) -> Arc<dyn TransportStream> {
        let mut inner = self.inner.lock();
        inner.streams_created += 1;
        Arc::new(TestStream {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    fn perform_stream_op(
        &self,
        _ctx: &mut ExecCtx,
        stream: &Arc<dyn TransportStream>,
        op: StreamOp,
    ) {
        self.inner.lock().stream_ops.push((stream.clone(), op));
    }

    fn perform_op(&self, ctx: &mut ExecCtx, op: TransportOp) {
        if let Some((cell, closure)) = op.connectivity_watch {
            self.tracker.notify_on_state_change(ctx, &cell, closure);
        }
        if op.disconnect {
            let already = {
                let mut inner = self.inner.lock();
                std::mem::replace(&mut inner.disconnected, true)
            };
            if !already {
                self.tracker.set(ctx, ConnectivityState::Shutdown, "disconnect");
            }
        }
        if let Some(on_ack) = op.ping {
            self.inner.lock().pings += 1;
            ctx.enqueue(on_ack, true);
        }
        if let Some(on_consumed) = op.on_consumed {
            ctx.enqueue(on_consumed, true);
        }
    }

    fn set_accept_stream(&self, cb: Option<AcceptStreamFn>) {
        self.inner.lock().accept_cb = cb;
    }
}
