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

//! Stream and transport operation batches.
//!
//! These are the interface types the core exchanges with transports and
//! filters.  Metadata and byte-buffer containers proper live outside the
//! core; what is here is the minimum the routing machinery needs to carry.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::connectivity::StateCell;
use crate::exec::{Closure, ExecCtx};
use crate::poll::PollEntity;
use crate::status::Status;

/// An ordered list of metadata entries plus the batch deadline.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    entries: Vec<(String, String)>,
    pub deadline: Option<Instant>,
}

impl Metadata {
    pub fn new() -> Self {
        Metadata::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where recv-side results accumulate for one call: initial metadata,
/// messages, and the terminating status.  Shared between the op submitter
/// and whoever completes the recv (transport or cancellation synthesis).
#[derive(Debug, Default)]
pub struct RecvState {
    pub initial_metadata: Metadata,
    pub messages: Vec<Bytes>,
    pub trailing_metadata: Metadata,
    pub status: Option<Status>,
    pub closed: bool,
}

#[derive(Clone, Default)]
pub struct RecvSink(Arc<Mutex<RecvState>>);

impl RecvSink {
    pub fn new() -> Self {
        RecvSink::default()
    }

    pub fn state(&self) -> parking_lot::MutexGuard<'_, RecvState> {
        self.0.lock()
    }

    /// Writes a terminating status into the sink, the way a cancellation is
    /// surfaced: synthesized `grpc-status`/`grpc-message` trailing metadata
    /// and a closed stream.
    pub fn close_with_status(&self, status: Status) {
        let mut state = self.0.lock();
        state
            .trailing_metadata
            .append("grpc-status", (status.code() as i32).to_string());
        if !status.message().is_empty() {
            state
                .trailing_metadata
                .append("grpc-message", status.message().to_string());
        }
        state.status = Some(status);
        state.closed = true;
    }
}

impl fmt::Debug for RecvSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.lock();
        write!(f, "RecvSink(closed={}, status={:?})", state.closed, state.status)
    }
}

/// The send half of a stream op: at most one per batch.
#[derive(Debug, Default)]
pub struct SendOps {
    pub initial_metadata: Option<Metadata>,
    pub messages: Vec<Bytes>,
    /// Half-closes the stream after the sends.
    pub close: bool,
}

/// One batch of per-stream work flowing down a call.
///
/// At most one send half and one recv half; a cancellation overrides
/// everything else in flight for the call.
#[derive(Debug, Default)]
pub struct StreamOp {
    pub send: Option<SendOps>,
    pub on_done_send: Option<Closure>,
    pub recv: Option<RecvSink>,
    pub on_done_recv: Option<Closure>,
    pub cancel_with_status: Option<Status>,
    pub on_consumed: Option<Closure>,
    pub bind_pollent: Option<PollEntity>,
}

impl StreamOp {
    /// A batch carrying only a cancellation.
    pub fn cancel(status: Status) -> Self {
        StreamOp {
            cancel_with_status: Some(status),
            ..Default::default()
        }
    }

    /// A batch sending initial metadata (the op that makes a call pickable).
    pub fn send_initial_metadata(metadata: Metadata) -> Self {
        StreamOp {
            send: Some(SendOps {
                initial_metadata: Some(metadata),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.send.is_none()
            && self.on_done_send.is_none()
            && self.recv.is_none()
            && self.on_done_recv.is_none()
            && self.cancel_with_status.is_none()
            && self.on_consumed.is_none()
    }

    pub fn initial_metadata(&self) -> Option<&Metadata> {
        self.send.as_ref()?.initial_metadata.as_ref()
    }

    /// Completes every closure on the batch with `success=false`, without
    /// touching the recv sink.  Used when an op can no longer be delivered
    /// anywhere.
    pub fn fail(self, ctx: &mut ExecCtx) {
        if let Some(done) = self.on_done_send {
            ctx.enqueue(done, false);
        }
        if let Some(done) = self.on_done_recv {
            ctx.enqueue(done, false);
        }
        if let Some(done) = self.on_consumed {
            ctx.enqueue(done, false);
        }
    }

    /// Synthesizes the cancelled outcome for a batch that never reached a
    /// transport: the recv sink (if any) is closed with `status`, and every
    /// completion closure runs with `success=false`.
    pub fn finish_with_cancellation(self, ctx: &mut ExecCtx, status: &Status) {
        if let Some(recv) = &self.recv {
            recv.close_with_status(status.clone());
        }
        self.fail(ctx);
    }
}

/// Control-plane (per-transport, not per-stream) operations.
#[derive(Default)]
pub struct TransportOp {
    /// Register a connectivity watcher on the transport.
    pub connectivity_watch: Option<(Arc<StateCell>, Closure)>,
    /// Begin an orderly goodbye: stop accepting new streams.
    pub goaway: Option<Status>,
    /// Drop the connection.
    pub disconnect: bool,
    /// Ping the peer; the closure completes when the pong arrives.
    pub ping: Option<Closure>,
    pub bind_pollent: Option<PollEntity>,
    pub on_consumed: Option<Closure>,
}

impl TransportOp {
    pub fn disconnect() -> Self {
        TransportOp {
            disconnect: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.connectivity_watch.is_none()
            && self.goaway.is_none()
            && !self.disconnect
            && self.ping.is_none()
            && self.bind_pollent.is_none()
            && self.on_consumed.is_none()
    }
}

impl fmt::Debug for TransportOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOp")
            .field("watch", &self.connectivity_watch.is_some())
            .field("goaway", &self.goaway)
            .field("disconnect", &self.disconnect)
            .finish()
    }
}
