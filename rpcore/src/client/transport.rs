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

//! The transport seam.
//!
//! Wire protocols live outside the core; everything here consumes a
//! [`Transport`] through this trait.  A transport owns framing and I/O, and
//! surfaces per-stream operations plus a small control plane.

use std::any::Any;
use std::sync::Arc;

use crate::exec::ExecCtx;
use crate::ops::{Metadata, StreamOp, TransportOp};
use crate::poll::PollEntity;

/// Opaque per-stream handle issued by a transport.  Implementations downcast
/// through `as_any` to recover their own state.
pub trait TransportStream: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

/// A new inbound stream surfaced to the accept-stream callback, after
/// initial metadata has been read.
pub struct IncomingStream {
    pub stream: Arc<dyn TransportStream>,
    pub initial_metadata: Metadata,
}

pub type AcceptStreamFn = Arc<dyn Fn(&mut ExecCtx, IncomingStream) + Send + Sync>;

pub trait Transport: Send + Sync {
    /// Creates a new outgoing stream.
    fn init_stream(
        &self,
        ctx: &mut ExecCtx,
        pollent: Option<&PollEntity>,
    ) -> Arc<dyn TransportStream>;

    /// Submits a batch of work for one stream.
    fn perform_stream_op(&self, ctx: &mut ExecCtx, stream: &Arc<dyn TransportStream>, op: StreamOp);

    /// Submits control-plane work (connectivity watch, goaway, disconnect).
    fn perform_op(&self, ctx: &mut ExecCtx, op: TransportOp);

    /// Server side only: installs the callback invoked for each new inbound
    /// stream.  `None` uninstalls.
    fn set_accept_stream(&self, cb: Option<AcceptStreamFn>);
}
