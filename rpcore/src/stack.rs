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

//! Channel-stack filters.
//!
//! A connection's channel stack is an ordered list of filters each op passes
//! through on its way to the transport, which acts as the terminal stage.
//! The core only defines the seam; interesting filters (compression, auth,
//! tracing) live outside it.

use crate::exec::ExecCtx;
use crate::ops::{StreamOp, TransportOp};

pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Observes or rewrites a per-stream op batch on its way down the stack.
    fn start_stream_op(&self, _ctx: &mut ExecCtx, _op: &mut StreamOp) {}

    /// Observes or rewrites a control-plane op on its way down the stack.
    fn start_op(&self, _ctx: &mut ExecCtx, _op: &mut TransportOp) {}
}
