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

//! The in-process execution substrate of a gRPC-style RPC runtime: deferred
//! closure scheduling, sharded timers, completion queues, connectivity
//! tracking, subchannel lifecycle, load-balancing dispatch, client call
//! routing, and server request matching.
//!
//! Wire protocols, TLS, and the public call surface live elsewhere and plug
//! in through the [`client::transport::Transport`], [`client::subchannel::Connector`],
//! [`client::name_resolution::Resolver`], and [`poll::Poller`] traits.

pub mod args;
pub mod client;
pub mod completion;
pub mod connectivity;
pub mod exec;
pub mod ops;
pub mod poll;
pub mod server;
pub mod stack;
pub mod status;
pub mod timer;
