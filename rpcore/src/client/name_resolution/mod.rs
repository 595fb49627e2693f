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

//! Name resolution: turning a channel target into client configuration.
//!
//! The channel asks its resolver for the next configuration whenever it
//! needs one and re-asks after each delivery; a configuration owns the LB
//! policy built for the resolved addresses.

use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use url::Url;

use crate::args::ChannelArgs;
use crate::client::load_balancing::LbPolicy;
use crate::exec::{Closure, ExecCtx};

/// What a resolver hands the channel: the LB policy chosen for the resolved
/// addresses (None when resolution produced nothing usable yet).
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub lb_policy: Option<Arc<dyn LbPolicy>>,
}

impl ClientConfig {
    pub fn new(lb_policy: Arc<dyn LbPolicy>) -> Self {
        ClientConfig {
            lb_policy: Some(lb_policy),
        }
    }

    pub fn empty() -> Self {
        ClientConfig::default()
    }
}

/// Shared slot a resolver fills before completing the channel's `next`.
pub type ConfigSlot = Arc<Mutex<Option<ClientConfig>>>;

pub fn new_config_slot() -> ConfigSlot {
    Arc::new(Mutex::new(None))
}

pub trait Resolver: Send + Sync {
    /// Asynchronously delivers the next configuration through `out` and
    /// completes `on_complete`.  Invoked again by the channel after every
    /// delivery.
    fn next(&self, ctx: &mut ExecCtx, out: &ConfigSlot, on_complete: Closure);

    /// Hint that a peer failed; the resolver may re-resolve.
    fn channel_saw_error(&self, ctx: &mut ExecCtx, peer: &str);

    fn shutdown(&self, ctx: &mut ExecCtx);
}

#[derive(Default)]
pub struct ResolverArgs {
    pub channel_args: ChannelArgs,
}

pub trait ResolverBuilder: Send + Sync {
    /// The URI scheme this resolver handles.
    fn scheme(&self) -> &'static str;

    fn build(
        &self,
        target: &Url,
        args: ResolverArgs,
    ) -> Result<Arc<dyn Resolver>, Box<dyn Error + Send + Sync>>;

    /// The default authority for a channel using this resolver and target:
    /// the path portion with its leading slash removed, unless overridden.
    fn default_authority(&self, target: &Url) -> String {
        let path = target.path();
        path.strip_prefix('/').unwrap_or(path).to_string()
    }
}

/// Scheme-keyed registry of resolver builders; the channel does no URI
/// interpretation beyond this dispatch.
pub struct ResolverRegistry {
    builders: RwLock<HashMap<&'static str, Arc<dyn ResolverBuilder>>>,
}

impl ResolverRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ResolverRegistry {
            builders: RwLock::new(HashMap::new()),
        })
    }

    pub fn add_builder(&self, builder: Arc<dyn ResolverBuilder>) {
        self.builders.write().insert(builder.scheme(), builder);
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.read().get(scheme).cloned()
    }
}

struct ManualResolverState {
    queued: VecDeque<ClientConfig>,
    pending: Option<(ConfigSlot, Closure)>,
    errors_seen: usize,
    shut_down: bool,
}

/// A resolver fed by hand: configurations are pushed in and delivered to
/// whichever `next` is outstanding.  Useful for tests and in-process setups
/// where addresses are known a priori.
pub struct ManualResolver {
    state: Mutex<ManualResolverState>,
}

impl ManualResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(ManualResolver {
            state: Mutex::new(ManualResolverState {
                queued: VecDeque::new(),
                pending: None,
                errors_seen: 0,
                shut_down: false,
            }),
        })
    }

    /// Queues a configuration, satisfying an outstanding `next` immediately.
    pub fn push_config(&self, ctx: &mut ExecCtx, config: ClientConfig) {
        let mut state = self.state.lock();
        if let Some((slot, on_complete)) = state.pending.take() {
            *slot.lock() = Some(config);
            ctx.enqueue(on_complete, true);
        } else {
            state.queued.push_back(config);
        }
    }

    pub fn errors_seen(&self) -> usize {
        self.state.lock().errors_seen
    }
}

impl Resolver for ManualResolver {
    fn next(&self, ctx: &mut ExecCtx, out: &ConfigSlot, on_complete: Closure) {
        let mut state = self.state.lock();
        if state.shut_down {
            *out.lock() = None;
            ctx.enqueue(on_complete, false);
            return;
        }
        if let Some(config) = state.queued.pop_front() {
            *out.lock() = Some(config);
            ctx.enqueue(on_complete, true);
            return;
        }
        debug_assert!(state.pending.is_none(), "only one next may be outstanding");
        state.pending = Some((out.clone(), on_complete));
    }

    fn channel_saw_error(&self, _ctx: &mut ExecCtx, _peer: &str) {
        self.state.lock().errors_seen += 1;
    }

    fn shutdown(&self, ctx: &mut ExecCtx) {
        let mut state = self.state.lock();
        state.shut_down = true;
        if let Some((slot, on_complete)) = state.pending.take() {
            *slot.lock() = None;
            ctx.enqueue(on_complete, false);
        }
    }
}

/// Builds [`ManualResolver`]s for `manual:` targets, handing out the same
/// instance so tests can feed the resolver the channel got.
pub struct ManualResolverBuilder {
    resolver: Arc<ManualResolver>,
}

impl ManualResolverBuilder {
    pub fn new(resolver: Arc<ManualResolver>) -> Self {
        ManualResolverBuilder { resolver }
    }
}

impl ResolverBuilder for ManualResolverBuilder {
    fn scheme(&self) -> &'static str {
        "manual"
    }

    fn build(
        &self,
        _target: &Url,
        _args: ResolverArgs,
    ) -> Result<Arc<dyn Resolver>, Box<dyn Error + Send + Sync>> {
        Ok(self.resolver.clone())
    }
}
