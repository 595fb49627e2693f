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

//! Load-balancing dispatch: matching calls to ready subchannels.
//!
//! A policy owns a set of subchannels, watches their connectivity, and
//! answers picks either immediately (with a ready [`Connection`]) or by
//! queueing the pick until one exists.

pub mod pick_first;
pub mod round_robin;

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::client::subchannel::{Connection, Subchannel};
use crate::connectivity::{ConnectivityState, StateCell};
use crate::exec::{Closure, ExecCtx};
use crate::ops::Metadata;
use crate::poll::PollEntity;

/// The out-slot a pick fills with the chosen ready connection.  Identity of
/// the slot (not its contents) is what `cancel_pick` matches on.
#[derive(Clone, Default)]
pub struct PickTarget(Arc<Mutex<Option<Arc<Connection>>>>);

impl PickTarget {
    pub fn new() -> Self {
        PickTarget::default()
    }

    pub fn set(&self, conn: Option<Arc<Connection>>) {
        *self.0.lock() = conn;
    }

    pub fn take(&self) -> Option<Arc<Connection>> {
        self.0.lock().take()
    }

    pub fn get(&self) -> Option<Arc<Connection>> {
        self.0.lock().clone()
    }

    pub fn same_as(&self, other: &PickTarget) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A pick parked inside a policy until a subchannel is ready for it.
pub(crate) struct PendingPick {
    pub(crate) pollent: Option<PollEntity>,
    pub(crate) target: PickTarget,
    pub(crate) on_complete: Closure,
}

/// The pick-subchannel policy contract.
///
/// `pick` either fills `target` with a ready connection and returns true, or
/// parks the pick and returns false; the parked `on_complete` later runs
/// with `success=true` (target filled) or `success=false` (pick failed or
/// policy shut down).
pub trait LbPolicy: Send + Sync {
    fn pick(
        &self,
        ctx: &mut ExecCtx,
        pollent: Option<&PollEntity>,
        initial_metadata: &Metadata,
        target: &PickTarget,
        on_complete: Closure,
    ) -> bool;

    /// Removes a still-pending pick; its closure runs with `success=false`.
    fn cancel_pick(&self, ctx: &mut ExecCtx, target: &PickTarget);

    /// Starts connecting if the policy has not begun picking yet.
    fn exit_idle(&self, ctx: &mut ExecCtx);

    /// Pings an arbitrary currently-ready peer, or fails the closure when
    /// none is ready.
    fn ping_one(&self, ctx: &mut ExecCtx, on_ack: Closure);

    /// Fails all pending picks and unsubscribes subchannel watchers.  The
    /// aggregate state becomes Shutdown.
    fn shutdown(&self, ctx: &mut ExecCtx);

    fn check_connectivity(&self) -> ConnectivityState;

    fn notify_on_state_change(
        &self,
        ctx: &mut ExecCtx,
        observed: &Arc<StateCell>,
        notify: Closure,
    );
}

/// A policy's parsed configuration, opaque to the channel.
pub struct LbConfig {
    config: Box<dyn Any + Send + Sync>,
}

impl LbConfig {
    pub fn new(config: Box<dyn Any + Send + Sync>) -> Self {
        LbConfig { config }
    }

    /// Downcasts to the policy's own configuration type.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.config.downcast_ref::<T>()
    }
}

pub struct LbPolicyArgs {
    pub subchannels: Vec<Arc<Subchannel>>,
}

pub trait LbPolicyBuilder: Send + Sync {
    /// Reports the policy name used in configuration.
    fn name(&self) -> &'static str;

    /// Builds a new policy instance over the given subchannels.  Build must
    /// not fail; optional configuration arrives pre-parsed.
    fn build(&self, args: LbPolicyArgs, config: Option<&LbConfig>) -> Arc<dyn LbPolicy>;

    /// Parses the JSON policy configuration into an internal representation.
    /// Policies without configuration keep the default.
    fn parse_config(
        &self,
        _config: &serde_json::Value,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// Explicit registry of policy builders, passed to whoever constructs
/// client configs (typically resolvers).
pub struct LbPolicyRegistry {
    builders: RwLock<HashMap<&'static str, Arc<dyn LbPolicyBuilder>>>,
}

impl LbPolicyRegistry {
    /// A registry with the stock policies registered.
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(LbPolicyRegistry {
            builders: RwLock::new(HashMap::new()),
        });
        registry.add_builder(Arc::new(pick_first::PickFirstBuilder));
        registry.add_builder(Arc::new(round_robin::RoundRobinBuilder));
        registry
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(LbPolicyRegistry {
            builders: RwLock::new(HashMap::new()),
        })
    }

    pub fn add_builder(&self, builder: Arc<dyn LbPolicyBuilder>) {
        self.builders.write().insert(builder.name(), builder);
    }

    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LbPolicyBuilder>> {
        self.builders.read().get(name).cloned()
    }
}
