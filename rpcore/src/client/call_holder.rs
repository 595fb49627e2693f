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

//! One-shot assignment of a call to its subchannel call.
//!
//! The holder's word is a tagged atomic: 0 means not-yet-created, 1 means
//! cancelled, anything else is a raw `Arc<SubchannelCall>` handle.  Both
//! cancellation and installation move the word with a compare-and-swap from
//! 0, so exactly one of them wins any race; a call constructed after
//! cancellation won is dropped, never used.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::load_balancing::PickTarget;
use crate::client::subchannel::SubchannelCall;
use crate::exec::{Closure, ExecCtx};
use crate::ops::{Metadata, StreamOp};
use crate::poll::PollEntity;

const EMPTY: usize = 0;
const CANCELLED: usize = 1;

/// What the holder's word currently says.
pub enum HolderCall {
    NotCreated,
    Cancelled,
    Call(Arc<SubchannelCall>),
}

/// The callback a holder uses to acquire a subchannel.  `initial_metadata`
/// of `None` cancels an in-flight pick for this holder's target.  Returns
/// whether the target was filled synchronously.
pub trait PickSubchannel: Send + Sync {
    fn pick(
        &self,
        ctx: &mut ExecCtx,
        initial_metadata: Option<&Metadata>,
        target: &PickTarget,
        on_ready: Option<Closure>,
    ) -> bool;
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum CreationPhase {
    NotCreating,
    PickingSubchannel,
}

struct HolderInner {
    waiting_ops: Vec<StreamOp>,
    creation_phase: CreationPhase,
}

pub struct SubchannelCallHolder {
    /// 0 = not created, 1 = cancelled, else a raw Arc<SubchannelCall>.
    call_word: AtomicUsize,
    picker: Arc<dyn PickSubchannel>,
    /// The slot the picker fills with a ready connection.
    target: PickTarget,
    pollent: Option<PollEntity>,
    inner: Mutex<HolderInner>,
    weak_self: Weak<SubchannelCallHolder>,
}

unsafe fn clone_raw_call(word: usize) -> Arc<SubchannelCall> {
    let ptr = word as *const SubchannelCall;
    // The word owns one strong count; add one for the handle we return.
    Arc::increment_strong_count(ptr);
    Arc::from_raw(ptr)
}

impl SubchannelCallHolder {
    pub fn new(picker: Arc<dyn PickSubchannel>, pollent: Option<PollEntity>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| SubchannelCallHolder {
            call_word: AtomicUsize::new(EMPTY),
            picker,
            target: PickTarget::new(),
            pollent,
            inner: Mutex::new(HolderInner {
                waiting_ops: Vec::new(),
                creation_phase: CreationPhase::NotCreating,
            }),
            weak_self: weak_self.clone(),
        })
    }

    pub fn target(&self) -> &PickTarget {
        &self.target
    }

    /// Reads the word without blocking.
    pub fn call(&self) -> HolderCall {
        match self.call_word.load(Ordering::Acquire) {
            EMPTY => HolderCall::NotCreated,
            CANCELLED => HolderCall::Cancelled,
            word => HolderCall::Call(unsafe { clone_raw_call(word) }),
        }
    }

    /// Raises the cancelled flag.  Returns the installed call if another
    /// thread beat us to the word, so the caller can forward the
    /// cancellation there instead.
    pub fn cancel(&self) -> Option<Arc<SubchannelCall>> {
        loop {
            match self.call_word.compare_exchange(
                EMPTY,
                CANCELLED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return None,
                Err(CANCELLED) => return None,
                Err(word) => return Some(unsafe { clone_raw_call(word) }),
            }
        }
    }

    /// Installs a freshly created call.  If cancellation already took the
    /// word, the call is returned to the caller to destroy.
    pub fn install(&self, call: Arc<SubchannelCall>) -> Result<Arc<SubchannelCall>, Arc<SubchannelCall>> {
        let handle = call.clone();
        let raw = Arc::into_raw(call) as usize;
        debug_assert!(raw > CANCELLED);
        match self
            .call_word
            .compare_exchange(EMPTY, raw, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(handle),
            Err(_) => {
                // Cancellation won: reclaim the ref the word would have
                // owned and hand the call back for destruction.
                drop(unsafe { Arc::from_raw(raw as *const SubchannelCall) });
                Err(handle)
            }
        }
    }

    /// Submits one op.  Fast path: forward straight to the installed call
    /// (or fail if cancelled).  Slow path under the lock: cancellations
    /// race the word, send metadata triggers a pick, and everything else
    /// queues until the call exists.
    pub fn perform_op(&self, ctx: &mut ExecCtx, op: StreamOp) {
        match self.call() {
            HolderCall::Cancelled => {
                op.fail(ctx);
                return;
            }
            HolderCall::Call(call) => {
                call.process_op(ctx, op);
                return;
            }
            HolderCall::NotCreated => {}
        }

        let mut inner = self.inner.lock();
        let mut op = op;
        loop {
            // Re-check under the lock: another thread may have moved the
            // word while we waited.
            match self.call() {
                HolderCall::Cancelled => {
                    drop(inner);
                    op.fail(ctx);
                    return;
                }
                HolderCall::Call(call) => {
                    drop(inner);
                    call.process_op(ctx, op);
                    return;
                }
                HolderCall::NotCreated => {}
            }

            if op.cancel_with_status.is_some() {
                if self
                    .call_word
                    .compare_exchange(EMPTY, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    continue;
                }
                match inner.creation_phase {
                    CreationPhase::NotCreating => {
                        Self::fail_waiting_locked(ctx, &mut inner);
                    }
                    CreationPhase::PickingSubchannel => {
                        self.picker.pick(ctx, None, &self.target, None);
                    }
                }
                drop(inner);
                op.fail(ctx);
                return;
            }

            // A send-metadata op while nothing is in flight: ask for a
            // subchannel.
            if inner.creation_phase == CreationPhase::NotCreating
                && self.target.get().is_none()
                && op.initial_metadata().is_some()
            {
                inner.creation_phase = CreationPhase::PickingSubchannel;
                let weak = self.weak_self.clone();
                let on_ready = Closure::new("subchannel_ready", move |ctx, _| {
                    if let Some(holder) = weak.upgrade() {
                        holder.on_subchannel_ready(ctx);
                    }
                });
                let metadata = op
                    .initial_metadata()
                    .cloned()
                    .expect("checked initial metadata");
                if self
                    .picker
                    .pick(ctx, Some(&metadata), &self.target, Some(on_ready))
                {
                    inner.creation_phase = CreationPhase::NotCreating;
                }
            }

            // With a target in hand, create the call and retry.
            if inner.creation_phase == CreationPhase::NotCreating {
                if let Some(conn) = self.target.get() {
                    let call = conn.create_call(ctx, self.pollent.as_ref());
                    match self.install(call) {
                        Ok(call) => Self::drain_waiting_locked(ctx, &mut inner, call),
                        Err(_call) => Self::fail_waiting_locked(ctx, &mut inner),
                    }
                    continue;
                }
            }

            // Nothing to be done but wait.
            inner.waiting_ops.push(op);
            return;
        }
    }

    fn on_subchannel_ready(&self, ctx: &mut ExecCtx) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.creation_phase, CreationPhase::PickingSubchannel);
        inner.creation_phase = CreationPhase::NotCreating;
        match self.target.get() {
            None => {
                // The pick failed outright: this call can never proceed.
                let _ = self.call_word.compare_exchange(
                    EMPTY,
                    CANCELLED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                Self::fail_waiting_locked(ctx, &mut inner);
            }
            Some(conn) => {
                if self.call_word.load(Ordering::Acquire) == CANCELLED {
                    // Cancelled before the subchannel became ready.
                    Self::fail_waiting_locked(ctx, &mut inner);
                    return;
                }
                let call = conn.create_call(ctx, self.pollent.as_ref());
                match self.install(call) {
                    Ok(call) => Self::drain_waiting_locked(ctx, &mut inner, call),
                    Err(_call) => Self::fail_waiting_locked(ctx, &mut inner),
                }
            }
        }
    }

    /// Forwards every queued op, in order, through an enqueued closure so
    /// the holder lock is not held while the transport runs.
    fn drain_waiting_locked(
        ctx: &mut ExecCtx,
        inner: &mut HolderInner,
        call: Arc<SubchannelCall>,
    ) {
        if inner.waiting_ops.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut inner.waiting_ops);
        ctx.enqueue(
            Closure::new("retry_waiting_ops", move |ctx, _| {
                for op in ops {
                    call.process_op(ctx, op);
                }
            }),
            true,
        );
    }

    fn fail_waiting_locked(ctx: &mut ExecCtx, inner: &mut HolderInner) {
        for op in inner.waiting_ops.drain(..) {
            op.fail(ctx);
        }
    }
}

impl Drop for SubchannelCallHolder {
    fn drop(&mut self) {
        let word = *self.call_word.get_mut();
        if word > CANCELLED {
            drop(unsafe { Arc::from_raw(word as *const SubchannelCall) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::subchannel::Connection;
    use crate::client::test_utils::TestTransport;
    use crate::status::Status;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    /// A picker the test completes by hand.
    struct StubPicker {
        state: PlMutex<StubPickerState>,
    }

    #[derive(Default)]
    struct StubPickerState {
        on_ready: Option<Closure>,
        picks: usize,
        cancels: usize,
    }

    impl StubPicker {
        fn new() -> Arc<Self> {
            Arc::new(StubPicker {
                state: PlMutex::new(StubPickerState::default()),
            })
        }

        fn complete(&self, ctx: &mut ExecCtx, target: &PickTarget, conn: Option<Arc<Connection>>) {
            let on_ready = self.state.lock().on_ready.take().expect("pick in flight");
            target.set(conn);
            ctx.enqueue(on_ready, true);
        }
    }

    impl PickSubchannel for StubPicker {
        fn pick(
            &self,
            _ctx: &mut ExecCtx,
            initial_metadata: Option<&Metadata>,
            _target: &PickTarget,
            on_ready: Option<Closure>,
        ) -> bool {
            let mut state = self.state.lock();
            if initial_metadata.is_none() {
                state.cancels += 1;
                state.on_ready = None;
                return false;
            }
            state.picks += 1;
            state.on_ready = on_ready;
            false
        }
    }

    fn connection() -> (Arc<Connection>, Arc<TestTransport>) {
        let transport = TestTransport::new();
        (Connection::new(Vec::new(), transport.clone()), transport)
    }

    fn metadata_op() -> StreamOp {
        let mut md = Metadata::new();
        md.append(":path", "/svc/Method");
        StreamOp::send_initial_metadata(md)
    }

    #[test]
    fn pick_then_install_drains_in_order() {
        let picker = StubPicker::new();
        let holder = SubchannelCallHolder::new(picker.clone(), None);
        let (conn, transport) = connection();
        let mut ctx = ExecCtx::new();

        holder.perform_op(&mut ctx, metadata_op());
        assert_eq!(picker.state.lock().picks, 1);
        // A recv-only op queues while the pick is in flight.
        holder.perform_op(
            &mut ctx,
            StreamOp {
                recv: Some(crate::ops::RecvSink::new()),
                ..Default::default()
            },
        );
        assert_eq!(transport.stream_op_count(), 0);

        picker.complete(&mut ctx, holder.target(), Some(conn));
        ctx.finish();
        // Both buffered ops were forwarded, metadata first.
        let ops = transport.take_stream_ops();
        assert_eq!(ops.len(), 2);
        assert!(ops[0].1.initial_metadata().is_some());
        assert!(ops[1].1.recv.is_some());
        assert!(matches!(holder.call(), HolderCall::Call(_)));
    }

    #[test]
    fn ops_after_install_take_the_fast_path() {
        let picker = StubPicker::new();
        let holder = SubchannelCallHolder::new(picker.clone(), None);
        let (conn, transport) = connection();
        let mut ctx = ExecCtx::new();
        holder.perform_op(&mut ctx, metadata_op());
        picker.complete(&mut ctx, holder.target(), Some(conn));
        ctx.flush();
        transport.take_stream_ops();

        holder.perform_op(&mut ctx, StreamOp::default());
        ctx.finish();
        assert_eq!(transport.stream_op_count(), 1);
    }

    #[test]
    fn cancel_before_pick_completes_fails_everything() {
        let picker = StubPicker::new();
        let holder = SubchannelCallHolder::new(picker.clone(), None);
        let (conn, transport) = connection();
        let mut ctx = ExecCtx::new();

        let failures = Arc::new(StdAtomicUsize::new(0));
        let failures2 = failures.clone();
        let mut op = metadata_op();
        op.on_done_send = Some(Closure::new("send_done", move |_, success| {
            assert!(!success);
            failures2.fetch_add(1, Ordering::SeqCst);
        }));
        holder.perform_op(&mut ctx, op);

        holder.perform_op(&mut ctx, StreamOp::cancel(Status::cancelled()));
        // The in-flight pick was told to cancel.
        assert_eq!(picker.state.lock().cancels, 1);

        // Pick completion arriving later creates nothing.
        holder.target().set(Some(conn));
        holder.on_subchannel_ready(&mut ctx);
        ctx.finish();
        assert!(matches!(holder.call(), HolderCall::Cancelled));
        assert_eq!(transport.stream_op_count(), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_pick_cancels_the_holder() {
        let picker = StubPicker::new();
        let holder = SubchannelCallHolder::new(picker.clone(), None);
        let mut ctx = ExecCtx::new();
        holder.perform_op(&mut ctx, metadata_op());
        picker.complete(&mut ctx, holder.target(), None);
        ctx.finish();
        assert!(matches!(holder.call(), HolderCall::Cancelled));
    }

    #[test]
    fn install_losing_to_cancel_destroys_the_new_call() {
        let picker = StubPicker::new();
        let holder = SubchannelCallHolder::new(picker, None);
        let (conn, _transport) = connection();
        let mut ctx = ExecCtx::new();
        assert!(holder.cancel().is_none());
        let call = conn.create_call(&mut ctx, None);
        match holder.install(call.clone()) {
            Ok(_) => panic!("install should lose to cancellation"),
            Err(returned) => assert!(Arc::ptr_eq(&returned, &call)),
        }
        // Only the test's handles remain; the word owns nothing.
        assert!(matches!(holder.call(), HolderCall::Cancelled));
        ctx.finish();
    }

    // Concurrent cancellation and pick-completion: exactly one of the two
    // effects is observable, and nothing is forwarded after a cancel wins.
    #[test]
    fn concurrent_cancel_and_ready_have_exactly_one_effect() {
        for _ in 0..100 {
            let picker = StubPicker::new();
            let holder = SubchannelCallHolder::new(picker.clone(), None);
            let (conn, transport) = connection();
            let mut ctx = ExecCtx::new();
            holder.perform_op(&mut ctx, metadata_op());
            ctx.flush();
            let on_ready = picker.state.lock().on_ready.take().unwrap();
            holder.target().set(Some(conn));

            let holder2 = holder.clone();
            let canceller = std::thread::spawn(move || {
                let mut ctx = ExecCtx::new();
                holder2.perform_op(&mut ctx, StreamOp::cancel(Status::cancelled()));
                ctx.finish();
            });
            let readier = std::thread::spawn(move || {
                let mut ctx = ExecCtx::new();
                on_ready.run(&mut ctx, true);
                ctx.finish();
            });
            canceller.join().unwrap();
            readier.join().unwrap();

            let mut ctx = ExecCtx::new();
            match holder.call() {
                HolderCall::Cancelled => {
                    // Cancel won: the buffered metadata op must not have
                    // reached the transport.
                    assert_eq!(transport.stream_op_count(), 0);
                }
                HolderCall::Call(call) => {
                    // Install won: the buffered op was forwarded, and the
                    // racing cancellation went to the call itself.
                    let ops = transport.take_stream_ops();
                    assert!(!ops.is_empty());
                    assert!(ops[0].1.initial_metadata().is_some());
                    drop(call);
                }
                HolderCall::NotCreated => panic!("holder never resolved"),
            }
            ctx.finish();
        }
    }
}
