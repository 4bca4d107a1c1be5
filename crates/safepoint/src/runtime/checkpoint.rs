//! Checkpoints: closures run once per thread at its next safe point.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    error::{Result, SafepointError},
    runtime::{
        fatal,
        threads::{
            sort_dumps, ManagedThread, ScopedThreadStateChange, SuspendReason, ThreadDump,
            ThreadFlags, ThreadId, ThreadList, ThreadRef, ThreadState,
        },
    },
    sync::Monitor,
};

/// Work handed to a thread. `thread` is the thread the work is for, which is
/// not necessarily the thread executing it.
pub trait Closure: Send + Sync {
    fn run(&self, thread: &ManagedThread);
}

impl<F> Closure for F
where
    F: Fn(&ManagedThread) + Send + Sync,
{
    fn run(&self, thread: &ManagedThread) {
        self(thread)
    }
}

/// Notified around the stop-the-world part of a thread flip.
pub trait PauseListener: Send + Sync {
    fn start_pause(&self);
    fn end_pause(&self);
}

/// A counting barrier. Threads [`pass`](Self::pass) it; a waiter adds the
/// number of passes it expects with [`increment`](Self::increment) and blocks
/// until the count is back to zero. The count may go negative in between.
///
/// Each [`init`](Self::init) starts a new generation. Passes tagged with an
/// older generation are dropped.
pub struct Barrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

struct BarrierState {
    count: i32,
    generation: u64,
}

impl Barrier {
    pub fn new(count: i32) -> Self {
        Self {
            state: Mutex::new(BarrierState { count, generation: 1 }),
            cond: Condvar::new(),
        }
    }

    /// Reset the count and return the new generation.
    pub fn init(&self, count: i32) -> u64 {
        let mut state = self.state.lock();
        state.count = count;
        state.generation += 1;
        state.generation
    }

    pub fn count(&self) -> i32 {
        self.state.lock().count
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn pass(&self) {
        let mut state = self.state.lock();
        self.pass_locked(&mut state);
    }

    /// Pass on behalf of round `generation`. Returns false, without touching
    /// the count, if that round is over.
    pub fn pass_generation(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        self.pass_locked(&mut state);
        true
    }

    fn pass_locked(&self, state: &mut BarrierState) {
        state.count -= 1;
        if state.count == 0 {
            self.cond.notify_all();
        }
    }

    /// Add `delta` and wait for the count to reach zero. Returns true if the
    /// wait timed out.
    pub fn increment(&self, delta: i32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.count += delta;
        while state.count != 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return state.count != 0;
            }
        }
        false
    }
}

struct BarrierClosure {
    inner: Arc<dyn Closure>,
    barrier: Arc<Barrier>,
}

impl Closure for BarrierClosure {
    fn run(&self, thread: &ManagedThread) {
        self.inner.run(thread);
        self.barrier.pass();
    }
}

/// A condition threads block on, in the Runnable state, while weak reference
/// access is disabled.
///
/// A parked thread would never notice an empty checkpoint request, so
/// [`ThreadList::run_empty_checkpoint`] broadcasts every registered gate and
/// waiters re-check the request each time they wake.
pub struct WeakRefAccessGate {
    enabled: Monitor<bool>,
    waiters: AtomicUsize,
    broadcasts: AtomicUsize,
    responses: AtomicUsize,
}

impl WeakRefAccessGate {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self {
            enabled: Monitor::new(enabled),
            waiters: AtomicUsize::new(0),
            broadcasts: AtomicUsize::new(0),
            responses: AtomicUsize::new(0),
        })
    }

    pub fn enable(&self) {
        let mut enabled = self.enabled.lock_no_handshake();
        *enabled = true;
        enabled.notify_all();
    }

    pub fn disable(&self) {
        *self.enabled.lock_no_handshake() = false;
    }

    /// Block `thread` until access is enabled. The thread stays Runnable.
    pub fn wait_for_access(&self, thread: &ManagedThread) {
        let mut enabled = self.enabled.lock_no_handshake();
        self.waiters.fetch_add(1, Ordering::AcqRel);
        while !*enabled {
            if thread.check_empty_checkpoint_from_weak_ref_access() {
                self.responses.fetch_add(1, Ordering::AcqRel);
            }
            enabled.wait_no_handshake();
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn broadcast_for_checkpoint(&self) {
        let enabled = self.enabled.lock_no_handshake();
        self.broadcasts.fetch_add(1, Ordering::AcqRel);
        enabled.notify_all();
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    pub fn broadcasts(&self) -> usize {
        self.broadcasts.load(Ordering::Acquire)
    }

    /// Empty checkpoints answered by threads parked here.
    pub fn responses(&self) -> usize {
        self.responses.load(Ordering::Acquire)
    }
}

impl ThreadList {
    pub fn add_weak_ref_gate(&self, gate: Arc<WeakRefAccessGate>) {
        self.weak_ref_gates.lock().push(gate);
    }

    pub fn remove_weak_ref_gate(&self, gate: &Arc<WeakRefAccessGate>) {
        self.weak_ref_gates
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, gate));
    }

    fn broadcast_weak_ref_gates(&self) {
        for gate in self.weak_ref_gates.lock().iter() {
            gate.broadcast_for_checkpoint();
        }
    }

    /// Run `checkpoint` once for every registered thread. Runnable threads run
    /// it themselves at their next safe point; for suspended ones it runs on
    /// the caller while they are held suspended. `callback` runs on the caller
    /// while the thread list is still locked.
    ///
    /// Returns the number of threads other than the caller that were targeted.
    /// Does not wait for the threads that run the checkpoint themselves; see
    /// [`run_checkpoint_and_wait`](Self::run_checkpoint_and_wait).
    pub fn run_checkpoint(
        &self,
        checkpoint: Arc<dyn Closure>,
        callback: Option<&dyn Fn()>,
    ) -> usize {
        let this = self.current();
        let mut count = 0;
        let mut run_on_behalf = Vec::new();

        {
            let list = self.list.lock();
            let mut counts = self.locks.lock_suspend_counts();
            for thread in list.iter() {
                if this.as_ref().is_some_and(|this| Arc::ptr_eq(this, thread)) {
                    continue;
                }

                let mut requested_suspend = false;
                loop {
                    if thread.request_checkpoint(&counts, checkpoint.clone()) {
                        if requested_suspend {
                            thread.decrement_suspend_count(&mut counts, SuspendReason::Internal);
                            self.locks.resume_cond.notify_all();
                            requested_suspend = false;
                        }
                        break;
                    }

                    if !requested_suspend {
                        thread.increment_suspend_count(&mut counts, None, SuspendReason::Internal);
                        requested_suspend = true;
                    }

                    if thread.is_suspended() {
                        break;
                    }
                }

                if requested_suspend {
                    run_on_behalf.push(thread.clone());
                }
                count += 1;
            }

            if let Some(callback) = callback {
                callback();
            }
        }

        if let Some(this) = this.as_deref() {
            checkpoint.run(this);
        }

        for thread in run_on_behalf {
            let helper = this.as_deref().unwrap_or(&thread);
            thread.ensure_flip_function_started(helper);
            thread.wait_for_flip_function();
            checkpoint.run(&thread);

            let mut counts = self.locks.lock_suspend_counts();
            thread.decrement_suspend_count(&mut counts, SuspendReason::Internal);
            self.locks.resume_cond.notify_all();
        }

        log::trace!(target: "threads", "checkpoint targeted {} threads", count);
        count
    }

    /// [`run_checkpoint`](Self::run_checkpoint), then wait until the checkpoint
    /// completed on every targeted thread.
    pub fn try_run_checkpoint_and_wait(&self, checkpoint: Arc<dyn Closure>) -> Result<usize> {
        let started = Instant::now();
        let barrier = Arc::new(Barrier::new(0));
        let closure: Arc<dyn Closure> = Arc::new(BarrierClosure {
            inner: checkpoint,
            barrier: barrier.clone(),
        });

        let count = self.run_checkpoint(closure, None);
        let this = self.current();
        let expected = count + usize::from(this.is_some());

        let _change = this
            .as_deref()
            .map(|this| ScopedThreadStateChange::new(this, ThreadState::WaitingForCheckpointsToRun));
        if barrier.increment(expected as i32, self.options.suspend_timeout) {
            return Err(SafepointError::BarrierTimeout {
                cause: "checkpoint",
                waited: started.elapsed(),
                unsuspended: Vec::new(),
            });
        }
        Ok(count)
    }

    pub fn run_checkpoint_and_wait(&self, checkpoint: Arc<dyn Closure>) -> usize {
        match self.try_run_checkpoint_and_wait(checkpoint) {
            Ok(count) => count,
            Err(err) => fatal(&err, self),
        }
    }

    /// Wait until every Runnable thread passed a safe point at least once.
    pub fn try_run_empty_checkpoint(&self) -> Result<()> {
        let this = self.current();
        assert!(
            !self.locks.mutator.is_exclusive_held(),
            "empty checkpoint requested while the world is stopped"
        );

        let _serial = self.empty_checkpoint_lock.lock();
        let barrier = &self.locks.empty_checkpoint_barrier;

        let mut count = 0;
        let mut requested: Vec<ThreadRef> = Vec::new();
        {
            let list = self.list.lock();
            let _counts = self.locks.lock_suspend_counts();
            // Late passes from a round that timed out carry its generation
            // and are dropped.
            let generation = barrier.init(0);
            for thread in list.iter() {
                if this.as_ref().is_some_and(|this| Arc::ptr_eq(this, thread)) {
                    continue;
                }
                loop {
                    if thread.request_empty_checkpoint(generation) {
                        count += 1;
                        requested.push(thread.clone());
                        break;
                    }
                    if !thread.state().is_runnable() {
                        break;
                    }
                }
            }
        }

        self.broadcast_weak_ref_gates();

        let _change = this
            .as_deref()
            .map(|this| ScopedThreadStateChange::new(this, ThreadState::WaitingForCheckpointsToRun));

        let period = self.options.empty_checkpoint_period;
        let mut waited = Duration::ZERO;
        let mut first = true;
        loop {
            let delta = if first { count } else { 0 };
            first = false;
            if !barrier.increment(delta, period) {
                return Ok(());
            }

            waited += period;
            if waited >= self.options.empty_checkpoint_timeout {
                let unresponsive = if cfg!(debug_assertions) {
                    requested
                        .iter()
                        .filter(|thread| {
                            thread
                                .flags()
                                .contains(ThreadFlags::EMPTY_CHECKPOINT_REQUEST)
                        })
                        .map(|thread| thread.id())
                        .collect()
                } else {
                    Vec::new()
                };
                return Err(SafepointError::EmptyCheckpointTimeout {
                    waited,
                    unresponsive,
                });
            }

            log::debug!(
                target: "threads",
                "empty checkpoint still waiting after {:?}, waking weak reference waiters again",
                waited
            );
            self.broadcast_weak_ref_gates();
        }
    }

    pub fn run_empty_checkpoint(&self) {
        if let Err(err) = self.try_run_empty_checkpoint() {
            fatal(&err, self);
        }
    }

    /// Stop the world, run `flip_callback` with exclusive access, hand every
    /// thread `flip_visitor` as its flip function and resume.
    ///
    /// Threads that were only stopped on their way to Runnable are resumed
    /// right away and run the flip function themselves. For the rest it runs
    /// here, before they are released. Either way it runs exactly once per
    /// thread. Returns the number of threads other than the caller.
    pub fn try_flip_thread_roots(
        &self,
        flip_visitor: Arc<dyn Closure>,
        flip_callback: impl FnOnce(),
        pause_listener: Option<&dyn PauseListener>,
    ) -> Result<usize> {
        let started = Instant::now();
        let this = self.suspend_all_internal("thread flip")?;
        if let Some(listener) = pause_listener {
            listener.start_pause();
        }

        flip_callback();
        unsafe {
            self.locks.mutator.exclusive_unlock();
        }
        log::debug!(target: "threads", "thread flip pause took {:?}", started.elapsed());
        if let Some(listener) = pause_listener {
            listener.end_pause();
        }

        let mut resumed_early = 0;
        let mut others = Vec::new();
        {
            let list = self.list.lock();
            let mut counts = self.locks.lock_suspend_counts();
            counts.suspend_all_count -= 1;
            for thread in list.iter() {
                thread.set_flip_function(&counts, flip_visitor.clone());
                if this.as_ref().is_some_and(|this| Arc::ptr_eq(this, thread)) {
                    continue;
                }

                let waiting = thread.state() == ThreadState::WaitingForGcThreadFlip
                    || thread.is_transitioning_to_runnable();
                if waiting && thread.suspend_count() == 1 {
                    thread.decrement_suspend_count(&mut counts, SuspendReason::Internal);
                    resumed_early += 1;
                } else {
                    others.push(thread.clone());
                }
            }
            self.locks.resume_cond.notify_all();
        }

        {
            let _shared = self.locks.mutator.read();
            for thread in &others {
                let helper = this.as_deref().unwrap_or(thread);
                thread.ensure_flip_function_started(helper);
            }
            if let Some(this) = this.as_deref() {
                this.ensure_flip_function_started(this);
            }
        }

        {
            let mut counts = self.locks.lock_suspend_counts();
            for thread in &others {
                thread.decrement_suspend_count(&mut counts, SuspendReason::Internal);
            }
            self.locks.resume_cond.notify_all();
        }

        Ok(resumed_early + others.len())
    }

    pub fn flip_thread_roots(
        &self,
        flip_visitor: Arc<dyn Closure>,
        flip_callback: impl FnOnce(),
        pause_listener: Option<&dyn PauseListener>,
    ) -> usize {
        match self.try_flip_thread_roots(flip_visitor, flip_callback, pause_listener) {
            Ok(count) => count,
            Err(err) => fatal(&err, self),
        }
    }

    /// Like [`dump`](Self::dump), but every thread describes itself at a safe
    /// point, so stacks are consistent.
    pub fn dump_via_checkpoint(&self) -> String {
        let dumps = Arc::new(Mutex::new(Vec::<ThreadDump>::new()));
        let sink = dumps.clone();
        self.run_checkpoint_and_wait(Arc::new(move |thread: &ManagedThread| {
            sink.lock().push(thread.dump());
        }));

        let mut dumps = std::mem::take(&mut *dumps.lock());
        let caller: Option<ThreadId> = self.current().map(|thread| thread.id());
        sort_dumps(&mut dumps, caller);
        dumps.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n")
    }
}
