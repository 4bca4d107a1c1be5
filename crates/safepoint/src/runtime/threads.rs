//! Thread records and the thread registry.
//!
//! A [`ManagedThread`] is the runtime's view of one OS thread that runs
//! managed code. Its coarse state and its request flags live in a single
//! atomic word so that "am I asked to stop?" and "I am leaving the Runnable
//! state" are decided by one compare-and-swap; everything else about
//! suspension is guarded by the suspend-count lock in [`Locks`].

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    error::{Result, SafepointError},
    runtime::{
        checkpoint::{Barrier, Closure},
        options::SafepointOptions,
        stack::ManagedStack,
        suspend::{SuspendBarrier, SuspendHistogram},
    },
    sync::MutatorLock,
};

/// Stable numeric thread id. Ids start at 1 and are reused only after the
/// owning thread has fully deregistered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    pub const INVALID: ThreadId = ThreadId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code; holds the mutator lock shared.
    Runnable = 0,
    /// Running native code, not touching managed state.
    Native,
    /// Parked at a safepoint because of a suspend request.
    Suspended,
    /// Blocked on a monitor.
    Blocked,
    /// Waiting on a condition.
    Waiting,
    /// Blocked waiting for a garbage collection to finish.
    BlockedOnGc,
    /// Waiting for checkpoints it requested to run.
    WaitingForCheckpointsToRun,
    /// Waiting for the flip function of another thread to finish.
    WaitingForGcThreadFlip,
    Terminated,
}

impl ThreadState {
    pub fn is_runnable(self) -> bool {
        self == ThreadState::Runnable
    }
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Runnable,
            1 => Self::Native,
            2 => Self::Suspended,
            3 => Self::Blocked,
            4 => Self::Waiting,
            5 => Self::BlockedOnGc,
            6 => Self::WaitingForCheckpointsToRun,
            7 => Self::WaitingForGcThreadFlip,
            _ => Self::Terminated,
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

bitflags! {
    /// Requests pending on a thread, packed next to its state.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Suspend count is nonzero.
        const SUSPEND_REQUEST = 1 << 0;
        /// A checkpoint closure is queued for this thread.
        const CHECKPOINT_REQUEST = 1 << 1;
        /// Pass the empty checkpoint barrier at the next safepoint.
        const EMPTY_CHECKPOINT_REQUEST = 1 << 2;
        /// At least one suspend barrier is waiting for this thread.
        const ACTIVE_SUSPEND_BARRIER = 1 << 3;
        /// A flip function is installed and nobody started it yet.
        const PENDING_FLIP_FUNCTION = 1 << 4;
        /// Some thread is running this thread's flip function.
        const RUNNING_FLIP_FUNCTION = 1 << 5;
    }
}

const STATE_SHIFT: u32 = 24;
const FLAGS_MASK: u32 = (1 << STATE_SHIFT) - 1;

/// A snapshot of state and flags as stored in one atomic word.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StateAndFlags(u32);

impl StateAndFlags {
    pub fn new(state: ThreadState, flags: ThreadFlags) -> Self {
        Self(((state as u32) << STATE_SHIFT) | flags.bits())
    }

    pub fn state(self) -> ThreadState {
        ThreadState::from((self.0 >> STATE_SHIFT) as u8)
    }

    pub fn flags(self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    pub fn with_state(self, state: ThreadState) -> Self {
        Self((self.0 & FLAGS_MASK) | ((state as u32) << STATE_SHIFT))
    }

    pub fn with_flags(self, flags: ThreadFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    pub fn without_flags(self, flags: ThreadFlags) -> Self {
        Self(self.0 & !flags.bits())
    }
}

impl fmt::Debug for StateAndFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateAndFlags")
            .field("state", &self.state())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Why a thread's suspend count is raised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendReason {
    /// The runtime itself (GC, instrumentation, checkpoints).
    Internal,
    /// A debugger or agent asked for the thread to stop.
    ForUserCode,
}

/// Data guarded by the suspend-count lock.
///
/// A `&mut SuspendCounts` is also the proof a caller holds that lock when it
/// touches another thread's suspend count.
#[derive(Debug, Default)]
pub struct SuspendCounts {
    pub(crate) suspend_all_count: u32,
}

impl SuspendCounts {
    pub fn suspend_all_count(&self) -> u32 {
        self.suspend_all_count
    }
}

/// Locks shared by the registry and every thread record of one runtime.
///
/// Lock order: thread-list lock, then `thread_suspend_count`, then any
/// per-thread lock. The mutator lock is only taken exclusively inside
/// suspend-all.
pub struct Locks {
    pub(crate) thread_suspend_count: Mutex<SuspendCounts>,
    /// Broadcast whenever a suspend count drops or a flip function finishes.
    pub(crate) resume_cond: Condvar,
    pub mutator: MutatorLock,
    pub(crate) empty_checkpoint_barrier: Barrier,
}

impl Locks {
    pub fn new() -> Self {
        Self {
            thread_suspend_count: Mutex::new(SuspendCounts::default()),
            resume_cond: Condvar::new(),
            mutator: MutatorLock::new(),
            empty_checkpoint_barrier: Barrier::new(0),
        }
    }

    pub fn lock_suspend_counts(&self) -> MutexGuard<'_, SuspendCounts> {
        self.thread_suspend_count.lock()
    }
}

impl Default for Locks {
    fn default() -> Self {
        Self::new()
    }
}

/// Barriers a thread must pass when it next leaves the Runnable state.
#[derive(Default)]
pub(crate) struct ActiveSuspendBarriers {
    suspend_all: Option<Arc<SuspendBarrier>>,
    suspend1: Vec<Arc<SuspendBarrier>>,
}

impl ActiveSuspendBarriers {
    fn is_empty(&self) -> bool {
        self.suspend_all.is_none() && self.suspend1.is_empty()
    }

    fn remove(&mut self, barrier: &Arc<SuspendBarrier>) {
        if self
            .suspend_all
            .as_ref()
            .is_some_and(|installed| Arc::ptr_eq(installed, barrier))
        {
            self.suspend_all = None;
        }
        self.suspend1.retain(|installed| !Arc::ptr_eq(installed, barrier));
    }

    fn drain(&mut self) -> impl Iterator<Item = Arc<SuspendBarrier>> {
        let suspend_all = self.suspend_all.take();
        let suspend1 = std::mem::take(&mut self.suspend1);
        suspend_all.into_iter().chain(suspend1)
    }
}

/// Which barrier slot a suspend request registers into.
pub(crate) enum BarrierRequest {
    SuspendAll(Arc<SuspendBarrier>),
    Single(Arc<SuspendBarrier>),
}

/// An opaque reference to a managed exception object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExceptionRef(pub usize);

pub type ThreadRef = Arc<ManagedThread>;

pub struct ManagedThread {
    id: ThreadId,
    name: String,
    daemon: bool,
    context_id: usize,
    os_tid: i64,
    state_and_flags: AtomicU32,
    /// Written only under the suspend-count lock.
    suspend_count: AtomicU32,
    user_code_suspend_count: AtomicU32,
    barriers: Mutex<ActiveSuspendBarriers>,
    checkpoints: Mutex<VecDeque<Arc<dyn Closure>>>,
    flip_function: Mutex<Option<Arc<dyn Closure>>>,
    transitioning_to_runnable: AtomicBool,
    force_interpreter_count: AtomicU32,
    deopt_check_required: AtomicBool,
    /// Round of the outstanding empty checkpoint request, 0 if none.
    empty_checkpoint_generation: AtomicU64,
    exception: Mutex<Option<ExceptionRef>>,
    stack: ManagedStack,
    locks: Arc<Locks>,
}

impl fmt::Debug for ManagedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedThread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state_and_flags", &self.state_and_flags())
            .field("suspend_count", &self.suspend_count())
            .finish()
    }
}

impl ManagedThread {
    fn new(id: ThreadId, name: &str, daemon: bool, context_id: usize, locks: Arc<Locks>) -> Self {
        Self {
            id,
            name: name.to_owned(),
            daemon,
            context_id,
            os_tid: current_os_tid(),
            state_and_flags: AtomicU32::new(
                StateAndFlags::new(ThreadState::Native, ThreadFlags::empty()).0,
            ),
            suspend_count: AtomicU32::new(0),
            user_code_suspend_count: AtomicU32::new(0),
            barriers: Mutex::new(ActiveSuspendBarriers::default()),
            checkpoints: Mutex::new(VecDeque::new()),
            flip_function: Mutex::new(None),
            transitioning_to_runnable: AtomicBool::new(false),
            force_interpreter_count: AtomicU32::new(0),
            deopt_check_required: AtomicBool::new(false),
            empty_checkpoint_generation: AtomicU64::new(0),
            exception: Mutex::new(None),
            stack: ManagedStack::new(),
            locks,
        }
    }

    /// The thread record attached to the calling OS thread, if any.
    pub fn current() -> Option<ThreadRef> {
        CURRENT.with_borrow(|current| current.clone())
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    pub fn os_tid(&self) -> i64 {
        self.os_tid
    }

    pub(crate) fn context_id(&self) -> usize {
        self.context_id
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub fn stack(&self) -> &ManagedStack {
        &self.stack
    }

    pub fn state_and_flags(&self) -> StateAndFlags {
        StateAndFlags(self.state_and_flags.load(Ordering::Acquire))
    }

    pub fn state(&self) -> ThreadState {
        self.state_and_flags().state()
    }

    pub fn flags(&self) -> ThreadFlags {
        self.state_and_flags().flags()
    }

    /// A thread is suspended as far as the protocol is concerned whenever it
    /// is not Runnable: it cannot touch managed state without first going
    /// through [`transition_from_suspended_to_runnable`](Self::transition_from_suspended_to_runnable).
    pub fn is_suspended(&self) -> bool {
        !self.state().is_runnable()
    }

    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    pub fn user_code_suspend_count(&self) -> u32 {
        self.user_code_suspend_count.load(Ordering::Acquire)
    }

    pub fn is_transitioning_to_runnable(&self) -> bool {
        self.transitioning_to_runnable.load(Ordering::Acquire)
    }

    pub fn has_flip_function(&self) -> bool {
        self.flags()
            .intersects(ThreadFlags::PENDING_FLIP_FUNCTION | ThreadFlags::RUNNING_FLIP_FUNCTION)
    }

    pub fn is_force_interpreter(&self) -> bool {
        self.force_interpreter_count() != 0
    }

    pub fn force_interpreter_count(&self) -> u32 {
        self.force_interpreter_count.load(Ordering::Acquire)
    }

    pub fn increment_force_interpreter_count(&self) -> u32 {
        self.force_interpreter_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decrement_force_interpreter_count(&self) -> u32 {
        let previous = self.force_interpreter_count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "force interpreter count underflow on thread {}", self.id);
        previous - 1
    }

    /// Set once a frame of this thread carries a redefinition deopt bit.
    pub fn is_deopt_check_required(&self) -> bool {
        self.deopt_check_required.load(Ordering::Acquire)
    }

    pub fn set_deopt_check_required(&self, value: bool) {
        self.deopt_check_required.store(value, Ordering::Release);
    }

    pub fn exception(&self) -> Option<ExceptionRef> {
        *self.exception.lock()
    }

    pub fn is_exception_pending(&self) -> bool {
        self.exception.lock().is_some()
    }

    pub fn set_exception(&self, exception: ExceptionRef) {
        *self.exception.lock() = Some(exception);
    }

    pub fn clear_exception(&self) -> Option<ExceptionRef> {
        self.exception.lock().take()
    }

    fn atomic_set_flags(&self, flags: ThreadFlags) -> StateAndFlags {
        StateAndFlags(self.state_and_flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    fn atomic_clear_flags(&self, flags: ThreadFlags) -> StateAndFlags {
        StateAndFlags(
            self.state_and_flags
                .fetch_and(!flags.bits(), Ordering::AcqRel),
        )
    }

    fn cas_state_and_flags(&self, old: StateAndFlags, new: StateAndFlags) -> bool {
        self.state_and_flags
            .compare_exchange(old.0, new.0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Raise the suspend count by one, optionally registering `barrier` as a
    /// barrier this thread must pass once it is suspended.
    ///
    /// If the thread is already suspended the barrier is passed on its behalf
    /// right away.
    pub(crate) fn increment_suspend_count(
        &self,
        _counts: &mut SuspendCounts,
        barrier: Option<BarrierRequest>,
        reason: SuspendReason,
    ) {
        let count = self.suspend_count.load(Ordering::Relaxed) + 1;
        self.suspend_count.store(count, Ordering::Release);
        if reason == SuspendReason::ForUserCode {
            self.user_code_suspend_count.fetch_add(1, Ordering::AcqRel);
        }

        let Some(barrier) = barrier else {
            self.atomic_set_flags(ThreadFlags::SUSPEND_REQUEST);
            return;
        };

        let barrier = {
            let mut barriers = self.barriers.lock();
            match barrier {
                BarrierRequest::SuspendAll(barrier) => {
                    assert!(
                        barriers.suspend_all.is_none(),
                        "thread {} already has a suspend-all barrier installed",
                        self.id
                    );
                    barriers.suspend_all = Some(barrier.clone());
                    barrier
                }
                BarrierRequest::Single(barrier) => {
                    barriers.suspend1.push(barrier.clone());
                    barrier
                }
            }
        };

        let old = self
            .atomic_set_flags(ThreadFlags::SUSPEND_REQUEST | ThreadFlags::ACTIVE_SUSPEND_BARRIER);

        if !old.state().is_runnable() {
            // Already out of managed code and unable to re-enter it.
            let mut barriers = self.barriers.lock();
            barriers.remove(&barrier);
            if barriers.is_empty() {
                self.atomic_clear_flags(ThreadFlags::ACTIVE_SUSPEND_BARRIER);
            }
            drop(barriers);
            barrier.pass();
        }
    }

    pub(crate) fn decrement_suspend_count(&self, _counts: &mut SuspendCounts, reason: SuspendReason) {
        let count = self.suspend_count.load(Ordering::Relaxed);
        assert!(count > 0, "suspend count of thread {} would become negative", self.id);

        if reason == SuspendReason::ForUserCode {
            let previous = self.user_code_suspend_count.fetch_sub(1, Ordering::AcqRel);
            assert!(
                previous > 0,
                "user code suspend count of thread {} would become negative",
                self.id
            );
        }

        self.suspend_count.store(count - 1, Ordering::Release);
        if count == 1 {
            self.atomic_clear_flags(ThreadFlags::SUSPEND_REQUEST);
        }
    }

    /// Withdraw a barrier that timed out before this thread passed it.
    pub(crate) fn remove_suspend_barrier(
        &self,
        _counts: &mut SuspendCounts,
        barrier: &Arc<SuspendBarrier>,
    ) {
        let mut barriers = self.barriers.lock();
        barriers.remove(barrier);
        if barriers.is_empty() {
            self.atomic_clear_flags(ThreadFlags::ACTIVE_SUSPEND_BARRIER);
        }
    }

    pub(crate) fn pass_active_suspend_barriers(&self) {
        let barriers: Vec<_> = {
            let _counts = self.locks.lock_suspend_counts();
            let mut barriers = self.barriers.lock();
            self.atomic_clear_flags(ThreadFlags::ACTIVE_SUSPEND_BARRIER);
            barriers.drain().collect()
        };

        for barrier in barriers {
            barrier.pass();
        }
    }

    /// Queue `checkpoint` to run on this thread at its next safepoint. Fails
    /// if the thread is not Runnable, in which case the caller has to run the
    /// checkpoint on its behalf.
    pub(crate) fn request_checkpoint(
        &self,
        _counts: &SuspendCounts,
        checkpoint: Arc<dyn Closure>,
    ) -> bool {
        let old = self.state_and_flags();
        if !old.state().is_runnable() {
            return false;
        }

        if !self.cas_state_and_flags(old, old.with_flags(ThreadFlags::CHECKPOINT_REQUEST)) {
            return false;
        }

        self.checkpoints.lock().push_back(checkpoint);
        true
    }

    pub(crate) fn request_empty_checkpoint(&self, generation: u64) -> bool {
        let old = self.state_and_flags();
        if !old.state().is_runnable() {
            return false;
        }

        self.empty_checkpoint_generation.store(generation, Ordering::Release);
        self.cas_state_and_flags(old, old.with_flags(ThreadFlags::EMPTY_CHECKPOINT_REQUEST))
    }

    fn run_checkpoint_function(&self) {
        let checkpoint = {
            let _counts = self.locks.lock_suspend_counts();
            let mut queue = self.checkpoints.lock();
            let checkpoint = queue.pop_front();
            if queue.is_empty() {
                self.atomic_clear_flags(ThreadFlags::CHECKPOINT_REQUEST);
            }
            checkpoint
        };

        if let Some(checkpoint) = checkpoint {
            log::trace!(target: "threads", "thread {} running checkpoint", self.id);
            checkpoint.run(self);
        }
    }

    fn run_empty_checkpoint(&self) {
        self.atomic_clear_flags(ThreadFlags::EMPTY_CHECKPOINT_REQUEST);
        // Taken after the flag is cleared, so a request that lands in between
        // is answered now and its flag is a no-op later.
        let generation = self.empty_checkpoint_generation.swap(0, Ordering::AcqRel);
        if generation != 0 && !self.locks.empty_checkpoint_barrier.pass_generation(generation) {
            log::trace!(
                target: "threads",
                "thread {} dropped a pass for empty checkpoint round {}",
                self.id,
                generation
            );
        }
    }

    /// Respond to an empty checkpoint while blocked for weak reference access.
    /// Such threads stay Runnable and would otherwise never see the request.
    pub fn check_empty_checkpoint_from_weak_ref_access(&self) -> bool {
        if self
            .flags()
            .contains(ThreadFlags::EMPTY_CHECKPOINT_REQUEST)
        {
            self.run_empty_checkpoint();
            true
        } else {
            false
        }
    }

    pub(crate) fn set_flip_function(&self, _counts: &SuspendCounts, function: Arc<dyn Closure>) {
        *self.flip_function.lock() = Some(function);
        self.atomic_set_flags(ThreadFlags::PENDING_FLIP_FUNCTION);
    }

    /// Run this thread's pending flip function unless some thread already
    /// started it. `source` is the thread doing the work. Returns whether this
    /// call ran it.
    pub fn ensure_flip_function_started(&self, source: &ManagedThread) -> bool {
        loop {
            let old = self.state_and_flags();
            if !old.flags().contains(ThreadFlags::PENDING_FLIP_FUNCTION) {
                return false;
            }

            let new = old
                .without_flags(ThreadFlags::PENDING_FLIP_FUNCTION)
                .with_flags(ThreadFlags::RUNNING_FLIP_FUNCTION);
            if self.cas_state_and_flags(old, new) {
                break;
            }
        }

        let function = self.flip_function.lock().take();
        if let Some(function) = function {
            log::trace!(
                target: "threads",
                "thread {} running flip function of thread {}",
                source.id,
                self.id
            );
            function.run(self);
        }

        let _counts = self.locks.lock_suspend_counts();
        self.atomic_clear_flags(ThreadFlags::RUNNING_FLIP_FUNCTION);
        self.locks.resume_cond.notify_all();
        true
    }

    /// Run `wait` in the `BlockedOnGc` state. Collectors use this for mutators
    /// that wait for a collection, so a suspend-all does not wait for them.
    pub fn block_on_gc<R>(&self, wait: impl FnOnce() -> R) -> R {
        let _change = ScopedThreadStateChange::new(self, ThreadState::BlockedOnGc);
        wait()
    }

    /// Block until nobody is running this thread's flip function. An attached
    /// caller waiting on another thread is `WaitingForGcThreadFlip` meanwhile.
    pub fn wait_for_flip_function(&self) {
        if !self.flags().contains(ThreadFlags::RUNNING_FLIP_FUNCTION) {
            return;
        }
        let waiter = ManagedThread::current();
        let _change = waiter
            .as_deref()
            .filter(|waiter| !std::ptr::eq(*waiter, self))
            .map(|waiter| ScopedThreadStateChange::new(waiter, ThreadState::WaitingForGcThreadFlip));

        let mut counts = self.locks.lock_suspend_counts();
        while self.flags().contains(ThreadFlags::RUNNING_FLIP_FUNCTION) {
            self.locks.resume_cond.wait(&mut counts);
        }
    }

    fn finish_becoming_runnable(&self, old: StateAndFlags) {
        self.locks.mutator.shared_lock();
        if old.flags().contains(ThreadFlags::PENDING_FLIP_FUNCTION) {
            self.ensure_flip_function_started(self);
        }
        if self.flags().contains(ThreadFlags::RUNNING_FLIP_FUNCTION) {
            self.wait_for_flip_function();
        }
    }

    /// Become Runnable, blocking while the suspend count is nonzero. Returns
    /// the state the thread had before.
    pub fn transition_from_suspended_to_runnable(&self) -> ThreadState {
        loop {
            let old = self.state_and_flags();
            let old_state = old.state();
            assert!(
                !old_state.is_runnable(),
                "thread {} is already Runnable",
                self.id
            );

            let blocking = ThreadFlags::SUSPEND_REQUEST | ThreadFlags::ACTIVE_SUSPEND_BARRIER;
            if !old.flags().intersects(blocking) {
                if self.cas_state_and_flags(old, old.with_state(ThreadState::Runnable)) {
                    self.finish_becoming_runnable(old);
                    return old_state;
                }
            } else if old.flags().contains(ThreadFlags::ACTIVE_SUSPEND_BARRIER) {
                self.pass_active_suspend_barriers();
            } else {
                let mut counts = self.locks.lock_suspend_counts();
                self.transitioning_to_runnable.store(true, Ordering::Release);
                while self.flags().contains(ThreadFlags::SUSPEND_REQUEST) {
                    self.locks.resume_cond.wait(&mut counts);
                }
                self.transitioning_to_runnable.store(false, Ordering::Release);
            }
        }
    }

    /// Become Runnable only if that does not require waiting.
    pub fn try_transition_from_suspended_to_runnable(&self) -> bool {
        let old = self.state_and_flags();
        if old.state().is_runnable()
            || old
                .flags()
                .intersects(ThreadFlags::SUSPEND_REQUEST | ThreadFlags::ACTIVE_SUSPEND_BARRIER)
        {
            return false;
        }

        if !self.cas_state_and_flags(old, old.with_state(ThreadState::Runnable)) {
            return false;
        }
        self.finish_becoming_runnable(old);
        true
    }

    /// Leave the Runnable state. Pending checkpoints run first, and any suspend
    /// barrier waiting for this thread is passed afterwards.
    pub fn transition_from_runnable_to_suspended(&self, new_state: ThreadState) {
        assert!(!new_state.is_runnable());
        loop {
            let old = self.state_and_flags();
            assert!(
                old.state().is_runnable(),
                "thread {} is not Runnable but {}",
                self.id,
                old.state()
            );

            if old.flags().contains(ThreadFlags::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
            } else if old.flags().contains(ThreadFlags::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
            } else if self.cas_state_and_flags(old, old.with_state(new_state)) {
                break;
            }
        }

        unsafe {
            self.locks.mutator.shared_unlock();
        }

        if self.flags().contains(ThreadFlags::ACTIVE_SUSPEND_BARRIER) {
            self.pass_active_suspend_barriers();
        }
    }

    /// Move between two non-Runnable states.
    fn set_suspended_state(&self, new_state: ThreadState) {
        assert!(!new_state.is_runnable());
        loop {
            let old = self.state_and_flags();
            assert!(!old.state().is_runnable());
            if self.cas_state_and_flags(old, old.with_state(new_state)) {
                return;
            }
        }
    }

    /// Safepoint poll. Runs queued checkpoints, answers empty checkpoints and
    /// parks while a suspend request is pending.
    pub fn safepoint(&self) {
        debug_assert!(self.state().is_runnable());
        loop {
            let flags = self.flags();
            if flags.contains(ThreadFlags::CHECKPOINT_REQUEST) {
                self.run_checkpoint_function();
            } else if flags.contains(ThreadFlags::EMPTY_CHECKPOINT_REQUEST) {
                self.run_empty_checkpoint();
            } else if flags.contains(ThreadFlags::SUSPEND_REQUEST) {
                self.full_suspend_check();
            } else {
                break;
            }
        }
    }

    fn full_suspend_check(&self) {
        log::trace!(target: "threads", "thread {} parking for suspend request", self.id);
        self.transition_from_runnable_to_suspended(ThreadState::Suspended);
        self.transition_from_suspended_to_runnable();
    }

    pub fn dump(&self) -> ThreadDump {
        ThreadDump {
            id: self.id,
            name: self.name.clone(),
            daemon: self.daemon,
            os_tid: self.os_tid,
            state: self.state(),
            flags: self.flags(),
            suspend_count: self.suspend_count(),
            frames: self.stack.describe(),
        }
    }
}

/// Change the state of `thread` for a scope, restoring it on drop.
pub struct ScopedThreadStateChange<'a> {
    thread: &'a ManagedThread,
    old: ThreadState,
}

impl<'a> ScopedThreadStateChange<'a> {
    pub fn new(thread: &'a ManagedThread, new_state: ThreadState) -> Self {
        let old = thread.state();
        if old != new_state {
            if old.is_runnable() {
                thread.transition_from_runnable_to_suspended(new_state);
            } else if new_state.is_runnable() {
                thread.transition_from_suspended_to_runnable();
            } else {
                thread.set_suspended_state(new_state);
            }
        }
        Self { thread, old }
    }
}

impl Drop for ScopedThreadStateChange<'_> {
    fn drop(&mut self) {
        let current = self.thread.state();
        if current == self.old {
            return;
        }

        if current.is_runnable() {
            self.thread.transition_from_runnable_to_suspended(self.old);
        } else if self.old.is_runnable() {
            self.thread.transition_from_suspended_to_runnable();
        } else {
            self.thread.set_suspended_state(self.old);
        }
    }
}

/// Leave the Runnable state for a scope. A no-op for threads that are not
/// Runnable, so it is safe around any blocking region.
pub struct ScopedThreadSuspension<'a> {
    _change: Option<ScopedThreadStateChange<'a>>,
}

impl<'a> ScopedThreadSuspension<'a> {
    pub fn new(thread: Option<&'a ManagedThread>, state: ThreadState) -> Self {
        let change = thread
            .filter(|thread| thread.state().is_runnable())
            .map(|thread| ScopedThreadStateChange::new(thread, state));
        Self { _change: change }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<ThreadRef>> = const { RefCell::new(None) };
}

fn current_os_tid() -> i64 {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            unsafe { libc::syscall(libc::SYS_gettid) as i64 }
        } else if #[cfg(unix)] {
            unsafe { libc::getpid() as i64 }
        } else {
            0
        }
    }
}

/// Bitset of allocated thread ids. Id 0 is never handed out.
struct ThreadIdAllocator {
    words: Vec<u64>,
    max: u32,
}

impl ThreadIdAllocator {
    fn new(max: u32) -> Self {
        Self {
            words: vec![0; (max as usize).div_ceil(64)],
            max,
        }
    }

    fn alloc(&mut self) -> Option<ThreadId> {
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros();
            let id = index as u32 * 64 + bit + 1;
            if id > self.max {
                return None;
            }
            *word |= 1 << bit;
            return Some(ThreadId(id));
        }
        None
    }

    fn release(&mut self, id: ThreadId) {
        assert_ne!(id, ThreadId::INVALID);
        let index = (id.0 - 1) as usize;
        let (word, bit) = (index / 64, index % 64);
        assert!(
            self.words[word] & (1 << bit) != 0,
            "releasing thread id {} that was not allocated",
            id
        );
        self.words[word] &= !(1 << bit);
    }
}

/// The registry of live threads of one runtime.
pub struct ThreadList {
    pub(crate) list: Mutex<Vec<ThreadRef>>,
    /// Signalled, with the thread-list lock, when a thread deregisters.
    thread_exit_cond: Condvar,
    ids: Mutex<ThreadIdAllocator>,
    pub(crate) locks: Arc<Locks>,
    pub(crate) options: SafepointOptions,
    context_id: usize,
    pub(crate) suspend_all_histogram: Mutex<SuspendHistogram>,
    /// Serialises empty checkpoints, which share one barrier.
    pub(crate) empty_checkpoint_lock: Mutex<()>,
    pub(crate) weak_ref_gates: Mutex<Vec<Arc<crate::runtime::checkpoint::WeakRefAccessGate>>>,
}

impl ThreadList {
    pub fn new(options: SafepointOptions, context_id: usize) -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            thread_exit_cond: Condvar::new(),
            ids: Mutex::new(ThreadIdAllocator::new(options.max_thread_id)),
            locks: Arc::new(Locks::new()),
            options,
            context_id,
            suspend_all_histogram: Mutex::new(SuspendHistogram::default()),
            empty_checkpoint_lock: Mutex::new(()),
            weak_ref_gates: Mutex::new(Vec::new()),
        }
    }

    pub fn locks(&self) -> &Arc<Locks> {
        &self.locks
    }

    pub fn options(&self) -> &SafepointOptions {
        &self.options
    }

    /// The calling thread's record, if it is attached to this runtime.
    pub fn current(&self) -> Option<ThreadRef> {
        ManagedThread::current().filter(|thread| thread.context_id == self.context_id)
    }

    pub fn size(&self) -> usize {
        self.list.lock().len()
    }

    pub fn contains(&self, thread: &ManagedThread) -> bool {
        self.list
            .lock()
            .iter()
            .any(|registered| std::ptr::eq(&**registered, thread))
    }

    pub fn find_by_id(&self, id: ThreadId) -> Option<ThreadRef> {
        self.list
            .lock()
            .iter()
            .find(|thread| thread.id == id)
            .cloned()
    }

    /// Call `f` for every registered thread with the thread-list lock held.
    pub fn for_each(&self, mut f: impl FnMut(&ThreadRef)) {
        let list = self.list.lock();
        for thread in list.iter() {
            f(thread);
        }
    }

    pub fn snapshot(&self) -> Vec<ThreadRef> {
        self.list.lock().clone()
    }

    /// Create and register a thread record. The new thread starts out Native
    /// and, if a suspend-all is in progress, already carries its suspend count.
    pub fn register(&self, name: &str, daemon: bool) -> Result<ThreadRef> {
        let id = self
            .ids
            .lock()
            .alloc()
            .ok_or(SafepointError::ThreadIdsExhausted)?;
        let thread = Arc::new(ManagedThread::new(
            id,
            name,
            daemon,
            self.context_id,
            self.locks.clone(),
        ));

        let mut list = self.list.lock();
        let mut counts = self.locks.lock_suspend_counts();
        for _ in 0..counts.suspend_all_count {
            thread.increment_suspend_count(&mut counts, None, SuspendReason::Internal);
        }
        list.push(thread.clone());
        drop(counts);
        drop(list);

        log::debug!(target: "threads", "registered thread {} \"{}\"", id, name);
        Ok(thread)
    }

    /// Remove `thread` from the registry. Blocks while anybody still holds a
    /// suspend request on it or while its flip function is outstanding.
    pub fn unregister(&self, thread: &ThreadRef) {
        if thread.state().is_runnable() {
            thread.transition_from_runnable_to_suspended(ThreadState::Native);
        }

        loop {
            if thread
                .flags()
                .contains(ThreadFlags::PENDING_FLIP_FUNCTION)
            {
                thread.ensure_flip_function_started(thread);
            }
            thread.wait_for_flip_function();

            {
                let mut list = self.list.lock();
                let counts = self.locks.lock_suspend_counts();
                if thread.suspend_count() == 0 && !thread.has_flip_function() {
                    list.retain(|registered| !Arc::ptr_eq(registered, thread));
                    thread.set_suspended_state(ThreadState::Terminated);
                    drop(counts);
                    self.ids.lock().release(thread.id);
                    self.thread_exit_cond.notify_all();
                    break;
                }
            }

            std::thread::sleep(self.options.unregister_retry_sleep);
        }

        log::debug!(target: "threads", "unregistered thread {}", thread.id);
    }

    /// Register the calling OS thread.
    pub fn attach_current_thread(&self, name: &str, daemon: bool) -> Result<ThreadRef> {
        assert!(
            ManagedThread::current().is_none(),
            "thread is already attached to a runtime"
        );
        let thread = self.register(name, daemon)?;
        CURRENT.with_borrow_mut(|current| *current = Some(thread.clone()));
        Ok(thread)
    }

    pub fn detach_current_thread(&self) {
        let thread = self
            .current()
            .unwrap_or_else(|| panic!("detaching a thread that is not attached"));
        self.unregister(&thread);
        CURRENT.with_borrow_mut(|current| *current = None);
    }

    /// Block until every non-daemon thread other than the caller is gone.
    pub fn wait_for_other_non_daemon_threads_to_exit(&self) {
        let this = self.current();
        let _suspension = ScopedThreadSuspension::new(this.as_deref(), ThreadState::Waiting);
        let mut list = self.list.lock();
        loop {
            let others = list
                .iter()
                .filter(|thread| !thread.daemon)
                .filter(|thread| this.as_ref().map_or(true, |this| !Arc::ptr_eq(this, thread)))
                .count();
            if others == 0 {
                break;
            }
            self.thread_exit_cond.wait_for(&mut list, Duration::from_millis(100));
        }
    }

    /// Snapshot of every thread's state without stopping anybody. Safe to
    /// call on fatal paths, where a checkpoint might never complete.
    pub fn dump(&self) -> String {
        let this = self.current();
        let mut dumps: Vec<_> = self.snapshot().iter().map(|thread| thread.dump()).collect();
        sort_dumps(&mut dumps, this.as_ref().map(|thread| thread.id));

        let mut out = String::new();
        out.push_str(&format!("DALVIK THREADS ({}):\n", dumps.len()));
        for dump in &dumps {
            out.push_str(&dump.to_string());
            out.push('\n');
        }
        out.push_str(&self.suspend_all_histogram.lock().to_string());
        out
    }

    /// Debug check used by code that requires a stopped world.
    pub fn assert_other_threads_are_suspended(&self) {
        let this = self.current();
        for thread in self.snapshot() {
            if this.as_ref().is_some_and(|this| Arc::ptr_eq(this, &thread)) {
                continue;
            }
            assert!(
                thread.is_suspended(),
                "thread {} is not suspended: {:?}",
                thread.id,
                thread.state_and_flags()
            );
        }
    }
}

/// Where a thread lands in a dump: the caller first, then threads that are
/// doing something interesting, then idle ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum DumpOrder {
    Caller,
    Interesting,
    Idle,
}

pub(crate) fn sort_dumps(dumps: &mut [ThreadDump], caller: Option<ThreadId>) {
    dumps.sort_by_key(|dump| {
        let order = if Some(dump.id) == caller {
            DumpOrder::Caller
        } else if dump.state.is_runnable() || dump.suspend_count != 0 {
            DumpOrder::Interesting
        } else {
            DumpOrder::Idle
        };
        (order, dump.id)
    });
}

#[derive(Clone, Debug)]
pub struct ThreadDump {
    pub id: ThreadId,
    pub name: String,
    pub daemon: bool,
    pub os_tid: i64,
    pub state: ThreadState,
    pub flags: ThreadFlags,
    pub suspend_count: u32,
    pub frames: Vec<String>,
}

impl fmt::Display for ThreadDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "\"{}\"{} tid={} {}",
            self.name,
            if self.daemon { " daemon" } else { "" },
            self.id,
            self.state
        )?;
        writeln!(
            f,
            "  | sCount={} flags={:?} sysTid={}",
            self.suspend_count, self.flags, self.os_tid
        )?;
        for frame in &self.frames {
            writeln!(f, "  at {}", frame)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> ThreadList {
        ThreadList::new(SafepointOptions::for_tests(), 1)
    }

    #[test]
    fn state_and_flags_pack() {
        let word = StateAndFlags::new(ThreadState::Native, ThreadFlags::SUSPEND_REQUEST);
        assert_eq!(word.state(), ThreadState::Native);
        assert_eq!(word.flags(), ThreadFlags::SUSPEND_REQUEST);

        let word = word
            .with_state(ThreadState::Runnable)
            .with_flags(ThreadFlags::CHECKPOINT_REQUEST)
            .without_flags(ThreadFlags::SUSPEND_REQUEST);
        assert_eq!(word.state(), ThreadState::Runnable);
        assert_eq!(word.flags(), ThreadFlags::CHECKPOINT_REQUEST);
    }

    #[test]
    fn ids_are_reused_after_unregister() {
        let threads = list();
        let a = threads.register("a", false).unwrap();
        let b = threads.register("b", false).unwrap();
        assert_eq!(a.id(), ThreadId::new(1));
        assert_eq!(b.id(), ThreadId::new(2));

        threads.unregister(&a);
        assert_eq!(a.state(), ThreadState::Terminated);
        assert!(threads.find_by_id(ThreadId::new(1)).is_none());

        let c = threads.register("c", false).unwrap();
        assert_eq!(c.id(), ThreadId::new(1));
        assert_eq!(threads.size(), 2);
    }

    #[test]
    fn id_space_is_bounded() {
        let threads = ThreadList::new(
            SafepointOptions {
                max_thread_id: 2,
                ..SafepointOptions::for_tests()
            },
            1,
        );
        let _a = threads.register("a", false).unwrap();
        let _b = threads.register("b", false).unwrap();
        assert!(matches!(
            threads.register("c", false),
            Err(SafepointError::ThreadIdsExhausted)
        ));
    }

    #[test]
    fn transitions_hold_the_mutator_lock_shared() {
        let threads = list();
        let thread = threads.register("mutator", false).unwrap();

        assert_eq!(thread.transition_from_suspended_to_runnable(), ThreadState::Native);
        assert!(!threads
            .locks()
            .mutator
            .try_exclusive_lock_for(Duration::from_millis(1)));

        thread.transition_from_runnable_to_suspended(ThreadState::Native);
        assert!(threads
            .locks()
            .mutator
            .try_exclusive_lock_for(Duration::from_millis(1)));
        unsafe { threads.locks().mutator.exclusive_unlock() };
    }

    #[test]
    fn suspend_request_blocks_becoming_runnable() {
        let threads = list();
        let thread = threads.register("mutator", false).unwrap();

        {
            let mut counts = threads.locks().lock_suspend_counts();
            thread.increment_suspend_count(&mut counts, None, SuspendReason::ForUserCode);
        }
        assert!(!thread.try_transition_from_suspended_to_runnable());
        assert_eq!(thread.user_code_suspend_count(), 1);

        let waiter = {
            let thread = thread.clone();
            std::thread::spawn(move || {
                thread.transition_from_suspended_to_runnable();
                thread.transition_from_runnable_to_suspended(ThreadState::Native);
            })
        };

        while !thread.is_transitioning_to_runnable() {
            std::thread::yield_now();
        }
        assert_eq!(thread.state(), ThreadState::Native);

        {
            let mut counts = threads.locks().lock_suspend_counts();
            thread.decrement_suspend_count(&mut counts, SuspendReason::ForUserCode);
        }
        threads.locks().resume_cond.notify_all();
        waiter.join().unwrap();
        assert_eq!(thread.suspend_count(), 0);
        assert!(!thread.flags().contains(ThreadFlags::SUSPEND_REQUEST));
    }

    #[test]
    #[should_panic(expected = "would become negative")]
    fn decrement_below_zero_is_a_protocol_violation() {
        let threads = list();
        let thread = threads.register("t", false).unwrap();
        let mut counts = threads.locks().lock_suspend_counts();
        thread.decrement_suspend_count(&mut counts, SuspendReason::Internal);
    }

    #[test]
    fn dumps_put_caller_and_busy_threads_first() {
        let mk = |id, state, suspend_count| ThreadDump {
            id: ThreadId::new(id),
            name: format!("t{}", id),
            daemon: false,
            os_tid: 0,
            state,
            flags: ThreadFlags::empty(),
            suspend_count,
            frames: Vec::new(),
        };
        let mut dumps = vec![
            mk(1, ThreadState::Native, 0),
            mk(2, ThreadState::Runnable, 0),
            mk(3, ThreadState::Native, 1),
            mk(4, ThreadState::Waiting, 0),
        ];
        sort_dumps(&mut dumps, Some(ThreadId::new(4)));
        let order: Vec<u32> = dumps.iter().map(|dump| dump.id.get()).collect();
        assert_eq!(order, vec![4, 2, 3, 1]);
    }

    #[test]
    fn attach_sets_current() {
        let threads = list();
        let other = ThreadList::new(SafepointOptions::for_tests(), 2);
        let handle = std::thread::spawn(move || {
            let thread = threads.attach_current_thread("worker", true).unwrap();
            assert_eq!(threads.current().unwrap().id(), thread.id());
            assert!(other.current().is_none());
            threads.detach_current_thread();
            assert!(ManagedThread::current().is_none());
            assert_eq!(threads.size(), 0);
        });
        handle.join().unwrap();
    }

    #[test]
    fn waiting_on_another_threads_flip_is_a_thread_state() {
        let threads = Arc::new(list());
        let target = threads.register("target", false).unwrap();
        let (release_tx, release_rx) = flume::bounded::<()>(1);
        target.set_flip_function(
            &threads.locks().lock_suspend_counts(),
            Arc::new(move |_: &ManagedThread| {
                let _ = release_rx.recv();
            }),
        );

        let flipper = {
            let target = target.clone();
            std::thread::spawn(move || assert!(target.ensure_flip_function_started(&target)))
        };
        while !target.flags().contains(ThreadFlags::RUNNING_FLIP_FUNCTION) {
            std::thread::yield_now();
        }

        let (waiter_tx, waiter_rx) = flume::bounded::<ThreadRef>(1);
        let waiter = {
            let threads = threads.clone();
            let target = target.clone();
            std::thread::spawn(move || {
                let this = threads.attach_current_thread("waiter", false).unwrap();
                waiter_tx.send(this.clone()).unwrap();
                target.wait_for_flip_function();
                let state = this.state();
                threads.detach_current_thread();
                state
            })
        };
        let waiting = waiter_rx.recv().unwrap();
        while waiting.state() != ThreadState::WaitingForGcThreadFlip {
            std::thread::yield_now();
        }

        release_tx.send(()).unwrap();
        flipper.join().unwrap();
        assert_eq!(waiter.join().unwrap(), ThreadState::Native);
        assert!(!target.has_flip_function());
        threads.unregister(&target);
    }

    #[test]
    fn threads_blocked_on_gc_do_not_hold_up_suspend_all() {
        let threads = Arc::new(list());
        let (gc_done_tx, gc_done_rx) = flume::bounded::<()>(1);
        let (state_tx, state_rx) = flume::bounded::<ThreadRef>(1);
        let mutator = {
            let threads = threads.clone();
            std::thread::spawn(move || {
                let this = threads.attach_current_thread("mutator", false).unwrap();
                this.transition_from_suspended_to_runnable();
                state_tx.send(this.clone()).unwrap();
                this.block_on_gc(|| gc_done_rx.recv().unwrap());
                let back = this.state();
                this.transition_from_runnable_to_suspended(ThreadState::Native);
                threads.detach_current_thread();
                back
            })
        };

        let mutator_thread = state_rx.recv().unwrap();
        while mutator_thread.state() != ThreadState::BlockedOnGc {
            std::thread::yield_now();
        }
        let guard = threads.suspend_all("collect");
        assert_eq!(mutator_thread.suspend_count(), 1);
        drop(guard);

        gc_done_tx.send(()).unwrap();
        assert_eq!(mutator.join().unwrap(), ThreadState::Runnable);
    }
}
