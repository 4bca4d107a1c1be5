//! Suspend-all, single-thread suspension and resumption.

use std::{
    fmt,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    error::{Result, SafepointError},
    runtime::{
        fatal,
        options::SafepointOptions,
        threads::{
            BarrierRequest, ManagedThread, ScopedThreadSuspension, SuspendCounts, SuspendReason,
            ThreadId, ThreadList, ThreadRef, ThreadState,
        },
    },
};

/// Counts down once per targeted thread as each one reaches a safe point.
pub struct SuspendBarrier {
    pending: AtomicI32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl SuspendBarrier {
    pub fn new(count: i32) -> Self {
        Self {
            pending: AtomicI32::new(count),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn pass(&self) {
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "suspend barrier passed more often than expected");
        if previous == 1 {
            let _guard = self.lock.lock();
            self.cond.notify_all();
        }
    }

    /// Block until every targeted thread passed. Returns false on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock();
        while self.pending() > 0 {
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return self.pending() == 0;
            }
        }
        true
    }
}

/// Why a suspend attempt could not proceed right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unsuitable {
    /// Another suspend-all is in flight.
    SuspendAllActive,
    /// The requesting thread itself has a nonzero suspend count.
    CallerSuspended,
    /// Some thread has a flip function outstanding.
    FlipInProgress,
    /// The target thread has a flip function outstanding.
    TargetFlipInProgress,
}

impl fmt::Display for Unsuitable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Unsuitable::SuspendAllActive => "another suspend-all is active",
            Unsuitable::CallerSuspended => "the requesting thread is suspended",
            Unsuitable::FlipInProgress => "a thread flip is in progress",
            Unsuitable::TargetFlipInProgress => "the target thread has a pending flip function",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendPhase {
    Attempt,
    Blocked(Unsuitable),
    Retry,
    Fatal(Unsuitable),
}

/// Bounded retry loop for suspend requests.
///
/// `Attempt` tries to install the request. An unsuitable moment moves to
/// `Blocked`, after which the caller waits and moves to `Retry` and from there
/// back to `Attempt`. Once `max_attempts` attempts were blocked the machine
/// ends in `Fatal` and reports [`SafepointError::RetryLimitExceeded`].
#[derive(Debug)]
pub struct SuspendStateMachine {
    cause: &'static str,
    phase: SuspendPhase,
    attempts: u32,
    max_attempts: u32,
    retry_sleep: Duration,
}

impl SuspendStateMachine {
    pub fn new(cause: &'static str, options: &SafepointOptions) -> Self {
        Self {
            cause,
            phase: SuspendPhase::Attempt,
            attempts: 0,
            max_attempts: options.max_suspend_retries,
            retry_sleep: options.suspend_retry_sleep,
        }
    }

    pub fn phase(&self) -> SuspendPhase {
        self.phase
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn begin_attempt(&mut self) {
        debug_assert!(!matches!(self.phase, SuspendPhase::Fatal(_)));
        self.phase = SuspendPhase::Attempt;
    }

    pub fn blocked(&mut self, reason: Unsuitable) -> Result<()> {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            self.phase = SuspendPhase::Fatal(reason);
            return Err(SafepointError::RetryLimitExceeded {
                cause: self.cause,
                attempts: self.attempts,
                reason,
            });
        }

        log::trace!(
            target: "threads",
            "{}: attempt {} blocked: {}",
            self.cause,
            self.attempts,
            reason
        );
        self.phase = SuspendPhase::Blocked(reason);
        Ok(())
    }

    pub fn retry(&mut self) {
        debug_assert!(matches!(self.phase, SuspendPhase::Blocked(_)));
        self.phase = SuspendPhase::Retry;
    }

    pub fn retry_sleep(&self) -> Duration {
        self.retry_sleep
    }
}

/// Pause statistics of completed suspend-alls.
#[derive(Clone, Debug, Default)]
pub struct SuspendHistogram {
    count: u64,
    long: u64,
    total: Duration,
    max: Duration,
}

impl SuspendHistogram {
    pub fn record(&mut self, pause: Duration, long: bool) {
        self.count += 1;
        self.total += pause;
        self.max = self.max.max(pause);
        if long {
            self.long += 1;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn long_pauses(&self) -> u64 {
        self.long
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl fmt::Display for SuspendHistogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mean = if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        };
        writeln!(
            f,
            "suspend all histogram: count={} long={} total={:?} mean={:?} max={:?}",
            self.count, self.long, self.total, mean, self.max
        )
    }
}

/// Proof that every thread but the holder is suspended and that the holder
/// has exclusive access to the mutator lock. Dropping it resumes everybody.
pub struct ScopedSuspendAll<'a> {
    threads: &'a ThreadList,
    this: Option<ThreadRef>,
    cause: &'static str,
    started: Instant,
}

impl<'a> ScopedSuspendAll<'a> {
    pub fn threads(&self) -> &'a ThreadList {
        self.threads
    }

    pub fn cause(&self) -> &'static str {
        self.cause
    }

    /// The thread that suspended the world, if it is attached.
    pub fn holder(&self) -> Option<&ThreadRef> {
        self.this.as_ref()
    }

    pub(crate) fn is_holder(&self, thread: &ManagedThread) -> bool {
        self.this
            .as_ref()
            .is_some_and(|this| std::ptr::eq(&**this, thread))
    }
}

impl Drop for ScopedSuspendAll<'_> {
    fn drop(&mut self) {
        log::debug!(
            target: "threads",
            "resuming all threads after {:?} ({})",
            self.started.elapsed(),
            self.cause
        );
        unsafe {
            self.threads.locks.mutator.exclusive_unlock();
        }
        self.threads.resume_others(self.this.as_ref());
    }
}

fn is_same(this: Option<&ThreadRef>, thread: &ThreadRef) -> bool {
    this.is_some_and(|this| Arc::ptr_eq(this, thread))
}

impl ThreadList {
    /// Wait for the reason an attempt was blocked to go away. Called with the
    /// suspend-count lock held and the thread-list lock released.
    fn wait_out_unsuitable(
        &self,
        mut counts: MutexGuard<'_, SuspendCounts>,
        machine: &SuspendStateMachine,
        this: Option<&ThreadRef>,
        reason: Unsuitable,
    ) {
        let deadline = Instant::now() + self.options.suspend_timeout;
        match reason {
            Unsuitable::SuspendAllActive => {
                while counts.suspend_all_count > 0 {
                    if self
                        .locks
                        .resume_cond
                        .wait_until(&mut counts, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
            Unsuitable::CallerSuspended => {
                while this.is_some_and(|this| this.suspend_count() > 0) {
                    if self
                        .locks
                        .resume_cond
                        .wait_until(&mut counts, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
            }
            Unsuitable::FlipInProgress | Unsuitable::TargetFlipInProgress => {
                drop(counts);
                std::thread::sleep(machine.retry_sleep());
            }
        }
    }

    /// Suspend every thread except the caller. The caller must not be
    /// Runnable: it would hold the mutator lock shared and never get it
    /// exclusively.
    pub fn try_suspend_all(&self, cause: &'static str) -> Result<ScopedSuspendAll<'_>> {
        let this = self.suspend_all_internal(cause)?;
        Ok(ScopedSuspendAll {
            threads: self,
            this,
            cause,
            started: Instant::now(),
        })
    }

    /// Suspend everybody else and take the mutator lock exclusively. Returns
    /// the caller's record. The matching release is [`resume_others`](Self::resume_others)
    /// after unlocking the mutator lock.
    pub(crate) fn suspend_all_internal(&self, cause: &'static str) -> Result<Option<ThreadRef>> {
        let this = self.current();
        if let Some(this) = &this {
            assert!(
                !this.state().is_runnable(),
                "suspend-all ({}) requested by Runnable thread {}",
                cause,
                this.id()
            );
        }

        log::debug!(target: "threads", "suspending all threads ({})", cause);
        let started = Instant::now();
        let mut machine = SuspendStateMachine::new(cause, &self.options);

        let (barrier, targets) = loop {
            machine.begin_attempt();
            let list = self.list.lock();
            let mut counts = self.locks.lock_suspend_counts();

            let unsuitable = if counts.suspend_all_count > 0 {
                Some(Unsuitable::SuspendAllActive)
            } else if this.as_ref().is_some_and(|this| this.suspend_count() > 0) {
                Some(Unsuitable::CallerSuspended)
            } else if list.iter().any(|thread| thread.has_flip_function()) {
                Some(Unsuitable::FlipInProgress)
            } else {
                None
            };

            if let Some(reason) = unsuitable {
                machine.blocked(reason)?;
                drop(list);
                self.wait_out_unsuitable(counts, &machine, this.as_ref(), reason);
                machine.retry();
                continue;
            }

            counts.suspend_all_count += 1;
            let targets: Vec<ThreadRef> = list
                .iter()
                .filter(|thread| !is_same(this.as_ref(), thread))
                .cloned()
                .collect();
            let barrier = Arc::new(SuspendBarrier::new(targets.len() as i32));
            for thread in &targets {
                thread.increment_suspend_count(
                    &mut counts,
                    Some(BarrierRequest::SuspendAll(barrier.clone())),
                    SuspendReason::Internal,
                );
            }
            break (barrier, targets);
        };

        if !barrier.wait(self.options.suspend_timeout) {
            let unsuspended = targets
                .iter()
                .filter(|thread| thread.state().is_runnable())
                .map(|thread| thread.id())
                .collect();
            self.withdraw_barrier(&targets, &barrier);
            self.resume_others(this.as_ref());
            return Err(SafepointError::BarrierTimeout {
                cause,
                waited: started.elapsed(),
                unsuspended,
            });
        }

        if !self
            .locks
            .mutator
            .try_exclusive_lock_for(self.options.suspend_timeout)
        {
            self.resume_others(this.as_ref());
            return Err(SafepointError::MutatorLockTimeout {
                cause,
                waited: started.elapsed(),
            });
        }

        let pause = started.elapsed();
        let long = pause > self.options.long_suspend_threshold;
        if long {
            log::warn!(
                target: "threads",
                "suspending all threads took {:?} ({})",
                pause,
                cause
            );
        }
        self.suspend_all_histogram.lock().record(pause, long);
        Ok(this)
    }

    /// Like [`try_suspend_all`](Self::try_suspend_all), but any failure is fatal.
    pub fn suspend_all(&self, cause: &'static str) -> ScopedSuspendAll<'_> {
        match self.try_suspend_all(cause) {
            Ok(guard) => guard,
            Err(err) => fatal(&err, self),
        }
    }

    fn withdraw_barrier(&self, targets: &[ThreadRef], barrier: &Arc<SuspendBarrier>) {
        let mut counts = self.locks.lock_suspend_counts();
        for thread in targets {
            thread.remove_suspend_barrier(&mut counts, barrier);
        }
    }

    /// Undo one suspend-all round for everybody but `this`. Threads that
    /// registered during the round carry the increment too.
    pub(crate) fn resume_others(&self, this: Option<&ThreadRef>) {
        let list = self.list.lock();
        let mut counts = self.locks.lock_suspend_counts();
        assert!(
            counts.suspend_all_count > 0,
            "resuming all threads without a suspend-all in progress"
        );
        counts.suspend_all_count -= 1;
        for thread in list.iter() {
            if is_same(this, thread) {
                continue;
            }
            thread.decrement_suspend_count(&mut counts, SuspendReason::Internal);
        }
        self.locks.resume_cond.notify_all();
    }

    /// Suspend `target` and wait until it stopped running managed code.
    /// Returns `Ok(false)` if the thread is not registered.
    pub fn try_suspend_thread(&self, target: &ThreadRef, reason: SuspendReason) -> Result<bool> {
        let this = self.current();
        assert!(
            !is_same(this.as_ref(), target),
            "thread {} attempted to suspend itself",
            target.id()
        );

        let _suspension = ScopedThreadSuspension::new(this.as_deref(), ThreadState::Suspended);
        let cause = "suspend thread";
        let started = Instant::now();
        let mut machine = SuspendStateMachine::new(cause, &self.options);

        let barrier = loop {
            machine.begin_attempt();
            let list = self.list.lock();
            if !list.iter().any(|thread| Arc::ptr_eq(thread, target)) {
                return Ok(false);
            }
            let counts = self.locks.lock_suspend_counts();

            let unsuitable = if this.as_ref().is_some_and(|this| this.suspend_count() > 0) {
                Some(Unsuitable::CallerSuspended)
            } else if target.has_flip_function() {
                Some(Unsuitable::TargetFlipInProgress)
            } else {
                None
            };

            if let Some(reason) = unsuitable {
                machine.blocked(reason)?;
                drop(list);
                self.wait_out_unsuitable(counts, &machine, this.as_ref(), reason);
                machine.retry();
                continue;
            }

            let mut counts = counts;
            let barrier = Arc::new(SuspendBarrier::new(1));
            target.increment_suspend_count(
                &mut counts,
                Some(BarrierRequest::Single(barrier.clone())),
                reason,
            );
            break barrier;
        };

        if !barrier.wait(self.options.suspend_timeout) {
            let mut counts = self.locks.lock_suspend_counts();
            target.remove_suspend_barrier(&mut counts, &barrier);
            target.decrement_suspend_count(&mut counts, reason);
            self.locks.resume_cond.notify_all();
            return Err(SafepointError::BarrierTimeout {
                cause,
                waited: started.elapsed(),
                unsuspended: vec![target.id()],
            });
        }

        log::debug!(
            target: "threads",
            "suspended thread {} in {:?}",
            target.id(),
            started.elapsed()
        );
        Ok(true)
    }

    pub fn try_suspend_thread_by_id(
        &self,
        id: ThreadId,
        reason: SuspendReason,
    ) -> Result<Option<ThreadRef>> {
        let Some(target) = self.find_by_id(id) else {
            return Ok(None);
        };
        Ok(self.try_suspend_thread(&target, reason)?.then_some(target))
    }

    /// Suspend the thread with `id`. `None` if no such thread is registered.
    pub fn suspend_thread_by_id(&self, id: ThreadId, reason: SuspendReason) -> Option<ThreadRef> {
        match self.try_suspend_thread_by_id(id, reason) {
            Ok(thread) => thread,
            Err(err) => fatal(&err, self),
        }
    }

    pub fn suspend_thread(&self, target: &ThreadRef, reason: SuspendReason) -> bool {
        match self.try_suspend_thread(target, reason) {
            Ok(suspended) => suspended,
            Err(err) => fatal(&err, self),
        }
    }

    /// Drop one suspend request of `thread`.
    pub fn try_resume(&self, thread: &ManagedThread, reason: SuspendReason) -> Result<()> {
        let list = self.list.lock();
        if !list.iter().any(|registered| std::ptr::eq(&**registered, thread)) {
            return Err(SafepointError::NoSuchThread(thread.id()));
        }

        let mut counts = self.locks.lock_suspend_counts();
        let suspended = match reason {
            SuspendReason::Internal => thread.suspend_count() > 0,
            SuspendReason::ForUserCode => thread.user_code_suspend_count() > 0,
        };
        if !suspended {
            return Err(SafepointError::NotSuspended(thread.id()));
        }

        thread.decrement_suspend_count(&mut counts, reason);
        drop(list);
        self.locks.resume_cond.notify_all();
        log::debug!(target: "threads", "resumed thread {}", thread.id());
        Ok(())
    }

    pub fn resume(&self, thread: &ManagedThread, reason: SuspendReason) -> bool {
        match self.try_resume(thread, reason) {
            Ok(()) => true,
            Err(err) => {
                log::error!(target: "threads", "resume failed: {}", err);
                false
            }
        }
    }
}
