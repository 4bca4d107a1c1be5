use std::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::{
    lock_api::{RawRwLock as _, RawRwLockTimed as _},
    Condvar, Mutex, MutexGuard, RawRwLock, WaitTimeoutResult,
};

use crate::runtime::threads::{ManagedThread, ThreadState};

/// The execution lock.
///
/// Runnable threads hold it shared. `SuspendAll` takes it exclusively once
/// every other thread has passed the suspend barrier, so exclusive access
/// means no other thread is executing managed code.
///
/// Shared holds are not tied to a guard: a thread takes the lock when it
/// becomes Runnable and releases it when it leaves that state, which is
/// possibly far away from the place it was taken.
pub struct MutatorLock {
    raw: RawRwLock,
    exclusive: AtomicBool,
}

impl MutatorLock {
    pub const fn new() -> Self {
        Self {
            raw: RawRwLock::INIT,
            exclusive: AtomicBool::new(false),
        }
    }

    pub fn shared_lock(&self) {
        self.raw.lock_shared();
    }

    /// # Safety
    ///
    /// The calling context must hold a shared lock taken by [`shared_lock`](Self::shared_lock).
    pub unsafe fn shared_unlock(&self) {
        self.raw.unlock_shared();
    }

    pub fn exclusive_lock(&self) {
        self.raw.lock_exclusive();
        self.exclusive.store(true, Ordering::Release);
    }

    /// Returns false if the lock could not be taken within `timeout`.
    pub fn try_exclusive_lock_for(&self, timeout: Duration) -> bool {
        if self.raw.try_lock_exclusive_for(timeout) {
            self.exclusive.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// # Safety
    ///
    /// The calling context must hold the lock exclusively.
    pub unsafe fn exclusive_unlock(&self) {
        self.exclusive.store(false, Ordering::Release);
        self.raw.unlock_exclusive();
    }

    pub fn is_exclusive_held(&self) -> bool {
        self.exclusive.load(Ordering::Acquire)
    }

    /// Take the lock shared for the lifetime of the returned guard. Used by
    /// threads that are not Runnable but need a stable view of mutator state.
    pub fn read(&self) -> SharedMutatorGuard<'_> {
        self.shared_lock();
        SharedMutatorGuard { lock: self }
    }
}

impl Default for MutatorLock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SharedMutatorGuard<'a> {
    lock: &'a MutatorLock,
}

impl Drop for SharedMutatorGuard<'_> {
    fn drop(&mut self) {
        unsafe {
            self.lock.shared_unlock();
        }
    }
}

/// A monitor is mechanism to control concurrent access to an object.
///
/// This is a regular mutex + condvar pair with two flavours of locking. The
/// "no handshake" variants block the OS thread and nothing else. The "with
/// handshake" variants leave the Runnable state while blocked so that a
/// suspend-all does not have to wait for the lock to become free.
pub struct Monitor<T> {
    lock: Mutex<T>,
    cvar: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            lock: Mutex::new(value),
            cvar: Condvar::new(),
        }
    }

    pub fn lock_no_handshake(&self) -> MonitorGuard<'_, T> {
        MonitorGuard {
            guard: self.lock.lock(),
            monitor: self,
        }
    }

    /// Lock the monitor on behalf of `thread`. If the thread is Runnable it is
    /// marked Blocked while it waits; it only returns Runnable, and holding the
    /// lock, once it is allowed to run managed code again.
    pub fn lock_with_handshake(&self, thread: &ManagedThread) -> MonitorGuard<'_, T> {
        if let Some(guard) = self.lock.try_lock() {
            return MonitorGuard {
                guard,
                monitor: self,
            };
        }

        if thread.state() != ThreadState::Runnable {
            return self.lock_no_handshake();
        }

        thread.transition_from_runnable_to_suspended(ThreadState::Blocked);
        loop {
            let guard = self.lock.lock();

            if thread.try_transition_from_suspended_to_runnable() {
                return MonitorGuard {
                    guard,
                    monitor: self,
                };
            }

            // A suspend request is pending; wait for it without the lock.
            drop(guard);
            thread.transition_from_suspended_to_runnable();
            thread.transition_from_runnable_to_suspended(ThreadState::Blocked);
        }
    }

    pub fn notify_all(&self) {
        self.cvar.notify_all();
    }

    pub fn notify_one(&self) {
        self.cvar.notify_one();
    }
}

pub struct MonitorGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    monitor: &'a Monitor<T>,
}

impl<'a, T> MonitorGuard<'a, T> {
    pub fn monitor(&self) -> &'a Monitor<T> {
        self.monitor
    }

    pub fn wait_no_handshake(&mut self) {
        self.monitor.cvar.wait(&mut self.guard);
    }

    pub fn wait_for_no_handshake(&mut self, timeout: Duration) -> WaitTimeoutResult {
        self.monitor.cvar.wait_for(&mut self.guard, timeout)
    }

    /// Wait for a notification with `thread` out of the Runnable state, so the
    /// wait never holds up a suspend-all.
    pub fn wait_with_handshake(self, thread: &ManagedThread) -> Self {
        if thread.state() != ThreadState::Runnable {
            let mut this = self;
            this.wait_no_handshake();
            return this;
        }

        let monitor = self.monitor;
        let mut this = self;
        thread.transition_from_runnable_to_suspended(ThreadState::Waiting);
        this.wait_no_handshake();
        drop(this);
        monitor.lock_after_wait(thread)
    }

    pub fn notify_all(&self) {
        self.monitor.notify_all();
    }
}

impl<T> Monitor<T> {
    fn lock_after_wait(&self, thread: &ManagedThread) -> MonitorGuard<'_, T> {
        loop {
            let guard = self.lock.lock();
            if thread.try_transition_from_suspended_to_runnable() {
                return MonitorGuard {
                    guard,
                    monitor: self,
                };
            }
            drop(guard);
            thread.transition_from_suspended_to_runnable();
            thread.transition_from_runnable_to_suspended(ThreadState::Waiting);
        }
    }
}

impl<T> Deref for MonitorGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<T> DerefMut for MonitorGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runtime::RuntimeBuilder;

    #[test]
    fn exclusive_waits_for_readers() {
        let lock = Arc::new(MutatorLock::new());
        lock.shared_lock();
        assert!(!lock.try_exclusive_lock_for(Duration::from_millis(10)));
        assert!(!lock.is_exclusive_held());

        unsafe { lock.shared_unlock() };
        assert!(lock.try_exclusive_lock_for(Duration::from_millis(10)));
        assert!(lock.is_exclusive_held());

        let reader = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let _guard = lock.read();
                assert!(!lock.is_exclusive_held());
            })
        };

        std::thread::sleep(Duration::from_millis(5));
        unsafe { lock.exclusive_unlock() };
        reader.join().unwrap();
    }

    #[test]
    fn blocked_monitor_waiters_do_not_hold_up_suspend_all() {
        let runtime = RuntimeBuilder::new().for_tests().build();
        let monitor = Arc::new(Monitor::new(0usize));
        let held = monitor.lock_no_handshake();

        let waiter = {
            let runtime = runtime.clone();
            let monitor = monitor.clone();
            std::thread::spawn(move || {
                let this = runtime.threads().attach_current_thread("waiter", false).unwrap();
                this.transition_from_suspended_to_runnable();
                let mut value = monitor.lock_with_handshake(&this);
                assert!(this.state().is_runnable());
                *value += 1;
                drop(value);
                this.transition_from_runnable_to_suspended(ThreadState::Native);
                runtime.threads().detach_current_thread();
            })
        };

        let thread = loop {
            match runtime.threads().snapshot().first() {
                Some(thread) if thread.state() == ThreadState::Blocked => break thread.clone(),
                _ => std::thread::yield_now(),
            }
        };

        let ssa = runtime.threads().suspend_all("monitor");
        drop(held);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!thread.state().is_runnable());
        drop(ssa);

        waiter.join().unwrap();
        assert_eq!(*monitor.lock_no_handshake(), 1);
    }
}
