//! Interruptible waiting, the per-file range lock and in-flight counting.
//!
//! Every suspension point in the layer goes through [`Waiter::wait`], which
//! blocks on a condition variable. On interruptible mounts the wait is
//! sliced so the caller's [`CancelToken`] is polled; on other mounts it
//! blocks until notified.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::context::CancelToken;
use crate::error::{BioError, BioResult};

/// How a caller waits: interruptibly (with a token) or not at all.
#[derive(Debug, Clone, Copy)]
pub struct Waiter<'a> {
    token: Option<&'a CancelToken>,
    poll: Duration,
}

impl<'a> Waiter<'a> {
    /// Builds a waiter honouring `token` only if the mount is interruptible.
    pub fn new(interruptible: bool, token: &'a CancelToken, poll: Duration) -> Self {
        Self {
            token: interruptible.then_some(token),
            poll,
        }
    }

    /// A waiter that never gives up.
    pub fn uninterruptible() -> Waiter<'static> {
        Waiter {
            token: None,
            poll: Duration::ZERO,
        }
    }

    /// Whether the caller has asked to stop.
    pub fn cancelled(&self) -> bool {
        self.token.is_some_and(CancelToken::is_cancelled)
    }

    /// Fails with [`BioError::Interrupted`] if the caller has asked to stop.
    pub fn check(&self) -> BioResult<()> {
        if self.cancelled() {
            Err(BioError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Blocks once on `cv`. Callers loop on their own predicate.
    pub fn wait<T>(&self, cv: &Condvar, guard: &mut MutexGuard<'_, T>) -> BioResult<()> {
        match self.token {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(BioError::Interrupted);
                }
                cv.wait_for(guard, self.poll);
                if token.is_cancelled() {
                    return Err(BioError::Interrupted);
                }
            }
            None => cv.wait(guard),
        }
        Ok(())
    }
}

/// Token serializing size-changing operations on one file (`rslock`).
#[derive(Debug, Default)]
pub struct RangeLock {
    held: Mutex<bool>,
    cv: Condvar,
}

/// Holding this guard means holding the range lock. Dropping it releases.
#[derive(Debug)]
pub struct RangeLockGuard<'a> {
    lock: &'a RangeLock,
}

impl RangeLock {
    /// Creates an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, sleeping as long as necessary.
    pub fn lock(&self, waiter: &Waiter<'_>) -> BioResult<RangeLockGuard<'_>> {
        let mut held = self.held.lock();
        while *held {
            waiter.wait(&self.cv, &mut held)?;
        }
        *held = true;
        Ok(RangeLockGuard { lock: self })
    }

    /// Acquires the lock if it is free. If it was held, sleeps until it is
    /// released and then fails with [`BioError::Restart`] without taking it,
    /// so the caller re-checks whatever made it want the lock.
    pub fn lock_or_restart(&self, waiter: &Waiter<'_>) -> BioResult<RangeLockGuard<'_>> {
        let mut held = self.held.lock();
        if !*held {
            *held = true;
            return Ok(RangeLockGuard { lock: self });
        }
        while *held {
            waiter.wait(&self.cv, &mut held)?;
        }
        Err(BioError::Restart)
    }

    /// Whether someone currently holds the lock.
    pub fn is_held(&self) -> bool {
        *self.held.lock()
    }

    fn unlock(&self) {
        let mut held = self.held.lock();
        assert!(*held, "range lock released while not held");
        *held = false;
        self.cv.notify_all();
    }
}

impl Drop for RangeLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Count of operations in flight, with a wait for none.
#[derive(Debug, Default)]
pub struct InFlight {
    count: Mutex<usize>,
    cv: Condvar,
}

/// One operation counted by [`InFlight`]. Dropping it ends the operation.
#[derive(Debug)]
pub struct InFlightGuard {
    owner: Arc<InFlight>,
}

impl InFlight {
    /// Creates an idle counter.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counts one more operation until the guard is dropped.
    pub fn begin(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock() += 1;
        InFlightGuard {
            owner: Arc::clone(self),
        }
    }

    /// Operations currently in flight.
    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Blocks until no operation is in flight.
    pub fn wait_idle(&self, waiter: &Waiter<'_>) -> BioResult<()> {
        let mut count = self.count.lock();
        while *count > 0 {
            waiter.wait(&self.cv, &mut count)?;
        }
        Ok(())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.owner.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.owner.cv.notify_all();
        }
    }
}
