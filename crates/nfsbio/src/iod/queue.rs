//! Per-mount queue of buffers awaiting async service.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::cache::BufHandle;

#[derive(Debug, Default)]
pub(crate) struct QueueInner {
    pub bufs: VecDeque<BufHandle>,
    /// Workers currently assigned to this mount.
    pub attached: usize,
    /// Submitters sleeping for space.
    pub space_waiters: usize,
}

/// Bounded FIFO of buffers for one mount, plus its attached-worker count.
#[derive(Debug, Default)]
pub struct MountQueue {
    inner: Mutex<QueueInner>,
    space_cv: Condvar,
}

impl MountQueue {
    /// Creates an empty queue with no workers attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers waiting for a worker.
    pub fn len(&self) -> usize {
        self.inner.lock().bufs.len()
    }

    /// Whether no buffer is waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().bufs.is_empty()
    }

    /// Workers attached to this mount.
    pub fn attached(&self) -> usize {
        self.inner.lock().attached
    }

    /// Submitters blocked on a full queue.
    pub fn space_waiters(&self) -> usize {
        self.inner.lock().space_waiters
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock()
    }

    pub(crate) fn space_cv(&self) -> &Condvar {
        &self.space_cv
    }

    /// Hands the next buffer to a worker, or detaches the worker when the
    /// queue is empty. Detaching happens under the queue lock so a
    /// submitter that saw an attached worker never strands its buffer.
    pub(crate) fn pop_or_detach(&self) -> Option<BufHandle> {
        let mut inner = self.inner.lock();
        if let Some(buf) = inner.bufs.pop_front() {
            if inner.space_waiters > 0 {
                self.space_cv.notify_all();
            }
            Some(buf)
        } else {
            inner.attached = inner.attached.saturating_sub(1);
            // A submitter waiting for space must notice the lost worker.
            if inner.space_waiters > 0 {
                self.space_cv.notify_all();
            }
            None
        }
    }
}
