//! Async dispatcher: background workers serving per-mount I/O queues.
//!
//! # Flow
//!
//! ```text
//! submit(buf) ─▶ claim idle worker / spawn ─▶ attach to mount ─▶ enqueue
//!                         │                                      ▲
//!                         └── none, but mount has a worker ──────┘
//!                         └── none at all ──▶ Busy (caller does the I/O)
//! ```
//!
//! A full queue blocks the submitter until a worker takes a buffer. That
//! wait is the only thing bounding memory held by pending async I/O.

mod pool;
mod queue;

use thiserror::Error;

pub use pool::IodPool;
pub use queue::MountQueue;

use crate::cache::BufHandle;
use crate::error::BioError;

/// A mount as seen by the workers.
pub trait AsyncTarget: Send + Sync {
    /// The mount's queue.
    fn queue(&self) -> &MountQueue;

    /// Performs the queued I/O and releases the buffer.
    fn run_async(&self, buf: BufHandle);
}

/// Submission refused. The buffer comes back to the caller.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// No worker can take it; do the I/O inline.
    #[error("no async worker available")]
    Busy(BufHandle),
    /// Interrupted while waiting for queue space.
    #[error("interrupted waiting for async queue space")]
    Interrupted(BufHandle),
}

impl SubmitError {
    /// Recovers the buffer.
    pub fn into_handle(self) -> BufHandle {
        match self {
            SubmitError::Busy(buf) | SubmitError::Interrupted(buf) => buf,
        }
    }

    pub(crate) fn handle_mut(&mut self) -> &mut BufHandle {
        match self {
            SubmitError::Busy(buf) | SubmitError::Interrupted(buf) => buf,
        }
    }

    /// Equivalent I/O-layer error.
    pub fn as_bio_error(&self) -> BioError {
        match self {
            SubmitError::Busy(_) => BioError::Busy,
            SubmitError::Interrupted(_) => BioError::Interrupted,
        }
    }
}
