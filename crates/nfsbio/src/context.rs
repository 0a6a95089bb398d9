//! Per-call context: who is asking, and whether they have given up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Identity attached to RPCs and remembered on buffers with pending I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Credential {
    /// User ID.
    pub uid: u32,
    /// Primary group ID.
    pub gid: u32,
}

impl Credential {
    /// Creates a credential.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The superuser credential used by background workers for buffers
    /// that carry no credential of their own.
    pub fn root() -> Self {
        Self::default()
    }
}

/// Cooperative cancellation flag, checked at every interruptible wait.
///
/// Cancelling never aborts an RPC that is already on the wire; it only
/// releases the local waiter.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Re-arms the token for another call.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Everything the I/O layer needs to know about the caller.
#[derive(Debug, Clone, Default)]
pub struct IoContext {
    /// Credential for RPCs issued on the caller's behalf.
    pub cred: Credential,
    /// Cancellation for interruptible waits.
    pub cancel: CancelToken,
    /// The caller's file size resource limit, if any.
    pub file_size_limit: Option<u64>,
    /// Process to signal when the file size limit is exceeded.
    pub pid: Option<i32>,
}

impl IoContext {
    /// Creates a context for the given credential.
    pub fn new(cred: Credential) -> Self {
        Self {
            cred,
            ..Self::default()
        }
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the file size resource limit.
    #[must_use]
    pub fn with_file_size_limit(mut self, limit: u64) -> Self {
        self.file_size_limit = Some(limit);
        self
    }

    /// Sets the process that receives `SIGXFSZ`.
    #[must_use]
    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }
}
