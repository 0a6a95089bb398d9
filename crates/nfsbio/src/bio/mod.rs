//! Buffered I/O paths.
//!
//! - `read`: cache validation, read-ahead, EOF sizing, directory and
//!   symlink reads.
//! - `write`: append handling, read-before-write, dirty-range merging and
//!   the write-back policy.
//! - `doio`: one transfer for one buffer and the commit state machine.
//! - `invalidate`, `setsize`, `flush`: whole-file operations.
//!
//! Everything here is an `impl Mount` block; buffers are reached through
//! [`Mount::get_cache_block`].

mod doio;
mod flush;
mod invalidate;
mod read;
mod setsize;
mod write;

use std::sync::Arc;

use tracing::trace;

use crate::buffer::{DEV_BSIZE, IoCmd};
use crate::cache::BufHandle;
use crate::context::{Credential, IoContext};
use crate::error::BioResult;
use crate::iod::{AsyncTarget, SubmitError};
use crate::mount::Mount;
use crate::node::NfsNode;
use crate::rpc::FileKind;
use crate::sync::Waiter;

/// Per-call write options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteFlags {
    /// Write at the server's end of file.
    pub append: bool,
    /// Do not return until the data is durable.
    pub sync: bool,
    /// Drop the buffers once written.
    pub no_cache: bool,
}

impl WriteFlags {
    /// Sets append mode.
    #[must_use]
    pub fn append(mut self) -> Self {
        self.append = true;
        self
    }

    /// Requests durability before returning.
    #[must_use]
    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Does not keep written buffers cached.
    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }
}

/// What happens to dirty data when a file is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidatePolicy {
    /// Write dirty buffers before dropping them.
    Save,
    /// Drop everything.
    Discard,
}

/// How long [`Mount::flush`] waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Until every dirty buffer is durable.
    Wait,
    /// Start write-back of idle buffers and return.
    NoWait,
}

/// Length of block `lbn` for a file of `size` bytes: a full block, the
/// tail up to end of file, or zero past it.
pub(crate) fn block_len(lbn: u64, block_size: usize, size: u64) -> usize {
    let start = lbn * block_size as u64;
    if start >= size {
        0
    } else {
        (size - start).min(block_size as u64) as usize
    }
}

impl Mount {
    /// Resolves `(node, lbn)` to an owned buffer of at least `size` bytes.
    pub fn get_cache_block(
        &self,
        node: &NfsNode,
        lbn: u64,
        size: usize,
        waiter: &Waiter<'_>,
    ) -> BioResult<BufHandle> {
        let blkno = match node.kind() {
            FileKind::Regular => lbn * (self.config.block_size as u64 / DEV_BSIZE),
            FileKind::Directory => lbn * (self.config.dir_block_size as u64 / DEV_BSIZE),
            FileKind::Symlink => 0,
        };
        self.cache.get_block(node.id(), lbn, blkno, size, waiter)
    }

    /// Hands `buf` to a background worker for `cmd`.
    ///
    /// Writes count as outstanding on `node` until the buffer is released,
    /// whichever path completes it. On rejection the accounting is undone
    /// and the buffer comes back, still marked for async I/O, so the caller
    /// can run it inline.
    pub fn async_submit(
        self: &Arc<Self>,
        node: &NfsNode,
        mut buf: BufHandle,
        cmd: IoCmd,
        ctx: &IoContext,
    ) -> Result<(), SubmitError> {
        buf.set_async(cmd);
        if buf.cred().is_none() {
            buf.set_cred(ctx.cred);
        }
        if cmd == IoCmd::Write {
            buf.track(node.begin_write());
        }
        let target: Arc<dyn AsyncTarget> = Arc::clone(self) as Arc<dyn AsyncTarget>;
        let waiter = self.waiter(ctx);
        self.iods
            .submit(&target, buf, &waiter, self.commit_limit)
            .map_err(|mut rejected| {
                self.stats.record_busy();
                drop(rejected.handle_mut().untrack());
                rejected
            })
    }

    /// Writes `buf` asynchronously: queued if a worker can take it,
    /// otherwise inline with the same async semantics.
    pub(crate) fn write_async(self: &Arc<Self>, node: &NfsNode, buf: BufHandle, ctx: &IoContext) {
        self.stats.record_async_write();
        if let Err(rejected) = self.async_submit(node, buf, IoCmd::Write, ctx) {
            trace!(file = %node.id(), reason = %rejected, "Writing inline");
            self.complete_async(node, rejected.into_handle());
        }
    }

    /// Runs the async command recorded on `buf`, then releases it.
    pub(crate) fn complete_async(&self, node: &NfsNode, mut buf: BufHandle) {
        let Some(cmd) = buf.async_cmd() else {
            return;
        };
        let cred = buf.cred().unwrap_or_else(Credential::root);
        if let Err(e) = self.doio(node, &mut buf, cmd, &cred) {
            trace!(file = %node.id(), lbn = buf.lbn(), ?cmd, error = %e, "Async I/O failed");
        }
        buf.clear_async();
    }
}
