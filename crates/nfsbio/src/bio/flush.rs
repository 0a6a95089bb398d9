//! Write-back of a whole file (fsync).
//!
//! Each pass commits every idle buffer holding unstable data, then pushes
//! the remaining dirty buffers through the async path. Waiting flushes
//! repeat until the file is clean.

use std::sync::Arc;

use tracing::{debug, trace};

use super::FlushMode;
use crate::cache::BufHandle;
use crate::context::IoContext;
use crate::error::{BioError, BioResult};
use crate::mount::Mount;
use crate::node::NfsNode;
use crate::rpc::WriteVerifier;

/// Bound on write-then-commit rounds for one waiting flush.
const MAX_FLUSH_PASSES: usize = 8;

impl Mount {
    /// Writes back every dirty buffer of `node`.
    ///
    /// [`FlushMode::Wait`] returns once the file holds no dirty data, or
    /// with `Interrupted` if some remains after repeated passes.
    /// [`FlushMode::NoWait`] only starts write-back of idle buffers. Either
    /// way a deferred hard write error is returned, once.
    pub fn flush(self: &Arc<Self>, node: &NfsNode, mode: FlushMode, ctx: &IoContext) -> BioResult<()> {
        let result = self.write_back(node, mode, ctx);
        match node.take_write_error() {
            Some(e) => Err(e),
            None => result,
        }
    }

    /// Flush passes without consuming the deferred write error.
    pub(crate) fn write_back(
        self: &Arc<Self>,
        node: &NfsNode,
        mode: FlushMode,
        ctx: &IoContext,
    ) -> BioResult<()> {
        let waiter = self.waiter(ctx);
        for pass in 0..MAX_FLUSH_PASSES {
            // Let in-flight writes land so their commits join the batch.
            if mode == FlushMode::Wait {
                node.wait_for_writes(&waiter)?;
            }
            self.commit_batch(node, ctx);

            for lbn in self.cache.blocks(node.id()) {
                let bp = match mode {
                    FlushMode::Wait => self.cache.acquire(node.id(), lbn, &waiter)?,
                    FlushMode::NoWait => self.cache.try_get(node.id(), lbn),
                };
                if let Some(bp) = bp.filter(|bp| bp.is_dirty()) {
                    self.write_async(node, bp, ctx);
                }
            }

            if mode == FlushMode::NoWait {
                return Ok(());
            }
            node.wait_for_writes(&waiter)?;
            if !self.cache.has_dirty(node.id()) {
                trace!(file = %node.id(), passes = pass + 1, "Flushed");
                return Ok(());
            }
        }
        debug!(file = %node.id(), "Dirty data left after flush");
        Err(BioError::Interrupted)
    }

    /// Commits every idle buffer of `node` that only needs a Commit.
    ///
    /// Buffers sharing one credential are covered by a single Commit over
    /// the union of their dirty ranges. If any Commit fails the whole batch
    /// goes back to plain dirty and will be rewritten in full, as does any
    /// buffer whose data went to another server instance than the one that
    /// answered.
    fn commit_batch(&self, node: &NfsNode, ctx: &IoContext) {
        let current = *self.verifier.lock();
        let (mut batch, mut stale): (Vec<BufHandle>, Vec<BufHandle>) = self
            .cache
            .blocks(node.id())
            .into_iter()
            .filter_map(|lbn| self.cache.try_get(node.id(), lbn))
            .filter(|bp| bp.needs_commit())
            .partition(|bp| bp.commit_verifier() == current);
        if !stale.is_empty() {
            debug!(file = %node.id(), buffers = stale.len(), "Dropping commit promises from an earlier server instance");
            stale.iter_mut().for_each(|bp| bp.forget_commit());
        }
        let Some(first) = batch.first() else {
            return;
        };

        let cred = first.cred();
        let result: BioResult<Vec<WriteVerifier>> = if batch.iter().all(|bp| bp.cred() == cred) {
            let start = batch
                .iter()
                .map(|bp| bp.dirty_file_range().start)
                .min()
                .unwrap_or(0);
            let end = batch
                .iter()
                .map(|bp| bp.dirty_file_range().end)
                .max()
                .unwrap_or(start);
            self.commit_rpc(node, start, end - start, &cred.unwrap_or(ctx.cred))
                .map(|verifier| vec![verifier; batch.len()])
        } else {
            batch
                .iter()
                .map(|bp| {
                    let range = bp.dirty_file_range();
                    self.commit_rpc(
                        node,
                        range.start,
                        range.end - range.start,
                        &bp.cred().unwrap_or(ctx.cred),
                    )
                })
                .collect()
        };

        match result {
            Ok(verifiers) => {
                let mut committed = 0;
                for (bp, verifier) in batch.iter_mut().zip(verifiers) {
                    if bp.commit_verifier() == Some(verifier) {
                        bp.mark_clean();
                        committed += 1;
                    } else {
                        bp.forget_commit();
                    }
                }
                trace!(file = %node.id(), buffers = batch.len(), committed, "Committed batch");
            }
            Err(e) => {
                debug!(file = %node.id(), buffers = batch.len(), error = %e, "Batch commit failed");
                if e == BioError::StaleWriteVerifier {
                    self.clear_commit();
                }
                batch.iter_mut().for_each(|bp| bp.forget_commit());
            }
        }
    }
}
