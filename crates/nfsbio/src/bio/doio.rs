//! One transfer for one buffer.
//!
//! Reads fill the buffer in `rsize` chunks and zero the tail past a short
//! read. Writes first try to retire a pending commit promise, then push the
//! dirty range in `wsize` chunks, unstably when the buffer is going out
//! asynchronously and file-sync otherwise.

use tracing::{debug, info, trace, warn};

use crate::buffer::{Buffer, IoCmd};
use crate::context::Credential;
use crate::error::{BioError, BioResult};
use crate::mount::Mount;
use crate::node::NfsNode;
use crate::rpc::{FileKind, StableHow, WriteVerifier};

impl Mount {
    /// Performs `cmd` on `buf` with the caller's credential.
    ///
    /// On a hard write error the buffer is invalidated and the error is
    /// deferred onto the file. A retryable error leaves the dirty data in
    /// place for a later attempt.
    pub(crate) fn doio(
        &self,
        node: &NfsNode,
        buf: &mut Buffer,
        cmd: IoCmd,
        cred: &Credential,
    ) -> BioResult<()> {
        buf.set_in_progress(true);
        let result = match cmd {
            IoCmd::Read => self.read_block(node, buf, cred),
            IoCmd::Write => self.write_block(node, buf, cred),
        };
        buf.set_in_progress(false);
        result
    }

    fn read_block(&self, node: &NfsNode, buf: &mut Buffer, cred: &Credential) -> BioResult<()> {
        let result = match node.kind() {
            FileKind::Regular => self.read_regular(node, buf, cred),
            FileKind::Directory => self.read_dir_block(node, buf, cred),
            FileKind::Symlink => self.read_link(node, buf, cred),
        };
        match result {
            Ok(()) => {
                buf.mark_cached();
                Ok(())
            }
            Err(e) => {
                trace!(file = %node.id(), lbn = buf.lbn(), error = %e, "Read failed");
                buf.invalidate(Some(e.clone()));
                Err(e)
            }
        }
    }

    fn read_regular(&self, node: &NfsNode, buf: &mut Buffer, cred: &Credential) -> BioResult<()> {
        let offset = buf.offset();
        let len = buf.len();
        let mut done = 0;
        while done < len {
            let end = (done + self.config.rsize).min(len);
            let reply = self
                .rpc
                .read(node.id(), offset + done as u64, &mut buf.data_mut()[done..end], cred)?;
            let count = reply.count.min(end - done);
            self.stats.record_read_rpc(count);
            done += count;
            if reply.eof || count == 0 {
                break;
            }
        }
        // Holes and short reads read as zeroes.
        buf.data_mut()[done..].fill(0);
        buf.set_resid(0);
        trace!(file = %node.id(), lbn = buf.lbn(), offset, len, filled = done, "Read block");
        Ok(())
    }

    fn read_dir_block(&self, node: &NfsNode, buf: &mut Buffer, cred: &Credential) -> BioResult<()> {
        let lbn = buf.lbn();
        let Some(cookie) = node.dir_cookie(lbn) else {
            return Err(BioError::BadDirectoryCookie);
        };
        let reply = self.rpc.readdir(node.id(), cookie, buf.data_mut(), cred)?;
        let len = buf.len();
        let count = reply.count.min(len);
        self.stats.record_read_rpc(count);
        buf.data_mut()[count..].fill(0);
        if reply.eof {
            buf.set_resid(len - count);
            node.set_dir_eof(buf.offset() + count as u64);
        } else {
            buf.set_resid(0);
        }
        node.record_dir_cookie(lbn, reply.next_cookie);
        trace!(dir = %node.id(), lbn, count, eof = reply.eof, "Read directory block");
        Ok(())
    }

    fn read_link(&self, node: &NfsNode, buf: &mut Buffer, cred: &Credential) -> BioResult<()> {
        let n = self.rpc.readlink(node.id(), buf.data_mut(), cred)?;
        let len = buf.len();
        let n = n.min(len);
        buf.data_mut()[n..].fill(0);
        buf.set_resid(len - n);
        self.stats.record_read_rpc(n);
        Ok(())
    }

    fn write_block(&self, node: &NfsNode, buf: &mut Buffer, cred: &Credential) -> BioResult<()> {
        if buf.needs_commit() {
            self.commit_buffer(node, buf, cred);
            if !buf.is_dirty() {
                return Ok(());
            }
        }

        // Never write past the end of file; a racing truncate may have
        // shrunk it since the data was dirtied.
        let limit = usize::try_from(node.size().saturating_sub(buf.offset()))
            .unwrap_or(usize::MAX)
            .min(buf.len());
        if buf.clip_dirty(limit) {
            debug!(file = %node.id(), lbn = buf.lbn(), limit, "Clipped dirty range to file size");
        }
        if !buf.has_dirty_range() {
            buf.mark_clean();
            return Ok(());
        }

        let stable = if buf.is_async() && !buf.no_cache() {
            StableHow::Unstable
        } else {
            StableHow::FileSync
        };
        match self.write_rpc(node, buf, stable, cred) {
            Ok((StableHow::Unstable, Some(verifier))) => {
                buf.mark_needs_commit(verifier);
                Ok(())
            }
            Ok(_) => {
                buf.mark_clean();
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                buf.mark_delayed_write();
                if !buf.is_async() {
                    buf.mark_interrupted();
                }
                Err(e)
            }
            Err(e) => {
                warn!(file = %node.id(), lbn = buf.lbn(), error = %e, "Write failed, discarding data");
                buf.invalidate(Some(e.clone()));
                node.record_write_error(e.clone());
                Err(e)
            }
        }
    }

    /// Retires the buffer's commit promise, leaving it clean on success
    /// and plain dirty otherwise.
    ///
    /// A promise made by another server instance than the one the mount
    /// last heard from is dropped without a Commit.
    fn commit_buffer(&self, node: &NfsNode, buf: &mut Buffer, cred: &Credential) {
        let current = *self.verifier.lock();
        if buf.commit_verifier() != current {
            debug!(file = %node.id(), lbn = buf.lbn(), "Commit promise from an earlier server instance, rewriting");
            buf.forget_commit();
            return;
        }
        let range = buf.dirty_file_range();
        match self.commit_rpc(node, range.start, range.end - range.start, cred) {
            Ok(verifier) if buf.commit_verifier() == Some(verifier) => {
                trace!(file = %node.id(), lbn = buf.lbn(), "Committed buffer");
                buf.mark_clean();
            }
            Ok(_) => {
                debug!(file = %node.id(), lbn = buf.lbn(), "Commit answered by another server instance, rewriting");
                buf.forget_commit();
            }
            Err(e) => {
                if e == BioError::StaleWriteVerifier {
                    self.clear_commit();
                }
                debug!(file = %node.id(), lbn = buf.lbn(), error = %e, "Commit failed, rewriting");
                buf.forget_commit();
            }
        }
    }

    /// Sends the dirty range, returning the weakest durability granted and
    /// the verifier of the server instance that accepted it.
    ///
    /// If the verifier changes between chunks of an unstable transfer, the
    /// earlier chunks may be lost and the range is sent again from the
    /// start.
    fn write_rpc(
        &self,
        node: &NfsNode,
        buf: &Buffer,
        stable: StableHow,
        cred: &Credential,
    ) -> BioResult<(StableHow, Option<WriteVerifier>)> {
        let range = buf.dirty_range();
        let base = buf.offset();
        let mut committed = StableHow::FileSync;
        let mut accepted_by: Option<WriteVerifier> = None;
        let mut pos = range.start;
        while pos < range.end {
            let end = (pos + self.config.wsize).min(range.end);
            let reply = self
                .rpc
                .write(node.id(), base + pos as u64, &buf.data()[pos..end], stable, cred)?;
            self.stats
                .record_write_rpc(end - pos, stable == StableHow::FileSync);
            if reply.count == 0 {
                return Err(BioError::Server(libc::EIO));
            }
            self.observe_write_verifier(reply.verifier);
            if let Some(mtime) = reply.mtime {
                node.set_mtime(mtime);
            }
            let restarted = accepted_by.is_some_and(|v| v != reply.verifier);
            accepted_by = Some(reply.verifier);
            if restarted && committed == StableHow::Unstable {
                debug!(file = %node.id(), lbn = buf.lbn(), "Server restarted mid-transfer, resending range");
                committed = StableHow::FileSync;
                pos = range.start;
                continue;
            }
            committed = committed.min(reply.committed);
            pos += reply.count.min(end - pos);
        }
        trace!(
            file = %node.id(),
            lbn = buf.lbn(),
            offset = base + range.start as u64,
            len = range.end - range.start,
            ?stable,
            ?committed,
            "Wrote dirty range"
        );
        Ok((committed, accepted_by))
    }

    /// Commits `[offset, offset + count)`, returning the verifier of the
    /// server instance that answered.
    ///
    /// A reply carrying a verifier other than the remembered one fails with
    /// `StaleWriteVerifier`; the new verifier is remembered either way.
    pub(crate) fn commit_rpc(
        &self,
        node: &NfsNode,
        offset: u64,
        count: u64,
        cred: &Credential,
    ) -> BioResult<WriteVerifier> {
        let reply = self.rpc.commit(node.id(), offset, count, cred)?;
        self.stats.record_commit();
        if let Some(mtime) = reply.mtime {
            node.set_mtime(mtime);
        }
        let previous = self.verifier.lock().replace(reply.verifier);
        match previous {
            Some(old) if old != reply.verifier => Err(BioError::StaleWriteVerifier),
            _ => Ok(reply.verifier),
        }
    }

    /// Remembers the verifier from a write reply. A change means the server
    /// restarted, so every commit promise on the mount is forgotten.
    pub(crate) fn observe_write_verifier(&self, verifier: WriteVerifier) {
        let previous = self.verifier.lock().replace(verifier);
        if previous.is_some_and(|old| old != verifier) {
            self.clear_commit();
        }
    }

    /// Forgets every idle commit promise on the mount.
    pub(crate) fn clear_commit(&self) {
        let mut forgotten = 0usize;
        self.cache.for_each_idle(|buf| {
            if buf.needs_commit() {
                forgotten += 1;
            }
            buf.forget_commit();
        });
        self.stats.record_verifier_reset();
        info!(mount = self.id, forgotten, "Server write verifier changed, uncommitted data will be resent");
    }
}
