//! Write path.
//!
//! Each block-sized chunk is merged into its buffer's single dirty range;
//! a write that would leave a gap pushes the old range out first. The
//! chunk then goes out synchronously, asynchronously when it completes the
//! block, or stays behind as a delayed write.

use std::sync::Arc;

use nix::sys::signal::Signal;
use tracing::{debug, trace, warn};

use super::{FlushMode, WriteFlags, block_len};
use crate::buffer::IoCmd;
use crate::cache::BufHandle;
use crate::context::IoContext;
use crate::error::{BioError, BioResult};
use crate::mount::Mount;
use crate::node::NfsNode;
use crate::rpc::FileKind;
use crate::sync::Waiter;

impl Mount {
    /// Writes `data` at `offset` (or at end of file with `flags.append`).
    ///
    /// Returns the bytes written. Hard errors from delayed or async
    /// write-back are not reported here but at the next flush or close.
    pub fn write(
        self: &Arc<Self>,
        node: &NfsNode,
        offset: u64,
        data: &[u8],
        flags: WriteFlags,
        ctx: &IoContext,
    ) -> BioResult<usize> {
        if node.kind() != FileKind::Regular {
            return Err(BioError::WrongFileKind);
        }
        if flags.append || flags.sync {
            if node.is_modified() {
                self.flush(node, FlushMode::Wait, ctx)?;
            }
            if flags.append {
                let attrs = self.rpc.getattr(node.id(), &ctx.cred)?;
                node.load_attrs(&attrs);
            }
        }

        let len = data.len() as u64;
        let fits = |start: u64| {
            start
                .checked_add(len)
                .is_some_and(|end| end <= self.config.max_file_size)
        };
        if !fits(if flags.append { node.size() } else { offset }) {
            return Err(BioError::FileTooLarge);
        }
        if data.is_empty() {
            return Ok(0);
        }

        // Extending writes and appends hold the range lock throughout, so
        // competing appenders see a stable end of file.
        let waiter = self.waiter(ctx);
        let (offset, _rslock) = loop {
            if !flags.append && offset + len <= node.size() {
                break (offset, None);
            }
            match node.rslock.lock_or_restart(&waiter) {
                Ok(guard) => {
                    let start = if flags.append { node.size() } else { offset };
                    break (start, Some(guard));
                }
                Err(BioError::Restart) => continue,
                Err(e) => return Err(e),
            }
        };
        if !fits(offset) {
            return Err(BioError::FileTooLarge);
        }
        if ctx.file_size_limit.is_some_and(|limit| offset + len > limit) {
            debug!(file = %node.id(), offset, len, pid = ?ctx.pid, "Write exceeds file size limit");
            self.signals.deliver(ctx.pid, Signal::SIGXFSZ);
            return Err(BioError::FileTooLarge);
        }

        let mut done = 0;
        while done < data.len() {
            done += self.write_chunk(node, offset + done as u64, &data[done..], flags, ctx, &waiter)?;
        }
        trace!(file = %node.id(), offset, len, ?flags, "Wrote");
        Ok(done)
    }

    /// Writes the part of `data` that falls in the block holding `pos`.
    fn write_chunk(
        self: &Arc<Self>,
        node: &NfsNode,
        pos: u64,
        data: &[u8],
        flags: WriteFlags,
        ctx: &IoContext,
        waiter: &Waiter<'_>,
    ) -> BioResult<usize> {
        let bs = self.config.block_size;
        let lbn = pos / bs as u64;
        let on = (pos % bs as u64) as usize;
        let n = (bs - on).min(data.len());

        let mut bp = loop {
            let (mut bp, bcount) = self.chunk_buffer(node, lbn, pos, on, n, waiter)?;

            // Whole-block writes need no read-before-write.
            if on == 0 && n == bcount {
                bp.mark_cached();
            }
            if !bp.is_cached() {
                self.doio(node, &mut bp, IoCmd::Read, &ctx.cred)?;
            }
            if bp.cred().is_none() {
                bp.set_cred(ctx.cred);
            }
            node.set_modified();

            let stale_end = bp.dirty_range().end;
            if bp.clip_dirty(bcount) {
                warn!(
                    file = %node.id(),
                    offset = bp.offset(),
                    excess = stale_end.saturating_sub(bcount),
                    "Append race clipped dirty range"
                );
            }

            // Keep one contiguous dirty range: push the old one out and
            // start over with a fresh view of the block.
            if !bp.dirty_abuts(on, n) {
                trace!(file = %node.id(), lbn, on, n, dirty = ?bp.dirty_range(), "Flushing non-contiguous dirty range");
                let cred = bp.cred().unwrap_or(ctx.cred);
                match self.doio(node, &mut bp, IoCmd::Write, &cred) {
                    Err(e) if e.is_retryable() => return Err(e),
                    _ => continue,
                }
            }
            break bp;
        };

        bp.copy_in(on, &data[..n]);
        if flags.no_cache {
            bp.set_no_cache();
        }

        if flags.sync {
            let cred = bp.cred().unwrap_or(ctx.cred);
            self.doio(node, &mut bp, IoCmd::Write, &cred)?;
        } else if on + n == bs {
            self.write_async(node, bp, ctx);
        } else {
            bp.mark_delayed_write();
            self.stats.record_delayed_write();
        }
        Ok(n)
    }

    /// Resolves the buffer for a chunk and grows the file if the chunk
    /// extends it. Returns the buffer with its required byte count.
    fn chunk_buffer(
        &self,
        node: &NfsNode,
        lbn: u64,
        pos: u64,
        on: usize,
        n: usize,
        waiter: &Waiter<'_>,
    ) -> BioResult<(BufHandle, usize)> {
        let end = pos + n as u64;
        let size = node.size();

        if pos == size {
            // Take the block at its pre-append size so readers never see
            // the new bytes before they are copied in, and so its cached
            // contents survive the growth.
            let mut bp = self.get_cache_block(node, lbn, on, waiter)?;
            self.extend_file(node, end);
            bp.grow_for_append(on + n);
            return Ok((bp, on + n));
        }

        let block_start = lbn * self.config.block_size as u64;
        let mut bcount = on + n;
        if block_start + (bcount as u64) < size {
            bcount = block_len(lbn, self.config.block_size, size);
        }
        let bp = self.get_cache_block(node, lbn, bcount, waiter)?;
        if end > size {
            self.extend_file(node, end);
        }
        Ok((bp, bcount))
    }

    fn extend_file(&self, node: &NfsNode, end: u64) {
        if let Some(size) = node.extend(end) {
            self.pages.set_size(node.id(), size);
        }
    }
}
