//! Read path: cache validation, read-ahead, EOF sizing, and the directory
//! and symlink variants.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{InvalidatePolicy, block_len};
use crate::buffer::IoCmd;
use crate::cache::BufHandle;
use crate::context::IoContext;
use crate::error::{BioError, BioResult};
use crate::mount::Mount;
use crate::node::NfsNode;
use crate::rpc::FileKind;
use crate::sync::Waiter;

impl Mount {
    /// Reads up to `out.len()` bytes at `offset`, returning the count.
    ///
    /// Reading at or past end of file (or end of directory) returns fewer
    /// bytes, down to zero, rather than failing.
    pub fn read(
        self: &Arc<Self>,
        node: &NfsNode,
        offset: u64,
        out: &mut [u8],
        ctx: &IoContext,
    ) -> BioResult<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if node.kind() != FileKind::Directory
            && offset.saturating_add(out.len() as u64) > self.config.max_file_size
        {
            return Err(BioError::FileTooLarge);
        }
        self.validate_cache(node, ctx)?;
        match node.kind() {
            FileKind::Regular => self.read_regular_file(node, offset, out, ctx),
            FileKind::Directory => self.read_directory(node, offset, out, ctx),
            FileKind::Symlink => self.read_symlink(node, offset, out, ctx),
        }
    }

    /// Weak cache consistency check against the server's modification time.
    ///
    /// A locally modified file refetches attributes (dropping cached
    /// directory blocks first); otherwise any mtime change invalidates
    /// every cached block of the file.
    pub(crate) fn validate_cache(self: &Arc<Self>, node: &NfsNode, ctx: &IoContext) -> BioResult<()> {
        if node.is_modified() {
            if node.kind() != FileKind::Regular {
                node.invalidate_dir();
                self.invalidate(node, InvalidatePolicy::Save, ctx)?;
            }
            let attrs = self.rpc.getattr(node.id(), &ctx.cred)?;
            node.load_attrs(&attrs);
            node.set_mtime(attrs.mtime);
            return Ok(());
        }

        let attrs = self.rpc.getattr(node.id(), &ctx.cred)?;
        node.load_attrs(&attrs);
        if node.mtime() != Some(attrs.mtime) {
            debug!(file = %node.id(), "Modification time changed, invalidating cache");
            if node.kind() == FileKind::Directory {
                node.invalidate_dir();
            }
            self.invalidate(node, InvalidatePolicy::Save, ctx)?;
            node.set_mtime(attrs.mtime);
        }
        Ok(())
    }

    fn read_regular_file(
        self: &Arc<Self>,
        node: &NfsNode,
        offset: u64,
        out: &mut [u8],
        ctx: &IoContext,
    ) -> BioResult<usize> {
        let bs = self.config.block_size;
        let waiter = self.waiter(ctx);
        let mut done = 0;

        while done < out.len() {
            let pos = offset + done as u64;
            let lbn = pos / bs as u64;
            let on = (pos % bs as u64) as usize;

            if self.config.readahead > 0 {
                self.read_ahead(node, lbn, ctx, &waiter)?;
            }

            let Some((mut bp, bcount)) = self.eof_sized_block(node, lbn, &waiter)? else {
                break;
            };
            if bp.is_cached() {
                self.stats.record_cache_hit();
            } else {
                self.stats.record_cache_miss();
                self.doio(node, &mut bp, IoCmd::Read, &ctx.cred)?;
            }

            let n = bcount.saturating_sub(on).min(out.len() - done);
            if n == 0 {
                break;
            }
            out[done..done + n].copy_from_slice(&bp.data()[on..on + n]);
            done += n;
        }
        trace!(file = %node.id(), offset, len = out.len(), done, "Read");
        Ok(done)
    }

    /// Resolves block `lbn`, sized to end of file.
    ///
    /// A short block is sized under the range lock so a concurrent append
    /// cannot grow the file between computing the size and taking the
    /// buffer. Returns `None` past end of file.
    fn eof_sized_block(
        &self,
        node: &NfsNode,
        lbn: u64,
        waiter: &Waiter<'_>,
    ) -> BioResult<Option<(BufHandle, usize)>> {
        let bs = self.config.block_size;
        loop {
            let bcount = block_len(lbn, bs, node.size());
            if bcount == 0 {
                return Ok(None);
            }
            if bcount == bs {
                let bp = self.get_cache_block(node, lbn, bcount, waiter)?;
                return Ok(Some((bp, bcount)));
            }
            let _guard = match node.rslock.lock_or_restart(waiter) {
                Ok(guard) => guard,
                Err(BioError::Restart) => continue,
                Err(e) => return Err(e),
            };
            let bp = self.get_cache_block(node, lbn, bcount, waiter)?;
            return Ok(Some((bp, bcount)));
        }
    }

    /// Queues reads for the blocks after `lbn`. Best effort: a refused
    /// submission ends the read-ahead.
    fn read_ahead(
        self: &Arc<Self>,
        node: &NfsNode,
        lbn: u64,
        ctx: &IoContext,
        waiter: &Waiter<'_>,
    ) -> BioResult<()> {
        let bs = self.config.block_size;
        for rabn in (lbn + 1..).take(self.config.readahead) {
            let size = node.size();
            let len = block_len(rabn, bs, size);
            if len == 0 {
                break;
            }
            if self.cache.incore(node.id(), rabn) {
                continue;
            }
            let rabp = self.get_cache_block(node, rabn, len, waiter)?;
            if rabp.is_cached() || rabp.is_dirty() {
                continue;
            }
            self.stats.record_readahead();
            if let Err(rejected) = self.async_submit(node, rabp, IoCmd::Read, ctx) {
                trace!(file = %node.id(), lbn = rabn, reason = %rejected, "Read-ahead refused");
                let mut rabp = rejected.into_handle();
                rabp.clear_async();
                rabp.invalidate(None);
                break;
            }
        }
        Ok(())
    }

    fn read_directory(
        self: &Arc<Self>,
        node: &NfsNode,
        offset: u64,
        out: &mut [u8],
        ctx: &IoContext,
    ) -> BioResult<usize> {
        let dbs = self.config.dir_block_size;
        let waiter = self.waiter(ctx);
        let mut done = 0;

        while done < out.len() {
            let pos = offset + done as u64;
            if node.dir_eof().is_some_and(|eof| pos >= eof) {
                break;
            }
            let lbn = pos / dbs as u64;
            let on = (pos % dbs as u64) as usize;

            let Some(bp) = self.dir_block(node, lbn, ctx, &waiter)? else {
                break;
            };
            self.dir_read_ahead(node, lbn + 1, ctx, &waiter)?;

            // Directory blocks are not sized to EOF; the remembered
            // end-of-directory offset bounds the copy instead.
            let mut n = bp.filled().saturating_sub(on).min(out.len() - done);
            if let Some(eof) = node.dir_eof() {
                n = n.min(usize::try_from(eof.saturating_sub(pos)).unwrap_or(usize::MAX));
            }
            if n == 0 {
                break;
            }
            out[done..done + n].copy_from_slice(&bp.data()[on..on + n]);
            done += n;
        }
        Ok(done)
    }

    /// Returns cached directory block `lbn`, reading it if needed.
    ///
    /// A stale cookie means the directory changed on the server: positions
    /// are re-derived by dropping every block and reading from block zero
    /// up to `lbn`, repeatedly if the cookies go stale again. `None` means
    /// the directory ends before `lbn`.
    fn dir_block(
        self: &Arc<Self>,
        node: &NfsNode,
        lbn: u64,
        ctx: &IoContext,
        waiter: &Waiter<'_>,
    ) -> BioResult<Option<BufHandle>> {
        let dbs = self.config.dir_block_size;
        let mut bp = self.get_cache_block(node, lbn, dbs, waiter)?;
        if bp.is_cached() {
            self.stats.record_cache_hit();
            return Ok(Some(bp));
        }
        self.stats.record_cache_miss();
        let mut error = match self.doio(node, &mut bp, IoCmd::Read, &ctx.cred) {
            Ok(()) => return Ok(Some(bp)),
            Err(e) => e,
        };
        drop(bp);

        while error == BioError::BadDirectoryCookie {
            debug!(dir = %node.id(), lbn, "Stale directory cookie, re-reading from the start");
            node.invalidate_dir();
            self.invalidate(node, InvalidatePolicy::Save, ctx)?;
            match self.reread_dir(node, lbn, ctx, waiter) {
                Ok(bp) => return Ok(bp),
                Err(e) => error = e,
            }
        }
        Err(error)
    }

    fn reread_dir(
        self: &Arc<Self>,
        node: &NfsNode,
        lbn: u64,
        ctx: &IoContext,
        waiter: &Waiter<'_>,
    ) -> BioResult<Option<BufHandle>> {
        let dbs = self.config.dir_block_size;
        for i in 0..=lbn {
            if node.dir_eof().is_some_and(|eof| i * dbs as u64 >= eof) {
                return Ok(None);
            }
            let mut bp = self.get_cache_block(node, i, dbs, waiter)?;
            if !bp.is_cached() {
                self.doio(node, &mut bp, IoCmd::Read, &ctx.cred)?;
            }
            if i == lbn {
                return Ok(Some(bp));
            }
        }
        Ok(None)
    }

    fn dir_read_ahead(
        self: &Arc<Self>,
        node: &NfsNode,
        rabn: u64,
        ctx: &IoContext,
        waiter: &Waiter<'_>,
    ) -> BioResult<()> {
        let dbs = self.config.dir_block_size as u64;
        if self.config.readahead == 0
            || node.dir_eof().is_some_and(|eof| rabn * dbs >= eof)
            || self.cache.incore(node.id(), rabn)
        {
            return Ok(());
        }
        let rabp = self.get_cache_block(node, rabn, self.config.dir_block_size, waiter)?;
        if rabp.is_cached() || rabp.is_dirty() {
            return Ok(());
        }
        self.stats.record_readahead();
        if let Err(rejected) = self.async_submit(node, rabp, IoCmd::Read, ctx) {
            let mut rabp = rejected.into_handle();
            rabp.clear_async();
            rabp.invalidate(None);
        }
        Ok(())
    }

    fn read_symlink(
        self: &Arc<Self>,
        node: &NfsNode,
        offset: u64,
        out: &mut [u8],
        ctx: &IoContext,
    ) -> BioResult<usize> {
        let waiter = self.waiter(ctx);
        let mut bp = self.get_cache_block(node, 0, self.config.symlink_buffer_size, &waiter)?;
        if !bp.is_cached() {
            self.doio(node, &mut bp, IoCmd::Read, &ctx.cred)?;
        }
        let on = match usize::try_from(offset) {
            Ok(on) if on < bp.filled() => on,
            _ => return Ok(0),
        };
        let n = bp.filled().saturating_sub(on).min(out.len());
        out[..n].copy_from_slice(&bp.data()[on..on + n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::context::Credential;
    use crate::rpc::FileId;
    use crate::testing::MemServer;

    fn mount(server: &Arc<MemServer>, readahead: usize) -> Arc<Mount> {
        let config = MountConfig::default()
            .block_size(4096)
            .readahead(readahead);
        Mount::builder(config, server.clone()).build().unwrap()
    }

    #[test]
    fn test_read_clips_at_eof() {
        let server = Arc::new(MemServer::new());
        server.create_file(FileId(1), &[5u8; 5000]);
        let mount = mount(&server, 0);
        let ctx = IoContext::new(Credential::root());
        let node = mount.open(FileId(1), &ctx).unwrap();

        let mut out = vec![0u8; 8192];
        assert_eq!(mount.read(&node, 0, &mut out, &ctx).unwrap(), 5000);
        assert!(out[..5000].iter().all(|&b| b == 5));
        assert_eq!(mount.read(&node, 5000, &mut out, &ctx).unwrap(), 0);
        assert_eq!(mount.read(&node, 9000, &mut out, &ctx).unwrap(), 0);
    }

    #[test]
    fn test_second_read_hits_cache() {
        let server = Arc::new(MemServer::new());
        server.create_file(FileId(1), &[1u8; 4096]);
        let mount = mount(&server, 0);
        let ctx = IoContext::new(Credential::root());
        let node = mount.open(FileId(1), &ctx).unwrap();

        let mut out = vec![0u8; 100];
        mount.read(&node, 0, &mut out, &ctx).unwrap();
        mount.read(&node, 100, &mut out, &ctx).unwrap();
        assert_eq!(server.counts().reads, 1);
        let snap = mount.stats().snapshot();
        assert_eq!(snap.cache_misses, 1);
        assert_eq!(snap.cache_hits, 1);
    }

    #[test]
    fn test_external_change_invalidates() {
        let server = Arc::new(MemServer::new());
        server.create_file(FileId(1), b"old contents");
        let mount = mount(&server, 0);
        let ctx = IoContext::new(Credential::root());
        let node = mount.open(FileId(1), &ctx).unwrap();

        let mut out = vec![0u8; 64];
        let n = mount.read(&node, 0, &mut out, &ctx).unwrap();
        assert_eq!(&out[..n], b"old contents");

        server.mutate_externally(FileId(1), b"new contents!");
        let n = mount.read(&node, 0, &mut out, &ctx).unwrap();
        assert_eq!(&out[..n], b"new contents!");
    }

    #[test]
    fn test_read_ahead_fetches_next_block() {
        let server = Arc::new(MemServer::new());
        server.create_file(FileId(1), &[2u8; 3 * 4096]);
        let mount = mount(&server, 1);
        let ctx = IoContext::new(Credential::root());
        let node = mount.open(FileId(1), &ctx).unwrap();

        let mut out = vec![0u8; 10];
        mount.read(&node, 0, &mut out, &ctx).unwrap();
        assert_eq!(mount.stats().snapshot().readaheads, 1);
        // The read-ahead buffer is owned by the worker until it completes
        let mut next = vec![0u8; 10];
        mount.read(&node, 4096, &mut next, &ctx).unwrap();
        assert_eq!(next, vec![2u8; 10]);
    }

    #[test]
    fn test_symlink_read() {
        let server = Arc::new(MemServer::new());
        server.create_symlink(FileId(3), b"/target/path");
        let mount = mount(&server, 0);
        let ctx = IoContext::new(Credential::root());
        let node = mount.open(FileId(3), &ctx).unwrap();

        let mut out = vec![0u8; 64];
        let n = mount.read(&node, 0, &mut out, &ctx).unwrap();
        assert_eq!(&out[..n], b"/target/path");
        let n = mount.read(&node, 8, &mut out, &ctx).unwrap();
        assert_eq!(&out[..n], b"path");
    }

    #[test]
    fn test_symlink_read_past_target_is_empty() {
        let server = Arc::new(MemServer::new());
        server.create_symlink(FileId(3), b"/target/path");
        let mount = mount(&server, 0);
        let ctx = IoContext::new(Credential::root());
        let node = mount.open(FileId(3), &ctx).unwrap();

        let mut out = vec![0u8; 64];
        assert_eq!(mount.read(&node, 12, &mut out, &ctx), Ok(0));
        assert_eq!(mount.read(&node, 2000, &mut out, &ctx), Ok(0));
    }
}
