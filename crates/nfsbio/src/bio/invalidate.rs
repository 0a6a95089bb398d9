//! Dropping every cached buffer of a file.

use std::sync::Arc;

use tracing::{debug, trace};

use super::{FlushMode, InvalidatePolicy};
use crate::buffer::IoCmd;
use crate::context::IoContext;
use crate::error::BioResult;
use crate::mount::Mount;
use crate::node::NfsNode;
use crate::sync::Waiter;

impl Mount {
    /// Drops every cached buffer of `node`, writing dirty data back first
    /// under [`InvalidatePolicy::Save`].
    ///
    /// Concurrent invalidations of one file run one after another. A pass
    /// that fails with a retryable error is repeated until it succeeds or
    /// the caller cancels. On success the file is no longer modified.
    pub fn invalidate(
        self: &Arc<Self>,
        node: &NfsNode,
        policy: InvalidatePolicy,
        ctx: &IoContext,
    ) -> BioResult<()> {
        let waiter = self.waiter(ctx);
        {
            let mut st = node.lock();
            while st.flush_in_progress {
                st.flush_want = true;
                waiter.wait(&node.cv, &mut st)?;
            }
            st.flush_in_progress = true;
        }

        let result = loop {
            match self.flush_and_drop_all(node, policy, ctx, &waiter) {
                Err(e) if e.is_retryable() && !waiter.cancelled() => {
                    debug!(file = %node.id(), error = %e, "Invalidation pass failed, retrying");
                }
                other => break other,
            }
        };

        let mut st = node.lock();
        if result.is_ok() {
            st.modified = false;
        }
        st.flush_in_progress = false;
        if std::mem::take(&mut st.flush_want) {
            node.cv.notify_all();
        }
        drop(st);

        if result.is_ok() {
            self.stats.record_invalidation();
        }
        result
    }

    fn flush_and_drop_all(
        self: &Arc<Self>,
        node: &NfsNode,
        policy: InvalidatePolicy,
        ctx: &IoContext,
        waiter: &Waiter<'_>,
    ) -> BioResult<()> {
        if policy == InvalidatePolicy::Save {
            self.write_back(node, FlushMode::Wait, ctx)?;
        }
        let mut dropped = 0usize;
        for lbn in self.cache.blocks(node.id()) {
            let Some(mut bp) = self.cache.acquire(node.id(), lbn, waiter)? else {
                continue;
            };
            // Dirtied again since the write-back above.
            if policy == InvalidatePolicy::Save && bp.is_dirty() {
                let cred = bp.cred().unwrap_or(ctx.cred);
                if let Err(e) = self.doio(node, &mut bp, IoCmd::Write, &cred) {
                    if e.is_retryable() {
                        return Err(e);
                    }
                }
            }
            bp.invalidate(None);
            dropped += 1;
        }
        trace!(file = %node.id(), ?policy, dropped, "Dropped cached blocks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::WriteFlags;
    use crate::config::MountConfig;
    use crate::context::Credential;
    use crate::rpc::FileId;
    use crate::testing::MemServer;

    fn setup_with(config: MountConfig) -> (Arc<MemServer>, Arc<Mount>, Arc<NfsNode>, IoContext) {
        let server = Arc::new(MemServer::new());
        server.create_file(FileId(1), b"");
        let mount = Mount::builder(config, server.clone()).build().unwrap();
        let ctx = IoContext::new(Credential::root());
        let node = mount.open(FileId(1), &ctx).unwrap();
        (server, mount, node, ctx)
    }

    fn setup() -> (Arc<MemServer>, Arc<Mount>, Arc<NfsNode>, IoContext) {
        setup_with(MountConfig::default().block_size(4096).readahead(0))
    }

    #[test]
    fn test_save_writes_then_drops() {
        let (server, mount, node, ctx) = setup();
        mount
            .write(&node, 0, b"keep me", WriteFlags::default(), &ctx)
            .unwrap();
        assert!(node.is_modified());

        mount
            .invalidate(&node, InvalidatePolicy::Save, &ctx)
            .unwrap();
        assert!(!node.is_modified());
        assert!(mount.cache().blocks(FileId(1)).is_empty());
        assert_eq!(server.stable_contents(FileId(1)), b"keep me");
    }

    #[test]
    fn test_discard_drops_dirty_data() {
        let (server, mount, node, ctx) = setup();
        mount
            .write(&node, 0, b"lost", WriteFlags::default(), &ctx)
            .unwrap();
        mount
            .invalidate(&node, InvalidatePolicy::Discard, &ctx)
            .unwrap();
        assert!(mount.cache().blocks(FileId(1)).is_empty());
        assert_eq!(server.counts().write_rpcs(), 0);
    }

    #[test]
    fn test_cancelled_wait_for_running_invalidation() {
        let (_server, mount, node, ctx) = setup_with(MountConfig::default().interruptible(true));
        node.lock().flush_in_progress = true;
        ctx.cancel.cancel();

        assert_eq!(
            mount.invalidate(&node, InvalidatePolicy::Save, &ctx),
            Err(crate::error::BioError::Interrupted)
        );
        // The running invalidation still owns the flag
        let st = node.lock();
        assert!(st.flush_in_progress);
        assert!(st.flush_want);
    }
}
