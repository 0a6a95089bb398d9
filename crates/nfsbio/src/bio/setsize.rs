//! Size changes from truncate and extend.

use std::sync::Arc;

use tracing::debug;

use crate::context::IoContext;
use crate::error::{BioError, BioResult};
use crate::mount::Mount;
use crate::node::NfsNode;
use crate::rpc::FileKind;

impl Mount {
    /// Sets the cached size of `node` to `new_size`.
    ///
    /// Shrinking drops every buffer wholly past the new end, dirty or not,
    /// and cuts the boundary buffer down to the new end. A clean boundary
    /// buffer leaves the cache so its stale tail is never reused. The page
    /// cache learns the new extent either way. Serialized against
    /// extending writes by the range lock.
    pub fn set_size(
        self: &Arc<Self>,
        node: &NfsNode,
        new_size: u64,
        ctx: &IoContext,
    ) -> BioResult<()> {
        if node.kind() != FileKind::Regular {
            return Err(BioError::WrongFileKind);
        }
        if new_size > self.config.max_file_size {
            return Err(BioError::FileTooLarge);
        }
        let waiter = self.waiter(ctx);
        let _rslock = node.rslock.lock(&waiter)?;

        let old_size = node.replace_size(new_size);
        if new_size < old_size {
            let bs = self.config.block_size as u64;
            let lbn = new_size / bs;
            let keep = (new_size % bs) as usize;
            let first_dropped = if keep == 0 { lbn } else { lbn + 1 };

            let dropped = self.cache.truncate_from(node.id(), first_dropped, &waiter)?;
            if keep > 0 {
                if let Some(mut bp) = self.cache.acquire(node.id(), lbn, &waiter)? {
                    if bp.len() > keep {
                        bp.resize(keep);
                    }
                    bp.set_release();
                }
            }
            self.stats.record_truncation();
            debug!(file = %node.id(), old_size, new_size, dropped, "Truncated");
        }
        self.pages.set_size(node.id(), new_size);
        Ok(())
    }
}
