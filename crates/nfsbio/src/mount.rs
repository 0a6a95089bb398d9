//! The mount: shared state for every file on one server export.
//!
//! A [`Mount`] owns the buffer cache, the async queue, the table of open
//! files and the remembered server write verifier. The I/O operations
//! themselves live in [`crate::bio`] and [`crate::pages`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use nfsbio::{Credential, IoContext, Mount, MountConfig, WriteFlags};
//! use nfsbio::rpc::FileId;
//! use nfsbio::testing::MemServer;
//!
//! let server = Arc::new(MemServer::new());
//! server.create_file(FileId(1), b"");
//! let mount = Mount::builder(MountConfig::default(), server).build().unwrap();
//!
//! let ctx = IoContext::new(Credential::new(1000, 1000));
//! let file = mount.open(FileId(1), &ctx).unwrap();
//! mount.write(&file, 0, b"hello", WriteFlags::default(), &ctx).unwrap();
//! mount.close(&file, &ctx).unwrap();
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bio::FlushMode;
use crate::cache::{BufCache, BufHandle};
use crate::config::{ConfigError, IodConfig, MountConfig};
use crate::context::IoContext;
use crate::error::BioResult;
use crate::iod::{AsyncTarget, IodPool, MountQueue};
use crate::node::NfsNode;
use crate::pages::{NoopPageCache, PageCache};
use crate::rpc::{FileId, NfsRpc, WriteVerifier};
use crate::signal::{ProcessSignals, SignalSink};
use crate::stats::BioStats;
use crate::sync::Waiter;

static NEXT_MOUNT_ID: AtomicU64 = AtomicU64::new(1);

/// One mounted export.
pub struct Mount {
    pub(crate) id: u64,
    pub(crate) config: MountConfig,
    pub(crate) rpc: Arc<dyn NfsRpc>,
    pub(crate) cache: Arc<BufCache>,
    pub(crate) nodes: DashMap<FileId, Arc<NfsNode>>,
    pub(crate) queue: MountQueue,
    pub(crate) iods: Arc<IodPool>,
    pub(crate) pages: Arc<dyn PageCache>,
    pub(crate) signals: Arc<dyn SignalSink>,
    pub(crate) verifier: Mutex<Option<WriteVerifier>>,
    pub(crate) stats: BioStats,
    pub(crate) commit_limit: usize,
}

impl fmt::Debug for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("files", &self.nodes.len())
            .field("cached_blocks", &self.cache.len())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Mount`].
#[must_use]
pub struct MountBuilder {
    config: MountConfig,
    rpc: Arc<dyn NfsRpc>,
    iods: Option<Arc<IodPool>>,
    pages: Arc<dyn PageCache>,
    signals: Arc<dyn SignalSink>,
}

impl MountBuilder {
    /// Shares an existing worker pool. Without one, the mount gets its own
    /// pool with default settings.
    pub fn iods(mut self, pool: Arc<IodPool>) -> Self {
        self.iods = Some(pool);
        self
    }

    /// Connects the virtual-memory page cache.
    pub fn page_cache(mut self, pages: Arc<dyn PageCache>) -> Self {
        self.pages = pages;
        self
    }

    /// Replaces signal delivery.
    pub fn signals(mut self, signals: Arc<dyn SignalSink>) -> Self {
        self.signals = signals;
        self
    }

    /// Validates the configuration and creates the mount.
    pub fn build(self) -> Result<Arc<Mount>, ConfigError> {
        self.config.validate()?;
        let iods = match self.iods {
            Some(pool) => pool,
            None => IodPool::new(IodConfig::default())?,
        };
        let commit_limit = self
            .config
            .commit_iod_limit
            .unwrap_or(iods.config().max_iods / 2);
        let id = NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            mount = id,
            block_size = self.config.block_size,
            readahead = self.config.readahead,
            interruptible = self.config.interruptible,
            "Mount created"
        );
        Ok(Arc::new(Mount {
            id,
            config: self.config,
            rpc: self.rpc,
            cache: BufCache::new(),
            nodes: DashMap::new(),
            queue: MountQueue::new(),
            iods,
            pages: self.pages,
            signals: self.signals,
            verifier: Mutex::new(None),
            stats: BioStats::new(),
            commit_limit,
        }))
    }
}

impl Mount {
    /// Starts building a mount over `rpc`.
    pub fn builder(config: MountConfig, rpc: Arc<dyn NfsRpc>) -> MountBuilder {
        MountBuilder {
            config,
            rpc,
            iods: None,
            pages: Arc::new(NoopPageCache),
            signals: Arc::new(ProcessSignals),
        }
    }

    /// Mount identifier, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mount configuration.
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// I/O statistics.
    pub fn stats(&self) -> &BioStats {
        &self.stats
    }

    /// The buffer cache.
    pub fn cache(&self) -> &Arc<BufCache> {
        &self.cache
    }

    /// The async queue.
    pub fn queue(&self) -> &MountQueue {
        &self.queue
    }

    /// The worker pool.
    pub fn iods(&self) -> &Arc<IodPool> {
        &self.iods
    }

    /// The last write verifier seen from the server.
    pub fn write_verifier(&self) -> Option<WriteVerifier> {
        *self.verifier.lock()
    }

    /// Opens `file`, fetching its attributes.
    ///
    /// Re-opening a known file revalidates its cache against the server
    /// modification time.
    pub fn open(self: &Arc<Self>, file: FileId, ctx: &IoContext) -> BioResult<Arc<NfsNode>> {
        if let Some(node) = self.node(file) {
            self.validate_cache(&node, ctx)?;
            return Ok(node);
        }
        let attrs = self.rpc.getattr(file, &ctx.cred)?;
        let node = Arc::clone(
            self.nodes
                .entry(file)
                .or_insert_with(|| Arc::new(NfsNode::new(file, &attrs)))
                .value(),
        );
        debug!(mount = self.id, %file, kind = ?attrs.kind, size = attrs.size, "Opened file");
        Ok(node)
    }

    /// Client state of an opened file.
    pub fn node(&self, file: FileId) -> Option<Arc<NfsNode>> {
        self.nodes.get(&file).map(|entry| Arc::clone(entry.value()))
    }

    /// Flushes a modified file and reports its deferred write error once.
    pub fn close(self: &Arc<Self>, node: &NfsNode, ctx: &IoContext) -> BioResult<()> {
        if node.is_modified() {
            self.flush(node, FlushMode::Wait, ctx)?;
        }
        node.take_write_error().map_or(Ok(()), Err)
    }

    /// Starts writing back every file without waiting.
    ///
    /// Returns the first deferred write error encountered.
    pub fn sync(self: &Arc<Self>, ctx: &IoContext) -> BioResult<()> {
        let nodes: Vec<Arc<NfsNode>> = self
            .nodes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut first_error = None;
        for node in nodes {
            if let Err(e) = self.flush(&node, FlushMode::NoWait, ctx) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Blocks until `node` has no async write in flight.
    pub fn wait_for_writes(&self, node: &NfsNode, ctx: &IoContext) -> BioResult<()> {
        node.wait_for_writes(&self.waiter(ctx))
    }

    pub(crate) fn waiter<'a>(&self, ctx: &'a IoContext) -> Waiter<'a> {
        Waiter::new(
            self.config.interruptible,
            &ctx.cancel,
            self.config.interrupt_poll,
        )
    }
}

impl AsyncTarget for Mount {
    fn queue(&self) -> &MountQueue {
        &self.queue
    }

    fn run_async(&self, mut buf: BufHandle) {
        match self.node(buf.file()) {
            Some(node) => self.complete_async(&node, buf),
            None => {
                warn!(mount = self.id, file = %buf.file(), lbn = buf.lbn(), "Async I/O for unknown file, buffer left as is");
                buf.clear_async();
            }
        }
    }
}
