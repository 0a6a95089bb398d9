//! Shared setup for the integration tests.

#![allow(dead_code)] // Each test binary uses a different subset

use std::sync::{Arc, Once};

use nfsbio::rpc::FileId;
use nfsbio::testing::{MemServer, RecordingPages, RecordingSignals};
use nfsbio::{Credential, IoContext, IodConfig, IodPool, Mount, MountConfig, NfsNode};

pub const BLOCK: usize = 4096;
pub const FILE: FileId = FileId(1);
pub const DIR: FileId = FileId(2);

static TRACING: Once = Once::new();

/// Routes `tracing` output to the test writer when `RUST_LOG` is set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        if std::env::var_os("RUST_LOG").is_some() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        }
    });
}

/// Default mount settings for the tests: 4 KiB blocks, no read-ahead.
pub fn test_config() -> MountConfig {
    MountConfig::default().block_size(BLOCK).readahead(0)
}

pub fn user_ctx() -> IoContext {
    IoContext::new(Credential::new(1000, 1000))
}

/// A mount over an in-memory server, with recorders for signals and
/// page cache notifications.
pub struct Harness {
    pub server: Arc<MemServer>,
    pub mount: Arc<Mount>,
    pub signals: Arc<RecordingSignals>,
    pub pages: Arc<RecordingPages>,
    pub ctx: IoContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MountConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_iods(config: MountConfig, iods: IodConfig) -> Self {
        Self::build(config, Some(IodPool::new(iods).unwrap()))
    }

    fn build(config: MountConfig, pool: Option<Arc<IodPool>>) -> Self {
        init_tracing();
        let server = Arc::new(MemServer::new());
        let signals = Arc::new(RecordingSignals::default());
        let pages = Arc::new(RecordingPages::default());
        let mut builder = Mount::builder(config, server.clone())
            .signals(signals.clone())
            .page_cache(pages.clone());
        if let Some(pool) = pool {
            builder = builder.iods(pool);
        }
        Self {
            server,
            mount: builder.build().unwrap(),
            signals,
            pages,
            ctx: user_ctx(),
        }
    }

    /// Creates `FILE` with `contents` on the server and opens it.
    pub fn file(&self, contents: &[u8]) -> Arc<NfsNode> {
        self.server.create_file(FILE, contents);
        self.mount.open(FILE, &self.ctx).unwrap()
    }

    /// Reads `len` bytes at `offset`, returning what was copied out.
    pub fn read(&self, node: &NfsNode, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let n = self.mount.read(node, offset, &mut out, &self.ctx).unwrap();
        out.truncate(n);
        out
    }
}
