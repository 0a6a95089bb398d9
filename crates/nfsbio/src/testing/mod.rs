//! Testing utilities for driving the I/O layer without a network.
//!
//! - **Server**: [`MemServer`], an in-memory NFS server with reboot
//!   simulation, fault injection, a write gate and RPC accounting
//! - **Recorders**: [`RecordingSignals`] and [`RecordingPages`] capture
//!   what the layer tells the process and the page cache
//! - **Generators**: block-aware test data
//! - **Assertions**: content comparison with readable failures
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use nfsbio::{Credential, IoContext, Mount, MountConfig, WriteFlags};
//! use nfsbio::rpc::FileId;
//! use nfsbio::testing::{MemServer, random_bytes};
//!
//! let server = Arc::new(MemServer::new());
//! server.create_file(FileId(7), b"");
//! let mount = Mount::builder(MountConfig::default(), server.clone()).build().unwrap();
//! let ctx = IoContext::new(Credential::root());
//! let file = mount.open(FileId(7), &ctx).unwrap();
//!
//! let data = random_bytes(1000);
//! mount.write(&file, 0, &data, WriteFlags::default().sync(), &ctx).unwrap();
//! assert_eq!(server.stable_contents(FileId(7)), data);
//! ```

pub mod assertions;
pub mod generators;
pub mod server;

use nix::sys::signal::Signal;
use parking_lot::Mutex;

pub use assertions::{assert_bio_err, assert_bytes_equal};
pub use generators::{block_minus_one, block_plus_one, multi_block_content, patterned_blocks, random_bytes, random_range};
pub use server::{DIRENT_SIZE, MemServer, Op, RpcCounts, decode_dirents};

use crate::pages::PageCache;
use crate::rpc::FileId;
use crate::signal::SignalSink;

/// A [`SignalSink`] that records instead of signalling.
#[derive(Debug, Default)]
pub struct RecordingSignals {
    delivered: Mutex<Vec<(Option<i32>, Signal)>>,
}

impl RecordingSignals {
    /// Signals delivered so far, oldest first.
    pub fn delivered(&self) -> Vec<(Option<i32>, Signal)> {
        self.delivered.lock().clone()
    }
}

impl SignalSink for RecordingSignals {
    fn deliver(&self, pid: Option<i32>, signal: Signal) {
        self.delivered.lock().push((pid, signal));
    }
}

/// A [`PageCache`] that records extent changes.
#[derive(Debug, Default)]
pub struct RecordingPages {
    sizes: Mutex<Vec<(FileId, u64)>>,
}

impl RecordingPages {
    /// Every size notification, oldest first.
    pub fn sizes(&self) -> Vec<(FileId, u64)> {
        self.sizes.lock().clone()
    }

    /// The last size reported for `file`.
    pub fn last_size(&self, file: FileId) -> Option<u64> {
        self.sizes
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| *id == file)
            .map(|&(_, size)| size)
    }
}

impl PageCache for RecordingPages {
    fn set_size(&self, file: FileId, size: u64) {
        self.sizes.lock().push((file, size));
    }
}
