//! Per-mount I/O statistics.
//!
//! Lock-free counters updated on the hot paths, with a serializable
//! snapshot for reporting.
//!
//! ```
//! use nfsbio::stats::BioStats;
//!
//! let stats = BioStats::new();
//! stats.record_cache_hit();
//! stats.record_cache_miss();
//! assert!((stats.snapshot().hit_rate() - 0.5).abs() < f64::EPSILON);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Counters for one mount.
#[derive(Debug)]
pub struct BioStats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    readaheads: AtomicU64,
    read_rpcs: AtomicU64,
    bytes_read: AtomicU64,
    unstable_writes: AtomicU64,
    filesync_writes: AtomicU64,
    bytes_written: AtomicU64,
    commit_rpcs: AtomicU64,
    delayed_writes: AtomicU64,
    async_writes: AtomicU64,
    busy_rejections: AtomicU64,
    verifier_resets: AtomicU64,
    invalidations: AtomicU64,
    truncations: AtomicU64,
    started: Instant,
}

impl Default for BioStats {
    fn default() -> Self {
        Self {
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            readaheads: AtomicU64::new(0),
            read_rpcs: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            unstable_writes: AtomicU64::new(0),
            filesync_writes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            commit_rpcs: AtomicU64::new(0),
            delayed_writes: AtomicU64::new(0),
            async_writes: AtomicU64::new(0),
            busy_rejections: AtomicU64::new(0),
            verifier_resets: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            truncations: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl BioStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// A read found its block cached.
    #[inline]
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// A read had to fetch its block.
    #[inline]
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A read-ahead was queued.
    #[inline]
    pub fn record_readahead(&self) {
        self.readaheads.fetch_add(1, Ordering::Relaxed);
    }

    /// A read or readdir RPC returned `bytes`.
    #[inline]
    pub fn record_read_rpc(&self, bytes: usize) {
        self.read_rpcs.fetch_add(1, Ordering::Relaxed);
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A write RPC was sent.
    #[inline]
    pub fn record_write_rpc(&self, bytes: usize, filesync: bool) {
        if filesync {
            self.filesync_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unstable_writes.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A commit RPC was sent.
    #[inline]
    pub fn record_commit(&self) {
        self.commit_rpcs.fetch_add(1, Ordering::Relaxed);
    }

    /// A write was left as a delayed write.
    #[inline]
    pub fn record_delayed_write(&self) {
        self.delayed_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// A buffer was handed to the async path.
    #[inline]
    pub fn record_async_write(&self) {
        self.async_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// The dispatcher refused a buffer.
    #[inline]
    pub fn record_busy(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Commit promises were forgotten mount-wide.
    #[inline]
    pub fn record_verifier_reset(&self) {
        self.verifier_resets.fetch_add(1, Ordering::Relaxed);
    }

    /// A file's buffers were invalidated.
    #[inline]
    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// A file was shrunk.
    #[inline]
    pub fn record_truncation(&self) {
        self.truncations.fetch_add(1, Ordering::Relaxed);
    }

    /// Commit RPCs sent so far.
    pub fn commit_count(&self) -> u64 {
        self.commit_rpcs.load(Ordering::Relaxed)
    }

    /// Captures the current counter values.
    pub fn snapshot(&self) -> BioStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        BioStatsSnapshot {
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            readaheads: load(&self.readaheads),
            read_rpcs: load(&self.read_rpcs),
            bytes_read: load(&self.bytes_read),
            unstable_writes: load(&self.unstable_writes),
            filesync_writes: load(&self.filesync_writes),
            bytes_written: load(&self.bytes_written),
            commit_rpcs: load(&self.commit_rpcs),
            delayed_writes: load(&self.delayed_writes),
            async_writes: load(&self.async_writes),
            busy_rejections: load(&self.busy_rejections),
            verifier_resets: load(&self.verifier_resets),
            invalidations: load(&self.invalidations),
            truncations: load(&self.truncations),
            uptime: self.started.elapsed(),
        }
    }
}

/// Point-in-time copy of [`BioStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BioStatsSnapshot {
    /// Reads served from cache.
    pub cache_hits: u64,
    /// Reads that fetched from the server.
    pub cache_misses: u64,
    /// Read-aheads queued.
    pub readaheads: u64,
    /// Read and readdir RPCs.
    pub read_rpcs: u64,
    /// Bytes returned by read RPCs.
    pub bytes_read: u64,
    /// Unstable write RPCs.
    pub unstable_writes: u64,
    /// File-sync write RPCs.
    pub filesync_writes: u64,
    /// Bytes sent by write RPCs.
    pub bytes_written: u64,
    /// Commit RPCs.
    pub commit_rpcs: u64,
    /// Writes left delayed.
    pub delayed_writes: u64,
    /// Buffers written asynchronously.
    pub async_writes: u64,
    /// Dispatcher refusals.
    pub busy_rejections: u64,
    /// Mount-wide commit resets.
    pub verifier_resets: u64,
    /// File invalidations.
    pub invalidations: u64,
    /// Size reductions.
    pub truncations: u64,
    /// Time since the mount was created.
    #[serde(with = "humantime_serde")]
    pub uptime: Duration,
}

impl BioStatsSnapshot {
    /// Fraction of block lookups served from cache.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Total write RPCs.
    pub fn write_rpcs(&self) -> u64 {
        self.unstable_writes + self.filesync_writes
    }
}
