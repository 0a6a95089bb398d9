//! Mount and worker-pool configuration.
//!
//! Defaults follow common NFS client mount defaults: 32 KiB transfers, one
//! block of read-ahead, non-interruptible waits. Both structs deserialize
//! with `#[serde(default)]`, so partial config files are accepted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::buffer::DEV_BSIZE;

/// Default I/O block size (bytes per cached buffer).
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// Default directory block size.
pub const DEFAULT_DIR_BLOCK_SIZE: usize = 4096;

/// Size of the single buffer holding a symlink target.
pub const DEFAULT_SYMLINK_BUFFER_SIZE: usize = 1024;

/// Default maximum bytes per read or write RPC.
pub const DEFAULT_TRANSFER_SIZE: usize = 32 * 1024;

/// Default read-ahead depth in blocks.
pub const DEFAULT_READAHEAD: usize = 1;

/// Upper bound on read-ahead depth.
pub const MAX_READAHEAD: usize = 16;

/// Default global async worker budget.
pub const DEFAULT_MAX_IODS: usize = 20;

/// Default idle time after which a worker retires.
pub const DEFAULT_IOD_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default poll interval for interruptible waits.
pub const DEFAULT_INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Configuration rejected by [`MountConfig::validate`] or [`IodConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Block size must be a power of two and a multiple of the device block size.
    #[error("block size {0} must be a power of two and a multiple of 512")]
    BadBlockSize(usize),
    /// Transfer sizes must be non-zero.
    #[error("{0} must be non-zero")]
    ZeroTransferSize(&'static str),
    /// Polling intervals and timeouts must be non-zero.
    #[error("{0} must be non-zero")]
    ZeroDuration(&'static str),
    /// Read-ahead is capped.
    #[error("readahead {0} exceeds maximum of {MAX_READAHEAD}")]
    ReadaheadTooLarge(usize),
    /// The pool needs at least one worker.
    #[error("max_iods must be at least 1")]
    NoWorkers,
    /// `min_iods` cannot exceed `max_iods`.
    #[error("min_iods {min} exceeds max_iods {max}")]
    MinAboveMax {
        /// Configured floor.
        min: usize,
        /// Configured budget.
        max: usize,
    },
}

/// Per-mount configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Size of each cached regular-file buffer.
    ///
    /// Default: 32 KiB.
    pub block_size: usize,

    /// Size of each cached directory block.
    pub dir_block_size: usize,

    /// Size of the buffer holding a symlink target.
    pub symlink_buffer_size: usize,

    /// Maximum bytes requested per read RPC.
    pub rsize: usize,

    /// Maximum bytes sent per write RPC.
    pub wsize: usize,

    /// Number of blocks fetched asynchronously beyond the one being read.
    ///
    /// Default: 1. Zero disables read-ahead.
    pub readahead: usize,

    /// Whether blocking waits honour the caller's cancellation token.
    ///
    /// Mirrors the `intr` mount option. Non-interruptible mounts block
    /// unconditionally.
    pub interruptible: bool,

    /// How often an interruptible wait re-checks the cancellation token.
    #[serde(with = "humantime_serde")]
    pub interrupt_poll: Duration,

    /// Largest file offset the server accepts.
    pub max_file_size: u64,

    /// Attached-worker count at which bare-commit submissions are refused.
    ///
    /// `None` means half of the pool's `max_iods`.
    pub commit_iod_limit: Option<usize>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            dir_block_size: DEFAULT_DIR_BLOCK_SIZE,
            symlink_buffer_size: DEFAULT_SYMLINK_BUFFER_SIZE,
            rsize: DEFAULT_TRANSFER_SIZE,
            wsize: DEFAULT_TRANSFER_SIZE,
            readahead: DEFAULT_READAHEAD,
            interruptible: false,
            interrupt_poll: DEFAULT_INTERRUPT_POLL,
            max_file_size: i64::MAX as u64,
            commit_iod_limit: None,
        }
    }
}

impl MountConfig {
    /// Sets the buffer block size.
    #[must_use]
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the directory block size.
    #[must_use]
    pub fn dir_block_size(mut self, size: usize) -> Self {
        self.dir_block_size = size;
        self
    }

    /// Sets both RPC transfer sizes.
    #[must_use]
    pub fn transfer_size(mut self, size: usize) -> Self {
        self.rsize = size;
        self.wsize = size;
        self
    }

    /// Sets the read-ahead depth.
    #[must_use]
    pub fn readahead(mut self, blocks: usize) -> Self {
        self.readahead = blocks;
        self
    }

    /// Makes blocking waits interruptible.
    #[must_use]
    pub fn interruptible(mut self, intr: bool) -> Self {
        self.interruptible = intr;
        self
    }

    /// Sets how often interruptible waits check for cancellation.
    pub fn interrupt_poll(mut self, poll: Duration) -> Self {
        self.interrupt_poll = poll;
        self
    }

    /// Sets the server's maximum file size.
    #[must_use]
    pub fn max_file_size(mut self, size: u64) -> Self {
        self.max_file_size = size;
        self
    }

    /// Overrides the bare-commit rejection threshold.
    #[must_use]
    pub fn commit_iod_limit(mut self, limit: usize) -> Self {
        self.commit_iod_limit = Some(limit);
        self
    }

    /// Checks sizes for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for size in [self.block_size, self.dir_block_size] {
            if !size.is_power_of_two() || size as u64 % DEV_BSIZE != 0 {
                return Err(ConfigError::BadBlockSize(size));
            }
        }
        if self.rsize == 0 {
            return Err(ConfigError::ZeroTransferSize("rsize"));
        }
        if self.wsize == 0 {
            return Err(ConfigError::ZeroTransferSize("wsize"));
        }
        if self.symlink_buffer_size == 0 {
            return Err(ConfigError::ZeroTransferSize("symlink_buffer_size"));
        }
        if self.readahead > MAX_READAHEAD {
            return Err(ConfigError::ReadaheadTooLarge(self.readahead));
        }
        if self.interrupt_poll.is_zero() {
            return Err(ConfigError::ZeroDuration("interrupt_poll"));
        }
        Ok(())
    }
}

/// Configuration for the shared async worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IodConfig {
    /// Global cap on worker threads across all mounts.
    pub max_iods: usize,
    /// Workers are never retired below this count.
    pub min_iods: usize,
    /// An unassigned worker retires after this long.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for IodConfig {
    fn default() -> Self {
        Self {
            max_iods: DEFAULT_MAX_IODS,
            min_iods: 0,
            idle_timeout: DEFAULT_IOD_IDLE_TIMEOUT,
        }
    }
}

impl IodConfig {
    /// Sets the worker budget.
    #[must_use]
    pub fn max_iods(mut self, max: usize) -> Self {
        self.max_iods = max;
        self
    }

    /// Sets the retirement floor.
    #[must_use]
    pub fn min_iods(mut self, min: usize) -> Self {
        self.min_iods = min;
        self
    }

    /// Sets the idle retirement timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Bound on each mount's async queue.
    pub fn queue_bound(&self) -> usize {
        2 * self.max_iods
    }

    /// Checks the worker counts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iods == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.min_iods > self.max_iods {
            return Err(ConfigError::MinAboveMax {
                min: self.min_iods,
                max: self.max_iods,
            });
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("idle_timeout"));
        }
        Ok(())
    }
}
