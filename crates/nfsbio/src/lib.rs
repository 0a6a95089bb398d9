//! Buffered I/O and write-back consistency for NFS clients.
//!
//! This crate sits between file operations and the NFS RPC layer. It maps
//! file byte ranges onto cached block buffers, decides when to read ahead
//! and when to delay or force writes, and keeps the local dirty cache
//! consistent with a server that may crash, lose unstable data, or change
//! files behind the client's back.
//!
//! # Components
//!
//! - [`Mount`] - per-export state and the entry points: [`Mount::read`],
//!   [`Mount::write`], [`Mount::flush`], [`Mount::invalidate`],
//!   [`Mount::set_size`], [`Mount::async_submit`], and the page adapter
//!   ([`Mount::load_pages`], [`Mount::store_pages`])
//! - [`buffer::Buffer`] / [`cache::BufCache`] - cached blocks and exclusive
//!   ownership through [`cache::BufHandle`]
//! - [`node::NfsNode`] - per-file size, modification time, flags and the
//!   range lock
//! - [`iod::IodPool`] - background workers serving bounded per-mount queues
//! - [`rpc::NfsRpc`] - the RPC operations consumed from the transport
//!
//! # Write-back model
//!
//! A write lands in a buffer's single dirty range. Completing a block
//! sends it asynchronously as an *unstable* write; the server acknowledges
//! it without durability and the buffer then waits for a *commit*. A
//! flush commits everything in as few RPCs as possible. If the server
//! restarts in between (its write verifier changes), every commit promise
//! on the mount is forgotten and the data is written again in full.
//!
//! Hard write errors are not lost: they are recorded on the file and
//! reported by the next [`Mount::flush`] or [`Mount::close`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use nfsbio::{Credential, FlushMode, IoContext, Mount, MountConfig, WriteFlags};
//! use nfsbio::rpc::FileId;
//! use nfsbio::testing::MemServer;
//!
//! let server = Arc::new(MemServer::new());
//! server.create_file(FileId(1), b"");
//! let mount = Mount::builder(MountConfig::default(), server.clone()).build()?;
//! let ctx = IoContext::new(Credential::new(1000, 1000));
//!
//! let file = mount.open(FileId(1), &ctx)?;
//! mount.write(&file, 0, b"hello world", WriteFlags::default(), &ctx)?;
//! mount.flush(&file, FlushMode::Wait, &ctx)?;
//! assert_eq!(server.stable_contents(FileId(1)), b"hello world");
//!
//! let mut out = [0u8; 5];
//! assert_eq!(mount.read(&file, 6, &mut out, &ctx)?, 5);
//! assert_eq!(&out, b"world");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]

pub mod bio;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod iod;
pub mod mount;
pub mod node;
pub mod pages;
pub mod rpc;
pub mod signal;
pub mod stats;
pub mod sync;
pub mod testing;

pub use bio::{FlushMode, InvalidatePolicy, WriteFlags};
pub use buffer::{BufState, Buffer};
pub use cache::{BufCache, BufHandle};
pub use config::{ConfigError, IodConfig, MountConfig};
pub use context::{CancelToken, Credential, IoContext};
pub use error::{BioError, BioResult};
pub use iod::{IodPool, SubmitError};
pub use mount::{Mount, MountBuilder};
pub use node::NfsNode;
pub use pages::{Page, PageCache, PageSet};
pub use stats::{BioStats, BioStatsSnapshot};
