//! RPC operations consumed by the I/O layer.
//!
//! Encoding and transport live elsewhere; implementors map their wire
//! errors onto [`BioError`](crate::BioError). In particular a server-side
//! bad readdir cookie must surface as `BadDirectoryCookie`, and an
//! interrupted or timed-out call as `Interrupted` / `TimedOut`.

use std::fmt;
use std::time::SystemTime;

use crate::context::Credential;
use crate::error::BioResult;

/// Opaque file identity (a file handle digest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Kind of file, which selects the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Durability requested for, or granted to, a write.
///
/// Ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StableHow {
    /// Accepted without durability; needs a later Commit.
    Unstable,
    /// Data durable, metadata may not be.
    DataSync,
    /// Data and metadata durable on reply.
    FileSync,
}

/// Server instance cookie returned by writes and commits.
///
/// Changes whenever the server restarts and may have lost unstable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteVerifier(pub u64);

/// Position cookie for continuing a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DirCookie(pub u64);

impl DirCookie {
    /// Cookie for the start of a directory.
    pub const START: DirCookie = DirCookie(0);
}

/// File attributes as far as this layer cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attributes {
    /// File kind.
    pub kind: FileKind,
    /// Size in bytes.
    pub size: u64,
    /// Server modification time.
    pub mtime: SystemTime,
}

/// Reply to a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReply {
    /// Bytes placed at the start of the caller's buffer.
    pub count: usize,
    /// The read reached end of file.
    pub eof: bool,
}

/// Reply to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReply {
    /// Bytes accepted.
    pub count: usize,
    /// Durability the server actually granted.
    pub committed: StableHow,
    /// Server instance verifier.
    pub verifier: WriteVerifier,
    /// Post-operation modification time, when the server returned it.
    pub mtime: Option<SystemTime>,
}

/// Reply to a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReply {
    /// Server instance verifier.
    pub verifier: WriteVerifier,
    /// Post-operation modification time, when the server returned it.
    pub mtime: Option<SystemTime>,
}

/// Reply to a readdir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDirReply {
    /// Bytes of encoded entries placed in the caller's buffer.
    pub count: usize,
    /// Cookie to continue after the returned entries.
    pub next_cookie: DirCookie,
    /// No entries remain after these.
    pub eof: bool,
}

/// The NFS RPC operations this layer issues.
pub trait NfsRpc: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`.
    fn read(
        &self,
        file: FileId,
        offset: u64,
        buf: &mut [u8],
        cred: &Credential,
    ) -> BioResult<ReadReply>;

    /// Writes `data` at `offset` with the requested durability.
    fn write(
        &self,
        file: FileId,
        offset: u64,
        data: &[u8],
        stable: StableHow,
        cred: &Credential,
    ) -> BioResult<WriteReply>;

    /// Makes previously unstable writes in `[offset, offset + count)` durable.
    fn commit(
        &self,
        file: FileId,
        offset: u64,
        count: u64,
        cred: &Credential,
    ) -> BioResult<CommitReply>;

    /// Reads directory entries starting at `cookie` into `buf`.
    fn readdir(
        &self,
        dir: FileId,
        cookie: DirCookie,
        buf: &mut [u8],
        cred: &Credential,
    ) -> BioResult<ReadDirReply>;

    /// Reads a symlink target into `buf`, returning its length.
    fn readlink(&self, link: FileId, buf: &mut [u8], cred: &Credential) -> BioResult<usize>;

    /// Fetches attributes.
    fn getattr(&self, file: FileId, cred: &Credential) -> BioResult<Attributes>;
}
