//! Per-file client state.
//!
//! Size, modification time and the flags below are guarded by one mutex
//! with a paired condition variable, on which invalidation waiters sleep.
//! Async writes in flight are counted separately so their completion does
//! not depend on finding the file again.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{BioError, BioResult};
use crate::rpc::{Attributes, DirCookie, FileId, FileKind};
use crate::sync::{InFlight, InFlightGuard, RangeLock, Waiter};

/// Mutable part of [`NfsNode`].
#[derive(Debug)]
pub(crate) struct NodeState {
    /// Cached file size (`n_size`).
    pub size: u64,
    /// Server modification time seen at the last validation.
    pub mtime: Option<SystemTime>,
    /// Local modifications exist that the server may not have.
    pub modified: bool,
    /// Deferred hard write error, surfaced once.
    pub write_error: Option<BioError>,
    /// An invalidation is running.
    pub flush_in_progress: bool,
    /// Someone waits for the running invalidation.
    pub flush_want: bool,
    /// Byte offset of end-of-directory, once seen.
    pub dir_eof: Option<u64>,
    /// `dir_cookies[n]` continues the listing at directory block `n`.
    pub dir_cookies: Vec<DirCookie>,
}

/// Client state for one file.
#[derive(Debug)]
pub struct NfsNode {
    id: FileId,
    kind: FileKind,
    pub(crate) state: Mutex<NodeState>,
    pub(crate) cv: Condvar,
    pub(crate) rslock: RangeLock,
    writes: Arc<InFlight>,
}

impl NfsNode {
    /// Creates state for a file from its first attributes.
    pub fn new(id: FileId, attrs: &Attributes) -> Self {
        Self {
            id,
            kind: attrs.kind,
            state: Mutex::new(NodeState {
                size: attrs.size,
                mtime: Some(attrs.mtime),
                modified: false,
                write_error: None,
                flush_in_progress: false,
                flush_want: false,
                dir_eof: None,
                dir_cookies: vec![DirCookie::START],
            }),
            cv: Condvar::new(),
            rslock: RangeLock::new(),
            writes: InFlight::new(),
        }
    }

    /// File identity.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// File kind.
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Cached size.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Cached server modification time.
    pub fn mtime(&self) -> Option<SystemTime> {
        self.state.lock().mtime
    }

    /// Whether local modifications exist.
    pub fn is_modified(&self) -> bool {
        self.state.lock().modified
    }

    /// Whether a hard write error is waiting to be reported.
    pub fn has_write_error(&self) -> bool {
        self.state.lock().write_error.is_some()
    }

    /// Async writes in flight.
    pub fn outstanding_writes(&self) -> usize {
        self.writes.count()
    }

    /// Remembered end-of-directory offset.
    pub fn dir_eof(&self) -> Option<u64> {
        self.state.lock().dir_eof
    }

    /// Whether the range lock is currently held.
    pub fn is_range_locked(&self) -> bool {
        self.rslock.is_held()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock()
    }

    /// Applies a fresh attribute reply. A modified file never shrinks.
    pub(crate) fn load_attrs(&self, attrs: &Attributes) {
        let mut st = self.state.lock();
        if !st.modified || attrs.size > st.size {
            st.size = attrs.size;
        }
    }

    pub(crate) fn set_mtime(&self, mtime: SystemTime) {
        self.state.lock().mtime = Some(mtime);
    }

    /// Grows the cached size to `end` if smaller and marks the file
    /// modified. Returns the new size when it changed.
    pub(crate) fn extend(&self, end: u64) -> Option<u64> {
        let mut st = self.state.lock();
        st.modified = true;
        if end > st.size {
            st.size = end;
            Some(end)
        } else {
            None
        }
    }

    pub(crate) fn set_modified(&self) {
        self.state.lock().modified = true;
    }

    /// Replaces the cached size, returning the old one.
    pub(crate) fn replace_size(&self, size: u64) -> u64 {
        std::mem::replace(&mut self.state.lock().size, size)
    }

    pub(crate) fn record_write_error(&self, error: BioError) {
        let mut st = self.state.lock();
        if st.write_error.is_none() {
            st.write_error = Some(error);
        }
    }

    /// Takes the deferred write error; it is reported exactly once.
    pub(crate) fn take_write_error(&self) -> Option<BioError> {
        self.state.lock().write_error.take()
    }

    /// Forgets directory positions (`invaldir`).
    pub(crate) fn invalidate_dir(&self) {
        let mut st = self.state.lock();
        st.dir_eof = None;
        st.dir_cookies.clear();
        st.dir_cookies.push(DirCookie::START);
    }

    /// Cookie continuing the listing at block `lbn`, if known.
    pub(crate) fn dir_cookie(&self, lbn: u64) -> Option<DirCookie> {
        let st = self.state.lock();
        usize::try_from(lbn)
            .ok()
            .and_then(|idx| st.dir_cookies.get(idx).copied())
    }

    /// Records the cookie for the block after `lbn`.
    pub(crate) fn record_dir_cookie(&self, lbn: u64, next: DirCookie) {
        let Ok(idx) = usize::try_from(lbn + 1) else {
            return;
        };
        let mut st = self.state.lock();
        if st.dir_cookies.len() >= idx {
            st.dir_cookies.truncate(idx);
            st.dir_cookies.push(next);
        }
    }

    pub(crate) fn set_dir_eof(&self, offset: u64) {
        self.state.lock().dir_eof = Some(offset);
    }

    /// Counts an async write until the returned guard is dropped.
    pub(crate) fn begin_write(&self) -> InFlightGuard {
        self.writes.begin()
    }

    /// Blocks until no async write is in flight.
    pub(crate) fn wait_for_writes(&self, waiter: &Waiter<'_>) -> BioResult<()> {
        self.writes.wait_idle(waiter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn node(size: u64) -> NfsNode {
        NfsNode::new(
            FileId(1),
            &Attributes {
                kind: FileKind::Regular,
                size,
                mtime: SystemTime::UNIX_EPOCH,
            },
        )
    }

    fn attrs(size: u64) -> Attributes {
        Attributes {
            kind: FileKind::Regular,
            size,
            mtime: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_modified_file_never_shrinks() {
        let n = node(100);
        n.load_attrs(&attrs(50));
        assert_eq!(n.size(), 50);

        n.extend(200);
        assert!(n.is_modified());
        n.load_attrs(&attrs(10));
        assert_eq!(n.size(), 200);
        n.load_attrs(&attrs(300));
        assert_eq!(n.size(), 300);
    }

    #[test]
    fn test_extend_reports_growth_only() {
        let n = node(100);
        assert_eq!(n.extend(50), None);
        assert_eq!(n.extend(150), Some(150));
        assert!(n.is_modified());
    }

    #[test]
    fn test_write_error_reported_once() {
        let n = node(0);
        n.record_write_error(BioError::Server(libc::ENOSPC));
        n.record_write_error(BioError::Server(libc::EIO));
        assert!(n.has_write_error());
        assert_eq!(n.take_write_error(), Some(BioError::Server(libc::ENOSPC)));
        assert_eq!(n.take_write_error(), None);
    }

    #[test]
    fn test_dir_cookies() {
        let n = node(0);
        assert_eq!(n.dir_cookie(0), Some(DirCookie::START));
        assert_eq!(n.dir_cookie(1), None);
        n.record_dir_cookie(0, DirCookie(10));
        n.record_dir_cookie(1, DirCookie(20));
        assert_eq!(n.dir_cookie(2), Some(DirCookie(20)));

        // Re-reading an earlier block forgets later positions
        n.record_dir_cookie(0, DirCookie(11));
        assert_eq!(n.dir_cookie(1), Some(DirCookie(11)));
        assert_eq!(n.dir_cookie(2), None);

        n.set_dir_eof(4096);
        n.invalidate_dir();
        assert_eq!(n.dir_eof(), None);
        assert_eq!(n.dir_cookie(1), None);
    }

    #[test]
    fn test_wait_for_writes() {
        let n = Arc::new(node(0));
        let writes = vec![n.begin_write(), n.begin_write()];
        assert_eq!(n.outstanding_writes(), 2);

        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            drop(writes);
        });

        n.wait_for_writes(&Waiter::uninterruptible()).unwrap();
        assert_eq!(n.outstanding_writes(), 0);
        finisher.join().unwrap();
    }
}
