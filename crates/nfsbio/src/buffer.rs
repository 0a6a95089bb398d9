//! Cached region for one logical block of one file.
//!
//! A buffer's primary lifecycle is a [`BufState`]; two orthogonal
//! capabilities ([`BufCaps`]) ride alongside it. The dirty range is a single
//! contiguous interval `[dirty_off, dirty_end)`: writes that would leave a
//! gap force a flush first, so one commit range always describes a buffer.
//!
//! ```text
//!   Empty ──read──▶ Clean ◀──────────────────────────┐
//!     │               │ write                         │ file-sync write / commit
//!     └──whole-block──┴──────▶ Dirty ──unstable──▶ NeedsCommit
//!                              ▲                      │
//!                              └───verifier lost──────┘
//! ```

use std::ops::Range;

use crate::context::Credential;
use crate::error::BioError;
use crate::rpc::{FileId, WriteVerifier};

/// Device block size used for buffer addresses.
pub const DEV_BSIZE: u64 = 512;

/// Primary lifecycle state of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufState {
    /// Contents are not valid and must be read before use.
    #[default]
    Empty,
    /// Contents match what the server holds.
    Clean,
    /// Contents are valid and the dirty range awaits a write (delayed write).
    Dirty,
    /// The dirty range was written unstably and awaits a Commit.
    NeedsCommit,
    /// Discarded; released buffers in this state leave the cache.
    Invalid,
}

/// Capabilities that are independent of the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufCaps {
    /// The whole buffer was written unstably, so its commit may be clustered.
    pub clusterable: bool,
    /// The last synchronous I/O on this buffer was interrupted.
    pub interrupted: bool,
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCmd {
    /// Fill the buffer from the server.
    Read,
    /// Push the dirty range (or commit it) to the server.
    Write,
}

/// Flag view of a buffer, for observers that think in flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct BufFlags {
    /// Contents valid.
    pub cached: bool,
    /// Dirty data not yet durable on the server.
    pub delayed_write: bool,
    /// Awaiting a Commit.
    pub needs_commit: bool,
    /// Commit may be clustered with neighbours.
    pub clusterable: bool,
    /// I/O in flight.
    pub in_progress: bool,
    /// Discarded.
    pub invalid: bool,
    /// Last synchronous I/O was interrupted.
    pub interrupted: bool,
}

/// One cached block.
#[derive(Debug, Default)]
pub struct Buffer {
    file: FileId,
    lbn: u64,
    blkno: u64,
    data: Vec<u8>,
    dirty_off: usize,
    dirty_end: usize,
    resid: usize,
    state: BufState,
    commit_verifier: Option<WriteVerifier>,
    caps: BufCaps,
    error: Option<BioError>,
    cred: Option<Credential>,
    async_cmd: Option<IoCmd>,
    no_cache: bool,
    in_progress: bool,
}

impl Buffer {
    /// Creates an empty buffer of `size` zeroed bytes.
    ///
    /// `blkno` is the device address in [`DEV_BSIZE`] units.
    pub fn new(file: FileId, lbn: u64, blkno: u64, size: usize) -> Self {
        Self {
            file,
            lbn,
            blkno,
            data: vec![0; size],
            dirty_off: 0,
            dirty_end: 0,
            resid: 0,
            state: BufState::Empty,
            commit_verifier: None,
            caps: BufCaps::default(),
            error: None,
            cred: None,
            async_cmd: None,
            no_cache: false,
            in_progress: false,
        }
    }

    /// Owning file.
    pub fn file(&self) -> FileId {
        self.file
    }

    /// Logical block number.
    pub fn lbn(&self) -> u64 {
        self.lbn
    }

    /// Device address in [`DEV_BSIZE`] units.
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    /// File byte offset of the first byte of the buffer.
    pub fn offset(&self) -> u64 {
        self.blkno * DEV_BSIZE
    }

    /// Current capacity in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Buffer contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable buffer contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Bytes at the end of the buffer that the last read did not fill.
    pub fn resid(&self) -> usize {
        self.resid
    }

    pub(crate) fn set_resid(&mut self, resid: usize) {
        self.resid = resid.min(self.data.len());
    }

    /// Bytes holding meaningful data.
    pub fn filled(&self) -> usize {
        self.data.len() - self.resid
    }

    /// Lifecycle state.
    pub fn state(&self) -> BufState {
        self.state
    }

    /// Capability set.
    pub fn caps(&self) -> BufCaps {
        self.caps
    }

    /// Hard error from the last I/O, if any.
    pub fn error(&self) -> Option<&BioError> {
        self.error.as_ref()
    }

    /// Credential recorded for pending I/O.
    pub fn cred(&self) -> Option<Credential> {
        self.cred
    }

    pub(crate) fn set_cred(&mut self, cred: Credential) {
        self.cred = Some(cred);
    }

    /// Contents are valid (whether or not they are also dirty).
    pub fn is_cached(&self) -> bool {
        matches!(
            self.state,
            BufState::Clean | BufState::Dirty | BufState::NeedsCommit
        )
    }

    /// The buffer holds data the server has not durably acknowledged.
    pub fn is_dirty(&self) -> bool {
        matches!(self.state, BufState::Dirty | BufState::NeedsCommit)
    }

    /// The dirty range only needs a Commit.
    pub fn needs_commit(&self) -> bool {
        self.state == BufState::NeedsCommit
    }

    /// Verifier of the server instance holding the uncommitted range.
    pub fn commit_verifier(&self) -> Option<WriteVerifier> {
        self.commit_verifier
    }

    /// Whether the buffer was discarded.
    pub fn is_invalid(&self) -> bool {
        self.state == BufState::Invalid
    }

    /// Dirty byte range within the buffer.
    pub fn dirty_range(&self) -> Range<usize> {
        self.dirty_off..self.dirty_end
    }

    /// Whether there is a non-empty dirty range.
    pub fn has_dirty_range(&self) -> bool {
        self.dirty_end > self.dirty_off
    }

    /// File byte range covered by the dirty range.
    pub fn dirty_file_range(&self) -> Range<u64> {
        let base = self.offset();
        base + self.dirty_off as u64..base + self.dirty_end as u64
    }

    /// Pending async command, if the buffer is queued or in flight as async I/O.
    pub fn async_cmd(&self) -> Option<IoCmd> {
        self.async_cmd
    }

    /// Whether the buffer is doing async I/O.
    pub fn is_async(&self) -> bool {
        self.async_cmd.is_some()
    }

    pub(crate) fn set_async(&mut self, cmd: IoCmd) {
        self.async_cmd = Some(cmd);
    }

    pub(crate) fn clear_async(&mut self) -> Option<IoCmd> {
        self.async_cmd.take()
    }

    /// Whether the buffer should leave the cache once written.
    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    pub(crate) fn set_no_cache(&mut self) {
        self.no_cache = true;
    }

    pub(crate) fn set_in_progress(&mut self, in_progress: bool) {
        self.in_progress = in_progress;
    }

    /// Flag view of the buffer.
    pub fn flags(&self) -> BufFlags {
        BufFlags {
            cached: self.is_cached(),
            delayed_write: self.is_dirty(),
            needs_commit: self.needs_commit(),
            clusterable: self.caps.clusterable,
            in_progress: self.in_progress,
            invalid: self.is_invalid(),
            interrupted: self.caps.interrupted,
        }
    }

    /// A buffer that only needs a Commit RPC to become clean.
    pub fn is_commit_only(&self) -> bool {
        self.async_cmd == Some(IoCmd::Write) && self.needs_commit()
    }

    /// Resizes the buffer.
    ///
    /// Growing zero-fills the new tail. Growing a clean buffer invalidates
    /// its contents, since the server may hold data past the old end; dirty
    /// buffers keep their state. Shrinking clips the dirty range.
    pub fn resize(&mut self, size: usize) {
        let old = self.data.len();
        if size == old {
            return;
        }
        self.data.resize(size, 0);
        if size > old {
            if self.state == BufState::Clean {
                self.state = BufState::Empty;
            }
        } else {
            self.resid = self.resid.min(size);
            self.clip_dirty(size);
        }
    }

    /// Grows the buffer for an append, keeping whatever validity it had.
    pub(crate) fn grow_for_append(&mut self, size: usize) {
        if size > self.data.len() {
            self.data.resize(size, 0);
        }
    }

    /// Clips the dirty range to `limit` bytes, returning whether anything changed.
    pub(crate) fn clip_dirty(&mut self, limit: usize) -> bool {
        let mut changed = false;
        if self.dirty_end > limit {
            self.dirty_end = limit;
            changed = true;
        }
        if self.dirty_off > limit {
            self.dirty_off = limit;
            changed = true;
        }
        if self.dirty_off >= self.dirty_end {
            self.dirty_off = 0;
            self.dirty_end = 0;
        }
        changed
    }

    /// Whether writing `[on, on + n)` keeps the dirty range contiguous.
    pub fn dirty_abuts(&self, on: usize, n: usize) -> bool {
        !self.has_dirty_range() || (on <= self.dirty_end && on + n >= self.dirty_off)
    }

    /// Marks the contents valid without I/O (read completed, or about to be
    /// fully overwritten).
    pub(crate) fn mark_cached(&mut self) {
        if matches!(self.state, BufState::Empty | BufState::Invalid) {
            self.state = BufState::Clean;
        }
        self.error = None;
    }

    /// Copies `data` in at `on` and merges it into the dirty range.
    ///
    /// Any earlier commit promise is void: the buffer must be rewritten.
    pub(crate) fn copy_in(&mut self, on: usize, data: &[u8]) {
        let end = on + data.len();
        assert!(end <= self.data.len(), "write past buffer end");
        assert!(self.dirty_abuts(on, data.len()), "sparse dirty range");
        self.data[on..end].copy_from_slice(data);
        if data.is_empty() {
            return;
        }
        if self.has_dirty_range() {
            self.dirty_off = self.dirty_off.min(on);
            self.dirty_end = self.dirty_end.max(end);
        } else {
            self.dirty_off = on;
            self.dirty_end = end;
        }
        self.caps.clusterable = false;
        self.state = BufState::Dirty;
        self.commit_verifier = None;
        self.check_invariants();
    }

    /// Marks as a delayed write.
    pub(crate) fn mark_delayed_write(&mut self) {
        if self.state != BufState::NeedsCommit {
            self.state = BufState::Dirty;
        }
    }

    /// The server holds the dirty range durably.
    pub(crate) fn mark_clean(&mut self) {
        self.state = BufState::Clean;
        self.commit_verifier = None;
        self.dirty_off = 0;
        self.dirty_end = 0;
        self.caps = BufCaps::default();
        self.error = None;
    }

    /// The dirty range was accepted unstably by the server instance
    /// identified by `verifier`.
    pub(crate) fn mark_needs_commit(&mut self, verifier: WriteVerifier) {
        self.state = BufState::NeedsCommit;
        self.commit_verifier = Some(verifier);
        self.caps.clusterable = self.dirty_off == 0 && self.dirty_end == self.data.len();
        self.caps.interrupted = false;
    }

    /// Forgets a commit promise; the dirty range must be resent in full.
    pub(crate) fn forget_commit(&mut self) {
        if self.state == BufState::NeedsCommit {
            self.state = BufState::Dirty;
        }
        self.commit_verifier = None;
        self.caps.clusterable = false;
    }

    /// Interrupted synchronous I/O: the data stays dirty.
    pub(crate) fn mark_interrupted(&mut self) {
        self.caps.interrupted = true;
    }

    /// Discards the buffer, optionally recording the error that killed it.
    pub(crate) fn invalidate(&mut self, error: Option<BioError>) {
        self.state = BufState::Invalid;
        self.commit_verifier = None;
        self.dirty_off = 0;
        self.dirty_end = 0;
        self.caps.clusterable = false;
        self.error = error;
    }

    /// Asserts `dirty_off <= dirty_end <= len`.
    pub fn check_invariants(&self) {
        assert!(
            self.dirty_off <= self.dirty_end && self.dirty_end <= self.data.len(),
            "dirty range {}..{} outside buffer of {} bytes",
            self.dirty_off,
            self.dirty_end,
            self.data.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(size: usize) -> Buffer {
        Buffer::new(FileId(1), 0, 0, size)
    }

    #[test]
    fn test_new_buffer_is_empty_state() {
        let b = buf(4096);
        assert_eq!(b.state(), BufState::Empty);
        assert!(!b.is_cached());
        assert!(!b.is_dirty());
        assert_eq!(b.dirty_range(), 0..0);
        assert_eq!(b.len(), 4096);
    }

    #[test]
    fn test_offset_from_blkno() {
        let b = Buffer::new(FileId(1), 3, 3 * 8, 4096);
        assert_eq!(b.offset(), 3 * 4096);
    }

    #[test]
    fn test_copy_in_merges_dirty_range() {
        let mut b = buf(4096);
        b.mark_cached();
        b.copy_in(5, &[1; 10]);
        assert_eq!(b.dirty_range(), 5..15);
        b.copy_in(15, &[2; 5]);
        assert_eq!(b.dirty_range(), 5..20);
        b.copy_in(0, &[3; 5]);
        assert_eq!(b.dirty_range(), 0..20);
        assert_eq!(b.state(), BufState::Dirty);
    }

    #[test]
    fn test_dirty_abuts() {
        let mut b = buf(100);
        b.mark_cached();
        assert!(b.dirty_abuts(50, 10));
        b.copy_in(10, &[0; 10]);
        assert!(b.dirty_abuts(20, 5)); // touching the end
        assert!(b.dirty_abuts(5, 5)); // touching the start
        assert!(b.dirty_abuts(12, 2)); // inside
        assert!(!b.dirty_abuts(21, 5));
        assert!(!b.dirty_abuts(0, 4));
    }

    #[test]
    #[should_panic(expected = "sparse dirty range")]
    fn test_copy_in_rejects_sparse() {
        let mut b = buf(100);
        b.copy_in(0, &[0; 10]);
        b.copy_in(50, &[0; 10]);
    }

    #[test]
    fn test_write_voids_commit_promise() {
        let mut b = buf(100);
        b.copy_in(0, &[0; 100]);
        b.mark_needs_commit(WriteVerifier(1));
        assert!(b.caps().clusterable);
        b.copy_in(0, &[1; 10]);
        assert_eq!(b.state(), BufState::Dirty);
        assert!(!b.caps().clusterable);
        assert_eq!(b.commit_verifier(), None);
    }

    #[test]
    fn test_needs_commit_clusterable_only_when_full() {
        let mut b = buf(100);
        b.copy_in(0, &[0; 50]);
        b.mark_needs_commit(WriteVerifier(1));
        assert!(b.needs_commit());
        assert!(!b.caps().clusterable);
    }

    #[test]
    fn test_forget_commit_returns_to_dirty() {
        let mut b = buf(100);
        b.copy_in(0, &[0; 100]);
        b.mark_needs_commit(WriteVerifier(7));
        assert_eq!(b.commit_verifier(), Some(WriteVerifier(7)));
        b.forget_commit();
        assert_eq!(b.state(), BufState::Dirty);
        assert_eq!(b.commit_verifier(), None);
        assert_eq!(b.dirty_range(), 0..100);
        assert!(!b.caps().clusterable);
    }

    #[test]
    fn test_mark_clean_clears_dirty() {
        let mut b = buf(100);
        b.copy_in(10, &[0; 10]);
        b.mark_clean();
        assert_eq!(b.state(), BufState::Clean);
        assert!(!b.has_dirty_range());
        assert!(b.is_cached());
    }

    #[test]
    fn test_resize_shrink_clips_dirty() {
        let mut b = buf(100);
        b.copy_in(40, &[0; 40]);
        b.resize(60);
        assert_eq!(b.dirty_range(), 40..60);
        b.resize(30);
        assert_eq!(b.dirty_range(), 0..0);
        b.check_invariants();
    }

    #[test]
    fn test_resize_grow_invalidates_clean_only() {
        let mut clean = buf(10);
        clean.mark_cached();
        clean.resize(20);
        assert_eq!(clean.state(), BufState::Empty);

        let mut dirty = buf(10);
        dirty.copy_in(0, &[7; 10]);
        dirty.resize(20);
        assert_eq!(dirty.state(), BufState::Dirty);
        assert_eq!(&dirty.data()[..10], &[7; 10]);
        assert_eq!(&dirty.data()[10..], &[0; 10]);
    }

    #[test]
    fn test_grow_for_append_preserves_state() {
        let mut b = buf(0);
        b.mark_cached();
        b.grow_for_append(100);
        assert_eq!(b.state(), BufState::Clean);
        assert_eq!(b.len(), 100);
    }

    #[test]
    fn test_invalidate_drops_dirty_data() {
        let mut b = buf(100);
        b.copy_in(0, &[0; 10]);
        b.invalidate(Some(BioError::Server(libc::EIO)));
        assert!(b.is_invalid());
        assert!(!b.is_dirty());
        assert_eq!(b.error(), Some(&BioError::Server(libc::EIO)));
    }

    #[test]
    fn test_flags_view() {
        let mut b = buf(100);
        b.copy_in(0, &[0; 100]);
        b.mark_needs_commit(WriteVerifier(1));
        let flags = b.flags();
        assert!(flags.cached);
        assert!(flags.delayed_write);
        assert!(flags.needs_commit);
        assert!(flags.clusterable);
        assert!(!flags.invalid);
    }
}

/// Property-based tests using proptest.
#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Random write/flush/shrink sequences never break the dirty-range invariant,
        /// and the contents always match a reference copy.
        #[test]
        fn dirty_range_invariant_holds(
            ops in prop::collection::vec(
                prop_oneof![
                    (0usize..256, 1usize..64).prop_map(|(on, n)| (0u8, on, n)),
                    Just((1u8, 0, 0)),
                    (1usize..256).prop_map(|size| (2u8, size, 0)),
                ],
                0..40
            )
        ) {
            let mut b = Buffer::new(FileId(9), 0, 0, 256);
            b.mark_cached();
            let mut reference = vec![0u8; 256];

            for (kind, a, n) in ops {
                match kind {
                    0 => {
                        let on = a.min(b.len());
                        let n = n.min(b.len() - on);
                        if !b.dirty_abuts(on, n) {
                            // Write path flushes before a non-contiguous write
                            b.mark_clean();
                        }
                        let data: Vec<u8> = (0..n).map(|i| (on + i) as u8).collect();
                        b.copy_in(on, &data);
                        reference[on..on + n].copy_from_slice(&data);
                    }
                    1 => b.mark_clean(),
                    _ => {
                        b.resize(a);
                        reference.resize(a, 0);
                    }
                }
                b.check_invariants();
                prop_assert_eq!(b.data(), reference.as_slice());
            }
        }
    }
}
