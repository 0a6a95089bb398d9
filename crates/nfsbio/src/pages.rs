//! Page-cache adapter for memory-mapped access.
//!
//! Faults and writebacks arrive as a [`PageSet`]: contiguous pages in
//! ascending order, exclusively borrowed for the call. Each direction is a
//! single RPC over the whole extent and bypasses the buffer cache.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::context::IoContext;
use crate::error::{BioError, BioResult};
use crate::mount::Mount;
use crate::node::NfsNode;
use crate::rpc::{FileId, FileKind, StableHow};

/// Size of one page.
pub const PAGE_SIZE: usize = 4096;

/// One page of file data.
#[derive(Debug, Clone)]
pub struct Page {
    index: u64,
    data: Box<[u8]>,
    valid: usize,
    dirty: bool,
}

impl Page {
    /// A zeroed, invalid, clean page at page index `index`.
    pub fn new(index: u64) -> Self {
        Self {
            index,
            data: vec![0; PAGE_SIZE].into_boxed_slice(),
            valid: 0,
            dirty: false,
        }
    }

    /// A fully valid dirty page holding `bytes` (zero-padded).
    pub fn dirty(index: u64, bytes: &[u8]) -> Self {
        let mut page = Self::new(index);
        let n = bytes.len().min(PAGE_SIZE);
        page.data[..n].copy_from_slice(&bytes[..n]);
        page.valid = PAGE_SIZE;
        page.dirty = true;
        page
    }

    /// Page index within the file.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// File offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.index * PAGE_SIZE as u64
    }

    /// Page contents.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable page contents. Does not mark the page dirty.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Leading bytes that hold file data.
    pub fn valid_bytes(&self) -> usize {
        self.valid
    }

    /// Whether the whole page is valid.
    pub fn is_valid(&self) -> bool {
        self.valid == PAGE_SIZE
    }

    /// Whether the page has unwritten modifications.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the page modified.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

/// Contiguous, ordered pages handed to the adapter.
#[derive(Debug, Clone)]
pub struct PageSet {
    pages: Vec<Page>,
}

impl PageSet {
    /// Wraps `pages`, which must be non-empty and consecutive.
    pub fn new(pages: Vec<Page>) -> BioResult<Self> {
        if pages.is_empty() {
            return Err(BioError::InvalidArgument("empty page set"));
        }
        if pages.windows(2).any(|w| w[1].index != w[0].index + 1) {
            return Err(BioError::InvalidArgument("page set not contiguous"));
        }
        Ok(Self { pages })
    }

    /// `count` fresh pages starting at page index `first`.
    pub fn range(first: u64, count: usize) -> Self {
        Self {
            pages: (0..count as u64).map(|i| Page::new(first + i)).collect(),
        }
    }

    /// File offset of the first page.
    pub fn offset(&self) -> u64 {
        self.pages.first().map_or(0, Page::offset)
    }

    /// Bytes spanned by the set.
    pub fn byte_len(&self) -> usize {
        self.pages.len() * PAGE_SIZE
    }

    /// The pages.
    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// The pages, mutably.
    pub fn pages_mut(&mut self) -> &mut [Page] {
        &mut self.pages
    }

    /// Gives the pages back.
    pub fn into_pages(self) -> Vec<Page> {
        self.pages
    }
}

/// The virtual-memory side, told when a file's extent changes.
pub trait PageCache: Send + Sync {
    /// The file now has `size` bytes.
    fn set_size(&self, file: FileId, size: u64);
}

/// A page cache that does not exist.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPageCache;

impl PageCache for NoopPageCache {
    fn set_size(&self, _file: FileId, _size: u64) {}
}

impl Mount {
    /// Fills `pages` with one read RPC.
    ///
    /// Pages wholly inside the returned data become valid, a page holding
    /// end of file becomes partially valid with a zeroed tail, and pages
    /// past end of file are left invalid. On error the pages are untouched
    /// and the caller discards them.
    pub fn load_pages(
        self: &Arc<Self>,
        node: &NfsNode,
        pages: &mut PageSet,
        ctx: &IoContext,
    ) -> BioResult<()> {
        if node.kind() != FileKind::Regular {
            return Err(BioError::WrongFileKind);
        }
        let offset = pages.offset();
        let mut scratch = vec![0u8; pages.byte_len()];
        let reply = self.rpc.read(node.id(), offset, &mut scratch, &ctx.cred)?;
        let count = reply.count.min(scratch.len());
        self.stats.record_read_rpc(count);

        for (i, page) in pages.pages_mut().iter_mut().enumerate() {
            let start = i * PAGE_SIZE;
            if start >= count {
                continue;
            }
            let valid = (count - start).min(PAGE_SIZE);
            page.data[..valid].copy_from_slice(&scratch[start..start + valid]);
            page.data[valid..].fill(0);
            page.valid = valid;
        }
        trace!(file = %node.id(), offset, count, "Loaded pages");
        Ok(())
    }

    /// Writes dirty `pages` back with one file-sync write RPC.
    ///
    /// The write is clipped so it never extends the file. Written pages
    /// and pages wholly past end of file become clean; on error every page
    /// stays dirty for a later retry. Returns the bytes written.
    pub fn store_pages(
        self: &Arc<Self>,
        node: &NfsNode,
        pages: &mut PageSet,
        ctx: &IoContext,
    ) -> BioResult<usize> {
        if node.kind() != FileKind::Regular {
            return Err(BioError::WrongFileKind);
        }
        let offset = pages.offset();
        let size = node.size();
        let count = usize::try_from(size.saturating_sub(offset))
            .unwrap_or(usize::MAX)
            .min(pages.byte_len());

        let mut written = 0;
        if count > 0 {
            let mut payload = Vec::with_capacity(count);
            for page in pages.pages() {
                let take = (count - payload.len()).min(PAGE_SIZE);
                payload.extend_from_slice(&page.data[..take]);
                if payload.len() == count {
                    break;
                }
            }
            let reply = self
                .rpc
                .write(node.id(), offset, &payload, StableHow::FileSync, &ctx.cred)?;
            self.stats.record_write_rpc(payload.len(), true);
            if reply.count == 0 {
                return Err(BioError::Server(libc::EIO));
            }
            self.observe_write_verifier(reply.verifier);
            if let Some(mtime) = reply.mtime {
                node.set_mtime(mtime);
            }
            written = reply.count.min(count);
        }

        for (i, page) in pages.pages_mut().iter_mut().enumerate() {
            let start = i * PAGE_SIZE;
            let end = (start + PAGE_SIZE).min(count);
            if start >= count || written >= end {
                page.dirty = false;
            }
        }
        debug!(file = %node.id(), offset, count, written, "Stored pages");
        Ok(written)
    }
}
