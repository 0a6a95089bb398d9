//! Per-mount buffer cache keyed by `(file, logical block)`.
//!
//! Ownership of a buffer is exclusive: [`BufCache::get_block`] hands out a
//! [`BufHandle`] and every other caller wanting the same block sleeps until
//! the handle is dropped. Dropping the handle returns the buffer to the
//! cache, or discards it when it is invalid, never filled, or marked for
//! release while clean.
//!
//! # Lock order
//!
//! A `DashMap` shard is never held while waiting on a slot. Slots are
//! cloned out of the map first, then locked. The only nesting is slot lock
//! then shard lock, when a dropped handle removes its slot.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::buffer::{BufState, Buffer};
use crate::error::BioResult;
use crate::rpc::FileId;
use crate::sync::{InFlightGuard, Waiter};

type Key = (FileId, u64);

#[derive(Debug, Default)]
struct SlotInner {
    /// The buffer while nobody owns it.
    buf: Option<Buffer>,
    locked: bool,
    /// Removed from the map; lookups must retry.
    gone: bool,
}

#[derive(Debug, Default)]
struct Slot {
    inner: Mutex<SlotInner>,
    cv: Condvar,
}

/// The generic buffer cache the I/O layer resolves blocks through.
#[derive(Debug, Default)]
pub struct BufCache {
    slots: DashMap<Key, Arc<Slot>>,
}

impl BufCache {
    /// Creates an empty cache.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the buffer for `(file, lbn)`, creating it if needed, with
    /// at least `size` bytes of capacity.
    ///
    /// Blocks while another path owns the buffer. Interruptible waiters
    /// fail with `Interrupted` instead of hanging.
    pub fn get_block(
        self: &Arc<Self>,
        file: FileId,
        lbn: u64,
        blkno: u64,
        size: usize,
        waiter: &Waiter<'_>,
    ) -> BioResult<BufHandle> {
        let key = (file, lbn);
        loop {
            let slot = Arc::clone(self.slots.entry(key).or_default().value());
            let mut inner = slot.inner.lock();
            while inner.locked && !inner.gone {
                waiter.wait(&slot.cv, &mut inner)?;
            }
            if inner.gone {
                continue;
            }
            inner.locked = true;
            let mut buf = inner
                .buf
                .take()
                .unwrap_or_else(|| Buffer::new(file, lbn, blkno, size));
            drop(inner);

            if buf.len() < size {
                buf.resize(size);
            }
            return Ok(BufHandle::new(Arc::clone(self), slot, key, buf));
        }
    }

    /// Takes an existing buffer, sleeping while it is owned.
    ///
    /// Returns `None` if no buffer exists for the block.
    pub fn acquire(
        self: &Arc<Self>,
        file: FileId,
        lbn: u64,
        waiter: &Waiter<'_>,
    ) -> BioResult<Option<BufHandle>> {
        let key = (file, lbn);
        loop {
            let Some(slot) = self.slot(key) else {
                return Ok(None);
            };
            let mut inner = slot.inner.lock();
            while inner.locked && !inner.gone {
                waiter.wait(&slot.cv, &mut inner)?;
            }
            if inner.gone {
                continue;
            }
            let Some(buf) = inner.buf.take() else {
                return Ok(None);
            };
            inner.locked = true;
            drop(inner);
            return Ok(Some(BufHandle::new(Arc::clone(self), slot, key, buf)));
        }
    }

    /// Takes an existing buffer only if nobody owns it.
    pub fn try_get(self: &Arc<Self>, file: FileId, lbn: u64) -> Option<BufHandle> {
        let key = (file, lbn);
        let slot = self.slot(key)?;
        let mut inner = slot.inner.lock();
        if inner.locked || inner.gone {
            return None;
        }
        let buf = inner.buf.take()?;
        inner.locked = true;
        drop(inner);
        Some(BufHandle::new(Arc::clone(self), slot, key, buf))
    }

    /// Whether a buffer exists for the block, owned or not.
    pub fn incore(&self, file: FileId, lbn: u64) -> bool {
        self.slot((file, lbn)).is_some_and(|slot| {
            let inner = slot.inner.lock();
            !inner.gone && (inner.locked || inner.buf.is_some())
        })
    }

    /// Logical block numbers cached for `file`, ascending.
    pub fn blocks(&self, file: FileId) -> Vec<u64> {
        let mut lbns: Vec<u64> = self
            .slots
            .iter()
            .filter(|entry| entry.key().0 == file)
            .map(|entry| entry.key().1)
            .collect();
        lbns.sort_unstable();
        lbns
    }

    /// Runs `f` on a buffer if it is cached and idle.
    pub fn inspect<R>(&self, file: FileId, lbn: u64, f: impl FnOnce(&Buffer) -> R) -> Option<R> {
        let slot = self.slot((file, lbn))?;
        let inner = slot.inner.lock();
        if inner.locked || inner.gone {
            return None;
        }
        inner.buf.as_ref().map(f)
    }

    /// Whether any idle buffer of `file` holds dirty data.
    pub fn has_dirty(&self, file: FileId) -> bool {
        self.file_slots(file).iter().any(|slot| {
            let inner = slot.inner.lock();
            !inner.locked && inner.buf.as_ref().is_some_and(Buffer::is_dirty)
        })
    }

    /// Applies `f` to every idle buffer in the cache. Owned buffers are skipped.
    pub(crate) fn for_each_idle(&self, mut f: impl FnMut(&mut Buffer)) {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for slot in slots {
            let mut inner = slot.inner.lock();
            if inner.locked || inner.gone {
                continue;
            }
            if let Some(buf) = inner.buf.as_mut() {
                f(buf);
            }
        }
    }

    /// Discards every buffer of `file` at or beyond `first_lbn`, dirty or not.
    ///
    /// Returns the number of buffers dropped.
    pub fn truncate_from(
        self: &Arc<Self>,
        file: FileId,
        first_lbn: u64,
        waiter: &Waiter<'_>,
    ) -> BioResult<usize> {
        let mut dropped = 0;
        for lbn in self.blocks(file).into_iter().filter(|&lbn| lbn >= first_lbn) {
            if let Some(mut buf) = self.acquire(file, lbn, waiter)? {
                buf.invalidate(None);
                dropped += 1;
            }
        }
        trace!(%file, first_lbn, dropped, "Truncated cached blocks");
        Ok(dropped)
    }

    /// Number of cached blocks across all files.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the cache holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, key: Key) -> Option<Arc<Slot>> {
        self.slots.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    fn file_slots(&self, file: FileId) -> Vec<Arc<Slot>> {
        self.slots
            .iter()
            .filter(|entry| entry.key().0 == file)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

/// Exclusive ownership of one cached buffer.
///
/// Dereferences to [`Buffer`]. Dropping the handle releases the buffer.
#[derive(Debug)]
pub struct BufHandle {
    cache: Arc<BufCache>,
    slot: Arc<Slot>,
    key: Key,
    buf: Buffer,
    release: bool,
    // Dropped after the buffer is back in its slot.
    in_flight: Option<InFlightGuard>,
}

impl BufHandle {
    fn new(cache: Arc<BufCache>, slot: Arc<Slot>, key: Key, buf: Buffer) -> Self {
        Self {
            cache,
            slot,
            key,
            buf,
            release: false,
            in_flight: None,
        }
    }

    /// Keeps `guard` alive until this buffer is released.
    pub(crate) fn track(&mut self, guard: InFlightGuard) {
        self.in_flight = Some(guard);
    }

    /// Ends tracking early, returning the guard.
    pub(crate) fn untrack(&mut self) -> Option<InFlightGuard> {
        self.in_flight.take()
    }

    /// Drop the buffer from the cache on release unless it is still dirty.
    pub(crate) fn set_release(&mut self) {
        self.release = true;
    }

    fn should_discard(&self) -> bool {
        let buf = &self.buf;
        match buf.state() {
            BufState::Invalid | BufState::Empty => true,
            _ => (self.release || buf.no_cache()) && !buf.is_dirty(),
        }
    }
}

impl Deref for BufHandle {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buf
    }
}

impl DerefMut for BufHandle {
    fn deref_mut(&mut self) -> &mut Buffer {
        &mut self.buf
    }
}

impl Drop for BufHandle {
    fn drop(&mut self) {
        let discard = self.should_discard();
        let buf = std::mem::take(&mut self.buf);
        let mut inner = self.slot.inner.lock();
        if discard {
            inner.gone = true;
            self.cache
                .slots
                .remove_if(&self.key, |_, slot| Arc::ptr_eq(slot, &self.slot));
        } else {
            inner.buf = Some(buf);
        }
        inner.locked = false;
        drop(inner);
        self.slot.cv.notify_all();
    }
}
