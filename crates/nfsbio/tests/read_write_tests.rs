//! End-to-end read and write behavior through the buffer cache.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{BLOCK, FILE, Harness, test_config};
use nfsbio::pages::PageSet;
use nfsbio::testing::{
    assert_bio_err, assert_bytes_equal, block_minus_one, block_plus_one, patterned_blocks,
    random_bytes, random_range,
};
use nfsbio::{BioError, FlushMode, Page, WriteFlags};
use nix::sys::signal::Signal;
use proptest::prelude::*;

#[test]
fn test_round_trip_within_block() {
    let h = Harness::new();
    let node = h.file(b"");
    h.mount
        .write(&node, 0, b"Hello, NFS!", WriteFlags::default(), &h.ctx)
        .unwrap();
    assert_eq!(h.read(&node, 0, 64), b"Hello, NFS!");
    assert_eq!(h.read(&node, 7, 3), b"NFS");
}

#[test]
fn test_round_trip_across_blocks() {
    let h = Harness::new();
    let node = h.file(b"");
    let data = patterned_blocks(3, BLOCK);
    let data = [data.as_slice(), b"tail"].concat();
    h.mount
        .write(&node, 0, &data, WriteFlags::default(), &h.ctx)
        .unwrap();

    assert_bytes_equal(&h.read(&node, 0, data.len() + 100), &data, "whole file");
    for _ in 0..20 {
        let (start, len) = random_range(data.len(), 2 * BLOCK);
        assert_bytes_equal(
            &h.read(&node, start as u64, len),
            &data[start..start + len],
            "random range",
        );
    }

    h.mount.flush(&node, FlushMode::Wait, &h.ctx).unwrap();
    assert_bytes_equal(&h.server.stable_contents(FILE), &data, "stable after flush");
}

#[test]
fn test_block_boundary_sizes() {
    for data in [block_minus_one(BLOCK), block_plus_one(BLOCK)] {
        let h = Harness::new();
        let node = h.file(b"");
        h.mount
            .write(&node, 0, &data, WriteFlags::default(), &h.ctx)
            .unwrap();
        h.mount.close(&node, &h.ctx).unwrap();
        assert_eq!(h.server.stable_contents(FILE), data);
        assert_eq!(node.size(), data.len() as u64);
    }
}

#[test]
fn test_read_ahead_skips_cached_blocks() {
    let h = Harness::with_config(test_config().readahead(2));
    let data = patterned_blocks(4, BLOCK);
    let node = h.file(&data);

    assert_eq!(h.read(&node, BLOCK as u64, BLOCK), &data[BLOCK..2 * BLOCK]);
    let deadline = Instant::now() + Duration::from_secs(5);
    while [2, 3]
        .iter()
        .any(|&lbn| h.mount.cache().inspect(FILE, lbn, |b| b.is_cached()) != Some(true))
    {
        assert!(Instant::now() < deadline, "read-ahead never landed");
        thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(h.server.counts().reads, 3);
    assert_eq!(h.mount.stats().snapshot().readaheads, 2);

    // Blocks 1 and 2 are already cached: only block 0 is fetched.
    assert_eq!(h.read(&node, 0, BLOCK), &data[..BLOCK]);
    assert_eq!(h.server.counts().reads, 4);
    assert_bytes_equal(&h.read(&node, 0, data.len()), &data, "whole file");
    assert_eq!(h.server.counts().reads, 4);
    assert_eq!(h.mount.stats().snapshot().readaheads, 2);
}

#[test]
fn test_full_block_write_skips_read_and_goes_async() {
    let h = Harness::new();
    let node = h.file(b"");
    let data = random_bytes(BLOCK);
    h.mount
        .write(&node, 0, &data, WriteFlags::default(), &h.ctx)
        .unwrap();
    h.mount.wait_for_writes(&node, &h.ctx).unwrap();

    let counts = h.server.counts();
    assert_eq!(counts.reads, 0);
    assert_eq!(counts.unstable_writes, 1);
    assert_eq!(h.server.contents(FILE), data);
    assert!(h.server.stable_contents(FILE).is_empty());

    let (cached, needs_commit) = h
        .mount
        .cache()
        .inspect(FILE, 0, |b| (b.is_cached(), b.needs_commit()))
        .unwrap();
    assert!(cached);
    assert!(needs_commit);
}

#[test]
fn test_partial_write_reads_block_first() {
    let h = Harness::new();
    let node = h.file(&[b'.'; BLOCK]);
    h.mount
        .write(&node, 5, b"0123456789", WriteFlags::default(), &h.ctx)
        .unwrap();

    let counts = h.server.counts();
    assert_eq!(counts.reads, 1);
    assert_eq!(counts.write_rpcs(), 0);
    let (dirty, len) = h
        .mount
        .cache()
        .inspect(FILE, 0, |b| (b.dirty_range(), b.len()))
        .unwrap();
    assert_eq!(dirty, 5..15);
    assert_eq!(len, BLOCK);

    let mut expected = vec![b'.'; BLOCK];
    expected[5..15].copy_from_slice(b"0123456789");
    assert_eq!(h.read(&node, 0, 2 * BLOCK), expected);
}

#[test]
fn test_appending_writes_merge_without_flush() {
    let h = Harness::new();
    let node = h.file(b"");
    h.mount
        .write(&node, 0, &[b'a'; 100], WriteFlags::default(), &h.ctx)
        .unwrap();
    h.mount
        .write(&node, 100, &[b'b'; 100], WriteFlags::default(), &h.ctx)
        .unwrap();

    let counts = h.server.counts();
    assert_eq!(counts.reads, 0);
    assert_eq!(counts.write_rpcs(), 0);
    let dirty = h.mount.cache().inspect(FILE, 0, |b| b.dirty_range()).unwrap();
    assert_eq!(dirty, 0..200);
    assert_eq!(node.size(), 200);
}

#[test]
fn test_append_flag_writes_at_server_eof() {
    let h = Harness::new();
    let node = h.file(b"first ");
    h.server.mutate_externally(FILE, b"first second ");
    h.mount
        .write(&node, 0, b"third", WriteFlags::default().append(), &h.ctx)
        .unwrap();
    h.mount.close(&node, &h.ctx).unwrap();
    assert_eq!(h.server.stable_contents(FILE), b"first second third");
}

#[test]
fn test_truncate_then_read_sees_new_end() {
    let h = Harness::new();
    let data = patterned_blocks(3, BLOCK);
    let node = h.file(&data);
    assert_eq!(h.read(&node, 0, data.len()).len(), data.len());

    let size = (BLOCK + 100) as u64;
    h.server.truncate(FILE, size);
    h.mount.set_size(&node, size, &h.ctx).unwrap();
    assert_eq!(h.pages.last_size(FILE), Some(size));

    assert_eq!(h.read(&node, size - 1, 10), &data[BLOCK + 99..BLOCK + 100]);
    assert!(h.read(&node, size, 10).is_empty());

    // Growing again exposes zeros, never the old tail.
    h.server.truncate(FILE, data.len() as u64);
    h.mount.set_size(&node, data.len() as u64, &h.ctx).unwrap();
    assert_eq!(h.read(&node, size, 64), vec![0u8; 64]);
}

#[test]
fn test_truncate_through_dirty_buffers() {
    let h = Harness::new();
    let node = h.file(b"");
    let data = patterned_blocks(3, BLOCK);
    h.mount
        .write(&node, 0, &data[..3 * BLOCK - 100], WriteFlags::default(), &h.ctx)
        .unwrap();
    h.mount.wait_for_writes(&node, &h.ctx).unwrap();
    assert!(h.mount.cache().has_dirty(FILE));

    let size = (BLOCK + 100) as u64;
    h.server.truncate(FILE, size);
    h.mount.set_size(&node, size, &h.ctx).unwrap();
    assert!(!h.mount.cache().incore(FILE, 2));

    assert_eq!(h.read(&node, size - 1, 10), &data[BLOCK + 99..BLOCK + 100]);
    assert!(h.read(&node, size, 10).is_empty());

    h.mount.close(&node, &h.ctx).unwrap();
    assert_eq!(h.server.stable_contents(FILE), &data[..BLOCK + 100]);
}

#[test]
fn test_file_size_limit_signals_writer() {
    let h = Harness::new();
    let node = h.file(b"");
    let ctx = h.ctx.clone().with_file_size_limit(1000).with_pid(4242);

    h.mount
        .write(&node, 990, &[1; 10], WriteFlags::default(), &ctx)
        .unwrap();
    assert!(h.signals.delivered().is_empty());

    assert_bio_err(
        h.mount.write(&node, 990, &[1; 20], WriteFlags::default(), &ctx),
        &BioError::FileTooLarge,
        "write past the limit",
    );
    assert_eq!(h.signals.delivered(), vec![(Some(4242), Signal::SIGXFSZ)]);
    assert_eq!(node.size(), 1000);
}

#[test]
fn test_sync_write_is_durable_on_return() {
    let h = Harness::new();
    let node = h.file(b"");
    h.mount
        .write(&node, 0, b"durable", WriteFlags::default().sync(), &h.ctx)
        .unwrap();
    assert_eq!(h.server.stable_contents(FILE), b"durable");
    assert_eq!(h.server.counts().filesync_writes, 1);
    assert!(!h.mount.cache().has_dirty(FILE));
}

#[test]
fn test_load_pages_marks_valid_extent() {
    let h = Harness::new();
    let data = random_bytes(BLOCK + 100);
    let node = h.file(&data);

    let mut pages = PageSet::range(0, 3);
    h.mount.load_pages(&node, &mut pages, &h.ctx).unwrap();
    let pages = pages.into_pages();
    assert_eq!(pages[0].valid_bytes(), BLOCK);
    assert_eq!(pages[0].data(), &data[..BLOCK]);
    assert_eq!(pages[1].valid_bytes(), 100);
    assert_eq!(&pages[1].data()[..100], &data[BLOCK..]);
    assert!(pages[1].data()[100..].iter().all(|&b| b == 0));
    assert!(!pages[2].is_valid());
    assert_eq!(h.server.counts().reads, 1);
}

#[test]
fn test_store_pages_never_extends_file() {
    let h = Harness::new();
    let node = h.file(&[0u8; BLOCK + 100]);

    let mut pages = PageSet::new(vec![Page::dirty(1, &[9u8; BLOCK])]).unwrap();
    let written = h.mount.store_pages(&node, &mut pages, &h.ctx).unwrap();
    assert_eq!(written, 100);
    assert!(!pages.pages()[0].is_dirty());

    let stable = h.server.stable_contents(FILE);
    assert_eq!(stable.len(), BLOCK + 100);
    assert!(stable[BLOCK..].iter().all(|&b| b == 9));
    assert_eq!(h.server.counts().filesync_writes, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_writes_match_model(
        ops in prop::collection::vec((0..3 * BLOCK, 1..2 * BLOCK, any::<u8>()), 1..8)
    ) {
        let h = Harness::new();
        let node = h.file(b"");
        let mut model = Vec::new();

        for (offset, len, byte) in ops {
            let data = vec![byte; len];
            h.mount
                .write(&node, offset as u64, &data, WriteFlags::default(), &h.ctx)
                .unwrap();
            if model.len() < offset + len {
                model.resize(offset + len, 0);
            }
            model[offset..offset + len].copy_from_slice(&data);
        }

        prop_assert_eq!(node.size(), model.len() as u64);
        prop_assert_eq!(h.read(&node, 0, model.len() + BLOCK), model.clone());
        h.mount.flush(&node, FlushMode::Wait, &h.ctx).unwrap();
        prop_assert_eq!(h.server.stable_contents(FILE), model);
    }
}
