//! Test data generators.
//!
//! Sizes are expressed against a block size so tests hit buffer
//! boundaries deliberately.

use rand::Rng;

/// Random bytes of the given length.
pub fn random_bytes(size: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..size).map(|_| rng.random()).collect()
}

/// Content spanning exactly `blocks` blocks.
pub fn multi_block_content(blocks: usize, block_size: usize) -> Vec<u8> {
    random_bytes(blocks * block_size)
}

/// One byte short of a block.
pub fn block_minus_one(block_size: usize) -> Vec<u8> {
    random_bytes(block_size - 1)
}

/// One byte into the second block.
pub fn block_plus_one(block_size: usize) -> Vec<u8> {
    random_bytes(block_size + 1)
}

/// Content where every block is filled with its own index.
///
/// Misplaced or reordered blocks show up as the wrong fill byte.
pub fn patterned_blocks(blocks: usize, block_size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(blocks * block_size);
    for block in 0..blocks {
        #[allow(clippy::cast_possible_truncation)]
        let fill = (block % 256) as u8;
        data.extend(std::iter::repeat_n(fill, block_size));
    }
    data
}

/// A random `(offset, len)` inside a file of `file_len` bytes, at most
/// `max_len` long.
pub fn random_range(file_len: usize, max_len: usize) -> (usize, usize) {
    let mut rng = rand::rng();
    let offset = rng.random_range(0..file_len.max(1));
    let len = rng.random_range(1..=max_len.max(1)).min(file_len - offset.min(file_len));
    (offset, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(random_bytes(0).len(), 0);
        assert_eq!(multi_block_content(3, 512).len(), 1536);
        assert_eq!(block_minus_one(4096).len(), 4095);
        assert_eq!(block_plus_one(4096).len(), 4097);
    }

    #[test]
    fn test_patterned_blocks() {
        let data = patterned_blocks(3, 1024);
        assert_eq!(data.len(), 3072);
        assert_eq!(data[0], 0);
        assert_eq!(data[1024], 1);
        assert_eq!(data[3071], 2);
    }

    #[test]
    fn test_random_range_in_bounds() {
        for _ in 0..100 {
            let (offset, len) = random_range(10_000, 300);
            assert!(offset + len <= 10_000);
            assert!(len <= 300);
        }
    }
}
