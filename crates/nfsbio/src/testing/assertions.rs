//! Assertions with readable failure messages.

use std::fmt::Debug;

use crate::error::{BioError, BioResult};

/// Asserts two byte slices are equal, reporting the first difference
/// instead of dumping both.
pub fn assert_bytes_equal(actual: &[u8], expected: &[u8], context: &str) {
    assert!(
        actual.len() == expected.len(),
        "{context}: size mismatch - expected {} bytes, got {} bytes",
        expected.len(),
        actual.len()
    );
    if let Some(i) = actual.iter().zip(expected).position(|(a, e)| a != e) {
        panic!(
            "{context}: content mismatch at byte {i} - expected 0x{:02x}, got 0x{:02x}",
            expected[i], actual[i]
        );
    }
}

/// Asserts `result` failed with exactly `expected`.
pub fn assert_bio_err<T: Debug>(result: BioResult<T>, expected: &BioError, context: &str) {
    match result {
        Ok(value) => panic!("{context}: expected {expected:?}, got success with {value:?}"),
        Err(e) => assert!(&e == expected, "{context}: expected {expected:?}, got {e:?}"),
    }
}
