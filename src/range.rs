//! Range sizing under the file-share service ceilings.

use crate::error::{CloudFsError, Result};

/// Largest number of bytes one range operation may carry (4 MiB).
pub const MAX_RANGE_BYTES: u64 = 4 * 1024 * 1024;

/// Largest number of addressable ranges in a single file.
pub const MAX_RANGES_PER_FILE: u64 = 1 << 20;

/// Largest file the service can hold (4 TiB).
pub const MAX_FILE_BYTES: u64 = MAX_RANGE_BYTES * MAX_RANGES_PER_FILE;

/// Compute the per-request range size for a file of `target_size` bytes.
///
/// Pure and callable without any open connection. The result is the
/// smallest range size not exceeding [`MAX_RANGE_BYTES`] that keeps the
/// range count within [`MAX_RANGES_PER_FILE`]; since the file ceiling is
/// the product of the two limits, this resolves to [`MAX_RANGE_BYTES`] for
/// every admissible size and the function's real job is rejecting sizes
/// beyond the ceiling.
pub fn range_size(path: &str, target_size: u64) -> Result<u64> {
    if target_size > MAX_FILE_BYTES {
        return Err(CloudFsError::SizeTooLarge {
            path: path.to_string(),
            size: target_size,
            max: MAX_FILE_BYTES,
        });
    }
    let ranges = target_size.div_ceil(MAX_RANGE_BYTES).max(1);
    debug_assert!(ranges <= MAX_RANGES_PER_FILE);
    Ok(MAX_RANGE_BYTES)
}
