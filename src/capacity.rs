//! Capacity Quantizer
//!
//! Converts a requested byte range into a size the array accepts. The array
//! allocates in 8 GiB units, so every volume size is a positive multiple of
//! that granularity.

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

pub const BYTES_IN_KIB: u64 = 1024;
pub const KIB_IN_GIB: u64 = 1024 * 1024;
pub const BYTES_IN_GIB: u64 = BYTES_IN_KIB * KIB_IN_GIB;

/// Allocation granularity of a storage pool
pub const VOL_SIZE_MULTIPLE_GIB: u64 = 8;

/// Size used when the request names no minimum
pub const DEFAULT_VOLUME_SIZE_KIB: u64 = 16 * KIB_IN_GIB;

// =============================================================================
// Quantizer
// =============================================================================

/// Resolve a requested capacity range into an array-legal size in KiB
///
/// `min_bytes` of zero selects [`DEFAULT_VOLUME_SIZE_KIB`]; `max_bytes` of
/// zero means unbounded.
pub fn validate_vol_size(min_bytes: i64, max_bytes: i64) -> Result<u64> {
    if min_bytes < 0 || max_bytes < 0 {
        return Err(Error::OutOfRange(format!(
            "bad capacity: volume size bytes {} and limit size bytes: {} must not be negative",
            min_bytes, max_bytes
        )));
    }

    let min_bytes = if min_bytes == 0 {
        DEFAULT_VOLUME_SIZE_KIB * BYTES_IN_KIB
    } else {
        min_bytes as u64
    };

    let mut size_gib = min_bytes.div_ceil(BYTES_IN_GIB).max(1);
    let rem = size_gib % VOL_SIZE_MULTIPLE_GIB;
    if rem > 0 {
        size_gib = size_gib - rem + VOL_SIZE_MULTIPLE_GIB;
    }

    let size_bytes = size_gib.saturating_mul(BYTES_IN_GIB);
    if max_bytes != 0 && size_bytes > max_bytes as u64 {
        return Err(Error::OutOfRange(format!(
            "bad capacity: volume size {} bytes is greater than the limit of {} bytes",
            size_bytes, max_bytes
        )));
    }

    Ok(size_gib * KIB_IN_GIB)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const GRANULE_KIB: u64 = VOL_SIZE_MULTIPLE_GIB * KIB_IN_GIB;
    const GIB: i64 = BYTES_IN_GIB as i64;

    #[test]
    fn test_default_size() {
        assert_eq!(validate_vol_size(0, 0).unwrap(), DEFAULT_VOLUME_SIZE_KIB);
    }

    #[test]
    fn test_small_requests_become_one_granule() {
        for min in [1, 300 * 1024, GIB - 1, GIB, 7 * GIB, 8 * GIB] {
            assert_eq!(validate_vol_size(min, 0).unwrap(), GRANULE_KIB, "min={}", min);
        }
    }

    #[test]
    fn test_unaligned_requests_round_up() {
        assert_eq!(validate_vol_size(8 * GIB + 1, 0).unwrap(), 2 * GRANULE_KIB);
        assert_eq!(validate_vol_size(9 * GIB + GIB / 2, 0).unwrap(), 2 * GRANULE_KIB);
        assert_eq!(validate_vol_size(17 * GIB, 0).unwrap(), 3 * GRANULE_KIB);
        assert_eq!(validate_vol_size(24 * GIB, 0).unwrap(), 3 * GRANULE_KIB);
    }

    #[test]
    fn test_limit_respected() {
        assert_eq!(validate_vol_size(GIB, 8 * GIB).unwrap(), GRANULE_KIB);
        assert_matches!(validate_vol_size(GIB, 4 * GIB), Err(Error::OutOfRange(_)));
        assert_matches!(validate_vol_size(9 * GIB, 10 * GIB), Err(Error::OutOfRange(_)));
        assert_matches!(validate_vol_size(0, GIB), Err(Error::OutOfRange(_)));
    }

    #[test]
    fn test_negative_rejected() {
        assert_matches!(validate_vol_size(-1, 0), Err(Error::OutOfRange(_)));
        assert_matches!(validate_vol_size(0, -1), Err(Error::OutOfRange(_)));
    }
}
