//! Part planning for multipart uploads.
//!
//! Pure logic: given a payload size and a maximum part size, decide how the
//! payload is split. No I/O.

use stowage_common::MAX_PART_COUNT;

use crate::error::StorageError;

/// One contiguous byte range of an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// 1-based part number.
    pub part_number: u32,
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (exclusive).
    pub end: u64,
}

impl PartRange {
    /// Length of this range in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether this range is empty (only for a zero-byte object).
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split `total_bytes` into ranges of at most `max_part_size` bytes.
///
/// A payload no larger than `max_part_size` yields one range `[0, total_bytes)`,
/// including the empty range for a zero-byte payload. Larger payloads yield
/// `ceil(total_bytes / max_part_size)` ranges; all but the last are exactly
/// `max_part_size` long and the last holds the remainder.
///
/// Store-specific minimum part sizes are not enforced here.
///
/// # Arguments
/// * `total_bytes` - Payload size in bytes
/// * `max_part_size` - Maximum part size in bytes
///
/// # Errors
/// Returns `InvalidSize` if `max_part_size` is zero.
pub fn plan(total_bytes: u64, max_part_size: u64) -> Result<Vec<PartRange>, StorageError> {
    if max_part_size == 0 {
        return Err(StorageError::InvalidSize {
            total_bytes,
            max_part_size,
        });
    }

    if total_bytes <= max_part_size {
        return Ok(vec![PartRange {
            part_number: 1,
            start: 0,
            end: total_bytes,
        }]);
    }

    let count: u64 = expected_part_count(total_bytes, max_part_size);
    if count > u32::MAX as u64 {
        return Err(StorageError::InvalidSize {
            total_bytes,
            max_part_size,
        });
    }

    let mut parts: Vec<PartRange> = Vec::with_capacity(count as usize);
    let mut start: u64 = 0;
    let mut part_number: u32 = 1;

    while start < total_bytes {
        let end: u64 = start + std::cmp::min(max_part_size, total_bytes - start);
        parts.push(PartRange {
            part_number,
            start,
            end,
        });
        start = end;
        part_number += 1;
    }

    Ok(parts)
}

/// Number of ranges [`plan`] produces.
pub fn expected_part_count(total_bytes: u64, max_part_size: u64) -> u64 {
    if max_part_size == 0 || total_bytes <= max_part_size {
        return 1;
    }
    total_bytes.div_ceil(max_part_size)
}

/// Whether a payload needs the multipart path.
pub fn is_multipart(total_bytes: u64, max_part_size: u64) -> bool {
    max_part_size > 0 && total_bytes > max_part_size
}

/// Check a planned upload against the store's part-count limit.
pub fn check_part_count(total_bytes: u64, max_part_size: u64) -> Result<(), StorageError> {
    let count: u64 = expected_part_count(total_bytes, max_part_size);
    if count > MAX_PART_COUNT {
        return Err(StorageError::validation(format!(
            "{} bytes with part size {} needs {} parts, the store allows {}",
            total_bytes, max_part_size, count, MAX_PART_COUNT
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_common::MIB;

    fn assert_partition(total: u64, max: u64) {
        let parts: Vec<PartRange> = plan(total, max).unwrap();
        assert_eq!(parts[0].start, 0);
        assert_eq!(parts.last().unwrap().end, total);
        for pair in parts.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert_eq!(pair[0].part_number + 1, pair[1].part_number);
        }
        assert_eq!(parts.iter().map(PartRange::len).sum::<u64>(), total);
        if parts.len() > 1 {
            let last: &PartRange = parts.last().unwrap();
            assert!(last.len() >= 1 && last.len() <= max);
            assert!(parts[..parts.len() - 1].iter().all(|p| p.len() == max));
        }
        assert_eq!(parts.len() as u64, expected_part_count(total, max));
    }

    #[test]
    fn test_plan_covers_payload_exactly() {
        for total in [1u64, 2, 7, 99, 100, 101, 250, 300, 1_000, 4_097] {
            for max in [1u64, 3, 10, 100, 4_096] {
                assert_partition(total, max);
            }
        }
    }

    #[test]
    fn test_plan_single_part_threshold() {
        for total in [0u64, 1, 50, 100] {
            let parts: Vec<PartRange> = plan(total, 100).unwrap();
            assert_eq!(
                parts,
                vec![PartRange {
                    part_number: 1,
                    start: 0,
                    end: total
                }]
            );
        }
        assert!(!is_multipart(100, 100));
        assert!(is_multipart(101, 100));
    }

    #[test]
    fn test_plan_twelve_mib_in_five_mib_parts() {
        let parts: Vec<PartRange> = plan(12 * MIB, 5 * MIB).unwrap();
        let sizes: Vec<u64> = parts.iter().map(PartRange::len).collect();
        assert_eq!(sizes, vec![5 * MIB, 5 * MIB, 2 * MIB]);
        assert_eq!(parts[2].part_number, 3);
        assert_eq!(parts[2].start, 10 * MIB);
    }

    #[test]
    fn test_plan_evenly_divisible_last_part_is_full() {
        let parts: Vec<PartRange> = plan(300, 100).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 100);
    }

    #[test]
    fn test_plan_zero_byte_payload() {
        let parts: Vec<PartRange> = plan(0, MIB).unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_empty());
    }

    #[test]
    fn test_plan_rejects_zero_part_size() {
        assert!(matches!(
            plan(10, 0),
            Err(StorageError::InvalidSize {
                total_bytes: 10,
                max_part_size: 0
            })
        ));
    }

    #[test]
    fn test_check_part_count() {
        assert!(check_part_count(10_000, 1).is_ok());
        assert!(check_part_count(10_001, 1).is_err());
    }
}
