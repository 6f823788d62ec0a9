use std::io::SeekFrom;
use std::path::Path;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::TransferError;
use crate::types::ByteRange;

// ---------------------------------------------------------------------------
// Checksum helpers
// ---------------------------------------------------------------------------

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Part planning
// ---------------------------------------------------------------------------

/// Ordered, contiguous partition of `[0, total_bytes)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    /// Part size actually used after applying the part-count ceiling.
    pub part_size: u64,
    /// Byte ranges in ascending order; index in this vec is the part index.
    pub ranges: Vec<ByteRange>,
}

impl PartPlan {
    /// Number of parts in the plan.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Always `false`: even an empty file has one zero-length part.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Splits `total_bytes` into parts of `part_size` bytes (the last part may
/// be shorter).
///
/// If `ceil(total_bytes / part_size)` would exceed `max_parts`, the part size
/// is raised to `ceil(total_bytes / max_parts)`. An empty file yields a
/// single zero-length part. The result depends only on the three inputs.
pub fn plan_parts(
    total_bytes: u64,
    part_size: u64,
    max_parts: u32,
) -> Result<PartPlan, TransferError> {
    if part_size == 0 {
        return Err(TransferError::InvalidPartSize);
    }
    if max_parts == 0 {
        return Err(TransferError::InvalidPartCeiling);
    }

    if total_bytes == 0 {
        return Ok(PartPlan {
            part_size,
            ranges: vec![ByteRange::new(0, 0)],
        });
    }

    let floor = total_bytes.div_ceil(u64::from(max_parts));
    let part_size = part_size.max(floor);

    let count = total_bytes.div_ceil(part_size);
    let mut ranges = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    while start < total_bytes {
        let end = start.saturating_add(part_size).min(total_bytes);
        ranges.push(ByteRange::new(start, end));
        start = end;
    }

    Ok(PartPlan { part_size, ranges })
}

// ---------------------------------------------------------------------------
// Part reads
// ---------------------------------------------------------------------------

/// Reads the bytes of `range` from the file at `path`.
///
/// `expected_len` is the file length the part plan was computed for; a file
/// that has grown or shrunk since is rejected rather than uploaded with
/// shifted boundaries.
pub async fn read_part(
    path: &Path,
    range: ByteRange,
    expected_len: u64,
) -> Result<Bytes, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let actual = file.metadata().await?.len();
    if actual != expected_len {
        return Err(TransferError::FileChanged {
            expected: expected_len,
            actual,
        });
    }

    let mut buf = vec![0u8; range.len() as usize];
    if !buf.is_empty() {
        file.seek(SeekFrom::Start(range.start)).await?;
        file.read_exact(&mut buf).await?;
    }
    Ok(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(data).unwrap();
        path
    }

    fn assert_covers(plan: &PartPlan, total: u64) {
        assert_eq!(plan.ranges.first().unwrap().start, 0);
        assert_eq!(plan.ranges.last().unwrap().end, total);
        for pair in plan.ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start, "ranges must be contiguous");
        }
    }

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
        assert_ne!(c1, checksum_bytes(b"hello"));
    }

    #[test]
    fn plan_exact_multiple() {
        let plan = plan_parts(100 * MIB, 10 * MIB, 10_000).unwrap();
        assert_eq!(plan.len(), 10);
        assert_eq!(plan.part_size, 10 * MIB);
        assert!(plan.ranges.iter().all(|r| r.len() == 10 * MIB));
        assert_covers(&plan, 100 * MIB);
    }

    #[test]
    fn plan_short_last_part() {
        let plan = plan_parts(10, 4, 100).unwrap();
        let lens: Vec<u64> = plan.ranges.iter().map(ByteRange::len).collect();
        assert_eq!(lens, vec![4, 4, 2]);
        assert_covers(&plan, 10);
    }

    #[test]
    fn plan_counts_match_ceiling_division() {
        for total in [1u64, 2, 3, 7, 8, 9, 63, 64, 65, 1000] {
            for size in [1u64, 2, 3, 8, 64, 2000] {
                let plan = plan_parts(total, size, u32::MAX).unwrap();
                assert_eq!(plan.len() as u64, total.div_ceil(size), "N={total} S={size}");
                assert_covers(&plan, total);
            }
        }
    }

    #[test]
    fn plan_empty_file_single_zero_part() {
        let plan = plan_parts(0, 10 * MIB, 10_000).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.ranges[0], ByteRange::new(0, 0));
        assert!(plan.ranges[0].is_empty());
    }

    #[test]
    fn plan_is_deterministic() {
        let a = plan_parts(123_456_789, 5 * MIB, 10_000).unwrap();
        let b = plan_parts(123_456_789, 5 * MIB, 10_000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn plan_respects_part_ceiling() {
        let plan = plan_parts(1000, 1, 10).unwrap();
        assert_eq!(plan.len(), 10);
        assert_eq!(plan.part_size, 100);
        assert_covers(&plan, 1000);

        let plan = plan_parts(1001, 1, 10).unwrap();
        assert!(plan.len() <= 10);
        assert_covers(&plan, 1001);
    }

    #[test]
    fn plan_rejects_zero_inputs() {
        assert!(matches!(
            plan_parts(10, 0, 10),
            Err(TransferError::InvalidPartSize)
        ));
        assert!(matches!(
            plan_parts(10, 4, 0),
            Err(TransferError::InvalidPartCeiling)
        ));
    }

    #[tokio::test]
    async fn read_part_returns_range() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "video.mp4", b"0123456789");

        let data = read_part(&path, ByteRange::new(4, 8), 10).await.unwrap();
        assert_eq!(&data[..], b"4567");

        let tail = read_part(&path, ByteRange::new(8, 10), 10).await.unwrap();
        assert_eq!(&tail[..], b"89");
    }

    #[tokio::test]
    async fn read_part_zero_length() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "empty.mp4", b"");
        let data = read_part(&path, ByteRange::new(0, 0), 0).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn read_part_detects_changed_file() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "video.mp4", b"0123456789");

        let result = read_part(&path, ByteRange::new(0, 4), 12).await;
        assert!(matches!(
            result,
            Err(TransferError::FileChanged {
                expected: 12,
                actual: 10
            })
        ));
    }

    #[tokio::test]
    async fn read_part_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = read_part(&dir.path().join("gone.mp4"), ByteRange::new(0, 1), 1).await;
        assert!(matches!(result, Err(TransferError::Io(_))));
    }

    #[tokio::test]
    async fn parts_reassemble_original() {
        let dir = TempDir::new().unwrap();
        let original = b"The quick brown fox jumps over the lazy dog";
        let path = create_test_file(dir.path(), "clip.mp4", original);
        let total = original.len() as u64;

        let plan = plan_parts(total, 10, 100).unwrap();
        let mut assembled = Vec::new();
        for range in &plan.ranges {
            assembled.extend_from_slice(&read_part(&path, *range, total).await.unwrap());
        }
        assert_eq!(&assembled, original);
    }
}
