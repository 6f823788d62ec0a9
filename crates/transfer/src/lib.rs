//! Multipart transfer primitives: part planning, part reads and checksums.
//!
//! Planning is a pure function of the file length and the configured part
//! size so a retry re-derives the exact same part boundaries.

mod chunked;
mod types;

pub use chunked::{PartPlan, checksum_bytes, plan_parts, read_part};
pub use types::{ByteRange, PartDescriptor, PartState, UploadSession};

/// Default target part size: 10 MiB.
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Default part-count ceiling, matching common object-store multipart limits.
pub const DEFAULT_MAX_PARTS: u32 = 10_000;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("part size must be positive")]
    InvalidPartSize,

    #[error("part ceiling must be positive")]
    InvalidPartCeiling,

    #[error("file changed during upload: expected {expected} bytes, found {actual}")]
    FileChanged { expected: u64, actual: u64 },
}
