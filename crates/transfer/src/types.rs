use mitt_protocol::messages::PartAuthorization;
use mitt_protocol::types::UploadStatus;

/// Half-open byte range `[start, end)` within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Creates a range; `end` must not precede `start`.
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Number of bytes in the range.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Transfer state of one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

/// One part of a multipart session.
#[derive(Debug, Clone)]
pub struct PartDescriptor {
    /// 0-based index; resume matching is done on this value.
    pub index: u32,
    pub range: ByteRange,
    pub authorization: PartAuthorization,
    pub state: PartState,
    pub uploaded_bytes: u64,
    /// Checksum reported to the server once the part is uploaded.
    pub checksum: Option<String>,
}

/// One attempt to move one file to one destination.
///
/// Owned by a single coordinator; a retry builds a new session instead of
/// mutating an old one.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub session_id: String,
    pub organization_id: String,
    pub video_id: String,
    pub total_bytes: u64,
    pub part_size: u64,
    pub parts: Vec<PartDescriptor>,
    pub status: UploadStatus,
}

impl UploadSession {
    /// Creates a session from planned ranges and their authorizations.
    ///
    /// `ranges` and `authorizations` are matched by index; the caller is
    /// responsible for having validated that they line up.
    pub fn new(
        session_id: String,
        organization_id: String,
        video_id: String,
        total_bytes: u64,
        part_size: u64,
        ranges: &[ByteRange],
        authorizations: Vec<PartAuthorization>,
    ) -> Self {
        let parts = ranges
            .iter()
            .zip(authorizations)
            .map(|(range, authorization)| PartDescriptor {
                index: authorization.index,
                range: *range,
                authorization,
                state: PartState::Pending,
                uploaded_bytes: 0,
                checksum: None,
            })
            .collect();

        Self {
            session_id,
            organization_id,
            video_id,
            total_bytes,
            part_size,
            parts,
            status: UploadStatus::Uploading,
        }
    }

    /// Returns the part with the given index.
    pub fn part(&self, index: u32) -> Option<&PartDescriptor> {
        self.parts.get(index as usize)
    }

    /// Marks a part as on the wire.
    pub fn mark_uploading(&mut self, index: u32) {
        if let Some(p) = self.parts.get_mut(index as usize)
            && p.state != PartState::Uploaded
        {
            p.state = PartState::Uploading;
        }
    }

    /// Marks a part as acknowledged by the server.
    pub fn mark_uploaded(&mut self, index: u32, checksum: Option<String>) {
        if let Some(p) = self.parts.get_mut(index as usize) {
            p.state = PartState::Uploaded;
            p.uploaded_bytes = p.range.len();
            p.checksum = checksum;
        }
    }

    /// Marks a part as failed after its attempt budget ran out.
    pub fn mark_failed(&mut self, index: u32) {
        if let Some(p) = self.parts.get_mut(index as usize)
            && p.state != PartState::Uploaded
        {
            p.state = PartState::Failed;
            p.uploaded_bytes = 0;
        }
    }

    /// Returns every part still on the wire to `pending`.
    ///
    /// Used when a session is aborted so that no interrupted part reads as
    /// uploaded.
    pub fn abort_in_flight(&mut self) {
        for p in &mut self.parts {
            if p.state == PartState::Uploading {
                p.state = PartState::Pending;
                p.uploaded_bytes = 0;
            }
        }
    }

    /// Indexes of parts that still need to be sent, in ascending order.
    pub fn pending_indexes(&self) -> Vec<u32> {
        self.parts
            .iter()
            .filter(|p| p.state != PartState::Uploaded)
            .map(|p| p.index)
            .collect()
    }

    /// Sum of the sizes of uploaded parts.
    pub fn uploaded_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.state == PartState::Uploaded)
            .map(|p| p.range.len())
            .sum()
    }

    /// Number of uploaded parts.
    pub fn completed_parts(&self) -> u32 {
        self.parts
            .iter()
            .filter(|p| p.state == PartState::Uploaded)
            .count() as u32
    }

    /// Total number of parts.
    pub fn total_parts(&self) -> u32 {
        self.parts.len() as u32
    }

    /// Whether every part has been acknowledged.
    pub fn is_fully_uploaded(&self) -> bool {
        self.parts.iter().all(|p| p.state == PartState::Uploaded)
    }
}
