use serde::{Deserialize, Serialize};

/// Lifecycle state of one upload session.
///
/// Sessions only move forward: `initializing → uploading → completing →
/// completed`, with `failed` and `cancelled` as terminal side exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploadStatus {
    Initializing,
    Uploading,
    Completing,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    /// Returns `true` for `completed`, `failed` and `cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` while bytes may still move for this session.
    ///
    /// This is the set mirrored to durable storage for diagnostics.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Initializing | Self::Uploading)
    }

    /// Whether a session in `self` may move to `next`.
    ///
    /// Staying in the same state is allowed (byte-progress updates).
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        if self == next {
            return !self.is_terminal();
        }
        match self {
            Initializing => matches!(next, Uploading | Failed | Cancelled),
            Uploading => matches!(next, Completing | Failed | Cancelled),
            Completing => matches!(next, Completed | Failed),
            Completed | Failed | Cancelled => false,
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Uploading => "uploading",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Category of a terminal upload failure.
///
/// UIs use this to pick an affordance: `incompleteParts` suggests a retry
/// with the same file, `sessionInit` suggests checking the video record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    SessionInit,
    PartAuthExpired,
    TransientNetwork,
    Conflict,
    IncompleteParts,
    Cancelled,
    Io,
    Other,
}

/// Failure details attached to a `failed` progress projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Observable projection of one upload session.
///
/// `uploaded_bytes` and `completed_parts` count parts the server has
/// acknowledged and never decrease within a session. `in_flight_bytes` is
/// the live byte count of parts still on the wire and may fall back when a
/// part attempt is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadProgress {
    pub video_id: String,
    pub file_name: String,
    pub total_bytes: u64,
    pub uploaded_bytes: u64,
    #[serde(default)]
    pub in_flight_bytes: u64,
    pub completed_parts: u32,
    pub total_parts: u32,
    pub status: UploadStatus,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<UploadFailure>,
}

impl UploadProgress {
    /// Creates the projection for a session that has just been created.
    pub fn initializing(
        video_id: impl Into<String>,
        file_name: impl Into<String>,
        total_bytes: u64,
        total_parts: u32,
    ) -> Self {
        Self {
            video_id: video_id.into(),
            file_name: file_name.into(),
            total_bytes,
            uploaded_bytes: 0,
            in_flight_bytes: 0,
            completed_parts: 0,
            total_parts,
            status: UploadStatus::Initializing,
            retries: 0,
            error: None,
        }
    }

    /// Returns the acknowledged progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return if self.status == UploadStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        self.uploaded_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    /// Bytes acknowledged plus bytes currently on the wire, capped at the total.
    pub fn live_bytes(&self) -> u64 {
        self.uploaded_bytes
            .saturating_add(self.in_flight_bytes)
            .min(self.total_bytes)
    }
}

/// One in-flight upload as mirrored to durable local storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUpload {
    pub video_id: String,
    pub organization_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialization() {
        assert_eq!(
            serde_json::to_string(&UploadStatus::Initializing).unwrap(),
            "\"initializing\""
        );
        assert_eq!(
            serde_json::to_string(&UploadStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let s: UploadStatus = serde_json::from_str("\"completing\"").unwrap();
        assert_eq!(s, UploadStatus::Completing);
    }

    #[test]
    fn forward_transitions_allowed() {
        use UploadStatus::*;
        assert!(Initializing.can_transition_to(Uploading));
        assert!(Initializing.can_transition_to(Failed));
        assert!(Initializing.can_transition_to(Cancelled));
        assert!(Uploading.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Completing));
        assert!(Uploading.can_transition_to(Cancelled));
        assert!(Completing.can_transition_to(Completed));
        assert!(Completing.can_transition_to(Failed));
    }

    #[test]
    fn backward_and_terminal_transitions_rejected() {
        use UploadStatus::*;
        assert!(!Uploading.can_transition_to(Initializing));
        assert!(!Completing.can_transition_to(Uploading));
        assert!(!Completing.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Uploading));
        assert!(!Cancelled.can_transition_to(Initializing));
    }

    #[test]
    fn active_and_terminal_sets() {
        use UploadStatus::*;
        assert!(Initializing.is_active());
        assert!(Uploading.is_active());
        assert!(!Completing.is_active());
        assert!(!Completing.is_terminal());
        for s in [Completed, Failed, Cancelled] {
            assert!(s.is_terminal());
            assert!(!s.is_active());
        }
    }

    #[test]
    fn progress_field_names() {
        let p = UploadProgress::initializing("v1", "match.mp4", 100, 10);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["videoId"], "v1");
        assert_eq!(json["fileName"], "match.mp4");
        assert_eq!(json["totalParts"], 10);
        assert_eq!(json["status"], "initializing");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn progress_percentage() {
        let mut p = UploadProgress::initializing("v1", "a.mp4", 1000, 4);
        p.uploaded_bytes = 500;
        assert!((p.percentage() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn progress_percentage_empty_file() {
        let mut p = UploadProgress::initializing("v1", "empty.mp4", 0, 1);
        assert!((p.percentage() - 0.0).abs() < f64::EPSILON);
        p.status = UploadStatus::Completed;
        assert!((p.percentage() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn live_bytes_capped() {
        let mut p = UploadProgress::initializing("v1", "a.mp4", 100, 2);
        p.uploaded_bytes = 60;
        p.in_flight_bytes = 70;
        assert_eq!(p.live_bytes(), 100);
    }

    #[test]
    fn failure_kind_serialization() {
        let f = UploadFailure {
            kind: ErrorKind::IncompleteParts,
            message: "server is missing parts [3]".into(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"incompleteParts\""));
    }

    #[test]
    fn active_upload_field_names() {
        let json = r#"{"videoId":"v1","organizationId":"o1"}"#;
        let a: ActiveUpload = serde_json::from_str(json).unwrap();
        assert_eq!(a.video_id, "v1");
        assert_eq!(a.organization_id, "o1");
    }
}
