use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Body of `POST .../upload/init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub total_bytes: u64,
    pub part_size: u64,
}

/// Body of `POST .../upload/parts/{index}/complete`.
///
/// `session_id` lets the server answer `409` for reports against a
/// superseded session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePartRequest {
    pub checksum: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
}

/// Body of `POST .../upload/complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

/// A short-lived, single-use destination for one part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartAuthorization {
    pub index: u32,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PartAuthorization {
    /// Returns `true` if the authorization carries an expiry at or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// Response of `POST .../upload/init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub session_id: String,
    pub parts: Vec<PartAuthorization>,
}

/// Response of a successful `POST .../upload/complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeResponse {
    pub object_location: String,
}

/// Body of a `409` from `POST .../upload/complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingPartsResponse {
    #[serde(default)]
    pub missing_part_indexes: Vec<u32>,
}

/// Response of `GET .../upload/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub session_id: String,
    #[serde(default)]
    pub completed_part_indexes: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn init_request_field_names() {
        let req = InitUploadRequest {
            total_bytes: 104_857_600,
            part_size: 10_485_760,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"totalBytes":104857600,"partSize":10485760}"#);
    }

    #[test]
    fn init_response_parses_parts() {
        let json = r#"{
            "sessionId": "s-1",
            "parts": [
                {"index": 0, "url": "https://bucket/p0", "expiresAt": "2026-01-01T00:00:00Z"},
                {"index": 1, "url": "https://bucket/p1"}
            ]
        }"#;
        let resp: InitUploadResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.session_id, "s-1");
        assert_eq!(resp.parts.len(), 2);
        assert_eq!(resp.parts[0].index, 0);
        assert!(resp.parts[0].expires_at.is_some());
        assert!(resp.parts[1].expires_at.is_none());
    }

    #[test]
    fn authorization_expiry() {
        let exp = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let auth = PartAuthorization {
            index: 0,
            url: "https://bucket/p0".into(),
            expires_at: Some(exp),
        };
        assert!(!auth.is_expired_at(exp - chrono::Duration::seconds(1)));
        assert!(auth.is_expired_at(exp));

        let no_expiry = PartAuthorization {
            expires_at: None,
            ..auth
        };
        assert!(!no_expiry.is_expired_at(exp + chrono::Duration::days(365)));
    }

    #[test]
    fn missing_parts_defaults_empty() {
        let resp: MissingPartsResponse = serde_json::from_str("{}").unwrap();
        assert!(resp.missing_part_indexes.is_empty());

        let resp: MissingPartsResponse =
            serde_json::from_str(r#"{"missingPartIndexes":[3,7]}"#).unwrap();
        assert_eq!(resp.missing_part_indexes, vec![3, 7]);
    }

    #[test]
    fn status_response_field_names() {
        let json = r#"{"sessionId":"s-9","completedPartIndexes":[0,1,2]}"#;
        let resp: UploadStatusResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.session_id, "s-9");
        assert_eq!(resp.completed_part_indexes, vec![0, 1, 2]);
    }

    #[test]
    fn complete_part_request_omits_empty_session() {
        let req = CompletePartRequest {
            checksum: "abc".into(),
            session_id: String::new(),
        };
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"checksum":"abc"}"#);
    }

    #[test]
    fn finalize_bodies() {
        let req = FinalizeRequest {
            session_id: "s-1".into(),
        };
        assert_eq!(serde_json::to_string(&req).unwrap(), r#"{"sessionId":"s-1"}"#);

        let resp: FinalizeResponse =
            serde_json::from_str(r#"{"objectLocation":"videos/o1/v1.mp4"}"#).unwrap();
        assert_eq!(resp.object_location, "videos/o1/v1.mp4");
    }
}
