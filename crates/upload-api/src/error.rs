//! Upload API error types.

/// Errors produced while talking to the Upload API or a part destination.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Video missing, not owned by the organization, or caller not authorized.
    #[error("upload session rejected ({status}): {body}")]
    SessionInit { status: u16, body: String },

    /// A part destination refused the transfer; its authorization is no
    /// longer valid and the whole session must be re-initialized.
    #[error("part {index} destination rejected with {status}")]
    PartAuthExpired { index: u32, status: u16 },

    /// Timeout, connection reset or 5xx. Safe to retry.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The session was superseded or already finalized elsewhere.
    #[error("session conflict: {0}")]
    Conflict(String),

    /// Finalize found parts the server never recorded.
    #[error("server is missing parts {missing:?}")]
    IncompleteParts { missing: Vec<u32> },

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("invalid session cookie")]
    InvalidCookie,

    #[error("cancelled")]
    Cancelled,
}

impl ApiError {
    /// Returns `true` for failures the caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Maps a `reqwest` send failure: timeouts and connection problems are
    /// transient, anything else (builder, decode) is not.
    pub(crate) fn from_send(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            Self::Transient(err.to_string())
        } else {
            Self::Http(err)
        }
    }
}
