//! Client side of the Upload API.
//!
//! [`UploadApi`] negotiates multipart sessions (init, part reports,
//! finalize, status queries, thumbnails) and [`PartTransport`] moves one
//! part's bytes to its pre-authorized destination. Both are traits so the
//! coordinator can be driven by in-memory mocks; [`HttpUploadApi`] and
//! [`HttpPartTransport`] are the `reqwest` implementations.

pub mod api;
pub mod error;
pub mod http;
pub mod transport;

#[cfg(test)]
mod mock_http;

pub use api::{ApiFuture, UploadApi, UploadTarget};
pub use error::ApiError;
pub use http::HttpUploadApi;
pub use transport::{BytesCallback, HttpPartTransport, PartReceipt, PartTransport};
