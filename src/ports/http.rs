use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::domain::{DomainError, PrivacyConfig, TransferError};

/// Body of a ranged response, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransferError>> + Send>>;

/// A successful (200 or 206) answer to a ranged GET.
pub struct RangeResponse {
    /// Offset of the first body byte within the remote resource.
    pub start: u64,
    /// Total size of the remote resource, when reported.
    pub total_size: Option<u64>,
    /// SHA-256 advertised by the remote (normalized), when present.
    pub digest: Option<String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeResponse")
            .field("start", &self.start)
            .field("total_size", &self.total_size)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

/// HTTP client port for all network requests.
/// All network traffic must go through this interface.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform a GET request and return the body as text.
    async fn get_text(&self, url: &str) -> Result<String, DomainError>;

    /// GET `url` starting at byte `offset`.
    ///
    /// Non-success statuses are classified into the transfer error taxonomy:
    /// 416 is an invalid range, 408/429/5xx are transient, other 4xx are rejections.
    async fn fetch_range(&self, url: &str, offset: u64) -> Result<RangeResponse, TransferError>;

    /// Check if network requests are currently blocked.
    fn is_network_blocked(&self) -> bool;

    /// Get the list of allowed domains (when not in local-only mode).
    fn allowed_domains(&self) -> Vec<String>;

    /// Apply updated privacy settings to subsequent requests.
    fn apply_privacy(&self, _privacy: &PrivacyConfig) {}
}
