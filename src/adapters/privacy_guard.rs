use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_RANGE, ETAG, RANGE};
use reqwest::{redirect, Client, RequestBuilder, StatusCode};
use tracing::{debug, info, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::domain::{normalize_sha256, DomainError, PrivacyConfig, TransferError};
use crate::ports::{HttpClient, RangeResponse};

/// Maximum redirects followed per request (hub resolve URLs redirect to a CDN).
const MAX_REDIRECTS: usize = 10;

/// PrivacyGuard is an internal firewall that controls all HTTP requests.
/// In local-only mode, all network requests are blocked.
/// When network access is enabled, only whitelisted domains are allowed,
/// including the targets of redirects.
pub struct PrivacyGuard {
    client: Client,
    local_only: Arc<AtomicBool>,
    allowed_domains: Arc<RwLock<Vec<String>>>,
    hub_token: Option<Zeroizing<String>>,
    token_host: Option<String>,
    request_timeout: Duration,
}

impl PrivacyGuard {
    /// Create a new PrivacyGuard with the given settings.
    pub fn new(local_only: bool, allowed_domains: Vec<String>) -> Result<Self, DomainError> {
        let local_only = Arc::new(AtomicBool::new(local_only));
        let allowed = Arc::new(RwLock::new(allowed_domains));

        let policy_local_only = Arc::clone(&local_only);
        let policy_allowed = Arc::clone(&allowed);
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error("too many redirects");
            }
            let host_ok = attempt
                .url()
                .host_str()
                .map(|host| host_matches(host, &policy_allowed.read()))
                .unwrap_or(false);
            if policy_local_only.load(Ordering::SeqCst) || !host_ok {
                warn!(url = %attempt.url(), "Redirect blocked: domain not in whitelist");
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let client = Client::builder()
            .use_rustls_tls()
            .user_agent(format!("Termitas/{}", env!("CARGO_PKG_VERSION")))
            .redirect(policy)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DomainError::HttpRequest(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            local_only = local_only.load(Ordering::SeqCst),
            allowed_domains = ?*allowed.read(),
            "PrivacyGuard initialized"
        );

        Ok(Self {
            client,
            local_only,
            allowed_domains: allowed,
            hub_token: None,
            token_host: None,
            request_timeout: Duration::from_secs(3600),
        })
    }

    /// Attach `token` as a bearer credential to requests for the hub host
    /// (and its subdomains) taken from `hub_endpoint`.
    pub fn with_hub_token(mut self, token: Option<String>, hub_endpoint: &str) -> Self {
        self.token_host = Url::parse(hub_endpoint)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        self.hub_token = token.map(Zeroizing::new);
        self
    }

    /// Whole-request timeout for ranged transfers.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set local-only mode.
    pub fn set_local_only(&self, local_only: bool) {
        let previous = self.local_only.swap(local_only, Ordering::SeqCst);
        if previous != local_only {
            info!(local_only = local_only, "PrivacyGuard mode changed");
        }
    }

    /// Update allowed domains.
    pub fn set_allowed_domains(&self, domains: Vec<String>) {
        let mut guard = self.allowed_domains.write();
        *guard = domains;
        info!(allowed_domains = ?*guard, "PrivacyGuard allowed domains updated");
    }

    /// Check if a URL is allowed based on current settings.
    fn is_url_allowed(&self, url: &str) -> Result<(), DomainError> {
        if self.local_only.load(Ordering::SeqCst) {
            warn!(url = url, "Network request blocked: local-only mode enabled");
            return Err(DomainError::NetworkBlocked {
                reason: "Local-only mode is enabled. All network requests are blocked.".to_string(),
            });
        }

        let parsed = Url::parse(url).map_err(|e| DomainError::HttpRequest(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| DomainError::HttpRequest("Invalid URL: no host".to_string()))?;

        if !host_matches(host, &self.allowed_domains.read()) {
            warn!(url = url, host = host, "Network request blocked: domain not in whitelist");
            return Err(DomainError::NetworkBlocked {
                reason: format!("Domain '{}' is not in the allowed list", host),
            });
        }

        debug!(url = url, "Network request allowed");
        Ok(())
    }

    fn should_authorize(&self, url: &str) -> bool {
        let (Some(_), Some(token_host)) = (&self.hub_token, &self.token_host) else {
            return false;
        };
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| host_matches(h, std::slice::from_ref(token_host))))
            .unwrap_or(false)
    }

    fn authorize(&self, request: RequestBuilder, url: &str) -> RequestBuilder {
        match &self.hub_token {
            Some(token) if self.should_authorize(url) => {
                request.header(AUTHORIZATION, format!("Bearer {}", token.as_str()))
            }
            _ => request,
        }
    }
}

/// Exact host match or subdomain of an allowed domain.
fn host_matches(host: &str, allowed: &[String]) -> bool {
    allowed
        .iter()
        .any(|d| host == d || host.ends_with(&format!(".{}", d)))
}

/// Map a non-success status of a transfer request to a failure kind.
fn classify_status(status: StatusCode, url: &str) -> TransferError {
    let message = format!("HTTP {} for {}", status, url);
    match status {
        StatusCode::RANGE_NOT_SATISFIABLE => TransferError::InvalidRange(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransferError::Transient(message)
        }
        s if s.is_server_error() => TransferError::Transient(message),
        _ => TransferError::Rejected(message),
    }
}

/// Parse `bytes <start>-<end>/<total|*>`.
fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let spec = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = spec.split_once('/')?;
    let (start, end) = range.trim().split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    Some((start, end, total))
}

/// SHA-256 advertised by the remote. The hub puts the LFS object id in
/// `X-Linked-Etag`; CDNs often use it as the plain `ETag`.
fn advertised_digest(headers: &HeaderMap) -> Option<String> {
    ["x-linked-etag", ETAG.as_str()]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .find_map(normalize_sha256)
}

#[async_trait]
impl HttpClient for PrivacyGuard {
    async fn get_text(&self, url: &str) -> Result<String, DomainError> {
        self.is_url_allowed(url)?;

        let request = self.authorize(self.client.get(url).timeout(Duration::from_secs(60)), url);
        let response = request
            .send()
            .await
            .map_err(|e| DomainError::HttpRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DomainError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response
            .text()
            .await
            .map_err(|e| DomainError::HttpRequest(e.to_string()))
    }

    async fn fetch_range(&self, url: &str, offset: u64) -> Result<RangeResponse, TransferError> {
        self.is_url_allowed(url)
            .map_err(|e| TransferError::Rejected(e.to_string()))?;

        let mut request = self.client.get(url).timeout(self.request_timeout);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let request = self.authorize(request, url);

        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = url, status = %status, offset, "Transfer request failed");
            return Err(classify_status(status, url));
        }

        let headers = response.headers();
        let digest = advertised_digest(headers);
        let (start, total_size) = if status == StatusCode::PARTIAL_CONTENT {
            let value = headers
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    TransferError::InvalidRange("206 response without Content-Range".to_string())
                })?;
            let (start, _end, total) = parse_content_range(value).ok_or_else(|| {
                TransferError::InvalidRange(format!("Malformed Content-Range: {}", value))
            })?;
            (start, total)
        } else {
            (0, response.content_length())
        };

        debug!(
            url = url,
            status = %status,
            offset,
            start,
            total_size = ?total_size,
            "Transfer response received"
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransferError::Transient(e.to_string())));

        Ok(RangeResponse {
            start,
            total_size,
            digest,
            body: Box::pin(body),
        })
    }

    fn is_network_blocked(&self) -> bool {
        self.local_only.load(Ordering::SeqCst)
    }

    fn allowed_domains(&self) -> Vec<String> {
        self.allowed_domains.read().clone()
    }

    fn apply_privacy(&self, privacy: &PrivacyConfig) {
        self.set_allowed_domains(privacy.allowed_domains.clone());
        self.set_local_only(privacy.local_only);
    }
}
