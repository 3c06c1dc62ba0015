use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{TransferError, TransferErrorKind};

/// Role a file plays in a model's file set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Weight shard (safetensors, bin, gguf, ...).
    Weights,
    /// Tokenizer definition or vocabulary.
    Tokenizer,
    /// Model or generation config.
    Config,
}

impl ArtifactKind {
    /// Classify a repository file by name. Returns None for files a model
    /// does not need to run (README, images, training scripts).
    pub fn classify(file_name: &str) -> Option<Self> {
        let base = file_name.rsplit('/').next().unwrap_or(file_name).to_lowercase();

        match base.as_str() {
            "config.json" | "generation_config.json" => return Some(ArtifactKind::Config),
            "tokenizer.json"
            | "tokenizer_config.json"
            | "tokenizer.model"
            | "special_tokens_map.json"
            | "vocab.json"
            | "vocab.txt"
            | "merges.txt"
            | "added_tokens.json" => return Some(ArtifactKind::Tokenizer),
            _ => {}
        }

        if base.ends_with(".safetensors.index.json") || base.ends_with(".bin.index.json") {
            return Some(ArtifactKind::Config);
        }

        let ext = base.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "safetensors" | "bin" | "pth" | "pt" | "gguf" => Some(ArtifactKind::Weights),
            _ => None,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Weights => write!(f, "weights"),
            ArtifactKind::Tokenizer => write!(f, "tokenizer"),
            ArtifactKind::Config => write!(f, "config"),
        }
    }
}

/// Lifecycle of a single artifact.
///
/// State transitions:
/// - NotStarted -> InProgress (session opened)
/// - InProgress -> Paused (pause signal, partial file kept)
/// - InProgress -> Verifying -> Complete | Failed
/// - InProgress -> Failed (non-retryable transfer error or retries exhausted)
/// - Paused | Failed -> InProgress (resume / manual retry)
/// - any non-complete state -> NotStarted (cancel)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    NotStarted,
    InProgress,
    Paused,
    Verifying,
    Complete,
    Failed,
}

impl ArtifactStatus {
    /// A session currently owns the record.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, ArtifactStatus::InProgress | ArtifactStatus::Verifying)
    }

    /// Picked up again by a resume. Failed records need an explicit retry.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        matches!(self, ArtifactStatus::NotStarted | ArtifactStatus::Paused)
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactStatus::NotStarted => "not_started",
            ArtifactStatus::InProgress => "in_progress",
            ArtifactStatus::Paused => "paused",
            ArtifactStatus::Verifying => "verifying",
            ArtifactStatus::Complete => "complete",
            ArtifactStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Unique identity of an artifact: (model identifier, file name).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub model_id: String,
    pub file_name: String,
}

impl ArtifactKey {
    pub fn new(model_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            file_name: file_name.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.model_id, self.file_name)
    }
}

/// Last failure recorded against an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub kind: TransferErrorKind,
    pub message: String,
}

impl From<&TransferError> for RecordError {
    fn from(err: &TransferError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// One file belonging to one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Owning model identifier (e.g., "Qwen/Qwen2.5-7B-Instruct").
    pub model_id: String,
    /// File name relative to the model root; may contain `/`.
    pub file_name: String,
    /// Remote download URL.
    pub url: String,
    pub kind: ArtifactKind,
    /// Expected size in bytes, from remote metadata.
    pub expected_size: u64,
    /// Expected lowercase hex SHA-256, when the remote supplies one.
    pub expected_checksum: Option<String>,
    pub status: ArtifactStatus,
    pub bytes_downloaded: u64,
    pub last_error: Option<RecordError>,
}

impl ArtifactRecord {
    pub fn new(
        model_id: impl Into<String>,
        file_name: impl Into<String>,
        url: impl Into<String>,
        kind: ArtifactKind,
        expected_size: u64,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            file_name: file_name.into(),
            url: url.into(),
            kind,
            expected_size,
            expected_checksum: None,
            status: ArtifactStatus::NotStarted,
            bytes_downloaded: 0,
            last_error: None,
        }
    }

    /// Attach an expected checksum. Values that are not a SHA-256 hex digest are ignored.
    pub fn with_checksum(mut self, checksum: &str) -> Self {
        self.expected_checksum = normalize_sha256(checksum);
        self
    }

    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(self.model_id.clone(), self.file_name.clone())
    }

    /// Record progress. While a session is running, the count never goes backwards.
    pub fn advance(&mut self, bytes: u64) {
        if self.status.is_active() {
            self.bytes_downloaded = self.bytes_downloaded.max(bytes);
        } else {
            self.bytes_downloaded = bytes;
        }
    }

    /// Forget downloaded bytes; used when partial data is discarded.
    pub fn reset(&mut self) {
        self.bytes_downloaded = 0;
    }

    /// Download progress as percentage (0.0 - 100.0).
    pub fn percent(&self) -> f32 {
        if self.expected_size == 0 {
            return if self.status == ArtifactStatus::Complete { 100.0 } else { 0.0 };
        }
        (self.bytes_downloaded as f32 / self.expected_size as f32) * 100.0
    }
}

/// Aggregate state of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    /// Nothing running, nothing failed, not everything complete.
    Pending,
    Downloading,
    Paused,
    Ready,
    /// At least one record failed; other records may still be transferring.
    Failed,
}

/// Ordered set of artifacts required for a model to be usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub model_id: String,
    /// Hub revision the manifest was resolved against.
    pub revision: Option<String>,
    /// Parameter count reported by the hub, used for memory fit estimates.
    pub parameter_count: Option<u64>,
    pub records: Vec<ArtifactRecord>,
}

impl ModelManifest {
    pub fn new(model_id: impl Into<String>, records: Vec<ArtifactRecord>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: None,
            parameter_count: None,
            records,
        }
    }

    /// A manifest is ready iff every record is complete.
    pub fn is_ready(&self) -> bool {
        !self.records.is_empty()
            && self
                .records
                .iter()
                .all(|r| r.status == ArtifactStatus::Complete)
    }

    pub fn status(&self) -> ManifestStatus {
        if self.is_ready() {
            return ManifestStatus::Ready;
        }
        let has = |s: ArtifactStatus| self.records.iter().any(|r| r.status == s);
        if has(ArtifactStatus::Failed) {
            ManifestStatus::Failed
        } else if self.records.iter().any(|r| r.status.is_active()) {
            ManifestStatus::Downloading
        } else if has(ArtifactStatus::Paused) {
            ManifestStatus::Paused
        } else {
            ManifestStatus::Pending
        }
    }

    pub fn record(&self, file_name: &str) -> Option<&ArtifactRecord> {
        self.records.iter().find(|r| r.file_name == file_name)
    }

    pub fn record_mut(&mut self, file_name: &str) -> Option<&mut ArtifactRecord> {
        self.records.iter_mut().find(|r| r.file_name == file_name)
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.expected_size).sum()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.records.iter().map(|r| r.bytes_downloaded).sum()
    }

    /// File names of failed records, in manifest order.
    pub fn failed_files(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.status == ArtifactStatus::Failed)
            .map(|r| r.file_name.clone())
            .collect()
    }
}

/// Normalize a SHA-256 digest as found in metadata or headers.
///
/// Accepts quoted values and a `sha256:` prefix; returns lowercase hex, or
/// None when the value is not a 64-character hex digest.
pub fn normalize_sha256(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches("W/").trim_matches('"');
    let digest = trimmed.strip_prefix("sha256:").unwrap_or(trimmed);
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(digest.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    fn record(file: &str, status: ArtifactStatus) -> ArtifactRecord {
        let mut r = ArtifactRecord::new("org/model", file, "https://x/y", ArtifactKind::Weights, 10);
        r.status = status;
        r
    }

    #[test]
    fn test_classify() {
        assert_eq!(ArtifactKind::classify("config.json"), Some(ArtifactKind::Config));
        assert_eq!(ArtifactKind::classify("tokenizer.json"), Some(ArtifactKind::Tokenizer));
        assert_eq!(
            ArtifactKind::classify("model-00001-of-00002.safetensors"),
            Some(ArtifactKind::Weights)
        );
        assert_eq!(ArtifactKind::classify("onnx/model.bin"), Some(ArtifactKind::Weights));
        assert_eq!(
            ArtifactKind::classify("model.safetensors.index.json"),
            Some(ArtifactKind::Config)
        );
        assert_eq!(ArtifactKind::classify("README.md"), None);
        assert_eq!(ArtifactKind::classify("LICENSE"), None);
    }

    #[test]
    fn test_resumable_states() {
        assert!(ArtifactStatus::NotStarted.is_resumable());
        assert!(ArtifactStatus::Paused.is_resumable());
        assert!(!ArtifactStatus::Failed.is_resumable());
        assert!(!ArtifactStatus::Complete.is_resumable());
        assert_eq!(
            record("tokenizer.json", ArtifactStatus::Failed).key().to_string(),
            "org/model::tokenizer.json"
        );
    }

    #[test]
    fn test_normalize_sha256() {
        assert_eq!(normalize_sha256(DIGEST).as_deref(), Some(DIGEST));
        let quoted = format!("\"{}\"", DIGEST.to_uppercase());
        assert_eq!(normalize_sha256(&quoted).as_deref(), Some(DIGEST));
        let prefixed = format!("sha256:{}", DIGEST);
        assert_eq!(normalize_sha256(&prefixed).as_deref(), Some(DIGEST));
        // Git blob SHA-1 etags are not content digests
        assert!(normalize_sha256("\"a94a8fe5ccb19ba61c4c0873d391e987982fbbd3\"").is_none());
    }

    #[test]
    fn test_advance_is_monotonic_while_active() {
        let mut r = record("a.bin", ArtifactStatus::InProgress);
        r.advance(5);
        r.advance(3);
        assert_eq!(r.bytes_downloaded, 5);

        r.status = ArtifactStatus::NotStarted;
        r.advance(0);
        assert_eq!(r.bytes_downloaded, 0);
    }

    #[test]
    fn test_manifest_status() {
        let mut m = ModelManifest::new(
            "org/model",
            vec![
                record("a.bin", ArtifactStatus::Complete),
                record("b.json", ArtifactStatus::NotStarted),
            ],
        );
        assert_eq!(m.status(), ManifestStatus::Pending);
        assert!(!m.is_ready());

        m.records[1].status = ArtifactStatus::InProgress;
        assert_eq!(m.status(), ManifestStatus::Downloading);

        m.records[1].status = ArtifactStatus::Failed;
        assert_eq!(m.status(), ManifestStatus::Failed);
        assert_eq!(m.failed_files(), vec!["b.json".to_string()]);

        m.records[1].status = ArtifactStatus::Paused;
        assert_eq!(m.status(), ManifestStatus::Paused);

        m.records[1].status = ArtifactStatus::Complete;
        assert_eq!(m.status(), ManifestStatus::Ready);
        assert!(m.is_ready());
    }

    #[test]
    fn test_empty_manifest_is_not_ready() {
        assert!(!ModelManifest::new("org/model", vec![]).is_ready());
    }
}
