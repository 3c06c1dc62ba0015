use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Privacy-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// When true, all network requests are blocked.
    pub local_only: bool,
    /// Allowed domains when local_only is false. Subdomains are allowed too.
    pub allowed_domains: Vec<String>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            local_only: false,
            allowed_domains: Self::default_allowed_domains(),
        }
    }
}

impl PrivacyConfig {
    /// Default allowed domains for hub metadata and model downloads.
    pub fn default_allowed_domains() -> Vec<String> {
        vec![
            "huggingface.co".to_string(),
            "hf.co".to_string(),
            "cdn-lfs.huggingface.co".to_string(),
            "cdn-lfs-us-1.huggingface.co".to_string(),
            "cas-bridge.xethub.hf.co".to_string(),
        ]
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Enable file logging with rotation.
    pub file_logging: bool,
    /// Maximum number of log files to keep.
    pub max_files: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: true,
            max_files: 7,
        }
    }
}

/// Download coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Artifact store root. Defaults to `<data_dir>/models`.
    pub store_dir: Option<PathBuf>,
    /// Maximum number of transfer sessions running at once.
    pub max_concurrent_transfers: usize,
    /// Retries of a transient failure before the record is marked failed.
    /// A range mismatch restarts from zero once even when this is 0.
    pub max_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub backoff_base_ms: u64,
    /// Upper bound for the retry delay.
    pub backoff_max_ms: u64,
    /// Minimum interval between byte-count events of one record.
    pub progress_interval_ms: u64,
    /// Whole-request timeout for one transfer (large shards take a while).
    pub request_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            max_concurrent_transfers: 2,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            progress_interval_ms: 250,
            request_timeout_secs: 3600,
        }
    }
}

impl DownloadConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(32);
        self.backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms)
    }
}

/// Model hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Hub base URL.
    pub endpoint: String,
    /// Default revision (branch, tag or commit).
    pub revision: String,
    /// Access token for gated models. Falls back to the HF_TOKEN environment variable.
    pub token: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            token: None,
        }
    }
}

impl HubConfig {
    /// Token from config, else from the environment.
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var("HF_TOKEN").ok().filter(|t| !t.trim().is_empty()))
    }
}

/// Accelerator capability probing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityConfig {
    /// When false, the CPU target is always selected.
    pub prefer_accelerator: bool,
    /// Newest compute capability the installed runtime ships kernels for
    /// (e.g., "9.0"). Newer devices are reported incompatible without testing.
    pub compute_capability_ceiling: Option<String>,
    /// Upper bound for one smoke test.
    pub smoke_test_timeout_secs: u64,
    /// Command running a small matrix multiply on a CUDA device.
    /// `{device}` is replaced by the device ordinal.
    pub cuda_smoke_test: Vec<String>,
    /// Command running a small matrix multiply on the Metal device.
    pub metal_smoke_test: Vec<String>,
}

impl Default for CapabilityConfig {
    fn default() -> Self {
        Self {
            prefer_accelerator: true,
            compute_capability_ceiling: None,
            smoke_test_timeout_secs: 60,
            cuda_smoke_test: vec![
                "python".to_string(),
                "-c".to_string(),
                "import torch; x = torch.randn(100, 100, device='cuda:{device}'); \
                 y = torch.mm(x, x); torch.cuda.synchronize(); print(float(y.sum()))"
                    .to_string(),
            ],
            metal_smoke_test: vec![
                "python".to_string(),
                "-c".to_string(),
                "import torch; x = torch.randn(100, 100, device='mps'); \
                 y = torch.mm(x, x); torch.mps.synchronize(); print(float(y.sum()))"
                    .to_string(),
            ],
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub privacy: PrivacyConfig,
    pub logging: LoggingConfig,
    pub downloads: DownloadConfig,
    pub hub: HubConfig,
    pub capability: CapabilityConfig,
}

impl AppConfig {
    /// Create a new AppConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }
}
