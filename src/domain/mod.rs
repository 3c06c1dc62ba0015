pub mod artifact;
pub mod capability;
pub mod config;
pub mod error;
pub mod hardware;
pub mod progress;

pub use artifact::{
    normalize_sha256, ArtifactKey, ArtifactKind, ArtifactRecord, ArtifactStatus, ManifestStatus,
    ModelManifest, RecordError,
};
pub use capability::{
    AcceleratorBackend, AcceleratorDevice, CapabilityTarget, ComputeCapability, MemoryFit,
    Precision, ProbeReport, TargetKind, Verdict,
};
pub use config::{AppConfig, CapabilityConfig, DownloadConfig, HubConfig, PrivacyConfig};
pub use error::{DomainError, TransferError, TransferErrorKind};
pub use hardware::{CpuArch, HardwareProfile, SimdCapabilities};
pub use progress::{DownloadEvent, ProgressThrottle, RecordProgress, TransferRate};
