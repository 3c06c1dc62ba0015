pub mod artifact_store;
pub mod config_store;
pub mod hardware_detector;
pub mod hf_hub;
pub mod privacy_guard;

pub use artifact_store::{ArtifactStore, PartialFile};
pub use config_store::TomlConfigStore;
pub use hardware_detector::SystemAcceleratorRuntime;
pub use hf_hub::HfHubClient;
pub use privacy_guard::PrivacyGuard;
