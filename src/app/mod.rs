pub mod capability_probe;
pub mod controller;
pub mod coordinator;
pub mod transfer;

pub use capability_probe::CapabilityProbe;
pub use controller::{AppController, EngineLoadRequest};
pub use coordinator::DownloadCoordinator;
pub use transfer::{SessionControl, SessionOutcome, SessionProgress, StopReason, TransferSession};
