use async_trait::async_trait;

use crate::domain::{AcceleratorDevice, DomainError, HardwareProfile};

/// Port for accelerator discovery and testing.
///
/// Implementations talk to drivers and the installed inference runtime.
/// Test doubles inject devices and smoke-test outcomes.
#[async_trait]
pub trait AcceleratorRuntime: Send + Sync {
    /// Detect the host CPU profile.
    fn host_profile(&self) -> Result<HardwareProfile, DomainError>;

    /// List accelerators that are present, in no particular order.
    ///
    /// Presence says nothing about whether the runtime can use them.
    fn detect(&self) -> Result<Vec<AcceleratorDevice>, DomainError>;

    /// Run a minimal real computation on the device through the installed runtime.
    ///
    /// Returns the failure reason when the computation does not succeed.
    async fn smoke_test(&self, device: &AcceleratorDevice) -> Result<(), String>;
}
