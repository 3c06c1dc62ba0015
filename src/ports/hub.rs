use async_trait::async_trait;

use crate::domain::{DomainError, ModelManifest};

/// Port for the remote model hub.
#[async_trait]
pub trait ModelHub: Send + Sync {
    /// Resolve a model identifier into the manifest of files it needs.
    ///
    /// `revision` falls back to the configured default when None.
    /// `weights` narrows the weight files to one file name or one
    /// quantization tag (e.g. `Q4_K_M`), matched case-insensitively.
    async fn resolve(
        &self,
        model_id: &str,
        revision: Option<&str>,
        weights: Option<&str>,
    ) -> Result<ModelManifest, DomainError>;
}
