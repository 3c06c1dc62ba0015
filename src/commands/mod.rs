//! Collaborator-facing commands.
//!
//! Thin wrappers over [`AppController`] that take owned arguments and return
//! serializable values with string errors, the shape a desktop shell binds to.

use serde::Serialize;

use crate::app::{AppController, EngineLoadRequest};
use crate::domain::{
    AppConfig, ArtifactKind, ArtifactStatus, ManifestStatus, MemoryFit, ModelManifest,
    ProbeReport, RecordError,
};

/// Get the current application configuration.
pub fn get_config(controller: &AppController) -> Result<AppConfig, String> {
    Ok(controller.config())
}

/// Update the application configuration.
pub fn update_config(controller: &AppController, config: AppConfig) -> Result<(), String> {
    controller
        .update_config(config)
        .map_err(|e| e.to_string())
}

/// Check if network requests are currently blocked.
pub fn is_network_blocked(controller: &AppController) -> bool {
    controller.is_network_blocked()
}

/// Get application paths information.
pub fn get_paths(controller: &AppController) -> AppPaths {
    AppPaths {
        data_dir: controller.data_dir(),
        logs_dir: controller.logs_dir(),
        config_path: controller.config_path(),
        models_dir: controller.models_dir(),
    }
}

/// Application paths information.
#[derive(Debug, Serialize)]
pub struct AppPaths {
    pub data_dir: String,
    pub logs_dir: String,
    pub config_path: String,
    pub models_dir: String,
}

// ==================== Download Commands ====================

/// Download state of one file.
#[derive(Debug, Serialize)]
pub struct FileStatus {
    pub file_name: String,
    pub kind: ArtifactKind,
    pub state: ArtifactStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub percent: f32,
    pub error: Option<RecordError>,
}

/// Download state of a model.
#[derive(Debug, Serialize)]
pub struct ModelStatus {
    pub model_id: String,
    pub revision: Option<String>,
    pub status: ManifestStatus,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub files: Vec<FileStatus>,
}

impl From<&ModelManifest> for ModelStatus {
    fn from(manifest: &ModelManifest) -> Self {
        Self {
            model_id: manifest.model_id.clone(),
            revision: manifest.revision.clone(),
            status: manifest.status(),
            bytes_downloaded: manifest.downloaded_bytes(),
            total_bytes: manifest.total_bytes(),
            files: manifest
                .records
                .iter()
                .map(|r| FileStatus {
                    file_name: r.file_name.clone(),
                    kind: r.kind,
                    state: r.status,
                    bytes_downloaded: r.bytes_downloaded,
                    total_bytes: r.expected_size,
                    percent: r.percent(),
                    error: r.last_error.clone(),
                })
                .collect(),
        }
    }
}

/// Resolve a model on the hub and start downloading it.
///
/// `weights` names one weight file or quantization tag (e.g. `Q4_K_M`).
pub async fn download_model(
    controller: &AppController,
    model_id: String,
    revision: Option<String>,
    weights: Option<String>,
) -> Result<ModelStatus, String> {
    controller
        .download_model(&model_id, revision.as_deref(), weights.as_deref())
        .await
        .map(|manifest| ModelStatus::from(&manifest))
        .map_err(|e| e.to_string())
}

/// Pause a model's downloads, keeping their progress.
pub async fn pause_download(controller: &AppController, model_id: String) -> Result<(), String> {
    controller
        .pause_download(&model_id)
        .await
        .map_err(|e| e.to_string())
}

/// Resume a paused model.
pub async fn resume_download(controller: &AppController, model_id: String) -> Result<(), String> {
    controller
        .resume_download(&model_id)
        .await
        .map_err(|e| e.to_string())
}

/// Stop a model's downloads and discard partial data.
pub async fn cancel_download(controller: &AppController, model_id: String) -> Result<(), String> {
    controller
        .cancel_download(&model_id)
        .await
        .map_err(|e| e.to_string())
}

/// Retry failed files of a model, or only `file_name` when given.
pub async fn retry_download(
    controller: &AppController,
    model_id: String,
    file_name: Option<String>,
) -> Result<(), String> {
    controller
        .retry_download(&model_id, file_name.as_deref())
        .await
        .map_err(|e| e.to_string())
}

/// Delete a model's files.
pub async fn delete_model(controller: &AppController, model_id: String) -> Result<(), String> {
    controller
        .remove_model(&model_id)
        .await
        .map_err(|e| e.to_string())
}

/// Download state of one model.
pub fn get_model_status(
    controller: &AppController,
    model_id: String,
) -> Result<ModelStatus, String> {
    controller
        .manifest(&model_id)
        .map(|manifest| ModelStatus::from(&manifest))
        .ok_or_else(|| format!("Model not found: {}", model_id))
}

/// Download state of every known model.
pub fn list_models(controller: &AppController) -> Vec<ModelStatus> {
    controller
        .manifests()
        .iter()
        .map(ModelStatus::from)
        .collect()
}

/// Check if every file of a model is downloaded and verified.
pub fn is_model_ready(controller: &AppController, model_id: String) -> bool {
    controller.is_model_ready(&model_id)
}

/// Get the models directory path.
pub fn get_models_dir(controller: &AppController) -> String {
    controller.models_dir()
}

// ==================== Capability Commands ====================

/// Probe accelerators and report the selected execution target.
pub async fn probe_capabilities(controller: &AppController, refresh: bool) -> ProbeReport {
    controller.probe(refresh).await
}

/// Estimate how a model fits on the selected execution target.
pub async fn get_memory_fit(
    controller: &AppController,
    model_id: String,
) -> Result<MemoryFit, String> {
    controller
        .memory_fit(&model_id)
        .await
        .map_err(|e| e.to_string())
}

/// Everything needed to load a ready model.
pub async fn prepare_load(
    controller: &AppController,
    model_id: String,
) -> Result<EngineLoadRequest, String> {
    controller
        .prepare_load(&model_id)
        .await
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ArtifactRecord;

    #[test]
    fn test_model_status_from_manifest() {
        let mut weights = ArtifactRecord::new(
            "org/model",
            "model.safetensors",
            "https://huggingface.co/org/model/resolve/main/model.safetensors",
            ArtifactKind::Weights,
            1_000,
        );
        weights.advance(250);
        let config = ArtifactRecord::new(
            "org/model",
            "config.json",
            "https://huggingface.co/org/model/resolve/main/config.json",
            ArtifactKind::Config,
            100,
        );
        let manifest = ModelManifest::new("org/model", vec![weights, config]);

        let status = ModelStatus::from(&manifest);
        assert_eq!(status.total_bytes, 1_100);
        assert_eq!(status.bytes_downloaded, 250);
        assert_eq!(status.files.len(), 2);
        assert_eq!(status.files[0].percent, 25.0);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["files"][1]["file_name"], "config.json");
    }
}
