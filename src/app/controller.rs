use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use crate::adapters::{
    ArtifactStore, HfHubClient, PrivacyGuard, SystemAcceleratorRuntime, TomlConfigStore,
};
use crate::domain::{
    AppConfig, CapabilityTarget, DomainError, DownloadEvent, MemoryFit, ModelManifest, ProbeReport,
};
use crate::infrastructure::init_logging;
use crate::ports::{AcceleratorRuntime, ConfigStore, HttpClient, ModelHub};

use super::capability_probe::CapabilityProbe;
use super::coordinator::DownloadCoordinator;

/// Everything the inference engine needs to load a ready model.
#[derive(Debug, Clone, Serialize)]
pub struct EngineLoadRequest {
    pub model_id: String,
    /// Final paths of every artifact, in manifest order.
    pub paths: Vec<PathBuf>,
    pub target: CapabilityTarget,
    pub memory_fit: MemoryFit,
}

/// Application controller that wires the adapters together and exposes
/// the operations of the UI collaborator.
pub struct AppController {
    config: RwLock<AppConfig>,
    config_store: Arc<dyn ConfigStore>,
    http: Arc<dyn HttpClient>,
    hub: Arc<dyn ModelHub>,
    runtime: Arc<dyn AcceleratorRuntime>,
    store: Arc<ArtifactStore>,
    coordinator: DownloadCoordinator,
    probe: RwLock<Arc<CapabilityProbe>>,
    last_report: RwLock<Option<ProbeReport>>,
    _log_guard: Option<WorkerGuard>,
}

impl AppController {
    /// Initialize the application controller.
    /// This sets up configuration, logging, the privacy guard and the download stack,
    /// then registers the models saved by earlier runs.
    pub async fn new() -> Result<Self, DomainError> {
        // Step 1: Initialize config store
        let config_store = Arc::new(TomlConfigStore::new()?);

        // Step 2: Load configuration
        let config = config_store.load()?;

        // Step 3: Initialize logging
        let log_guard = init_logging(&config_store.logs_dir(), &config.logging)?;

        info!("Termitas starting up");

        // Step 4: Single HTTP client for all traffic
        let http = PrivacyGuard::new(
            config.privacy.local_only,
            config.privacy.allowed_domains.clone(),
        )?
        .with_hub_token(config.hub.resolve_token(), &config.hub.endpoint)
        .with_request_timeout(Duration::from_secs(config.downloads.request_timeout_secs.max(1)));
        let http: Arc<dyn HttpClient> = Arc::new(http);

        // Step 5: Hub, artifact store and accelerator runtime
        let hub = Arc::new(HfHubClient::new(Arc::clone(&http), &config.hub));
        let store_dir = config
            .downloads
            .store_dir
            .clone()
            .unwrap_or_else(|| config_store.default_store_dir());
        let store = Arc::new(ArtifactStore::new(store_dir)?);
        let runtime = Arc::new(SystemAcceleratorRuntime::new(&config.capability));

        let mut controller = Self::from_parts(config, config_store, http, hub, runtime, store);
        controller._log_guard = log_guard;

        // Step 6: Catalog of models already on disk
        controller.restore_models().await?;

        info!(
            local_only = controller.is_network_blocked(),
            "AppController initialized"
        );
        Ok(controller)
    }

    /// Assemble a controller from already constructed collaborators.
    ///
    /// Logging is left to the caller.
    pub fn from_parts(
        config: AppConfig,
        config_store: Arc<dyn ConfigStore>,
        http: Arc<dyn HttpClient>,
        hub: Arc<dyn ModelHub>,
        runtime: Arc<dyn AcceleratorRuntime>,
        store: Arc<ArtifactStore>,
    ) -> Self {
        let coordinator =
            DownloadCoordinator::new(Arc::clone(&store), Arc::clone(&http), config.downloads.clone());
        let probe = CapabilityProbe::new(Arc::clone(&runtime), &config.capability);

        Self {
            config: RwLock::new(config),
            config_store,
            http,
            hub,
            runtime,
            store,
            coordinator,
            probe: RwLock::new(Arc::new(probe)),
            last_report: RwLock::new(None),
            _log_guard: None,
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Update the configuration.
    ///
    /// Privacy and probing settings apply immediately. Download, hub and
    /// smoke-test command settings apply on the next start.
    pub fn update_config(&self, config: AppConfig) -> Result<(), DomainError> {
        self.http.apply_privacy(&config.privacy);

        // Save to disk
        self.config_store.save(&config)?;

        *self.probe.write() = Arc::new(CapabilityProbe::new(
            Arc::clone(&self.runtime),
            &config.capability,
        ));
        *self.config.write() = config;

        info!("Configuration updated");
        Ok(())
    }

    /// Check if network is currently blocked.
    pub fn is_network_blocked(&self) -> bool {
        self.http.is_network_blocked()
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> String {
        self.config_store.data_dir().to_string_lossy().to_string()
    }

    /// Get the logs directory path.
    pub fn logs_dir(&self) -> String {
        self.config_store.logs_dir().to_string_lossy().to_string()
    }

    /// Get the config file path.
    pub fn config_path(&self) -> String {
        self.config_store.config_path().to_string_lossy().to_string()
    }

    /// Get the artifact store root.
    pub fn models_dir(&self) -> String {
        self.store.root().to_string_lossy().to_string()
    }

    // ==================== Downloads ====================

    /// Register the manifests saved in the artifact store. Needs no network.
    pub async fn restore_models(&self) -> Result<usize, DomainError> {
        self.coordinator.load_manifests().await
    }

    /// Resolve a model on the hub and start downloading every file it needs.
    ///
    /// `weights` picks one weight file or quantization tag; repositories
    /// shipping several GGUF variants require it. A model that is already
    /// ready is returned as is, even in local-only mode.
    pub async fn download_model(
        &self,
        model_id: &str,
        revision: Option<&str>,
        weights: Option<&str>,
    ) -> Result<ModelManifest, DomainError> {
        if let Some(manifest) = self.coordinator.manifest(model_id) {
            if manifest.is_ready() {
                return Ok(manifest);
            }
        }
        if self.is_network_blocked() {
            return Err(DomainError::NetworkBlocked {
                reason: "local-only mode is enabled".to_string(),
            });
        }

        let manifest = self.hub.resolve(model_id, revision, weights).await?;
        let model_id = manifest.model_id.clone();
        self.coordinator.start(manifest).await?;

        self.coordinator
            .manifest(&model_id)
            .ok_or(DomainError::ModelNotFound(model_id))
    }

    /// Register an already resolved manifest and download it.
    pub async fn start_manifest(&self, manifest: ModelManifest) -> Result<(), DomainError> {
        self.coordinator.start(manifest).await
    }

    pub async fn pause_download(&self, model_id: &str) -> Result<(), DomainError> {
        self.coordinator.pause(model_id).await
    }

    pub async fn resume_download(&self, model_id: &str) -> Result<(), DomainError> {
        self.coordinator.resume(model_id).await
    }

    pub async fn cancel_download(&self, model_id: &str) -> Result<(), DomainError> {
        self.coordinator.cancel(model_id).await
    }

    pub async fn retry_download(
        &self,
        model_id: &str,
        file_name: Option<&str>,
    ) -> Result<(), DomainError> {
        self.coordinator.retry(model_id, file_name).await
    }

    /// Delete a model's files and forget its manifest.
    pub async fn remove_model(&self, model_id: &str) -> Result<(), DomainError> {
        self.coordinator.remove(model_id).await
    }

    /// Receive download events. Replaces any previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        self.coordinator.subscribe()
    }

    pub fn manifest(&self, model_id: &str) -> Option<ModelManifest> {
        self.coordinator.manifest(model_id)
    }

    pub fn manifests(&self) -> Vec<ModelManifest> {
        self.coordinator.manifests()
    }

    pub fn is_model_ready(&self, model_id: &str) -> bool {
        self.coordinator.is_ready(model_id)
    }

    pub fn active_downloads(&self) -> usize {
        self.coordinator.active_sessions()
    }

    // ==================== Capability ====================

    /// Probe accelerators and select an execution target.
    ///
    /// Without `refresh` the last report is returned when there is one.
    pub async fn probe(&self, refresh: bool) -> ProbeReport {
        if !refresh {
            let cached = self.last_report.read().clone();
            if let Some(report) = cached {
                return report;
            }
        }

        let probe = self.probe.read().clone();
        let report = probe.select_report().await;
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Estimate how a model fits on the currently selected target.
    pub async fn memory_fit(&self, model_id: &str) -> Result<MemoryFit, DomainError> {
        let manifest = self
            .coordinator
            .manifest(model_id)
            .ok_or_else(|| DomainError::ModelNotFound(model_id.to_string()))?;
        let target = self.probe(false).await.selected;
        Ok(assess_fit(&manifest, &target))
    }

    /// Hand a ready model to the inference engine.
    ///
    /// The execution target is selected afresh, independently of the download.
    pub async fn prepare_load(&self, model_id: &str) -> Result<EngineLoadRequest, DomainError> {
        let paths = self.coordinator.ready_paths(model_id)?;
        let manifest = self
            .coordinator
            .manifest(model_id)
            .ok_or_else(|| DomainError::ModelNotFound(model_id.to_string()))?;

        let target = self.probe(true).await.selected;
        let memory_fit = assess_fit(&manifest, &target);

        info!(
            model_id = model_id,
            files = paths.len(),
            target_id = %target.id,
            "Model prepared for loading"
        );

        Ok(EngineLoadRequest {
            model_id: model_id.to_string(),
            paths,
            target,
            memory_fit,
        })
    }

    /// Pause all downloads so they resume from their offsets next time.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
        info!("Termitas shut down");
    }
}

fn assess_fit(manifest: &ModelManifest, target: &CapabilityTarget) -> MemoryFit {
    let memory = target.device.as_ref().and_then(|d| d.memory_bytes);
    MemoryFit::assess(manifest.parameter_count, memory)
}
