//! Download coordinator.
//!
//! Owns the authoritative state of every registered manifest and runs
//! transfer sessions on a bounded worker pool.
//!
//! # Scheduling
//!
//! Each `start`/`resume`/`retry` call queues the affected records and hands
//! them to a driver task, which acquires pool permits in manifest order and
//! spawns one worker per record. The worker runs sessions for its record,
//! including transient retries, and releases the permit when the record
//! reaches a resting state (complete, paused, cancelled or failed).
//!
//! # Events
//!
//! Every state change is applied under the state lock and published to the
//! subscriber while the lock is held, so events for a record arrive in the
//! order the changes were made.
//!
//! # Persistence
//!
//! Each manifest is written to the store as a sidecar when it is registered
//! and whenever one of its records comes to rest. `load_manifests` reads the
//! sidecars back after a restart, so downloaded models stay usable offline
//! and interrupted downloads resume from their partial files.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::adapters::ArtifactStore;
use crate::domain::{
    ArtifactRecord, ArtifactStatus, DomainError, DownloadConfig, DownloadEvent, ManifestStatus,
    ModelManifest, ProgressThrottle, RecordError, RecordProgress, TransferError, TransferRate,
};
use crate::ports::HttpClient;

use super::transfer::{SessionControl, SessionOutcome, SessionProgress, StopReason, TransferSession};

/// Single-subscriber event channel. A new subscription replaces the old one.
#[derive(Default)]
struct EventHub {
    sender: Mutex<Option<mpsc::UnboundedSender<DownloadEvent>>>,
}

impl EventHub {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock() = Some(tx);
        rx
    }

    fn emit(&self, event: DownloadEvent) {
        let mut sender = self.sender.lock();
        if let Some(tx) = sender.as_ref() {
            if tx.send(event).is_err() {
                debug!("Event subscriber dropped");
                *sender = None;
            }
        }
    }
}

struct ManifestEntry {
    manifest: ModelManifest,
    /// Controls of records that are queued or transferring.
    sessions: HashMap<String, Arc<SessionControl>>,
    last_status: Option<ManifestStatus>,
}

/// Throttle and speed estimate of one session.
struct Meter {
    throttle: ProgressThrottle,
    rate: TransferRate,
}

struct Inner {
    store: Arc<ArtifactStore>,
    http: Arc<dyn HttpClient>,
    config: DownloadConfig,
    permits: Arc<Semaphore>,
    state: Mutex<HashMap<String, ManifestEntry>>,
    events: EventHub,
    /// Signalled whenever a session control is released.
    idle: Notify,
    /// Serializes sidecar writes so the newest snapshot lands last.
    persist_lock: AsyncMutex<()>,
}

/// Coordinates resumable downloads of model manifests.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    pub fn new(store: Arc<ArtifactStore>, http: Arc<dyn HttpClient>, config: DownloadConfig) -> Self {
        let workers = config.max_concurrent_transfers.max(1);
        info!(
            max_concurrent_transfers = workers,
            max_retries = config.max_retries,
            "DownloadCoordinator initialized"
        );

        Self {
            inner: Arc::new(Inner {
                store,
                http,
                permits: Arc::new(Semaphore::new(workers)),
                config,
                state: Mutex::new(HashMap::new()),
                events: EventHub::default(),
                idle: Notify::new(),
                persist_lock: AsyncMutex::new(()),
            }),
        }
    }

    /// Receive all subsequent events. Replaces any previous subscriber.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Register a manifest and transfer every record that is not complete.
    ///
    /// Existing files are reconciled first: a file at its final path counts as
    /// complete, and temporary files are resumed from their length. Starting a
    /// manifest that is already registered resumes it.
    pub async fn start(&self, manifest: ModelManifest) -> Result<(), DomainError> {
        self.validate(&manifest)?;
        let model_id = manifest.model_id.clone();

        let known = self.inner.state.lock().contains_key(&model_id);
        if known {
            debug!(model_id = %model_id, "Manifest already registered, resuming");
            return self.resume(&model_id).await;
        }

        let mut manifest = manifest;
        for record in &mut manifest.records {
            record.last_error = None;
            if self.inner.store.is_complete(record).await {
                record.status = ArtifactStatus::Complete;
                record.bytes_downloaded = record.expected_size;
            } else {
                record.status = ArtifactStatus::NotStarted;
                record.bytes_downloaded = self.inner.store.partial_len(record).await;
            }
        }

        let pending: Vec<String> = manifest
            .records
            .iter()
            .filter(|r| r.status != ArtifactStatus::Complete)
            .map(|r| r.file_name.clone())
            .collect();

        let registered = {
            let mut state = self.inner.state.lock();
            if state.contains_key(&model_id) {
                true
            } else {
                info!(
                    model_id = %model_id,
                    files = manifest.records.len(),
                    pending = pending.len(),
                    total_bytes = manifest.total_bytes(),
                    "Starting manifest"
                );

                let mut entry = ManifestEntry {
                    manifest,
                    sessions: HashMap::new(),
                    last_status: None,
                };
                for record in &entry.manifest.records {
                    self.inner
                        .events
                        .emit(DownloadEvent::Record(RecordProgress::from_record(record)));
                }
                self.inner.publish_status(&mut entry);
                state.insert(model_id.clone(), entry);
                false
            }
        };

        if registered {
            return self.resume(&model_id).await;
        }
        self.inner.persist(&model_id).await;
        self.schedule(&model_id, pending);
        Ok(())
    }

    /// Register the manifests saved by earlier runs without transferring anything.
    ///
    /// Records are reconciled with the files on disk: a final file makes a
    /// record complete, a partial file makes it paused at the partial length,
    /// and failed records stay failed. Manifests already registered are left
    /// alone. Returns the number of manifests registered.
    pub async fn load_manifests(&self) -> Result<usize, DomainError> {
        let saved = self.inner.store.load_manifests().await?;
        let mut loaded = 0;

        for mut manifest in saved {
            if let Err(e) = self.validate(&manifest) {
                warn!(model_id = %manifest.model_id, error = %e, "Skipping saved manifest");
                continue;
            }

            for record in &mut manifest.records {
                if self.inner.store.is_complete(record).await {
                    record.status = ArtifactStatus::Complete;
                    record.bytes_downloaded = record.expected_size;
                    record.last_error = None;
                    continue;
                }
                let partial = self.inner.store.partial_len(record).await;
                record.bytes_downloaded = partial;
                record.status = match record.status {
                    ArtifactStatus::Failed => ArtifactStatus::Failed,
                    _ if partial > 0 => ArtifactStatus::Paused,
                    _ => ArtifactStatus::NotStarted,
                };
            }

            let mut state = self.inner.state.lock();
            if state.contains_key(&manifest.model_id) {
                continue;
            }
            let status = manifest.status();
            debug!(model_id = %manifest.model_id, status = ?status, "Saved manifest registered");
            state.insert(
                manifest.model_id.clone(),
                ManifestEntry {
                    manifest,
                    sessions: HashMap::new(),
                    last_status: Some(status),
                },
            );
            drop(state);
            loaded += 1;
        }

        info!(manifests = loaded, "Saved manifests loaded");
        Ok(loaded)
    }

    /// Stop every active session of a manifest, keeping partial data.
    ///
    /// Returns once the sessions have stopped.
    pub async fn pause(&self, model_id: &str) -> Result<(), DomainError> {
        let controls = self.controls(model_id)?;
        for control in &controls {
            control.pause();
        }
        self.wait_released(model_id, &controls).await;

        info!(model_id = model_id, sessions = controls.len(), "Manifest paused");
        Ok(())
    }

    /// Restart paused and not-started records of a manifest.
    pub async fn resume(&self, model_id: &str) -> Result<(), DomainError> {
        let files: Vec<String> = {
            let state = self.inner.state.lock();
            let entry = state
                .get(model_id)
                .ok_or_else(|| DomainError::ModelNotFound(model_id.to_string()))?;
            entry
                .manifest
                .records
                .iter()
                .filter(|r| r.status.is_resumable() && !entry.sessions.contains_key(&r.file_name))
                .map(|r| r.file_name.clone())
                .collect()
        };

        info!(model_id = model_id, files = files.len(), "Resuming manifest");
        self.schedule(model_id, files);
        Ok(())
    }

    /// Stop every session of a manifest and discard all partial data.
    ///
    /// Complete records are kept.
    pub async fn cancel(&self, model_id: &str) -> Result<(), DomainError> {
        let controls = self.controls(model_id)?;
        for control in &controls {
            control.cancel();
        }
        self.wait_released(model_id, &controls).await;

        let records: Vec<ArtifactRecord> = {
            let state = self.inner.state.lock();
            state
                .get(model_id)
                .map(|entry| {
                    entry
                        .manifest
                        .records
                        .iter()
                        .filter(|r| {
                            r.status != ArtifactStatus::Complete
                                && !entry.sessions.contains_key(&r.file_name)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        for record in &records {
            self.inner.store.discard_partial(record).await?;
            self.inner.update_record(model_id, &record.file_name, |r| {
                r.status = ArtifactStatus::NotStarted;
                r.reset();
                r.last_error = None;
            });
        }

        self.inner.persist(model_id).await;
        info!(model_id = model_id, records = records.len(), "Manifest cancelled");
        Ok(())
    }

    /// Restart failed records of a manifest with a fresh retry budget.
    ///
    /// With a file name only that record is retried. Complete records are
    /// never touched.
    pub async fn retry(&self, model_id: &str, file_name: Option<&str>) -> Result<(), DomainError> {
        let files: Vec<String> = {
            let mut state = self.inner.state.lock();
            let entry = state
                .get_mut(model_id)
                .ok_or_else(|| DomainError::ModelNotFound(model_id.to_string()))?;

            if let Some(file_name) = file_name {
                if entry.manifest.record(file_name).is_none() {
                    return Err(DomainError::ArtifactNotFound {
                        model_id: model_id.to_string(),
                        file_name: file_name.to_string(),
                    });
                }
            }

            let mut files = Vec::new();
            for record in entry.manifest.records.iter_mut() {
                let selected = file_name.map_or(true, |f| f == record.file_name);
                if selected && record.status == ArtifactStatus::Failed {
                    record.status = ArtifactStatus::NotStarted;
                    record.last_error = None;
                    self.inner
                        .events
                        .emit(DownloadEvent::Record(RecordProgress::from_record(record)));
                    files.push(record.file_name.clone());
                }
            }
            self.inner.publish_status(entry);
            files
        };

        info!(model_id = model_id, files = files.len(), "Retrying failed records");
        self.schedule(model_id, files);
        Ok(())
    }

    /// Stop all sessions of a model, delete its files and forget it.
    ///
    /// Works for models that are not registered, so leftovers of earlier runs
    /// can be cleaned up.
    pub async fn remove(&self, model_id: &str) -> Result<(), DomainError> {
        if let Ok(controls) = self.controls(model_id) {
            for control in &controls {
                control.cancel();
            }
            self.wait_released(model_id, &controls).await;
        }

        self.inner.state.lock().remove(model_id);
        self.inner.store.remove(model_id).await?;

        info!(model_id = model_id, "Model removed");
        Ok(())
    }

    /// Pause every registered manifest.
    pub async fn shutdown(&self) {
        let model_ids: Vec<String> = self.inner.state.lock().keys().cloned().collect();
        for model_id in model_ids {
            if let Err(e) = self.pause(&model_id).await {
                warn!(model_id = %model_id, error = %e, "Failed to pause on shutdown");
            }
        }
    }

    /// Snapshot of a registered manifest.
    pub fn manifest(&self, model_id: &str) -> Option<ModelManifest> {
        self.inner
            .state
            .lock()
            .get(model_id)
            .map(|entry| entry.manifest.clone())
    }

    /// Snapshots of all registered manifests.
    pub fn manifests(&self) -> Vec<ModelManifest> {
        let mut manifests: Vec<ModelManifest> = self
            .inner
            .state
            .lock()
            .values()
            .map(|entry| entry.manifest.clone())
            .collect();
        manifests.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        manifests
    }

    /// Whether every record of the manifest is complete.
    pub fn is_ready(&self, model_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .get(model_id)
            .map(|entry| entry.manifest.is_ready())
            .unwrap_or(false)
    }

    /// Final paths of all files of a ready manifest, in manifest order.
    pub fn ready_paths(&self, model_id: &str) -> Result<Vec<PathBuf>, DomainError> {
        let state = self.inner.state.lock();
        let entry = state
            .get(model_id)
            .ok_or_else(|| DomainError::ModelNotFound(model_id.to_string()))?;
        if !entry.manifest.is_ready() {
            return Err(DomainError::ModelNotReady(model_id.to_string()));
        }

        entry
            .manifest
            .records
            .iter()
            .map(|r| self.inner.store.final_path(r).map_err(DomainError::from))
            .collect()
    }

    /// Number of records currently transferring or verifying.
    pub fn active_sessions(&self) -> usize {
        self.inner
            .state
            .lock()
            .values()
            .flat_map(|entry| entry.manifest.records.iter())
            .filter(|r| r.status.is_active())
            .count()
    }

    fn validate(&self, manifest: &ModelManifest) -> Result<(), DomainError> {
        if manifest.records.is_empty() {
            return Err(DomainError::InvalidManifest(format!(
                "{} has no files",
                manifest.model_id
            )));
        }

        let mut seen = HashSet::new();
        for record in &manifest.records {
            if record.model_id != manifest.model_id {
                return Err(DomainError::InvalidManifest(format!(
                    "{} belongs to {}, not {}",
                    record.file_name, record.model_id, manifest.model_id
                )));
            }
            if !seen.insert(record.file_name.as_str()) {
                return Err(DomainError::InvalidManifest(format!(
                    "duplicate file {}",
                    record.file_name
                )));
            }
            self.inner
                .store
                .final_path(record)
                .map_err(|e| DomainError::InvalidManifest(e.to_string()))?;
        }
        Ok(())
    }

    fn controls(&self, model_id: &str) -> Result<Vec<Arc<SessionControl>>, DomainError> {
        let state = self.inner.state.lock();
        let entry = state
            .get(model_id)
            .ok_or_else(|| DomainError::ModelNotFound(model_id.to_string()))?;
        Ok(entry.sessions.values().cloned().collect())
    }

    /// Wait until none of `controls` is registered any more.
    async fn wait_released(&self, model_id: &str, controls: &[Arc<SessionControl>]) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pending = {
                let state = self.inner.state.lock();
                state
                    .get(model_id)
                    .map(|entry| {
                        entry
                            .sessions
                            .values()
                            .any(|s| controls.iter().any(|c| Arc::ptr_eq(c, s)))
                    })
                    .unwrap_or(false)
            };
            if !pending {
                return;
            }
            notified.await;
        }
    }

    /// Queue records for transfer. Records that already have a session are skipped.
    fn schedule(&self, model_id: &str, files: Vec<String>) {
        let mut queue = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.get_mut(model_id) else {
                return;
            };
            for file in files {
                if entry.sessions.contains_key(&file) {
                    continue;
                }
                let control = Arc::new(SessionControl::new());
                entry.sessions.insert(file.clone(), Arc::clone(&control));
                queue.push((file, control));
            }
        }

        if queue.is_empty() {
            return;
        }
        debug!(model_id = model_id, records = queue.len(), "Records queued");
        tokio::spawn(drive(Arc::clone(&self.inner), model_id.to_string(), queue));
    }
}

/// Acquire permits in manifest order and start one worker per record.
async fn drive(inner: Arc<Inner>, model_id: String, queue: Vec<(String, Arc<SessionControl>)>) {
    for (file, control) in queue {
        let permit = tokio::select! {
            biased;
            _ = control.stopped() => None,
            permit = Arc::clone(&inner.permits).acquire_owned() => permit.ok(),
        };

        let Some(permit) = permit else {
            inner.stop_queued(&model_id, &file, &control).await;
            continue;
        };

        let worker = Arc::clone(&inner);
        let model_id = model_id.clone();
        tokio::spawn(async move {
            worker.run_record(&model_id, &file, control, permit).await;
        });
    }
}

impl Inner {
    /// Apply `update` to one record and publish the result.
    fn update_record<F>(&self, model_id: &str, file: &str, update: F) -> Option<ArtifactRecord>
    where
        F: FnOnce(&mut ArtifactRecord),
    {
        let mut state = self.state.lock();
        let entry = state.get_mut(model_id)?;
        let record = entry.manifest.record_mut(file)?;
        update(record);
        let snapshot = record.clone();
        self.events
            .emit(DownloadEvent::Record(RecordProgress::from_record(&snapshot)));
        self.publish_status(entry);
        Some(snapshot)
    }

    fn publish_status(&self, entry: &mut ManifestEntry) {
        let status = entry.manifest.status();
        if entry.last_status == Some(status) {
            return;
        }
        entry.last_status = Some(status);

        info!(
            model_id = %entry.manifest.model_id,
            status = ?status,
            downloaded = entry.manifest.downloaded_bytes(),
            total = entry.manifest.total_bytes(),
            "Manifest status changed"
        );
        self.events.emit(DownloadEvent::Manifest {
            model_id: entry.manifest.model_id.clone(),
            status,
        });
    }

    /// Unregister a control and wake waiters.
    fn release(&self, model_id: &str, file: &str, control: &Arc<SessionControl>) {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.get_mut(model_id) {
                if entry
                    .sessions
                    .get(file)
                    .is_some_and(|c| Arc::ptr_eq(c, control))
                {
                    entry.sessions.remove(file);
                }
            }
        }
        self.idle.notify_waiters();
    }

    /// A queued record was stopped before it got a worker.
    async fn stop_queued(&self, model_id: &str, file: &str, control: &Arc<SessionControl>) {
        if control.stop_reason() == Some(StopReason::Pause) {
            self.update_record(model_id, file, |r| {
                if r.status == ArtifactStatus::NotStarted {
                    r.status = ArtifactStatus::Paused;
                }
            });
            self.persist(model_id).await;
        }
        self.release(model_id, file, control);
    }

    /// Save the current manifest snapshot. Failures are logged, not returned.
    async fn persist(&self, model_id: &str) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self
            .state
            .lock()
            .get(model_id)
            .map(|entry| entry.manifest.clone());
        let Some(manifest) = snapshot else {
            return;
        };
        if let Err(e) = self.store.save_manifest(&manifest).await {
            warn!(model_id = model_id, error = %e, "Failed to save manifest");
        }
    }

    /// A record was stopped between attempts, with no session running.
    async fn stop_between_attempts(
        &self,
        model_id: &str,
        record: &ArtifactRecord,
        control: &SessionControl,
    ) {
        match control.stop_reason() {
            Some(StopReason::Cancel) => {
                if let Err(e) = self.store.discard_partial(record).await {
                    warn!(file = %record.file_name, error = %e, "Failed to discard partial file");
                }
                self.update_record(model_id, &record.file_name, |r| {
                    r.status = ArtifactStatus::NotStarted;
                    r.reset();
                    r.last_error = None;
                });
            }
            _ => {
                let bytes = self.store.partial_len(record).await;
                self.update_record(model_id, &record.file_name, |r| {
                    r.status = ArtifactStatus::Paused;
                    r.bytes_downloaded = bytes;
                });
            }
        }
    }

    fn on_progress(&self, model_id: &str, file: &str, progress: SessionProgress, meter: &mut Meter) {
        let mut state = self.state.lock();
        let Some(record) = state
            .get_mut(model_id)
            .and_then(|entry| entry.manifest.record_mut(file))
        else {
            return;
        };

        match progress {
            SessionProgress::Bytes(bytes) => {
                record.advance(bytes);
                let finished = bytes >= record.expected_size;
                if !meter.throttle.should_emit() && !finished {
                    return;
                }
                let speed = meter.rate.sample(bytes);
                let eta = meter
                    .rate
                    .eta_secs(record.expected_size.saturating_sub(bytes));
                self.events.emit(DownloadEvent::Record(
                    RecordProgress::from_record(record).with_rate(speed, eta),
                ));
            }
            SessionProgress::Verifying => {
                record.status = ArtifactStatus::Verifying;
                self.events
                    .emit(DownloadEvent::Record(RecordProgress::from_record(record)));
            }
        }
    }

    fn emit_retrying(&self, model_id: &str, file: &str, attempt: u32, delay_ms: u64, error: RecordError) {
        let mut state = self.state.lock();
        if let Some(record) = state
            .get_mut(model_id)
            .and_then(|entry| entry.manifest.record_mut(file))
        {
            record.last_error = Some(error.clone());
        }
        self.events.emit(DownloadEvent::Retrying {
            model_id: model_id.to_string(),
            file_name: file.to_string(),
            attempt,
            delay_ms,
            error,
        });
    }

    /// Run sessions for one record until it comes to rest.
    async fn run_record(
        self: Arc<Self>,
        model_id: &str,
        file: &str,
        control: Arc<SessionControl>,
        permit: OwnedSemaphorePermit,
    ) {
        let mut attempt: u32 = 0;
        let mut restarted = false;

        loop {
            let Some(record) = self.update_record(model_id, file, |r| {
                r.status = ArtifactStatus::InProgress;
            }) else {
                break;
            };

            let session = TransferSession::new(
                record.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.http),
                Arc::clone(&control),
            );
            let mut meter = Meter {
                throttle: ProgressThrottle::new(Duration::from_millis(
                    self.config.progress_interval_ms,
                )),
                rate: TransferRate::new(),
            };
            let result = session
                .run(|progress| self.on_progress(model_id, file, progress, &mut meter))
                .await;

            let err = match result {
                Ok(SessionOutcome::Completed { checksum, .. }) => {
                    self.update_record(model_id, file, |r| {
                        r.status = ArtifactStatus::Complete;
                        r.bytes_downloaded = r.expected_size;
                        r.expected_checksum = Some(checksum);
                        r.last_error = None;
                    });
                    break;
                }
                Ok(SessionOutcome::Paused { bytes }) => {
                    self.update_record(model_id, file, |r| {
                        r.status = ArtifactStatus::Paused;
                        r.bytes_downloaded = bytes;
                    });
                    break;
                }
                Ok(SessionOutcome::Cancelled) => {
                    self.update_record(model_id, file, |r| {
                        r.status = ArtifactStatus::NotStarted;
                        r.reset();
                        r.last_error = None;
                    });
                    break;
                }
                Err(err) => err,
            };

            let error = RecordError::from(&err);
            let restart = matches!(err, TransferError::InvalidRange(_));
            let budget_left = attempt < self.config.max_retries;
            // A range mismatch always gets one restart from zero.
            let try_again = if restart {
                budget_left || !restarted
            } else {
                err.is_retryable() && budget_left
            };
            if !try_again {
                if err.requires_restart() {
                    if let Err(e) = self.store.discard_partial(&record).await {
                        warn!(file = file, error = %e, "Failed to discard partial file");
                    }
                }
                let bytes = self.store.partial_len(&record).await;
                warn!(
                    artifact = %record.key(),
                    attempts = attempt + 1,
                    error = %err,
                    "Transfer failed"
                );
                self.update_record(model_id, file, |r| {
                    r.status = ArtifactStatus::Failed;
                    r.bytes_downloaded = bytes;
                    r.last_error = Some(error);
                });
                break;
            }

            attempt += 1;
            if restart {
                restarted = true;
                if let Err(e) = self.store.discard_partial(&record).await {
                    self.update_record(model_id, file, |r| {
                        r.status = ArtifactStatus::Failed;
                        r.last_error = Some(RecordError::from(&e));
                    });
                    break;
                }
                self.update_record(model_id, file, |r| r.reset());
            }

            let delay_ms = self.config.backoff_delay_ms(attempt);
            warn!(
                artifact = %record.key(),
                attempt,
                delay_ms,
                error = %err,
                "Transfer attempt failed, retrying"
            );
            self.emit_retrying(model_id, file, attempt, delay_ms, error);

            let stopped = tokio::select! {
                biased;
                _ = control.stopped() => true,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => false,
            };
            if stopped {
                self.stop_between_attempts(model_id, &record, &control).await;
                break;
            }
        }

        self.persist(model_id).await;
        self.release(model_id, file, &control);
        drop(permit);
    }
}
