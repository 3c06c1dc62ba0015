//! End-to-end download and readiness scenarios through the public API.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use termitas_lib::adapters::ArtifactStore;
use termitas_lib::domain::{
    AcceleratorBackend, AcceleratorDevice, ArtifactKind, ArtifactRecord, ArtifactStatus,
    CapabilityConfig, ComputeCapability, CpuArch, DomainError, DownloadConfig, DownloadEvent,
    HardwareProfile, ManifestStatus, ModelManifest, SimdCapabilities, TransferError,
    Verdict,
};
use termitas_lib::ports::{AcceleratorRuntime, HttpClient, RangeResponse};
use termitas_lib::{CapabilityProbe, DownloadCoordinator};

const CHUNK: usize = 10_000;

/// In-memory remote serving files by URL, honouring range offsets.
#[derive(Default)]
struct FakeRemote {
    files: HashMap<String, Vec<u8>>,
    /// Stop delivering data of a URL after this many bytes, without closing the body.
    stall_at: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<(String, u64)>>,
}

impl FakeRemote {
    fn new(files: &[(&str, &[u8])]) -> Self {
        Self {
            files: files
                .iter()
                .map(|(url, data)| (url.to_string(), data.to_vec()))
                .collect(),
            ..Self::default()
        }
    }

    fn offsets(&self, url: &str) -> Vec<u64> {
        self.requests
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl HttpClient for FakeRemote {
    async fn get_text(&self, url: &str) -> Result<String, DomainError> {
        Err(DomainError::HttpRequest(format!("unexpected GET {}", url)))
    }

    async fn fetch_range(&self, url: &str, offset: u64) -> Result<RangeResponse, TransferError> {
        self.requests.lock().push((url.to_string(), offset));
        let data = self
            .files
            .get(url)
            .ok_or_else(|| TransferError::Rejected(format!("HTTP 404 for {}", url)))?;

        let end = self
            .stall_at
            .lock()
            .remove(url)
            .unwrap_or(data.len())
            .min(data.len());
        let stalls = end < data.len();
        let chunks: Vec<Result<Bytes, TransferError>> = data[offset as usize..end]
            .chunks(CHUNK)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let body = futures_util::stream::iter(chunks);
        let body = if stalls {
            body.chain(futures_util::stream::pending()).boxed()
        } else {
            body.boxed()
        };

        Ok(RangeResponse {
            start: offset,
            total_size: Some(data.len() as u64),
            digest: None,
            body,
        })
    }

    fn is_network_blocked(&self) -> bool {
        false
    }

    fn allowed_domains(&self) -> Vec<String> {
        vec!["hub.test".to_string()]
    }
}

fn url(model: &str, file: &str) -> String {
    format!("https://hub.test/{}/resolve/main/{}", model, file)
}

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

fn sha256(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn record(model: &str, file: &str, kind: ArtifactKind, data: &[u8]) -> ArtifactRecord {
    ArtifactRecord::new(model, file, url(model, file), kind, data.len() as u64)
        .with_checksum(&sha256(data))
}

fn download_config(workers: usize) -> DownloadConfig {
    DownloadConfig {
        max_concurrent_transfers: workers,
        max_retries: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        progress_interval_ms: 0,
        ..DownloadConfig::default()
    }
}

fn coordinator(dir: &TempDir, remote: &Arc<FakeRemote>, workers: usize) -> DownloadCoordinator {
    let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
    let http: Arc<dyn HttpClient> = remote.clone();
    DownloadCoordinator::new(store, http, download_config(workers))
}

/// Collect events of one model until its manifest reaches `wanted`.
async fn collect_until(
    events: &mut UnboundedReceiver<DownloadEvent>,
    model: &str,
    wanted: ManifestStatus,
) -> Vec<DownloadEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => panic!("timed out waiting for {:?}", wanted),
            event = events.recv() => {
                let event = event.expect("event stream closed");
                let done = matches!(
                    &event,
                    DownloadEvent::Manifest { model_id, status } if model_id == model && *status == wanted
                );
                seen.push(event);
                if done {
                    return seen;
                }
            }
        }
    }
}

fn record_events<'a>(
    events: &'a [DownloadEvent],
    file: &'a str,
) -> impl Iterator<Item = (ArtifactStatus, u64)> + 'a {
    events.iter().filter_map(move |e| match e {
        DownloadEvent::Record(p) if p.file_name == file => Some((p.state, p.bytes_downloaded)),
        _ => None,
    })
}

#[tokio::test]
async fn test_download_two_files_to_ready() {
    let dir = TempDir::new().unwrap();
    let weights = content(1_000_000, 1);
    let tokenizer = content(2_000, 2);
    let remote = Arc::new(FakeRemote::new(&[
        (&url("org/chat", "weights.bin"), &weights),
        (&url("org/chat", "tokenizer.json"), &tokenizer),
    ]));
    let coordinator = coordinator(&dir, &remote, 2);
    let mut events = coordinator.subscribe();

    let manifest = ModelManifest::new(
        "org/chat",
        vec![
            record("org/chat", "weights.bin", ArtifactKind::Weights, &weights),
            record("org/chat", "tokenizer.json", ArtifactKind::Tokenizer, &tokenizer),
        ],
    );
    coordinator.start(manifest).await.unwrap();
    let seen = collect_until(&mut events, "org/chat", ManifestStatus::Ready).await;

    for (file, size) in [("weights.bin", 1_000_000u64), ("tokenizer.json", 2_000)] {
        let history: Vec<(ArtifactStatus, u64)> = record_events(&seen, file).collect();
        assert_eq!(history.first().map(|h| h.0), Some(ArtifactStatus::NotStarted));
        assert!(history.iter().any(|h| h.0 == ArtifactStatus::InProgress));
        assert_eq!(history.last().copied(), Some((ArtifactStatus::Complete, size)));

        let bytes: Vec<u64> = history.iter().map(|h| h.1).collect();
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "{} went backwards", file);
    }

    assert!(coordinator.is_ready("org/chat"));
    let paths = coordinator.ready_paths("org/chat").unwrap();
    assert_eq!(std::fs::read(&paths[0]).unwrap(), weights);
    assert_eq!(std::fs::read(&paths[1]).unwrap(), tokenizer);
    assert_eq!(coordinator.active_sessions(), 0);
}

#[tokio::test]
async fn test_failed_record_does_not_affect_siblings() {
    let dir = TempDir::new().unwrap();
    let files: Vec<Vec<u8>> = (0..3).map(|i| content(50_000, i)).collect();
    let names = ["a.safetensors", "b.safetensors", "c.safetensors"];
    let remote = Arc::new(FakeRemote::new(&[
        (&url("org/iso", names[0]), &files[0]),
        (&url("org/iso", names[1]), &files[1]),
        (&url("org/iso", names[2]), &files[2]),
    ]));
    let coordinator = coordinator(&dir, &remote, 3);
    let mut events = coordinator.subscribe();

    let mut records: Vec<ArtifactRecord> = names
        .iter()
        .zip(&files)
        .map(|(name, data)| record("org/iso", name, ArtifactKind::Weights, data))
        .collect();
    // The remote serves different bytes than the manifest promises.
    records[1].expected_checksum = Some(sha256(b"something else"));
    coordinator
        .start(ModelManifest::new("org/iso", records))
        .await
        .unwrap();

    let mut resting: HashMap<String, ArtifactStatus> = HashMap::new();
    let deadline = tokio::time::sleep(Duration::from_secs(30));
    tokio::pin!(deadline);
    while resting.len() < 3 {
        tokio::select! {
            _ = &mut deadline => panic!("records did not settle: {:?}", resting),
            event = events.recv() => {
                if let Some(DownloadEvent::Record(p)) = event {
                    if matches!(p.state, ArtifactStatus::Complete | ArtifactStatus::Failed) {
                        resting.insert(p.file_name.clone(), p.state);
                    }
                }
            }
        }
    }

    assert_eq!(resting[names[0]], ArtifactStatus::Complete);
    assert_eq!(resting[names[1]], ArtifactStatus::Failed);
    assert_eq!(resting[names[2]], ArtifactStatus::Complete);

    let manifest = coordinator.manifest("org/iso").unwrap();
    assert_eq!(manifest.status(), ManifestStatus::Failed);
    assert_eq!(manifest.failed_files(), vec![names[1].to_string()]);
    assert!(!coordinator.is_ready("org/iso"));
    assert!(matches!(
        coordinator.ready_paths("org/iso"),
        Err(DomainError::ModelNotReady(_))
    ));
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let dir = TempDir::new().unwrap();
    let files: Vec<(String, Vec<u8>)> = (0..5)
        .map(|i| (format!("shard-{}.safetensors", i), content(200_000, i as u8)))
        .collect();
    let served: Vec<(String, &[u8])> = files
        .iter()
        .map(|(name, data)| (url("org/pool", name), data.as_slice()))
        .collect();
    let served: Vec<(&str, &[u8])> = served.iter().map(|(u, d)| (u.as_str(), *d)).collect();
    let remote = Arc::new(FakeRemote::new(&served));
    let coordinator = coordinator(&dir, &remote, 2);
    let mut events = coordinator.subscribe();

    let records = files
        .iter()
        .map(|(name, data)| record("org/pool", name, ArtifactKind::Weights, data))
        .collect();
    coordinator
        .start(ModelManifest::new("org/pool", records))
        .await
        .unwrap();
    let seen = collect_until(&mut events, "org/pool", ManifestStatus::Ready).await;

    let mut active = HashSet::new();
    let mut peak = 0;
    for event in &seen {
        if let DownloadEvent::Record(p) = event {
            if p.state.is_active() {
                active.insert(p.file_name.clone());
            } else {
                active.remove(&p.file_name);
            }
            peak = peak.max(active.len());
        }
    }
    assert!((1..=2).contains(&peak), "peak concurrency {}", peak);
    assert_eq!(remote.requests.lock().len(), 5);

    // The first two records hold the permits; the rest wait their turn.
    let first_two: HashSet<String> = remote
        .requests
        .lock()
        .iter()
        .take(2)
        .map(|(u, _)| u.clone())
        .collect();
    let expected: HashSet<String> = files
        .iter()
        .take(2)
        .map(|(name, _)| url("org/pool", name))
        .collect();
    assert_eq!(first_two, expected);
}

#[tokio::test]
async fn test_pause_then_resume_after_restart() {
    let dir = TempDir::new().unwrap();
    let weights = content(1_000_000, 9);
    let weights_url = url("org/resume", "weights.bin");
    let remote = Arc::new(FakeRemote::new(&[(&weights_url, &weights)]));
    remote.stall_at.lock().insert(weights_url.clone(), 400_000);
    let rec = record("org/resume", "weights.bin", ArtifactKind::Weights, &weights);

    {
        let coordinator = coordinator(&dir, &remote, 2);
        let mut events = coordinator.subscribe();
        coordinator
            .start(ModelManifest::new("org/resume", vec![rec.clone()]))
            .await
            .unwrap();

        loop {
            let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
                .await
                .expect("no progress")
                .expect("event stream closed");
            if let DownloadEvent::Record(p) = event {
                if p.bytes_downloaded >= 400_000 {
                    break;
                }
            }
        }

        coordinator.pause("org/resume").await.unwrap();
        let paused = coordinator.manifest("org/resume").unwrap();
        assert_eq!(paused.records[0].status, ArtifactStatus::Paused);
        assert_eq!(paused.records[0].bytes_downloaded, 400_000);
        assert_eq!(paused.status(), ManifestStatus::Paused);
    }

    let store = ArtifactStore::new(dir.path()).unwrap();
    let partial = store.open_for_write(&rec).await.unwrap();
    assert_eq!(partial.resume_offset(), 400_000);
    drop(partial);

    // A fresh coordinator knows the model only from what is on disk.
    let coordinator = coordinator(&dir, &remote, 2);
    assert!(matches!(
        coordinator.resume("org/resume").await,
        Err(DomainError::ModelNotFound(_))
    ));
    assert_eq!(coordinator.load_manifests().await.unwrap(), 1);

    let restored = coordinator.manifest("org/resume").unwrap();
    assert_eq!(restored.records[0].status, ArtifactStatus::Paused);
    assert_eq!(restored.records[0].bytes_downloaded, 400_000);
    assert_eq!(restored.records[0].url, weights_url);

    let mut events = coordinator.subscribe();
    coordinator.resume("org/resume").await.unwrap();
    let seen = collect_until(&mut events, "org/resume", ManifestStatus::Ready).await;

    let first = record_events(&seen, "weights.bin").next();
    assert_eq!(first, Some((ArtifactStatus::InProgress, 400_000)));
    assert_eq!(remote.offsets(&weights_url), vec![0, 400_000]);

    let paths = coordinator.ready_paths("org/resume").unwrap();
    assert_eq!(std::fs::read(&paths[0]).unwrap(), weights);
}

#[tokio::test]
async fn test_ready_model_survives_restart_without_network() {
    let dir = TempDir::new().unwrap();
    let weights = content(20_000, 5);
    let config = content(300, 6);
    let remote = Arc::new(FakeRemote::new(&[
        (&url("org/offline", "model.safetensors"), &weights),
        (&url("org/offline", "config.json"), &config),
    ]));

    {
        let coordinator = coordinator(&dir, &remote, 2);
        let mut events = coordinator.subscribe();
        let manifest = ModelManifest::new(
            "org/offline",
            vec![
                record("org/offline", "model.safetensors", ArtifactKind::Weights, &weights),
                record("org/offline", "config.json", ArtifactKind::Config, &config),
            ],
        );
        coordinator.start(manifest).await.unwrap();
        collect_until(&mut events, "org/offline", ManifestStatus::Ready).await;
        coordinator.shutdown().await;
    }
    let requests = remote.requests.lock().len();

    let coordinator = coordinator(&dir, &remote, 2);
    coordinator.load_manifests().await.unwrap();

    assert!(coordinator.is_ready("org/offline"));
    assert_eq!(coordinator.manifests().len(), 1);
    let paths = coordinator.ready_paths("org/offline").unwrap();
    assert_eq!(std::fs::read(&paths[0]).unwrap(), weights);
    assert_eq!(
        coordinator.manifest("org/offline").unwrap().records[0].expected_checksum,
        Some(sha256(&weights))
    );
    assert_eq!(remote.requests.lock().len(), requests);

    coordinator.remove("org/offline").await.unwrap();
    let after_remove = self::coordinator(&dir, &remote, 2);
    assert_eq!(after_remove.load_manifests().await.unwrap(), 0);
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = ArtifactStore::new(dir.path()).unwrap();
    let data = content(30_000, 4);
    let rec = record("org/fin", "model.safetensors", ArtifactKind::Weights, &data);

    let mut partial = store.open_for_write(&rec).await.unwrap();
    partial.write_chunk(&data).await.unwrap();
    partial.sync().await.unwrap();
    drop(partial);

    let computed = sha256(&data);
    let first = store.finalize(&rec, &computed).await.unwrap();
    let second = store.finalize(&rec, &computed).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(std::fs::read(&first).unwrap(), data);
    assert!(store.is_complete(&rec).await);
}

// ==================== Capability ====================

struct FakeRuntime {
    devices: Vec<AcceleratorDevice>,
    smoke_failure: Option<String>,
}

#[async_trait]
impl AcceleratorRuntime for FakeRuntime {
    fn host_profile(&self) -> Result<HardwareProfile, DomainError> {
        Ok(HardwareProfile {
            arch: CpuArch::X86_64,
            threads: 16,
            simd: SimdCapabilities {
                avx: true,
                avx2: true,
                ..SimdCapabilities::default()
            },
            ram_bytes: 32 * 1024 * 1024 * 1024,
        })
    }

    fn detect(&self) -> Result<Vec<AcceleratorDevice>, DomainError> {
        Ok(self.devices.clone())
    }

    async fn smoke_test(&self, _device: &AcceleratorDevice) -> Result<(), String> {
        match &self.smoke_failure {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

fn blackwell() -> AcceleratorDevice {
    AcceleratorDevice {
        backend: AcceleratorBackend::Cuda,
        index: 0,
        name: "NVIDIA GeForce RTX 5090".to_string(),
        compute_capability: Some(ComputeCapability::new(12, 0)),
        memory_bytes: Some(32 * 1024 * 1024 * 1024),
    }
}

#[tokio::test]
async fn test_unsupported_accelerator_falls_back_to_cpu() {
    let runtime = Arc::new(FakeRuntime {
        devices: vec![blackwell()],
        smoke_failure: None,
    });
    let config = CapabilityConfig {
        compute_capability_ceiling: Some("9.0".to_string()),
        ..CapabilityConfig::default()
    };
    let probe = CapabilityProbe::new(runtime, &config);

    let report = probe.select_report().await;
    assert!(report.selected.is_cpu());
    assert_eq!(report.selected.verdict, Verdict::Compatible);
    assert_eq!(report.selected.name, "x86_64 CPU, 16 threads, AVX2, 32 GB RAM");
    match &report.candidates[1].verdict {
        Verdict::Incompatible { reason } => assert!(reason.contains("sm_120")),
        other => panic!("unexpected verdict {:?}", other),
    }
}

#[tokio::test]
async fn test_failing_smoke_test_falls_back_to_cpu() {
    let runtime = Arc::new(FakeRuntime {
        devices: vec![blackwell()],
        smoke_failure: Some("no kernel image is available for execution on the device".into()),
    });
    let probe = CapabilityProbe::new(runtime, &CapabilityConfig::default());

    assert!(probe.select().await.is_cpu());
}
