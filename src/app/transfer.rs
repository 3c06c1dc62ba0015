//! Resumable transfer of a single artifact.
//!
//! A session owns one record for the duration of one attempt: it reopens the
//! record's temporary file, requests the remainder from the remote, appends
//! the body, then verifies and finalizes. Stop signals arrive through
//! [`SessionControl`] and are observed between chunks.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::adapters::{ArtifactStore, PartialFile};
use crate::domain::{ArtifactRecord, TransferError};
use crate::ports::HttpClient;

const RUNNING: u8 = 0;
const PAUSE: u8 = 1;
const CANCEL: u8 = 2;

/// Why a session was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep the partial data for a later resume.
    Pause,
    /// Discard the partial data.
    Cancel,
}

/// Stop signal shared between the coordinator and one session.
///
/// Cancel wins over pause when both are requested.
#[derive(Debug, Default)]
pub struct SessionControl {
    token: CancellationToken,
    reason: AtomicU8,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        let _ = self
            .reason
            .compare_exchange(RUNNING, PAUSE, Ordering::SeqCst, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn cancel(&self) {
        self.reason.store(CANCEL, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.reason.load(Ordering::SeqCst) {
            PAUSE => Some(StopReason::Pause),
            CANCEL => Some(StopReason::Cancel),
            _ => None,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once pause or cancel was requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// Progress notifications from a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProgress {
    /// Length of the temporary file after a write.
    Bytes(u64),
    /// All bytes received; computing the checksum.
    Verifying,
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Verified file in place at `path`.
    Completed { path: PathBuf, checksum: String },
    /// Stopped by pause; the temporary file holds `bytes`.
    Paused { bytes: u64 },
    /// Stopped by cancel; the temporary file is gone.
    Cancelled,
}

/// One attempt at transferring one record.
pub struct TransferSession {
    record: ArtifactRecord,
    store: Arc<ArtifactStore>,
    http: Arc<dyn HttpClient>,
    control: Arc<SessionControl>,
}

impl TransferSession {
    pub fn new(
        record: ArtifactRecord,
        store: Arc<ArtifactStore>,
        http: Arc<dyn HttpClient>,
        control: Arc<SessionControl>,
    ) -> Self {
        Self {
            record,
            store,
            http,
            control,
        }
    }

    /// Run the attempt to completion, stop, or failure.
    ///
    /// On a transient failure the received bytes stay in the temporary file,
    /// so the next attempt resumes from there.
    pub async fn run<F>(mut self, mut on_progress: F) -> Result<SessionOutcome, TransferError>
    where
        F: FnMut(SessionProgress) + Send,
    {
        let expected = self.record.expected_size;
        let mut partial = self.store.open_for_write(&self.record).await?;

        if partial.resume_offset() > expected {
            warn!(
                model_id = %self.record.model_id,
                file = %self.record.file_name,
                partial = partial.resume_offset(),
                expected,
                "Partial file larger than expected, restarting"
            );
            drop(partial);
            self.store.discard_partial(&self.record).await?;
            partial = self.store.open_for_write(&self.record).await?;
        }

        let offset = partial.resume_offset();
        on_progress(SessionProgress::Bytes(offset));

        if self.control.is_stopped() {
            return self.stop(partial).await;
        }

        if offset < expected {
            debug!(
                model_id = %self.record.model_id,
                file = %self.record.file_name,
                offset,
                expected,
                "Requesting artifact data"
            );

            let response = tokio::select! {
                biased;
                _ = self.control.stopped() => return self.stop(partial).await,
                response = self.http.fetch_range(&self.record.url, offset) => response?,
            };

            if response.start != offset {
                let reason = if offset > 0 && response.start == 0 {
                    format!("server ignored range request at offset {}", offset)
                } else {
                    format!(
                        "requested offset {} but server answered from {}",
                        offset, response.start
                    )
                };
                return Err(TransferError::InvalidRange(reason));
            }

            if let Some(total) = response.total_size {
                if total != expected {
                    return Err(TransferError::InvalidRange(format!(
                        "remote size {} differs from expected {}",
                        total, expected
                    )));
                }
            }

            if self.record.expected_checksum.is_none() {
                if let Some(digest) = response.digest {
                    debug!(file = %self.record.file_name, digest = %digest, "Adopted remote digest");
                    self.record.expected_checksum = Some(digest);
                }
            }

            let mut body = response.body;
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = self.control.stopped() => return self.stop(partial).await,
                    chunk = body.next() => chunk,
                };

                let bytes = match chunk {
                    None => break,
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        partial.sync().await?;
                        return Err(e);
                    }
                };

                if partial.len() + bytes.len() as u64 > expected {
                    partial.sync().await?;
                    return Err(TransferError::InvalidRange(format!(
                        "server sent more than the expected {} bytes",
                        expected
                    )));
                }

                partial.write_chunk(&bytes).await?;
                on_progress(SessionProgress::Bytes(partial.len()));
            }

            partial.sync().await?;
            if partial.len() < expected {
                return Err(TransferError::Transient(format!(
                    "connection closed after {} of {} bytes",
                    partial.len(),
                    expected
                )));
            }
        }

        if self.control.is_stopped() {
            return self.stop(partial).await;
        }

        let partial_path = partial.path().to_path_buf();
        drop(partial);

        on_progress(SessionProgress::Verifying);
        let checksum = ArtifactStore::checksum(&partial_path).await?;
        let path = self.store.finalize(&self.record, &checksum).await?;

        info!(
            model_id = %self.record.model_id,
            file = %self.record.file_name,
            bytes = expected,
            "Transfer complete"
        );
        Ok(SessionOutcome::Completed { path, checksum })
    }

    async fn stop(&self, mut partial: PartialFile) -> Result<SessionOutcome, TransferError> {
        match self.control.stop_reason() {
            Some(StopReason::Cancel) => {
                partial.sync().await?;
                drop(partial);
                self.store.discard_partial(&self.record).await?;
                info!(
                    model_id = %self.record.model_id,
                    file = %self.record.file_name,
                    "Transfer cancelled"
                );
                Ok(SessionOutcome::Cancelled)
            }
            _ => {
                partial.sync().await?;
                info!(
                    model_id = %self.record.model_id,
                    file = %self.record.file_name,
                    bytes = partial.len(),
                    "Transfer paused"
                );
                Ok(SessionOutcome::Paused {
                    bytes: partial.len(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactKind, DomainError};
    use crate::ports::RangeResponse;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use sha2::{Digest, Sha256};
    use tempfile::TempDir;

    const URL: &str = "https://hub.test/org/model/resolve/main/weights.bin";

    /// Serves `data` honoring ranges, optionally misbehaving.
    struct FakeRemote {
        data: Vec<u8>,
        ignore_range: bool,
        drop_after: Option<usize>,
        digest: Option<String>,
        offsets: Mutex<Vec<u64>>,
    }

    impl FakeRemote {
        fn new(data: Vec<u8>) -> Self {
            Self {
                data,
                ignore_range: false,
                drop_after: None,
                digest: None,
                offsets: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for FakeRemote {
        async fn get_text(&self, url: &str) -> Result<String, DomainError> {
            Err(DomainError::HttpRequest(format!("unexpected GET {}", url)))
        }

        async fn fetch_range(&self, _url: &str, offset: u64) -> Result<RangeResponse, TransferError> {
            self.offsets.lock().push(offset);
            let start = if self.ignore_range { 0 } else { offset as usize };
            let mut body: Vec<Result<Bytes, TransferError>> = self.data[start..]
                .chunks(1000)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            if let Some(n) = self.drop_after {
                body.truncate(n);
                body.push(Err(TransferError::Transient("connection reset".into())));
            }
            Ok(RangeResponse {
                start: start as u64,
                total_size: Some(self.data.len() as u64),
                digest: self.digest.clone(),
                body: Box::pin(futures_util::stream::iter(body)),
            })
        }

        fn is_network_blocked(&self) -> bool {
            false
        }

        fn allowed_domains(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn sha(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn record(data: &[u8]) -> ArtifactRecord {
        ArtifactRecord::new("org/model", "weights.bin", URL, ArtifactKind::Weights, data.len() as u64)
            .with_checksum(&sha(data))
    }

    fn new_session(
        record: ArtifactRecord,
        store: &Arc<ArtifactStore>,
        remote: &Arc<FakeRemote>,
    ) -> (TransferSession, Arc<SessionControl>) {
        let control = Arc::new(SessionControl::new());
        let http: Arc<dyn HttpClient> = remote.clone();
        (
            TransferSession::new(record, Arc::clone(store), http, Arc::clone(&control)),
            control,
        )
    }

    #[tokio::test]
    async fn test_fresh_transfer_completes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let payload = data(10_500);
        let remote = Arc::new(FakeRemote::new(payload.clone()));
        let (session, _) = new_session(record(&payload), &store, &remote);

        let mut seen = Vec::new();
        let outcome = session.run(|p| seen.push(p)).await.unwrap();

        let SessionOutcome::Completed { path, checksum } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(std::fs::read(path).unwrap(), payload);
        assert_eq!(checksum, sha(&payload));
        assert_eq!(seen.first(), Some(&SessionProgress::Bytes(0)));
        assert_eq!(seen.last(), Some(&SessionProgress::Verifying));
        assert_eq!(*remote.offsets.lock(), vec![0]);
    }

    #[tokio::test]
    async fn test_resumes_from_partial_length() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let payload = data(5_000);
        let rec = record(&payload);
        {
            let mut partial = store.open_for_write(&rec).await.unwrap();
            partial.write_chunk(&payload[..2_000]).await.unwrap();
            partial.sync().await.unwrap();
        }

        let remote = Arc::new(FakeRemote::new(payload.clone()));
        let (session, _) = new_session(rec, &store, &remote);
        let outcome = session.run(|_| {}).await.unwrap();

        assert!(matches!(outcome, SessionOutcome::Completed { .. }));
        assert_eq!(*remote.offsets.lock(), vec![2_000]);
    }

    #[tokio::test]
    async fn test_full_partial_skips_request() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let payload = data(3_000);
        let rec = record(&payload);
        {
            let mut partial = store.open_for_write(&rec).await.unwrap();
            partial.write_chunk(&payload).await.unwrap();
            partial.sync().await.unwrap();
        }

        let remote = Arc::new(FakeRemote::new(payload));
        let (session, _) = new_session(rec, &store, &remote);
        assert!(matches!(
            session.run(|_| {}).await.unwrap(),
            SessionOutcome::Completed { .. }
        ));
        assert!(remote.offsets.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ignored_range_is_invalid_range() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let payload = data(4_000);
        let rec = record(&payload);
        {
            let mut partial = store.open_for_write(&rec).await.unwrap();
            partial.write_chunk(&payload[..1_000]).await.unwrap();
            partial.sync().await.unwrap();
        }

        let mut remote = FakeRemote::new(payload);
        remote.ignore_range = true;
        let (session, _) = new_session(rec.clone(), &store, &Arc::new(remote));
        let err = session.run(|_| {}).await.unwrap_err();

        assert!(matches!(err, TransferError::InvalidRange(_)));
        assert_eq!(store.partial_len(&rec).await, 1_000);
    }

    #[tokio::test]
    async fn test_dropped_connection_keeps_received_bytes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let payload = data(6_000);
        let rec = record(&payload);

        let mut remote = FakeRemote::new(payload);
        remote.drop_after = Some(3);
        let (session, _) = new_session(rec.clone(), &store, &Arc::new(remote));
        let err = session.run(|_| {}).await.unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(store.partial_len(&rec).await, 3_000);
    }

    #[tokio::test]
    async fn test_corrupt_data_fails_integrity() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let payload = data(2_000);
        let rec = record(&payload);

        let mut corrupt = payload.clone();
        corrupt[10] ^= 0xff;
        let remote = Arc::new(FakeRemote::new(corrupt));
        let (session, _) = new_session(rec.clone(), &store, &remote);
        let err = session.run(|_| {}).await.unwrap_err();

        assert!(matches!(err, TransferError::Integrity { .. }));
        assert!(!store.final_path(&rec).unwrap().exists());
        assert_eq!(store.partial_len(&rec).await, 0);
    }

    #[tokio::test]
    async fn test_adopts_remote_digest() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let payload = data(1_500);
        let mut rec = record(&payload);
        rec.expected_checksum = None;

        let mut remote = FakeRemote::new(payload);
        remote.digest = Some(sha(b"something else"));
        let (session, _) = new_session(rec, &store, &Arc::new(remote));

        assert!(matches!(
            session.run(|_| {}).await.unwrap_err(),
            TransferError::Integrity { .. }
        ));
    }

    #[tokio::test]
    async fn test_pause_keeps_partial_and_cancel_discards() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::new(dir.path()).unwrap());
        let payload = data(8_000);
        let rec = record(&payload);
        let remote = Arc::new(FakeRemote::new(payload));

        let (session, control) = new_session(rec.clone(), &store, &remote);
        let pauser = Arc::clone(&control);
        let outcome = session
            .run(move |p| {
                if p == SessionProgress::Bytes(3_000) {
                    pauser.pause();
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome, SessionOutcome::Paused { bytes: 3_000 });
        assert_eq!(store.partial_len(&rec).await, 3_000);

        let (session, control) = new_session(rec.clone(), &store, &remote);
        control.cancel();
        assert_eq!(session.run(|_| {}).await.unwrap(), SessionOutcome::Cancelled);
        assert_eq!(store.partial_len(&rec).await, 0);
    }

    #[test]
    fn test_cancel_overrides_pause() {
        let control = SessionControl::new();
        assert_eq!(control.stop_reason(), None);
        control.pause();
        assert_eq!(control.stop_reason(), Some(StopReason::Pause));
        control.cancel();
        assert_eq!(control.stop_reason(), Some(StopReason::Cancel));
        control.pause();
        assert_eq!(control.stop_reason(), Some(StopReason::Cancel));
        assert!(control.is_stopped());
    }
}
