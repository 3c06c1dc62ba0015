use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::artifact::{ArtifactRecord, ArtifactStatus, ManifestStatus, RecordError};

/// Progress snapshot for one artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordProgress {
    pub model_id: String,
    pub file_name: String,
    pub bytes_downloaded: u64,
    pub total_bytes: u64,
    pub state: ArtifactStatus,
    /// Smoothed transfer speed in bytes per second.
    pub speed_bps: f64,
    /// Estimated seconds remaining, when the speed is known.
    pub eta_secs: Option<u64>,
    pub error: Option<RecordError>,
}

impl RecordProgress {
    pub fn from_record(record: &ArtifactRecord) -> Self {
        Self {
            model_id: record.model_id.clone(),
            file_name: record.file_name.clone(),
            bytes_downloaded: record.bytes_downloaded,
            total_bytes: record.expected_size,
            state: record.status,
            speed_bps: 0.0,
            eta_secs: None,
            error: record.last_error.clone(),
        }
    }

    pub fn with_rate(mut self, speed_bps: f64, eta_secs: Option<u64>) -> Self {
        self.speed_bps = speed_bps;
        self.eta_secs = eta_secs;
        self
    }
}

/// Events emitted by the download coordinator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum DownloadEvent {
    /// Byte-count update or state transition of one artifact.
    Record(RecordProgress),
    /// A transient failure will be retried after a delay.
    Retrying {
        model_id: String,
        file_name: String,
        attempt: u32,
        delay_ms: u64,
        error: RecordError,
    },
    /// Aggregate manifest state changed.
    Manifest {
        model_id: String,
        status: ManifestStatus,
    },
}

impl DownloadEvent {
    pub fn model_id(&self) -> &str {
        match self {
            DownloadEvent::Record(p) => &p.model_id,
            DownloadEvent::Retrying { model_id, .. } => model_id,
            DownloadEvent::Manifest { model_id, .. } => model_id,
        }
    }
}

/// Rate-limiter for progress updates.
///
/// Ensures byte-count events are not emitted more frequently than the
/// configured interval. State transitions bypass the throttle.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// Check if enough time has passed to emit another progress update.
    pub fn should_emit(&mut self) -> bool {
        self.should_emit_at(Instant::now())
    }

    fn should_emit_at(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

/// Number of speed samples averaged for the reported rate.
const RATE_WINDOW: usize = 5;

/// Moving-average transfer speed estimator.
#[derive(Debug, Default)]
pub struct TransferRate {
    samples: VecDeque<f64>,
    last: Option<(Instant, u64)>,
}

impl TransferRate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the current byte count; returns the smoothed speed in bytes/s.
    pub fn sample(&mut self, bytes: u64) -> f64 {
        self.sample_at(bytes, Instant::now())
    }

    fn sample_at(&mut self, bytes: u64, now: Instant) -> f64 {
        if let Some((at, prev)) = self.last {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.0 && bytes >= prev {
                self.samples.push_back((bytes - prev) as f64 / elapsed);
                if self.samples.len() > RATE_WINDOW {
                    self.samples.pop_front();
                }
            }
        }
        self.last = Some((now, bytes));
        self.speed()
    }

    pub fn speed(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Seconds until `remaining` bytes are transferred at the current speed.
    pub fn eta_secs(&self, remaining: u64) -> Option<u64> {
        let speed = self.speed();
        if speed > 0.0 {
            Some((remaining as f64 / speed).ceil() as u64)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_first_emit() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100));
        assert!(throttle.should_emit());
    }

    #[test]
    fn test_throttle_respects_interval() {
        let start = Instant::now();
        let mut throttle = ProgressThrottle::new(Duration::from_millis(50));
        assert!(throttle.should_emit_at(start));
        assert!(!throttle.should_emit_at(start + Duration::from_millis(10)));
        assert!(throttle.should_emit_at(start + Duration::from_millis(60)));
    }

    #[test]
    fn test_rate_average_and_eta() {
        let start = Instant::now();
        let mut rate = TransferRate::new();
        assert_eq!(rate.sample_at(0, start), 0.0);
        assert_eq!(rate.eta_secs(100), None);

        rate.sample_at(1_000, start + Duration::from_secs(1));
        rate.sample_at(4_000, start + Duration::from_secs(2));
        // (1000 + 3000) / 2
        assert_eq!(rate.speed(), 2_000.0);
        assert_eq!(rate.eta_secs(5_000), Some(3));
    }

    #[test]
    fn test_rate_window_is_bounded() {
        let start = Instant::now();
        let mut rate = TransferRate::new();
        rate.sample_at(0, start);
        for i in 1..=10u64 {
            rate.sample_at(i * 100, start + Duration::from_secs(i));
        }
        assert_eq!(rate.samples.len(), RATE_WINDOW);
        assert_eq!(rate.speed(), 100.0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = DownloadEvent::Manifest {
            model_id: "org/model".to_string(),
            status: ManifestStatus::Ready,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "Manifest");
        assert_eq!(json["data"]["status"], "ready");
        assert_eq!(event.model_id(), "org/model");
    }
}
