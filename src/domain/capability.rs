use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Execution target kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Cpu,
    Accelerator,
}

/// Accelerator runtime family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceleratorBackend {
    /// NVIDIA GPU through CUDA.
    Cuda,
    /// Apple GPU through Metal (MPS).
    Metal,
}

impl fmt::Display for AcceleratorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcceleratorBackend::Cuda => write!(f, "cuda"),
            AcceleratorBackend::Metal => write!(f, "metal"),
        }
    }
}

/// CUDA compute capability ("generation"), e.g. 8.9 for Ada, 12.0 for Blackwell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl FromStr for ComputeCapability {
    type Err = DomainError;

    /// Parses "8.9", "12.0" or "sm_89" / "sm_120".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || DomainError::Hardware(format!("Invalid compute capability: {}", s));

        if let Some(digits) = s.strip_prefix("sm_") {
            if digits.len() < 2 || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            let (major, minor) = digits.split_at(digits.len() - 1);
            return Ok(Self::new(
                major.parse().map_err(|_| invalid())?,
                minor.parse().map_err(|_| invalid())?,
            ));
        }

        let (major, minor) = s.split_once('.').unwrap_or((s, "0"));
        Ok(Self::new(
            major.parse().map_err(|_| invalid())?,
            minor.parse().map_err(|_| invalid())?,
        ))
    }
}

impl fmt::Display for ComputeCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm_{}{}", self.major, self.minor)
    }
}

/// Compatibility verdict of a target.
///
/// State machine: Untested -> {Compatible, Incompatible}. Terminal for the
/// lifetime of one probe; every probe starts from Untested again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Untested,
    Compatible,
    Incompatible { reason: String },
}

impl Verdict {
    pub fn is_compatible(&self) -> bool {
        matches!(self, Verdict::Compatible)
    }
}

/// An accelerator as reported by the runtime, before any testing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorDevice {
    pub backend: AcceleratorBackend,
    /// Device ordinal within the backend.
    pub index: u32,
    pub name: String,
    pub compute_capability: Option<ComputeCapability>,
    /// Dedicated (or usable unified) memory in bytes.
    pub memory_bytes: Option<u64>,
}

impl AcceleratorDevice {
    /// Ordering by expected performance, best first.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .compute_capability
            .cmp(&self.compute_capability)
            .then_with(|| other.memory_bytes.cmp(&self.memory_bytes))
            .then_with(|| self.index.cmp(&other.index))
    }
}

/// A candidate execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTarget {
    pub kind: TargetKind,
    /// Stable identifier: "cpu", "cuda:0", "metal:0".
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// The underlying device for accelerator targets.
    pub device: Option<AcceleratorDevice>,
    pub verdict: Verdict,
}

impl CapabilityTarget {
    /// The CPU baseline target. Always compatible.
    pub fn cpu(description: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Cpu,
            id: "cpu".to_string(),
            name: description.into(),
            device: None,
            verdict: Verdict::Untested,
        }
    }

    pub fn accelerator(device: AcceleratorDevice) -> Self {
        Self {
            kind: TargetKind::Accelerator,
            id: format!("{}:{}", device.backend, device.index),
            name: device.name.clone(),
            device: Some(device),
            verdict: Verdict::Untested,
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.kind == TargetKind::Cpu
    }
}

/// Result of a capability selection, with every candidate that was considered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub selected: CapabilityTarget,
    /// All targets in rank order (CPU first), with their verdicts.
    pub candidates: Vec<CapabilityTarget>,
}

/// Numeric precision a model can be loaded at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp16,
    Int8,
    Int4,
}

impl Precision {
    pub fn bytes_per_param(&self) -> f64 {
        match self {
            Precision::Fp16 => 2.0,
            Precision::Int8 => 1.0,
            Precision::Int4 => 0.5,
        }
    }
}

/// Inference overhead on top of raw weights (KV cache, activations).
const INFERENCE_OVERHEAD: f64 = 1.15;

/// Share of accelerator memory usable for a model.
const USABLE_MEMORY_RATIO: f64 = 0.9;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Estimated memory in GiB needed to run a model at a given precision.
pub fn estimate_memory_gb(param_count: u64, precision: Precision) -> f64 {
    (param_count as f64 * precision.bytes_per_param()) / GIB * INFERENCE_OVERHEAD
}

/// How well a model fits in accelerator memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fit", rename_all = "snake_case")]
pub enum MemoryFit {
    /// Parameter count unknown.
    Unknown,
    /// No accelerator memory; runs on CPU.
    CpuOnly,
    /// Fits at fp16.
    Excellent { required_gb: f64 },
    /// Fits with 8-bit quantization.
    Good { required_gb: f64 },
    /// Fits with 4-bit quantization.
    Fair { required_gb: f64 },
    /// Does not fit even at 4 bits; `required_gb` is the fp16 need.
    TooLarge { required_gb: f64 },
}

impl MemoryFit {
    pub fn assess(param_count: Option<u64>, memory_bytes: Option<u64>) -> Self {
        let params = match param_count {
            Some(p) if p > 0 => p,
            _ => return MemoryFit::Unknown,
        };
        let memory_gb = match memory_bytes {
            Some(m) if m > 0 => m as f64 / GIB,
            _ => return MemoryFit::CpuOnly,
        };

        let available = memory_gb * USABLE_MEMORY_RATIO;
        let fp16 = estimate_memory_gb(params, Precision::Fp16);
        let int8 = estimate_memory_gb(params, Precision::Int8);
        let int4 = estimate_memory_gb(params, Precision::Int4);

        if fp16 <= available {
            MemoryFit::Excellent { required_gb: fp16 }
        } else if int8 <= available {
            MemoryFit::Good { required_gb: int8 }
        } else if int4 <= available {
            MemoryFit::Fair { required_gb: int4 }
        } else {
            MemoryFit::TooLarge { required_gb: fp16 }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn cuda(index: u32, cc: Option<(u32, u32)>, mem_gb: u64) -> AcceleratorDevice {
        AcceleratorDevice {
            backend: AcceleratorBackend::Cuda,
            index,
            name: format!("GPU {}", index),
            compute_capability: cc.map(|(a, b)| ComputeCapability::new(a, b)),
            memory_bytes: Some(mem_gb * GB),
        }
    }

    #[test]
    fn test_compute_capability_parse() {
        assert_eq!("8.9".parse::<ComputeCapability>().unwrap(), ComputeCapability::new(8, 9));
        assert_eq!("12.0".parse::<ComputeCapability>().unwrap(), ComputeCapability::new(12, 0));
        assert_eq!("sm_90".parse::<ComputeCapability>().unwrap(), ComputeCapability::new(9, 0));
        assert_eq!("sm_120".parse::<ComputeCapability>().unwrap(), ComputeCapability::new(12, 0));
        assert_eq!("7".parse::<ComputeCapability>().unwrap(), ComputeCapability::new(7, 0));
        assert!("gpu".parse::<ComputeCapability>().is_err());
        assert!("sm_".parse::<ComputeCapability>().is_err());
    }

    #[test]
    fn test_compute_capability_order_and_display() {
        assert!(ComputeCapability::new(12, 0) > ComputeCapability::new(9, 0));
        assert!(ComputeCapability::new(8, 9) > ComputeCapability::new(8, 6));
        assert_eq!(ComputeCapability::new(12, 0).to_string(), "sm_120");
    }

    #[test]
    fn test_rank_prefers_newer_then_larger() {
        let mut devices = vec![
            cuda(0, Some((7, 5)), 16),
            cuda(1, Some((8, 9)), 12),
            cuda(2, Some((8, 9)), 24),
            cuda(3, None, 48),
        ];
        devices.sort_by(|a, b| a.rank_cmp(b));
        let order: Vec<u32> = devices.iter().map(|d| d.index).collect();
        assert_eq!(order, vec![2, 1, 0, 3]);
    }

    #[test]
    fn test_target_ids() {
        let t = CapabilityTarget::accelerator(cuda(1, Some((8, 6)), 8));
        assert_eq!(t.id, "cuda:1");
        assert_eq!(t.kind, TargetKind::Accelerator);
        assert_eq!(t.verdict, Verdict::Untested);
        assert!(CapabilityTarget::cpu("x86_64 CPU").is_cpu());
    }

    #[test]
    fn test_memory_fit_tiers() {
        let seven_b = Some(7_000_000_000);
        assert!(matches!(MemoryFit::assess(seven_b, Some(24 * GB)), MemoryFit::Excellent { .. }));
        assert!(matches!(MemoryFit::assess(seven_b, Some(10 * GB)), MemoryFit::Good { .. }));
        assert!(matches!(MemoryFit::assess(seven_b, Some(8 * GB)), MemoryFit::Fair { .. }));
        assert!(matches!(MemoryFit::assess(seven_b, Some(2 * GB)), MemoryFit::TooLarge { .. }));
        assert_eq!(MemoryFit::assess(seven_b, None), MemoryFit::CpuOnly);
        assert_eq!(MemoryFit::assess(None, Some(24 * GB)), MemoryFit::Unknown);
    }

    #[test]
    fn test_estimate_memory() {
        let gb = estimate_memory_gb(1_000_000_000, Precision::Fp16);
        assert!((gb - 2.0 * 1e9 / GIB * 1.15).abs() < 1e-9);
    }
}
