use std::fmt;

use serde::{Deserialize, Serialize};

/// Host CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuArch {
    X86_64,
    Arm64,
    Other,
}

impl CpuArch {
    pub fn detect() -> Self {
        match std::env::consts::ARCH {
            "x86_64" => CpuArch::X86_64,
            "aarch64" => CpuArch::Arm64,
            _ => CpuArch::Other,
        }
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CpuArch::X86_64 => "x86_64",
            CpuArch::Arm64 => "arm64",
            CpuArch::Other => std::env::consts::ARCH,
        };
        f.write_str(name)
    }
}

/// Vector extensions usable by CPU inference kernels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimdCapabilities {
    pub avx: bool,
    pub avx2: bool,
    pub avx512: bool,
    pub neon: bool,
}

impl SimdCapabilities {
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        Self {
            avx: std::arch::is_x86_feature_detected!("avx"),
            avx2: std::arch::is_x86_feature_detected!("avx2"),
            avx512: std::arch::is_x86_feature_detected!("avx512f"),
            neon: false,
        }
    }

    /// NEON is mandatory on AArch64.
    #[cfg(target_arch = "aarch64")]
    pub fn detect() -> Self {
        Self {
            neon: true,
            ..Self::default()
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn detect() -> Self {
        Self::default()
    }

    /// Widest extension available, for display.
    pub fn best(&self) -> Option<&'static str> {
        [
            (self.avx512, "AVX-512"),
            (self.avx2, "AVX2"),
            (self.avx, "AVX"),
            (self.neon, "NEON"),
        ]
        .into_iter()
        .find_map(|(present, name)| present.then_some(name))
    }
}

/// Host CPU profile, used to describe the CPU execution target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub arch: CpuArch,
    /// Logical threads.
    pub threads: u32,
    pub simd: SimdCapabilities,
    /// Total RAM in bytes (0 if unknown).
    pub ram_bytes: u64,
}

impl HardwareProfile {
    pub fn ram_gb(&self) -> u32 {
        (self.ram_bytes / (1024 * 1024 * 1024)) as u32
    }

    /// One-line description, e.g. "x86_64 CPU, 16 threads, AVX2, 32 GB RAM".
    pub fn describe(&self) -> String {
        let mut parts = vec![
            format!("{} CPU", self.arch),
            format!("{} threads", self.threads),
        ];
        if let Some(simd) = self.simd.best() {
            parts.push(simd.to_string());
        }
        if self.ram_bytes > 0 {
            parts.push(format!("{} GB RAM", self.ram_gb()));
        }
        parts.join(", ")
    }
}
