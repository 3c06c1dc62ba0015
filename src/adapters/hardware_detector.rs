use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::domain::{
    AcceleratorBackend, AcceleratorDevice, CapabilityConfig, ComputeCapability, CpuArch,
    DomainError, HardwareProfile, SimdCapabilities,
};
use crate::ports::AcceleratorRuntime;

/// Share of unified memory usable by the GPU on Apple Silicon.
const UNIFIED_MEMORY_GPU_SHARE: f64 = 0.75;

/// Accelerator runtime backed by the host's drivers and installed tooling.
///
/// Devices are enumerated with `nvidia-smi` (CUDA) and by platform (Metal).
/// Smoke tests run the configured command for the backend, which must exit
/// successfully after a small matrix multiply on the given device.
pub struct SystemAcceleratorRuntime {
    profile: OnceLock<HardwareProfile>,
    cuda_smoke_test: Vec<String>,
    metal_smoke_test: Vec<String>,
    smoke_test_timeout: Duration,
}

impl SystemAcceleratorRuntime {
    pub fn new(config: &CapabilityConfig) -> Self {
        Self {
            profile: OnceLock::new(),
            cuda_smoke_test: config.cuda_smoke_test.clone(),
            metal_smoke_test: config.metal_smoke_test.clone(),
            smoke_test_timeout: Duration::from_secs(config.smoke_test_timeout_secs.max(1)),
        }
    }

    /// Perform the actual host detection.
    fn detect_host() -> Result<HardwareProfile, DomainError> {
        let threads = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(1);

        let ram_bytes = Self::detect_ram().unwrap_or_else(|e| {
            warn!(error = %e, "RAM detection failed");
            0
        });

        let profile = HardwareProfile {
            arch: CpuArch::detect(),
            threads,
            simd: SimdCapabilities::detect(),
            ram_bytes,
        };

        info!(
            arch = %profile.arch,
            threads = profile.threads,
            ram_gb = profile.ram_gb(),
            avx2 = profile.simd.avx2,
            neon = profile.simd.neon,
            "Host profile detected"
        );

        Ok(profile)
    }

    /// Detect total system RAM.
    #[cfg(target_os = "macos")]
    fn detect_ram() -> Result<u64, DomainError> {
        let output = Command::new("sysctl")
            .args(["-n", "hw.memsize"])
            .output()
            .map_err(|e| DomainError::Hardware(format!("Failed to run sysctl: {}", e)))?;

        if !output.status.success() {
            return Err(DomainError::Hardware("sysctl command failed".to_string()));
        }

        let mem_str = String::from_utf8_lossy(&output.stdout);
        let ram_bytes: u64 = mem_str
            .trim()
            .parse()
            .map_err(|e| DomainError::Hardware(format!("Failed to parse memory size: {}", e)))?;

        debug!(ram_bytes, "Detected RAM via sysctl");
        Ok(ram_bytes)
    }

    /// Detect total system RAM.
    #[cfg(target_os = "linux")]
    fn detect_ram() -> Result<u64, DomainError> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")
            .map_err(|e| DomainError::Hardware(format!("Failed to read /proc/meminfo: {}", e)))?;

        let kb = meminfo
            .lines()
            .find(|line| line.starts_with("MemTotal:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .ok_or_else(|| DomainError::Hardware("Could not find MemTotal in /proc/meminfo".to_string()))?
            .parse::<u64>()
            .map_err(|e| DomainError::Hardware(format!("Failed to parse MemTotal: {}", e)))?;

        let ram_bytes = kb * 1024;
        debug!(ram_bytes, "Detected RAM via /proc/meminfo");
        Ok(ram_bytes)
    }

    /// Detect total system RAM.
    #[cfg(target_os = "windows")]
    fn detect_ram() -> Result<u64, DomainError> {
        let output = Command::new("wmic")
            .args(["ComputerSystem", "get", "TotalPhysicalMemory"])
            .output()
            .map_err(|e| DomainError::Hardware(format!("Failed to run wmic: {}", e)))?;

        if !output.status.success() {
            return Err(DomainError::Hardware("wmic command failed".to_string()));
        }

        let output_str = String::from_utf8_lossy(&output.stdout);
        let ram_bytes = output_str
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && *line != "TotalPhysicalMemory")
            .ok_or_else(|| DomainError::Hardware("Could not parse wmic output".to_string()))?
            .parse::<u64>()
            .map_err(|e| DomainError::Hardware(format!("Failed to parse memory size: {}", e)))?;

        debug!(ram_bytes, "Detected RAM via wmic");
        Ok(ram_bytes)
    }

    /// Detect total system RAM (unsupported platforms report unknown).
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    fn detect_ram() -> Result<u64, DomainError> {
        Err(DomainError::Hardware(
            "RAM detection not supported on this platform".to_string(),
        ))
    }

    /// Query NVIDIA devices. A missing driver means no devices.
    fn detect_cuda() -> Vec<AcceleratorDevice> {
        let output = match Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,compute_cap,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                debug!(status = ?output.status, "nvidia-smi reported no usable devices");
                return Vec::new();
            }
            Err(e) => {
                debug!(error = %e, "nvidia-smi not available");
                return Vec::new();
            }
        };

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }

    /// The integrated GPU on Apple Silicon.
    fn detect_metal(&self) -> Vec<AcceleratorDevice> {
        if !cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            return Vec::new();
        }

        let ram = self.profile().map(|p| p.ram_bytes).unwrap_or(0);
        vec![AcceleratorDevice {
            backend: AcceleratorBackend::Metal,
            index: 0,
            name: "Apple Silicon GPU".to_string(),
            compute_capability: None,
            memory_bytes: (ram > 0).then(|| (ram as f64 * UNIFIED_MEMORY_GPU_SHARE) as u64),
        }]
    }

    fn profile(&self) -> Result<HardwareProfile, DomainError> {
        if let Some(profile) = self.profile.get() {
            return Ok(profile.clone());
        }

        let profile = Self::detect_host()?;
        let _ = self.profile.set(profile.clone());
        Ok(profile)
    }

    fn smoke_test_command(&self, device: &AcceleratorDevice) -> Vec<String> {
        let template = match device.backend {
            AcceleratorBackend::Cuda => &self.cuda_smoke_test,
            AcceleratorBackend::Metal => &self.metal_smoke_test,
        };
        let index = device.index.to_string();
        template
            .iter()
            .map(|arg| arg.replace("{device}", &index))
            .collect()
    }
}

/// Parse `index, name, compute_cap, memory.total` CSV rows (memory in MiB).
fn parse_nvidia_smi(stdout: &str) -> Vec<AcceleratorDevice> {
    stdout
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                return None;
            }
            let index = fields[0].parse().ok()?;
            let memory_bytes = fields[3].parse::<u64>().ok().map(|mib| mib * 1024 * 1024);
            Some(AcceleratorDevice {
                backend: AcceleratorBackend::Cuda,
                index,
                name: fields[1].to_string(),
                compute_capability: fields[2].parse::<ComputeCapability>().ok(),
                memory_bytes,
            })
        })
        .collect()
}

/// Last non-empty line of a failed command's output, for the verdict reason.
fn failure_reason(stderr: &[u8], stdout: &[u8]) -> Option<String> {
    [stderr, stdout].iter().find_map(|bytes| {
        String::from_utf8_lossy(bytes)
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    })
}

#[async_trait]
impl AcceleratorRuntime for SystemAcceleratorRuntime {
    fn host_profile(&self) -> Result<HardwareProfile, DomainError> {
        self.profile()
    }

    fn detect(&self) -> Result<Vec<AcceleratorDevice>, DomainError> {
        let mut devices = Self::detect_cuda();
        devices.extend(self.detect_metal());

        info!(count = devices.len(), "Accelerators detected");
        for device in &devices {
            debug!(
                backend = %device.backend,
                index = device.index,
                name = %device.name,
                compute_capability = ?device.compute_capability,
                memory_bytes = ?device.memory_bytes,
                "Accelerator"
            );
        }
        Ok(devices)
    }

    async fn smoke_test(&self, device: &AcceleratorDevice) -> Result<(), String> {
        let command = self.smoke_test_command(device);
        let (program, args) = command
            .split_first()
            .ok_or_else(|| format!("No smoke test configured for {}", device.backend))?;

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to start smoke test '{}': {}", program, e))?;

        let output = tokio::time::timeout(self.smoke_test_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                format!(
                    "Smoke test timed out after {}s",
                    self.smoke_test_timeout.as_secs()
                )
            })?
            .map_err(|e| format!("Smoke test failed to run: {}", e))?;

        if output.status.success() {
            return Ok(());
        }

        let detail = failure_reason(&output.stderr, &output.stdout)
            .unwrap_or_else(|| "no output".to_string());
        Err(format!("Smoke test exited with {}: {}", output.status, detail))
    }
}
