use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::{debug, info, warn};

use crate::domain::{
    CapabilityConfig, CapabilityTarget, ComputeCapability, DomainError, ProbeReport, Verdict,
};
use crate::ports::AcceleratorRuntime;

/// Chooses the execution target for a model load.
///
/// Every call probes afresh; nothing is cached between calls, so a driver
/// installed while the app runs is picked up on the next selection.
pub struct CapabilityProbe {
    runtime: Arc<dyn AcceleratorRuntime>,
    prefer_accelerator: bool,
    ceiling: Option<ComputeCapability>,
}

impl CapabilityProbe {
    pub fn new(runtime: Arc<dyn AcceleratorRuntime>, config: &CapabilityConfig) -> Self {
        let ceiling = config
            .compute_capability_ceiling
            .as_deref()
            .and_then(|raw| match raw.parse::<ComputeCapability>() {
                Ok(cc) => Some(cc),
                Err(e) => {
                    warn!(ceiling = raw, error = %e, "Ignoring invalid compute capability ceiling");
                    None
                }
            });

        Self {
            runtime,
            prefer_accelerator: config.prefer_accelerator,
            ceiling,
        }
    }

    /// CPU first, then detected accelerators best first. All untested.
    pub async fn enumerate(&self) -> Vec<CapabilityTarget> {
        let runtime = Arc::clone(&self.runtime);
        let detected =
            tokio::task::spawn_blocking(move || (runtime.host_profile(), runtime.detect())).await;
        let (profile, devices) = match detected {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Hardware detection panicked; assuming CPU only");
                let err = DomainError::Hardware(e.to_string());
                (Err(err), Ok(Vec::new()))
            }
        };

        let description = match profile {
            Ok(profile) => profile.describe(),
            Err(e) => {
                warn!(error = %e, "Host profile unavailable");
                "CPU".to_string()
            }
        };
        let mut devices = devices.unwrap_or_else(|e| {
            warn!(error = %e, "Accelerator detection failed; assuming none");
            Vec::new()
        });
        devices.sort_by(|a, b| a.rank_cmp(b));

        let mut targets = Vec::with_capacity(devices.len() + 1);
        targets.push(CapabilityTarget::cpu(description));
        targets.extend(devices.into_iter().map(CapabilityTarget::accelerator));
        targets
    }

    /// Decide whether a target can actually run computations.
    pub async fn test(&self, target: &CapabilityTarget) -> Verdict {
        let Some(device) = target.device.as_ref() else {
            return Verdict::Compatible;
        };

        if let (Some(cc), Some(ceiling)) = (device.compute_capability, self.ceiling) {
            if cc > ceiling {
                return Verdict::Incompatible {
                    reason: format!(
                        "accelerator generation {} newer than runtime support ceiling {}",
                        cc, ceiling
                    ),
                };
            }
        }

        let outcome = AssertUnwindSafe(self.runtime.smoke_test(device))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => Verdict::Compatible,
            Ok(Err(reason)) => Verdict::Incompatible { reason },
            Err(_) => Verdict::Incompatible {
                reason: "smoke test panicked".to_string(),
            },
        }
    }

    /// The first compatible accelerator in rank order, else the CPU.
    pub async fn select(&self) -> CapabilityTarget {
        self.select_report().await.selected
    }

    /// Select a target and report the verdict of every candidate considered.
    ///
    /// Accelerators ranked below the selected one stay untested.
    pub async fn select_report(&self) -> ProbeReport {
        let mut candidates = self.enumerate().await;
        // enumerate always yields the CPU at index 0
        candidates[0].verdict = Verdict::Compatible;

        let mut selected = 0;
        if self.prefer_accelerator {
            for i in 1..candidates.len() {
                let verdict = self.test(&candidates[i]).await;
                debug!(target_id = %candidates[i].id, verdict = ?verdict, "Target tested");
                let compatible = verdict.is_compatible();
                candidates[i].verdict = verdict;
                if compatible {
                    selected = i;
                    break;
                }
            }
        } else {
            debug!("Accelerators disabled by configuration");
        }

        let selected = candidates[selected].clone();
        info!(
            target_id = %selected.id,
            name = %selected.name,
            candidates = candidates.len(),
            "Execution target selected"
        );
        ProbeReport {
            selected,
            candidates,
        }
    }
}
