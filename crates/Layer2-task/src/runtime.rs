//! Container runtime detection
//!
//! Probes the docker and podman binaries (`--version`, then `info`). A missing
//! or broken engine is a normal outcome and is reported as [`ContainerRuntime::None`].

use crate::process::{CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Container runtime type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    Docker,
    Podman,
    #[default]
    None,
}

impl ContainerRuntime {
    /// CLI binary for this runtime
    pub fn command(&self) -> Option<&'static str> {
        match self {
            Self::Docker => Some("docker"),
            Self::Podman => Some("podman"),
            Self::None => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
            Self::None => "none",
        }
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probes engine binaries through a [`CommandRunner`]
#[derive(Clone)]
pub struct RuntimeDetector {
    runner: Arc<dyn CommandRunner>,
    probe_timeout: Duration,
}

impl RuntimeDetector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            probe_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// True if `<bin> --version` and `<bin> info` both succeed
    pub async fn is_runtime_available(&self, runtime: ContainerRuntime) -> bool {
        let Some(binary) = runtime.command() else {
            return false;
        };

        for probe in ["--version", "info"] {
            let spec = CommandSpec::new(binary)
                .arg(probe)
                .timeout(self.probe_timeout);

            match self.runner.run(&spec).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    debug!(runtime = %runtime, probe, error = %output.error_text(), "Runtime probe failed");
                    return false;
                }
                Err(e) => {
                    debug!(runtime = %runtime, probe, error = %e, "Runtime probe failed");
                    return false;
                }
            }
        }

        true
    }

    /// Docker first, then podman, else `None`
    pub async fn best_runtime(&self) -> ContainerRuntime {
        for runtime in [ContainerRuntime::Docker, ContainerRuntime::Podman] {
            if self.is_runtime_available(runtime).await {
                info!(runtime = %runtime, "Container runtime detected");
                return runtime;
            }
        }

        info!("No container runtime available");
        ContainerRuntime::None
    }
}
