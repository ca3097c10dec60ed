//! Container configuration and `create` argument translation

use apex_foundation::ContainerSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Label marking containers managed by Apex
pub const MANAGED_LABEL: &str = "apex.managed";

/// Label carrying the owning task id
pub const TASK_ID_LABEL: &str = "apex.task-id";

/// Name prefix of task containers (`apex-task-<taskId>`)
pub const CONTAINER_NAME_PREFIX: &str = "apex-task-";

/// Deterministic container name for a task
pub fn container_name(task_id: &str) -> String {
    format!("{}{}", CONTAINER_NAME_PREFIX, task_id)
}

/// Image tag used when building from a Dockerfile
pub fn image_tag(task_id: &str) -> String {
    format!("{}{}:latest", CONTAINER_NAME_PREFIX, task_id)
}

/// Resource limits for container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU limit (number of cores, e.g., 1.5)
    pub cpus: Option<f64>,
    /// Memory limit (e.g., "512m", "2g")
    pub memory: Option<String>,
    pub memory_reservation: Option<String>,
    /// Memory + swap limit ("-1" for unlimited)
    pub memory_swap: Option<String>,
    /// Relative CPU weight
    pub cpu_shares: Option<u64>,
    pub pids_limit: Option<i64>,
}

/// Network mode for container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum NetworkMode {
    /// No network access
    None,
    /// Engine default
    #[default]
    Bridge,
    /// Host network (full access)
    Host,
    /// Named network
    Custom(String),
}

impl NetworkMode {
    pub fn parse(mode: &str) -> Self {
        match mode {
            "none" => Self::None,
            "bridge" | "default" => Self::Bridge,
            "host" => Self::Host,
            other => Self::Custom(other.to_string()),
        }
    }
}

/// Volume mount configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn to_arg(&self) -> String {
        let ro = if self.read_only { ":ro" } else { "" };
        format!(
            "{}:{}{}",
            self.host_path.to_string_lossy(),
            self.container_path,
            ro
        )
    }
}

/// Security options for container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub privileged: bool,
    /// Raw `--security-opt` values (e.g. "no-new-privileges:true")
    pub security_opts: Vec<String>,
    pub cap_drop: Vec<String>,
    pub cap_add: Vec<String>,
    /// `uid[:gid]` to run as
    pub user: Option<String>,
}

/// Container configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    /// Build the image from this Dockerfile first
    pub dockerfile: Option<String>,
    /// Build context directory (defaults to the current directory)
    pub build_context: Option<PathBuf>,
    /// Command to run (defaults to `sleep infinity` so exec has a target)
    pub command: Vec<String>,
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub volumes: Vec<VolumeMount>,
    pub limits: ResourceLimits,
    pub network: NetworkMode,
    pub security: SecurityProfile,
    /// Engine removes the container once it exits (`--rm`)
    pub auto_remove: bool,
    pub labels: BTreeMap<String, String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".to_string(),
            dockerfile: None,
            build_context: None,
            command: vec![],
            working_dir: None,
            env: BTreeMap::new(),
            volumes: vec![],
            limits: ResourceLimits::default(),
            network: NetworkMode::default(),
            security: SecurityProfile::default(),
            auto_remove: false,
            labels: BTreeMap::new(),
        }
    }
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Translate configured container defaults
    pub fn from_settings(settings: &ContainerSettings) -> Self {
        let volumes = settings
            .volumes
            .iter()
            .map(|(host, target)| match target.strip_suffix(":ro") {
                Some(path) => VolumeMount::new(host, path).read_only(),
                None => VolumeMount::new(host, target.as_str()),
            })
            .collect();

        Self {
            image: settings.image.clone(),
            dockerfile: settings.dockerfile.clone(),
            build_context: settings.build_context.clone(),
            command: vec![],
            working_dir: settings.working_dir.clone(),
            env: settings.environment.clone(),
            volumes,
            limits: ResourceLimits {
                cpus: settings.cpu,
                memory: settings.memory.clone(),
                memory_reservation: settings.memory_reservation.clone(),
                memory_swap: settings.memory_swap.clone(),
                cpu_shares: settings.cpu_shares,
                pids_limit: settings.pids_limit,
            },
            network: settings
                .network_mode
                .as_deref()
                .map(NetworkMode::parse)
                .unwrap_or_default(),
            security: SecurityProfile {
                privileged: settings.privileged,
                security_opts: settings.security_opts.clone(),
                cap_drop: settings.cap_drop.clone(),
                cap_add: settings.cap_add.clone(),
                user: settings.user.clone(),
            },
            auto_remove: settings.auto_remove,
            labels: BTreeMap::new(),
        }
    }

    pub fn with_command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn with_security(mut self, security: SecurityProfile) -> Self {
        self.security = security;
        self
    }

    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    pub fn with_dockerfile(
        mut self,
        dockerfile: impl Into<String>,
        context: impl Into<PathBuf>,
    ) -> Self {
        self.dockerfile = Some(dockerfile.into());
        self.build_context = Some(context.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Arguments following `<engine> create` for the task's container
    ///
    /// `image` overrides the configured image (used after a Dockerfile build).
    pub fn build_create_args(&self, task_id: &str, image: &str) -> Vec<String> {
        let mut args = vec!["--name".to_string(), container_name(task_id)];

        // Labels (management labels first, then user labels)
        args.push("--label".to_string());
        args.push(format!("{}=true", MANAGED_LABEL));
        args.push("--label".to_string());
        args.push(format!("{}={}", TASK_ID_LABEL, task_id));
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Auto-remove
        if self.auto_remove {
            args.push("--rm".to_string());
        }

        // Working directory
        if let Some(dir) = &self.working_dir {
            args.push("-w".to_string());
            args.push(dir.clone());
        }

        // Environment
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        // Volumes
        for vol in &self.volumes {
            args.push("-v".to_string());
            args.push(vol.to_arg());
        }

        // Resource limits
        if let Some(cpus) = self.limits.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(mem) = &self.limits.memory {
            args.push("--memory".to_string());
            args.push(mem.clone());
        }
        if let Some(reservation) = &self.limits.memory_reservation {
            args.push("--memory-reservation".to_string());
            args.push(reservation.clone());
        }
        if let Some(swap) = &self.limits.memory_swap {
            args.push("--memory-swap".to_string());
            args.push(swap.clone());
        }
        if let Some(shares) = self.limits.cpu_shares {
            args.push("--cpu-shares".to_string());
            args.push(shares.to_string());
        }
        if let Some(pids) = self.limits.pids_limit {
            args.push("--pids-limit".to_string());
            args.push(pids.to_string());
        }

        // Network
        match &self.network {
            NetworkMode::Bridge => {
                // Default, no arg needed
            }
            NetworkMode::None => {
                args.push("--network".to_string());
                args.push("none".to_string());
            }
            NetworkMode::Host => {
                args.push("--network".to_string());
                args.push("host".to_string());
            }
            NetworkMode::Custom(name) => {
                args.push("--network".to_string());
                args.push(name.clone());
            }
        }

        // Security
        if let Some(user) = &self.security.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        if self.security.privileged {
            args.push("--privileged".to_string());
        }
        for opt in &self.security.security_opts {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }
        for cap in &self.security.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        for cap in &self.security.cap_add {
            args.push("--cap-add".to_string());
            args.push(cap.clone());
        }

        // Image
        args.push(image.to_string());

        // Command (keep the container alive by default)
        if self.command.is_empty() {
            args.push("sleep".to_string());
            args.push("infinity".to_string());
        } else {
            args.extend(self.command.clone());
        }

        args
    }

    /// Arguments following `<engine> build`
    pub fn build_image_args(&self, task_id: &str) -> Option<Vec<String>> {
        let dockerfile = self.dockerfile.as_ref()?;
        let context = self
            .build_context
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Some(vec![
            "-t".to_string(),
            image_tag(task_id),
            "-f".to_string(),
            dockerfile.clone(),
            context,
        ])
    }
}
