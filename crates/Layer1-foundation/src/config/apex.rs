//! Apex Config - 통합 설정
//!
//! 글로벌(`<config_dir>/apex/config.json`) + 프로젝트(`.apex/config.json`) 병합.
//! 병합은 JSON 값 단위로 수행하므로 프로젝트 파일에 명시된 키만 글로벌 값을 덮어쓴다.

use crate::core::IsolationStrategy;
use crate::storage::JsonStore;
use crate::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

/// 설정 파일명
pub const APEX_CONFIG_FILE: &str = "config.json";

// ============================================================================
// Apex Config (통합)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApexConfig {
    /// 버전 (마이그레이션용)
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub workspace: WorkspaceSettings,

    #[serde(default)]
    pub container: ContainerSettings,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    #[serde(default)]
    pub events: EventSettings,

    /// SQLite 데이터베이스 디렉토리
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for ApexConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            workspace: WorkspaceSettings::default(),
            container: ContainerSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            events: EventSettings::default(),
            data_dir: None,
        }
    }
}

impl ApexConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// 글로벌 + 현재 디렉토리 프로젝트 병합 로드
    pub fn load() -> Result<Self> {
        let global = JsonStore::global().ok();
        let project = JsonStore::current_project()?;
        Self::load_from(global.as_ref(), &project)
    }

    /// 글로벌 + 지정한 프로젝트 병합 로드
    pub fn load_for_project(project_root: impl AsRef<Path>) -> Result<Self> {
        let global = JsonStore::global().ok();
        Self::load_from(global.as_ref(), &JsonStore::project(project_root))
    }

    /// 주어진 저장소에서 병합 로드 (없는 파일은 기본값)
    pub fn load_from(global: Option<&JsonStore>, project: &JsonStore) -> Result<Self> {
        let mut merged = Value::Object(Default::default());

        // 1. 글로벌 설정
        if let Some(global) = global {
            if let Some(value) = global.load_optional::<Value>(APEX_CONFIG_FILE)? {
                debug!(path = %global.file_path(APEX_CONFIG_FILE).display(), "Loaded global config");
                merge_values(&mut merged, value);
            }
        }

        // 2. 프로젝트 설정
        if let Some(value) = project.load_optional::<Value>(APEX_CONFIG_FILE)? {
            debug!(path = %project.file_path(APEX_CONFIG_FILE).display(), "Loaded project config");
            merge_values(&mut merged, value);
        }

        let config: ApexConfig = serde_json::from_value(merged)
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 글로벌 설정 저장
    pub fn save_global(&self) -> Result<()> {
        JsonStore::global()?.save(APEX_CONFIG_FILE, self)
    }

    /// 프로젝트 설정 저장
    pub fn save_project(&self, project_root: impl AsRef<Path>) -> Result<()> {
        JsonStore::project(project_root).save(APEX_CONFIG_FILE, self)
    }

    // ========================================================================
    // Validation / Resolution
    // ========================================================================

    pub fn validate(&self) -> Result<()> {
        self.container.validate()?;

        if self.orchestrator.max_concurrency == 0 {
            return Err(Error::Config(
                "orchestrator.maxConcurrency must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// 데이터 디렉토리 (미설정 시 `<data_dir>/apex`)
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::data_dir()
                .map(|d| d.join("apex"))
                .ok_or_else(|| Error::Config("Cannot find data directory".to_string())),
        }
    }

    /// 호출별 오버라이드를 반영한 격리 전략
    pub fn strategy_for(&self, overrides: &ExecutionOverrides) -> IsolationStrategy {
        overrides
            .strategy
            .unwrap_or(self.workspace.default_strategy)
    }

    /// 호출별 오버라이드(cpu, memory)를 반영한 컨테이너 설정
    pub fn container_for(&self, overrides: &ExecutionOverrides) -> Result<ContainerSettings> {
        let mut settings = self.container.clone();
        if let Some(cpu) = overrides.cpu {
            settings.cpu = Some(cpu);
        }
        if let Some(memory) = &overrides.memory {
            settings.memory = Some(memory.clone());
        }
        settings.validate()?;
        Ok(settings)
    }

    /// 종료 상태에 따른 워크스페이스 보존 여부
    pub fn retain_workspace(&self, overrides: &ExecutionOverrides, failed: bool) -> bool {
        overrides.retain_workspace.unwrap_or(if failed {
            self.workspace.retain_on_failure
        } else {
            self.workspace.retain_on_completion
        })
    }
}

// ============================================================================
// Workspace Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSettings {
    /// 기본 격리 전략
    #[serde(default)]
    pub default_strategy: IsolationStrategy,

    /// worktree / directory 워크스페이스 위치
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_dir: Option<PathBuf>,

    /// 실패한 Task의 워크스페이스 보존 (사후 분석용)
    #[serde(default)]
    pub retain_on_failure: bool,

    #[serde(default)]
    pub retain_on_completion: bool,
}

impl WorkspaceSettings {
    /// 워크스페이스 루트 (미설정 시 `<tmp>/apex-workspaces`)
    pub fn resolve_root_dir(&self) -> PathBuf {
        self.root_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("apex-workspaces"))
    }
}

// ============================================================================
// Container Settings
// ============================================================================

/// 컨테이너 기본값 (이미지, 리소스 제한, 보안 옵션)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSettings {
    #[serde(default = "default_image")]
    pub image: String,

    /// CPU 개수 (`--cpus`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,

    /// 메모리 제한 (예: "4g")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_reservation: Option<String>,

    /// 메모리 + 스왑 ("-1" = 무제한)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,

    /// bridge, host, none 또는 네트워크 이름
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,

    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// 호스트 경로 → 컨테이너 경로 (":ro" 접미사 허용)
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub security_opts: Vec<String>,

    #[serde(default)]
    pub cap_drop: Vec<String>,

    #[serde(default)]
    pub cap_add: Vec<String>,

    #[serde(default)]
    pub auto_remove: bool,

    /// 설정 시 이미지를 먼저 빌드
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_context: Option<PathBuf>,

    /// 엔진 호출당 최대 대기 시간
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// `stop -t` 유예 시간
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            image: default_image(),
            cpu: None,
            memory: None,
            memory_reservation: None,
            memory_swap: None,
            cpu_shares: None,
            pids_limit: None,
            network_mode: None,
            environment: BTreeMap::new(),
            volumes: BTreeMap::new(),
            working_dir: None,
            user: None,
            privileged: false,
            security_opts: Vec::new(),
            cap_drop: Vec::new(),
            cap_add: Vec::new(),
            auto_remove: false,
            dockerfile: None,
            build_context: None,
            operation_timeout_secs: default_operation_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl ContainerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() && self.dockerfile.is_none() {
            return Err(Error::Config("container.image must not be empty".to_string()));
        }

        if let Some(cpu) = self.cpu {
            if cpu.is_nan() || cpu <= 0.0 {
                return Err(Error::Config(format!(
                    "container.cpu must be positive, got {}",
                    cpu
                )));
            }
        }

        check_memory_spec("memory", self.memory.as_deref())?;
        check_memory_spec("memoryReservation", self.memory_reservation.as_deref())?;
        if self.memory_swap.as_deref() != Some("-1") {
            check_memory_spec("memorySwap", self.memory_swap.as_deref())?;
        }

        Ok(())
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

fn memory_spec_regex() -> Result<&'static Regex> {
    static MEMORY_SPEC: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    MEMORY_SPEC
        .get_or_init(|| Regex::new(r"^\d+(\.\d+)?[bkmgBKMG]?$"))
        .as_ref()
        .map_err(|e| Error::Internal(format!("Invalid memory pattern: {}", e)))
}

fn check_memory_spec(field: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(spec) if !memory_spec_regex()?.is_match(spec) => Err(Error::Config(format!(
            "container.{} is not a valid memory size: {:?}",
            field, spec
        ))),
        _ => Ok(()),
    }
}

// ============================================================================
// Orchestrator Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorSettings {
    /// 동시에 실행되는 Task 수
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// 실패 시 자동 재시도
    #[serde(default = "default_true")]
    pub auto_retry: bool,

    #[serde(default)]
    pub retry_backoff: RetryBackoff,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_max_retries: default_max_retries(),
            auto_retry: true,
            retry_backoff: RetryBackoff::default(),
        }
    }
}

/// 자동 재시도 대기 정책
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetryBackoff {
    Fixed {
        #[serde(rename = "delayMs")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(rename = "baseMs")]
        base_ms: u64,
        #[serde(rename = "maxMs")]
        max_ms: u64,
    },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Fixed { delay_ms: 1000 }
    }
}

impl RetryBackoff {
    /// `attempt`번째 재시도(1부터) 전 대기 시간
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            RetryBackoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            RetryBackoff::Exponential { base_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                let delay = base_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(max_ms))
            }
        }
    }
}

// ============================================================================
// Event Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSettings {
    /// 컨테이너 이벤트 스트림 모니터링
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// 엔진에 추가로 전달할 `--filter` 값
    #[serde(default)]
    pub filters: Vec<String>,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filters: Vec::new(),
        }
    }
}

// ============================================================================
// Execution Overrides
// ============================================================================

/// `execute` 호출별 설정 오버라이드
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<IsolationStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain_workspace: Option<bool>,
}

impl ExecutionOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: IsolationStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn cpu(mut self, cpu: f64) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.memory = Some(memory.into());
        self
    }

    pub fn retain_workspace(mut self, retain: bool) -> Self {
        self.retain_workspace = Some(retain);
        self
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// 객체는 키 단위로 재귀 병합, 그 외 값은 overlay가 대체
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn default_version() -> u32 {
    1
}

fn default_image() -> String {
    "ubuntu:22.04".to_string()
}

fn default_operation_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = ApexConfig::default();
        assert_eq!(config.workspace.default_strategy, IsolationStrategy::Worktree);
        assert_eq!(config.orchestrator.max_concurrency, 4);
        assert_eq!(config.orchestrator.default_max_retries, 3);
        assert_eq!(
            config.orchestrator.retry_backoff,
            RetryBackoff::Fixed { delay_ms: 1000 }
        );
        assert_eq!(config.container.operation_timeout_secs, 120);
        assert!(config.events.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_project_overrides_global_per_key() {
        let global_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let global = JsonStore::new(global_dir.path());
        let project = JsonStore::project(project_dir.path());

        global
            .save(
                APEX_CONFIG_FILE,
                &json!({
                    "container": { "image": "node:20", "memory": "2g" },
                    "orchestrator": { "autoRetry": false },
                }),
            )
            .unwrap();
        project
            .save(
                APEX_CONFIG_FILE,
                &json!({
                    "workspace": { "defaultStrategy": "container" },
                    "container": { "memory": "4g" },
                }),
            )
            .unwrap();

        let config = ApexConfig::load_from(Some(&global), &project).unwrap();
        assert_eq!(config.workspace.default_strategy, IsolationStrategy::Container);
        assert_eq!(config.container.image, "node:20");
        assert_eq!(config.container.memory.as_deref(), Some("4g"));
        assert!(!config.orchestrator.auto_retry);
    }

    #[test]
    fn test_missing_files_yield_defaults() {
        let project_dir = tempfile::tempdir().unwrap();
        let config =
            ApexConfig::load_from(None, &JsonStore::project(project_dir.path())).unwrap();
        assert_eq!(config, ApexConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_container_settings() {
        let mut config = ApexConfig::default();
        config.container.image = "  ".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ApexConfig::default();
        config.container.memory = Some("4 gigabytes".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = ApexConfig::default();
        config.container.memory = Some("1.5g".to_string());
        config.container.memory_swap = Some("-1".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = ApexConfig::default();
        let overrides = ExecutionOverrides::new()
            .strategy(IsolationStrategy::Container)
            .cpu(2.0)
            .memory("4g");

        assert_eq!(config.strategy_for(&overrides), IsolationStrategy::Container);
        let container = config.container_for(&overrides).unwrap();
        assert_eq!(container.cpu, Some(2.0));
        assert_eq!(container.memory.as_deref(), Some("4g"));

        let bad = ExecutionOverrides::new().memory("lots");
        assert!(config.container_for(&bad).is_err());
    }

    #[test]
    fn test_retain_workspace() {
        let mut config = ApexConfig::default();
        config.workspace.retain_on_failure = true;

        assert!(config.retain_workspace(&ExecutionOverrides::new(), true));
        assert!(!config.retain_workspace(&ExecutionOverrides::new(), false));
        assert!(config.retain_workspace(&ExecutionOverrides::new().retain_workspace(true), false));
    }

    #[test]
    fn test_backoff() {
        let fixed = RetryBackoff::default();
        assert_eq!(fixed.delay_for(1), Duration::from_millis(1000));
        assert_eq!(fixed.delay_for(5), Duration::from_millis(1000));

        let exp = RetryBackoff::Exponential {
            base_ms: 100,
            max_ms: 1000,
        };
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(3), Duration::from_millis(400));
        assert_eq!(exp.delay_for(10), Duration::from_millis(1000));

        let parsed: RetryBackoff =
            serde_json::from_value(json!({ "type": "exponential", "baseMs": 50, "maxMs": 500 }))
                .unwrap();
        assert_eq!(
            parsed,
            RetryBackoff::Exponential {
                base_ms: 50,
                max_ms: 500
            }
        );
    }
}
