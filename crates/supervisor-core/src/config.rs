//! Data model: `SecurityConfig`, `ResourceLimits`, and the process/service
//! request shapes the Dispatcher builds from tool-call arguments.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Hardcoded set of executables that are always refused, regardless of
/// allowlist contents. Never mutated at runtime.
pub fn dangerous_executables() -> &'static [&'static str] {
    &[
        "sudo", "su", "rm", "dd", "mkfs", "shutdown", "reboot", "halt", "runas", "reg",
        "diskpart", "netsh", "format", "fdisk", "mkfs.ext4", "mkfs.xfs",
    ]
}

/// Hardcoded shell interpreters, conditionally blocked by `blockShells`.
pub fn shell_interpreters() -> &'static [&'static str] {
    &[
        "bash",
        "sh",
        "zsh",
        "fish",
        "csh",
        "tcsh",
        "ksh",
        "cmd.exe",
        "powershell.exe",
        "pwsh.exe",
    ]
}

/// Hardcoded env vars that are always stripped during sanitization.
pub fn dangerous_env_vars() -> &'static [&'static str] {
    &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_INSERT_LIBRARIES",
        "DYLD_LIBRARY_PATH",
        "PATH",
        "PYTHONPATH",
        "NODE_PATH",
        "PERL5LIB",
        "RUBYLIB",
        "Path",
        "PATHEXT",
        "COMSPEC",
    ]
}

/// Resource ceilings applied to a single managed process. All fields are
/// optional; `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_cpu_percent: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_file_descriptors: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_cpu_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub max_child_processes: Option<u32>,
}

/// Immutable (after load) security posture consulted by the Policy layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    pub allowed_executables: Vec<String>,
    #[serde(default)]
    pub additional_dangerous_env_vars: Vec<String>,
    #[serde(default = "default_true")]
    pub block_shells: bool,
    #[serde(default = "default_true")]
    pub block_setuid: bool,
    #[serde(default)]
    pub allowed_env_vars: Option<BTreeSet<String>>,
    #[serde(default)]
    pub allowed_working_directories: Vec<String>,
    #[serde(default)]
    pub default_resource_limits: ResourceLimits,
    #[serde(default)]
    pub max_resource_limits: ResourceLimits,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_processes: u32,
    #[serde(default = "default_max_launches_per_minute")]
    pub max_launches_per_minute: u32,
    #[serde(default = "default_true")]
    pub allow_termination: bool,
    #[serde(default = "default_true")]
    pub allow_stdin: bool,
    #[serde(default = "default_true")]
    pub enable_audit_log: bool,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_max_concurrent() -> u32 {
    20
}
fn default_max_launches_per_minute() -> u32 {
    10
}
fn default_timeout_ms() -> u64 {
    300_000
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            allowed_executables: Vec::new(),
            additional_dangerous_env_vars: Vec::new(),
            block_shells: true,
            block_setuid: true,
            allowed_env_vars: None,
            allowed_working_directories: Vec::new(),
            default_resource_limits: ResourceLimits::default(),
            max_resource_limits: ResourceLimits::default(),
            max_concurrent_processes: default_max_concurrent(),
            max_launches_per_minute: default_max_launches_per_minute(),
            allow_termination: true,
            allow_stdin: true,
            enable_audit_log: true,
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl SecurityConfig {
    /// A small, permissive sample config written by `--create-config`.
    pub fn sample() -> Self {
        SecurityConfig {
            allowed_executables: vec!["node".into(), "python3".into(), "/usr/bin/git".into()],
            ..SecurityConfig::default()
        }
    }

    /// Construction-time validation: an empty allowlist, a non-positive
    /// limit, or a relative `allowedWorkingDirectories` entry is rejected
    /// before the config is ever used to gate a launch.
    pub fn validate(&self) -> Result<(), String> {
        if self.allowed_executables.is_empty() {
            return Err("allowedExecutables must not be empty".to_string());
        }
        for dir in &self.allowed_working_directories {
            if !std::path::Path::new(dir).is_absolute() {
                return Err(format!(
                    "allowedWorkingDirectories entry `{dir}` must be an absolute path"
                ));
            }
        }
        if self.max_concurrent_processes == 0 {
            return Err("maxConcurrentProcesses must be positive".to_string());
        }
        if self.max_launches_per_minute == 0 {
            return Err("maxLaunchesPerMinute must be positive".to_string());
        }
        if let Some(cpu) = self.default_resource_limits.max_cpu_percent {
            if !(cpu > 0.0 && cpu <= 100.0) {
                return Err("defaultResourceLimits.maxCpuPercent must be in (0, 100]".to_string());
            }
        }
        if let Some(cpu) = self.max_resource_limits.max_cpu_percent {
            if !(cpu > 0.0 && cpu <= 100.0) {
                return Err("maxResourceLimits.maxCpuPercent must be in (0, 100]".to_string());
            }
        }
        Ok(())
    }
}

/// Request shape for launching a bare process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub capture_output: bool,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Exponential-backoff restart policy for a managed service.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    1000
}

/// Health-check probe configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_health_timeout_ms() -> u64 {
    5_000
}

/// Request shape for `process_start_service`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    #[serde(flatten)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
}

/// Saturating exponential backoff: `min(base * 2^n, cap)`, computed without
/// ever overflowing the multiplication.
pub fn backoff_ms(base_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}
