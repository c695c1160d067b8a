//! Security Manager: the six-layer validation pipeline, environment
//! sanitization, rate limiting, and the managed-PID registry that gates
//! every signal the supervisor is asked to deliver.

use crate::config::{dangerous_env_vars, dangerous_executables, shell_interpreters, SecurityConfig};
use crate::error::{Result, SupervisorError};
use crate::util::now_epoch_secs;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const INJECTION_TOKENS: &[&str] = &["$(", "`", "|", ";", "&", "\n"];
const TRAVERSAL_TOKENS: &[&str] = &["../", "..\\"];
const MAX_ENV_VALUE_LEN: usize = 4096;
const MAX_ENV_AGGREGATE_BYTES: usize = 65536;

/// Resolves an executable name to an absolute path the way a shell's PATH
/// lookup would, without actually invoking a shell.
fn resolve_executable(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() || name.contains(std::path::MAIN_SEPARATOR) {
        return path.canonicalize().ok().filter(|p| p.is_file());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return candidate.canonicalize().ok().or(Some(candidate));
        }
        #[cfg(windows)]
        {
            let with_exe = dir.join(format!("{name}.exe"));
            if with_exe.is_file() {
                return with_exe.canonicalize().ok().or(Some(with_exe));
            }
        }
    }
    None
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Minimal `*`-only glob matcher: entries without a literal `*` require
/// exact equality, entries with one or more `*` treat each as "match any
/// run of characters" the way a shell glob does for a single path segment.
fn glob_match(pattern: &str, text: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == text;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !text[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == parts.len() - 1 {
            return text[pos..].ends_with(part);
        } else if let Some(found) = text[pos..].find(part) {
            pos += found + part.len();
        } else {
            return false;
        }
    }
    true
}

#[cfg(unix)]
fn has_setuid_or_setgid(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| {
            let mode = m.permissions().mode();
            mode & 0o4000 != 0 || mode & 0o2000 != 0
        })
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn has_setuid_or_setgid(_path: &Path) -> bool {
    false
}

/// An accepted, fully-resolved launch target.
#[derive(Debug, Clone)]
pub struct ResolvedExecutable {
    pub resolved_path: PathBuf,
    pub basename: String,
}

struct RateWindows {
    per_agent: HashMap<String, VecDeque<u64>>,
}

/// Holds the immutable `SecurityConfig` plus the mutable accounting state
/// (managed-PID set, rate-limit windows) that every launch/termination
/// request is checked against.
pub struct Policy {
    config: SecurityConfig,
    dangerous_env_extra: BTreeSet<String>,
    managed_pids: Mutex<BTreeSet<u32>>,
    rate_windows: Mutex<RateWindows>,
    audit: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
}

impl Policy {
    pub fn new(config: SecurityConfig) -> Result<Self> {
        config
            .validate()
            .map_err(SupervisorError::SecurityViolation)?;
        let dangerous_env_extra = config
            .additional_dangerous_env_vars
            .iter()
            .cloned()
            .collect();
        Ok(Policy {
            config,
            dangerous_env_extra,
            managed_pids: Mutex::new(BTreeSet::new()),
            rate_windows: Mutex::new(RateWindows {
                per_agent: HashMap::new(),
            }),
            audit: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Installs a sink that receives one line of JSON per audit record.
    /// Mirrors the Dispatcher writing audit lines to stderr.
    pub fn set_audit_sink<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.audit.lock().unwrap() = Some(Box::new(sink));
    }

    fn emit_audit(&self, record: serde_json::Value) {
        if !self.config.enable_audit_log {
            return;
        }
        let line = record.to_string();
        if let Some(sink) = self.audit.lock().unwrap().as_ref() {
            sink(&line);
        } else {
            tracing::info!(target: "audit", "{line}");
        }
    }

    pub fn audit_operation(&self, operation: &str, executable: &str, pid: Option<u32>, result: &str) {
        self.emit_audit(json!({
            "timestamp": crate::util::iso_now(),
            "level": "AUDIT",
            "operation": operation,
            "executable": executable,
            "pid": pid,
            "result": result,
        }));
    }

    pub fn audit_security_violation(&self, kind: &str, details: serde_json::Value) {
        self.emit_audit(json!({
            "timestamp": crate::util::iso_now(),
            "level": "SECURITY_VIOLATION",
            "kind": kind,
            "details": details,
        }));
    }

    /// Layer-by-layer validation of an executable + its arguments. Returns
    /// the resolved executable on success.
    pub fn validate_executable(&self, executable: &str, args: &[String]) -> Result<ResolvedExecutable> {
        // 1. Resolve
        let resolved_path = resolve_executable(executable).ok_or_else(|| {
            SupervisorError::ExecutableNotFound(executable.to_string())
        })?;
        let name = basename(&resolved_path);

        // 2. Dangerous list — always blocks, independent of allowlist.
        if dangerous_executables().contains(&name.as_str()) {
            self.audit_security_violation("dangerous_executable", json!({"executable": name}));
            return Err(SupervisorError::DangerousExecutable(name));
        }

        // 3. Shell block
        if self.config.block_shells && shell_interpreters().contains(&name.as_str()) {
            self.audit_security_violation("shell_blocked", json!({"executable": name}));
            return Err(SupervisorError::ShellBlocked(name));
        }

        // 4. Setuid/setgid
        if self.config.block_setuid && has_setuid_or_setgid(&resolved_path) {
            self.audit_security_violation("setuid_blocked", json!({"executable": name}));
            return Err(SupervisorError::SetuidBlocked(name));
        }

        // 5. Allowlist
        let resolved_str = resolved_path.to_string_lossy();
        let allowed = self.config.allowed_executables.iter().any(|entry| {
            if entry.contains('*') {
                glob_match(entry, &resolved_str) || glob_match(entry, &name)
            } else {
                entry == resolved_str.as_ref() || entry == &name
            }
        });
        if !allowed {
            self.audit_security_violation("not_in_allowlist", json!({"executable": name}));
            return Err(SupervisorError::NotInAllowlist(name));
        }

        // 6. Argument scan
        for arg in args {
            for token in INJECTION_TOKENS {
                if arg.contains(token) {
                    self.audit_security_violation(
                        "argument_injection",
                        json!({"argument": arg, "token": token}),
                    );
                    return Err(SupervisorError::ArgumentInjection(arg.clone()));
                }
            }
            for token in TRAVERSAL_TOKENS {
                if arg.contains(token) {
                    self.audit_security_violation(
                        "argument_traversal",
                        json!({"argument": arg}),
                    );
                    return Err(SupervisorError::ArgumentTraversal(arg.clone()));
                }
            }
        }

        Ok(ResolvedExecutable {
            resolved_path,
            basename: name,
        })
    }

    pub fn validate_working_directory(&self, path: &str) -> Result<PathBuf> {
        if self.config.allowed_working_directories.is_empty() {
            return Ok(PathBuf::from(path));
        }
        let resolved = Path::new(path)
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from(path));
        let resolved_str = resolved.to_string_lossy().to_string();
        let ok = self.config.allowed_working_directories.iter().any(|allowed| {
            resolved_str == *allowed
                || resolved_str.starts_with(&format!("{allowed}{}", std::path::MAIN_SEPARATOR))
        });
        if ok {
            Ok(resolved)
        } else {
            Err(SupervisorError::WorkingDirectoryRestricted(path.to_string()))
        }
    }

    pub fn sanitize_environment(
        &self,
        env: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        let mut aggregate = 0usize;
        for (key, value) in env {
            if dangerous_env_vars().contains(&key.as_str()) || self.dangerous_env_extra.contains(key) {
                continue;
            }
            if let Some(allowed) = &self.config.allowed_env_vars {
                if !allowed.contains(key) {
                    return Err(SupervisorError::EnvVarBlocked(key.clone()));
                }
            }
            if value.contains("$(") || value.contains('`') || value.contains('\n') {
                return Err(SupervisorError::EnvVarInjection(key.clone()));
            }
            if value.len() > MAX_ENV_VALUE_LEN {
                return Err(SupervisorError::EnvVarTooLong(key.clone()));
            }
            aggregate += key.len() + value.len();
            out.insert(key.clone(), value.clone());
        }
        if aggregate > MAX_ENV_AGGREGATE_BYTES {
            return Err(SupervisorError::EnvSizeExceeded);
        }
        Ok(out)
    }

    pub fn check_concurrent_limit(&self) -> Result<()> {
        let pids = self.managed_pids.lock().unwrap();
        if pids.len() as u32 >= self.config.max_concurrent_processes {
            return Err(SupervisorError::ConcurrentLimitExceeded);
        }
        Ok(())
    }

    pub fn check_launch_rate_limit(&self, agent_id: &str) -> Result<()> {
        let now = now_epoch_secs();
        let mut windows = self.rate_windows.lock().unwrap();
        let window = windows
            .per_agent
            .entry(agent_id.to_string())
            .or_insert_with(VecDeque::new);
        while let Some(oldest) = window.front() {
            if now.saturating_sub(*oldest) > 60 {
                window.pop_front();
            } else {
                break;
            }
        }
        if window.len() as u32 >= self.config.max_launches_per_minute {
            return Err(SupervisorError::RateLimitExceeded(agent_id.to_string()));
        }
        window.push_back(now);
        Ok(())
    }

    pub fn validate_signal_target(&self, pid: u32) -> Result<()> {
        if self.managed_pids.lock().unwrap().contains(&pid) {
            Ok(())
        } else {
            Err(SupervisorError::SignalToUnmanaged(pid))
        }
    }

    /// Adds a pid to the managed set. Co-ordinated with
    /// `ProcessTable::register` by the Spawner so a pid is never
    /// registered in one without the other.
    pub fn register_pid(&self, pid: u32) {
        self.managed_pids.lock().unwrap().insert(pid);
    }

    /// Removes a pid from the managed set. Co-ordinated with
    /// `ProcessTable::unregister`.
    pub fn deregister_pid(&self, pid: u32) {
        self.managed_pids.lock().unwrap().remove(&pid);
    }

    pub fn managed_count(&self) -> usize {
        self.managed_pids.lock().unwrap().len()
    }

    pub fn is_managed(&self, pid: u32) -> bool {
        self.managed_pids.lock().unwrap().contains(&pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_allowing(names: &[&str]) -> Policy {
        let mut cfg = SecurityConfig::default();
        cfg.allowed_executables = names.iter().map(|s| s.to_string()).collect();
        Policy::new(cfg).unwrap()
    }

    #[test]
    fn dangerous_executable_blocked_even_if_allowlisted() {
        let policy = policy_allowing(&["sudo"]);
        let err = policy.validate_executable("sudo", &[]).unwrap_err();
        assert_eq!(err.code(), "DangerousExecutable");
    }

    #[test]
    fn unknown_executable_is_not_in_allowlist() {
        let policy = policy_allowing(&["node"]);
        let err = policy.validate_executable("zzz-not-a-real-binary", &[]).unwrap_err();
        assert_eq!(err.code(), "ExecutableNotFound");
    }

    #[test]
    fn argument_with_injection_token_rejected() {
        let policy = policy_allowing(&["node"]);
        // resolve will fail first if node is absent in test sandbox; emulate via glob on PATH-shaped binary.
        if resolve_executable("node").is_some() {
            let err = policy
                .validate_executable("node", &["$(rm -rf /)".to_string()])
                .unwrap_err();
            assert_eq!(err.code(), "ArgumentInjection");
        }
    }

    #[test]
    fn sanitize_strips_dangerous_keys_and_keeps_safe_ones() {
        let policy = policy_allowing(&["node"]);
        let mut env = BTreeMap::new();
        env.insert("LD_PRELOAD".to_string(), "/x.so".to_string());
        env.insert("FOO".to_string(), "bar".to_string());
        let sanitized = policy.sanitize_environment(&env).unwrap();
        assert!(!sanitized.contains_key("LD_PRELOAD"));
        assert_eq!(sanitized.get("FOO"), Some(&"bar".to_string()));
    }

    #[test]
    fn sanitize_rejects_oversized_value() {
        let policy = policy_allowing(&["node"]);
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "a".repeat(4097));
        let err = policy.sanitize_environment(&env).unwrap_err();
        assert_eq!(err.code(), "EnvVarTooLong");
    }

    #[test]
    fn concurrent_limit_enforced() {
        let mut cfg = SecurityConfig::default();
        cfg.allowed_executables = vec!["node".into()];
        cfg.max_concurrent_processes = 1;
        let policy = Policy::new(cfg).unwrap();
        policy.register_pid(123);
        assert!(policy.check_concurrent_limit().is_err());
        policy.deregister_pid(123);
        assert!(policy.check_concurrent_limit().is_ok());
    }

    #[test]
    fn rate_limit_enforced_per_agent() {
        let mut cfg = SecurityConfig::default();
        cfg.allowed_executables = vec!["node".into()];
        cfg.max_launches_per_minute = 2;
        let policy = Policy::new(cfg).unwrap();
        assert!(policy.check_launch_rate_limit("agent-a").is_ok());
        assert!(policy.check_launch_rate_limit("agent-a").is_ok());
        assert!(policy.check_launch_rate_limit("agent-a").is_err());
        assert!(policy.check_launch_rate_limit("agent-b").is_ok());
    }

    #[test]
    fn signal_target_must_be_managed() {
        let policy = policy_allowing(&["node"]);
        assert!(policy.validate_signal_target(999).is_err());
        policy.register_pid(999);
        assert!(policy.validate_signal_target(999).is_ok());
    }

    #[test]
    fn glob_allowlist_matches_basename() {
        assert!(glob_match("/usr/bin/*", "/usr/bin/git"));
        assert!(glob_match("git*", "gitlfs"));
        assert!(!glob_match("git", "gitlfs"));
    }
}
