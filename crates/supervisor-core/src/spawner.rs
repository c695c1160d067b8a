//! Spawner: validates a launch request through the full Policy gate, spawns
//! the OS process, wires capture/stdin, and registers the result.
//!
//! Keeps the `Child` handle alive for the lifetime of the managed process
//! and redirects stdout/stderr into pipes read by background threads into
//! a bounded capture buffer.

use crate::config::{ProcessConfig, ResourceLimits};
use crate::error::{Result, SupervisorError};
use crate::io::RingBuffer;
use crate::monitor::Monitor;
use crate::policy::Policy;
use crate::process_table::{ManagedProcess, ProcessState, ProcessStats, ProcessTable};
use crate::terminator::Terminator;
use crate::timeouts::Timeouts;
use crate::util::now_epoch_secs;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;

const CAPTURE_CAP_BYTES: usize = 10 * 1024 * 1024;

/// Shared component handles a launch needs, grouped so call sites don't
/// have to thread five separate `Arc`s through every function signature.
#[derive(Clone)]
pub struct Components {
    pub table: Arc<ProcessTable>,
    pub policy: Arc<Policy>,
    pub monitor: Arc<Monitor>,
    pub timeouts: Arc<Timeouts>,
}

impl Components {
    pub fn terminator(&self) -> Terminator {
        Terminator::new(self.table.clone(), self.policy.clone())
    }
}

pub struct Spawner {
    components: Components,
}

impl Spawner {
    pub fn new(components: Components) -> Self {
        Spawner { components }
    }

    /// Orchestrates the full launch pipeline: policy gate, spawn, capture
    /// wiring, and monitor/timeout registration.
    pub fn launch(&self, config: ProcessConfig) -> Result<u32> {
        let policy = &self.components.policy;
        let resolved = policy.validate_executable(&config.executable, &config.args)?;

        if let Some(cwd) = &config.cwd {
            policy.validate_working_directory(cwd)?;
        }
        let sanitized_env = match &config.env {
            Some(env) => Some(policy.sanitize_environment(env)?),
            None => None,
        };
        policy.check_concurrent_limit()?;
        let agent_id = config.agent_id.clone().unwrap_or_else(|| "default".to_string());
        policy.check_launch_rate_limit(&agent_id)?;

        let mut command = Command::new(&resolved.resolved_path);
        command.args(&config.args);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        if let Some(env) = &sanitized_env {
            command.env_clear();
            command.envs(env);
        }
        if config.capture_output {
            command.stdin(Stdio::piped());
            command.stdout(Stdio::piped());
            command.stderr(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
            command.stdout(Stdio::null());
            command.stderr(Stdio::null());
        }

        let mut child = command.spawn().map_err(classify_spawn_error)?;
        let pid = child.id();

        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();

        self.components.policy.register_pid(pid);
        self.components.table.register(ManagedProcess {
            pid,
            command: config.executable.clone(),
            args: config.args.clone(),
            state: ProcessState::Running,
            start_epoch_secs: now_epoch_secs(),
            exit_code: None,
            stats: ProcessStats::default(),
            output_buffer: RingBuffer::new(CAPTURE_CAP_BYTES),
            error_buffer: RingBuffer::new(CAPTURE_CAP_BYTES),
            group_id: None,
            child: Some(child),
        });

        spawn_capture_reader(self.components.table.clone(), pid, stdout_handle, true);
        spawn_capture_reader(self.components.table.clone(), pid, stderr_handle, false);

        let limits = config.resource_limits.unwrap_or_else(|| {
            self.components.policy.config().default_resource_limits
        });
        self.start_monitoring_and_timeout(pid, limits, config.timeout_ms.unwrap_or(0));

        self.components
            .policy
            .audit_operation("processStart", &config.executable, Some(pid), "success");

        Ok(pid)
    }

    fn start_monitoring_and_timeout(&self, pid: u32, limits: ResourceLimits, timeout_ms: u64) {
        self.components.monitor.start_monitoring(pid, limits);

        let table = self.components.table.clone();
        let policy = self.components.policy.clone();
        let terminator = self.components.terminator();
        self.components.timeouts.register(pid, timeout_ms, move || {
            let table = table.clone();
            let policy = policy.clone();
            let terminator = terminator.clone();
            tokio::spawn(async move {
                let _ = terminator.terminate_forcefully_signal_only(pid);
                let _ = table.with_process_mut(pid, |proc_| {
                    proc_.state = ProcessState::Crashed;
                    proc_.exit_code = Some(-1);
                });
                policy.deregister_pid(pid);
            });
        });
    }

    /// Runs once a managed child process has exited: sets terminal state,
    /// records the exit code, stops monitoring, clears the timeout, and
    /// deregisters the pid from Policy.
    pub fn handle_exit(&self, pid: u32, exit_code: Option<i32>, signaled: bool) {
        let _ = self.components.table.with_process_mut(pid, |proc_| {
            proc_.state = if exit_code == Some(0) && !signaled {
                ProcessState::Stopped
            } else {
                ProcessState::Crashed
            };
            proc_.exit_code = exit_code;
        });
        self.components.monitor.stop_monitoring(pid);
        self.components.timeouts.clear(pid);
        self.components.policy.deregister_pid(pid);
    }
}

fn classify_spawn_error(err: std::io::Error) -> SupervisorError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => SupervisorError::ExecutableNotFound(err.to_string()),
        ErrorKind::PermissionDenied => SupervisorError::PermissionDenied(err.to_string()),
        _ => {
            if let Some(os_err) = err.raw_os_error() {
                match os_err {
                    12 => return SupervisorError::OutOfMemory, // ENOMEM
                    24 => return SupervisorError::OutOfFileDescriptors, // EMFILE
                    _ => {}
                }
            }
            SupervisorError::SpawnFailed(err.to_string())
        }
    }
}

fn spawn_capture_reader<R>(table: Arc<ProcessTable>, pid: u32, handle: Option<R>, is_stdout: bool)
where
    R: Read + Send + 'static,
{
    let Some(mut handle) = handle else { return };
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match handle.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = table.with_process_mut(pid, |proc_| {
                        if is_stdout {
                            proc_.output_buffer.push(&buf[..n]);
                        } else {
                            proc_.error_buffer.push(&buf[..n]);
                        }
                    });
                }
                Err(_) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    fn components() -> Components {
        Components {
            table: Arc::new(ProcessTable::new()),
            policy: Arc::new(
                Policy::new({
                    let mut cfg = SecurityConfig::default();
                    cfg.allowed_executables = vec!["echo".into(), "/bin/echo".into()];
                    cfg
                })
                .unwrap(),
            ),
            monitor: Arc::new(Monitor::new()),
            timeouts: Arc::new(Timeouts::new()),
        }
    }

    #[test]
    fn launch_rejects_non_allowlisted_executable() {
        let spawner = Spawner::new(components());
        let cfg = ProcessConfig {
            executable: "ls".into(),
            ..Default::default()
        };
        let err = spawner.launch(cfg).unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::NotInAllowlist(_) | SupervisorError::ExecutableNotFound(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_succeeds_for_allowlisted_executable() {
        let spawner = Spawner::new(components());
        let cfg = ProcessConfig {
            executable: "echo".into(),
            args: vec!["hi".into()],
            capture_output: true,
            ..Default::default()
        };
        let pid = spawner.launch(cfg).unwrap();
        assert!(pid > 0);
        spawner.components.timeouts.clear(pid);
    }
}
