//! Terminator: graceful-then-forced escalation and group fan-out.
//!
//! Delivers signals directly via `nix::sys::signal` on Unix rather than
//! spawning a `kill(1)` subprocess, with a `taskkill`-based fallback on
//! Windows.

use crate::error::{Result, SupervisorError};
use crate::policy::Policy;
use crate::process_table::{exit_status_parts, ProcessState, ProcessTable};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    Graceful,
    Timeout,
    Forced,
    AlreadyTerminal,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminationResult {
    pub pid: u32,
    pub success: bool,
    pub reason: TerminationReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[cfg(unix)]
fn send_signal(pid: u32, sig: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), sig).map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

#[derive(Clone)]
pub struct Terminator {
    table: Arc<ProcessTable>,
    policy: Arc<Policy>,
}

impl Terminator {
    pub fn new(table: Arc<ProcessTable>, policy: Arc<Policy>) -> Self {
        Terminator { table, policy }
    }

    #[cfg(unix)]
    fn send_term(&self, pid: u32) -> std::io::Result<()> {
        send_signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(unix)]
    fn send_kill(&self, pid: u32) -> std::io::Result<()> {
        send_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(windows)]
    fn send_term(&self, pid: u32) -> std::io::Result<()> {
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T"])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other("taskkill failed"))
        }
    }

    #[cfg(windows)]
    fn send_kill(&self, pid: u32) -> std::io::Result<()> {
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other("taskkill /F failed"))
        }
    }

    /// Fire-and-forget SIGTERM used by the Monitor's breach enforcement
    /// path, which does not itself own a `Policy`/`ProcessTable` reference.
    pub fn terminate_forcefully_signal_only(&self, pid: u32) -> std::io::Result<()> {
        self.send_term(pid)
    }

    /// Records the real outcome of a wait on `pid`'s stored `Child`
    /// (`Some` once the OS has reaped it, `None` if the poll loop timed out
    /// without ever observing an exit) as the process's terminal state.
    fn finalize_terminal_state(&self, pid: u32, reaped: Option<std::process::ExitStatus>) -> Option<i32> {
        let (exit_code, signaled) = match reaped {
            Some(status) => exit_status_parts(status),
            None => (None, true),
        };
        let _ = self.table.with_process_mut(pid, |proc_| {
            if !proc_.state.is_terminal() {
                proc_.state = if exit_code == Some(0) && !signaled {
                    ProcessState::Stopped
                } else {
                    ProcessState::Crashed
                };
                proc_.exit_code = exit_code;
            }
        });
        self.policy.deregister_pid(pid);
        exit_code
    }

    pub async fn terminate_gracefully(&self, pid: u32, timeout_ms: u64) -> Result<TerminationResult> {
        self.policy.validate_signal_target(pid)?;
        let timeout_ms = if timeout_ms == 0 { 5000 } else { timeout_ms };

        let already_terminal = self
            .table
            .get_status(pid)
            .map(|s| s.state.is_terminal())
            .unwrap_or(true);
        if already_terminal {
            let exit_code = self.table.get_status(pid).ok().and_then(|s| s.exit_code);
            return Ok(TerminationResult {
                pid,
                success: true,
                reason: TerminationReason::AlreadyTerminal,
                exit_code,
            });
        }

        self.send_term(pid)
            .map_err(|e| SupervisorError::TerminationFailed(pid, e.to_string()))?;

        let deadline = Duration::from_millis(timeout_ms);
        let poll = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < deadline {
            if let Some(status) = self.table.try_wait(pid) {
                let exit_code = self.finalize_terminal_state(pid, Some(status));
                return Ok(TerminationResult {
                    pid,
                    success: true,
                    reason: TerminationReason::Graceful,
                    exit_code,
                });
            }
            sleep(poll).await;
            waited += poll;
        }

        self.send_kill(pid)
            .map_err(|e| SupervisorError::TerminationFailed(pid, e.to_string()))?;
        let forced_deadline = Duration::from_millis(1000);
        let mut forced_waited = Duration::ZERO;
        let mut reaped = None;
        while forced_waited < forced_deadline {
            if let Some(status) = self.table.try_wait(pid) {
                reaped = Some(status);
                break;
            }
            sleep(poll).await;
            forced_waited += poll;
        }
        let success = reaped.is_some();
        let exit_code = self.finalize_terminal_state(pid, reaped);
        Ok(TerminationResult {
            pid,
            success,
            reason: TerminationReason::Timeout,
            exit_code,
        })
    }

    pub async fn terminate_forcefully(&self, pid: u32) -> Result<TerminationResult> {
        self.policy.validate_signal_target(pid)?;
        let already_terminal = self
            .table
            .get_status(pid)
            .map(|s| s.state.is_terminal())
            .unwrap_or(true);
        if already_terminal {
            let exit_code = self.table.get_status(pid).ok().and_then(|s| s.exit_code);
            return Ok(TerminationResult {
                pid,
                success: true,
                reason: TerminationReason::AlreadyTerminal,
                exit_code,
            });
        }
        self.send_kill(pid)
            .map_err(|e| SupervisorError::TerminationFailed(pid, e.to_string()))?;
        let deadline = Duration::from_millis(1000);
        let poll = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        let mut reaped = None;
        while waited < deadline {
            if let Some(status) = self.table.try_wait(pid) {
                reaped = Some(status);
                break;
            }
            sleep(poll).await;
            waited += poll;
        }
        let success = reaped.is_some();
        let exit_code = self.finalize_terminal_state(pid, reaped);
        Ok(TerminationResult {
            pid,
            success,
            reason: TerminationReason::Forced,
            exit_code,
        })
    }

    /// Terminates every pid concurrently; per-pid failure does not abort
    /// its peers.
    pub async fn terminate_group(
        &self,
        pids: &[u32],
        force: bool,
        timeout_ms: u64,
    ) -> Vec<TerminationResult> {
        let futures = pids.iter().map(|&pid| async move {
            let result = if force {
                self.terminate_forcefully(pid).await
            } else {
                self.terminate_gracefully(pid, timeout_ms).await
            };
            result.unwrap_or(TerminationResult {
                pid,
                success: false,
                reason: TerminationReason::Forced,
                exit_code: None,
            })
        });
        futures_join_all(futures).await
    }

    pub async fn terminate_group_by_id(
        &self,
        group_id: &str,
        force: bool,
        timeout_ms: u64,
    ) -> Result<Vec<TerminationResult>> {
        let pids = self.table.group_pids(group_id)?;
        Ok(self.terminate_group(&pids, force, timeout_ms).await)
    }
}

/// Small local join-all to avoid pulling in `futures` for one call site;
/// `tokio`'s own join set is overkill for a bounded, caller-sized fan-out.
async fn futures_join_all<F, T>(futs: impl IntoIterator<Item = F>) -> Vec<T>
where
    F: std::future::Future<Output = T>,
{
    let mut handles = Vec::new();
    for fut in futs {
        handles.push(fut);
    }
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::io::RingBuffer;
    use crate::process_table::{ManagedProcess, ProcessStats};
    use crate::util::now_epoch_secs;

    fn setup() -> (Arc<ProcessTable>, Arc<Policy>) {
        let table = Arc::new(ProcessTable::new());
        let mut cfg = SecurityConfig::default();
        cfg.allowed_executables = vec!["node".into()];
        let policy = Arc::new(Policy::new(cfg).unwrap());
        (table, policy)
    }

    #[tokio::test]
    async fn terminate_signal_to_unmanaged_pid_fails() {
        let (table, policy) = setup();
        let terminator = Terminator::new(table, policy);
        let err = terminator.terminate_gracefully(999_999, 100).await.unwrap_err();
        assert_eq!(err.code(), "SignalToUnmanaged");
    }

    #[tokio::test]
    async fn terminate_already_terminal_short_circuits() {
        let (table, policy) = setup();
        policy.register_pid(5);
        table.register(ManagedProcess {
            pid: 5,
            command: "node".into(),
            args: vec![],
            state: ProcessState::Stopped,
            start_epoch_secs: now_epoch_secs(),
            exit_code: Some(0),
            stats: ProcessStats::default(),
            output_buffer: RingBuffer::new(1024),
            error_buffer: RingBuffer::new(1024),
            group_id: None,
            child: None,
        });
        let terminator = Terminator::new(table, policy);
        let result = terminator.terminate_gracefully(5, 100).await.unwrap();
        assert_eq!(result.reason, TerminationReason::AlreadyTerminal);
        assert!(result.success);
    }
}
