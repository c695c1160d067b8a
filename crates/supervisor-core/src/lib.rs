// SPDX-License-Identifier: Apache-2.0

//! Sandboxed process supervisor core: security policy, process lifecycle
//! engine, resource monitor, and group/service management, reachable
//! through [`SupervisorState`]. The JSON-RPC transport and tool-call
//! dispatch that expose this over stdio live in the `supervisor-cli` crate.

pub mod config;
pub mod error;
pub mod io;
pub mod monitor;
pub mod policy;
pub mod process_table;
pub mod services;
pub mod spawner;
pub mod terminator;
pub mod timeouts;
pub mod util;

use config::{ProcessConfig, SecurityConfig, ServiceConfig};
use error::{Result, SupervisorError};
use io::{CapturedOutput, IoManager};
use monitor::SystemStats;
use policy::Policy;
use process_table::{ProcessStats, ProcessStatus, ProcessTable};
use serde::Serialize;
use services::{ServiceStatus, Services};
use spawner::{Components, Spawner};
use std::sync::Arc;
use terminator::{TerminationResult, Terminator};
use timeouts::Timeouts;

/// Returns crate version for runtime diagnostics/tests.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GroupTerminationSummary {
    pub total: usize,
    pub succeeded: usize,
}

/// Owns every core component behind `Arc`s so background tasks (monitor
/// sampler, zombie reaper, service watchers) can hold their own clones
/// without borrowing the whole struct, while `SupervisorState` remains the
/// single entry point the Dispatcher calls into.
pub struct SupervisorState {
    table: Arc<ProcessTable>,
    policy: Arc<Policy>,
    monitor: Arc<monitor::Monitor>,
    timeouts: Arc<Timeouts>,
    services: Arc<Services>,
}

impl SupervisorState {
    pub fn new(config: SecurityConfig) -> Result<Arc<Self>> {
        let table = Arc::new(ProcessTable::new());
        let policy = Arc::new(Policy::new(config)?);
        let monitor = Arc::new(monitor::Monitor::new());
        let timeouts = Arc::new(Timeouts::new());
        let components = Components {
            table: table.clone(),
            policy: policy.clone(),
            monitor: monitor.clone(),
            timeouts: timeouts.clone(),
        };
        let services = Arc::new(Services::new(components));
        Ok(Arc::new(SupervisorState {
            table,
            policy,
            monitor,
            timeouts,
            services,
        }))
    }

    fn components(&self) -> Components {
        Components {
            table: self.table.clone(),
            policy: self.policy.clone(),
            monitor: self.monitor.clone(),
            timeouts: self.timeouts.clone(),
        }
    }

    fn terminator(&self) -> Terminator {
        Terminator::new(self.table.clone(), self.policy.clone())
    }

    pub fn config(&self) -> &SecurityConfig {
        self.policy.config()
    }

    pub fn process_start(&self, config: ProcessConfig) -> Result<u32> {
        let spawner = Spawner::new(self.components());
        spawner.launch(config)
    }

    pub async fn process_terminate(
        &self,
        pid: u32,
        force: bool,
        timeout_ms: u64,
    ) -> Result<TerminationResult> {
        let terminator = self.terminator();
        if force {
            terminator.terminate_forcefully(pid).await
        } else {
            terminator.terminate_gracefully(pid, timeout_ms).await
        }
    }

    pub fn process_get_stats(&self, pid: u32) -> Result<ProcessStats> {
        self.monitor
            .latest(pid)
            .or_else(|| self.table.get_status(pid).ok().map(|s| s.stats))
            .ok_or(SupervisorError::ProcessNotFound(pid))
    }

    pub fn process_send_stdin(&self, pid: u32, data: &[u8]) -> Result<usize> {
        if !self.policy.config().allow_stdin {
            return Err(SupervisorError::PermissionDenied(
                "stdin is disabled by policy".to_string(),
            ));
        }
        IoManager::new(&self.table).write_stdin(pid, data)
    }

    pub fn process_close_stdin(&self, pid: u32) -> Result<()> {
        IoManager::new(&self.table).close_stdin(pid)
    }

    pub fn process_get_output(&self, pid: u32) -> Result<CapturedOutput> {
        IoManager::new(&self.table).get_output(pid)
    }

    pub fn process_clear_buffers(&self, pid: u32) -> Result<()> {
        IoManager::new(&self.table).clear_buffers(pid)
    }

    pub fn process_list(&self) -> Vec<ProcessStatus> {
        self.table.get_all()
    }

    pub fn process_get_status(&self, pid: u32) -> Result<ProcessStatus> {
        self.table.get_status(pid)
    }

    pub fn process_create_group(&self, name: &str, pipeline: bool) -> String {
        self.table.create_group(name, pipeline)
    }

    pub fn process_add_to_group(&self, group_id: &str, pid: u32) -> Result<()> {
        self.table.add_to_group(group_id, pid)
    }

    pub async fn process_terminate_group(
        &self,
        group_id: &str,
        force: bool,
        timeout_ms: u64,
    ) -> Result<(Vec<TerminationResult>, GroupTerminationSummary)> {
        let terminator = self.terminator();
        let results = terminator
            .terminate_group_by_id(group_id, force, timeout_ms)
            .await?;
        let summary = GroupTerminationSummary {
            total: results.len(),
            succeeded: results.iter().filter(|r| r.success).count(),
        };
        Ok((results, summary))
    }

    pub fn process_start_service(self: &Arc<Self>, config: ServiceConfig) -> Result<ServiceStatus> {
        self.services.start_service(config)
    }

    pub fn process_stop_service(&self, name: &str) -> Result<()> {
        self.services.stop_service(name)
    }

    pub fn service_status(&self, name: &str) -> Result<ServiceStatus> {
        self.services.status(name)
    }

    pub fn service_list(&self) -> Vec<ServiceStatus> {
        self.services.list()
    }

    pub fn system_stats(&self) -> SystemStats {
        self.monitor.system_stats()
    }

    pub fn set_audit_sink<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.policy.set_audit_sink(sink);
    }

    /// Runs one Monitor sample pass, sending `SIGTERM` through the
    /// Terminator to any pid that breached its resource limits, and
    /// finalizing its `ProcessTable` state.
    pub async fn run_monitor_tick(&self) {
        let breaches = self.monitor.sample_all(&self.table);
        for (pid, _err) in breaches {
            let terminator = self.terminator();
            let _ = terminator.terminate_forcefully_signal_only(pid);
        }
    }

    /// Runs one zombie-reap sweep: every pid the OS has actually exited is
    /// finalized with its real exit status (`stopped` on a clean `0` exit,
    /// `crashed` otherwise) via `Spawner::handle_exit`. Tied to the
    /// supervisor's 5 s cadence.
    pub fn run_reap_sweep(&self) {
        let spawner = Spawner::new(self.components());
        for (pid, status) in self.table.reap_sweep() {
            let (exit_code, signaled) = process_table::exit_status_parts(status);
            spawner.handle_exit(pid, exit_code, signaled);
        }
    }

    /// Spawns the background task set (1 s monitor sampler, 5 s zombie
    /// reaper) and returns their handles so the caller can abort them at
    /// shutdown.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let monitor_state = self.clone();
        let monitor_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                interval.tick().await;
                monitor_state.run_monitor_tick().await;
            }
        });

        let reaper_state = self.clone();
        let reaper_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                reaper_state.run_reap_sweep();
            }
        });

        vec![monitor_task, reaper_task]
    }

    /// Shutdown: cancels every timeout, then force-terminates every live
    /// managed pid.
    pub async fn shutdown(&self) {
        self.timeouts.clear_all();
        let terminator = self.terminator();
        let pids = self.table.running_pids();
        let _ = terminator.terminate_group(&pids, true, 1000).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<SupervisorState> {
        let mut cfg = SecurityConfig::default();
        cfg.allowed_executables = vec!["echo".into(), "/bin/echo".into()];
        SupervisorState::new(cfg).unwrap()
    }

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn process_list_starts_empty() {
        let state = state();
        assert!(state.process_list().is_empty());
    }

    #[test]
    fn unmanaged_pid_status_not_found() {
        let state = state();
        let err = state.process_get_status(123_456).unwrap_err();
        assert_eq!(err.code(), "ProcessNotFound");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launch_then_terminate_round_trips() {
        let state = state();
        let pid = state
            .process_start(ProcessConfig {
                executable: "echo".into(),
                args: vec!["hi".into()],
                capture_output: true,
                ..Default::default()
            })
            .unwrap();
        let result = state.process_terminate(pid, true, 1000).await.unwrap();
        assert!(result.success || result.reason == terminator::TerminationReason::AlreadyTerminal);
    }

    #[test]
    fn empty_allowlist_construction_fails() {
        let cfg = SecurityConfig::default();
        assert!(SupervisorState::new(cfg).is_err());
    }
}
