//! Services: long-running process wrapper with health-check probing and
//! exponential-backoff restart.
//!
//! A named-service registry built around a pid-liveness polling loop with
//! bounded restart attempts, plus an optional health-check probe that can
//! also trigger a restart.

use crate::config::{backoff_ms, HealthCheckConfig, RestartPolicy, ServiceConfig};
use crate::error::{Result, SupervisorError};
use crate::process_table::ProcessState;
use crate::spawner::{Components, Spawner};
use crate::util::iso_now;
use serde::Serialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::task::JoinHandle;

const BACKOFF_CAP_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Crashed,
    Restarting,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub state: ServiceState,
    pub start_time: String,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<String>,
}

struct ManagedService {
    process: crate::config::ProcessConfig,
    health_check: Option<HealthCheckConfig>,
    restart_policy: RestartPolicy,
    pid: Option<u32>,
    state: ServiceState,
    start_epoch_secs: u64,
    restart_count: u32,
    last_health_check: Option<String>,
    watcher: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

pub struct Services {
    components: Components,
    services: Arc<Mutex<HashMap<String, ManagedService>>>,
}

impl Services {
    pub fn new(components: Components) -> Self {
        Services {
            components,
            services: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start_service(self: &Arc<Self>, config: ServiceConfig) -> Result<ServiceStatus> {
        if self.services.lock().unwrap().contains_key(&config.name) {
            return Err(SupervisorError::ServiceExists(config.name));
        }

        let spawner = Spawner::new(self.components.clone());
        let pid = spawner.launch(config.process.clone())?;

        let entry = ManagedService {
            process: config.process.clone(),
            health_check: config.health_check.clone(),
            restart_policy: config.restart_policy,
            pid: Some(pid),
            state: ServiceState::Running,
            start_epoch_secs: crate::util::now_epoch_secs(),
            restart_count: 0,
            last_health_check: None,
            watcher: None,
            health_task: None,
        };
        self.services.lock().unwrap().insert(config.name.clone(), entry);

        if config.restart_policy.enabled {
            let watcher = self.spawn_watcher(config.name.clone());
            if let Some(entry) = self.services.lock().unwrap().get_mut(&config.name) {
                entry.watcher = Some(watcher);
            }
        }
        if let Some(health) = config.health_check.clone() {
            let task = self.spawn_health_probe(config.name.clone(), health);
            if let Some(entry) = self.services.lock().unwrap().get_mut(&config.name) {
                entry.health_task = Some(task);
            }
        }

        self.status(&config.name)
    }

    pub fn stop_service(&self, name: &str) -> Result<()> {
        let mut services = self.services.lock().unwrap();
        let entry = services
            .get_mut(name)
            .ok_or_else(|| SupervisorError::ServiceNotFound(name.to_string()))?;
        if let Some(handle) = entry.watcher.take() {
            handle.abort();
        }
        if let Some(handle) = entry.health_task.take() {
            handle.abort();
        }
        let pid = entry.pid;
        entry.state = ServiceState::Stopped;
        entry.pid = None;
        drop(services);

        if let Some(pid) = pid {
            let terminator = self.components.terminator();
            let table = self.components.table.clone();
            let policy = self.components.policy.clone();
            tokio::spawn(async move {
                let _ = terminator.terminate_gracefully(pid, 5000).await;
                let _ = table;
                let _ = policy;
            });
        }
        self.services.lock().unwrap().remove(name);
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<ServiceStatus> {
        let services = self.services.lock().unwrap();
        let entry = services
            .get(name)
            .ok_or_else(|| SupervisorError::ServiceNotFound(name.to_string()))?;
        Ok(ServiceStatus {
            name: name.to_string(),
            pid: entry.pid,
            state: entry.state,
            start_time: crate::util::epoch_secs_to_iso(entry.start_epoch_secs),
            restart_count: entry.restart_count,
            last_health_check: entry.last_health_check.clone(),
        })
    }

    pub fn list(&self) -> Vec<ServiceStatus> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .map(|(name, entry)| ServiceStatus {
                name: name.clone(),
                pid: entry.pid,
                state: entry.state,
                start_time: crate::util::epoch_secs_to_iso(entry.start_epoch_secs),
                restart_count: entry.restart_count,
                last_health_check: entry.last_health_check.clone(),
            })
            .collect()
    }

    fn spawn_watcher(self: &Arc<Self>, name: String) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let poll = Duration::from_millis(100);
            loop {
                tokio::time::sleep(poll).await;
                let pid = match this.services.lock().unwrap().get(&name) {
                    Some(entry) if entry.state == ServiceState::Running => entry.pid,
                    Some(_) => continue,
                    None => return,
                };
                let Some(pid) = pid else { continue };
                let child_state = this.components.table.get_status(pid).map(|s| s.state);
                let exited = !matches!(child_state, Ok(ProcessState::Running));
                if !exited {
                    continue;
                }
                if !this.handle_crash(&name).await {
                    return;
                }
            }
        })
    }

    /// Returns `false` when the service has reached a terminal outcome and
    /// the watcher loop should stop.
    async fn handle_crash(self: &Arc<Self>, name: &str) -> bool {
        let (policy, restart_count) = {
            let services = self.services.lock().unwrap();
            match services.get(name) {
                Some(entry) => (entry.restart_policy, entry.restart_count),
                None => return false,
            }
        };

        let unlimited = policy.max_retries == 0;
        if !unlimited && restart_count >= policy.max_retries {
            if let Some(entry) = self.services.lock().unwrap().get_mut(name) {
                entry.state = ServiceState::Crashed;
                entry.pid = None;
            }
            return false;
        }

        if let Some(entry) = self.services.lock().unwrap().get_mut(name) {
            entry.state = ServiceState::Restarting;
        }
        let delay = backoff_ms(policy.backoff_ms, restart_count, BACKOFF_CAP_MS);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let process_config = match self.services.lock().unwrap().get(name) {
            Some(entry) => entry.process.clone(),
            None => return false,
        };
        let spawner = Spawner::new(self.components.clone());
        match spawner.launch(process_config) {
            Ok(pid) => {
                if let Some(entry) = self.services.lock().unwrap().get_mut(name) {
                    entry.pid = Some(pid);
                    entry.state = ServiceState::Running;
                    entry.restart_count += 1;
                }
                true
            }
            Err(_) => {
                if let Some(entry) = self.services.lock().unwrap().get_mut(name) {
                    entry.state = ServiceState::Crashed;
                    entry.pid = None;
                }
                false
            }
        }
    }

    fn spawn_health_probe(self: &Arc<Self>, name: String, health: HealthCheckConfig) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(health.interval_ms)).await;
                let still_tracked = this.services.lock().unwrap().contains_key(&name);
                if !still_tracked {
                    return;
                }
                let healthy = run_probe(&health).await;
                if let Some(entry) = this.services.lock().unwrap().get_mut(&name) {
                    entry.last_health_check = Some(iso_now());
                    if healthy {
                        if entry.state == ServiceState::Unhealthy {
                            entry.state = ServiceState::Running;
                        }
                    } else {
                        entry.state = ServiceState::Unhealthy;
                    }
                }
                if !healthy {
                    let should_restart = {
                        let services = this.services.lock().unwrap();
                        services
                            .get(&name)
                            .map(|e| e.restart_policy.enabled)
                            .unwrap_or(false)
                    };
                    if should_restart && !this.handle_crash(&name).await {
                        return;
                    }
                }
            }
        })
    }
}

/// Spawns the configured probe command under a timeout; a non-zero exit or
/// timeout both count as unhealthy.
async fn run_probe(health: &HealthCheckConfig) -> bool {
    let mut command = AsyncCommand::new(&health.command);
    command.args(&health.args);
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::null());

    let Ok(mut child) = command.spawn() else {
        return false;
    };
    let timeout = Duration::from_millis(health.timeout_ms);
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status.success(),
        _ => {
            let _ = child.kill().await;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessConfig, SecurityConfig};
    use crate::monitor::Monitor;
    use crate::policy::Policy;
    use crate::process_table::ProcessTable;
    use crate::timeouts::Timeouts;

    fn services() -> Arc<Services> {
        let mut cfg = SecurityConfig::default();
        cfg.allowed_executables = vec!["sh".into(), "/bin/sh".into()];
        cfg.block_shells = false;
        let components = Components {
            table: Arc::new(ProcessTable::new()),
            policy: Arc::new(Policy::new(cfg).unwrap()),
            monitor: Arc::new(Monitor::new()),
            timeouts: Arc::new(Timeouts::new()),
        };
        Arc::new(Services::new(components))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn duplicate_service_name_rejected() {
        let services = services();
        let cfg = ServiceConfig {
            name: "s".into(),
            process: ProcessConfig {
                executable: "sh".into(),
                args: vec!["-c".into(), "sleep 5".into()],
                ..Default::default()
            },
            health_check: None,
            restart_policy: RestartPolicy::default(),
        };
        services.start_service(cfg.clone()).unwrap();
        let err = services.start_service(cfg).unwrap_err();
        assert_eq!(err.code(), "ServiceExists");
        let _ = services.stop_service("s");
    }
}
