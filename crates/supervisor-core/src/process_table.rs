//! ProcessTable: the sole canonical pid → ManagedProcess registry, plus
//! group membership and the zombie-reap sweep.

use crate::error::{Result, SupervisorError};
use crate::io::RingBuffer;
use crate::util::{iso_now, now_epoch_secs};
use serde::Serialize;
use std::collections::BTreeMap;
use std::process::Child;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    Stopped,
    Crashed,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ProcessStats {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub thread_count: u32,
    pub io_bytes_read: u64,
    pub io_bytes_written: u64,
    pub uptime_secs: u64,
}

/// Registry entry. The `Child` handle (when present) is owned here so
/// stdin writes, waits, and signal delivery all go through one place.
pub struct ManagedProcess {
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub state: ProcessState,
    pub start_epoch_secs: u64,
    pub exit_code: Option<i32>,
    pub stats: ProcessStats,
    pub output_buffer: RingBuffer,
    pub error_buffer: RingBuffer,
    pub group_id: Option<String>,
    pub child: Option<Child>,
}

impl ManagedProcess {
    pub fn uptime_secs(&self) -> u64 {
        now_epoch_secs().saturating_sub(self.start_epoch_secs)
    }
}

/// Read-only snapshot returned to Dispatcher callers (never exposes the
/// `Child` handle).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub state: ProcessState,
    pub uptime_secs: u64,
    pub start_time: String,
    pub stats: ProcessStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

pub struct ProcessGroup {
    pub id: String,
    pub name: String,
    pub processes: Vec<u32>,
    pub pipeline: bool,
    pub edges: Vec<(u32, u32, bool)>,
}

struct Inner {
    processes: BTreeMap<u32, ManagedProcess>,
    groups: BTreeMap<String, ProcessGroup>,
    next_group_seq: u64,
}

/// Canonical registry. All mutation happens behind a single mutex so a
/// caller observing process state never sees a partial update.
pub struct ProcessTable {
    inner: Mutex<Inner>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            inner: Mutex::new(Inner {
                processes: BTreeMap::new(),
                groups: BTreeMap::new(),
                next_group_seq: 0,
            }),
        }
    }

    pub fn register(&self, process: ManagedProcess) {
        self.inner.lock().unwrap().processes.insert(process.pid, process);
    }

    /// Removes a pid from every group it belongs to and drops the child
    /// handle. Terminal-state snapshots remain queryable until overwritten.
    pub fn unregister(&self, pid: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(proc_) = inner.processes.get_mut(&pid) {
            proc_.child = None;
        }
        for group in inner.groups.values_mut() {
            group.processes.retain(|p| *p != pid);
            group.edges.retain(|(src, dst, _)| *src != pid && *dst != pid);
        }
    }

    pub fn with_process_mut<F, T>(&self, pid: u32, f: F) -> Result<T>
    where
        F: FnOnce(&mut ManagedProcess) -> T,
    {
        let mut inner = self.inner.lock().unwrap();
        let proc_ = inner
            .processes
            .get_mut(&pid)
            .ok_or(SupervisorError::ProcessNotFound(pid))?;
        Ok(f(proc_))
    }

    pub fn get_status(&self, pid: u32) -> Result<ProcessStatus> {
        let inner = self.inner.lock().unwrap();
        let proc_ = inner
            .processes
            .get(&pid)
            .ok_or(SupervisorError::ProcessNotFound(pid))?;
        Ok(ProcessStatus {
            pid: proc_.pid,
            command: proc_.command.clone(),
            args: proc_.args.clone(),
            state: proc_.state,
            uptime_secs: proc_.uptime_secs(),
            start_time: iso_now_from(proc_.start_epoch_secs),
            stats: proc_.stats,
            exit_code: if proc_.state.is_terminal() {
                proc_.exit_code
            } else {
                None
            },
        })
    }

    pub fn get_all(&self) -> Vec<ProcessStatus> {
        let inner = self.inner.lock().unwrap();
        inner
            .processes
            .values()
            .map(|proc_| ProcessStatus {
                pid: proc_.pid,
                command: proc_.command.clone(),
                args: proc_.args.clone(),
                state: proc_.state,
                uptime_secs: proc_.uptime_secs(),
                start_time: iso_now_from(proc_.start_epoch_secs),
                stats: proc_.stats,
                exit_code: if proc_.state.is_terminal() {
                    proc_.exit_code
                } else {
                    None
                },
            })
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .processes
            .values()
            .filter(|p| p.state == ProcessState::Running)
            .count()
    }

    pub fn all_pids(&self) -> Vec<u32> {
        self.inner.lock().unwrap().processes.keys().copied().collect()
    }

    pub fn running_pids(&self) -> Vec<u32> {
        self.inner
            .lock()
            .unwrap()
            .processes
            .values()
            .filter(|p| p.state == ProcessState::Running)
            .map(|p| p.pid)
            .collect()
    }

    /// Polls every tracked pid's stored `Child` handle without blocking.
    /// Pids the OS has actually reaped are returned with their exit status
    /// so the caller can finalize real state instead of guessing; a pid
    /// whose child hasn't exited yet is left alone.
    /// Runs on a 5 s cadence from the supervisor's background task set.
    pub fn reap_sweep(&self) -> Vec<(u32, std::process::ExitStatus)> {
        let pids = self.running_pids();
        pids.into_iter()
            .filter_map(|pid| self.try_wait(pid).map(|status| (pid, status)))
            .collect()
    }

    /// Polls the stored child for `pid` without blocking. Returns
    /// `Some(status)` once the OS has reaped it; `None` if it is still
    /// running or no child handle is held for it.
    pub fn try_wait(&self, pid: u32) -> Option<std::process::ExitStatus> {
        let mut inner = self.inner.lock().unwrap();
        let proc_ = inner.processes.get_mut(&pid)?;
        proc_.child.as_mut()?.try_wait().ok().flatten()
    }

    // --- Groups -----------------------------------------------------

    pub fn create_group(&self, name: &str, pipeline: bool) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_group_seq += 1;
        let id = format!("grp-{}", inner.next_group_seq);
        inner.groups.insert(
            id.clone(),
            ProcessGroup {
                id: id.clone(),
                name: name.to_string(),
                processes: Vec::new(),
                pipeline,
                edges: Vec::new(),
            },
        );
        id
    }

    pub fn add_to_group(&self, group_id: &str, pid: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.processes.contains_key(&pid) {
            return Err(SupervisorError::ProcessNotFound(pid));
        }
        for group in inner.groups.values() {
            if group.processes.contains(&pid) {
                return Err(SupervisorError::SecurityViolation(format!(
                    "pid {pid} already belongs to group `{}`",
                    group.id
                )));
            }
        }
        let is_pipeline = {
            let group = inner
                .groups
                .get_mut(group_id)
                .ok_or_else(|| SupervisorError::GroupNotFound(group_id.to_string()))?;
            let prior_tail = group.processes.last().copied();
            group.processes.push(pid);
            if group.pipeline {
                if let Some(src) = prior_tail {
                    group.edges.push((src, pid, false));
                }
            }
            group.pipeline
        };
        let _ = is_pipeline;
        Ok(())
    }

    pub fn group_pids(&self, group_id: &str) -> Result<Vec<u32>> {
        let inner = self.inner.lock().unwrap();
        inner
            .groups
            .get(group_id)
            .map(|g| g.processes.clone())
            .ok_or_else(|| SupervisorError::GroupNotFound(group_id.to_string()))
    }

    pub fn mark_edge_connected(&self, group_id: &str, src: u32, dst: u32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(group) = inner.groups.get_mut(group_id) {
            for edge in group.edges.iter_mut() {
                if edge.0 == src && edge.1 == dst {
                    edge.2 = true;
                }
            }
        }
    }
}

fn iso_now_from(epoch_secs: u64) -> String {
    crate::util::epoch_secs_to_iso(epoch_secs)
}

/// Splits an `ExitStatus` into `(exit_code, signaled)`. On Unix, a process
/// killed by a signal reports no exit code from the OS; this maps that to
/// the conventional `128 + signal` shell code so the caller never has to
/// treat a signal death as a missing exit code.
#[cfg(unix)]
pub fn exit_status_parts(status: std::process::ExitStatus) -> (Option<i32>, bool) {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => (Some(code), false),
        None => (status.signal().map(|sig| 128 + sig), true),
    }
}

#[cfg(not(unix))]
pub fn exit_status_parts(status: std::process::ExitStatus) -> (Option<i32>, bool) {
    (status.code(), !status.success())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: u32) -> ManagedProcess {
        ManagedProcess {
            pid,
            command: "node".into(),
            args: vec![],
            state: ProcessState::Running,
            start_epoch_secs: now_epoch_secs(),
            exit_code: None,
            stats: ProcessStats::default(),
            output_buffer: RingBuffer::new(10 * 1024 * 1024),
            error_buffer: RingBuffer::new(10 * 1024 * 1024),
            group_id: None,
            child: None,
        }
    }

    #[test]
    fn register_then_get_status_round_trips() {
        let table = ProcessTable::new();
        table.register(sample(100));
        let status = table.get_status(100).unwrap();
        assert_eq!(status.pid, 100);
        assert_eq!(status.state, ProcessState::Running);
        assert!(status.exit_code.is_none());
    }

    #[test]
    fn exit_code_present_only_in_terminal_state() {
        let table = ProcessTable::new();
        table.register(sample(101));
        table
            .with_process_mut(101, |p| {
                p.state = ProcessState::Stopped;
                p.exit_code = Some(0);
            })
            .unwrap();
        let status = table.get_status(101).unwrap();
        assert_eq!(status.exit_code, Some(0));
    }

    #[test]
    fn get_all_returns_every_registered_process() {
        let table = ProcessTable::new();
        table.register(sample(1));
        table.register(sample(2));
        let all = table.get_all();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn group_membership_is_exclusive() {
        let table = ProcessTable::new();
        table.register(sample(1));
        let g1 = table.create_group("g1", false);
        let g2 = table.create_group("g2", false);
        table.add_to_group(&g1, 1).unwrap();
        assert!(table.add_to_group(&g2, 1).is_err());
    }

    #[test]
    fn unregister_clears_group_membership() {
        let table = ProcessTable::new();
        table.register(sample(1));
        let g1 = table.create_group("g1", false);
        table.add_to_group(&g1, 1).unwrap();
        table.unregister(1);
        assert_eq!(table.group_pids(&g1).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn running_count_ignores_terminal_processes() {
        let table = ProcessTable::new();
        table.register(sample(1));
        table.register(sample(2));
        table.with_process_mut(2, |p| p.state = ProcessState::Stopped).unwrap();
        assert_eq!(table.running_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn reap_sweep_collects_real_exit_status_without_leaving_a_zombie() {
        use std::process::Command;
        use std::thread::sleep;
        use std::time::Duration;

        let table = ProcessTable::new();
        let child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        let mut proc_ = sample(pid);
        proc_.child = Some(child);
        table.register(proc_);

        // Give the child a moment to exit before the sweep polls it.
        sleep(Duration::from_millis(50));

        let reaped = table.reap_sweep();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].0, pid);
        let (exit_code, signaled) = exit_status_parts(reaped[0].1);
        assert_eq!(exit_code, Some(0));
        assert!(!signaled);

        // The child has now actually been waited on; a second sweep finds
        // nothing left to reap instead of seeing a zombie that "still exists".
        assert!(table.reap_sweep().is_empty());
    }
}
