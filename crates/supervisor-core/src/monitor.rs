//! Resource Monitor: per-pid periodic sampling, ring-buffered history, and
//! limit enforcement via the Terminator.

use crate::config::ResourceLimits;
use crate::error::SupervisorError;
use crate::process_table::{ProcessStats, ProcessTable};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};

const HISTORY_CAP: usize = 100;

struct MonitorEntry {
    history: VecDeque<ProcessStats>,
    limits: ResourceLimits,
    active: Arc<AtomicBool>,
}

/// Owns the `sysinfo::System` handle and the per-pid sample history. A
/// single sampler task (spawned by the caller, see `lib.rs`) drives
/// `sample_all` on a 1 s cadence.
pub struct Monitor {
    system: Mutex<System>,
    entries: Mutex<HashMap<u32, MonitorEntry>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Monitor {
            system: Mutex::new(System::new()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Begins tracking `pid` under `limits`. At most one active sampler
    /// exists per running process — a second call replaces the first's
    /// limits rather than creating a duplicate entry.
    pub fn start_monitoring(&self, pid: u32, limits: ResourceLimits) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            pid,
            MonitorEntry {
                history: VecDeque::with_capacity(HISTORY_CAP),
                limits,
                active: Arc::new(AtomicBool::new(true)),
            },
        );
    }

    pub fn stop_monitoring(&self, pid: u32) {
        if let Some(entry) = self.entries.lock().unwrap().get(&pid) {
            entry.active.store(false, Ordering::SeqCst);
        }
        self.entries.lock().unwrap().remove(&pid);
    }

    pub fn get_history(&self, pid: u32) -> Vec<ProcessStats> {
        self.entries
            .lock()
            .unwrap()
            .get(&pid)
            .map(|e| e.history.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, pid: u32) -> Option<ProcessStats> {
        self.entries
            .lock()
            .unwrap()
            .get(&pid)
            .and_then(|e| e.history.back().copied())
    }

    /// Coarse host-level stats plus the count of actively-monitored pids.
    pub fn system_stats(&self) -> SystemStats {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();
        system.refresh_cpu_usage();
        SystemStats {
            cpu_percent: system.global_cpu_usage(),
            total_memory_mb: system.total_memory() as f64 / (1024.0 * 1024.0),
            free_memory_mb: system.free_memory() as f64 / (1024.0 * 1024.0),
            active_monitors: self.entries.lock().unwrap().len(),
        }
    }

    /// Samples every actively-monitored pid once, appends to its ring
    /// buffer, and returns the set of pids whose limits were breached (the
    /// caller is responsible for invoking the Terminator and updating
    /// `ProcessTable`, keeping this module free of cross-component calls).
    pub fn sample_all(&self, table: &ProcessTable) -> Vec<(u32, SupervisorError)> {
        let pids: Vec<u32> = self.entries.lock().unwrap().keys().copied().collect();
        let mut breaches = Vec::new();
        let mut system = self.system.lock().unwrap();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(
            &pids.iter().map(|p| Pid::from_u32(*p)).collect::<Vec<_>>(),
        ), true);

        for pid in pids {
            let Some(process) = system.process(Pid::from_u32(pid)) else {
                // Process gone: stop monitoring without enforcement.
                self.entries.lock().unwrap().remove(&pid);
                continue;
            };
            let uptime_secs = table
                .get_status(pid)
                .map(|s| s.uptime_secs)
                .unwrap_or(0);
            let stats = ProcessStats {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
                thread_count: 1, // open question (a): sysinfo doesn't expose thread count portably.
                io_bytes_read: process.disk_usage().total_read_bytes,
                io_bytes_written: process.disk_usage().total_written_bytes,
                uptime_secs,
            };

            let mut entries = self.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&pid) else {
                continue;
            };
            entry.history.push_back(stats);
            while entry.history.len() > HISTORY_CAP {
                entry.history.pop_front();
            }

            let breach = if let Some(max_cpu) = entry.limits.max_cpu_percent {
                (stats.cpu_percent > max_cpu).then_some(SupervisorError::CpuLimitExceeded)
            } else {
                None
            }
            .or_else(|| {
                entry
                    .limits
                    .max_memory_mb
                    .filter(|max| stats.memory_mb > *max)
                    .map(|_| SupervisorError::MemoryLimitExceeded)
            })
            .or_else(|| {
                entry
                    .limits
                    .max_cpu_seconds
                    .filter(|max| stats.uptime_secs > *max)
                    .map(|_| SupervisorError::CpuTimeLimitExceeded)
            });

            if let Some(err) = breach {
                entry.active.store(false, Ordering::SeqCst);
                drop(entries);
                self.entries.lock().unwrap().remove(&pid);
                breaches.push((pid, err));
            }
        }
        breaches
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub total_memory_mb: f64,
    pub free_memory_mb: f64,
    pub active_monitors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_stop_monitoring_clears_entry() {
        let monitor = Monitor::new();
        monitor.start_monitoring(1, ResourceLimits::default());
        assert!(monitor.latest(1).is_none());
        monitor.stop_monitoring(1);
        assert!(monitor.get_history(1).is_empty());
    }

    #[test]
    fn system_stats_reports_active_monitor_count() {
        let monitor = Monitor::new();
        monitor.start_monitoring(1, ResourceLimits::default());
        monitor.start_monitoring(2, ResourceLimits::default());
        assert_eq!(monitor.system_stats().active_monitors, 2);
    }
}
