//! Timeouts: per-pid deadlines with extend/clear semantics, backed by
//! `tokio::time`. A registry of single-shot timers, generation-counter
//! guarded so an `extend` invalidates any timer already in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

const DEFAULT_TIMEOUT_MS: u64 = 300_000;

struct Entry {
    start: Instant,
    duration_ms: AtomicU64,
    triggered: Arc<std::sync::atomic::AtomicBool>,
    handle: JoinHandle<()>,
    generation: Arc<AtomicU64>,
}

/// Registry of single-shot, extendable timeouts. At most one active
/// timeout exists per pid.
#[derive(Default)]
pub struct Timeouts {
    entries: Mutex<HashMap<u32, Entry>>,
}

impl Timeouts {
    pub fn new() -> Self {
        Timeouts {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a timeout for `pid`; `0` means the supervisor default of
    /// five minutes. `on_timeout` fires at most once, only if the timer is
    /// not cleared or superseded first.
    pub fn register<F>(&self, pid: u32, duration_ms: u64, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let duration_ms = if duration_ms == 0 {
            DEFAULT_TIMEOUT_MS
        } else {
            duration_ms
        };
        self.clear(pid);
        let triggered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let generation = Arc::new(AtomicU64::new(0));
        let handle = spawn_timer(duration_ms, triggered.clone(), generation.clone(), 0, on_timeout);
        self.entries.lock().unwrap().insert(
            pid,
            Entry {
                start: Instant::now(),
                duration_ms: AtomicU64::new(duration_ms),
                triggered,
                handle,
                generation,
            },
        );
    }

    /// Cancels the current timer and reschedules with `remaining + add_ms`.
    /// Fails silently (no-op) if the pid is unknown or already fired —
    /// callers that need the failure signal should check `has_exceeded`
    /// first: this fails if the pid is unknown or the timer already fired.
    pub fn extend<F>(&self, pid: u32, add_ms: u64, on_timeout: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&pid) else {
            return false;
        };
        if entry.triggered.load(Ordering::SeqCst) {
            return false;
        }
        let elapsed_ms = entry.start.elapsed().as_millis() as u64;
        let remaining = entry
            .duration_ms
            .load(Ordering::SeqCst)
            .saturating_sub(elapsed_ms);
        let new_duration = remaining.saturating_add(add_ms);
        entry.handle.abort();
        let next_gen = entry.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let triggered = entry.triggered.clone();
        let generation = entry.generation.clone();
        entry.start = Instant::now();
        entry.duration_ms.store(new_duration, Ordering::SeqCst);
        entry.handle = spawn_timer(new_duration, triggered, generation, next_gen, on_timeout);
        true
    }

    /// Idempotent cancellation.
    pub fn clear(&self, pid: u32) {
        if let Some(entry) = self.entries.lock().unwrap().remove(&pid) {
            entry.handle.abort();
        }
    }

    pub fn remaining_ms(&self, pid: u32) -> Option<u64> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&pid)?;
        if entry.triggered.load(Ordering::SeqCst) {
            return Some(0);
        }
        let elapsed = entry.start.elapsed().as_millis() as u64;
        Some(entry.duration_ms.load(Ordering::SeqCst).saturating_sub(elapsed))
    }

    pub fn has_exceeded(&self, pid: u32) -> bool {
        match self.remaining_ms(pid) {
            Some(0) => true,
            Some(_) => false,
            None => false,
        }
    }

    /// Tears down every registered timer; used at shutdown.
    pub fn clear_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }
}

fn spawn_timer<F>(
    duration_ms: u64,
    triggered: Arc<std::sync::atomic::AtomicBool>,
    generation: Arc<AtomicU64>,
    expected_generation: u64,
    on_timeout: F,
) -> JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(duration_ms)).await;
        if generation.load(Ordering::SeqCst) != expected_generation {
            return;
        }
        triggered.store(true, Ordering::SeqCst);
        on_timeout();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn timer_fires_after_duration() {
        let timeouts = Timeouts::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timeouts.register(1, 30, move || fired2.store(true, Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(fired.load(Ordering::SeqCst));
        assert!(timeouts.has_exceeded(1));
    }

    #[tokio::test]
    async fn clearing_before_fire_prevents_callback() {
        let timeouts = Timeouts::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timeouts.register(1, 40, move || fired2.store(true, Ordering::SeqCst));
        timeouts.clear(1);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn extend_delays_firing() {
        let timeouts = Timeouts::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timeouts.register(1, 30, move || fired2.store(true, Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let fired3 = fired.clone();
        assert!(timeouts.extend(1, 60, move || fired3.store(true, Ordering::SeqCst)));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!fired.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn remaining_time_unknown_for_unregistered_pid() {
        let timeouts = Timeouts::new();
        assert_eq!(timeouts.remaining_ms(404), None);
        assert!(!timeouts.has_exceeded(404));
    }
}
