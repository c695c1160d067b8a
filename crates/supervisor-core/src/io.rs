//! Bounded capture buffers and stdin plumbing.

use crate::error::{Result, SupervisorError};
use crate::process_table::ProcessTable;
use std::collections::VecDeque;
use std::io::Write;

/// Byte queue capped at `cap_bytes`; pushing past the cap evicts the
/// oldest chunks first, never truncates the newest write.
pub struct RingBuffer {
    chunks: VecDeque<Vec<u8>>,
    total_len: usize,
    cap_bytes: usize,
    total_written: u64,
}

impl RingBuffer {
    pub fn new(cap_bytes: usize) -> Self {
        RingBuffer {
            chunks: VecDeque::new(),
            total_len: 0,
            cap_bytes,
            total_written: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.total_written += data.len() as u64;
        self.chunks.push_back(data.to_vec());
        self.total_len += data.len();
        while self.total_len > self.cap_bytes {
            if let Some(front) = self.chunks.pop_front() {
                self.total_len -= front.len();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn byte_count(&self) -> usize {
        self.total_len
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.total_len = 0;
    }
}

/// Materialized output for `processGetOutput`.
pub struct CapturedOutput {
    pub stdout_text: String,
    pub stdout_bytes: usize,
    pub stderr_text: String,
    pub stderr_bytes: usize,
}

/// Stdin write / close / output retrieval, operating on the `ProcessTable`'s
/// owned `Child` handles. Capture append happens on the reader threads the
/// Spawner installs (see `spawner.rs`); this module is the read/write edge.
pub struct IoManager<'a> {
    table: &'a ProcessTable,
}

impl<'a> IoManager<'a> {
    pub fn new(table: &'a ProcessTable) -> Self {
        IoManager { table }
    }

    pub fn write_stdin(&self, pid: u32, data: &[u8]) -> Result<usize> {
        self.table.with_process_mut(pid, |proc_| {
            let child = proc_
                .child
                .as_mut()
                .ok_or(SupervisorError::StdinNotAvailable(pid))?;
            let stdin = child
                .stdin
                .as_mut()
                .ok_or(SupervisorError::StdinNotAvailable(pid))?;
            stdin
                .write_all(data)
                .map_err(|e| SupervisorError::StdinWriteFailed(e.to_string()))?;
            stdin
                .flush()
                .map_err(|e| SupervisorError::StdinWriteFailed(e.to_string()))?;
            Ok(data.len())
        })?
    }

    /// Idempotent: closing an already-closed stream is a silent no-op.
    pub fn close_stdin(&self, pid: u32) -> Result<()> {
        self.table.with_process_mut(pid, |proc_| {
            if let Some(child) = proc_.child.as_mut() {
                child.stdin.take();
            }
        })
    }

    pub fn get_output(&self, pid: u32) -> Result<CapturedOutput> {
        self.table.with_process_mut(pid, |proc_| CapturedOutput {
            stdout_text: String::from_utf8_lossy(&proc_.output_buffer.snapshot()).into_owned(),
            stdout_bytes: proc_.output_buffer.byte_count(),
            stderr_text: String::from_utf8_lossy(&proc_.error_buffer.snapshot()).into_owned(),
            stderr_bytes: proc_.error_buffer.byte_count(),
        })
    }

    pub fn clear_buffers(&self, pid: u32) -> Result<()> {
        self.table.with_process_mut(pid, |proc_| {
            proc_.output_buffer.clear();
            proc_.error_buffer.clear();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_past_cap() {
        let mut buf = RingBuffer::new(10);
        buf.push(b"0123456789");
        buf.push(b"x");
        assert_eq!(buf.byte_count(), 10);
        assert_eq!(buf.snapshot(), b"123456789x");
    }

    #[test]
    fn ring_buffer_tracks_total_written_past_eviction() {
        let mut buf = RingBuffer::new(4);
        buf.push(b"ab");
        buf.push(b"cd");
        buf.push(b"ef");
        assert_eq!(buf.total_written(), 6);
        assert_eq!(buf.byte_count(), 4);
    }

    #[test]
    fn clear_empties_buffer() {
        let mut buf = RingBuffer::new(100);
        buf.push(b"hello");
        buf.clear();
        assert_eq!(buf.byte_count(), 0);
        assert!(buf.snapshot().is_empty());
    }
}
