//! In-memory block device
//!
//! Sparse, chunked storage with an event log of barrier writes and unmap
//! commands, read-failure injection, and a gate that holds unmap completion
//! until released. Used by tests and benchmarks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

use super::blockdev_trait::{check_access, BlockDevice, BlockDeviceError, Result};

const CHUNK: u64 = 64 * 1024;

/// Device-level operations observed by a [`MemBlockDevice`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Ordinary write
    Write { offset: u64, len: u64 },
    /// Write ordered before all later writes
    Barrier { offset: u64, len: u64 },
    /// Discard of a byte range
    Unmap { offset: u64, len: u64 },
}

/// Block device that keeps its contents in memory
#[derive(Debug)]
pub struct MemBlockDevice {
    size: u64,
    chunks: Mutex<HashMap<u64, Vec<u8>>>,
    events: Mutex<Vec<DeviceEvent>>,
    failing_reads: Mutex<Vec<Range<u64>>>,
    unmaps_paused: AtomicBool,
    unmap_gate: Notify,
    reads: AtomicU64,
}

impl MemBlockDevice {
    /// Create a zero-filled device of `size` bytes
    pub fn new(size: u64) -> Self {
        Self {
            size,
            chunks: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            failing_reads: Mutex::new(Vec::new()),
            unmaps_paused: AtomicBool::new(false),
            unmap_gate: Notify::new(),
            reads: AtomicU64::new(0),
        }
    }

    /// Every write, barrier and unmap seen so far, oldest first
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Unmap commands seen so far as `(offset, len)` pairs
    pub fn unmaps(&self) -> Vec<(u64, u64)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match *e {
                DeviceEvent::Unmap { offset, len } => Some((offset, len)),
                _ => None,
            })
            .collect()
    }

    /// Forget the event log
    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Number of reads served
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Make every read overlapping `range` fail with an I/O error
    pub fn fail_reads(&self, range: Range<u64>) {
        self.failing_reads.lock().push(range);
    }

    /// Make reads succeed again
    pub fn heal_reads(&self) {
        self.failing_reads.lock().clear();
    }

    /// Hold every unmap command until [`MemBlockDevice::resume_unmaps`]
    pub fn pause_unmaps(&self) {
        self.unmaps_paused.store(true, Ordering::SeqCst);
    }

    /// Release held unmap commands
    pub fn resume_unmaps(&self) {
        self.unmaps_paused.store(false, Ordering::SeqCst);
        self.unmap_gate.notify_waiters();
    }

    /// Flip one byte in place, bypassing the event log
    pub fn corrupt_byte(&self, offset: u64) {
        let mut chunks = self.chunks.lock();
        let chunk = chunks
            .entry(offset / CHUNK)
            .or_insert_with(|| vec![0u8; CHUNK as usize]);
        chunk[(offset % CHUNK) as usize] ^= 0xFF;
    }

    fn copy_out(&self, offset: u64, buf: &mut [u8]) {
        let chunks = self.chunks.lock();
        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let in_chunk = (pos % CHUNK) as usize;
            let n = (CHUNK as usize - in_chunk).min(buf.len() - done);
            match chunks.get(&(pos / CHUNK)) {
                Some(chunk) => buf[done..done + n].copy_from_slice(&chunk[in_chunk..in_chunk + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
    }

    fn copy_in(&self, offset: u64, data: &[u8]) {
        let mut chunks = self.chunks.lock();
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let in_chunk = (pos % CHUNK) as usize;
            let n = (CHUNK as usize - in_chunk).min(data.len() - done);
            let chunk = chunks
                .entry(pos / CHUNK)
                .or_insert_with(|| vec![0u8; CHUNK as usize]);
            chunk[in_chunk..in_chunk + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
    }

    fn zero(&self, offset: u64, len: u64) {
        let zeros = vec![0u8; len as usize];
        self.copy_in(offset, &zeros);
    }
}

#[async_trait]
impl BlockDevice for MemBlockDevice {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        check_access(self.size, offset, len)?;
        let failing = self
            .failing_reads
            .lock()
            .iter()
            .any(|r| r.start < offset + len && offset < r.end);
        if failing {
            return Err(BlockDeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected read failure at offset {}", offset),
            )));
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.copy_out(offset, buf);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        check_access(self.size, offset, len)?;
        self.copy_in(offset, data);
        self.events.lock().push(DeviceEvent::Write { offset, len });
        Ok(())
    }

    async fn write_barrier_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        check_access(self.size, offset, len)?;
        self.copy_in(offset, data);
        self.events.lock().push(DeviceEvent::Barrier { offset, len });
        Ok(())
    }

    async fn unmap(&self, offset: u64, len: u64) -> Result<()> {
        check_access(self.size, offset, len)?;
        self.events.lock().push(DeviceEvent::Unmap { offset, len });
        loop {
            let released = self.unmap_gate.notified();
            if !self.unmaps_paused.load(Ordering::SeqCst) {
                break;
            }
            released.await;
        }
        self.zero(offset, len);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_back_across_chunks() {
        let dev = MemBlockDevice::new(4 * CHUNK);
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let offset = CHUNK - 4096;
        dev.write_at(offset, &data).await.unwrap();

        let mut back = vec![0u8; 8192];
        dev.read_at(offset, &mut back).await.unwrap();
        assert_eq!(data, back);
        assert_eq!(dev.events(), vec![DeviceEvent::Write { offset, len: 8192 }]);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let dev = MemBlockDevice::new(CHUNK);
        dev.fail_reads(1024..2048);
        let mut buf = [0u8; 512];
        assert!(dev.read_at(1536, &mut buf).await.is_err());
        assert!(dev.read_at(2048, &mut buf).await.is_ok());
        dev.heal_reads();
        assert!(dev.read_at(1536, &mut buf).await.is_ok());
    }

    #[tokio::test]
    async fn test_unmap_gate() {
        let dev = std::sync::Arc::new(MemBlockDevice::new(CHUNK));
        dev.write_at(0, &[7u8; 512]).await.unwrap();
        dev.pause_unmaps();

        let d = dev.clone();
        let task = tokio::spawn(async move { d.unmap(0, 512).await });
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        dev.resume_unmaps();
        task.await.unwrap().unwrap();
        let mut buf = [1u8; 512];
        dev.read_at(0, &mut buf).await.unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
