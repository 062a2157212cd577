//! Deferred discards
//!
//! When discards are enabled a freed extent is not returned to the free map
//! until the device has acknowledged the discard for it. Frees issued under
//! the same [`TrimKey::Batch`] are merged into one discard while they stay
//! contiguous. Completions are handed to a worker task that performs the
//! deferred frees, so the device's completion path never touches a group.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use crate::blockdev::BlockDevice;
use crate::fs::FsInner;

/// How a free interacts with discards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrimKey {
    /// Free immediately, no discard
    NoTrim,
    /// Discard this extent on its own, then free it
    Singleton,
    /// Merge with other frees of the same batch where contiguous
    Batch(u64),
}

/// A free waiting for its discard to finish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingFree {
    pub(crate) bno: u64,
    pub(crate) size: u64,
    pub(crate) ino: u64,
    frags: u64,
}

impl PendingFree {
    pub(crate) fn new(bno: u64, size: u64, ino: u64, frags: u64) -> Self {
        Self {
            bno,
            size,
            ino,
            frags,
        }
    }
}

/// One discard under construction: a contiguous fragment range and the
/// frees that make it up
#[derive(Debug)]
struct TrimRange {
    start: u64,
    frags: u64,
    frees: Vec<PendingFree>,
}

impl TrimRange {
    fn new(free: PendingFree) -> Self {
        Self {
            start: free.bno,
            frags: free.frags,
            frees: vec![free],
        }
    }

    /// Add a free that touches either end, or hand it back
    fn extend(&mut self, free: PendingFree) -> std::result::Result<(), PendingFree> {
        if self.start + self.frags == free.bno {
            self.frags += free.frags;
            self.frees.push(free);
            Ok(())
        } else if free.bno + free.frags == self.start {
            self.start = free.bno;
            self.frags += free.frags;
            self.frees.insert(0, free);
            Ok(())
        } else {
            Err(free)
        }
    }
}

/// A discard the device has finished with
///
/// The only way to obtain the frees held back for a discard.
#[derive(Debug)]
pub(crate) struct CompletedDiscard {
    frees: Vec<PendingFree>,
}

impl CompletedDiscard {
    pub(crate) fn into_frees(self) -> Vec<PendingFree> {
        self.frees
    }
}

pub(crate) enum TrimMsg {
    Completed(CompletedDiscard),
    Shutdown,
}

/// Discard counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardStats {
    /// Frees waiting on a discard, issued or not
    pub in_flight: u64,
    /// Fragments those frees cover
    pub in_flight_frags: u64,
    /// Discard requests sent to the device
    pub issued: u64,
    /// Batches still accumulating
    pub open_batches: u64,
}

pub(crate) struct TrimState {
    enabled: bool,
    fsize: u64,
    pending: Mutex<HashMap<u64, TrimRange>>,
    next_key: AtomicU64,
    in_flight: AtomicU64,
    in_flight_frags: AtomicU64,
    issued: AtomicU64,
    drained: Notify,
    tx: UnboundedSender<TrimMsg>,
}

impl TrimState {
    pub(crate) fn new(enabled: bool, fsize: u64, tx: UnboundedSender<TrimMsg>) -> Self {
        Self {
            enabled,
            fsize,
            pending: Mutex::new(HashMap::new()),
            next_key: AtomicU64::new(1),
            in_flight: AtomicU64::new(0),
            in_flight_frags: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            drained: Notify::new(),
            tx,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn begin_batch(&self) -> TrimKey {
        TrimKey::Batch(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn end_batch(&self, device: &Arc<dyn BlockDevice>, key: TrimKey) {
        if let TrimKey::Batch(id) = key {
            let range = self.pending.lock().remove(&id);
            if let Some(range) = range {
                self.dispatch(device, range);
            }
        }
    }

    /// Issue every open batch
    pub(crate) fn flush_all(&self, device: &Arc<dyn BlockDevice>) {
        let ranges: Vec<TrimRange> = self.pending.lock().drain().map(|(_, r)| r).collect();
        for range in ranges {
            self.dispatch(device, range);
        }
    }

    /// Hold back a free until its discard completes
    pub(crate) fn submit(&self, device: &Arc<dyn BlockDevice>, free: PendingFree, key: TrimKey) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.in_flight_frags.fetch_add(free.frags, Ordering::SeqCst);
        let id = match key {
            TrimKey::Batch(id) => id,
            TrimKey::Singleton | TrimKey::NoTrim => {
                self.dispatch(device, TrimRange::new(free));
                return;
            }
        };
        let flushed = {
            let mut pending = self.pending.lock();
            match pending.get_mut(&id) {
                None => {
                    pending.insert(id, TrimRange::new(free));
                    None
                }
                Some(range) => match range.extend(free) {
                    Ok(()) => None,
                    Err(free) => Some(std::mem::replace(range, TrimRange::new(free))),
                },
            }
        };
        if let Some(range) = flushed {
            self.dispatch(device, range);
        }
    }

    fn dispatch(&self, device: &Arc<dyn BlockDevice>, range: TrimRange) {
        let offset = range.start * self.fsize;
        let len = range.frags * self.fsize;
        self.issued.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "TRIM: discarding {} fragments at {} for {} frees",
            range.frags,
            range.start,
            range.frees.len()
        );
        let device = device.clone();
        let tx = self.tx.clone();
        let frees = range.frees;
        tokio::spawn(async move {
            if let Err(e) = device.unmap(offset, len).await {
                log::warn!("TRIM: discard of {}+{} failed: {}", offset, len, e);
            }
            if tx
                .send(TrimMsg::Completed(CompletedDiscard { frees }))
                .is_err()
            {
                log::warn!("TRIM: completion dropped, filesystem already gone");
            }
        });
    }

    fn complete_one(&self, frags: u64) {
        self.in_flight_frags.fetch_sub(frags, Ordering::SeqCst);
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until nothing is in flight
    pub(crate) async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(TrimMsg::Shutdown);
    }

    pub(crate) fn stats(&self) -> DiscardStats {
        DiscardStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            in_flight_frags: self.in_flight_frags.load(Ordering::SeqCst),
            issued: self.issued.load(Ordering::Relaxed),
            open_batches: self.pending.lock().len() as u64,
        }
    }
}

/// Perform the frees of completed discards
pub(crate) async fn run_worker(fs: Weak<FsInner>, mut rx: UnboundedReceiver<TrimMsg>) {
    while let Some(msg) = rx.recv().await {
        let done = match msg {
            TrimMsg::Completed(done) => done,
            TrimMsg::Shutdown => break,
        };
        let Some(inner) = fs.upgrade() else {
            break;
        };
        for free in done.into_frees() {
            if let Err(e) = inner.blkfree_cg(free.bno, free.size, free.ino).await {
                log::error!("TRIM: deferred free of {} failed: {}", free.bno, e);
                if e.is_fatal() {
                    inner.detach();
                }
            }
            inner.trim.complete_one(free.frags);
        }
    }
    log::debug!("TRIM: worker stopped");
}
