//! Handoff from the driver's realtime thread to the host context.
//!
//! Submission never blocks; delivery is strictly FIFO. The queue does not
//! mask slot overruns (the driver reusing a slot before the host released
//! it) because dropping or reordering blocks would corrupt timing; it
//! counts them instead.

use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// One audio block handed to the host context. Created on the realtime
/// thread, consumed exactly once. Zero timing fields mean the driver did
/// not flag that value as valid.
#[derive(Debug, Clone, Copy)]
pub struct WorkItem {
    pub slot: usize,
    pub system_time_nanos: u64,
    pub sample_position: u64,
    pub timecode_samples: u64,
}

pub(crate) enum QueueMessage {
    Block(WorkItem),
    /// Fence: acknowledging it proves every earlier message was consumed.
    Quiesce(Sender<()>),
}

pub struct DispatchQueue {
    tx: Sender<QueueMessage>,
    slot_pending: [AtomicBool; 2],
    overruns: AtomicU64,
    accepting: AtomicBool,
}

impl DispatchQueue {
    pub(crate) fn new() -> (Arc<Self>, Receiver<QueueMessage>) {
        let (tx, rx) = unbounded();
        let queue = Arc::new(Self {
            tx,
            slot_pending: [AtomicBool::new(false), AtomicBool::new(false)],
            overruns: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        });
        (queue, rx)
    }

    /// Called on the realtime thread once per block. Never blocks; the
    /// unbounded send allocates, which is tolerable for the
    /// non-safety-critical sessions this bridge targets.
    pub(crate) fn submit(&self, item: WorkItem) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!("work item for slot {} discarded after stop", item.slot);
            return;
        }
        let slot = item.slot & 1;
        if self.slot_pending[slot].swap(true, Ordering::AcqRel) {
            let total = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "hardware slot {} reused before the host released it (overrun #{})",
                slot, total
            );
        }
        let _ = self.tx.send(QueueMessage::Block(item));
    }

    /// Host side: the slot's contents have been fully consumed and written.
    pub(crate) fn complete(&self, slot: usize) {
        self.slot_pending[slot & 1].store(false, Ordering::Release);
    }

    pub(crate) fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Count of blocks that reused a slot the host still held.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Close the queue and wait until the host context has drained it.
    /// Items still queued are discarded, not delivered; when this returns
    /// no user callback can run anymore.
    pub(crate) fn quiesce(&self) {
        self.accepting.store(false, Ordering::Release);
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(QueueMessage::Quiesce(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}
