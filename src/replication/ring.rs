//! Ring buffer (§4.9): a fixed-capacity circular log of committed mutations.
//! Each cell tracks, as a bitmask, which replicas still owe it a send; a
//! producer refuses to overwrite a cell until every replica bit has
//! cleared, returning the offending mask to the caller instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

struct Cell {
    eid: u64,
    data: Vec<u8>,
    /// Bit `n` set means replica `n` has not yet consumed this cell.
    pending: AtomicU64,
}

struct Inner {
    cells: VecDeque<Cell>,
    capacity: usize,
    next_eid: u64,
}

/// Shared ring buffer. Producer and consumers interact with it only through
/// atomic bitmask ops and a condvar; no hierarchy state is touched here.
pub struct RingBuffer {
    inner: Mutex<Inner>,
    not_empty: Condvar,
}

/// What a blocking consumer call woke up to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerCue {
    Entry { eid: u64, data: Vec<u8> },
    /// The entry the consumer was tracking fell off the back of the buffer
    /// before it could be delivered; the consumer must fall back to a full
    /// snapshot transfer.
    Lagged,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be positive");
        RingBuffer {
            inner: Mutex::new(Inner {
                cells: VecDeque::with_capacity(capacity),
                capacity,
                next_eid: 1,
            }),
            not_empty: Condvar::new(),
        }
    }

    /// Append `data` as a new entry, returning its assigned eid. If the
    /// buffer is at capacity and the oldest cell still has outstanding
    /// replica bits set, no eviction happens and the offending mask is
    /// returned instead so the caller can decide how to handle the slow
    /// replica (e.g. force a resync).
    pub fn insert(&self, data: Vec<u8>, replica_mask: u64) -> Result<u64, u64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.cells.len() >= inner.capacity {
            let offender = inner.cells.front().unwrap().pending.load(Ordering::Acquire);
            if offender != 0 {
                return Err(offender);
            }
            inner.cells.pop_front();
        }
        let eid = inner.next_eid;
        inner.next_eid += 1;
        inner.cells.push_back(Cell {
            eid,
            data,
            pending: AtomicU64::new(replica_mask),
        });
        drop(inner);
        self.not_empty.notify_all();
        Ok(eid)
    }

    /// Clear `mask`'s bits across every cell still outstanding for those
    /// replicas, i.e. mark them as replicated. Called once a replica's
    /// writer thread confirms the send.
    pub fn del_replica_mask(&self, mask: u64) {
        let inner = self.inner.lock().unwrap();
        for cell in &inner.cells {
            cell.pending.fetch_and(!mask, Ordering::AcqRel);
        }
        drop(inner);
        self.not_empty.notify_all();
    }

    /// Oldest eid still held in the buffer, or `None` if empty. A consumer
    /// compares its own cursor against this to detect lag.
    pub fn oldest_eid(&self) -> Option<u64> {
        self.inner.lock().unwrap().cells.front().map(|c| c.eid)
    }

    /// Blocking fetch of the first entry with `eid > after`, for replica
    /// bit `replica_bit`. Returns `Lagged` if `after` predates everything
    /// still buffered (the caller must resync via a full dump instead).
    pub fn get_next(&self, after: u64, replica_bit: u64) -> ConsumerCue {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(front) = inner.cells.front() {
                if front.eid > after + 1 {
                    return ConsumerCue::Lagged;
                }
            }
            if let Some(cell) = inner.cells.iter().find(|c| c.eid > after) {
                return ConsumerCue::Entry {
                    eid: cell.eid,
                    data: cell.data.clone(),
                };
            }
            let _ = replica_bit;
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Non-blocking snapshot of every buffered entry with `eid > after`, in
    /// ascending order — the replica-side FSM's "ascending eid catch-up"
    /// source (§4.9), as opposed to `get_next`'s blocking single-entry wait.
    pub fn entries_after(&self, after: u64) -> Vec<(u64, Vec<u8>)> {
        let inner = self.inner.lock().unwrap();
        inner.cells.iter().filter(|c| c.eid > after).map(|c| (c.eid, c.data.clone())).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-replica cursor kept by the consumer side (one per follower
/// connection). `replica_bit` is this replica's position in the ring
/// buffer's pending bitmask.
pub struct ConsumerState {
    pub replica_bit: u64,
    last_eid: u64,
}

impl ConsumerState {
    pub fn init_state(replica_bit: u64, start_after_eid: u64) -> Self {
        ConsumerState {
            replica_bit,
            last_eid: start_after_eid,
        }
    }

    pub fn get_next(&self, buf: &RingBuffer) -> ConsumerCue {
        buf.get_next(self.last_eid, self.replica_bit)
    }

    /// Advance the cursor and clear this replica's bit on the delivered
    /// entry so the producer may eventually reclaim its cell.
    pub fn mark_replicated(&mut self, buf: &RingBuffer, eid: u64) {
        self.last_eid = eid;
        buf.del_replica_mask(self.replica_bit);
    }
}
