//! Timestamp issue and publication.
//!
//! A single 32-bit counter feeds every transaction flavor. Read transactions
//! borrow the latest published timestamp and register themselves so
//! compaction knows the minimum outstanding read. Write-family transactions
//! (insert, update, compact) each take a fresh timestamp and commit through a
//! FIFO frontier: a transaction applies its effects only when every earlier
//! timestamp has finished, which makes live application order identical to
//! timestamp order. WAL replay sorts by timestamp, so a replayed fragment
//! matches the live one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex};

use crate::error::CResult;

/// Logical timestamp of a committed mutation.
pub type Timestamp = u32;

pub struct VersionManager {
    inner: Mutex<Inner>,
    cond: Condvar,
}

struct Inner {
    /// Highest timestamp whose transaction has finished (committed or
    /// aborted); everything at or below it is decided.
    committed: Timestamp,

    /// Next timestamp to hand out.
    next_ts: Timestamp,

    /// The timestamp whose turn it is to apply.
    next_publish: Timestamp,

    /// Timestamps released out of order, waiting for the frontier.
    done: BTreeSet<Timestamp>,

    /// Outstanding read timestamps, with a count per timestamp.
    readers: BTreeMap<Timestamp, usize>,
}

impl VersionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                committed: 0,
                next_ts: 1,
                next_publish: 1,
                done: BTreeSet::new(),
                readers: BTreeMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// Latest published timestamp; the snapshot a new reader observes.
    pub fn committed(&self) -> Timestamp {
        self.inner.lock().map(|i| i.committed).unwrap_or(0)
    }

    /// Borrows the current committed timestamp and registers the reader.
    pub fn acquire_read_timestamp(&self) -> CResult<Timestamp> {
        let mut inner = self.inner.lock()?;
        let ts = inner.committed;
        *inner.readers.entry(ts).or_insert(0) += 1;
        Ok(ts)
    }

    pub fn release_read_timestamp(&self, ts: Timestamp) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        if let Some(count) = inner.readers.get_mut(&ts) {
            *count -= 1;
            if *count == 0 {
                inner.readers.remove(&ts);
            }
        }
        Ok(())
    }

    /// A fresh timestamp for an insert-family or update-family transaction.
    pub fn acquire_write_timestamp(&self) -> CResult<Timestamp> {
        let mut inner = self.inner.lock()?;
        let ts = inner.next_ts;
        inner.next_ts += 1;
        Ok(ts)
    }

    /// Insert-family commits become visible only when every earlier write
    /// timestamp has completed; the shared issuer plus the publish frontier
    /// enforce that.
    pub fn acquire_insert_timestamp(&self) -> CResult<Timestamp> {
        self.acquire_write_timestamp()
    }

    /// Update-family commits publish an overlay at their timestamp; they
    /// wait for prior writers through the same frontier.
    pub fn acquire_update_timestamp(&self) -> CResult<Timestamp> {
        self.acquire_write_timestamp()
    }

    /// Blocks until every timestamp below `ts` has been released. The caller
    /// then holds the apply turn until it releases `ts` itself.
    pub fn wait_for_turn(&self, ts: Timestamp) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        while inner.next_publish != ts {
            inner = self.cond.wait(inner)?;
        }
        Ok(())
    }

    /// Marks `ts` finished and advances the publish frontier over every
    /// contiguously finished timestamp. Commit and abort both end up here;
    /// an aborted transaction simply published nothing.
    pub fn release_write_timestamp(&self, ts: Timestamp) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        inner.done.insert(ts);
        loop {
            let frontier = inner.next_publish;
            if !inner.done.remove(&frontier) {
                break;
            }
            inner.committed = frontier;
            inner.next_publish = frontier + 1;
        }
        self.cond.notify_all();
        Ok(())
    }

    /// The lower bound of what any current or future reader can observe;
    /// overlays and tombstones at or below it are reclaimable.
    pub fn min_read_ts(&self) -> CResult<Timestamp> {
        let inner = self.inner.lock()?;
        Ok(inner
            .readers
            .keys()
            .next()
            .copied()
            .map(|r| r.min(inner.committed))
            .unwrap_or(inner.committed))
    }

    /// Replay-only: resumes issuing after the highest timestamp found in the
    /// WAL.
    pub fn init_ts(&self, last: Timestamp) -> CResult<()> {
        let mut inner = self.inner.lock()?;
        inner.committed = last;
        inner.next_ts = last + 1;
        inner.next_publish = last + 1;
        Ok(())
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}
