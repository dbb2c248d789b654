//! Versioned adjacency storage.
//!
//! Each `(src_label, dst_label, edge_label)` triplet owns one structure per
//! direction, sized to the source label's `max_vnum` at construction. Every
//! source vertex has one published buffer of entries; an entry records the
//! neighbor, the timestamp of the inserting transaction, the timestamp of
//! the tombstoning transaction (if any) and the fixed-size edge payload.
//!
//! Writers are serialized per source vertex through a small lock array.
//! A write builds its successor buffer (growing to `max(4, 2 * capacity)`
//! when full) and publishes the new pointer atomically. Readers load the
//! pointer without taking any lock; a reader that captured the old pointer
//! keeps seeing its snapshot, and the replaced buffer is reclaimed through
//! its reference count once the last such reader finishes. Only compaction
//! shrinks a buffer.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::property::types::Vid;
use crate::schema::EdgeStrategy;
use crate::snapshot;
use crate::version::Timestamp;

/// `tomb_ts` of a live entry.
pub const TOMBSTONE_NONE: Timestamp = Timestamp::MAX;

/// Neighbor value of an empty or reclaimed slot.
pub const SENTINEL: Vid = Vid::MAX;

/// Writer locks per direction; writers hash into it by source vid.
const LOCK_SHARDS: usize = 64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Nbr {
    pub neighbor: Vid,
    pub ts: Timestamp,
    pub tomb_ts: Timestamp,
    pub data: Vec<u8>,
}

impl Nbr {
    pub fn new(neighbor: Vid, ts: Timestamp, data: Vec<u8>) -> Self {
        Self { neighbor, ts, tomb_ts: TOMBSTONE_NONE, data }
    }

    fn empty() -> Self {
        Self { neighbor: SENTINEL, ts: 0, tomb_ts: TOMBSTONE_NONE, data: Vec::new() }
    }

    /// Visible to a reader at `read_ts`: inserted no later, not yet
    /// tombstoned from that reader's point of view.
    pub fn visible_at(&self, read_ts: Timestamp) -> bool {
        self.neighbor != SENTINEL && self.ts <= read_ts && self.tomb_ts > read_ts
    }

    fn live(&self) -> bool {
        self.neighbor != SENTINEL && self.tomb_ts == TOMBSTONE_NONE
    }
}

/// One published buffer per source vertex.
struct AdjSlot {
    buf: ArcSwap<Vec<Nbr>>,
}

/// Growable per-vertex adjacency buffers ("multiple" strategy).
pub struct MutableCsr {
    slots: Vec<AdjSlot>,
    locks: Vec<Mutex<()>>,
}

impl MutableCsr {
    pub fn new(max_vnum: usize) -> Self {
        let empty = Arc::new(Vec::new());
        let slots = (0..max_vnum)
            .map(|_| AdjSlot { buf: ArcSwap::new(empty.clone()) })
            .collect();
        let locks = (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect();
        Self { slots, locks }
    }

    fn write_guard(&self, src: Vid) -> CResult<MutexGuard<'_, ()>> {
        Ok(self.locks[src as usize % LOCK_SHARDS].lock()?)
    }

    fn slot(&self, src: Vid) -> CResult<&AdjSlot> {
        self.slots
            .get(src as usize)
            .ok_or_else(|| Error::InvalidInput(format!("vid {} out of range", src)))
    }

    /// The writer-owned successor of a published buffer. The published
    /// buffer is shared with running readers, so writers never touch it in
    /// place; they copy into a fresh buffer of the given capacity and
    /// publish that instead.
    fn successor(buf: &[Nbr], capacity: usize) -> Vec<Nbr> {
        let mut copy = Vec::with_capacity(capacity);
        copy.extend_from_slice(buf);
        copy
    }

    pub fn put_edge(&self, src: Vid, nbr: Nbr) -> CResult<()> {
        let _guard = self.write_guard(src)?;
        let slot = self.slot(src)?;
        let old = slot.buf.load_full();
        let capacity = if old.len() == old.capacity() {
            std::cmp::max(4, 2 * old.capacity())
        } else {
            old.capacity()
        };
        let mut new_buf = Self::successor(&old, capacity);
        new_buf.push(nbr);
        slot.buf.store(Arc::new(new_buf));
        Ok(())
    }

    /// Entries of `src` visible at `read_ts`, in insertion order. Takes no
    /// lock: the published pointer is loaded atomically and stays valid for
    /// as long as the reader holds it.
    pub fn snapshot(&self, src: Vid, read_ts: Timestamp) -> CResult<Vec<Nbr>> {
        Ok(match self.slots.get(src as usize) {
            Some(slot) => {
                slot.buf.load().iter().filter(|n| n.visible_at(read_ts)).cloned().collect()
            }
            None => Vec::new(),
        })
    }

    /// Capacity of the published buffer, for growth-policy inspection.
    pub fn capacity(&self, src: Vid) -> usize {
        self.slots
            .get(src as usize)
            .map(|slot| slot.buf.load().capacity())
            .unwrap_or(0)
    }

    /// Marks every live entry `src -> dst` tombstoned at `ts`; returns how
    /// many entries were marked.
    pub fn tombstone(&self, src: Vid, dst: Vid, ts: Timestamp) -> CResult<usize> {
        let _guard = self.write_guard(src)?;
        let slot = match self.slots.get(src as usize) {
            Some(slot) => slot,
            None => return Ok(0),
        };
        let old = slot.buf.load_full();
        let marked = old.iter().filter(|n| n.live() && n.neighbor == dst).count();
        if marked == 0 {
            return Ok(0);
        }
        let mut new_buf = Self::successor(&old, old.capacity());
        for nbr in new_buf.iter_mut() {
            if nbr.live() && nbr.neighbor == dst {
                nbr.tomb_ts = ts;
            }
        }
        slot.buf.store(Arc::new(new_buf));
        Ok(marked)
    }

    /// Overwrites the payload of every live entry `src -> dst` (compaction
    /// folding a committed overlay into base storage).
    pub fn set_data(&self, src: Vid, dst: Vid, data: &[u8]) -> CResult<usize> {
        let _guard = self.write_guard(src)?;
        let slot = match self.slots.get(src as usize) {
            Some(slot) => slot,
            None => return Ok(0),
        };
        let old = slot.buf.load_full();
        let written = old.iter().filter(|n| n.live() && n.neighbor == dst).count();
        if written == 0 {
            return Ok(0);
        }
        let mut new_buf = Self::successor(&old, old.capacity());
        for nbr in new_buf.iter_mut() {
            if nbr.live() && nbr.neighbor == dst {
                nbr.data = data.to_vec();
            }
        }
        slot.buf.store(Arc::new(new_buf));
        Ok(written)
    }

    /// Any live entry `src -> dst`?
    pub fn contains(&self, src: Vid, dst: Vid) -> CResult<bool> {
        Ok(self
            .slots
            .get(src as usize)
            .map(|slot| slot.buf.load().iter().any(|n| n.live() && n.neighbor == dst))
            .unwrap_or(false))
    }

    /// Physically drops entries tombstoned at or before `min_ts`; no reader
    /// at or after `min_ts` can still see them. Replaced buffers die with
    /// their last outstanding reader.
    pub fn reclaim(&self, min_ts: Timestamp) -> CResult<usize> {
        let mut dropped = 0;
        for src in 0..self.slots.len() {
            let _guard = self.write_guard(src as Vid)?;
            let slot = &self.slots[src];
            let old = slot.buf.load_full();
            let reclaimable =
                old.iter().filter(|n| n.neighbor == SENTINEL || n.tomb_ts <= min_ts).count();
            if reclaimable == 0 {
                continue;
            }
            let mut new_buf = Vec::with_capacity(old.capacity());
            new_buf.extend(
                old.iter().filter(|n| n.neighbor != SENTINEL && n.tomb_ts > min_ts).cloned(),
            );
            slot.buf.store(Arc::new(new_buf));
            dropped += reclaimable;
        }
        Ok(dropped)
    }

    /// Stable re-sort of every buffer by insert timestamp. Live insertion
    /// order equals timestamp order, so this restores it after a parallel
    /// replay.
    pub fn sort_by_ts(&self) -> CResult<()> {
        for src in 0..self.slots.len() {
            let _guard = self.write_guard(src as Vid)?;
            let slot = &self.slots[src];
            let old = slot.buf.load_full();
            if old.len() < 2 {
                continue;
            }
            let mut new_buf = Self::successor(&old, old.capacity());
            new_buf.sort_by_key(|n| n.ts);
            slot.buf.store(Arc::new(new_buf));
        }
        Ok(())
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        let mut lists: Vec<Vec<Nbr>> = self
            .slots
            .iter()
            .map(|slot| (*slot.buf.load_full()).clone())
            .collect();
        while lists.last().map(|l| l.is_empty()).unwrap_or(false) {
            lists.pop();
        }
        let mut w = BufWriter::new(File::create(path)?);
        snapshot::write_header(&mut w)?;
        bincode::serialize_into(&mut w, &lists)?;
        Ok(())
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        let mut r = BufReader::new(File::open(path)?);
        snapshot::check_header(&mut r, path)?;
        let lists: Vec<Vec<Nbr>> = bincode::deserialize_from(&mut r)?;
        if lists.len() > self.slots.len() {
            return Err(Error::Internal(format!(
                "{}: {} adjacency lists exceed the label capacity {}",
                path.display(),
                lists.len(),
                self.slots.len()
            )));
        }
        for (slot, list) in self.slots.iter().zip(lists) {
            slot.buf.store(Arc::new(list));
        }
        Ok(())
    }
}

/// One inline slot per vertex ("single" strategy), published and reclaimed
/// the same way as the growable buffers.
pub struct SingleCsr {
    slots: Vec<ArcSwap<Nbr>>,
    locks: Vec<Mutex<()>>,
}

impl SingleCsr {
    pub fn new(max_vnum: usize) -> Self {
        let empty = Arc::new(Nbr::empty());
        let slots = (0..max_vnum).map(|_| ArcSwap::new(empty.clone())).collect();
        let locks = (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect();
        Self { slots, locks }
    }

    fn write_guard(&self, src: Vid) -> CResult<MutexGuard<'_, ()>> {
        Ok(self.locks[src as usize % LOCK_SHARDS].lock()?)
    }

    pub fn put_edge(&self, src: Vid, nbr: Nbr) -> CResult<()> {
        let _guard = self.write_guard(src)?;
        let slot = self
            .slots
            .get(src as usize)
            .ok_or_else(|| Error::InvalidInput(format!("vid {} out of range", src)))?;
        // A tombstoned slot still belongs to readers below its tombstone
        // timestamp; only compaction can empty it.
        if slot.load().neighbor != SENTINEL {
            return Err(Error::InvalidInput(format!(
                "single-strategy slot of vertex {} is already occupied",
                src
            )));
        }
        slot.store(Arc::new(nbr));
        Ok(())
    }

    pub fn snapshot(&self, src: Vid, read_ts: Timestamp) -> CResult<Vec<Nbr>> {
        Ok(match self.slots.get(src as usize) {
            Some(slot) => {
                let cur = slot.load_full();
                if cur.visible_at(read_ts) {
                    vec![(*cur).clone()]
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        })
    }

    pub fn tombstone(&self, src: Vid, dst: Vid, ts: Timestamp) -> CResult<usize> {
        let _guard = self.write_guard(src)?;
        if let Some(slot) = self.slots.get(src as usize) {
            let cur = slot.load_full();
            if cur.live() && cur.neighbor == dst {
                let mut marked = (*cur).clone();
                marked.tomb_ts = ts;
                slot.store(Arc::new(marked));
                return Ok(1);
            }
        }
        Ok(0)
    }

    pub fn set_data(&self, src: Vid, dst: Vid, data: &[u8]) -> CResult<usize> {
        let _guard = self.write_guard(src)?;
        if let Some(slot) = self.slots.get(src as usize) {
            let cur = slot.load_full();
            if cur.live() && cur.neighbor == dst {
                let mut written = (*cur).clone();
                written.data = data.to_vec();
                slot.store(Arc::new(written));
                return Ok(1);
            }
        }
        Ok(0)
    }

    pub fn contains(&self, src: Vid, dst: Vid) -> CResult<bool> {
        Ok(self
            .slots
            .get(src as usize)
            .map(|slot| {
                let cur = slot.load();
                cur.live() && cur.neighbor == dst
            })
            .unwrap_or(false))
    }

    /// Whether `put_edge(src, ..)` would be accepted.
    pub fn slot_free(&self, src: Vid) -> CResult<bool> {
        Ok(self
            .slots
            .get(src as usize)
            .map(|slot| slot.load().neighbor == SENTINEL)
            .unwrap_or(true))
    }

    pub fn reclaim(&self, min_ts: Timestamp) -> CResult<usize> {
        let mut dropped = 0;
        for src in 0..self.slots.len() {
            let _guard = self.write_guard(src as Vid)?;
            let slot = &self.slots[src];
            let cur = slot.load_full();
            if cur.neighbor != SENTINEL && cur.tomb_ts <= min_ts {
                slot.store(Arc::new(Nbr::empty()));
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        let mut slots: Vec<Nbr> = self.slots.iter().map(|slot| (*slot.load_full()).clone()).collect();
        let empty = Nbr::empty();
        while slots.last().map(|n| *n == empty).unwrap_or(false) {
            slots.pop();
        }
        let mut w = BufWriter::new(File::create(path)?);
        snapshot::write_header(&mut w)?;
        bincode::serialize_into(&mut w, &slots)?;
        Ok(())
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        let mut r = BufReader::new(File::open(path)?);
        snapshot::check_header(&mut r, path)?;
        let slots: Vec<Nbr> = bincode::deserialize_from(&mut r)?;
        if slots.len() > self.slots.len() {
            return Err(Error::Internal(format!(
                "{}: {} adjacency slots exceed the label capacity {}",
                path.display(),
                slots.len(),
                self.slots.len()
            )));
        }
        for (slot, nbr) in self.slots.iter().zip(slots) {
            slot.store(Arc::new(nbr));
        }
        Ok(())
    }
}

/// One direction of one triplet, dispatching on the declared strategy.
pub enum Csr {
    Multiple(MutableCsr),
    Single(SingleCsr),
    None,
}

impl Csr {
    pub fn new(strategy: EdgeStrategy, max_vnum: usize) -> Self {
        match strategy {
            EdgeStrategy::Multiple => Csr::Multiple(MutableCsr::new(max_vnum)),
            EdgeStrategy::Single => Csr::Single(SingleCsr::new(max_vnum)),
            EdgeStrategy::None => Csr::None,
        }
    }

    pub fn put_edge(&self, src: Vid, nbr: Nbr) -> CResult<()> {
        match self {
            Csr::Multiple(c) => c.put_edge(src, nbr),
            Csr::Single(c) => c.put_edge(src, nbr),
            Csr::None => Ok(()),
        }
    }

    pub fn snapshot(&self, src: Vid, read_ts: Timestamp) -> CResult<Vec<Nbr>> {
        match self {
            Csr::Multiple(c) => c.snapshot(src, read_ts),
            Csr::Single(c) => c.snapshot(src, read_ts),
            Csr::None => Err(Error::InvalidInput(
                "this direction is not maintained for the triplet".to_string(),
            )),
        }
    }

    pub fn tombstone(&self, src: Vid, dst: Vid, ts: Timestamp) -> CResult<usize> {
        match self {
            Csr::Multiple(c) => c.tombstone(src, dst, ts),
            Csr::Single(c) => c.tombstone(src, dst, ts),
            Csr::None => Ok(0),
        }
    }

    pub fn set_data(&self, src: Vid, dst: Vid, data: &[u8]) -> CResult<usize> {
        match self {
            Csr::Multiple(c) => c.set_data(src, dst, data),
            Csr::Single(c) => c.set_data(src, dst, data),
            Csr::None => Ok(0),
        }
    }

    pub fn contains(&self, src: Vid, dst: Vid) -> CResult<bool> {
        match self {
            Csr::Multiple(c) => c.contains(src, dst),
            Csr::Single(c) => c.contains(src, dst),
            Csr::None => Ok(false),
        }
    }

    /// Rejects up front what `put_edge` would reject, so callers can check
    /// both directions before writing either.
    pub fn check_slot_free(&self, src: Vid) -> CResult<()> {
        if let Csr::Single(c) = self {
            if !c.slot_free(src)? {
                return Err(Error::InvalidInput(format!(
                    "single-strategy slot of vertex {} is already occupied",
                    src
                )));
            }
        }
        Ok(())
    }

    pub fn reclaim(&self, min_ts: Timestamp) -> CResult<usize> {
        match self {
            Csr::Multiple(c) => c.reclaim(min_ts),
            Csr::Single(c) => c.reclaim(min_ts),
            Csr::None => Ok(0),
        }
    }

    pub fn sort_by_ts(&self) -> CResult<()> {
        match self {
            Csr::Multiple(c) => c.sort_by_ts(),
            // Single slots hold at most one entry, nothing to order.
            Csr::Single(_) | Csr::None => Ok(()),
        }
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        match self {
            Csr::Multiple(c) => c.serialize(path),
            Csr::Single(c) => c.serialize(path),
            Csr::None => Ok(()),
        }
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        match self {
            Csr::Multiple(c) => c.deserialize(path),
            Csr::Single(c) => c.deserialize(path),
            Csr::None => Ok(()),
        }
    }
}
