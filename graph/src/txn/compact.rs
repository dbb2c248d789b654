//! Compaction: fold committed overlays into base storage and reclaim
//! tombstoned adjacency entries, bounded by the minimum outstanding read
//! timestamp. Runs as an update-family transaction so it takes its place in
//! the timestamp sequence and leaves a (no-op) record in the WAL.

use crate::alloc::ArenaAllocator;
use crate::error::CResult;
use crate::graph::MutablePropertyFragment;
use crate::txn::overlay::OverlayStore;
use crate::txn::update::commit_update_ops;
use crate::version::{Timestamp, VersionManager};
use crate::wal::WalWriter;

/// Minimum timestamp distance between two committed compactions. A proposal
/// arriving earlier aborts silently.
pub const COMPACTION_INTERVAL: Timestamp = 100_000;

pub struct CompactTransaction<'a> {
    graph: &'a MutablePropertyFragment,
    overlays: &'a OverlayStore,
    version: &'a VersionManager,
    wal: &'a mut WalWriter,
    alloc: &'a mut ArenaAllocator,
    ts: Timestamp,
    finished: bool,
}

impl<'a> CompactTransaction<'a> {
    pub(crate) fn new(
        graph: &'a MutablePropertyFragment,
        overlays: &'a OverlayStore,
        version: &'a VersionManager,
        wal: &'a mut WalWriter,
        alloc: &'a mut ArenaAllocator,
        ts: Timestamp,
    ) -> Self {
        Self { graph, overlays, version, wal, alloc, ts, finished: false }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    pub fn commit(mut self) -> CResult<()> {
        self.finished = true;
        commit_update_ops(
            self.graph,
            self.overlays,
            self.version,
            &mut *self.wal,
            &mut *self.alloc,
            self.ts,
            &[],
        )?;
        // The record is published; now reclaim what no reader can observe.
        // Replay never repeats this part, which is why restart equality is
        // stated modulo compaction.
        let min_ts = self.version.min_read_ts()?;
        let (folded_vertices, folded_edges) = self.overlays.gc(min_ts, self.graph)?;
        let reclaimed = self.graph.reclaim(min_ts)?;
        log::info!(
            "compaction at ts {}: folded {} vertex / {} edge overlay versions, reclaimed {} adjacency entries (min read ts {})",
            self.ts,
            folded_vertices,
            folded_edges,
            reclaimed,
            min_ts
        );
        Ok(())
    }

    pub fn abort(mut self) {
        self.finished = true;
        let _ = self.version.release_write_timestamp(self.ts);
    }
}

impl Drop for CompactTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.version.release_write_timestamp(self.ts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::types::{Oid, PropertyType, PropertyValue};
    use crate::schema::{EdgeStrategy, Schema, StorageStrategy};

    fn sample_schema() -> Schema {
        let mut schema = Schema::new();
        schema
            .add_vertex_label(
                "person",
                vec![PropertyType::Int64],
                vec!["v".to_string()],
                "id",
                PropertyType::Int64,
                vec![StorageStrategy::Memory],
                64,
            )
            .unwrap();
        schema
            .add_edge_label(
                "person",
                "person",
                "knows",
                vec![],
                vec![],
                EdgeStrategy::Multiple,
                EdgeStrategy::Multiple,
            )
            .unwrap();
        schema
    }

    #[test]
    /// The gating interval lives in the session; the transaction itself
    /// folds overlays into base storage and drops reclaimable tombstones.
    fn commit_folds_and_reclaims() -> CResult<()> {
        let dir = tempdir::TempDir::new("compact")?;
        let graph = MutablePropertyFragment::new(sample_schema());
        let overlays = OverlayStore::new();
        let version = VersionManager::new();
        let mut wal = WalWriter::open(&dir.path().join("wal"), 0)?;
        let mut alloc = ArenaAllocator::new();

        // ts 1: two vertices and an edge.
        let t1 = version.acquire_write_timestamp()?;
        graph.add_vertex(0, Oid::Int64(1), &[PropertyValue::Int64(0)], t1)?;
        graph.add_vertex(0, Oid::Int64(2), &[PropertyValue::Int64(0)], t1)?;
        graph.add_edge(0, 0, 0, 1, 0, &[], t1)?;
        version.wait_for_turn(t1)?;
        version.release_write_timestamp(t1)?;

        // ts 2: an update overlay plus a tombstone.
        let t2 = version.acquire_write_timestamp()?;
        overlays.put_vertex((0, 0, 0), t2, PropertyValue::Int64(9))?;
        graph.tombstone_edge(0, 0, 0, 1, 0, t2)?;
        version.wait_for_turn(t2)?;
        version.release_write_timestamp(t2)?;

        assert_eq!(graph.get_vertex_prop(0, 0, 0)?, PropertyValue::Int64(0));
        assert_eq!(graph.get_outgoing_edges(0, 0, 0, 0, t1)?.len(), 1);

        let t3 = version.acquire_write_timestamp()?;
        let txn = CompactTransaction::new(&graph, &overlays, &version, &mut wal, &mut alloc, t3);
        assert_eq!(txn.timestamp(), t3);
        txn.commit()?;

        // The overlay value is now the base value, and the tombstoned entry
        // is physically gone even for an old timestamp.
        assert_eq!(graph.get_vertex_prop(0, 0, 0)?, PropertyValue::Int64(9));
        assert_eq!(overlays.version_count(), 0);
        assert!(graph.get_outgoing_edges(0, 0, 0, 0, t1)?.is_empty());
        Ok(())
    }
}
