//! Read transactions: a stable snapshot of everything committed at or below
//! the borrowed read timestamp. Holding one pins overlay and tombstone
//! garbage collection, never other transactions.

use crate::error::{CResult, Error};
use crate::graph::MutablePropertyFragment;
use crate::property::types::{decode_record, LabelId, Oid, PropertyValue, Vid};
use crate::schema::Schema;
use crate::txn::overlay::{EdgeKey, OverlayStore};
use crate::version::{Timestamp, VersionManager};

pub struct ReadTransaction<'a> {
    graph: &'a MutablePropertyFragment,
    overlays: &'a OverlayStore,
    version: &'a VersionManager,
    ts: Timestamp,
    finished: bool,
}

/// One edge of a materialized adjacency view, overlays already applied.
#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub neighbor: Vid,
    pub data: Vec<u8>,
}

/// A materialized, lock-free view over one vertex's adjacency in one
/// direction. Iteration order is insertion order.
pub struct EdgeView {
    entries: Vec<Edge>,
    pos: usize,
}

impl EdgeView {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Iterator for EdgeView {
    type Item = Edge;

    fn next(&mut self) -> Option<Self::Item> {
        let edge = self.entries.get(self.pos).cloned();
        self.pos += 1;
        edge
    }
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn new(
        graph: &'a MutablePropertyFragment,
        overlays: &'a OverlayStore,
        version: &'a VersionManager,
    ) -> CResult<Self> {
        let ts = version.acquire_read_timestamp()?;
        Ok(Self { graph, overlays, version, ts, finished: false })
    }

    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    pub fn schema(&self) -> &Schema {
        self.graph.schema()
    }

    /// Vertices of `label` visible in this snapshot.
    pub fn vertex_num(&self, label: LabelId) -> CResult<usize> {
        self.graph.visible_vertex_num(label, self.ts)
    }

    fn check_visible(&self, label: LabelId, vid: Vid) -> CResult<()> {
        if self.graph.table(label)?.create_ts(vid)? > self.ts {
            return Err(Error::NotFound(format!("vid {} of label {}", vid, label)));
        }
        Ok(())
    }

    /// Primary-key lookup, honoring the snapshot.
    pub fn get_vertex(&self, label: LabelId, oid: &Oid) -> CResult<Vid> {
        let vid = self.graph.lookup(label, oid)?;
        self.check_visible(label, vid)?;
        Ok(vid)
    }

    pub fn get_oid(&self, label: LabelId, vid: Vid) -> CResult<Oid> {
        self.check_visible(label, vid)?;
        self.graph.oid(label, vid)
    }

    /// Vids of `label` in this snapshot, in vid order.
    pub fn vertex_iter(&self, label: LabelId) -> CResult<std::ops::Range<Vid>> {
        Ok(0..self.vertex_num(label)? as Vid)
    }

    /// Property by name, overlay-aware.
    pub fn get_vertex_property(&self, label: LabelId, vid: Vid, prop: &str) -> CResult<PropertyValue> {
        let prop_idx = self.schema().prop_index(label, prop)?;
        self.get_vertex_property_by_index(label, vid, prop_idx)
    }

    pub fn get_vertex_property_by_index(
        &self,
        label: LabelId,
        vid: Vid,
        prop_idx: usize,
    ) -> CResult<PropertyValue> {
        self.check_visible(label, vid)?;
        if let Some(value) = self.overlays.vertex_at(&(label, vid, prop_idx as u16), self.ts)? {
            return Ok(value);
        }
        self.graph.get_vertex_prop(label, vid, prop_idx)
    }

    pub fn get_outgoing_edges(
        &self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        elabel: LabelId,
    ) -> CResult<EdgeView> {
        let nbrs = self.graph.get_outgoing_edges(src_label, src_vid, dst_label, elabel, self.ts)?;
        let mut entries = Vec::with_capacity(nbrs.len());
        for nbr in nbrs {
            let key = EdgeKey {
                src_label,
                src_vid,
                dst_label,
                dst_vid: nbr.neighbor,
                elabel,
            };
            let data = self.overlays.edge_at(&key, self.ts)?.unwrap_or(nbr.data);
            entries.push(Edge { neighbor: nbr.neighbor, data });
        }
        Ok(EdgeView { entries, pos: 0 })
    }

    pub fn get_incoming_edges(
        &self,
        dst_label: LabelId,
        dst_vid: Vid,
        src_label: LabelId,
        elabel: LabelId,
    ) -> CResult<EdgeView> {
        let nbrs = self.graph.get_incoming_edges(dst_label, dst_vid, src_label, elabel, self.ts)?;
        let mut entries = Vec::with_capacity(nbrs.len());
        for nbr in nbrs {
            let key = EdgeKey {
                src_label,
                src_vid: nbr.neighbor,
                dst_label,
                dst_vid,
                elabel,
            };
            let data = self.overlays.edge_at(&key, self.ts)?.unwrap_or(nbr.data);
            entries.push(Edge { neighbor: nbr.neighbor, data });
        }
        Ok(EdgeView { entries, pos: 0 })
    }

    /// Decodes an edge payload into the triplet's declared fields.
    pub fn decode_edge_props(
        &self,
        src_label: LabelId,
        dst_label: LabelId,
        elabel: LabelId,
        data: &[u8],
    ) -> CResult<Vec<PropertyValue>> {
        let idx = self.schema().triplet_index(src_label, dst_label, elabel)?;
        decode_record(&self.schema().triplet(idx).prop_types, data)
    }

    fn release(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.version.release_read_timestamp(self.ts);
        }
    }

    pub fn commit(mut self) {
        self.release();
    }

    pub fn abort(mut self) {
        self.release();
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
