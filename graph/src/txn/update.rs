//! Update transactions: property overwrites and edge tombstones.
//!
//! Operations buffer locally; the transaction sees its own writes, everyone
//! else sees nothing until commit. Commit appends one WAL record and
//! publishes the buffered deltas as an overlay keyed by the commit
//! timestamp, so read transactions opened earlier keep their snapshot.
//! Update transactions never create vertices or edges.

use std::collections::{HashMap, HashSet};

use crate::alloc::ArenaAllocator;
use crate::error::{CResult, Error};
use crate::graph::MutablePropertyFragment;
use crate::property::types::{encode_record, LabelId, Oid, PropertyValue, Vid};
use crate::txn::overlay::{EdgeKey, OverlayStore, VertexPropKey};
use crate::version::{Timestamp, VersionManager};
use crate::wal::{self, UpdateOp, WalWriter};

pub struct UpdateTransaction<'a> {
    graph: &'a MutablePropertyFragment,
    overlays: &'a OverlayStore,
    version: &'a VersionManager,
    wal: &'a mut WalWriter,
    alloc: &'a mut ArenaAllocator,
    ts: Timestamp,
    /// Deltas in operation order; this is also the WAL body.
    ops: Vec<UpdateOp>,
    /// Own writes, for read-your-writes inside the transaction.
    vertex_writes: HashMap<VertexPropKey, PropertyValue>,
    edge_writes: HashMap<EdgeKey, Vec<u8>>,
    tombstoned: HashSet<EdgeKey>,
    finished: bool,
}

impl<'a> UpdateTransaction<'a> {
    pub(crate) fn new(
        graph: &'a MutablePropertyFragment,
        overlays: &'a OverlayStore,
        version: &'a VersionManager,
        wal: &'a mut WalWriter,
        alloc: &'a mut ArenaAllocator,
        ts: Timestamp,
    ) -> Self {
        Self {
            graph,
            overlays,
            version,
            wal,
            alloc,
            ts,
            ops: Vec::new(),
            vertex_writes: HashMap::new(),
            edge_writes: HashMap::new(),
            tombstoned: HashSet::new(),
            finished: false,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    /// Overwrites one vertex property.
    pub fn set_vertex_property(
        &mut self,
        label: LabelId,
        vid: Vid,
        prop: &str,
        value: PropertyValue,
    ) -> CResult<()> {
        let def = self.graph.schema().vertex_label(label)?;
        let prop_idx = self.graph.schema().prop_index(label, prop)?;
        if !value.matches(def.prop_types[prop_idx]) {
            return Err(Error::InvalidInput(format!(
                "label {:?}: {:?} does not fit {:?}",
                def.name, value, def.prop_types[prop_idx]
            )));
        }
        if vid as usize >= self.graph.vertex_num(label)? {
            return Err(Error::NotFound(format!("vid {} of label {:?}", vid, def.name)));
        }
        let key = (label, vid, prop_idx as u16);
        self.vertex_writes.insert(key, value.clone());
        self.ops.push(UpdateOp::VertexProp { label, vid, prop_idx: prop_idx as u16, value });
        Ok(())
    }

    /// Reads a vertex property: own writes first, then the latest committed
    /// state.
    pub fn get_vertex_property(&self, label: LabelId, vid: Vid, prop: &str) -> CResult<PropertyValue> {
        let prop_idx = self.graph.schema().prop_index(label, prop)?;
        let key = (label, vid, prop_idx as u16);
        if let Some(value) = self.vertex_writes.get(&key) {
            return Ok(value.clone());
        }
        if let Some(value) = self.overlays.vertex_at(&key, self.version.committed())? {
            return Ok(value);
        }
        self.graph.get_vertex_prop(label, vid, prop_idx)
    }

    /// Overwrites the payload of an existing edge (both adjacency copies).
    pub fn set_edge_property(
        &mut self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
        props: &[PropertyValue],
    ) -> CResult<()> {
        let idx = self.graph.schema().triplet_index(src_label, dst_label, elabel)?;
        let data = encode_record(&self.graph.schema().triplet(idx).prop_types, props)?;
        let key = EdgeKey { src_label, src_vid, dst_label, dst_vid, elabel };
        if self.tombstoned.contains(&key) {
            return Err(Error::NotFound("edge was tombstoned in this transaction".to_string()));
        }
        if !self.graph.edge_exists(src_label, src_vid, dst_label, dst_vid, elabel)? {
            return Err(Error::NotFound(format!(
                "edge {} -> {} of triplet ({}, {}, {})",
                src_vid, dst_vid, src_label, dst_label, elabel
            )));
        }
        self.edge_writes.insert(key, data.clone());
        self.ops.push(UpdateOp::EdgeProp { src_label, src_vid, dst_label, dst_vid, elabel, data });
        Ok(())
    }

    pub fn get_edge_property(
        &self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
    ) -> CResult<Vec<u8>> {
        let key = EdgeKey { src_label, src_vid, dst_label, dst_vid, elabel };
        if self.tombstoned.contains(&key) {
            return Err(Error::NotFound("edge was tombstoned in this transaction".to_string()));
        }
        if let Some(data) = self.edge_writes.get(&key) {
            return Ok(data.clone());
        }
        let committed = self.version.committed();
        if let Some(data) = self.overlays.edge_at(&key, committed)? {
            return Ok(data);
        }
        let nbrs = self.graph.get_outgoing_edges(src_label, src_vid, dst_label, elabel, committed)?;
        nbrs.into_iter()
            .find(|n| n.neighbor == dst_vid)
            .map(|n| n.data)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "edge {} -> {} of triplet ({}, {}, {})",
                    src_vid, dst_vid, src_label, dst_label, elabel
                ))
            })
    }

    /// Marks an edge deleted. The slot is reclaimed later by compaction.
    pub fn tombstone_edge(
        &mut self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
    ) -> CResult<()> {
        self.graph.schema().triplet_index(src_label, dst_label, elabel)?;
        let key = EdgeKey { src_label, src_vid, dst_label, dst_vid, elabel };
        if !self.tombstoned.contains(&key)
            && !self.graph.edge_exists(src_label, src_vid, dst_label, dst_vid, elabel)?
        {
            return Err(Error::NotFound(format!(
                "edge {} -> {} of triplet ({}, {}, {})",
                src_vid, dst_vid, src_label, dst_label, elabel
            )));
        }
        self.tombstoned.insert(key);
        self.ops.push(UpdateOp::EdgeTombstone { src_label, src_vid, dst_label, dst_vid, elabel });
        Ok(())
    }

    /// Applies a prebuilt delta list and commits in one go.
    pub fn batch_commit(mut self, batch: UpdateBatch) -> CResult<()> {
        for op in batch.ops {
            match op {
                BatchOp::VertexProp { label, oid, prop, value } => {
                    let label = self.graph.schema().vertex_label_id(&label)?;
                    let vid = self.graph.lookup(label, &oid)?;
                    self.set_vertex_property(label, vid, &prop, value)?;
                }
                BatchOp::EdgeProp { src_label, src_oid, dst_label, dst_oid, edge, props } => {
                    let (src_label, src_vid, dst_label, dst_vid, elabel) =
                        self.resolve_edge(&src_label, &src_oid, &dst_label, &dst_oid, &edge)?;
                    self.set_edge_property(src_label, src_vid, dst_label, dst_vid, elabel, &props)?;
                }
                BatchOp::EdgeTombstone { src_label, src_oid, dst_label, dst_oid, edge } => {
                    let (src_label, src_vid, dst_label, dst_vid, elabel) =
                        self.resolve_edge(&src_label, &src_oid, &dst_label, &dst_oid, &edge)?;
                    self.tombstone_edge(src_label, src_vid, dst_label, dst_vid, elabel)?;
                }
            }
        }
        self.commit()
    }

    fn resolve_edge(
        &self,
        src_label: &str,
        src_oid: &Oid,
        dst_label: &str,
        dst_oid: &Oid,
        edge: &str,
    ) -> CResult<(LabelId, Vid, LabelId, Vid, LabelId)> {
        let schema = self.graph.schema();
        let src_label = schema.vertex_label_id(src_label)?;
        let dst_label = schema.vertex_label_id(dst_label)?;
        let elabel = schema.edge_label_id(edge)?;
        let src_vid = self.graph.lookup(src_label, src_oid)?;
        let dst_vid = self.graph.lookup(dst_label, dst_oid)?;
        Ok((src_label, src_vid, dst_label, dst_vid, elabel))
    }

    pub fn commit(mut self) -> CResult<()> {
        self.finished = true;
        let ops = std::mem::take(&mut self.ops);
        commit_update_ops(
            self.graph,
            self.overlays,
            self.version,
            &mut *self.wal,
            &mut *self.alloc,
            self.ts,
            &ops,
        )
    }

    /// Discards the overlay.
    pub fn abort(mut self) {
        self.finished = true;
        let _ = self.version.release_write_timestamp(self.ts);
    }
}

impl Drop for UpdateTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.version.release_write_timestamp(self.ts);
        }
    }
}

/// A prebuilt delta list for `batch_commit`, addressed by label names and
/// primary keys so it can be built without touching the store.
#[derive(Default)]
pub struct UpdateBatch {
    ops: Vec<BatchOp>,
}

enum BatchOp {
    VertexProp {
        label: String,
        oid: Oid,
        prop: String,
        value: PropertyValue,
    },
    EdgeProp {
        src_label: String,
        src_oid: Oid,
        dst_label: String,
        dst_oid: Oid,
        edge: String,
        props: Vec<PropertyValue>,
    },
    EdgeTombstone {
        src_label: String,
        src_oid: Oid,
        dst_label: String,
        dst_oid: Oid,
        edge: String,
    },
}

impl UpdateBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overwrite_vertex(&mut self, label: &str, oid: Oid, prop: &str, value: PropertyValue) {
        self.ops.push(BatchOp::VertexProp {
            label: label.to_string(),
            oid,
            prop: prop.to_string(),
            value,
        });
    }

    pub fn overwrite_edge(
        &mut self,
        src_label: &str,
        src_oid: Oid,
        dst_label: &str,
        dst_oid: Oid,
        edge: &str,
        props: Vec<PropertyValue>,
    ) {
        self.ops.push(BatchOp::EdgeProp {
            src_label: src_label.to_string(),
            src_oid,
            dst_label: dst_label.to_string(),
            dst_oid,
            edge: edge.to_string(),
            props,
        });
    }

    pub fn tombstone_edge(
        &mut self,
        src_label: &str,
        src_oid: Oid,
        dst_label: &str,
        dst_oid: Oid,
        edge: &str,
    ) {
        self.ops.push(BatchOp::EdgeTombstone {
            src_label: src_label.to_string(),
            src_oid,
            dst_label: dst_label.to_string(),
            dst_oid,
            edge: edge.to_string(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

fn apply_update_op(
    op: &UpdateOp,
    graph: &MutablePropertyFragment,
    overlays: &OverlayStore,
    ts: Timestamp,
) -> CResult<()> {
    match op {
        UpdateOp::VertexProp { label, vid, prop_idx, value } => {
            overlays.put_vertex((*label, *vid, *prop_idx), ts, value.clone())?;
        }
        UpdateOp::EdgeProp { src_label, src_vid, dst_label, dst_vid, elabel, data } => {
            overlays.put_edge(
                EdgeKey {
                    src_label: *src_label,
                    src_vid: *src_vid,
                    dst_label: *dst_label,
                    dst_vid: *dst_vid,
                    elabel: *elabel,
                },
                ts,
                data.clone(),
            )?;
        }
        UpdateOp::EdgeTombstone { src_label, src_vid, dst_label, dst_vid, elabel } => {
            graph.tombstone_edge(*src_label, *src_vid, *dst_label, *dst_vid, *elabel, ts)?;
        }
    }
    Ok(())
}

/// Shared by update and compact commits: one WAL record, then publish.
pub(crate) fn commit_update_ops(
    graph: &MutablePropertyFragment,
    overlays: &OverlayStore,
    version: &VersionManager,
    wal: &mut WalWriter,
    alloc: &mut ArenaAllocator,
    ts: Timestamp,
    ops: &[UpdateOp],
) -> CResult<()> {
    version.wait_for_turn(ts)?;
    let result = (|| -> CResult<()> {
        let mut buf = alloc.acquire();
        wal::encode_update_body(ops, &mut buf);
        let appended = wal.append(ts, wal::KIND_UPDATE, &buf).and_then(|_| wal.flush());
        alloc.release(buf);
        appended?;
        for op in ops {
            apply_update_op(op, graph, overlays, ts)?;
        }
        Ok(())
    })();
    version.release_write_timestamp(ts)?;
    result
}
