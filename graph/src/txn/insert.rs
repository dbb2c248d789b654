//! Insert-family transactions.
//!
//! The batch flavor buffers operations until commit; the two single-shot
//! flavors stage exactly one operation. All three share the same commit
//! protocol: wait for the FIFO turn, validate the whole batch against the
//! now-stable fragment, append and fsync one WAL record, apply in operation
//! order, publish. A validation failure aborts atomically before any WAL or
//! fragment byte is written.

use std::collections::{HashMap, HashSet};

use crate::alloc::ArenaAllocator;
use crate::error::{CResult, Error};
use crate::graph::MutablePropertyFragment;
use crate::property::types::{encode_record, LabelId, Oid, PropertyValue, Vid};
use crate::version::{Timestamp, VersionManager};
use crate::wal::{self, InsertOp, WalWriter};

pub struct InsertTransaction<'a> {
    graph: &'a MutablePropertyFragment,
    version: &'a VersionManager,
    wal: &'a mut WalWriter,
    alloc: &'a mut ArenaAllocator,
    ts: Timestamp,
    ops: Vec<InsertOp>,
    finished: bool,
}

impl<'a> InsertTransaction<'a> {
    pub(crate) fn new(
        graph: &'a MutablePropertyFragment,
        version: &'a VersionManager,
        wal: &'a mut WalWriter,
        alloc: &'a mut ArenaAllocator,
        ts: Timestamp,
    ) -> Self {
        Self { graph, version, wal, alloc, ts, ops: Vec::new(), finished: false }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    /// Buffers an AddVertex. Shape errors (unknown label, wrong key or
    /// property types) surface immediately; duplicate keys only at commit.
    pub fn add_vertex(&mut self, label: LabelId, oid: Oid, props: Vec<PropertyValue>) -> CResult<()> {
        check_vertex_shape(self.graph, label, &oid, &props)?;
        self.ops.push(InsertOp::AddVertex { label, oid, props });
        Ok(())
    }

    /// Buffers an AddEdge between primary keys. Endpoints may be created by
    /// this same transaction.
    pub fn add_edge(
        &mut self,
        src_label: LabelId,
        src_oid: Oid,
        dst_label: LabelId,
        dst_oid: Oid,
        elabel: LabelId,
        props: &[PropertyValue],
    ) -> CResult<()> {
        let data = encode_edge_payload(self.graph, src_label, dst_label, elabel, props)?;
        self.ops.push(InsertOp::AddEdge { src_label, src_oid, dst_label, dst_oid, elabel, data });
        Ok(())
    }

    pub fn commit(mut self) -> CResult<()> {
        self.finished = true;
        let ops = std::mem::take(&mut self.ops);
        commit_insert_ops(self.graph, self.version, &mut *self.wal, &mut *self.alloc, self.ts, &ops)
    }

    pub fn abort(mut self) {
        self.finished = true;
        let _ = self.version.release_write_timestamp(self.ts);
    }
}

impl Drop for InsertTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.version.release_write_timestamp(self.ts);
        }
    }
}

/// Fast path for exactly one AddVertex: no batch buffering.
pub struct SingleVertexInsertTransaction<'a> {
    graph: &'a MutablePropertyFragment,
    version: &'a VersionManager,
    wal: &'a mut WalWriter,
    alloc: &'a mut ArenaAllocator,
    ts: Timestamp,
    op: Option<InsertOp>,
    finished: bool,
}

impl<'a> SingleVertexInsertTransaction<'a> {
    pub(crate) fn new(
        graph: &'a MutablePropertyFragment,
        version: &'a VersionManager,
        wal: &'a mut WalWriter,
        alloc: &'a mut ArenaAllocator,
        ts: Timestamp,
    ) -> Self {
        Self { graph, version, wal, alloc, ts, op: None, finished: false }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    pub fn add_vertex(&mut self, label: LabelId, oid: Oid, props: Vec<PropertyValue>) -> CResult<()> {
        if self.op.is_some() {
            return Err(Error::InvalidInput(
                "single-vertex transaction already staged its vertex".to_string(),
            ));
        }
        check_vertex_shape(self.graph, label, &oid, &props)?;
        self.op = Some(InsertOp::AddVertex { label, oid, props });
        Ok(())
    }

    pub fn commit(mut self) -> CResult<()> {
        self.finished = true;
        let ops: Vec<InsertOp> = self.op.take().into_iter().collect();
        commit_insert_ops(self.graph, self.version, &mut *self.wal, &mut *self.alloc, self.ts, &ops)
    }

    pub fn abort(mut self) {
        self.finished = true;
        let _ = self.version.release_write_timestamp(self.ts);
    }
}

impl Drop for SingleVertexInsertTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.version.release_write_timestamp(self.ts);
        }
    }
}

/// Fast path for exactly one AddEdge.
pub struct SingleEdgeInsertTransaction<'a> {
    graph: &'a MutablePropertyFragment,
    version: &'a VersionManager,
    wal: &'a mut WalWriter,
    alloc: &'a mut ArenaAllocator,
    ts: Timestamp,
    op: Option<InsertOp>,
    finished: bool,
}

impl<'a> SingleEdgeInsertTransaction<'a> {
    pub(crate) fn new(
        graph: &'a MutablePropertyFragment,
        version: &'a VersionManager,
        wal: &'a mut WalWriter,
        alloc: &'a mut ArenaAllocator,
        ts: Timestamp,
    ) -> Self {
        Self { graph, version, wal, alloc, ts, op: None, finished: false }
    }

    pub fn timestamp(&self) -> Timestamp {
        self.ts
    }

    pub fn add_edge(
        &mut self,
        src_label: LabelId,
        src_oid: Oid,
        dst_label: LabelId,
        dst_oid: Oid,
        elabel: LabelId,
        props: &[PropertyValue],
    ) -> CResult<()> {
        if self.op.is_some() {
            return Err(Error::InvalidInput(
                "single-edge transaction already staged its edge".to_string(),
            ));
        }
        let data = encode_edge_payload(self.graph, src_label, dst_label, elabel, props)?;
        self.op = Some(InsertOp::AddEdge { src_label, src_oid, dst_label, dst_oid, elabel, data });
        Ok(())
    }

    pub fn commit(mut self) -> CResult<()> {
        self.finished = true;
        let ops: Vec<InsertOp> = self.op.take().into_iter().collect();
        commit_insert_ops(self.graph, self.version, &mut *self.wal, &mut *self.alloc, self.ts, &ops)
    }

    pub fn abort(mut self) {
        self.finished = true;
        let _ = self.version.release_write_timestamp(self.ts);
    }
}

impl Drop for SingleEdgeInsertTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.version.release_write_timestamp(self.ts);
        }
    }
}

fn check_vertex_shape(
    graph: &MutablePropertyFragment,
    label: LabelId,
    oid: &Oid,
    props: &[PropertyValue],
) -> CResult<()> {
    let def = graph.schema().vertex_label(label)?;
    if oid.property_type() != def.pk_type {
        return Err(Error::InvalidInput(format!(
            "label {:?} keys are {:?}, got {:?}",
            def.name,
            def.pk_type,
            oid.property_type()
        )));
    }
    if props.len() != def.prop_types.len() {
        return Err(Error::InvalidInput(format!(
            "label {:?} declares {} properties, got {}",
            def.name,
            def.prop_types.len(),
            props.len()
        )));
    }
    for (value, ty) in props.iter().zip(&def.prop_types) {
        if !value.matches(*ty) {
            return Err(Error::InvalidInput(format!(
                "label {:?}: {:?} does not fit {:?}",
                def.name, value, ty
            )));
        }
    }
    Ok(())
}

fn encode_edge_payload(
    graph: &MutablePropertyFragment,
    src_label: LabelId,
    dst_label: LabelId,
    elabel: LabelId,
    props: &[PropertyValue],
) -> CResult<Vec<u8>> {
    let idx = graph.schema().triplet_index(src_label, dst_label, elabel)?;
    encode_record(&graph.schema().triplet(idx).prop_types, props)
}

/// Edge endpoint during batch validation: already in the fragment, or
/// created earlier in the same batch.
#[derive(Clone, PartialEq, Eq, Hash)]
enum Endpoint {
    Existing(Vid),
    New(Oid),
}

/// Full-batch validation against the fragment, run while the transaction
/// holds the apply turn (nothing can change underneath). On success the
/// batch is guaranteed to apply without error.
fn validate_insert_ops(graph: &MutablePropertyFragment, ops: &[InsertOp]) -> CResult<()> {
    let schema = graph.schema();
    let mut pending: HashMap<LabelId, HashSet<Oid>> = HashMap::new();
    let mut single_taken: HashSet<(usize, bool, Endpoint)> = HashSet::new();

    let resolve = |pending: &HashMap<LabelId, HashSet<Oid>>,
                   label: LabelId,
                   oid: &Oid|
     -> CResult<Endpoint> {
        match graph.lookup(label, oid) {
            Ok(vid) => Ok(Endpoint::Existing(vid)),
            Err(Error::NotFound(_)) => {
                if pending.get(&label).map(|set| set.contains(oid)).unwrap_or(false) {
                    Ok(Endpoint::New(oid.clone()))
                } else {
                    Err(Error::NotFound(format!("oid {} of label {}", oid, label)))
                }
            }
            Err(err) => Err(err),
        }
    };

    for op in ops {
        match op {
            InsertOp::AddVertex { label, oid, props } => {
                check_vertex_shape(graph, *label, oid, props)?;
                if graph.lookup(*label, oid).is_ok() {
                    return Err(Error::DuplicateKey(format!("oid {}", oid)));
                }
                let set = pending.entry(*label).or_default();
                if !set.insert(oid.clone()) {
                    return Err(Error::DuplicateKey(format!("oid {} (within batch)", oid)));
                }
                let projected = graph.vertex_num(*label)? + set.len();
                let def = schema.vertex_label(*label)?;
                if projected > def.max_vnum {
                    return Err(Error::InvalidInput(format!(
                        "label {:?} is full ({} vertices)",
                        def.name, def.max_vnum
                    )));
                }
            }
            InsertOp::AddEdge { src_label, src_oid, dst_label, dst_oid, elabel, data } => {
                let idx = schema.triplet_index(*src_label, *dst_label, *elabel)?;
                let triplet = schema.triplet(idx);
                let width = crate::property::types::record_width(&triplet.prop_types)?;
                if data.len() != width {
                    return Err(Error::InvalidInput(format!(
                        "edge payload is {} bytes, triplet expects {}",
                        data.len(),
                        width
                    )));
                }
                let src = resolve(&pending, *src_label, src_oid)?;
                let dst = resolve(&pending, *dst_label, dst_oid)?;
                if triplet.out_strategy == crate::schema::EdgeStrategy::Single {
                    if let Endpoint::Existing(vid) = src {
                        graph.check_out_slot(*src_label, *dst_label, *elabel, vid)?;
                    }
                    if !single_taken.insert((idx, true, src.clone())) {
                        return Err(Error::InvalidInput(
                            "two edges in one batch target the same single out-slot".to_string(),
                        ));
                    }
                }
                if triplet.in_strategy == crate::schema::EdgeStrategy::Single {
                    if let Endpoint::Existing(vid) = dst {
                        graph.check_in_slot(*src_label, *dst_label, *elabel, vid)?;
                    }
                    if !single_taken.insert((idx, false, dst.clone())) {
                        return Err(Error::InvalidInput(
                            "two edges in one batch target the same single in-slot".to_string(),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

fn apply_insert_op(graph: &MutablePropertyFragment, op: &InsertOp, ts: Timestamp) -> CResult<()> {
    match op {
        InsertOp::AddVertex { label, oid, props } => {
            graph.add_vertex(*label, oid.clone(), props, ts)?;
        }
        InsertOp::AddEdge { src_label, src_oid, dst_label, dst_oid, elabel, data } => {
            let src_vid = graph.lookup(*src_label, src_oid)?;
            let dst_vid = graph.lookup(*dst_label, dst_oid)?;
            graph.add_edge(*src_label, src_vid, *dst_label, dst_vid, *elabel, data, ts)?;
        }
    }
    Ok(())
}

/// The shared commit protocol. Always releases the write timestamp, so the
/// publish frontier keeps moving whether the commit succeeds, fails
/// validation or fails durability.
pub(crate) fn commit_insert_ops(
    graph: &MutablePropertyFragment,
    version: &VersionManager,
    wal: &mut WalWriter,
    alloc: &mut ArenaAllocator,
    ts: Timestamp,
    ops: &[InsertOp],
) -> CResult<()> {
    version.wait_for_turn(ts)?;
    let result = (|| -> CResult<()> {
        if !ops.is_empty() {
            validate_insert_ops(graph, ops)?;
        }
        let mut buf = alloc.acquire();
        wal::encode_insert_body(ops, &mut buf);
        let appended = wal.append(ts, wal::KIND_INSERT, &buf).and_then(|_| wal.flush());
        alloc.release(buf);
        appended?;
        for op in ops {
            apply_insert_op(graph, op, ts)?;
        }
        Ok(())
    })();
    version.release_write_timestamp(ts)?;
    result
}
