//! Committed update-transaction overlays.
//!
//! Update transactions never touch base storage at commit; they publish
//! their property overwrites here, keyed by the commit timestamp. Readers
//! consult the overlay after base storage: a version is visible when its
//! timestamp is at or below the read timestamp. Compaction folds versions no
//! reader can distinguish from base state into the fragment and drops them.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::CResult;
use crate::graph::MutablePropertyFragment;
use crate::property::types::{LabelId, PropertyValue, Vid};
use crate::version::Timestamp;

/// Identity of a logical edge for update addressing. Parallel edges sharing
/// all five components share their update identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EdgeKey {
    pub src_label: LabelId,
    pub src_vid: Vid,
    pub dst_label: LabelId,
    pub dst_vid: Vid,
    pub elabel: LabelId,
}

/// `(label, vid, prop_idx)` of an overwritten vertex property.
pub type VertexPropKey = (LabelId, Vid, u16);

pub struct OverlayStore {
    vertex: RwLock<HashMap<VertexPropKey, Vec<(Timestamp, PropertyValue)>>>,
    edge: RwLock<HashMap<EdgeKey, Vec<(Timestamp, Vec<u8>)>>>,
}

fn latest_at<T: Clone>(versions: &[(Timestamp, T)], read_ts: Timestamp) -> Option<T> {
    versions
        .iter()
        .rev()
        .find(|(ts, _)| *ts <= read_ts)
        .map(|(_, v)| v.clone())
}

fn insert_sorted<T>(versions: &mut Vec<(Timestamp, T)>, ts: Timestamp, value: T) {
    let pos = versions.partition_point(|(t, _)| *t <= ts);
    versions.insert(pos, (ts, value));
}

impl OverlayStore {
    pub fn new() -> Self {
        Self { vertex: RwLock::new(HashMap::new()), edge: RwLock::new(HashMap::new()) }
    }

    pub fn put_vertex(&self, key: VertexPropKey, ts: Timestamp, value: PropertyValue) -> CResult<()> {
        let mut vertex = self.vertex.write()?;
        insert_sorted(vertex.entry(key).or_default(), ts, value);
        Ok(())
    }

    /// Latest overwrite of the property at or below `read_ts`, if any.
    pub fn vertex_at(&self, key: &VertexPropKey, read_ts: Timestamp) -> CResult<Option<PropertyValue>> {
        let vertex = self.vertex.read()?;
        Ok(vertex.get(key).and_then(|versions| latest_at(versions, read_ts)))
    }

    pub fn put_edge(&self, key: EdgeKey, ts: Timestamp, data: Vec<u8>) -> CResult<()> {
        let mut edge = self.edge.write()?;
        insert_sorted(edge.entry(key).or_default(), ts, data);
        Ok(())
    }

    pub fn edge_at(&self, key: &EdgeKey, read_ts: Timestamp) -> CResult<Option<Vec<u8>>> {
        let edge = self.edge.read()?;
        Ok(edge.get(key).and_then(|versions| latest_at(versions, read_ts)))
    }

    /// Folds every version at or below `min_ts` into base storage and drops
    /// it. Returns `(vertex_versions, edge_versions)` folded.
    pub fn gc(&self, min_ts: Timestamp, fragment: &MutablePropertyFragment) -> CResult<(usize, usize)> {
        let mut folded_vertices = 0;
        {
            let mut vertex = self.vertex.write()?;
            for ((label, vid, prop_idx), versions) in vertex.iter_mut() {
                if let Some(value) = latest_at(versions, min_ts) {
                    fragment.set_vertex_prop(*label, *vid, *prop_idx as usize, &value)?;
                }
                let before = versions.len();
                versions.retain(|(ts, _)| *ts > min_ts);
                folded_vertices += before - versions.len();
            }
            vertex.retain(|_, versions| !versions.is_empty());
        }

        let mut folded_edges = 0;
        {
            let mut edge = self.edge.write()?;
            for (key, versions) in edge.iter_mut() {
                if let Some(data) = latest_at(versions, min_ts) {
                    fragment.fold_edge_data(
                        key.src_label,
                        key.src_vid,
                        key.dst_label,
                        key.dst_vid,
                        key.elabel,
                        &data,
                    )?;
                }
                let before = versions.len();
                versions.retain(|(ts, _)| *ts > min_ts);
                folded_edges += before - versions.len();
            }
            edge.retain(|_, versions| !versions.is_empty());
        }
        Ok((folded_vertices, folded_edges))
    }

    pub fn version_count(&self) -> usize {
        let vertex = self.vertex.read().map(|v| v.values().map(Vec::len).sum()).unwrap_or(0);
        let edge: usize = self.edge.read().map(|e| e.values().map(Vec::len).sum()).unwrap_or(0);
        vertex + edge
    }
}

impl Default for OverlayStore {
    fn default() -> Self {
        Self::new()
    }
}
