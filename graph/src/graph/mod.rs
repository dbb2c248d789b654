//! The mutable fragment: every vertex table, every adjacency structure and
//! every primary-key index, composed behind one facade. All mutation flows
//! through transaction objects; the fragment itself only checks structural
//! invariants (label existence, id ranges, payload widths).

pub mod csr;
pub mod table;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::graph::csr::{Csr, Nbr};
use crate::graph::table::VertexTable;
use crate::index::PrimaryIndex;
use crate::property::types::{record_width, LabelId, Oid, PropertyValue, Vid};
use crate::schema::Schema;
use crate::snapshot;
use crate::version::Timestamp;

pub struct MutablePropertyFragment {
    schema: Schema,
    indexers: Vec<PrimaryIndex>,
    tables: Vec<VertexTable>,
    /// Outgoing / incoming adjacency, one per schema triplet.
    oe: Vec<Csr>,
    ie: Vec<Csr>,
}

impl std::fmt::Debug for MutablePropertyFragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutablePropertyFragment").field("schema", &self.schema).finish()
    }
}

/// The payload of `init_snapshot.bin`: the schema plus the per-label
/// creation-timestamp columns. Keys, properties and adjacency live in their
/// own files.
#[derive(Serialize, Deserialize)]
struct FragmentMeta {
    schema: Schema,
    create_ts: Vec<Vec<Timestamp>>,
}

impl MutablePropertyFragment {
    pub fn new(schema: Schema) -> Self {
        let mut indexers = Vec::with_capacity(schema.vertex_label_num());
        let mut tables = Vec::with_capacity(schema.vertex_label_num());
        for label in 0..schema.vertex_label_num() {
            if let Ok(def) = schema.vertex_label(label as LabelId) {
                indexers.push(PrimaryIndex::new(def.pk_type));
                tables.push(VertexTable::new(def.clone()));
            }
        }
        let mut oe = Vec::with_capacity(schema.triplets().len());
        let mut ie = Vec::with_capacity(schema.triplets().len());
        for t in schema.triplets() {
            let src_cap = schema.vertex_label(t.src).map(|d| d.max_vnum).unwrap_or(0);
            let dst_cap = schema.vertex_label(t.dst).map(|d| d.max_vnum).unwrap_or(0);
            oe.push(Csr::new(t.out_strategy, src_cap));
            ie.push(Csr::new(t.in_strategy, dst_cap));
        }
        Self { schema, indexers, tables, oe, ie }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn indexer(&self, label: LabelId) -> CResult<&PrimaryIndex> {
        self.indexers
            .get(label as usize)
            .ok_or_else(|| Error::NotFound(format!("vertex label id {}", label)))
    }

    pub fn table(&self, label: LabelId) -> CResult<&VertexTable> {
        self.tables
            .get(label as usize)
            .ok_or_else(|| Error::NotFound(format!("vertex label id {}", label)))
    }

    pub fn vertex_num(&self, label: LabelId) -> CResult<usize> {
        Ok(self.table(label)?.vertex_num())
    }

    pub fn visible_vertex_num(&self, label: LabelId, read_ts: Timestamp) -> CResult<usize> {
        self.table(label)?.visible_vertex_num(read_ts)
    }

    pub fn lookup(&self, label: LabelId, oid: &Oid) -> CResult<Vid> {
        self.indexer(label)?.lookup(oid)
    }

    pub fn oid(&self, label: LabelId, vid: Vid) -> CResult<Oid> {
        self.indexer(label)?.oid(vid)
    }

    /// Assigns a vid to `oid` and makes the row exist, without writing any
    /// property. WAL replay uses this directly so vid assignment stays a
    /// sequential, deterministic pass.
    pub fn register_vertex(&self, label: LabelId, oid: Oid, ts: Timestamp) -> CResult<Vid> {
        let table = self.table(label)?;
        let indexer = self.indexer(label)?;
        if indexer.len() >= table.def().max_vnum {
            return Err(Error::InvalidInput(format!(
                "label {:?} is full ({} vertices)",
                table.def().name,
                table.def().max_vnum
            )));
        }
        let vid = indexer.insert(oid)?;
        let row = table.append_row(ts)?;
        if row != vid {
            return Err(Error::Internal(format!(
                "keys column and vertex table diverged: vid {} vs row {}",
                vid, row
            )));
        }
        Ok(vid)
    }

    pub fn get_vertex_prop(&self, label: LabelId, vid: Vid, prop_idx: usize) -> CResult<PropertyValue> {
        self.table(label)?.get_prop(vid, prop_idx)
    }

    pub fn set_vertex_prop(
        &self,
        label: LabelId,
        vid: Vid,
        prop_idx: usize,
        value: &PropertyValue,
    ) -> CResult<()> {
        self.table(label)?.set_prop(vid, prop_idx, value)
    }

    /// Creates a vertex with all of its declared properties.
    pub fn add_vertex(
        &self,
        label: LabelId,
        oid: Oid,
        props: &[PropertyValue],
        ts: Timestamp,
    ) -> CResult<Vid> {
        let def = self.schema.vertex_label(label)?;
        if props.len() != def.prop_types.len() {
            return Err(Error::InvalidInput(format!(
                "label {:?} declares {} properties, got {}",
                def.name,
                def.prop_types.len(),
                props.len()
            )));
        }
        let vid = self.register_vertex(label, oid, ts)?;
        for (idx, value) in props.iter().enumerate() {
            self.set_vertex_prop(label, vid, idx, value)?;
        }
        Ok(vid)
    }

    fn triplet_stores(
        &self,
        src_label: LabelId,
        dst_label: LabelId,
        elabel: LabelId,
    ) -> CResult<(usize, &Csr, &Csr)> {
        let idx = self.schema.triplet_index(src_label, dst_label, elabel)?;
        Ok((idx, &self.oe[idx], &self.ie[idx]))
    }

    /// Pre-checks a single-strategy outgoing slot without writing anything.
    pub fn check_out_slot(
        &self,
        src_label: LabelId,
        dst_label: LabelId,
        elabel: LabelId,
        src_vid: Vid,
    ) -> CResult<()> {
        let (_, oe, _) = self.triplet_stores(src_label, dst_label, elabel)?;
        oe.check_slot_free(src_vid)
    }

    /// Pre-checks a single-strategy incoming slot without writing anything.
    pub fn check_in_slot(
        &self,
        src_label: LabelId,
        dst_label: LabelId,
        elabel: LabelId,
        dst_vid: Vid,
    ) -> CResult<()> {
        let (_, _, ie) = self.triplet_stores(src_label, dst_label, elabel)?;
        ie.check_slot_free(dst_vid)
    }

    /// Stores one edge in both directions. The payload must be exactly the
    /// triplet's declared record width.
    pub fn add_edge(
        &self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
        data: &[u8],
        ts: Timestamp,
    ) -> CResult<()> {
        let (idx, oe, ie) = self.triplet_stores(src_label, dst_label, elabel)?;
        let width = record_width(&self.schema.triplet(idx).prop_types)?;
        if data.len() != width {
            return Err(Error::InvalidInput(format!(
                "edge payload is {} bytes, triplet expects {}",
                data.len(),
                width
            )));
        }
        if src_vid as usize >= self.vertex_num(src_label)? {
            return Err(Error::NotFound(format!("source vid {}", src_vid)));
        }
        if dst_vid as usize >= self.vertex_num(dst_label)? {
            return Err(Error::NotFound(format!("destination vid {}", dst_vid)));
        }
        // Validate single-slot availability in both directions before
        // touching either, so a refusal leaves no half-written edge.
        oe.check_slot_free(src_vid)?;
        ie.check_slot_free(dst_vid)?;
        oe.put_edge(src_vid, Nbr::new(dst_vid, ts, data.to_vec()))?;
        ie.put_edge(dst_vid, Nbr::new(src_vid, ts, data.to_vec()))?;
        Ok(())
    }

    /// Entries of `src_vid` visible at `read_ts`, insertion order, no locks
    /// held by the returned buffer.
    pub fn get_outgoing_edges(
        &self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        elabel: LabelId,
        read_ts: Timestamp,
    ) -> CResult<Vec<Nbr>> {
        let (_, oe, _) = self.triplet_stores(src_label, dst_label, elabel)?;
        oe.snapshot(src_vid, read_ts)
    }

    pub fn get_incoming_edges(
        &self,
        dst_label: LabelId,
        dst_vid: Vid,
        src_label: LabelId,
        elabel: LabelId,
        read_ts: Timestamp,
    ) -> CResult<Vec<Nbr>> {
        let (_, _, ie) = self.triplet_stores(src_label, dst_label, elabel)?;
        ie.snapshot(dst_vid, read_ts)
    }

    /// Any live `src -> dst` edge in the triplet?
    pub fn edge_exists(
        &self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
    ) -> CResult<bool> {
        let (idx, oe, ie) = self.triplet_stores(src_label, dst_label, elabel)?;
        match self.schema.triplet(idx).out_strategy {
            crate::schema::EdgeStrategy::None => ie.contains(dst_vid, src_vid),
            _ => oe.contains(src_vid, dst_vid),
        }
    }

    /// Marks every live `src -> dst` edge tombstoned at `ts`, in both
    /// directions; returns the number of logical edges marked.
    pub fn tombstone_edge(
        &self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
        ts: Timestamp,
    ) -> CResult<usize> {
        let (_, oe, ie) = self.triplet_stores(src_label, dst_label, elabel)?;
        let out = oe.tombstone(src_vid, dst_vid, ts)?;
        let inc = ie.tombstone(dst_vid, src_vid, ts)?;
        Ok(out.max(inc))
    }

    /// Overwrites the base payload of every live `src -> dst` edge in both
    /// directions (compaction folding an overlay in).
    pub fn fold_edge_data(
        &self,
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
        data: &[u8],
    ) -> CResult<usize> {
        let (_, oe, ie) = self.triplet_stores(src_label, dst_label, elabel)?;
        let out = oe.set_data(src_vid, dst_vid, data)?;
        let inc = ie.set_data(dst_vid, src_vid, data)?;
        Ok(out.max(inc))
    }

    /// Physically drops adjacency entries no reader at or after `min_ts` can
    /// observe. Returns the number of reclaimed entries.
    pub fn reclaim(&self, min_ts: Timestamp) -> CResult<usize> {
        let mut dropped = 0;
        for csr in self.oe.iter().chain(self.ie.iter()) {
            dropped += csr.reclaim(min_ts)?;
        }
        Ok(dropped)
    }

    /// Restores timestamp order inside every adjacency list after a parallel
    /// WAL replay range.
    pub fn sort_adjacency_by_ts(&self) -> CResult<()> {
        for csr in self.oe.iter().chain(self.ie.iter()) {
            csr.sort_by_ts()?;
        }
        Ok(())
    }

    pub fn serialize(&self, dir: &Path) -> CResult<()> {
        std::fs::create_dir_all(dir)?;
        let mut create_ts = Vec::with_capacity(self.tables.len());
        for table in &self.tables {
            create_ts.push(table.create_ts_vec()?);
        }
        let meta = FragmentMeta { schema: self.schema.clone(), create_ts };
        let mut w = BufWriter::new(File::create(dir.join(snapshot::INIT_SNAPSHOT))?);
        snapshot::write_header(&mut w)?;
        bincode::serialize_into(&mut w, &meta)?;
        drop(w);

        for (label, (indexer, table)) in self.indexers.iter().zip(&self.tables).enumerate() {
            let name = self.schema.vertex_label_name(label as LabelId)?;
            indexer.serialize(&dir.join(snapshot::keys_file(name)))?;
            table.serialize(dir)?;
        }
        for (idx, triplet) in self.schema.triplets().iter().enumerate() {
            let src = self.schema.vertex_label_name(triplet.src)?;
            let dst = self.schema.vertex_label_name(triplet.dst)?;
            let edge = self.schema.edge_label_name(triplet.elabel)?;
            self.oe[idx].serialize(&dir.join(snapshot::adjacency_file(src, dst, edge, true)))?;
            self.ie[idx].serialize(&dir.join(snapshot::adjacency_file(src, dst, edge, false)))?;
        }
        Ok(())
    }

    /// Restores a fragment from a snapshot directory. The snapshot's schema
    /// must be identical to the one the caller opens the database with.
    pub fn deserialize(dir: &Path, expected: &Schema) -> CResult<Self> {
        let meta_path = dir.join(snapshot::INIT_SNAPSHOT);
        let mut r = BufReader::new(File::open(&meta_path)?);
        snapshot::check_header(&mut r, &meta_path)?;
        let mut meta: FragmentMeta = bincode::deserialize_from(&mut r)?;
        meta.schema.rebuild_lookups();
        if &meta.schema != expected {
            return Err(Error::SchemaConflict(
                "snapshot schema does not match the declared schema".to_string(),
            ));
        }

        let fragment = Self::new(meta.schema);
        for (label, table) in fragment.tables.iter().enumerate() {
            let ts = meta.create_ts.get(label).cloned().unwrap_or_default();
            table.set_create_ts_vec(ts)?;
            let name = fragment.schema.vertex_label_name(label as LabelId)?;
            fragment.indexers[label].deserialize(&dir.join(snapshot::keys_file(name)))?;
            table.deserialize(dir)?;
        }
        for (idx, triplet) in fragment.schema.triplets().iter().enumerate() {
            let src = fragment.schema.vertex_label_name(triplet.src)?;
            let dst = fragment.schema.vertex_label_name(triplet.dst)?;
            let edge = fragment.schema.edge_label_name(triplet.elabel)?;
            fragment.oe[idx]
                .deserialize(&dir.join(snapshot::adjacency_file(src, dst, edge, true)))?;
            fragment.ie[idx]
                .deserialize(&dir.join(snapshot::adjacency_file(src, dst, edge, false)))?;
        }
        Ok(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::types::PropertyType;
    use crate::schema::{EdgeStrategy, StorageStrategy};

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
                1024,
            )
            .unwrap();
        schema
            .add_edge_label(
                "person",
                "person",
                "knows",
                vec![PropertyType::Int64],
                vec!["weight".to_string()],
                EdgeStrategy::Multiple,
                EdgeStrategy::Multiple,
            )
            .unwrap();
        schema
    }

    #[test]
    fn vertices_and_edges() -> CResult<()> {
        let g = MutablePropertyFragment::new(sample_schema());
        let u = g.add_vertex(0, Oid::Int64(1), &[PropertyValue::Int64(10)], 1)?;
        let v = g.add_vertex(0, Oid::Int64(2), &[PropertyValue::Int64(20)], 1)?;
        g.add_edge(0, u, 0, v, 0, &7i64.to_be_bytes(), 2)?;

        let out = g.get_outgoing_edges(0, u, 0, 0, 2)?;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].neighbor, v);
        let inc = g.get_incoming_edges(0, v, 0, 0, 2)?;
        assert_eq!(inc.len(), 1);
        assert_eq!(inc[0].neighbor, u);
        // Both copies carry the identical payload.
        assert_eq!(out[0].data, inc[0].data);
        Ok(())
    }

    #[test]
    fn payload_width_is_checked() -> CResult<()> {
        let g = MutablePropertyFragment::new(sample_schema());
        let u = g.add_vertex(0, Oid::Int64(1), &[PropertyValue::Int64(0)], 1)?;
        let v = g.add_vertex(0, Oid::Int64(2), &[PropertyValue::Int64(0)], 1)?;
        let err = g.add_edge(0, u, 0, v, 0, &[1, 2, 3], 2).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        // Nothing was stored.
        assert!(g.get_outgoing_edges(0, u, 0, 0, 2)?.is_empty());
        Ok(())
    }

    #[test]
    fn snapshot_roundtrip_is_identical() -> CResult<()> {
        let dir = tempdir::TempDir::new("fragment")?;
        let schema = sample_schema();
        let g = MutablePropertyFragment::new(schema.clone());
        for i in 0..10i64 {
            g.add_vertex(0, Oid::Int64(i), &[PropertyValue::Int64(i * 2)], 1)?;
        }
        for i in 0..9u32 {
            g.add_edge(0, i, 0, i + 1, 0, &(i as i64).to_be_bytes(), 2)?;
        }
        g.serialize(dir.path())?;

        let restored = MutablePropertyFragment::deserialize(dir.path(), &schema)?;
        assert_eq!(restored.vertex_num(0)?, 10);
        assert_eq!(restored.lookup(0, &Oid::Int64(3))?, 3);
        assert_eq!(restored.get_vertex_prop(0, 3, 0)?, PropertyValue::Int64(6));
        let out = restored.get_outgoing_edges(0, 3, 0, 0, 2)?;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].neighbor, 4);

        // Re-serialization equality.
        let dir2 = tempdir::TempDir::new("fragment2")?;
        restored.serialize(dir2.path())?;
        for entry in std::fs::read_dir(dir.path())? {
            let entry = entry?;
            let a = std::fs::read(entry.path())?;
            let b = std::fs::read(dir2.path().join(entry.file_name()))?;
            assert_eq!(a, b, "{:?} differs", entry.file_name());
        }
        Ok(())
    }

    #[test]
    /// Runs random edge insertions and tombstones against both the fragment
    /// and a known-good in-memory model, comparing the visible adjacency.
    fn random_edges_match_model() -> CResult<()> {
        use rand::Rng;

        let seed: u64 = rand::thread_rng().gen();
        let mut rng: rand::rngs::StdRng = rand::SeedableRng::seed_from_u64(seed);
        println!("seed = {}", seed);

        const VERTICES: u32 = 16;
        const OPS: usize = 500;

        let g = MutablePropertyFragment::new(sample_schema());
        for i in 0..VERTICES {
            g.add_vertex(0, Oid::Int64(i as i64), &[PropertyValue::Int64(0)], 1)?;
        }

        // model[src] holds the live (dst, payload) pairs in insertion order.
        let mut model: Vec<Vec<(u32, i64)>> = vec![Vec::new(); VERTICES as usize];
        let mut ts = 1;
        for _ in 0..OPS {
            ts += 1;
            let src = rng.gen_range(0..VERTICES);
            let dst = rng.gen_range(0..VERTICES);
            if rng.gen::<f64>() < 0.8 || model[src as usize].is_empty() {
                let weight = rng.gen_range(0..1000i64);
                g.add_edge(0, src, 0, dst, 0, &weight.to_be_bytes(), ts)?;
                model[src as usize].push((dst, weight));
            } else {
                let victim = model[src as usize][rng.gen_range(0..model[src as usize].len())].0;
                g.tombstone_edge(0, src, 0, victim, 0, ts)?;
                model[src as usize].retain(|(dst, _)| *dst != victim);
            }
        }

        for src in 0..VERTICES {
            let got: Vec<(u32, i64)> = g
                .get_outgoing_edges(0, src, 0, 0, ts)?
                .into_iter()
                .map(|n| {
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&n.data);
                    (n.neighbor, i64::from_be_bytes(bytes))
                })
                .collect();
            assert_eq!(got, model[src as usize], "source {}", src);
        }
        Ok(())
    }

    #[test]
    fn mismatched_schema_conflicts() -> CResult<()> {
        let dir = tempdir::TempDir::new("fragment")?;
        let g = MutablePropertyFragment::new(sample_schema());
        g.serialize(dir.path())?;

        let mut other = sample_schema();
        other
            .add_vertex_label(
                "company",
                vec![],
                vec![],
                "id",
                PropertyType::Int64,
                vec![],
                16,
            )
            .unwrap();
        let err = MutablePropertyFragment::deserialize(dir.path(), &other).unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));
        Ok(())
    }
}
