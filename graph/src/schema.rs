//! Declarative description of the graph: vertex labels, edge triplets,
//! property types, storage strategies and the stored-procedure directory.
//! The schema is built once, before the database opens, and treated as
//! read-only afterwards.

use std::collections::{BTreeMap, HashMap};

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};
use crate::property::types::{record_width, LabelId, PropertyType};

/// Hard cap on both label id domains.
pub const MAX_LABEL_NUM: usize = 256;

/// Tokens that may not be used as label names. `_ANY_LABEL` is the wildcard
/// understood by the built-in server procedure.
const RESERVED_NAMES: &[&str] = &["_ANY_LABEL"];

/// Where a property column keeps its payload. Both strategies are resident
/// in memory; `MemMap` marks columns whose payload is expected to be rebuilt
/// from its snapshot file rather than from the WAL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageStrategy {
    Memory,
    MemMap,
}

/// Per-direction adjacency strategy of an edge triplet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeStrategy {
    /// At most one edge per endpoint, stored inline.
    Single,
    /// A growable list per endpoint.
    Multiple,
    /// The direction is not maintained at all.
    None,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VertexLabelDef {
    pub name: String,
    pub pk_name: String,
    pub pk_type: PropertyType,
    pub prop_names: Vec<String>,
    pub prop_types: Vec<PropertyType>,
    pub strategies: Vec<StorageStrategy>,
    pub max_vnum: usize,
}

/// One `(src_vlabel, dst_vlabel, edge_label)` triplet and the shape of its
/// per-edge data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeTriplet {
    pub src: LabelId,
    pub dst: LabelId,
    pub elabel: LabelId,
    pub prop_names: Vec<String>,
    pub prop_types: Vec<PropertyType>,
    pub out_strategy: EdgeStrategy,
    pub in_strategy: EdgeStrategy,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    vertex_labels: Vec<VertexLabelDef>,
    #[serde(skip)]
    vertex_label_ids: HashMap<String, LabelId>,

    edge_label_names: Vec<String>,
    #[serde(skip)]
    edge_label_ids: HashMap<String, LabelId>,

    triplets: Vec<EdgeTriplet>,
    #[serde(skip)]
    triplet_ids: HashMap<(LabelId, LabelId, LabelId), usize>,

    /// Stored-procedure directory: name -> (path, id). Ids are stable across
    /// restarts because the directory is part of the snapshot.
    procedures: BTreeMap<String, (String, u8)>,
}

fn validate_name(name: &str) -> CResult<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("empty name".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidInput(format!(
            "name {:?} contains a path separator",
            name
        )));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(Error::InvalidInput(format!("name {:?} is reserved", name)));
    }
    Ok(())
}

impl Schema {
    pub fn new() -> Self {
        Schema::default()
    }

    /// Declares a vertex label. Re-declaring an existing label with an
    /// identical definition is a no-op; anything else is a `SchemaConflict`.
    pub fn add_vertex_label(
        &mut self,
        name: &str,
        prop_types: Vec<PropertyType>,
        prop_names: Vec<String>,
        pk_name: &str,
        pk_type: PropertyType,
        strategies: Vec<StorageStrategy>,
        max_vnum: usize,
    ) -> CResult<LabelId> {
        validate_name(name)?;
        if prop_types.len() != prop_names.len() || prop_types.len() != strategies.len() {
            return Err(Error::InvalidInput(format!(
                "label {:?}: {} types / {} names / {} strategies",
                name,
                prop_types.len(),
                prop_names.len(),
                strategies.len()
            )));
        }
        match pk_type {
            PropertyType::Int32
            | PropertyType::UInt32
            | PropertyType::Int64
            | PropertyType::UInt64
            | PropertyType::String => {}
            other => {
                return Err(Error::InvalidInput(format!(
                    "{:?} is not a valid primary key type",
                    other
                )));
            }
        }
        for prop in &prop_names {
            validate_name(prop)?;
        }
        let def = VertexLabelDef {
            name: name.to_string(),
            pk_name: pk_name.to_string(),
            pk_type,
            prop_names,
            prop_types,
            strategies,
            max_vnum,
        };
        if let Some(id) = self.vertex_label_ids.get(name) {
            if self.vertex_labels[*id as usize] == def {
                return Ok(*id);
            }
            return Err(Error::SchemaConflict(format!(
                "vertex label {:?} is already declared differently",
                name
            )));
        }
        if self.vertex_labels.len() >= MAX_LABEL_NUM {
            return Err(Error::InvalidInput(format!(
                "vertex label number exceeds {}",
                MAX_LABEL_NUM
            )));
        }
        let id = self.vertex_labels.len() as LabelId;
        self.vertex_label_ids.insert(name.to_string(), id);
        self.vertex_labels.push(def);
        Ok(id)
    }

    /// Declares one adjacency triplet. Edge labels are named; the same edge
    /// name may connect several vertex-label pairs, each pair being its own
    /// triplet. Edge properties must be fixed-width primitives.
    pub fn add_edge_label(
        &mut self,
        src_name: &str,
        dst_name: &str,
        edge_name: &str,
        prop_types: Vec<PropertyType>,
        prop_names: Vec<String>,
        out_strategy: EdgeStrategy,
        in_strategy: EdgeStrategy,
    ) -> CResult<()> {
        validate_name(edge_name)?;
        if prop_types.len() != prop_names.len() {
            return Err(Error::InvalidInput(format!(
                "edge label {:?}: {} types / {} names",
                edge_name,
                prop_types.len(),
                prop_names.len()
            )));
        }
        record_width(&prop_types)?;
        let src = self.vertex_label_id(src_name)?;
        let dst = self.vertex_label_id(dst_name)?;
        let elabel = match self.edge_label_ids.get(edge_name) {
            Some(id) => *id,
            None => {
                if self.edge_label_names.len() >= MAX_LABEL_NUM {
                    return Err(Error::InvalidInput(format!(
                        "edge label number exceeds {}",
                        MAX_LABEL_NUM
                    )));
                }
                let id = self.edge_label_names.len() as LabelId;
                self.edge_label_ids.insert(edge_name.to_string(), id);
                self.edge_label_names.push(edge_name.to_string());
                id
            }
        };
        let def = EdgeTriplet {
            src,
            dst,
            elabel,
            prop_names,
            prop_types,
            out_strategy,
            in_strategy,
        };
        if let Some(idx) = self.triplet_ids.get(&(src, dst, elabel)) {
            if self.triplets[*idx] == def {
                return Ok(());
            }
            return Err(Error::SchemaConflict(format!(
                "edge triplet ({}, {}, {}) is already declared differently",
                src_name, dst_name, edge_name
            )));
        }
        self.triplet_ids.insert((src, dst, elabel), self.triplets.len());
        self.triplets.push(def);
        Ok(())
    }

    /// Registers a stored procedure under a stable id.
    pub fn add_procedure(&mut self, name: &str, path: &str, id: u8) -> CResult<()> {
        validate_name(name)?;
        if self.procedures.contains_key(name) {
            return Err(Error::SchemaConflict(format!(
                "procedure {:?} is already registered",
                name
            )));
        }
        if self.procedures.values().any(|(_, existing)| *existing == id) {
            return Err(Error::SchemaConflict(format!(
                "procedure id {} is already taken",
                id
            )));
        }
        self.procedures.insert(name.to_string(), (path.to_string(), id));
        Ok(())
    }

    pub fn vertex_label_num(&self) -> usize {
        self.vertex_labels.len()
    }

    pub fn edge_label_num(&self) -> usize {
        self.edge_label_names.len()
    }

    pub fn contains_vertex_label(&self, name: &str) -> bool {
        self.vertex_label_ids.contains_key(name)
    }

    pub fn contains_edge_label(&self, name: &str) -> bool {
        self.edge_label_ids.contains_key(name)
    }

    pub fn vertex_label_id(&self, name: &str) -> CResult<LabelId> {
        self.vertex_label_ids
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("vertex label {:?}", name)))
    }

    pub fn edge_label_id(&self, name: &str) -> CResult<LabelId> {
        self.edge_label_ids
            .get(name)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("edge label {:?}", name)))
    }

    pub fn vertex_label(&self, label: LabelId) -> CResult<&VertexLabelDef> {
        self.vertex_labels
            .get(label as usize)
            .ok_or_else(|| Error::NotFound(format!("vertex label id {}", label)))
    }

    pub fn vertex_label_name(&self, label: LabelId) -> CResult<&str> {
        Ok(self.vertex_label(label)?.name.as_str())
    }

    pub fn edge_label_name(&self, elabel: LabelId) -> CResult<&str> {
        self.edge_label_names
            .get(elabel as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::NotFound(format!("edge label id {}", elabel)))
    }

    /// Position of a user property within its label's column list.
    pub fn prop_index(&self, label: LabelId, prop: &str) -> CResult<usize> {
        let def = self.vertex_label(label)?;
        def.prop_names
            .iter()
            .position(|p| p == prop)
            .ok_or_else(|| Error::NotFound(format!("property {:?} of label {:?}", prop, def.name)))
    }

    pub fn triplet_index(&self, src: LabelId, dst: LabelId, elabel: LabelId) -> CResult<usize> {
        self.triplet_ids
            .get(&(src, dst, elabel))
            .copied()
            .ok_or_else(|| {
                Error::NotFound(format!("edge triplet ({}, {}, {})", src, dst, elabel))
            })
    }

    pub fn triplet(&self, idx: usize) -> &EdgeTriplet {
        &self.triplets[idx]
    }

    pub fn triplets(&self) -> &[EdgeTriplet] {
        &self.triplets
    }

    pub fn procedures(&self) -> &BTreeMap<String, (String, u8)> {
        &self.procedures
    }

    pub fn to_json(&self) -> CResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> CResult<Schema> {
        let mut schema: Schema = serde_json::from_str(json)?;
        schema.rebuild_lookups();
        Ok(schema)
    }

    /// The serde-skipped lookup maps must be rebuilt after deserialization.
    pub(crate) fn rebuild_lookups(&mut self) {
        self.vertex_label_ids = self
            .vertex_labels
            .iter()
            .enumerate()
            .map(|(i, def)| (def.name.clone(), i as LabelId))
            .collect();
        self.edge_label_ids = self
            .edge_label_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as LabelId))
            .collect();
        self.triplet_ids = self
            .triplets
            .iter()
            .enumerate()
            .map(|(i, t)| ((t.src, t.dst, t.elabel), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_props() -> (Vec<PropertyType>, Vec<String>, Vec<StorageStrategy>) {
        (
            vec![PropertyType::Int64, PropertyType::String],
            vec!["v".to_string(), "name".to_string()],
            vec![StorageStrategy::Memory, StorageStrategy::Memory],
        )
    }

    fn sample() -> Schema {
        let mut schema = Schema::new();
        let (types, names, strategies) = person_props();
        schema
            .add_vertex_label("person", types, names, "id", PropertyType::Int64, strategies, 1024)
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
    fn label_ids_are_dense() -> CResult<()> {
        let schema = sample();
        assert_eq!(schema.vertex_label_num(), 1);
        assert_eq!(schema.vertex_label_id("person")?, 0);
        assert_eq!(schema.edge_label_id("knows")?, 0);
        assert_eq!(schema.triplet_index(0, 0, 0)?, 0);
        assert!(schema.vertex_label_id("company").is_err());
        Ok(())
    }

    #[test]
    fn redefinition_conflicts() {
        let mut schema = sample();
        let (types, names, strategies) = person_props();
        // Identical re-declaration is accepted.
        assert!(schema
            .add_vertex_label("person", types, names, "id", PropertyType::Int64, strategies, 1024)
            .is_ok());
        // A different shape is not.
        let err = schema
            .add_vertex_label(
                "person",
                vec![PropertyType::Int32],
                vec!["v".to_string()],
                "id",
                PropertyType::Int64,
                vec![StorageStrategy::Memory],
                1024,
            )
            .unwrap_err();
        assert!(matches!(err, Error::SchemaConflict(_)));
    }

    #[test]
    fn names_are_validated() {
        let mut schema = Schema::new();
        for bad in ["", "a/b", "a\\b", "_ANY_LABEL"] {
            let err = schema
                .add_vertex_label(
                    bad,
                    vec![],
                    vec![],
                    "id",
                    PropertyType::Int64,
                    vec![],
                    16,
                )
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{:?}", bad);
        }
    }

    #[test]
    fn edge_props_must_be_fixed_width() {
        let mut schema = sample();
        let err = schema
            .add_edge_label(
                "person",
                "person",
                "likes",
                vec![PropertyType::String],
                vec!["reason".to_string()],
                EdgeStrategy::Multiple,
                EdgeStrategy::None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn procedure_directory() {
        let mut schema = sample();
        schema.add_procedure("khop", "plugins/khop.so", 1).unwrap();
        assert!(matches!(
            schema.add_procedure("khop", "other.so", 2).unwrap_err(),
            Error::SchemaConflict(_)
        ));
        assert!(matches!(
            schema.add_procedure("pagerank", "pr.so", 1).unwrap_err(),
            Error::SchemaConflict(_)
        ));
        assert_eq!(schema.procedures()["khop"], ("plugins/khop.so".to_string(), 1));
    }

    #[test]
    fn json_dump_restores_lookups() -> CResult<()> {
        let schema = sample();
        let json = schema.to_json()?;
        let restored = Schema::from_json(&json)?;
        assert_eq!(schema, restored);
        assert_eq!(restored.vertex_label_id("person")?, 0);
        assert_eq!(restored.triplet_index(0, 0, 0)?, 0);
        Ok(())
    }
}
