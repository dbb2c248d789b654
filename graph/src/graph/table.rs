//! Per-label vertex storage: the user property columns plus the
//! creation-timestamp column that drives snapshot visibility.

use std::path::Path;
use std::sync::RwLock;

use crate::error::{CResult, Error};
use crate::property::column::Column;
use crate::property::types::{PropertyValue, Vid};
use crate::schema::VertexLabelDef;
use crate::snapshot;
use crate::version::Timestamp;

pub struct VertexTable {
    def: VertexLabelDef,
    columns: Vec<Column>,
    /// Timestamp of the transaction that created each row. Rows are appended
    /// in timestamp order, so the column is nondecreasing and visibility is
    /// a partition point.
    create_ts: RwLock<Vec<Timestamp>>,
}

impl VertexTable {
    pub fn new(def: VertexLabelDef) -> Self {
        let columns = def
            .prop_types
            .iter()
            .zip(&def.strategies)
            .map(|(ty, strategy)| Column::new(*ty, *strategy))
            .collect();
        Self { def, columns, create_ts: RwLock::new(Vec::new()) }
    }

    pub fn def(&self) -> &VertexLabelDef {
        &self.def
    }

    pub fn vertex_num(&self) -> usize {
        self.create_ts.read().map(|v| v.len()).unwrap_or(0)
    }

    pub fn visible_vertex_num(&self, read_ts: Timestamp) -> CResult<usize> {
        let create_ts = self.create_ts.read()?;
        Ok(create_ts.partition_point(|t| *t <= read_ts))
    }

    /// Makes room for one more vertex and stamps it; returns the new row id.
    pub fn append_row(&self, ts: Timestamp) -> CResult<Vid> {
        let mut create_ts = self.create_ts.write()?;
        if create_ts.len() >= self.def.max_vnum {
            return Err(Error::InvalidInput(format!(
                "label {:?} is full ({} vertices)",
                self.def.name, self.def.max_vnum
            )));
        }
        let vid = create_ts.len() as Vid;
        for column in &self.columns {
            column.resize(vid as usize + 1)?;
        }
        create_ts.push(ts);
        Ok(vid)
    }

    pub fn create_ts(&self, vid: Vid) -> CResult<Timestamp> {
        let create_ts = self.create_ts.read()?;
        create_ts
            .get(vid as usize)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("vid {} of label {:?}", vid, self.def.name)))
    }

    pub fn get_prop(&self, vid: Vid, prop_idx: usize) -> CResult<PropertyValue> {
        let column = self.columns.get(prop_idx).ok_or_else(|| {
            Error::NotFound(format!("property index {} of label {:?}", prop_idx, self.def.name))
        })?;
        column.get(vid)
    }

    pub fn set_prop(&self, vid: Vid, prop_idx: usize, value: &PropertyValue) -> CResult<()> {
        let column = self.columns.get(prop_idx).ok_or_else(|| {
            Error::NotFound(format!("property index {} of label {:?}", prop_idx, self.def.name))
        })?;
        column.set(vid, value)
    }

    pub fn prop_num(&self) -> usize {
        self.columns.len()
    }

    pub(crate) fn create_ts_vec(&self) -> CResult<Vec<Timestamp>> {
        Ok(self.create_ts.read()?.clone())
    }

    pub(crate) fn set_create_ts_vec(&self, ts: Vec<Timestamp>) -> CResult<()> {
        for column in &self.columns {
            column.resize(ts.len())?;
        }
        *self.create_ts.write()? = ts;
        Ok(())
    }

    pub fn serialize(&self, dir: &Path) -> CResult<()> {
        for (name, column) in self.def.prop_names.iter().zip(&self.columns) {
            column.serialize(&dir.join(snapshot::column_file(&self.def.name, name)))?;
        }
        Ok(())
    }

    pub fn deserialize(&self, dir: &Path) -> CResult<()> {
        for (name, column) in self.def.prop_names.iter().zip(&self.columns) {
            column.deserialize(&dir.join(snapshot::column_file(&self.def.name, name)))?;
        }
        Ok(())
    }
}
