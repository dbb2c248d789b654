//! Per-label primary-key index: a bidirectional map between the external
//! key ("oid") and the internal dense vertex id ("vid").
//!
//! The forward map and the dense keys column live behind one lock so the
//! bijection can never be observed half-updated. Writers are serialized per
//! label; lookups only take the read side and never block each other.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::RwLock;

use crate::error::{CResult, Error};
use crate::property::types::{Oid, PropertyType, Vid};
use crate::snapshot;

pub struct PrimaryIndex {
    oid_type: PropertyType,
    inner: RwLock<IndexData>,
}

#[derive(Default)]
struct IndexData {
    map: HashMap<Oid, Vid>,
    keys: Vec<Oid>,
}

impl PrimaryIndex {
    pub fn new(oid_type: PropertyType) -> Self {
        Self { oid_type, inner: RwLock::new(IndexData::default()) }
    }

    pub fn oid_type(&self) -> PropertyType {
        self.oid_type
    }

    /// Assigns the next dense vid to `oid`. Vids are handed out in insertion
    /// order and never reused.
    pub fn insert(&self, oid: Oid) -> CResult<Vid> {
        if oid.property_type() != self.oid_type {
            return Err(Error::InvalidInput(format!(
                "key {} is not of the declared type {:?}",
                oid, self.oid_type
            )));
        }
        let mut inner = self.inner.write()?;
        if inner.map.contains_key(&oid) {
            return Err(Error::DuplicateKey(format!("oid {}", oid)));
        }
        let vid = inner.keys.len() as Vid;
        inner.map.insert(oid.clone(), vid);
        inner.keys.push(oid);
        Ok(vid)
    }

    pub fn lookup(&self, oid: &Oid) -> CResult<Vid> {
        let inner = self.inner.read()?;
        inner
            .map
            .get(oid)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("oid {}", oid)))
    }

    /// The keys column: dense `vid -> oid`.
    pub fn oid(&self, vid: Vid) -> CResult<Oid> {
        let inner = self.inner.read()?;
        inner
            .keys
            .get(vid as usize)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("vid {}", vid)))
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.keys.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A `(vid, oid)` snapshot in vid order.
    pub fn iterate(&self) -> CResult<Vec<(Vid, Oid)>> {
        let inner = self.inner.read()?;
        Ok(inner
            .keys
            .iter()
            .enumerate()
            .map(|(vid, oid)| (vid as Vid, oid.clone()))
            .collect())
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        snapshot::write_header(&mut w)?;
        bincode::serialize_into(&mut w, &self.inner.read()?.keys)?;
        Ok(())
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        let mut r = BufReader::new(File::open(path)?);
        snapshot::check_header(&mut r, path)?;
        let keys: Vec<Oid> = bincode::deserialize_from(&mut r)?;
        let mut inner = self.inner.write()?;
        inner.map = keys
            .iter()
            .enumerate()
            .map(|(vid, oid)| (oid.clone(), vid as Vid))
            .collect();
        if inner.map.len() != keys.len() {
            return Err(Error::Internal(format!(
                "{}: duplicate keys in keys column",
                path.display()
            )));
        }
        inner.keys = keys;
        Ok(())
    }
}
