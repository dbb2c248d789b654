use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CResult, Error};
use crate::property::types::{PropertyType, PropertyValue, Vid};
use crate::schema::StorageStrategy;
use crate::snapshot;

/// Short inline strings are capped so the column stays within a predictable
/// per-row footprint; longer values belong in a `Text` column.
pub const SHORT_STRING_MAX: usize = 256;

/// A typed column of fixed-width values.
///
/// Rows are made to exist by `resize` (vertex allocation) and written by
/// `set`. A get after a set from the same thread is always visible;
/// cross-thread visibility is the owning transaction's concern.
pub struct TypedColumn<T> {
    data: RwLock<Vec<T>>,
    strategy: StorageStrategy,
}

impl<T: Copy + Default + Serialize + DeserializeOwned> TypedColumn<T> {
    pub fn new(strategy: StorageStrategy) -> Self {
        Self { data: RwLock::new(Vec::new()), strategy }
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub fn get(&self, vid: Vid) -> CResult<T> {
        let data = self.data.read()?;
        data.get(vid as usize)
            .copied()
            .ok_or_else(|| Error::InvalidInput(format!("vid {} out of range", vid)))
    }

    pub fn set(&self, vid: Vid, value: T) -> CResult<()> {
        let mut data = self.data.write()?;
        match data.get_mut(vid as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::InvalidInput(format!("vid {} out of range", vid))),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn resize(&self, n: usize) -> CResult<()> {
        self.data.write()?.resize(n, T::default());
        Ok(())
    }

    pub fn reserve(&self, n: usize) -> CResult<()> {
        self.data.write()?.reserve(n);
        Ok(())
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        snapshot::write_header(&mut w)?;
        bincode::serialize_into(&mut w, &*self.data.read()?)?;
        Ok(())
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        let mut r = BufReader::new(File::open(path)?);
        snapshot::check_header(&mut r, path)?;
        *self.data.write()? = bincode::deserialize_from(&mut r)?;
        Ok(())
    }
}

/// Short strings, stored inline per row.
pub struct StringColumn {
    data: RwLock<Vec<String>>,
    strategy: StorageStrategy,
}

impl StringColumn {
    pub fn new(strategy: StorageStrategy) -> Self {
        Self { data: RwLock::new(Vec::new()), strategy }
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub fn get(&self, vid: Vid) -> CResult<String> {
        let data = self.data.read()?;
        data.get(vid as usize)
            .cloned()
            .ok_or_else(|| Error::InvalidInput(format!("vid {} out of range", vid)))
    }

    pub fn set(&self, vid: Vid, value: &str) -> CResult<()> {
        if value.len() > SHORT_STRING_MAX {
            return Err(Error::InvalidInput(format!(
                "short string of {} bytes exceeds the {} byte cap",
                value.len(),
                SHORT_STRING_MAX
            )));
        }
        let mut data = self.data.write()?;
        match data.get_mut(vid as usize) {
            Some(slot) => {
                *slot = value.to_string();
                Ok(())
            }
            None => Err(Error::InvalidInput(format!("vid {} out of range", vid))),
        }
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn resize(&self, n: usize) -> CResult<()> {
        self.data.write()?.resize(n, String::new());
        Ok(())
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        snapshot::write_header(&mut w)?;
        bincode::serialize_into(&mut w, &*self.data.read()?)?;
        Ok(())
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        let mut r = BufReader::new(File::open(path)?);
        snapshot::check_header(&mut r, path)?;
        *self.data.write()? = bincode::deserialize_from(&mut r)?;
        Ok(())
    }
}

/// Long strings. Each row holds `(offset, len)` into an append-only blob;
/// overwriting appends a fresh span, the stale bytes are reclaimed only when
/// the column is rewritten through serialize/deserialize.
pub struct TextColumn {
    inner: RwLock<TextData>,
    strategy: StorageStrategy,
}

#[derive(Default, serde_derive::Serialize, serde_derive::Deserialize)]
struct TextData {
    blob: Vec<u8>,
    spans: Vec<(u64, u32)>,
}

impl TextColumn {
    pub fn new(strategy: StorageStrategy) -> Self {
        Self { inner: RwLock::new(TextData::default()), strategy }
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub fn get(&self, vid: Vid) -> CResult<String> {
        let inner = self.inner.read()?;
        let (offset, len) = *inner
            .spans
            .get(vid as usize)
            .ok_or_else(|| Error::InvalidInput(format!("vid {} out of range", vid)))?;
        let bytes = &inner.blob[offset as usize..offset as usize + len as usize];
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Internal(format!("corrupt text blob: {}", e)))
    }

    pub fn set(&self, vid: Vid, value: &str) -> CResult<()> {
        let mut inner = self.inner.write()?;
        if vid as usize >= inner.spans.len() {
            return Err(Error::InvalidInput(format!("vid {} out of range", vid)));
        }
        let offset = inner.blob.len() as u64;
        inner.blob.extend_from_slice(value.as_bytes());
        inner.spans[vid as usize] = (offset, value.len() as u32);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|d| d.spans.len()).unwrap_or(0)
    }

    pub fn resize(&self, n: usize) -> CResult<()> {
        self.inner.write()?.spans.resize(n, (0, 0));
        Ok(())
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        // Rewrite compactly: live spans only, in row order.
        let inner = self.inner.read()?;
        let mut compact = TextData::default();
        for (offset, len) in &inner.spans {
            let start = compact.blob.len() as u64;
            compact
                .blob
                .extend_from_slice(&inner.blob[*offset as usize..(*offset + *len as u64) as usize]);
            compact.spans.push((start, *len));
        }
        let mut w = BufWriter::new(File::create(path)?);
        snapshot::write_header(&mut w)?;
        bincode::serialize_into(&mut w, &compact)?;
        Ok(())
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        let mut r = BufReader::new(File::open(path)?);
        snapshot::check_header(&mut r, path)?;
        *self.inner.write()? = bincode::deserialize_from(&mut r)?;
        Ok(())
    }
}

/// Dictionary-encoded strings: rows hold 16-bit codes, the side dictionary
/// grows under its own lock when a write introduces a new string.
pub struct DictColumn {
    codes: RwLock<Vec<u16>>,
    dict: Mutex<Dict>,
    strategy: StorageStrategy,
}

#[derive(Default, serde_derive::Serialize, serde_derive::Deserialize)]
struct Dict {
    #[serde(skip)]
    by_value: HashMap<String, u16>,
    values: Vec<String>,
}

impl Dict {
    fn rebuild_lookup(&mut self) {
        self.by_value = self
            .values
            .iter()
            .enumerate()
            .map(|(i, v)| (v.clone(), i as u16))
            .collect();
    }
}

impl DictColumn {
    pub fn new(strategy: StorageStrategy) -> Self {
        Self {
            codes: RwLock::new(Vec::new()),
            dict: Mutex::new(Dict::default()),
            strategy,
        }
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    pub fn get(&self, vid: Vid) -> CResult<String> {
        let code = {
            let codes = self.codes.read()?;
            *codes
                .get(vid as usize)
                .ok_or_else(|| Error::InvalidInput(format!("vid {} out of range", vid)))?
        };
        let dict = self.dict.lock()?;
        dict.values
            .get(code as usize)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("dangling dictionary code {}", code)))
    }

    pub fn set(&self, vid: Vid, value: &str) -> CResult<()> {
        let code = {
            let mut dict = self.dict.lock()?;
            match dict.by_value.get(value) {
                Some(code) => *code,
                None => {
                    if dict.values.len() > u16::MAX as usize {
                        return Err(Error::InvalidInput(
                            "dictionary column is full".to_string(),
                        ));
                    }
                    let code = dict.values.len() as u16;
                    dict.values.push(value.to_string());
                    dict.by_value.insert(value.to_string(), code);
                    code
                }
            }
        };
        let mut codes = self.codes.write()?;
        match codes.get_mut(vid as usize) {
            Some(slot) => {
                *slot = code;
                Ok(())
            }
            None => Err(Error::InvalidInput(format!("vid {} out of range", vid))),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn resize(&self, n: usize) -> CResult<()> {
        let mut dict = self.dict.lock()?;
        if dict.values.is_empty() {
            // Code 0 must mean something for rows that were never set.
            dict.values.push(String::new());
            dict.by_value.insert(String::new(), 0);
        }
        drop(dict);
        self.codes.write()?.resize(n, 0);
        Ok(())
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        let mut w = BufWriter::new(File::create(path)?);
        snapshot::write_header(&mut w)?;
        bincode::serialize_into(&mut w, &(&*self.codes.read()?, &*self.dict.lock()?))?;
        Ok(())
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        let mut r = BufReader::new(File::open(path)?);
        snapshot::check_header(&mut r, path)?;
        let (codes, mut dict): (Vec<u16>, Dict) = bincode::deserialize_from(&mut r)?;
        dict.rebuild_lookup();
        *self.codes.write()? = codes;
        *self.dict.lock()? = dict;
        Ok(())
    }
}

/// A property column of any declared type, dispatching to the typed store.
pub enum Column {
    Bool(TypedColumn<bool>),
    Int32(TypedColumn<i32>),
    UInt32(TypedColumn<u32>),
    Int64(TypedColumn<i64>),
    UInt64(TypedColumn<u64>),
    Double(TypedColumn<f64>),
    Date(TypedColumn<i64>),
    String(StringColumn),
    Text(TextColumn),
    Dict(DictColumn),
}

impl Column {
    pub fn strategy(&self) -> StorageStrategy {
        match self {
            Column::Bool(c) => c.strategy(),
            Column::Int32(c) => c.strategy(),
            Column::UInt32(c) => c.strategy(),
            Column::Int64(c) => c.strategy(),
            Column::UInt64(c) => c.strategy(),
            Column::Double(c) => c.strategy(),
            Column::Date(c) => c.strategy(),
            Column::String(c) => c.strategy(),
            Column::Text(c) => c.strategy(),
            Column::Dict(c) => c.strategy(),
        }
    }

    pub fn new(ty: PropertyType, strategy: StorageStrategy) -> Self {
        match ty {
            PropertyType::Bool => Column::Bool(TypedColumn::new(strategy)),
            PropertyType::Int32 => Column::Int32(TypedColumn::new(strategy)),
            PropertyType::UInt32 => Column::UInt32(TypedColumn::new(strategy)),
            PropertyType::Int64 => Column::Int64(TypedColumn::new(strategy)),
            PropertyType::UInt64 => Column::UInt64(TypedColumn::new(strategy)),
            PropertyType::Double => Column::Double(TypedColumn::new(strategy)),
            PropertyType::Date => Column::Date(TypedColumn::new(strategy)),
            PropertyType::String => Column::String(StringColumn::new(strategy)),
            PropertyType::Text => Column::Text(TextColumn::new(strategy)),
            PropertyType::DictString => Column::Dict(DictColumn::new(strategy)),
        }
    }

    pub fn property_type(&self) -> PropertyType {
        match self {
            Column::Bool(_) => PropertyType::Bool,
            Column::Int32(_) => PropertyType::Int32,
            Column::UInt32(_) => PropertyType::UInt32,
            Column::Int64(_) => PropertyType::Int64,
            Column::UInt64(_) => PropertyType::UInt64,
            Column::Double(_) => PropertyType::Double,
            Column::Date(_) => PropertyType::Date,
            Column::String(_) => PropertyType::String,
            Column::Text(_) => PropertyType::Text,
            Column::Dict(_) => PropertyType::DictString,
        }
    }

    pub fn get(&self, vid: Vid) -> CResult<PropertyValue> {
        Ok(match self {
            Column::Bool(c) => PropertyValue::Bool(c.get(vid)?),
            Column::Int32(c) => PropertyValue::Int32(c.get(vid)?),
            Column::UInt32(c) => PropertyValue::UInt32(c.get(vid)?),
            Column::Int64(c) => PropertyValue::Int64(c.get(vid)?),
            Column::UInt64(c) => PropertyValue::UInt64(c.get(vid)?),
            Column::Double(c) => PropertyValue::Double(c.get(vid)?),
            Column::Date(c) => PropertyValue::Date(c.get(vid)?),
            Column::String(c) => PropertyValue::String(c.get(vid)?),
            Column::Text(c) => PropertyValue::String(c.get(vid)?),
            Column::Dict(c) => PropertyValue::String(c.get(vid)?),
        })
    }

    pub fn set(&self, vid: Vid, value: &PropertyValue) -> CResult<()> {
        if !value.matches(self.property_type()) {
            return Err(Error::InvalidInput(format!(
                "column of {:?} cannot store {:?}",
                self.property_type(),
                value
            )));
        }
        match (self, value) {
            (Column::Bool(c), PropertyValue::Bool(v)) => c.set(vid, *v),
            (Column::Int32(c), PropertyValue::Int32(v)) => c.set(vid, *v),
            (Column::UInt32(c), PropertyValue::UInt32(v)) => c.set(vid, *v),
            (Column::Int64(c), PropertyValue::Int64(v)) => c.set(vid, *v),
            (Column::UInt64(c), PropertyValue::UInt64(v)) => c.set(vid, *v),
            (Column::Double(c), PropertyValue::Double(v)) => c.set(vid, *v),
            (Column::Date(c), PropertyValue::Date(v)) => c.set(vid, *v),
            (Column::String(c), PropertyValue::String(v)) => c.set(vid, v),
            (Column::Text(c), PropertyValue::String(v)) => c.set(vid, v),
            (Column::Dict(c), PropertyValue::String(v)) => c.set(vid, v),
            _ => unreachable!("rejected by matches() above"),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Column::Bool(c) => c.len(),
            Column::Int32(c) => c.len(),
            Column::UInt32(c) => c.len(),
            Column::Int64(c) => c.len(),
            Column::UInt64(c) => c.len(),
            Column::Double(c) => c.len(),
            Column::Date(c) => c.len(),
            Column::String(c) => c.len(),
            Column::Text(c) => c.len(),
            Column::Dict(c) => c.len(),
        }
    }

    pub fn resize(&self, n: usize) -> CResult<()> {
        match self {
            Column::Bool(c) => c.resize(n),
            Column::Int32(c) => c.resize(n),
            Column::UInt32(c) => c.resize(n),
            Column::Int64(c) => c.resize(n),
            Column::UInt64(c) => c.resize(n),
            Column::Double(c) => c.resize(n),
            Column::Date(c) => c.resize(n),
            Column::String(c) => c.resize(n),
            Column::Text(c) => c.resize(n),
            Column::Dict(c) => c.resize(n),
        }
    }

    pub fn serialize(&self, path: &Path) -> CResult<()> {
        match self {
            Column::Bool(c) => c.serialize(path),
            Column::Int32(c) => c.serialize(path),
            Column::UInt32(c) => c.serialize(path),
            Column::Int64(c) => c.serialize(path),
            Column::UInt64(c) => c.serialize(path),
            Column::Double(c) => c.serialize(path),
            Column::Date(c) => c.serialize(path),
            Column::String(c) => c.serialize(path),
            Column::Text(c) => c.serialize(path),
            Column::Dict(c) => c.serialize(path),
        }
    }

    pub fn deserialize(&self, path: &Path) -> CResult<()> {
        match self {
            Column::Bool(c) => c.deserialize(path),
            Column::Int32(c) => c.deserialize(path),
            Column::UInt32(c) => c.deserialize(path),
            Column::Int64(c) => c.deserialize(path),
            Column::UInt64(c) => c.deserialize(path),
            Column::Double(c) => c.deserialize(path),
            Column::Date(c) => c.deserialize(path),
            Column::String(c) => c.deserialize(path),
            Column::Text(c) => c.deserialize(path),
            Column::Dict(c) => c.deserialize(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_get_set() -> CResult<()> {
        let col = Column::new(PropertyType::Int64, StorageStrategy::Memory);
        col.resize(3)?;
        col.set(1, &PropertyValue::Int64(42))?;
        assert_eq!(col.get(1)?, PropertyValue::Int64(42));
        assert_eq!(col.get(0)?, PropertyValue::Int64(0));
        assert!(col.get(3).is_err());
        assert!(col.set(0, &PropertyValue::Int32(1)).is_err());
        Ok(())
    }

    #[test]
    fn short_string_cap() -> CResult<()> {
        let col = StringColumn::new(StorageStrategy::Memory);
        col.resize(1)?;
        col.set(0, "ok")?;
        assert_eq!(col.get(0)?, "ok");
        let long = "x".repeat(SHORT_STRING_MAX + 1);
        assert!(col.set(0, &long).is_err());
        Ok(())
    }

    #[test]
    fn text_blob_spans() -> CResult<()> {
        let col = TextColumn::new(StorageStrategy::Memory);
        col.resize(2)?;
        col.set(0, "first value")?;
        col.set(1, "second value")?;
        col.set(0, "replaced")?;
        assert_eq!(col.get(0)?, "replaced");
        assert_eq!(col.get(1)?, "second value");
        Ok(())
    }

    #[test]
    fn dict_codes_are_shared() -> CResult<()> {
        let col = DictColumn::new(StorageStrategy::Memory);
        col.resize(3)?;
        col.set(0, "red")?;
        col.set(1, "blue")?;
        col.set(2, "red")?;
        assert_eq!(col.get(0)?, "red");
        assert_eq!(col.get(2)?, "red");
        assert_eq!(col.get(1)?, "blue");
        Ok(())
    }

    #[test]
    fn column_files_roundtrip() -> CResult<()> {
        let dir = tempdir::TempDir::new("col")?;
        let path = dir.path().join("p.age.col");

        let col = Column::new(PropertyType::Int32, StorageStrategy::MemMap);
        assert_eq!(col.strategy(), StorageStrategy::MemMap);
        col.resize(2)?;
        col.set(0, &PropertyValue::Int32(30))?;
        col.set(1, &PropertyValue::Int32(40))?;
        col.serialize(&path)?;

        let restored = Column::new(PropertyType::Int32, StorageStrategy::MemMap);
        restored.deserialize(&path)?;
        assert_eq!(restored.get(0)?, PropertyValue::Int32(30));
        assert_eq!(restored.get(1)?, PropertyValue::Int32(40));
        Ok(())
    }
}
