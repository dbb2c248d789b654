use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

/// Dense internal vertex id, local to its vertex label.
pub type Vid = u32;

/// 8-bit label id, for vertex labels and edge labels alike.
pub type LabelId = u8;

/// The declared type of a property.
///
/// `Date` is a fixed-precision temporal stored as milliseconds since the
/// epoch. The three string types share the value representation and differ
/// only in column storage: `String` is a short inline string, `Text` lives in
/// an append-only blob arena, `DictString` is dictionary-encoded with 16-bit
/// codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyType {
    Bool,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    Date,
    String,
    Text,
    DictString,
}

impl PropertyType {
    /// Width in bytes inside a fixed-size edge record, or None for strings.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            PropertyType::Bool => Some(1),
            PropertyType::Int32 | PropertyType::UInt32 => Some(4),
            PropertyType::Int64 | PropertyType::UInt64 => Some(8),
            PropertyType::Double | PropertyType::Date => Some(8),
            PropertyType::String | PropertyType::Text | PropertyType::DictString => None,
        }
    }

    pub fn is_string(&self) -> bool {
        self.fixed_width().is_none()
    }
}

/// A property value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    /// Milliseconds since the epoch.
    Date(i64),
    String(String),
}

impl PropertyValue {
    /// Whether this value is storable in a column of the given type.
    pub fn matches(&self, ty: PropertyType) -> bool {
        matches!(
            (self, ty),
            (PropertyValue::Bool(_), PropertyType::Bool)
                | (PropertyValue::Int32(_), PropertyType::Int32)
                | (PropertyValue::UInt32(_), PropertyType::UInt32)
                | (PropertyValue::Int64(_), PropertyType::Int64)
                | (PropertyValue::UInt64(_), PropertyType::UInt64)
                | (PropertyValue::Double(_), PropertyType::Double)
                | (PropertyValue::Date(_), PropertyType::Date)
                | (PropertyValue::String(_), PropertyType::String)
                | (PropertyValue::String(_), PropertyType::Text)
                | (PropertyValue::String(_), PropertyType::DictString)
        )
    }

    /// Appends the tagged wire form: a one-byte type tag followed by the
    /// big-endian value, strings with a u32 length prefix.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            PropertyValue::Bool(v) => {
                buf.put_u8(0);
                buf.put_u8(*v as u8);
            }
            PropertyValue::Int32(v) => {
                buf.put_u8(1);
                buf.put_i32(*v);
            }
            PropertyValue::UInt32(v) => {
                buf.put_u8(2);
                buf.put_u32(*v);
            }
            PropertyValue::Int64(v) => {
                buf.put_u8(3);
                buf.put_i64(*v);
            }
            PropertyValue::UInt64(v) => {
                buf.put_u8(4);
                buf.put_u64(*v);
            }
            PropertyValue::Double(v) => {
                buf.put_u8(5);
                buf.put_f64(*v);
            }
            PropertyValue::Date(v) => {
                buf.put_u8(6);
                buf.put_i64(*v);
            }
            PropertyValue::String(v) => {
                buf.put_u8(7);
                buf.put_u32(v.len() as u32);
                buf.put(v.as_bytes());
            }
        }
    }

    /// Reads one tagged value back from the cursor.
    pub fn decode(cursor: &mut Cursor<&[u8]>) -> CResult<PropertyValue> {
        let tag = cursor.read_u8()?;
        Ok(match tag {
            0 => PropertyValue::Bool(cursor.read_u8()? != 0),
            1 => PropertyValue::Int32(cursor.read_i32::<BigEndian>()?),
            2 => PropertyValue::UInt32(cursor.read_u32::<BigEndian>()?),
            3 => PropertyValue::Int64(cursor.read_i64::<BigEndian>()?),
            4 => PropertyValue::UInt64(cursor.read_u64::<BigEndian>()?),
            5 => PropertyValue::Double(cursor.read_f64::<BigEndian>()?),
            6 => PropertyValue::Date(cursor.read_i64::<BigEndian>()?),
            7 => {
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let mut bytes = vec![0; len];
                cursor.read_exact(&mut bytes)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| Error::InvalidInput(format!("non-utf8 string value: {}", e)))?;
                PropertyValue::String(s)
            }
            other => {
                return Err(Error::InvalidInput(format!("unknown value tag {}", other)));
            }
        })
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int32(v) => write!(f, "{}", v),
            PropertyValue::UInt32(v) => write!(f, "{}", v),
            PropertyValue::Int64(v) => write!(f, "{}", v),
            PropertyValue::UInt64(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::Date(v) => write!(f, "{}", v),
            PropertyValue::String(v) => write!(f, "{}", v),
        }
    }
}

/// An external primary key. The concrete type is fixed per vertex label by
/// the schema; `Oid` exists so indexes and WAL records can carry keys of any
/// declared type uniformly.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Oid {
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    String(String),
}

impl Oid {
    pub fn property_type(&self) -> PropertyType {
        match self {
            Oid::Int32(_) => PropertyType::Int32,
            Oid::UInt32(_) => PropertyType::UInt32,
            Oid::Int64(_) => PropertyType::Int64,
            Oid::UInt64(_) => PropertyType::UInt64,
            Oid::String(_) => PropertyType::String,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Oid::Int32(v) => {
                buf.put_u8(1);
                buf.put_i32(*v);
            }
            Oid::UInt32(v) => {
                buf.put_u8(2);
                buf.put_u32(*v);
            }
            Oid::Int64(v) => {
                buf.put_u8(3);
                buf.put_i64(*v);
            }
            Oid::UInt64(v) => {
                buf.put_u8(4);
                buf.put_u64(*v);
            }
            Oid::String(v) => {
                buf.put_u8(7);
                buf.put_u32(v.len() as u32);
                buf.put(v.as_bytes());
            }
        }
    }

    pub fn decode(cursor: &mut Cursor<&[u8]>) -> CResult<Oid> {
        match PropertyValue::decode(cursor)? {
            PropertyValue::Int32(v) => Ok(Oid::Int32(v)),
            PropertyValue::UInt32(v) => Ok(Oid::UInt32(v)),
            PropertyValue::Int64(v) => Ok(Oid::Int64(v)),
            PropertyValue::UInt64(v) => Ok(Oid::UInt64(v)),
            PropertyValue::String(v) => Ok(Oid::String(v)),
            other => Err(Error::InvalidInput(format!("{:?} is not a valid key type", other))),
        }
    }
}

impl std::fmt::Display for Oid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Oid::Int32(v) => write!(f, "{}", v),
            Oid::UInt32(v) => write!(f, "{}", v),
            Oid::Int64(v) => write!(f, "{}", v),
            Oid::UInt64(v) => write!(f, "{}", v),
            Oid::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<Oid> for PropertyValue {
    fn from(oid: Oid) -> Self {
        match oid {
            Oid::Int32(v) => PropertyValue::Int32(v),
            Oid::UInt32(v) => PropertyValue::UInt32(v),
            Oid::Int64(v) => PropertyValue::Int64(v),
            Oid::UInt64(v) => PropertyValue::UInt64(v),
            Oid::String(v) => PropertyValue::String(v),
        }
    }
}

/// Total width of a fixed-size edge record with the given field types.
pub fn record_width(types: &[PropertyType]) -> CResult<usize> {
    let mut width = 0;
    for ty in types {
        width += ty
            .fixed_width()
            .ok_or_else(|| Error::InvalidInput(format!("{:?} is not allowed on edges", ty)))?;
    }
    Ok(width)
}

/// Packs edge property values into their fixed-size record form.
pub fn encode_record(types: &[PropertyType], values: &[PropertyValue]) -> CResult<Vec<u8>> {
    if types.len() != values.len() {
        return Err(Error::InvalidInput(format!(
            "edge record expects {} fields, got {}",
            types.len(),
            values.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(record_width(types)?);
    for (ty, value) in types.iter().zip(values) {
        if !value.matches(*ty) {
            return Err(Error::InvalidInput(format!(
                "edge field type mismatch: expected {:?}, got {:?}",
                ty, value
            )));
        }
        match value {
            PropertyValue::Bool(v) => buf.put_u8(*v as u8),
            PropertyValue::Int32(v) => buf.put_i32(*v),
            PropertyValue::UInt32(v) => buf.put_u32(*v),
            PropertyValue::Int64(v) => buf.put_i64(*v),
            PropertyValue::UInt64(v) => buf.put_u64(*v),
            PropertyValue::Double(v) => buf.put_f64(*v),
            PropertyValue::Date(v) => buf.put_i64(*v),
            PropertyValue::String(_) => unreachable!("rejected by matches() above"),
        }
    }
    Ok(buf.to_vec())
}

/// Unpacks a fixed-size edge record.
pub fn decode_record(types: &[PropertyType], data: &[u8]) -> CResult<Vec<PropertyValue>> {
    if data.len() != record_width(types)? {
        return Err(Error::InvalidInput(format!(
            "edge record is {} bytes, schema says {}",
            data.len(),
            record_width(types)?
        )));
    }
    let mut cursor = Cursor::new(data);
    let mut values = Vec::with_capacity(types.len());
    for ty in types {
        values.push(match ty {
            PropertyType::Bool => PropertyValue::Bool(cursor.read_u8()? != 0),
            PropertyType::Int32 => PropertyValue::Int32(cursor.read_i32::<BigEndian>()?),
            PropertyType::UInt32 => PropertyValue::UInt32(cursor.read_u32::<BigEndian>()?),
            PropertyType::Int64 => PropertyValue::Int64(cursor.read_i64::<BigEndian>()?),
            PropertyType::UInt64 => PropertyValue::UInt64(cursor.read_u64::<BigEndian>()?),
            PropertyType::Double => PropertyValue::Double(cursor.read_f64::<BigEndian>()?),
            PropertyType::Date => PropertyValue::Date(cursor.read_i64::<BigEndian>()?),
            _ => unreachable!("record_width rejects string fields"),
        });
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_wire_form() -> CResult<()> {
        let values = vec![
            PropertyValue::Bool(true),
            PropertyValue::Int32(-7),
            PropertyValue::Int64(1 << 40),
            PropertyValue::Double(2.5),
            PropertyValue::Date(1700000000000),
            PropertyValue::String("hello".to_string()),
        ];
        let mut buf = BytesMut::new();
        for v in &values {
            v.encode(&mut buf);
        }
        let bytes = buf.to_vec();
        let mut cursor = Cursor::new(bytes.as_slice());
        for v in &values {
            assert_eq!(&PropertyValue::decode(&mut cursor)?, v);
        }
        assert_eq!(cursor.position(), bytes.len() as u64);
        Ok(())
    }

    #[test]
    fn edge_record_width_enforced() {
        let types = [PropertyType::Int64, PropertyType::Double];
        assert_eq!(record_width(&types).unwrap(), 16);

        let record = encode_record(
            &types,
            &[PropertyValue::Int64(42), PropertyValue::Double(0.5)],
        )
        .unwrap();
        assert_eq!(record.len(), 16);
        assert!(decode_record(&types, &record[..15]).is_err());

        // Strings never appear in edge records.
        assert!(record_width(&[PropertyType::String]).is_err());
    }

    #[test]
    fn oid_type_tags() -> CResult<()> {
        let oid = Oid::Int64(10);
        let mut buf = BytesMut::new();
        oid.encode(&mut buf);
        let bytes = buf.to_vec();
        let mut cursor = Cursor::new(bytes.as_slice());
        assert_eq!(Oid::decode(&mut cursor)?, oid);
        Ok(())
    }
}
