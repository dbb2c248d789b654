//! On-disk framing shared by every snapshot file.
//!
//! A snapshot directory contains `init_snapshot.bin` (schema and vertex
//! metadata), one keys-column file per vertex label, one file per property
//! column and one file per adjacency triplet per direction. Every file starts
//! with the same 4-byte magic and 4-byte format version; anything else is
//! rejected with `IncompatibleSnapshot` before a single payload byte is read.

use std::io::{Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CResult, Error};

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"GRSS";
pub const SNAPSHOT_VERSION: u32 = 1;

/// File name of the fragment metadata blob inside a snapshot directory.
pub const INIT_SNAPSHOT: &str = "init_snapshot.bin";

pub fn write_header<W: Write>(w: &mut W) -> CResult<()> {
    w.write_all(&SNAPSHOT_MAGIC)?;
    w.write_u32::<BigEndian>(SNAPSHOT_VERSION)?;
    Ok(())
}

pub fn check_header<R: Read>(r: &mut R, path: &Path) -> CResult<()> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|e| Error::IncompatibleSnapshot(format!("{}: {}", path.display(), e)))?;
    if magic != SNAPSHOT_MAGIC {
        return Err(Error::IncompatibleSnapshot(format!(
            "{}: bad magic {:02x?}",
            path.display(),
            magic
        )));
    }
    let version = r
        .read_u32::<BigEndian>()
        .map_err(|e| Error::IncompatibleSnapshot(format!("{}: {}", path.display(), e)))?;
    if version != SNAPSHOT_VERSION {
        return Err(Error::IncompatibleSnapshot(format!(
            "{}: version {} (supported: {})",
            path.display(),
            version,
            SNAPSHOT_VERSION
        )));
    }
    Ok(())
}

/// `<label>.keys.col`
pub fn keys_file(label: &str) -> String {
    format!("{}.keys.col", label)
}

/// `<label>.<prop>.col`
pub fn column_file(label: &str, prop: &str) -> String {
    format!("{}.{}.col", label, prop)
}

/// `<src>_<dst>_<edge>.{out,in}.adj`
pub fn adjacency_file(src: &str, dst: &str, edge: &str, outgoing: bool) -> String {
    format!(
        "{}_{}_{}.{}.adj",
        src,
        dst,
        edge,
        if outgoing { "out" } else { "in" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn header_roundtrip() -> CResult<()> {
        let mut buf = Vec::new();
        write_header(&mut buf)?;
        check_header(&mut Cursor::new(buf.as_slice()), Path::new("x"))?;
        Ok(())
    }

    #[test]
    fn bad_magic_is_incompatible() {
        let buf = b"NOPE\x00\x00\x00\x01".to_vec();
        let err = check_header(&mut Cursor::new(buf.as_slice()), Path::new("x")).unwrap_err();
        assert!(matches!(err, Error::IncompatibleSnapshot(_)));
    }

    #[test]
    fn bad_version_is_incompatible() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&99u32.to_be_bytes());
        let err = check_header(&mut Cursor::new(buf.as_slice()), Path::new("x")).unwrap_err();
        assert!(matches!(err, Error::IncompatibleSnapshot(_)));
    }

    #[test]
    fn file_names() {
        assert_eq!(keys_file("person"), "person.keys.col");
        assert_eq!(column_file("person", "age"), "person.age.col");
        assert_eq!(adjacency_file("person", "person", "knows", true), "person_person_knows.out.adj");
        assert_eq!(adjacency_file("person", "person", "knows", false), "person_person_knows.in.adj");
    }
}
