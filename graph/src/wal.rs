//! Write-ahead log.
//!
//! Every committed transaction appends exactly one record, even when it did
//! nothing, so the timestamp sequence in the log stays contiguous for replay.
//! Records are framed as:
//!
//! - Total size as big-endian u32 (header included).
//! - Commit timestamp as big-endian u32.
//! - Kind byte: 0 = insert, 1 = update.
//! - `size - 9` bytes of body.
//!
//! Each session owns one `wal_<session_id>.log` file. Ordering across
//! sessions is not a writer concern: restart collects every file, sorts the
//! records globally by timestamp and replays insert runs in parallel with
//! update records as sequential barriers between them.

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::graph::MutablePropertyFragment;
use crate::property::types::{LabelId, Oid, PropertyValue, Vid};
use crate::txn::overlay::{EdgeKey, OverlayStore};
use crate::version::Timestamp;

pub const KIND_INSERT: u8 = 0;
pub const KIND_UPDATE: u8 = 1;

const HEADER_SIZE: u32 = 9;

/// One buffered operation of an insert-family transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum InsertOp {
    AddVertex {
        label: LabelId,
        oid: Oid,
        props: Vec<PropertyValue>,
    },
    AddEdge {
        src_label: LabelId,
        src_oid: Oid,
        dst_label: LabelId,
        dst_oid: Oid,
        elabel: LabelId,
        data: Vec<u8>,
    },
}

/// One delta of an update-family transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOp {
    VertexProp {
        label: LabelId,
        vid: Vid,
        prop_idx: u16,
        value: PropertyValue,
    },
    EdgeProp {
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
        data: Vec<u8>,
    },
    EdgeTombstone {
        src_label: LabelId,
        src_vid: Vid,
        dst_label: LabelId,
        dst_vid: Vid,
        elabel: LabelId,
    },
}

pub fn encode_insert_body(ops: &[InsertOp], buf: &mut BytesMut) {
    for op in ops {
        match op {
            InsertOp::AddVertex { label, oid, props } => {
                buf.put_u8(0);
                buf.put_u8(*label);
                oid.encode(buf);
                let mut blob = BytesMut::new();
                for value in props {
                    value.encode(&mut blob);
                }
                buf.put_u32(blob.len() as u32);
                buf.put(blob);
            }
            InsertOp::AddEdge { src_label, src_oid, dst_label, dst_oid, elabel, data } => {
                buf.put_u8(1);
                buf.put_u8(*src_label);
                src_oid.encode(buf);
                buf.put_u8(*dst_label);
                dst_oid.encode(buf);
                buf.put_u8(*elabel);
                buf.put_u32(data.len() as u32);
                buf.put(data.as_slice());
            }
        }
    }
}

pub fn decode_insert_body(body: &[u8]) -> CResult<Vec<InsertOp>> {
    let mut cursor = Cursor::new(body);
    let mut ops = Vec::new();
    while cursor.position() < body.len() as u64 {
        match cursor.read_u8()? {
            0 => {
                let label = cursor.read_u8()?;
                let oid = Oid::decode(&mut cursor)?;
                let blob_len = cursor.read_u32::<BigEndian>()? as u64;
                let blob_end = cursor.position() + blob_len;
                let mut props = Vec::new();
                while cursor.position() < blob_end {
                    props.push(PropertyValue::decode(&mut cursor)?);
                }
                if cursor.position() != blob_end {
                    return Err(Error::Internal("vertex property blob overran".to_string()));
                }
                ops.push(InsertOp::AddVertex { label, oid, props });
            }
            1 => {
                let src_label = cursor.read_u8()?;
                let src_oid = Oid::decode(&mut cursor)?;
                let dst_label = cursor.read_u8()?;
                let dst_oid = Oid::decode(&mut cursor)?;
                let elabel = cursor.read_u8()?;
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let mut data = vec![0; len];
                cursor.read_exact(&mut data)?;
                ops.push(InsertOp::AddEdge { src_label, src_oid, dst_label, dst_oid, elabel, data });
            }
            tag => {
                return Err(Error::Internal(format!("unknown insert op tag {}", tag)));
            }
        }
    }
    Ok(ops)
}

pub fn encode_update_body(ops: &[UpdateOp], buf: &mut BytesMut) {
    for op in ops {
        match op {
            UpdateOp::VertexProp { label, vid, prop_idx, value } => {
                buf.put_u8(0);
                buf.put_u8(*label);
                buf.put_u32(*vid);
                buf.put_u16(*prop_idx);
                value.encode(buf);
            }
            UpdateOp::EdgeProp { src_label, src_vid, dst_label, dst_vid, elabel, data } => {
                buf.put_u8(1);
                buf.put_u8(*src_label);
                buf.put_u32(*src_vid);
                buf.put_u8(*dst_label);
                buf.put_u32(*dst_vid);
                buf.put_u8(*elabel);
                buf.put_u32(data.len() as u32);
                buf.put(data.as_slice());
            }
            UpdateOp::EdgeTombstone { src_label, src_vid, dst_label, dst_vid, elabel } => {
                buf.put_u8(2);
                buf.put_u8(*src_label);
                buf.put_u32(*src_vid);
                buf.put_u8(*dst_label);
                buf.put_u32(*dst_vid);
                buf.put_u8(*elabel);
            }
        }
    }
}

pub fn decode_update_body(body: &[u8]) -> CResult<Vec<UpdateOp>> {
    let mut cursor = Cursor::new(body);
    let mut ops = Vec::new();
    while cursor.position() < body.len() as u64 {
        match cursor.read_u8()? {
            0 => {
                let label = cursor.read_u8()?;
                let vid = cursor.read_u32::<BigEndian>()?;
                let prop_idx = cursor.read_u16::<BigEndian>()?;
                let value = PropertyValue::decode(&mut cursor)?;
                ops.push(UpdateOp::VertexProp { label, vid, prop_idx, value });
            }
            1 => {
                let src_label = cursor.read_u8()?;
                let src_vid = cursor.read_u32::<BigEndian>()?;
                let dst_label = cursor.read_u8()?;
                let dst_vid = cursor.read_u32::<BigEndian>()?;
                let elabel = cursor.read_u8()?;
                let len = cursor.read_u32::<BigEndian>()? as usize;
                let mut data = vec![0; len];
                cursor.read_exact(&mut data)?;
                ops.push(UpdateOp::EdgeProp { src_label, src_vid, dst_label, dst_vid, elabel, data });
            }
            2 => {
                let src_label = cursor.read_u8()?;
                let src_vid = cursor.read_u32::<BigEndian>()?;
                let dst_label = cursor.read_u8()?;
                let dst_vid = cursor.read_u32::<BigEndian>()?;
                let elabel = cursor.read_u8()?;
                ops.push(UpdateOp::EdgeTombstone { src_label, src_vid, dst_label, dst_vid, elabel });
            }
            tag => {
                return Err(Error::Internal(format!("unknown update op tag {}", tag)));
            }
        }
    }
    Ok(ops)
}

/// A parsed record, before op decoding.
#[derive(Clone, Debug, PartialEq)]
pub struct WalRecord {
    pub ts: Timestamp,
    pub kind: u8,
    pub body: Vec<u8>,
}

/// Per-session appender. Holds an exclusive lock on its file for the life of
/// the writer.
pub struct WalWriter {
    path: PathBuf,
    file: File,
}

impl WalWriter {
    pub fn open(wal_dir: &Path, session_id: usize) -> CResult<Self> {
        std::fs::create_dir_all(wal_dir)?;
        let path = wal_dir.join(format!("wal_{}.log", session_id));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive()?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one framed record. Failures here or in `flush` are durability
    /// failures: the caller must abort its transaction.
    pub fn append(&mut self, ts: Timestamp, kind: u8, body: &[u8]) -> CResult<()> {
        self.append_inner(ts, kind, body)
            .map_err(|e| Error::Durability(format!("{}: {}", self.path.display(), e)))
    }

    fn append_inner(&mut self, ts: Timestamp, kind: u8, body: &[u8]) -> std::io::Result<()> {
        let size = HEADER_SIZE + body.len() as u32;
        self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(size as usize, &mut self.file);
        w.write_all(&size.to_be_bytes())?;
        w.write_all(&ts.to_be_bytes())?;
        w.write_all(&[kind])?;
        w.write_all(body)?;
        w.flush()?;
        Ok(())
    }

    /// Returns only after the bytes reached durable storage.
    pub fn flush(&mut self) -> CResult<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::Durability(format!("{}: {}", self.path.display(), e)))
    }
}

/// Attempt to flush the file when the writer is closed.
impl Drop for WalWriter {
    fn drop(&mut self) {
        if let Err(error) = self.flush() {
            log::error!("failed to flush wal: {}", error)
        }
    }
}

/// Parses one WAL segment. An incomplete record at the end of the file is an
/// interrupted write: it is logged, the file is truncated back to the last
/// whole record and parsing stops. Anything else malformed is fatal.
fn scan_segment(path: &Path, records: &mut Vec<WalRecord>) -> CResult<()> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let file_len = file.metadata()?.len();
    let mut r = BufReader::new(&file);
    let mut pos = r.seek(SeekFrom::Start(0))?;

    while pos < file_len {
        let mut read_record = || -> Result<WalRecord, std::io::Error> {
            let mut len_buf = [0u8; 4];
            r.read_exact(&mut len_buf)?;
            let size = u32::from_be_bytes(len_buf);
            if size < HEADER_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("record size {} below header size", size),
                ));
            }
            r.read_exact(&mut len_buf)?;
            let ts = u32::from_be_bytes(len_buf);
            let mut kind = [0u8; 1];
            r.read_exact(&mut kind)?;
            let mut body = vec![0; (size - HEADER_SIZE) as usize];
            r.read_exact(&mut body)?;
            Ok(WalRecord { ts, kind: kind[0], body })
        };

        match read_record() {
            Ok(record) => {
                pos += HEADER_SIZE as u64 + record.body.len() as u64;
                records.push(record);
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::warn!(
                    "{}: incomplete record at offset {}, truncating",
                    path.display(),
                    pos
                );
                file.set_len(pos)?;
                break;
            }
            Err(err) => {
                return Err(Error::Internal(format!("{}: {}", path.display(), err)));
            }
        }
    }
    Ok(())
}

/// Collects every record from every `wal_*.log` under `wal_dir`, sorted
/// globally by timestamp.
pub fn scan_wal_dir(wal_dir: &Path) -> CResult<Vec<WalRecord>> {
    let mut records = Vec::new();
    if !wal_dir.exists() {
        return Ok(records);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(wal_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("wal_") && n.ends_with(".log"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    for path in paths {
        scan_segment(&path, &mut records)?;
    }
    records.sort_by_key(|r| r.ts);
    Ok(records)
}

/// Replays sorted records into an empty-of-WAL fragment.
///
/// Insert runs between update records replay in two passes: a sequential
/// key pass assigns vids in timestamp order (so assignment is deterministic),
/// then property and edge application fans out across `threads` workers.
/// A stable per-list timestamp sort afterwards restores live insertion
/// order. Update records replay sequentially; their overlays are
/// order-sensitive.
pub fn ingest(
    records: &[WalRecord],
    fragment: &MutablePropertyFragment,
    overlays: &OverlayStore,
    threads: usize,
) -> CResult<()> {
    let mut run: Vec<(Timestamp, Vec<InsertOp>)> = Vec::new();
    for record in records {
        match record.kind {
            KIND_INSERT => {
                run.push((record.ts, decode_insert_body(&record.body)?));
            }
            KIND_UPDATE => {
                replay_insert_run(&run, fragment, threads)?;
                run.clear();
                replay_update_record(record, fragment, overlays)?;
            }
            kind => {
                return Err(Error::Internal(format!("unknown wal record kind {}", kind)));
            }
        }
    }
    replay_insert_run(&run, fragment, threads)?;
    Ok(())
}

fn replay_insert_run(
    run: &[(Timestamp, Vec<InsertOp>)],
    fragment: &MutablePropertyFragment,
    threads: usize,
) -> CResult<()> {
    if run.is_empty() {
        return Ok(());
    }
    // Key pass: sequential, in timestamp order.
    for (ts, ops) in run {
        for op in ops {
            if let InsertOp::AddVertex { label, oid, .. } = op {
                fragment.register_vertex(*label, oid.clone(), *ts)?;
            }
        }
    }
    // Payload pass: properties and edges, fanned out.
    let workers = std::cmp::max(1, threads);
    let chunk = (run.len() + workers - 1) / workers;
    std::thread::scope(|scope| -> CResult<()> {
        let mut handles = Vec::new();
        for part in run.chunks(chunk) {
            handles.push(scope.spawn(move || -> CResult<()> {
                for (ts, ops) in part {
                    for op in ops {
                        replay_insert_op(op, fragment, *ts)?;
                    }
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::Internal("wal replay worker panicked".to_string()))??;
        }
        Ok(())
    })?;
    fragment.sort_adjacency_by_ts()?;
    Ok(())
}

fn replay_insert_op(op: &InsertOp, fragment: &MutablePropertyFragment, ts: Timestamp) -> CResult<()> {
    match op {
        InsertOp::AddVertex { label, oid, props } => {
            let vid = fragment.lookup(*label, oid)?;
            for (idx, value) in props.iter().enumerate() {
                fragment.set_vertex_prop(*label, vid, idx, value)?;
            }
        }
        InsertOp::AddEdge { src_label, src_oid, dst_label, dst_oid, elabel, data } => {
            let src_vid = fragment.lookup(*src_label, src_oid)?;
            let dst_vid = fragment.lookup(*dst_label, dst_oid)?;
            fragment.add_edge(*src_label, src_vid, *dst_label, dst_vid, *elabel, data, ts)?;
        }
    }
    Ok(())
}

fn replay_update_record(
    record: &WalRecord,
    fragment: &MutablePropertyFragment,
    overlays: &OverlayStore,
) -> CResult<()> {
    for op in decode_update_body(&record.body)? {
        match op {
            UpdateOp::VertexProp { label, vid, prop_idx, value } => {
                overlays.put_vertex((label, vid, prop_idx), record.ts, value)?;
            }
            UpdateOp::EdgeProp { src_label, src_vid, dst_label, dst_vid, elabel, data } => {
                overlays.put_edge(
                    EdgeKey { src_label, src_vid, dst_label, dst_vid, elabel },
                    record.ts,
                    data,
                )?;
            }
            UpdateOp::EdgeTombstone { src_label, src_vid, dst_label, dst_vid, elabel } => {
                fragment.tombstone_edge(src_label, src_vid, dst_label, dst_vid, elabel, record.ts)?;
            }
        }
    }
    Ok(())
}

/// The highest timestamp in a sorted record stream.
pub fn last_timestamp(records: &[WalRecord]) -> Timestamp {
    records.last().map(|r| r.ts).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_body_roundtrip() -> CResult<()> {
        let ops = vec![
            InsertOp::AddVertex {
                label: 0,
                oid: Oid::Int64(10),
                props: vec![PropertyValue::Int64(42), PropertyValue::String("x".to_string())],
            },
            InsertOp::AddEdge {
                src_label: 0,
                src_oid: Oid::Int64(10),
                dst_label: 0,
                dst_oid: Oid::Int64(11),
                elabel: 0,
                data: 7i64.to_be_bytes().to_vec(),
            },
        ];
        let mut buf = BytesMut::new();
        encode_insert_body(&ops, &mut buf);
        assert_eq!(decode_insert_body(&buf)?, ops);
        Ok(())
    }

    #[test]
    fn update_body_roundtrip() -> CResult<()> {
        let ops = vec![
            UpdateOp::VertexProp { label: 0, vid: 3, prop_idx: 1, value: PropertyValue::Int64(5) },
            UpdateOp::EdgeProp {
                src_label: 0,
                src_vid: 1,
                dst_label: 0,
                dst_vid: 2,
                elabel: 0,
                data: vec![0; 8],
            },
            UpdateOp::EdgeTombstone { src_label: 0, src_vid: 1, dst_label: 0, dst_vid: 2, elabel: 0 },
        ];
        let mut buf = BytesMut::new();
        encode_update_body(&ops, &mut buf);
        assert_eq!(decode_update_body(&buf)?, ops);
        Ok(())
    }

    #[test]
    fn writer_frames_and_scanner_sorts() -> CResult<()> {
        let dir = tempdir::TempDir::new("wal")?;
        let wal_dir = dir.path().join("wal");

        let mut w0 = WalWriter::open(&wal_dir, 0)?;
        let mut w1 = WalWriter::open(&wal_dir, 1)?;
        w1.append(2, KIND_INSERT, b"bb")?;
        w0.append(1, KIND_INSERT, b"a")?;
        w0.append(3, KIND_UPDATE, b"")?;
        w0.flush()?;
        w1.flush()?;
        drop(w0);
        drop(w1);

        let records = scan_wal_dir(&wal_dir)?;
        assert_eq!(
            records,
            vec![
                WalRecord { ts: 1, kind: KIND_INSERT, body: b"a".to_vec() },
                WalRecord { ts: 2, kind: KIND_INSERT, body: b"bb".to_vec() },
                WalRecord { ts: 3, kind: KIND_UPDATE, body: vec![] },
            ]
        );
        assert_eq!(last_timestamp(&records), 3);
        Ok(())
    }

    #[test]
    fn wal_files_are_locked() -> CResult<()> {
        let dir = tempdir::TempDir::new("wal")?;
        let wal_dir = dir.path().join("wal");
        let w = WalWriter::open(&wal_dir, 0)?;
        assert!(WalWriter::open(&wal_dir, 0).is_err());
        drop(w);
        assert!(WalWriter::open(&wal_dir, 0).is_ok());
        Ok(())
    }

    #[test]
    /// Sorted records rebuild the fragment: inserts in parallel ranges,
    /// updates as sequential barriers carrying overlays and tombstones.
    fn ingest_rebuilds_fragment() -> CResult<()> {
        use crate::schema::{EdgeStrategy, Schema, StorageStrategy};

        let mut schema = Schema::new();
        schema
            .add_vertex_label(
                "person",
                vec![crate::property::types::PropertyType::Int64],
                vec!["v".to_string()],
                "id",
                crate::property::types::PropertyType::Int64,
                vec![StorageStrategy::Memory],
                64,
            )
            .unwrap();
        schema
            .add_edge_label(
                "person",
                "person",
                "knows",
                vec![crate::property::types::PropertyType::Int64],
                vec!["weight".to_string()],
                EdgeStrategy::Multiple,
                EdgeStrategy::Multiple,
            )
            .unwrap();
        let fragment = MutablePropertyFragment::new(schema);
        let overlays = OverlayStore::new();

        let mut records = Vec::new();
        let mut body = BytesMut::new();
        encode_insert_body(
            &[
                InsertOp::AddVertex { label: 0, oid: Oid::Int64(1), props: vec![PropertyValue::Int64(10)] },
                InsertOp::AddVertex { label: 0, oid: Oid::Int64(2), props: vec![PropertyValue::Int64(20)] },
                InsertOp::AddEdge {
                    src_label: 0,
                    src_oid: Oid::Int64(1),
                    dst_label: 0,
                    dst_oid: Oid::Int64(2),
                    elabel: 0,
                    data: 7i64.to_be_bytes().to_vec(),
                },
            ],
            &mut body,
        );
        records.push(WalRecord { ts: 1, kind: KIND_INSERT, body: body.to_vec() });

        let mut body = BytesMut::new();
        encode_update_body(
            &[
                UpdateOp::VertexProp { label: 0, vid: 0, prop_idx: 0, value: PropertyValue::Int64(11) },
                UpdateOp::EdgeTombstone { src_label: 0, src_vid: 0, dst_label: 0, dst_vid: 1, elabel: 0 },
            ],
            &mut body,
        );
        records.push(WalRecord { ts: 2, kind: KIND_UPDATE, body: body.to_vec() });

        let mut body = BytesMut::new();
        encode_insert_body(
            &[InsertOp::AddVertex { label: 0, oid: Oid::Int64(3), props: vec![PropertyValue::Int64(30)] }],
            &mut body,
        );
        records.push(WalRecord { ts: 3, kind: KIND_INSERT, body: body.to_vec() });

        ingest(&records, &fragment, &overlays, 2)?;

        assert_eq!(fragment.vertex_num(0)?, 3);
        assert_eq!(fragment.lookup(0, &Oid::Int64(3))?, 2);
        assert_eq!(fragment.get_vertex_prop(0, 0, 0)?, PropertyValue::Int64(10));
        assert_eq!(overlays.vertex_at(&(0, 0, 0), 2)?, Some(PropertyValue::Int64(11)));
        // The edge exists at ts 1 and is tombstoned from ts 2 on.
        assert_eq!(fragment.get_outgoing_edges(0, 0, 0, 0, 1)?.len(), 1);
        assert!(fragment.get_outgoing_edges(0, 0, 0, 0, 2)?.is_empty());
        // Visibility follows the record timestamps.
        assert_eq!(fragment.visible_vertex_num(0, 1)?, 2);
        assert_eq!(fragment.visible_vertex_num(0, 3)?, 3);
        Ok(())
    }

    #[test]
    /// A torn tail is detected, logged and cut off; whole records survive.
    fn truncated_tail_is_recovered() -> CResult<()> {
        let dir = tempdir::TempDir::new("wal")?;
        let wal_dir = dir.path().join("wal");
        let mut w = WalWriter::open(&wal_dir, 0)?;
        w.append(1, KIND_INSERT, b"whole")?;
        w.append(2, KIND_INSERT, b"torn")?;
        w.flush()?;
        let path = w.path().to_path_buf();
        drop(w);

        let full = std::fs::metadata(&path)?.len();
        let f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.set_len(full - 2)?;
        drop(f);

        let records = scan_wal_dir(&wal_dir)?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ts, 1);
        // The tail was cut, a reopened writer appends cleanly.
        let mut w = WalWriter::open(&wal_dir, 0)?;
        w.append(3, KIND_INSERT, b"after")?;
        w.flush()?;
        drop(w);
        assert_eq!(scan_wal_dir(&wal_dir)?.len(), 2);
        Ok(())
    }
}
