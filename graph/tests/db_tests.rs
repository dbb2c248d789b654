//! End-to-end scenarios over the public surface: insert/read visibility,
//! duplicate keys, WAL replay after a crash, update snapshot ordering,
//! concurrent adjacency growth and procedure retry.

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use graph::codec::{Decoder, Encoder};
use graph::db::{GraphDb, GraphDbConfig};
use graph::error::{CResult, Error};
use graph::procedure::{Procedure, ProcedureFactory, ProcedureKind};
use graph::property::types::{Oid, PropertyType, PropertyValue};
use graph::schema::{EdgeStrategy, Schema, StorageStrategy};
use graph::session::Session;

fn person_schema(prop: &str) -> Schema {
    let mut schema = Schema::new();
    schema
        .add_vertex_label(
            "person",
            vec![PropertyType::Int64],
            vec![prop.to_string()],
            "id",
            PropertyType::Int64,
            vec![StorageStrategy::Memory],
            1 << 16,
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

fn open(dir: &Path, sessions: usize, schema: Schema) -> CResult<GraphDb> {
    GraphDb::open(GraphDbConfig::new(dir).session_num(sessions), schema)
}

#[test]
/// Insert one vertex, read it back in a later transaction.
fn insert_then_read() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let db = open(dir.path(), 1, person_schema("v"))?;

    let mut session = db.session(0)?;
    let mut txn = session.single_vertex_insert_transaction()?;
    txn.add_vertex(0, Oid::Int64(10), vec![PropertyValue::Int64(42)])?;
    txn.commit()?;
    drop(session);

    let txn = db.read_transaction()?;
    let vid = txn.get_vertex(0, &Oid::Int64(10))?;
    assert_eq!(vid, 0);
    assert_eq!(txn.get_vertex_property(0, vid, "v")?, PropertyValue::Int64(42));
    Ok(())
}

#[test]
/// A re-used primary key fails the whole transaction and leaves the first
/// value in place.
fn duplicate_key_rejected() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let db = open(dir.path(), 1, person_schema("v"))?;

    let mut session = db.session(0)?;
    let mut txn = session.insert_transaction()?;
    txn.add_vertex(0, Oid::Int64(10), vec![PropertyValue::Int64(42)])?;
    txn.commit()?;

    let mut txn = session.insert_transaction()?;
    txn.add_vertex(0, Oid::Int64(10), vec![PropertyValue::Int64(2)])?;
    assert!(matches!(txn.commit().unwrap_err(), Error::DuplicateKey(_)));
    drop(session);

    let txn = db.read_transaction()?;
    assert_eq!(txn.vertex_num(0)?, 1);
    let vid = txn.get_vertex(0, &Oid::Int64(10))?;
    assert_eq!(txn.get_vertex_property(0, vid, "v")?, PropertyValue::Int64(42));
    Ok(())
}

#[test]
/// Crash (drop without compact) and restart: the WAL rebuilds the exact
/// fragment, proven by re-serialization equality.
fn wal_replay_after_crash() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let before = tempdir::TempDir::new("before")?;
    let after = tempdir::TempDir::new("after")?;
    let schema = person_schema("v");

    {
        let db = open(dir.path(), 2, schema.clone())?;
        let mut session = db.session(0)?;
        let mut txn = session.insert_transaction()?;
        for i in 1..=100i64 {
            txn.add_vertex(0, Oid::Int64(i), vec![PropertyValue::Int64(i)])?;
        }
        txn.commit()?;
        for i in 1..=99i64 {
            let mut txn = session.single_edge_insert_transaction()?;
            txn.add_edge(0, Oid::Int64(i), 0, Oid::Int64(i + 1), 0, &[PropertyValue::Int64(i)])?;
            txn.commit()?;
        }
        drop(session);
        db.serialize(before.path())?;
        // Dropped here without any compaction: the crash.
    }

    let db = open(dir.path(), 2, schema)?;
    let txn = db.read_transaction()?;
    assert_eq!(txn.vertex_num(0)?, 100);
    for i in 1..=99i64 {
        let vid = txn.get_vertex(0, &Oid::Int64(i))?;
        let edges: Vec<_> = txn.get_outgoing_edges(0, vid, 0, 0)?.collect();
        assert_eq!(edges.len(), 1, "vertex {} has {} edges", i, edges.len());
        assert_eq!(txn.get_oid(0, edges[0].neighbor)?, Oid::Int64(i + 1));
        assert_eq!(
            txn.decode_edge_props(0, 0, 0, &edges[0].data)?,
            vec![PropertyValue::Int64(i)]
        );
    }
    drop(txn);

    db.serialize(after.path())?;
    for entry in std::fs::read_dir(before.path())? {
        let entry = entry?;
        let a = std::fs::read(entry.path())?;
        let b = std::fs::read(after.path().join(entry.file_name()))?;
        assert_eq!(a, b, "{:?} differs after replay", entry.file_name());
    }
    Ok(())
}

#[test]
/// An open read transaction keeps its snapshot across an update commit;
/// a fresh one sees the overlay.
fn update_visibility_ordering() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let db = open(dir.path(), 1, person_schema("n"))?;

    let mut session = db.session(0)?;
    let mut txn = session.single_vertex_insert_transaction()?;
    txn.add_vertex(0, Oid::Int64(1), vec![PropertyValue::Int64(0)])?;
    txn.commit()?;

    let reader = db.read_transaction()?;
    let vid = reader.get_vertex(0, &Oid::Int64(1))?;
    assert_eq!(reader.get_vertex_property(0, vid, "n")?, PropertyValue::Int64(0));

    let mut update = session.update_transaction()?;
    update.set_vertex_property(0, vid, "n", PropertyValue::Int64(5))?;
    // The transaction sees its own write before commit.
    assert_eq!(update.get_vertex_property(0, vid, "n")?, PropertyValue::Int64(5));
    update.commit()?;
    drop(session);

    // The old snapshot still reads 0.
    assert_eq!(reader.get_vertex_property(0, vid, "n")?, PropertyValue::Int64(0));
    reader.commit();

    let reader = db.read_transaction()?;
    assert_eq!(reader.get_vertex_property(0, vid, "n")?, PropertyValue::Int64(5));
    Ok(())
}

#[test]
/// 1000 parallel insert transactions each add one outgoing edge from the
/// same vertex; afterwards all 1000 are present exactly once.
fn concurrent_adjacency_growth() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let sessions = 4;
    let per_session = 250i64;
    let db = open(dir.path(), sessions, person_schema("v"))?;

    {
        let mut session = db.session(0)?;
        let mut txn = session.single_vertex_insert_transaction()?;
        txn.add_vertex(0, Oid::Int64(0), vec![PropertyValue::Int64(0)])?;
        txn.commit()?;
    }

    std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for s in 0..sessions {
            let db = &db;
            handles.push(scope.spawn(move || -> CResult<()> {
                let mut session = db.session(s)?;
                for k in 0..per_session {
                    let fresh = 1 + s as i64 * per_session + k;
                    let mut txn = session.insert_transaction()?;
                    txn.add_vertex(0, Oid::Int64(fresh), vec![PropertyValue::Int64(fresh)])?;
                    txn.add_edge(0, Oid::Int64(0), 0, Oid::Int64(fresh), 0, &[PropertyValue::Int64(fresh)])?;
                    txn.commit()?;
                }
                Ok(())
            }));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
    });

    let txn = db.read_transaction()?;
    assert_eq!(txn.vertex_num(0)?, 1001);
    let u = txn.get_vertex(0, &Oid::Int64(0))?;
    let edges: Vec<_> = txn.get_outgoing_edges(0, u, 0, 0)?.collect();
    assert_eq!(edges.len(), 1000);
    let mut seen: Vec<i64> = Vec::with_capacity(1000);
    for edge in &edges {
        match txn.get_oid(0, edge.neighbor)? {
            Oid::Int64(oid) => seen.push(oid),
            other => panic!("unexpected key {:?}", other),
        }
    }
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 1000);
    Ok(())
}

/// Fails its first invocation per session, succeeds afterwards.
struct Flaky {
    failed_once: bool,
}

struct FlakyFactory;

impl ProcedureFactory for FlakyFactory {
    fn create(&self) -> Box<dyn Procedure> {
        Box::new(Flaky { failed_once: false })
    }
}

impl Procedure for Flaky {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::Read
    }

    fn invoke(&mut self, _: &mut Session, _: &mut Decoder, output: &mut Encoder) -> bool {
        if !self.failed_once {
            self.failed_once = true;
            return false;
        }
        output.put_i32(1);
        true
    }
}

#[test]
/// One transient failure is absorbed by the retry loop and counted.
fn procedure_retry() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let mut schema = person_schema("v");
    schema.add_procedure("flaky", "builtin", 1)?;
    let db = open(dir.path(), 1, schema)?;
    db.register_procedure("flaky", Arc::new(FlakyFactory))?;

    let response = db.eval(0, &[1u8])?;
    let mut dec = Decoder::new(&response);
    assert_eq!(dec.get_i32()?, 1);

    let session = db.session(0)?;
    assert_eq!(session.metrics().query_num, 1);
    assert_eq!(session.metrics().retry_num, 1);
    assert_eq!(session.metrics().proc(1).count, 1);
    Ok(())
}

#[test]
/// Unknown procedure ids and exhausted retries surface as errors.
fn procedure_failures() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let db = open(dir.path(), 1, person_schema("v"))?;

    assert!(matches!(db.eval(0, &[99u8]).unwrap_err(), Error::NotFound(_)));
    assert!(matches!(db.eval(0, &[]).unwrap_err(), Error::InvalidInput(_)));

    // The server procedure with an unknown admin op never succeeds.
    let mut enc = Encoder::new();
    enc.put_string("NO_SUCH_OP");
    let mut payload = enc.as_slice().to_vec();
    payload.push(0);
    assert!(matches!(db.eval(0, &payload).unwrap_err(), Error::QueryFailed(_)));
    Ok(())
}

#[test]
/// The built-in server procedure answers the admin commands.
fn server_procedure_queries() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let mut schema = person_schema("v");
    schema.add_procedure("khop", "plugins/libkhop.so", 3)?;
    let db = open(dir.path(), 1, schema)?;

    let mut session = db.session(0)?;
    let mut txn = session.insert_transaction()?;
    txn.add_vertex(0, Oid::Int64(10), vec![PropertyValue::Int64(42)])?;
    txn.add_vertex(0, Oid::Int64(11), vec![PropertyValue::Int64(43)])?;
    txn.add_edge(0, Oid::Int64(10), 0, Oid::Int64(11), 0, &[PropertyValue::Int64(7)])?;
    txn.commit()?;
    drop(session);

    let mut enc = Encoder::new();
    enc.put_string("SHOW_STORED_PROCEDURES");
    let mut payload = enc.as_slice().to_vec();
    payload.push(0);
    let response = db.eval(0, &payload)?;
    let mut dec = Decoder::new(&response);
    assert_eq!(dec.get_str()?, "3\tkhop\tplugins/libkhop.so\n");
    assert_eq!(db.app_info(), "3\tkhop\tplugins/libkhop.so\n");

    let mut enc = Encoder::new();
    enc.put_string("QUERY_VERTEX");
    enc.put_string("person");
    enc.put_i64(10);
    let mut payload = enc.as_slice().to_vec();
    payload.push(0);
    let response = db.eval(0, &payload)?;
    let mut dec = Decoder::new(&response);
    assert_eq!(dec.get_i32()?, 1);
    assert_eq!(dec.get_str()?, "42");

    let mut enc = Encoder::new();
    enc.put_string("QUERY_EDGE");
    enc.put_string("person");
    enc.put_i64(10);
    enc.put_string("person");
    enc.put_i64(11);
    enc.put_string("knows");
    let mut payload = enc.as_slice().to_vec();
    payload.push(0);
    let response = db.eval(0, &payload)?;
    let mut dec = Decoder::new(&response);
    assert_eq!(dec.get_i32()?, 1);
    assert_eq!(dec.get_str()?, "7");
    Ok(())
}

#[test]
/// Edge tombstones hide the edge from new readers but not from old ones,
/// and replay preserves them.
fn tombstone_visibility_and_replay() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let schema = person_schema("v");
    {
        let db = open(dir.path(), 1, schema.clone())?;
        let mut session = db.session(0)?;
        let mut txn = session.insert_transaction()?;
        txn.add_vertex(0, Oid::Int64(1), vec![PropertyValue::Int64(1)])?;
        txn.add_vertex(0, Oid::Int64(2), vec![PropertyValue::Int64(2)])?;
        txn.add_edge(0, Oid::Int64(1), 0, Oid::Int64(2), 0, &[PropertyValue::Int64(9)])?;
        txn.commit()?;

        let reader = db.read_transaction()?;
        let u = reader.get_vertex(0, &Oid::Int64(1))?;
        let v = reader.get_vertex(0, &Oid::Int64(2))?;

        let mut update = session.update_transaction()?;
        update.tombstone_edge(0, u, 0, v, 0)?;
        update.commit()?;
        drop(session);

        // The old reader still sees it, a new one does not.
        assert_eq!(reader.get_outgoing_edges(0, u, 0, 0)?.len(), 1);
        reader.commit();
        let reader = db.read_transaction()?;
        assert_eq!(reader.get_outgoing_edges(0, u, 0, 0)?.len(), 0);
        assert_eq!(reader.get_incoming_edges(0, v, 0, 0)?.len(), 0);
    }

    let db = open(dir.path(), 1, schema)?;
    let reader = db.read_transaction()?;
    let u = reader.get_vertex(0, &Oid::Int64(1))?;
    assert_eq!(reader.get_outgoing_edges(0, u, 0, 0)?.len(), 0);
    Ok(())
}

#[test]
/// batch_commit applies a prebuilt delta list in one update transaction.
fn batch_update() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let db = open(dir.path(), 1, person_schema("v"))?;

    let mut session = db.session(0)?;
    let mut txn = session.insert_transaction()?;
    txn.add_vertex(0, Oid::Int64(1), vec![PropertyValue::Int64(1)])?;
    txn.add_vertex(0, Oid::Int64(2), vec![PropertyValue::Int64(2)])?;
    txn.add_edge(0, Oid::Int64(1), 0, Oid::Int64(2), 0, &[PropertyValue::Int64(5)])?;
    txn.commit()?;

    let mut batch = graph::txn::UpdateBatch::new();
    batch.overwrite_vertex("person", Oid::Int64(1), "v", PropertyValue::Int64(100));
    batch.overwrite_edge(
        "person",
        Oid::Int64(1),
        "person",
        Oid::Int64(2),
        "knows",
        vec![PropertyValue::Int64(50)],
    );
    session.batch_update(batch)?;
    drop(session);

    let txn = db.read_transaction()?;
    let u = txn.get_vertex(0, &Oid::Int64(1))?;
    assert_eq!(txn.get_vertex_property(0, u, "v")?, PropertyValue::Int64(100));
    let edges: Vec<_> = txn.get_outgoing_edges(0, u, 0, 0)?.collect();
    assert_eq!(
        txn.decode_edge_props(0, 0, 0, &edges[0].data)?,
        vec![PropertyValue::Int64(50)]
    );
    Ok(())
}

#[test]
/// A compaction proposal right after startup is below the gating interval
/// and aborts silently.
fn compaction_is_gated() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    let db = open(dir.path(), 1, person_schema("v"))?;

    let mut session = db.session(0)?;
    let mut txn = session.single_vertex_insert_transaction()?;
    txn.add_vertex(0, Oid::Int64(1), vec![PropertyValue::Int64(1)])?;
    txn.commit()?;

    assert!(!session.compact()?);
    drop(session);

    // The silent abort still released its timestamp: writes continue.
    let mut session = db.session(0)?;
    let mut txn = session.single_vertex_insert_transaction()?;
    txn.add_vertex(0, Oid::Int64(2), vec![PropertyValue::Int64(2)])?;
    txn.commit()?;
    drop(session);
    assert_eq!(db.read_transaction()?.vertex_num(0)?, 2);
    Ok(())
}

#[test]
/// Opening a directory that holds a different schema is a conflict.
fn schema_conflict_on_reopen() -> CResult<()> {
    let dir = tempdir::TempDir::new("db")?;
    {
        open(dir.path(), 1, person_schema("v"))?;
    }
    let err = open(dir.path(), 1, person_schema("other")).unwrap_err();
    assert!(matches!(err, Error::SchemaConflict(_)));
    Ok(())
}
