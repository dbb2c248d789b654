//! `graph-rs` is an in-memory, mutable property-graph storage engine.
//! Vertices and edges live in per-label columnar tables and versioned
//! adjacency lists; every mutation goes through a transaction that appends
//! to a write-ahead log before it becomes visible, and restart replays the
//! log on top of the last snapshot. Queries run as stored procedures
//! dispatched through per-thread sessions. [Author fengyang]
//!
//! ## Getting started
//!
//! ```rust
//! use graph::db::{GraphDb, GraphDbConfig};
//! use graph::property::types::{Oid, PropertyType, PropertyValue};
//! use graph::schema::{EdgeStrategy, Schema, StorageStrategy};
//!
//! fn main() {
//!     run().unwrap();
//! }
//!
//! fn run() -> Result<(), graph::error::Error> {
//!     let dir = tempdir::TempDir::new("demo")?.path().join("graphdb");
//!
//!     let mut schema = Schema::new();
//!     schema.add_vertex_label(
//!         "person",
//!         vec![PropertyType::Int64],
//!         vec!["v".to_string()],
//!         "id",
//!         PropertyType::Int64,
//!         vec![StorageStrategy::Memory],
//!         1024,
//!     )?;
//!     schema.add_edge_label(
//!         "person",
//!         "person",
//!         "knows",
//!         vec![PropertyType::Int64],
//!         vec!["weight".to_string()],
//!         EdgeStrategy::Multiple,
//!         EdgeStrategy::Multiple,
//!     )?;
//!
//!     let db = GraphDb::open(GraphDbConfig::new(&dir).session_num(2), schema)?;
//!
//!     let mut session = db.session(0)?;
//!     let mut txn = session.insert_transaction()?;
//!     txn.add_vertex(0, Oid::Int64(1), vec![PropertyValue::Int64(10)])?;
//!     txn.add_vertex(0, Oid::Int64(2), vec![PropertyValue::Int64(20)])?;
//!     txn.add_edge(0, Oid::Int64(1), 0, Oid::Int64(2), 0, &[PropertyValue::Int64(7)])?;
//!     txn.commit()?;
//!     drop(session);
//!
//!     let txn = db.read_transaction()?;
//!     let vid = txn.get_vertex(0, &Oid::Int64(1))?;
//!     assert_eq!(txn.get_vertex_property(0, vid, "v")?, PropertyValue::Int64(10));
//!     assert_eq!(txn.get_outgoing_edges(0, vid, 0, 0)?.len(), 1);
//!
//!     Ok(())
//! }
//! ```

pub mod alloc;
pub mod codec;
pub mod db;
pub mod error;
pub mod graph;
pub mod index;
pub mod procedure;
pub mod property;
pub mod schema;
pub mod session;
pub mod snapshot;
pub mod txn;
pub mod version;
pub mod wal;

#[cfg(test)]
mod test {
    use crate::db::{GraphDb, GraphDbConfig};
    use crate::error::CResult;
    use crate::property::types::{Oid, PropertyType, PropertyValue};
    use crate::schema::{EdgeStrategy, Schema, StorageStrategy};

    #[test]
    fn run() -> CResult<()> {
        let dir = tempdir::TempDir::new("demo")?.path().join("graphdb");

        let mut schema = Schema::new();
        schema.add_vertex_label(
            "person",
            vec![PropertyType::Int64],
            vec!["v".to_string()],
            "id",
            PropertyType::Int64,
            vec![StorageStrategy::Memory],
            1024,
        )?;
        schema.add_edge_label(
            "person",
            "person",
            "knows",
            vec![PropertyType::Int64],
            vec!["weight".to_string()],
            EdgeStrategy::Multiple,
            EdgeStrategy::Multiple,
        )?;

        let db = GraphDb::open(GraphDbConfig::new(&dir).session_num(2), schema)?;

        let mut session = db.session(0)?;
        let mut txn = session.insert_transaction()?;
        txn.add_vertex(0, Oid::Int64(1), vec![PropertyValue::Int64(10)])?;
        txn.add_vertex(0, Oid::Int64(2), vec![PropertyValue::Int64(20)])?;
        txn.add_edge(0, Oid::Int64(1), 0, Oid::Int64(2), 0, &[PropertyValue::Int64(7)])?;
        txn.commit()?;
        drop(session);

        let txn = db.read_transaction()?;
        let vid = txn.get_vertex(0, &Oid::Int64(1))?;
        assert_eq!(txn.get_vertex_property(0, vid, "v")?, PropertyValue::Int64(10));
        assert_eq!(txn.get_outgoing_edges(0, vid, 0, 0)?.len(), 1);

        Ok(())
    }
}
