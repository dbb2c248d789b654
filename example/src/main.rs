use graph::codec::{Decoder, Encoder};
use graph::db::{GraphDb, GraphDbConfig};
use graph::error::Error;
use graph::property::types::{Oid, PropertyType, PropertyValue};
use graph::schema::{EdgeStrategy, Schema, StorageStrategy};

fn main() {
    println!("Hello, graph demo!");

    run().unwrap();

    println!("Bye~");
}

fn run() -> Result<(), Error> {
    let storage_path = tempdir::TempDir::new("demo")?.path().join("graphdb");

    let mut schema = Schema::new();
    schema.add_vertex_label(
        "person",
        vec![PropertyType::Int64, PropertyType::String],
        vec!["age".to_string(), "name".to_string()],
        "id",
        PropertyType::Int64,
        vec![StorageStrategy::Memory, StorageStrategy::Memory],
        1024,
    )?;
    schema.add_edge_label(
        "person",
        "person",
        "knows",
        vec![PropertyType::Int64],
        vec!["since".to_string()],
        EdgeStrategy::Multiple,
        EdgeStrategy::Multiple,
    )?;

    let db = GraphDb::open(GraphDbConfig::new(&storage_path).session_num(2), schema)?;

    let mut session = db.session(0)?;
    let mut txn = session.insert_transaction()?;
    txn.add_vertex(
        0,
        Oid::Int64(1),
        vec![PropertyValue::Int64(33), PropertyValue::String("alice".to_string())],
    )?;
    txn.add_vertex(
        0,
        Oid::Int64(2),
        vec![PropertyValue::Int64(27), PropertyValue::String("bob".to_string())],
    )?;
    txn.add_edge(0, Oid::Int64(1), 0, Oid::Int64(2), 0, &[PropertyValue::Int64(2019)])?;
    txn.commit()?;
    drop(session);

    // Ask the built-in server procedure about a vertex.
    let mut enc = Encoder::new();
    enc.put_string("QUERY_VERTEX");
    enc.put_string("person");
    enc.put_i64(1);
    let mut payload = enc.as_slice().to_vec();
    payload.push(0);

    let response = db.eval(0, &payload)?;
    let mut dec = Decoder::new(&response);
    assert_eq!(dec.get_i32()?, 1);
    println!("person 1: age={}, name={}", dec.get_str()?, dec.get_str()?);

    // And walk the graph directly.
    let txn = db.read_transaction()?;
    let alice = txn.get_vertex(0, &Oid::Int64(1))?;
    for edge in txn.get_outgoing_edges(0, alice, 0, 0)? {
        println!(
            "alice knows {} since {}",
            txn.get_vertex_property(0, edge.neighbor, "name")?,
            txn.decode_edge_props(0, 0, 0, &edge.data)?[0]
        );
    }

    Ok(())
}
