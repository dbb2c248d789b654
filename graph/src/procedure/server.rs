//! The built-in server procedure, always registered at id 0. It answers the
//! admin commands `SHOW_STORED_PROCEDURES`, `QUERY_VERTEX` and `QUERY_EDGE`
//! over the standard length-prefixed encoding.

use crate::codec::{Decoder, Encoder};
use crate::error::CResult;
use crate::procedure::{Procedure, ProcedureFactory, ProcedureKind};
use crate::property::types::{Oid, PropertyType};
use crate::session::Session;

pub struct ServerProcedure;

pub struct ServerProcedureFactory;

impl ProcedureFactory for ServerProcedureFactory {
    fn create(&self) -> Box<dyn Procedure> {
        Box::new(ServerProcedure)
    }
}

impl Procedure for ServerProcedure {
    fn kind(&self) -> ProcedureKind {
        ProcedureKind::Read
    }

    fn invoke(&mut self, session: &mut Session, input: &mut Decoder, output: &mut Encoder) -> bool {
        let op = match input.get_string() {
            Ok(op) => op.to_uppercase(),
            Err(err) => {
                log::error!("server procedure: malformed op: {}", err);
                return false;
            }
        };
        let result = match op.as_str() {
            "SHOW_STORED_PROCEDURES" => show_procedures(session, input, output),
            "QUERY_VERTEX" => query_vertex(session, input, output),
            "QUERY_EDGE" => query_edge(session, input, output),
            other => {
                log::error!("server procedure: unknown op {:?}", other);
                return false;
            }
        };
        match result {
            Ok(found) => found,
            Err(err) => {
                log::error!("server procedure: {} failed: {}", op, err);
                false
            }
        }
    }
}

fn show_procedures(session: &mut Session, input: &mut Decoder, output: &mut Encoder) -> CResult<bool> {
    if !input.empty() {
        log::error!("SHOW_STORED_PROCEDURES takes no arguments");
        return Ok(false);
    }
    output.put_string(&session.app_info());
    Ok(true)
}

/// Reads a key of the label's declared type from the input. Integer keys
/// travel as 8-byte integers regardless of width.
fn read_oid(input: &mut Decoder, pk_type: PropertyType) -> CResult<Oid> {
    Ok(match pk_type {
        PropertyType::Int32 => Oid::Int32(input.get_i64()? as i32),
        PropertyType::UInt32 => Oid::UInt32(input.get_i64()? as u32),
        PropertyType::UInt64 => Oid::UInt64(input.get_i64()? as u64),
        PropertyType::String => Oid::String(input.get_string()?),
        _ => Oid::Int64(input.get_i64()?),
    })
}

fn query_vertex(session: &mut Session, input: &mut Decoder, output: &mut Encoder) -> CResult<bool> {
    let label_name = input.get_string()?;
    let label = match session.schema().vertex_label_id(&label_name) {
        Ok(label) => label,
        Err(_) => {
            output.put_i32(0);
            return Ok(false);
        }
    };
    let pk_type = session.schema().vertex_label(label)?.pk_type;
    let oid = read_oid(input, pk_type)?;

    let txn = session.read_transaction()?;
    match txn.get_vertex(label, &oid) {
        Ok(vid) => {
            output.put_i32(1);
            let prop_num = txn.schema().vertex_label(label)?.prop_names.len();
            for prop_idx in 0..prop_num {
                let value = txn.get_vertex_property_by_index(label, vid, prop_idx)?;
                output.put_string(&value.to_string());
            }
            Ok(true)
        }
        Err(_) => {
            output.put_i32(0);
            Ok(false)
        }
    }
}

fn query_edge(session: &mut Session, input: &mut Decoder, output: &mut Encoder) -> CResult<bool> {
    let src_label_name = input.get_string()?;
    let schema = session.schema();
    let src_label = match schema.vertex_label_id(&src_label_name) {
        Ok(label) => label,
        Err(_) => {
            output.put_i32(0);
            return Ok(false);
        }
    };
    let src_oid = read_oid(input, schema.vertex_label(src_label)?.pk_type)?;
    let dst_label_name = input.get_string()?;
    let dst_label = match schema.vertex_label_id(&dst_label_name) {
        Ok(label) => label,
        Err(_) => {
            output.put_i32(0);
            return Ok(false);
        }
    };
    let dst_oid = read_oid(input, schema.vertex_label(dst_label)?.pk_type)?;
    let edge_name = input.get_string()?;
    let elabel = match schema.edge_label_id(&edge_name) {
        Ok(elabel) => elabel,
        Err(_) => {
            output.put_i32(0);
            return Ok(false);
        }
    };

    let txn = session.read_transaction()?;
    let (src_vid, dst_vid) = match (txn.get_vertex(src_label, &src_oid), txn.get_vertex(dst_label, &dst_oid)) {
        (Ok(s), Ok(d)) => (s, d),
        _ => {
            output.put_i32(0);
            return Ok(false);
        }
    };
    let edges = txn.get_outgoing_edges(src_label, src_vid, dst_label, elabel)?;
    for edge in edges {
        if edge.neighbor == dst_vid {
            output.put_i32(1);
            for value in txn.decode_edge_props(src_label, dst_label, elabel, &edge.data)? {
                output.put_string(&value.to_string());
            }
            return Ok(true);
        }
    }
    output.put_i32(0);
    Ok(false)
}
