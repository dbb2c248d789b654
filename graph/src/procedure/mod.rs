//! Stored procedures.
//!
//! A procedure is a compiled unit invoked by a stable u8 id through
//! `Session::eval`. Factories are registered once at startup; each session
//! instantiates its own procedure objects lazily and caches them, so
//! procedure state is session-local. Dynamic library loading is a deployment
//! concern outside the core: factories are compiled in, while the schema's
//! procedure directory keeps `(name, path, id)` stable across restarts.

pub mod server;

use std::sync::{Arc, RwLock};

use crate::codec::{Decoder, Encoder};
use crate::error::{CResult, Error};
use crate::session::Session;

/// Slot count of every procedure table; ids are a full u8.
pub const MAX_PROCEDURE_NUM: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcedureKind {
    Read,
    Write,
    CypherRead,
    CypherWrite,
    CypherAdhoc,
}

/// A procedure instance. `invoke` returns false to signal a retryable
/// failure; the session re-invokes with a fresh decoder (and the procedure
/// must reacquire any transaction, continuity across attempts is not
/// guaranteed).
pub trait Procedure: Send {
    fn kind(&self) -> ProcedureKind;

    fn invoke(&mut self, session: &mut Session, input: &mut Decoder, output: &mut Encoder) -> bool;
}

pub trait ProcedureFactory: Send + Sync {
    fn create(&self) -> Box<dyn Procedure>;
}

/// Process-wide factory table, indexed by procedure id.
pub struct ProcedureRegistry {
    slots: RwLock<Vec<Option<Arc<dyn ProcedureFactory>>>>,
}

impl ProcedureRegistry {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_PROCEDURE_NUM);
        slots.resize_with(MAX_PROCEDURE_NUM, || None);
        Self { slots: RwLock::new(slots) }
    }

    /// Registers a factory under an id; the id must be unused.
    pub fn register(&self, id: u8, factory: Arc<dyn ProcedureFactory>) -> CResult<()> {
        let mut slots = self.slots.write()?;
        if slots[id as usize].is_some() {
            return Err(Error::SchemaConflict(format!(
                "procedure id {} is already registered",
                id
            )));
        }
        slots[id as usize] = Some(factory);
        Ok(())
    }

    pub fn get(&self, id: u8) -> CResult<Option<Arc<dyn ProcedureFactory>>> {
        Ok(self.slots.read()?[id as usize].clone())
    }
}

impl Default for ProcedureRegistry {
    fn default() -> Self {
        Self::new()
    }
}
