//! Transaction flavors.
//!
//! Every flavor shares the same lifecycle: open, operate, then exactly one
//! of commit or abort. Commit of a write-family transaction appends one WAL
//! record (a no-op record when nothing was buffered, so the replayed
//! timestamp sequence stays contiguous), waits for its FIFO turn, applies
//! and publishes. A WAL failure during commit demotes the transaction to
//! aborted and surfaces as a durability error.

pub mod compact;
pub mod insert;
pub mod overlay;
pub mod read;
pub mod update;

pub use compact::CompactTransaction;
pub use insert::{InsertTransaction, SingleEdgeInsertTransaction, SingleVertexInsertTransaction};
pub use read::ReadTransaction;
pub use update::{UpdateBatch, UpdateTransaction};
