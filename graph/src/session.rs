//! Per-thread sessions.
//!
//! A session owns one arena allocator, one WAL writer and a 256-slot cache
//! of procedure instances. `eval` interprets the last payload byte as the
//! procedure id, dispatches, and retries a failing procedure up to
//! `MAX_RETRY` times with a fresh transaction each attempt. Sessions must
//! not be shared across threads; the database keeps one per slot behind its
//! own lock.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alloc::ArenaAllocator;
use crate::codec::{Decoder, Encoder};
use crate::db::DbCore;
use crate::error::{CResult, Error};
use crate::graph::MutablePropertyFragment;
use crate::procedure::{Procedure, MAX_PROCEDURE_NUM};
use crate::schema::Schema;
use crate::txn::compact::{CompactTransaction, COMPACTION_INTERVAL};
use crate::txn::{
    InsertTransaction, ReadTransaction, SingleEdgeInsertTransaction,
    SingleVertexInsertTransaction, UpdateBatch, UpdateTransaction,
};
use crate::wal::WalWriter;

/// Attempts per `eval` before giving up with `QueryFailed`.
pub const MAX_RETRY: usize = 3;

const LATENCY_BUCKETS: usize = 16;

/// Latency histogram of one procedure slot: bucket `i` counts invocations
/// that took `[2^(i-1), 2^i)` microseconds.
#[derive(Clone)]
pub struct ProcMetric {
    pub count: u64,
    pub total_micros: u64,
    pub buckets: [u64; LATENCY_BUCKETS],
}

impl ProcMetric {
    fn new() -> Self {
        Self { count: 0, total_micros: 0, buckets: [0; LATENCY_BUCKETS] }
    }

    fn add_record(&mut self, micros: u64) {
        self.count += 1;
        self.total_micros += micros;
        let bucket = (64 - micros.leading_zeros() as usize).min(LATENCY_BUCKETS - 1);
        self.buckets[bucket] += 1;
    }
}

pub struct SessionMetrics {
    pub query_num: u64,
    pub retry_num: u64,
    pub eval_micros: u64,
    per_proc: Vec<ProcMetric>,
}

impl SessionMetrics {
    fn new() -> Self {
        Self {
            query_num: 0,
            retry_num: 0,
            eval_micros: 0,
            per_proc: vec![ProcMetric::new(); MAX_PROCEDURE_NUM],
        }
    }

    pub fn proc(&self, id: u8) -> &ProcMetric {
        &self.per_proc[id as usize]
    }
}

pub struct Session {
    core: Arc<DbCore>,
    session_id: usize,
    alloc: ArenaAllocator,
    wal: WalWriter,
    procs: Vec<Option<Box<dyn Procedure>>>,
    metrics: SessionMetrics,
}

impl Session {
    pub(crate) fn new(core: Arc<DbCore>, session_id: usize, wal: WalWriter) -> Self {
        let mut procs = Vec::with_capacity(MAX_PROCEDURE_NUM);
        procs.resize_with(MAX_PROCEDURE_NUM, || None);
        Self {
            core,
            session_id,
            alloc: ArenaAllocator::new(),
            wal,
            procs,
            metrics: SessionMetrics::new(),
        }
    }

    pub fn session_id(&self) -> usize {
        self.session_id
    }

    pub fn schema(&self) -> &Schema {
        self.core.graph.schema()
    }

    pub fn graph(&self) -> &MutablePropertyFragment {
        &self.core.graph
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// The stored-procedure directory as one listing string, one procedure
    /// per line: id, name, path.
    pub fn app_info(&self) -> String {
        let mut listing = String::new();
        for (name, (path, id)) in self.schema().procedures() {
            listing.push_str(&format!("{}\t{}\t{}\n", id, name, path));
        }
        listing
    }

    pub fn read_transaction(&self) -> CResult<ReadTransaction<'_>> {
        ReadTransaction::new(&self.core.graph, &self.core.overlays, &self.core.version)
    }

    pub fn insert_transaction(&mut self) -> CResult<InsertTransaction<'_>> {
        let ts = self.core.version.acquire_insert_timestamp()?;
        Ok(InsertTransaction::new(
            &self.core.graph,
            &self.core.version,
            &mut self.wal,
            &mut self.alloc,
            ts,
        ))
    }

    pub fn single_vertex_insert_transaction(&mut self) -> CResult<SingleVertexInsertTransaction<'_>> {
        let ts = self.core.version.acquire_insert_timestamp()?;
        Ok(SingleVertexInsertTransaction::new(
            &self.core.graph,
            &self.core.version,
            &mut self.wal,
            &mut self.alloc,
            ts,
        ))
    }

    pub fn single_edge_insert_transaction(&mut self) -> CResult<SingleEdgeInsertTransaction<'_>> {
        let ts = self.core.version.acquire_insert_timestamp()?;
        Ok(SingleEdgeInsertTransaction::new(
            &self.core.graph,
            &self.core.version,
            &mut self.wal,
            &mut self.alloc,
            ts,
        ))
    }

    pub fn update_transaction(&mut self) -> CResult<UpdateTransaction<'_>> {
        let ts = self.core.version.acquire_update_timestamp()?;
        Ok(UpdateTransaction::new(
            &self.core.graph,
            &self.core.overlays,
            &self.core.version,
            &mut self.wal,
            &mut self.alloc,
            ts,
        ))
    }

    /// Applies a prebuilt delta list within one update transaction.
    pub fn batch_update(&mut self, batch: UpdateBatch) -> CResult<()> {
        self.update_transaction()?.batch_commit(batch)
    }

    /// Proposes a compaction. Commits only when the previous committed
    /// compaction is at least `COMPACTION_INTERVAL` timestamps behind;
    /// otherwise the proposal aborts silently and `Ok(false)` is returned.
    pub fn compact(&mut self) -> CResult<bool> {
        let ts = self.core.version.acquire_update_timestamp()?;
        let last = self.core.last_compaction.load(Ordering::SeqCst);
        let txn = CompactTransaction::new(
            &self.core.graph,
            &self.core.overlays,
            &self.core.version,
            &mut self.wal,
            &mut self.alloc,
            ts,
        );
        if ts - last >= COMPACTION_INTERVAL {
            self.core.last_compaction.store(ts, Ordering::SeqCst);
            txn.commit()?;
            Ok(true)
        } else {
            txn.abort();
            Ok(false)
        }
    }

    /// Evaluates one framed request: the last byte selects the procedure,
    /// the rest is its input.
    pub fn eval(&mut self, input: &[u8]) -> CResult<Vec<u8>> {
        let (payload, proc_id) = match input.split_last() {
            Some((id, payload)) => (payload, *id),
            None => return Err(Error::InvalidInput("empty eval payload".to_string())),
        };
        let start = Instant::now();

        if self.procs[proc_id as usize].is_none() {
            match self.core.registry.get(proc_id)? {
                Some(factory) => self.procs[proc_id as usize] = Some(factory.create()),
                None => {
                    return Err(Error::NotFound(format!("procedure id {}", proc_id)));
                }
            }
        }

        for attempt in 0..MAX_RETRY {
            let mut proc = match self.procs[proc_id as usize].take() {
                Some(proc) => proc,
                None => return Err(Error::Internal("procedure slot vanished".to_string())),
            };
            let mut decoder = Decoder::new(payload);
            let mut encoder = Encoder::with_buffer(self.alloc.acquire());
            let ok = proc.invoke(self, &mut decoder, &mut encoder);
            self.procs[proc_id as usize] = Some(proc);

            if ok {
                let micros = start.elapsed().as_micros() as u64;
                self.metrics.query_num += 1;
                self.metrics.eval_micros += micros;
                self.metrics.per_proc[proc_id as usize].add_record(micros);
                let result = encoder.as_slice().to_vec();
                self.alloc.release(encoder.into_buffer());
                return Ok(result);
            }

            self.metrics.retry_num += 1;
            self.alloc.release(encoder.into_buffer());
            log::info!(
                "[query-{}][session-{}] retry {} / {}",
                proc_id,
                self.session_id,
                attempt,
                MAX_RETRY
            );
            if attempt + 1 < MAX_RETRY {
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        self.metrics.query_num += 1;
        self.metrics.eval_micros += start.elapsed().as_micros() as u64;
        Err(Error::QueryFailed(format!("procedure id {}", proc_id)))
    }
}
