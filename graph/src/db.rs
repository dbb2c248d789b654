//! Database lifecycle: open or restore a data directory, replay the WAL,
//! and hand out sessions.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, MutexGuard};

use fs4::FileExt;

use crate::error::{CResult, Error};
use crate::graph::MutablePropertyFragment;
use crate::procedure::server::ServerProcedureFactory;
use crate::procedure::{ProcedureFactory, ProcedureRegistry};
use crate::schema::Schema;
use crate::session::Session;
use crate::snapshot;
use crate::txn::overlay::OverlayStore;
use crate::txn::ReadTransaction;
use crate::version::VersionManager;
use crate::wal::{self, WalWriter};

pub struct GraphDbConfig {
    pub data_dir: PathBuf,
    pub session_num: usize,
}

impl GraphDbConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self { data_dir: data_dir.into(), session_num: 4 }
    }

    pub fn session_num(mut self, session_num: usize) -> Self {
        self.session_num = session_num;
        self
    }
}

/// Everything sessions share. Sessions hold it through an `Arc`; mutation
/// flows through the transaction objects, never through this struct
/// directly.
pub(crate) struct DbCore {
    pub(crate) graph: MutablePropertyFragment,
    pub(crate) version: VersionManager,
    pub(crate) overlays: OverlayStore,
    pub(crate) registry: ProcedureRegistry,
    pub(crate) last_compaction: AtomicU32,
}

pub struct GraphDb {
    core: Arc<DbCore>,
    sessions: Vec<Mutex<Session>>,
    data_dir: PathBuf,
    /// Held for the life of the database so two processes cannot open the
    /// same directory.
    _dir_lock: File,
}

impl std::fmt::Debug for GraphDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDb").field("data_dir", &self.data_dir).finish()
    }
}

impl GraphDb {
    /// Opens a data directory: restores the snapshot (or writes a fresh
    /// empty one), replays the WAL, then brings up the session pool. WAL
    /// corruption beyond a truncated tail refuses to open.
    pub fn open(config: GraphDbConfig, schema: Schema) -> CResult<GraphDb> {
        if config.session_num == 0 || config.session_num > 256 {
            return Err(Error::InvalidInput(format!(
                "session_num {} out of range",
                config.session_num
            )));
        }
        std::fs::create_dir_all(&config.data_dir)?;
        let dir_lock = File::create(config.data_dir.join("LOCK"))?;
        dir_lock.try_lock_exclusive().map_err(|e| {
            Error::Internal(format!("{} is already open: {}", config.data_dir.display(), e))
        })?;

        let snapshot_path = config.data_dir.join(snapshot::INIT_SNAPSHOT);
        let graph = if snapshot_path.exists() {
            log::info!("restoring graph from {}", config.data_dir.display());
            MutablePropertyFragment::deserialize(&config.data_dir, &schema)?
        } else {
            log::info!("initializing empty graph in {}", config.data_dir.display());
            let graph = MutablePropertyFragment::new(schema);
            graph.serialize(&config.data_dir)?;
            graph
        };

        let version = VersionManager::new();
        let overlays = OverlayStore::new();
        let wal_dir = config.data_dir.join("wal");
        let records = wal::scan_wal_dir(&wal_dir)?;
        if !records.is_empty() {
            log::info!("replaying {} wal records", records.len());
            wal::ingest(&records, &graph, &overlays, config.session_num)?;
        }
        version.init_ts(wal::last_timestamp(&records))?;

        let registry = ProcedureRegistry::new();
        registry.register(0, Arc::new(ServerProcedureFactory))?;

        let core = Arc::new(DbCore {
            graph,
            version,
            overlays,
            registry,
            last_compaction: AtomicU32::new(0),
        });
        let mut sessions = Vec::with_capacity(config.session_num);
        for session_id in 0..config.session_num {
            let wal = WalWriter::open(&wal_dir, session_id)?;
            sessions.push(Mutex::new(Session::new(core.clone(), session_id, wal)));
        }
        Ok(GraphDb { core, sessions, data_dir: config.data_dir, _dir_lock: dir_lock })
    }

    pub fn session_num(&self) -> usize {
        self.sessions.len()
    }

    /// Borrows one session of the fixed pool. A session serves one caller
    /// at a time.
    pub fn session(&self, session_id: usize) -> CResult<MutexGuard<'_, Session>> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::InvalidInput(format!("session id {} out of range", session_id)))?;
        Ok(session.lock()?)
    }

    /// Convenience: evaluate one request on the given session.
    pub fn eval(&self, session_id: usize, input: &[u8]) -> CResult<Vec<u8>> {
        self.session(session_id)?.eval(input)
    }

    pub fn read_transaction(&self) -> CResult<ReadTransaction<'_>> {
        ReadTransaction::new(&self.core.graph, &self.core.overlays, &self.core.version)
    }

    pub fn schema(&self) -> &Schema {
        self.core.graph.schema()
    }

    pub fn graph(&self) -> &MutablePropertyFragment {
        &self.core.graph
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The stored-procedure directory as one listing string, one procedure
    /// per line: id, name, path. Backs `SHOW_STORED_PROCEDURES`.
    pub fn app_info(&self) -> String {
        let mut listing = String::new();
        for (name, (path, id)) in self.schema().procedures() {
            listing.push_str(&format!("{}\t{}\t{}\n", id, name, path));
        }
        listing
    }

    /// Attaches a compiled-in factory to a procedure declared in the
    /// schema's directory; the directory supplies the stable id.
    pub fn register_procedure(&self, name: &str, factory: Arc<dyn ProcedureFactory>) -> CResult<()> {
        let (_, id) = self
            .schema()
            .procedures()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("procedure {:?}", name)))?;
        self.core.registry.register(id, factory)
    }

    /// Dumps the current fragment to `dir` in snapshot layout.
    pub fn serialize(&self, dir: &Path) -> CResult<()> {
        self.core.graph.serialize(dir)
    }
}
