//! Domain databases and the dispatcher.
//!
//! A `Database` wraps one storage backend for one experimental domain:
//! the registered tables, the domain start time, and the sender map.  The
//! `Registry` keeps the open databases, reference-counted across the
//! client handlers attached to the same domain.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use omsp_protocol::{Schema, Value, valid_name};

use crate::backend::{Backend, DbTable, StoreError};
use crate::sqlite::SqliteBackend;

/// Bounded number of `<name>`, `<name>_2`, … `<name>_10` slots tried when
/// schemas conflict.
pub const MAX_TABLE_RENAME: u32 = 10;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_f64() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

pub struct Database {
    name: String,
    ref_count: u32,
    start_time: u64,
    backend: Box<dyn Backend>,
    tables: Vec<Arc<DbTable>>,
}

impl Database {
    fn open(name: String, backend: Box<dyn Backend>) -> Result<Database, StoreError> {
        let mut db = Database {
            name,
            ref_count: 1,
            start_time: 0,
            backend,
            tables: Vec::new(),
        };

        if let Some(s) = db.backend.get_metadata("start_time")? {
            db.start_time = s.parse().unwrap_or(0);
            tracing::debug!(domain = %db.name, start_time = db.start_time, "retrieved start time");
        }

        // Restart discovery: re-bind tables created by earlier runs.
        for schema in db.backend.get_table_list()? {
            let insert_sql = db.backend.table_create(&schema, true)?;
            tracing::debug!(domain = %db.name, table = %schema.name, "re-bound existing table");
            db.tables.push(Arc::new(DbTable { schema, insert_sql }));
        }
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// Seed the domain start time from the first connecting client.
    pub fn set_start_time(&mut self, client_start: u64) -> Result<(), StoreError> {
        if self.start_time == 0 {
            self.start_time = client_start;
            self.backend
                .set_metadata("start_time", &client_start.to_string())?;
        }
        Ok(())
    }

    pub fn add_sender(&mut self, name: &str) -> Result<i64, StoreError> {
        self.backend.add_sender_id(name)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.backend.set_metadata(key, value)
    }

    pub fn get_metadata(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        self.backend.get_metadata(key)
    }

    /// Find the table backing a schema, creating or renaming as needed.
    ///
    /// An existing table with the same name and layout is reused.  On a
    /// layout conflict, `<name>_2` through `<name>_10` are tried; the
    /// first free slot is created (under the disambiguated name), and
    /// samples bound to the returned table land there.
    pub fn find_or_create_table(&mut self, schema: &Schema) -> Result<Arc<DbTable>, StoreError> {
        let base = schema.name.clone();
        let mut candidate = schema.clone();
        let mut attempt = 1u32;

        loop {
            match self
                .tables
                .iter()
                .find(|t| t.schema.name == candidate.name)
            {
                Some(existing) if existing.schema.fields == candidate.fields => {
                    return Ok(Arc::clone(existing));
                }
                Some(existing) => {
                    if let Some(col) = existing.schema.first_mismatch(&candidate) {
                        tracing::debug!(
                            domain = %self.name,
                            table = %candidate.name,
                            column = col,
                            "schema differs from stored table"
                        );
                    }
                    attempt += 1;
                    if attempt > MAX_TABLE_RENAME {
                        tracing::error!(
                            domain = %self.name,
                            table = %base,
                            "too many conflicting schemas for one table name"
                        );
                        return Err(StoreError::RenameExhausted(base));
                    }
                    candidate.name = format!("{base}_{attempt}");
                }
                None => {
                    let insert_sql = self.backend.table_create(&candidate, false)?;
                    self.backend.set_metadata(
                        &format!("table_{}", candidate.name),
                        &candidate.to_table_meta(),
                    )?;
                    if attempt > 1 {
                        tracing::warn!(
                            domain = %self.name,
                            table = %candidate.name,
                            requested = %base,
                            "created renamed table for incompatible schema"
                        );
                    }
                    let table = Arc::new(DbTable {
                        schema: candidate,
                        insert_sql,
                    });
                    self.tables.push(Arc::clone(&table));
                    return Ok(table);
                }
            }
        }
    }

    /// Insert one sample; the server timestamp is derived here from the
    /// domain start time.
    pub fn insert(
        &mut self,
        table: &DbTable,
        sender_id: i64,
        seq: i64,
        ts_client: f64,
        values: &[Value],
    ) -> Result<(), StoreError> {
        let ts_server = now_f64() - self.start_time as f64;
        self.backend
            .insert(table, sender_id, seq, ts_client, ts_server, values)
    }

    fn release_backend(&mut self) {
        if let Err(e) = self.backend.release() {
            tracing::warn!(domain = %self.name, error = %e, "error closing backend");
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The collector's registry of open domain databases.
pub struct Registry {
    data_dir: PathBuf,
    dbs: Mutex<Vec<Arc<Mutex<Database>>>>,
}

impl Registry {
    pub fn new(data_dir: PathBuf) -> Registry {
        Registry {
            data_dir,
            dbs: Mutex::new(Vec::new()),
        }
    }

    /// Find the open database for a domain, or open/create it.  Each call
    /// takes one reference; pair it with [`Registry::release`].
    pub fn find_or_open(&self, domain: &str) -> Result<Arc<Mutex<Database>>, StoreError> {
        if !valid_name(domain) {
            return Err(StoreError::BadDomain(domain.to_owned()));
        }

        let mut dbs = lock(&self.dbs);
        for db in dbs.iter() {
            let mut guard = lock(db);
            if guard.name == domain {
                guard.ref_count += 1;
                tracing::info!(
                    domain,
                    clients = guard.ref_count,
                    "database already open"
                );
                return Ok(Arc::clone(db));
            }
        }

        let path = self.data_dir.join(format!("{domain}.sq3"));
        tracing::info!(domain, path = %path.display(), "opening database");
        let backend = Box::new(SqliteBackend::open(&path)?);
        let db = Arc::new(Mutex::new(Database::open(domain.to_owned(), backend)?));
        dbs.push(Arc::clone(&db));
        Ok(db)
    }

    /// Drop one reference; the database closes when the last holder
    /// releases it.
    pub fn release(&self, db: &Arc<Mutex<Database>>) {
        let mut dbs = lock(&self.dbs);
        let mut guard = lock(db);
        guard.ref_count = guard.ref_count.saturating_sub(1);
        if guard.ref_count > 0 {
            return;
        }
        tracing::info!(domain = %guard.name, "closing database");
        guard.release_backend();
        let name = guard.name.clone();
        drop(guard);
        dbs.retain(|d| lock(d).name != name);
    }

    /// Close every open database (shutdown path).
    pub fn close_all(&self) {
        let mut dbs = lock(&self.dbs);
        for db in dbs.drain(..) {
            let mut guard = lock(&db);
            tracing::debug!(domain = %guard.name, "closing database at shutdown");
            guard.release_backend();
        }
    }
}
