//! The storage backend contract.
//!
//! All functions are synchronous; the per-connection serialization of the
//! dispatcher provides thread safety.  A backend keeps one transaction
//! open at all times and recycles it on its own pacing (see the SQLite
//! implementation).

use omsp_protocol::Schema;
use omsp_protocol::Value;

/// One bound table: immutable schema plus the backend scratch (the
/// prepared insert statement, kept as SQL and prepared through the
/// connection's statement cache).
#[derive(Debug)]
pub struct DbTable {
    pub schema: Schema,
    pub insert_sql: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("too many tables conflicting with '{0}', giving up")]
    RenameExhausted(String),
    #[error("table '{table}' expects {want} values, got {got}")]
    Arity {
        table: String,
        want: usize,
        got: usize,
    },
    #[error("value kind mismatch in table '{table}' column {column}")]
    Kind { table: String, column: usize },
    #[error("invalid domain name '{0}'")]
    BadDomain(String),
    #[error("{0}")]
    Corrupt(String),
}

/// Backend function table, mirrored by every storage adapter.
pub trait Backend: Send {
    /// URI of the underlying store, for logging.
    fn uri(&self) -> String;

    /// Create a table for the schema and return its insert scratch.
    /// With `shallow` set, the table is assumed to exist (restart
    /// discovery) and only the scratch is built.
    fn table_create(&mut self, schema: &Schema, shallow: bool) -> Result<String, StoreError>;

    /// Insert one sample row.
    fn insert(
        &mut self,
        table: &DbTable,
        sender_id: i64,
        seq: i64,
        ts_client: f64,
        ts_server: f64,
        values: &[Value],
    ) -> Result<(), StoreError>;

    fn get_metadata(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Find or allocate the numeric id of a sender name.
    fn add_sender_id(&mut self, name: &str) -> Result<i64, StoreError>;

    /// Schemas of all tables previously created in this store, for
    /// restart discovery.
    fn get_table_list(&mut self) -> Result<Vec<Schema>, StoreError>;

    /// Commit the final transaction and close.
    fn release(&mut self) -> Result<(), StoreError>;
}
