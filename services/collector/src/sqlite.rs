//! SQLite storage adapter.
//!
//! One database file per domain (`<datadir>/<domain>.sq3`).  A
//! transaction is held open across inserts and recycled once per
//! wall-clock second, so sustained ingest is batched without holding
//! rows back for long.

use std::path::Path;

use rusqlite::types::ToSqlOutput;
use rusqlite::{Connection, OptionalExtension, ToSql, params};

use omsp_protocol::{Schema, Value, ValueKind};

use crate::backend::{Backend, DbTable, StoreError};

pub struct SqliteBackend {
    conn: Connection,
    uri: String,
    last_commit: u64,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<SqliteBackend, StoreError> {
        let conn = Connection::open(path)?;
        let uri = format!("file:{}", path.display());
        Self::setup(conn, uri)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<SqliteBackend, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::setup(conn, "file::memory:".to_owned())
    }

    fn setup(conn: Connection, uri: String) -> Result<SqliteBackend, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _experiment_metadata (
                 key   TEXT PRIMARY KEY,
                 value TEXT
             );
             CREATE TABLE IF NOT EXISTS _senders (
                 name TEXT PRIMARY KEY,
                 id   INTEGER UNIQUE
             );",
        )?;
        conn.execute_batch("BEGIN")?;
        Ok(SqliteBackend {
            conn,
            uri,
            last_commit: now_secs(),
        })
    }

    fn reopen_transaction(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }
}

/// SQLite column type for a value kind.
pub fn sql_type(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Int32 | ValueKind::Bool => "INTEGER",
        ValueKind::UInt32 => "UNSIGNED INTEGER",
        ValueKind::Int64 => "BIGINT",
        ValueKind::UInt64 | ValueKind::Guid => "UNSIGNED BIGINT",
        ValueKind::Double => "REAL",
        ValueKind::String | ValueKind::Unknown => "TEXT",
        ValueKind::Blob => "BLOB",
    }
}

fn create_sql(schema: &Schema) -> String {
    let mut s = format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" (\
         oml_tuple_id INTEGER PRIMARY KEY, \
         oml_sender_id INTEGER, \
         oml_seq INTEGER, \
         oml_ts_client REAL, \
         oml_ts_server REAL",
        schema.name
    );
    for f in &schema.fields {
        s.push_str(&format!(", \"{}\" {}", f.name, sql_type(f.kind)));
    }
    s.push(')');
    s
}

fn insert_sql(schema: &Schema) -> String {
    let mut s = format!(
        "INSERT INTO \"{}\" (\"oml_sender_id\", \"oml_seq\", \"oml_ts_client\", \"oml_ts_server\"",
        schema.name
    );
    for f in &schema.fields {
        s.push_str(&format!(", \"{}\"", f.name));
    }
    s.push_str(") VALUES (?");
    for _ in 1..schema.fields.len() + 4 {
        s.push_str(", ?");
    }
    s.push(')');
    s
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Bind adapter from protocol values to SQLite.
struct SqlValue<'a>(&'a Value);

impl ToSql for SqlValue<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as Sql;
        let out = match self.0 {
            Value::Int32(v) => Sql::Integer(i64::from(*v)),
            Value::UInt32(v) => Sql::Integer(i64::from(*v)),
            Value::Int64(v) => Sql::Integer(*v),
            Value::UInt64(v) => {
                if *v > i64::MAX as u64 {
                    tracing::warn!(value = v, "uint64 value over 2^63, stored with wraparound");
                }
                Sql::Integer(*v as i64)
            }
            Value::Double(v) => Sql::Real(*v),
            Value::Bool(v) => Sql::Integer(i64::from(*v)),
            Value::String(s) => Sql::Text(s.clone()),
            Value::Blob(b) => Sql::Blob(b.clone()),
            Value::Guid(v) => {
                if *v == 0 {
                    Sql::Null
                } else {
                    Sql::Integer(*v as i64)
                }
            }
        };
        Ok(ToSqlOutput::Owned(out))
    }
}

impl Backend for SqliteBackend {
    fn uri(&self) -> String {
        self.uri.clone()
    }

    fn table_create(&mut self, schema: &Schema, shallow: bool) -> Result<String, StoreError> {
        if !shallow {
            self.conn.execute_batch(&create_sql(schema))?;
        }
        Ok(insert_sql(schema))
    }

    fn insert(
        &mut self,
        table: &DbTable,
        sender_id: i64,
        seq: i64,
        ts_client: f64,
        ts_server: f64,
        values: &[Value],
    ) -> Result<(), StoreError> {
        let schema = &table.schema;
        if values.len() != schema.fields.len() {
            return Err(StoreError::Arity {
                table: schema.name.clone(),
                want: schema.fields.len(),
                got: values.len(),
            });
        }
        for (i, (f, v)) in schema.fields.iter().zip(values).enumerate() {
            if v.kind() != f.kind {
                return Err(StoreError::Kind {
                    table: schema.name.clone(),
                    column: i + 1,
                });
            }
        }

        let now = now_secs();
        if now > self.last_commit {
            self.reopen_transaction()?;
            self.last_commit = now;
        }

        let mut binds: Vec<Box<dyn ToSql>> = Vec::with_capacity(values.len() + 4);
        binds.push(Box::new(sender_id));
        binds.push(Box::new(seq));
        binds.push(Box::new(ts_client));
        binds.push(Box::new(ts_server));
        for v in values {
            binds.push(Box::new(SqlValue(v)));
        }

        let mut stmt = self.conn.prepare_cached(&table.insert_sql)?;
        stmt.execute(rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())))?;
        Ok(())
    }

    fn get_metadata(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let v = self
            .conn
            .query_row(
                "SELECT value FROM _experiment_metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(v)
    }

    fn set_metadata(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO _experiment_metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn add_sender_id(&mut self, name: &str) -> Result<i64, StoreError> {
        let existing: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM _senders WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
        let max: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(id), 0) FROM _senders", [], |row| {
                row.get(0)
            })?;
        self.conn.execute(
            "INSERT INTO _senders (name, id) VALUES (?1, ?2)",
            params![name, max + 1],
        )?;
        Ok(max + 1)
    }

    fn get_table_list(&mut self) -> Result<Vec<Schema>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value FROM _experiment_metadata WHERE key LIKE 'table\\_%' ESCAPE '\\'",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut schemas = Vec::new();
        for row in rows {
            let (key, value) = row?;
            match Schema::from_table_meta(&value) {
                Ok(schema) => schemas.push(schema),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "unparsable stored table schema, skipping");
                }
            }
        }
        Ok(schemas)
    }

    fn release(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }
}
