//! Per-connection protocol engine.
//!
//! Bytes from the socket accumulate in the handler's buffer; the handler
//! consumes header lines until the blank separator, then text lines or
//! binary frames according to the negotiated content mode.  Records on
//! stream 0 are metadata: a `schema` key declares a new stream
//! mid-session, anything else lands in the experiment metadata table.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, BytesMut};

use omsp_protocol::binary::decode_frame;
use omsp_protocol::header::{canonical_key, split_meta};
use omsp_protocol::{
    ContentMode, MAX_PROTOCOL_VERSION, MIN_PROTOCOL_VERSION, Schema, Value, WireError, text,
};

use crate::backend::{DbTable, StoreError};
use crate::database::{Database, Registry};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Header,
    TextData,
    BinaryData,
    ProtocolError,
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ClientHandler {
    peer: String,
    registry: Arc<Registry>,
    state: HandlerState,
    content: Option<ContentMode>,
    protocol: Option<u32>,
    database: Option<Arc<Mutex<Database>>>,
    sender_id: Option<i64>,
    sender_name: Option<String>,
    app_name: Option<String>,
    client_start: Option<u64>,
    time_offset: f64,
    /// Table bindings indexed by the client's schema index; slot 0 is the
    /// metadata stream and never bound.
    tables: Vec<Option<Arc<DbTable>>>,
    pub buf: BytesMut,
}

impl ClientHandler {
    pub fn new(peer: String, registry: Arc<Registry>) -> ClientHandler {
        ClientHandler {
            peer,
            registry,
            state: HandlerState::Header,
            content: None,
            protocol: None,
            database: None,
            sender_id: None,
            sender_name: None,
            app_name: None,
            client_start: None,
            time_offset: 0.0,
            tables: Vec::new(),
            buf: BytesMut::new(),
        }
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    /// Append received bytes and consume as much as possible.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), HandlerError> {
        self.buf.extend_from_slice(data);
        self.process()
    }

    /// Consume complete header lines / data messages from the buffer.
    pub fn process(&mut self) -> Result<(), HandlerError> {
        loop {
            let progressed = match self.state {
                HandlerState::Header => self.process_header_line()?,
                HandlerState::TextData => self.process_text_line()?,
                HandlerState::BinaryData => self.process_bin_frame()?,
                HandlerState::ProtocolError => {
                    return Err(HandlerError::Protocol("connection in error state".to_owned()));
                }
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Drop the database reference (peer gone or handler torn down).
    pub fn release(&mut self) {
        if let Some(db) = self.database.take() {
            self.registry.release(&db);
        }
    }

    fn protocol_error(&mut self, msg: String) -> HandlerError {
        self.state = HandlerState::ProtocolError;
        tracing::error!(peer = %self.peer, "{msg}");
        HandlerError::Protocol(msg)
    }

    // -----------------------------------------------------------------------
    // Header block
    // -----------------------------------------------------------------------

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(pos + 1);
        let mut end = line.len() - 1;
        if end > 0 && line[end - 1] == b'\r' {
            end -= 1;
        }
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    fn process_header_line(&mut self) -> Result<bool, HandlerError> {
        let Some(line) = self.take_line() else {
            return Ok(false);
        };

        if line.is_empty() {
            // Any run of blank lines is a single separator.
            while self.buf.first() == Some(&b'\n') {
                self.buf.advance(1);
            }
            return self.enter_data_mode().map(|()| true);
        }

        let Some((key, value)) = split_meta(&line) else {
            return Err(self.protocol_error(format!("malformed header line '{line}'")));
        };
        self.process_meta(canonical_key(key), value, true)?;
        Ok(true)
    }

    fn enter_data_mode(&mut self) -> Result<(), HandlerError> {
        let mut missing = Vec::new();
        if self.protocol.is_none() {
            missing.push("protocol");
        }
        if self.database.is_none() {
            missing.push("domain");
        }
        if self.client_start.is_none() {
            missing.push("start-time");
        }
        if self.sender_id.is_none() {
            missing.push("sender-id");
        }
        if self.app_name.is_none() {
            missing.push("app-name");
        }
        let Some(content) = self.content else {
            missing.push("content");
            return Err(self.protocol_error(format!("missing header keys: {}", missing.join(", "))));
        };
        if !missing.is_empty() {
            return Err(self.protocol_error(format!("missing header keys: {}", missing.join(", "))));
        }

        self.state = match content {
            ContentMode::Text => HandlerState::TextData,
            ContentMode::Binary => HandlerState::BinaryData,
        };
        tracing::info!(
            peer = %self.peer,
            sender = self.sender_name.as_deref().unwrap_or(""),
            app = self.app_name.as_deref().unwrap_or(""),
            content = %content,
            "client ready to send data"
        );
        Ok(())
    }

    fn process_meta(&mut self, key: &str, value: &str, in_header: bool) -> Result<(), HandlerError> {
        let header_only = |this: &mut Self, key: &str| -> bool {
            if !in_header {
                tracing::warn!(peer = %this.peer, key, "meta key only valid in the headers, ignoring");
                return false;
            }
            true
        };

        match key {
            "protocol" => {
                if !header_only(self, key) {
                    return Ok(());
                }
                let version: u32 = value.trim().parse().unwrap_or(0);
                if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&version) {
                    return Err(self.protocol_error(format!(
                        "unsupported protocol version {value} (supported: {MIN_PROTOCOL_VERSION}..{MAX_PROTOCOL_VERSION})"
                    )));
                }
                self.protocol = Some(version);
            }
            "domain" => {
                if !header_only(self, key) {
                    return Ok(());
                }
                match self.registry.find_or_open(value) {
                    Ok(db) => self.database = Some(db),
                    Err(e) => {
                        return Err(self.protocol_error(format!("cannot open domain '{value}': {e}")));
                    }
                }
            }
            "start-time" => {
                if !header_only(self, key) {
                    return Ok(());
                }
                let Some(db) = &self.database else {
                    return Err(self
                        .protocol_error("meta 'start-time' needs to come after 'domain'".to_owned()));
                };
                let client_start: u64 = value.trim().parse().unwrap_or(0);
                let mut db = lock(db);
                db.set_start_time(client_start)?;
                self.time_offset = client_start as f64 - db.start_time() as f64;
                self.client_start = Some(client_start);
            }
            "sender-id" => {
                if !header_only(self, key) {
                    return Ok(());
                }
                let Some(db) = &self.database else {
                    return Err(self
                        .protocol_error("meta 'sender-id' needs to come after 'domain'".to_owned()));
                };
                let id = lock(db).add_sender(value)?;
                self.sender_id = Some(id);
                self.sender_name = Some(value.to_owned());
            }
            "app-name" => {
                if !header_only(self, key) {
                    return Ok(());
                }
                self.app_name = Some(value.to_owned());
            }
            "schema" => self.process_schema(value)?,
            "content" => {
                if !header_only(self, key) {
                    return Ok(());
                }
                match value.parse::<ContentMode>() {
                    Ok(mode) => self.content = Some(mode),
                    Err(()) => {
                        return Err(self.protocol_error(format!("unknown content type '{value}'")));
                    }
                }
            }
            other => {
                // Unknown keys are ignored for forward compatibility.
                tracing::debug!(peer = %self.peer, key = other, "ignoring unknown header key");
            }
        }
        Ok(())
    }

    fn process_schema(&mut self, value: &str) -> Result<(), HandlerError> {
        let schema = match Schema::from_meta(value) {
            Ok(s) => s,
            Err(e) => {
                return Err(self.protocol_error(format!("failure parsing schema '{value}': {e}")));
            }
        };
        if schema.index == 0 {
            // Stream 0 is reserved; its shape is fixed and it is never
            // backed by a sample table.
            if !schema.layout_eq(&Schema::metadata()) {
                tracing::warn!(peer = %self.peer, schema = %value, "nonstandard schema 0 declared, ignoring");
            }
            return Ok(());
        }
        let table_result = {
            let Some(db) = &self.database else {
                return Err(self.protocol_error("schema declared before domain".to_owned()));
            };

            tracing::info!(peer = %self.peer, schema = %value, "new stream schema");
            lock(db).find_or_create_table(&schema)
        };
        let table = match table_result {
            Ok(t) => t,
            Err(e) => {
                return Err(self.protocol_error(format!(
                    "cannot bind table for schema '{value}': {e}"
                )));
            }
        };

        let idx = schema.index as usize;
        if idx >= self.tables.len() {
            self.tables.resize(idx + 1, None);
        }
        if let Some(old) = &self.tables[idx] {
            tracing::warn!(
                peer = %self.peer,
                index = idx,
                old = %old.schema.name,
                new = %table.schema.name,
                "replacing existing stream schema"
            );
        }
        self.tables[idx] = Some(table);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Metadata records (stream 0)
    // -----------------------------------------------------------------------

    fn process_data_meta(&mut self, subject: &str, key: &str, value: &str) -> Result<(), HandlerError> {
        if key == "schema" {
            return self.process_schema(value);
        }
        let Some(db) = &self.database else {
            return Ok(());
        };
        let stored_key = if subject == "." || subject.is_empty() {
            key.to_owned()
        } else {
            format!("{}.{}", subject.trim_start_matches('.'), key)
        };
        lock(db).set_metadata(&stored_key, value)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Text data
    // -----------------------------------------------------------------------

    fn process_text_line(&mut self) -> Result<bool, HandlerError> {
        let Some(line) = self.take_line() else {
            return Ok(false);
        };
        if line.is_empty() {
            return Ok(true);
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            tracing::error!(peer = %self.peer, line = %line, "not enough fields in sample");
            return Ok(true);
        }

        let (Ok(ts), Ok(index), Ok(seq)) = (
            fields[0].parse::<f64>(),
            fields[1].parse::<u32>(),
            fields[2].parse::<i64>(),
        ) else {
            tracing::error!(peer = %self.peer, line = %line, "malformed sample prefix");
            return Ok(true);
        };

        if index == 0 {
            match fields.len() {
                5 => self.process_data_meta(
                    ".",
                    &text::unescape(fields[3]),
                    &text::unescape(fields[4]),
                )?,
                6 => self.process_data_meta(
                    &text::unescape(fields[3]),
                    &text::unescape(fields[4]),
                    &text::unescape(fields[5]),
                )?,
                n => {
                    tracing::warn!(
                        peer = %self.peer,
                        elements = n - 3,
                        "metadata record with unexpected number of elements"
                    );
                }
            }
            return Ok(true);
        }

        let Some(table) = self.tables.get(index as usize).and_then(Option::as_ref) else {
            tracing::warn!(peer = %self.peer, index, seq, "table index out of bounds, discarding sample");
            return Ok(true);
        };
        let table = Arc::clone(table);

        let schema = &table.schema;
        if fields.len() - 3 != schema.fields.len() {
            tracing::error!(
                peer = %self.peer,
                table = %schema.name,
                expected = schema.fields.len(),
                got = fields.len() - 3,
                "data item count mismatch"
            );
            return Ok(true);
        }

        let mut values = Vec::with_capacity(schema.fields.len());
        for (f, raw) in schema.fields.iter().zip(&fields[3..]) {
            match text::decode_field(f.kind, raw) {
                Ok(v) => values.push(v),
                Err(e) => {
                    tracing::error!(peer = %self.peer, column = %f.name, error = %e, "field conversion failed");
                    values.push(Value::default_of(f.kind));
                }
            }
        }
        self.insert_row(&table, seq, ts, values);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Binary data
    // -----------------------------------------------------------------------

    fn process_bin_frame(&mut self) -> Result<bool, HandlerError> {
        let frame = match decode_frame(&mut self.buf) {
            Ok(None) => return Ok(false),
            Ok(Some(frame)) => frame,
            Err(WireError::UnknownType(tag)) => {
                tracing::warn!(peer = %self.peer, tag, "ignoring unsupported message type");
                return Ok(true);
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "dropping malformed frame");
                return Ok(true);
            }
        };

        if frame.stream == 0 {
            let strings: Option<Vec<&str>> = frame
                .values
                .iter()
                .map(|v| match v {
                    Value::String(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            match strings.as_deref() {
                Some([key, value]) => self.process_data_meta(".", key, value)?,
                Some([subject, key, value]) => self.process_data_meta(subject, key, value)?,
                _ => {
                    tracing::warn!(
                        peer = %self.peer,
                        elements = frame.values.len(),
                        "expecting string metadata, ignoring record"
                    );
                }
            }
            return Ok(true);
        }

        let Some(table) = self
            .tables
            .get(frame.stream as usize)
            .and_then(Option::as_ref)
        else {
            tracing::warn!(
                peer = %self.peer,
                index = frame.stream,
                seq = frame.seq,
                "table index out of bounds, discarding sample"
            );
            return Ok(true);
        };
        let table = Arc::clone(table);

        let schema = &table.schema;
        if frame.values.len() != schema.fields.len() {
            tracing::error!(
                peer = %self.peer,
                table = %schema.name,
                expected = schema.fields.len(),
                got = frame.values.len(),
                "data item count mismatch"
            );
            return Ok(true);
        }
        for (f, v) in schema.fields.iter().zip(&frame.values) {
            if v.kind() != f.kind {
                tracing::error!(
                    peer = %self.peer,
                    table = %schema.name,
                    column = %f.name,
                    want = %f.kind,
                    got = %v.kind(),
                    "value kind mismatch, dropping row"
                );
                return Ok(true);
            }
        }
        self.insert_row(&table, frame.seq as i64, frame.ts, frame.values);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn insert_row(&mut self, table: &DbTable, seq: i64, ts_client: f64, values: Vec<Value>) {
        let Some(db) = &self.database else {
            return;
        };
        let Some(sender_id) = self.sender_id else {
            return;
        };
        let ts = ts_client + self.time_offset;
        tracing::trace!(
            peer = %self.peer,
            table = %table.schema.name,
            seq,
            ts,
            "inserting sample"
        );
        if let Err(e) = lock(db).insert(table, sender_id, seq, ts, &values) {
            // The batch aborts but the connection stays up.
            tracing::error!(peer = %self.peer, table = %table.schema.name, error = %e, "insert failed");
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.release();
    }
}
