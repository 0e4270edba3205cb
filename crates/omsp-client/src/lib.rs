// omsp-client: the instrumentation library.
//
// An application declares measurement points, starts the client, and
// injects samples; the library filters them into measurement streams and
// ships them to a collection point over OMSP, buffering and reconnecting
// on its own.  The API is synchronous and callable from any thread; the
// hot path never blocks on network I/O.

pub mod buffer;
pub mod filter;
pub mod filters;
pub mod options;
pub mod point;
pub mod stream;
pub mod writer;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use omsp_protocol::schema::METADATA_TABLE;
use omsp_protocol::{ContentMode, FieldDef, PROTOCOL_VERSION, Value, ValueKind, valid_name};

use crate::filter::{BoundFilter, FilterError, FilterRegistry};
use crate::options::{CollectTarget, OptionError, Options, parse_collect_uri, scan_args};
use crate::point::{MeasurePoint, Mp, Stream, spawn_timer};
use crate::stream::{FileOutStream, OutStream, TcpOutStream};
use crate::writer::{Writer, create_writer};

/// Seconds since the Unix epoch, as a double.
pub(crate) fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("illegal application name '{0}'")]
    InvalidAppName(String),
    #[error("invalid identifier '{0}'")]
    InvalidName(String),
    #[error("measurement point '{0}' already declared")]
    DuplicateMp(String),
    #[error("client not started")]
    NotStarted,
    #[error("client already started")]
    AlreadyStarted,
    #[error("expected {want} values, got {got}")]
    WrongArity { want: usize, got: usize },
    #[error("field '{field}' expects {want}, got {got}")]
    KindMismatch {
        field: String,
        want: ValueKind,
        got: ValueKind,
    },
    #[error("metadata values must be strings")]
    MetadataValue,
    #[error("missing --oml-collect destination")]
    MissingCollect,
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Option(#[from] OptionError),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

/// The client instance: registry of MPs, writers, and session identity.
///
/// Returned by [`Client::init`]; every other call goes through it.  The
/// former process-wide singleton of this kind of library is deliberately
/// an explicit handle here.
pub struct Client {
    app_name: String,
    node_id: String,
    domain: String,
    opts: Options,
    registry: FilterRegistry,
    meta_mp: Mp,
    mps: Mutex<Vec<Mp>>,
    writers: Mutex<Vec<Arc<dyn Writer>>>,
    /// Wall-clock session base (whole seconds); set once by `start`.
    start_time: OnceLock<f64>,
    next_index: AtomicU32,
    closed: AtomicBool,
    noop: bool,
}

impl Client {
    /// Initialise the client.
    ///
    /// Scans the recognized `--oml-*` options out of `args` (with
    /// environment fallbacks) and returns the residual arguments for the
    /// application's own parser.  `--oml-help` and `--oml-list-filters`
    /// print and exit the process; `--oml-noop` yields a client that
    /// silently discards all measurements.
    pub fn init(app_name: &str, args: &[String]) -> Result<(Client, Vec<String>), ClientError> {
        let app_name = validate_app_name(app_name)?;
        let (opts, rest) = scan_args(args)?;

        let registry = FilterRegistry::with_builtins();
        if opts.help {
            print_usage();
            std::process::exit(0);
        }
        if opts.list_filters {
            for name in registry.names() {
                println!("{name}");
            }
            std::process::exit(0);
        }

        let node_id = opts.node_id.clone().unwrap_or_else(|| {
            tracing::debug!("no --oml-id given, using application name");
            app_name.clone()
        });
        let domain = opts.domain.clone().unwrap_or_else(|| {
            tracing::debug!("no --oml-domain given, using application name");
            app_name.clone()
        });

        let meta_mp = Arc::new(MeasurePoint::new(
            METADATA_TABLE.to_owned(),
            omsp_protocol::Schema::metadata().fields,
        ));

        let noop = opts.noop;
        let client = Client {
            app_name,
            node_id,
            domain,
            opts,
            registry,
            meta_mp: Arc::clone(&meta_mp),
            mps: Mutex::new(vec![meta_mp]),
            writers: Mutex::new(Vec::new()),
            start_time: OnceLock::new(),
            next_index: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            noop,
        };
        tracing::info!(
            app = %client.app_name,
            id = %client.node_id,
            domain = %client.domain,
            protocol = PROTOCOL_VERSION,
            "client initialised"
        );
        Ok((client, rest))
    }

    /// Declare a measurement point.
    ///
    /// Before `start`, the MP simply joins the registry.  After `start`,
    /// the new stream is announced to the collection point through a
    /// schema-0 metadata record and gets the next free index.
    pub fn add_mp(&self, name: &str, fields: &[FieldDef]) -> Result<Mp, ClientError> {
        if !valid_name(name) {
            return Err(ClientError::InvalidName(name.to_owned()));
        }
        for f in fields {
            if !valid_name(&f.name) {
                return Err(ClientError::InvalidName(f.name.clone()));
            }
        }
        {
            let mps = lock(&self.mps);
            if mps.iter().any(|mp| mp.name() == name) {
                return Err(ClientError::DuplicateMp(name.to_owned()));
            }
        }

        let mp = Arc::new(MeasurePoint::new(name.to_owned(), fields.to_vec()));

        if let Some(&base) = self.start_time.get() {
            if !self.noop {
                let writer = lock(&self.writers).first().cloned();
                let Some(writer) = writer else {
                    return Err(ClientError::NotStarted);
                };
                let index = self.next_index.fetch_add(1, Ordering::SeqCst);
                let stream = self.build_default_stream(&mp, index, writer)?;
                let schema_meta = stream.schema().to_meta();
                let interval = stream.interval;
                mp.lock_state().streams.push(stream);
                tracing::debug!(schema = %schema_meta, "declaring late MP through schema 0");
                self.inject_schema0(".", "schema", &schema_meta)?;
                if let Some(iv) = interval {
                    spawn_timer(Arc::clone(&mp), index, iv, base);
                }
            }
        }

        lock(&self.mps).push(Arc::clone(&mp));
        Ok(mp)
    }

    /// Freeze the declared schemas, emit the protocol headers, and allow
    /// injection.
    pub fn start(&self) -> Result<(), ClientError> {
        if self.start_time.get().is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        let base = unix_now().floor();

        if self.noop {
            let _ = self.start_time.set(base);
            return Ok(());
        }
        if let Some(cfg) = &self.opts.config_file {
            return Err(ClientError::Config(format!(
                "configuration files are not supported ('{cfg}'); use --oml-* options"
            )));
        }

        let uri = self
            .opts
            .collect_uri
            .clone()
            .ok_or(ClientError::MissingCollect)?;
        let target = parse_collect_uri(&uri)?;
        let (out, default_encoding): (Box<dyn OutStream>, ContentMode) = match target {
            CollectTarget::Tcp { host, port } => (
                Box::new(TcpOutStream::new(&host, port)),
                ContentMode::Binary,
            ),
            CollectTarget::File { path, flush } => {
                (Box::new(FileOutStream::new(&path, flush)), ContentMode::Text)
            }
        };
        let encoding = self.opts.encoding.unwrap_or(default_encoding);
        let writer: Arc<dyn Writer> = Arc::from(create_writer(out, encoding, self.opts.bufsize));
        lock(&self.writers).push(Arc::clone(&writer));

        let _ = self.start_time.set(base);

        // Give every MP its default stream; schema 0 comes first.
        let mps: Vec<Mp> = lock(&self.mps).clone();
        let mut schema_lines = Vec::with_capacity(mps.len());
        let mut timers = Vec::new();
        for (index, mp) in (0u32..).zip(&mps) {
            let stream = self.build_default_stream(mp, index, Arc::clone(&writer))?;
            schema_lines.push(format!("schema: {}", stream.schema().to_meta()));
            if let Some(iv) = stream.interval {
                timers.push((Arc::clone(mp), index, iv));
            }
            mp.lock_state().streams.push(stream);
        }
        self.next_index.store(mps.len() as u32, Ordering::SeqCst);

        for w in lock(&self.writers).iter() {
            w.meta(&format!("protocol: {PROTOCOL_VERSION}"));
            w.meta(&format!("domain: {}", self.domain));
            w.meta(&format!("start-time: {}", base as u64));
            w.meta(&format!("sender-id: {}", self.node_id));
            w.meta(&format!("app-name: {}", self.app_name));
            for line in &schema_lines {
                w.meta(line);
            }
            w.header_done();
        }

        for (mp, index, interval) in timers {
            spawn_timer(mp, index, interval, base);
        }
        tracing::info!(domain = %self.domain, "measurement collection started");
        Ok(())
    }

    /// Inject one sample into a measurement point.  The central hot path:
    /// takes the MP lock, feeds every attached stream, fires
    /// threshold-mode streams.  Never blocks on network I/O; values are
    /// copied so the caller may reuse its buffers on return.
    pub fn inject(&self, mp: &Mp, values: &[Value]) -> Result<(), ClientError> {
        if self.noop {
            return Ok(());
        }
        let Some(&base) = self.start_time.get() else {
            return Err(ClientError::NotStarted);
        };
        if !mp.is_active() || self.closed.load(Ordering::Acquire) {
            return Ok(());
        }

        let fields = mp.fields();
        if values.len() != fields.len() {
            return Err(ClientError::WrongArity {
                want: fields.len(),
                got: values.len(),
            });
        }
        for (f, v) in fields.iter().zip(values) {
            if v.kind() != f.kind {
                return Err(ClientError::KindMismatch {
                    field: f.name.clone(),
                    want: f.kind,
                    got: v.kind(),
                });
            }
        }

        let now = unix_now() - base;
        let mut st = mp.lock_state();
        for stream in &mut st.streams {
            stream.input(values);
            stream.process(now);
        }
        Ok(())
    }

    /// Inject a metadata record about an MP (or one of its fields) on
    /// stream 0.  Only string values are accepted.
    pub fn inject_metadata(
        &self,
        mp: &Mp,
        key: &str,
        value: &Value,
        fname: Option<&str>,
    ) -> Result<(), ClientError> {
        if !valid_name(key) {
            return Err(ClientError::InvalidName(key.to_owned()));
        }
        let Value::String(value) = value else {
            tracing::warn!(key, "only string values are accepted as metadata");
            return Err(ClientError::MetadataValue);
        };

        let mut subject = format!(".{}_{}", self.app_name, mp.name());
        if let Some(fname) = fname {
            if mp.field_index(fname).is_some() {
                subject.push('.');
                subject.push_str(fname);
            } else {
                tracing::warn!(field = fname, mp = mp.name(), "field not found, not qualifying subject");
            }
        }
        self.inject_schema0(&subject, key, value)
    }

    /// The scanned options, e.g. for the host application to apply
    /// `--oml-log-level` / `--oml-log-file` to its own subscriber.
    pub fn options(&self) -> &Options {
        &self.opts
    }

    /// Samples dropped under backpressure since the last call, across all
    /// writers.
    pub fn lost_samples(&self) -> u64 {
        lock(&self.writers).iter().map(|w| w.nlost_reset()).sum()
    }

    /// Deactivate all MPs and tear down the writers.  Each writer blocks
    /// until its buffered queue drains (or its stream keeps failing).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for mp in lock(&self.mps).iter() {
            mp.deactivate();
        }
        for w in lock(&self.writers).iter() {
            w.close();
        }
        tracing::debug!(app = %self.app_name, "client closed");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn inject_schema0(&self, subject: &str, key: &str, value: &str) -> Result<(), ClientError> {
        let values = [
            Value::String(subject.to_owned()),
            Value::String(key.to_owned()),
            Value::String(value.to_owned()),
        ];
        let meta_mp = Arc::clone(&self.meta_mp);
        self.inject(&meta_mp, &values)
    }

    /// Default stream for an MP: the option-selected trigger, and per
    /// field the `avg`-or-`first` policy.  Stream 0 (metadata) always
    /// fires per record.
    fn build_default_stream(
        &self,
        mp: &Mp,
        index: u32,
        writer: Arc<dyn Writer>,
    ) -> Result<Stream, FilterError> {
        let (threshold, interval) = if index == 0 {
            (Some(1), None)
        } else if let Some(iv) = self.opts.interval {
            (None, Some(iv))
        } else {
            (Some(self.opts.samples.max(1)), None)
        };
        let multiple = interval.is_some() || threshold.is_some_and(|t| t > 1);

        let mut filters = Vec::with_capacity(mp.fields().len());
        for (i, f) in mp.fields().iter().enumerate() {
            filters.push(BoundFilter {
                filter: self.registry.create_default(f.kind, multiple)?,
                field_index: i,
                prefix: f.name.clone(),
            });
        }

        let table = if index == 0 {
            METADATA_TABLE.to_owned()
        } else {
            format!("{}_{}", self.app_name, mp.name())
        };
        Ok(Stream {
            index,
            table,
            seq: 0,
            sample_count: 0,
            threshold,
            interval,
            filters,
            writer,
        })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

/// Strip any path prefix and validate the remainder as an identifier.
fn validate_app_name(name: &str) -> Result<String, ClientError> {
    let base = name.rsplit('/').next().unwrap_or(name);
    if valid_name(base) {
        Ok(base.to_owned())
    } else {
        Err(ClientError::InvalidAppName(name.to_owned()))
    }
}

fn print_usage() {
    println!("OMSP client library, protocol V{PROTOCOL_VERSION}");
    println!();
    println!("Recognized options:");
    println!("  --oml-id NAME          sender identity");
    println!("  --oml-domain NAME      experimental domain");
    println!("  --oml-collect URI      collection destination ([tcp:]host[:port], file:PATH, flush:PATH)");
    println!("  --oml-samples N        default sample threshold");
    println!("  --oml-interval S       default reporting interval [s]");
    println!("  --oml-text             force text encoding");
    println!("  --oml-binary           force binary encoding");
    println!("  --oml-bufsize B        total buffer budget [B]");
    println!("  --oml-log-file FILE    log destination");
    println!("  --oml-log-level LEVEL  log verbosity");
    println!("  --oml-noop             discard all measurements");
    println!("  --oml-list-filters     list available filters and exit");
    println!("  --oml-help             this text");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    fn file_client(path: &std::path::Path, extra: &[&str]) -> Client {
        let mut a = vec![
            "--oml-collect".to_owned(),
            format!("file:{}", path.display()),
            "--oml-id".to_owned(),
            "n1".to_owned(),
            "--oml-domain".to_owned(),
            "d1".to_owned(),
        ];
        a.extend(extra.iter().map(|s| (*s).to_owned()));
        let (client, rest) = Client::init("app", &a).unwrap();
        assert!(rest.is_empty());
        client
    }

    #[test]
    fn app_name_validation() {
        assert_eq!(validate_app_name("app").unwrap(), "app");
        assert_eq!(validate_app_name("/usr/bin/app").unwrap(), "app");
        assert!(validate_app_name("my app").is_err());
        assert!(validate_app_name("").is_err());
    }

    #[test]
    fn basic_text_flow_single_mp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.out");
        let client = file_client(&path, &[]);

        let mp = client
            .add_mp("m", &[FieldDef::new("v", ValueKind::Int32)])
            .unwrap();
        client.start().unwrap();
        client.inject(&mp, &[Value::Int32(1)]).unwrap();
        client.inject(&mp, &[Value::Int32(2)]).unwrap();
        client.close();

        let content = std::fs::read_to_string(&path).unwrap();
        let header_end = content
            .find("content: text\n\n")
            .expect("header block ends with content: text and a blank line");
        let header = &content[..header_end];
        assert!(header.contains("protocol: 4\n"));
        assert!(header.contains("domain: d1\n"));
        assert!(header.contains("sender-id: n1\n"));
        assert!(header.contains("app-name: app\n"));
        assert!(header.contains(
            "schema: 0 _experiment_metadata subject:string key:string value:string\n"
        ));
        assert!(header.contains("schema: 1 app_m v:int32\n"));

        let body = &content[header_end + "content: text\n\n".len()..];
        let rows: Vec<&str> = body.lines().collect();
        assert_eq!(rows.len(), 2);
        for (i, row) in rows.iter().enumerate() {
            let fields: Vec<&str> = row.split('\t').collect();
            assert_eq!(fields.len(), 4);
            assert!(fields[0].contains('.'), "timestamp is not a decimal: {row}");
            assert!(fields[0].parse::<f64>().unwrap() >= 0.0);
            assert_eq!(fields[1], "1");
            assert_eq!(fields[2], (i + 1).to_string());
            assert_eq!(fields[3], (i + 1).to_string());
        }
    }

    #[test]
    fn threshold_avg_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avg.out");
        let client = file_client(&path, &["--oml-samples", "10"]);

        let mp = client
            .add_mp("m", &[FieldDef::new("x", ValueKind::Double)])
            .unwrap();
        client.start().unwrap();
        for i in 0..100 {
            client.inject(&mp, &[Value::Double(f64::from(i))]).unwrap();
        }
        client.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("schema: 1 app_m x_avg:double x_min:double x_max:double\n"));
        let rows: Vec<Vec<&str>> = content
            .lines()
            .filter(|l| l.split('\t').nth(1) == Some("1"))
            .map(|l| l.split('\t').collect())
            .collect();
        assert_eq!(rows.len(), 10);
        for (k, row) in rows.iter().enumerate() {
            let base = k as f64 * 10.0;
            assert_eq!(row[2], (k + 1).to_string());
            assert_eq!(row[3].parse::<f64>().unwrap(), base + 4.5);
            assert_eq!(row[4].parse::<f64>().unwrap(), base);
            assert_eq!(row[5].parse::<f64>().unwrap(), base + 9.0);
        }
    }

    #[test]
    fn late_mp_is_declared_through_schema0() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.out");
        let client = file_client(&path, &[]);

        let m1 = client
            .add_mp("m1", &[FieldDef::new("a", ValueKind::Int32)])
            .unwrap();
        client.start().unwrap();
        client.inject(&m1, &[Value::Int32(1)]).unwrap();

        let m2 = client
            .add_mp("m2", &[FieldDef::new("y", ValueKind::UInt64)])
            .unwrap();
        client.inject(&m2, &[Value::UInt64(42)]).unwrap();
        client.close();

        let content = std::fs::read_to_string(&path).unwrap();
        let meta_pos = content
            .find("\tschema\t2 app_m2 y:uint64")
            .expect("schema-0 record declaring m2");
        let data_pos = content
            .lines()
            .scan(0usize, |off, l| {
                let this = *off;
                *off += l.len() + 1;
                Some((this, l))
            })
            .find(|(_, l)| l.split('\t').nth(1) == Some("2"))
            .map(|(off, _)| off)
            .expect("a sample on stream 2");
        assert!(meta_pos < data_pos, "schema record must precede the first sample");
    }

    #[test]
    fn periodic_stream_emits_on_timer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("periodic.out");
        let client = file_client(&path, &["--oml-interval", "0.05"]);

        let mp = client
            .add_mp("m", &[FieldDef::new("x", ValueKind::Double)])
            .unwrap();
        client.start().unwrap();
        client.inject(&mp, &[Value::Double(1.0)]).unwrap();
        client.inject(&mp, &[Value::Double(2.0)]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));
        client.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("schema: 1 app_m x_avg:double x_min:double x_max:double\n"));
        let rows: Vec<Vec<String>> = content
            .lines()
            .filter(|l| l.split('\t').nth(1) == Some("1"))
            .map(|l| l.split('\t').map(str::to_owned).collect())
            .collect();
        assert!(!rows.is_empty(), "timer thread never emitted a row");
        // The first window holds at least the first sample; both samples
        // show up across the emitted windows.
        assert_eq!(rows[0][4].parse::<f64>().unwrap(), 1.0);
        let saw_max = rows
            .iter()
            .any(|r| r[5].parse::<f64>().is_ok_and(|v| (v - 2.0).abs() < 1e-9));
        assert!(saw_max, "no window saw the second sample");
    }

    #[test]
    fn noop_discards_everything() {
        let (client, _) = Client::init("app", &args(&["--oml-noop"])).unwrap();
        let mp = client
            .add_mp("m", &[FieldDef::new("v", ValueKind::Int32)])
            .unwrap();
        client.start().unwrap();
        client.inject(&mp, &[Value::Int32(1)]).unwrap();
        client.close();
    }

    #[test]
    fn inject_before_start_fails() {
        let (client, _) =
            Client::init("app", &args(&["--oml-collect", "file:/dev/null"])).unwrap();
        let mp = client
            .add_mp("m", &[FieldDef::new("v", ValueKind::Int32)])
            .unwrap();
        assert!(matches!(
            client.inject(&mp, &[Value::Int32(1)]),
            Err(ClientError::NotStarted)
        ));
    }

    #[test]
    fn kind_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.out");
        let client = file_client(&path, &[]);
        let mp = client
            .add_mp("m", &[FieldDef::new("v", ValueKind::Int32)])
            .unwrap();
        client.start().unwrap();
        assert!(matches!(
            client.inject(&mp, &[Value::Double(1.0)]),
            Err(ClientError::KindMismatch { .. })
        ));
        assert!(matches!(
            client.inject(&mp, &[]),
            Err(ClientError::WrongArity { .. })
        ));
        client.close();
    }

    #[test]
    fn duplicate_and_invalid_names_are_refused() {
        let (client, _) =
            Client::init("app", &args(&["--oml-collect", "file:/dev/null"])).unwrap();
        client
            .add_mp("m", &[FieldDef::new("v", ValueKind::Int32)])
            .unwrap();
        assert!(matches!(
            client.add_mp("m", &[FieldDef::new("v", ValueKind::Int32)]),
            Err(ClientError::DuplicateMp(_))
        ));
        assert!(matches!(
            client.add_mp("2bad", &[]),
            Err(ClientError::InvalidName(_))
        ));
        assert!(matches!(
            client.add_mp("ok", &[FieldDef::new("bad name", ValueKind::Int32)]),
            Err(ClientError::InvalidName(_))
        ));
    }

    #[test]
    fn metadata_injection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.out");
        let client = file_client(&path, &[]);
        let mp = client
            .add_mp("m", &[FieldDef::new("v", ValueKind::Int32)])
            .unwrap();
        client.start().unwrap();
        client
            .inject_metadata(&mp, "units", &Value::String("mW".to_owned()), Some("v"))
            .unwrap();
        assert!(matches!(
            client.inject_metadata(&mp, "units", &Value::Int32(3), None),
            Err(ClientError::MetadataValue)
        ));
        assert!(matches!(
            client.inject_metadata(&mp, "bad key", &Value::String("x".to_owned()), None),
            Err(ClientError::InvalidName(_))
        ));
        client.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(".app_m.v\tunits\tmW"));
    }
}
