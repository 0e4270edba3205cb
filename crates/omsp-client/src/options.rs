//! Recognized `--oml-*` options, environment fallbacks, and the
//! collection URI grammar.
//!
//! The scanner extracts the options it knows out of the host
//! application's argument vector and hands the rest back untouched, so an
//! instrumented program can keep its own CLI handling.  Every option has
//! an uppercase/underscore environment fallback (`--oml-collect` ↔
//! `OML_COLLECT`); the obsolescent aliases are accepted with a
//! deprecation warning.

use omsp_protocol::{ContentMode, DEFAULT_COLLECT_PORT};

/// Scanned client options, before defaults are applied.
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub node_id: Option<String>,
    pub domain: Option<String>,
    pub collect_uri: Option<String>,
    pub config_file: Option<String>,
    /// Default per-stream sample threshold; 0 means unset (treated as 1).
    pub samples: u32,
    /// Default periodic interval in seconds.
    pub interval: Option<f64>,
    /// Forced encoding; the transport picks its default otherwise.
    pub encoding: Option<ContentMode>,
    /// Total chunk-ring budget in bytes; 0 selects the default.
    pub bufsize: usize,
    pub log_file: Option<String>,
    pub log_level: Option<String>,
    pub noop: bool,
    pub help: bool,
    pub list_filters: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum OptionError {
    #[error("missing argument for '{0}'")]
    MissingArgument(&'static str),
    #[error("bad value '{value}' for '{option}'")]
    BadValue { option: &'static str, value: String },
    #[error("cannot parse collection URI '{uri}': {reason}")]
    BadUri { uri: String, reason: &'static str },
}

/// Scan `args` for recognized options; returns them plus the residual
/// argument vector in original order.
pub fn scan_args(args: &[String]) -> Result<(Options, Vec<String>), OptionError> {
    let mut opts = Options::default();
    let mut rest = Vec::with_capacity(args.len());
    let mut it = args.iter();

    fn value<'a>(
        it: &mut std::slice::Iter<'a, String>,
        opt: &'static str,
    ) -> Result<&'a String, OptionError> {
        it.next().ok_or(OptionError::MissingArgument(opt))
    }

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--oml-id" => opts.node_id = Some(value(&mut it, "--oml-id")?.clone()),
            "--oml-domain" => opts.domain = Some(value(&mut it, "--oml-domain")?.clone()),
            "--oml-exp-id" => {
                let v = value(&mut it, "--oml-exp-id")?.clone();
                tracing::warn!("option --oml-exp-id is deprecated, use '--oml-domain {v}'");
                opts.domain = Some(v);
            }
            "--oml-collect" => opts.collect_uri = Some(value(&mut it, "--oml-collect")?.clone()),
            "--oml-server" => {
                let v = value(&mut it, "--oml-server")?.clone();
                tracing::warn!("option --oml-server is deprecated, use '--oml-collect {v}'");
                opts.collect_uri = Some(v);
            }
            "--oml-file" => {
                let v = value(&mut it, "--oml-file")?.clone();
                tracing::warn!("option --oml-file is deprecated, use '--oml-collect file:{v}'");
                opts.collect_uri = Some(format!("file:{v}"));
            }
            "--oml-config" => opts.config_file = Some(value(&mut it, "--oml-config")?.clone()),
            "--oml-samples" => {
                let v = value(&mut it, "--oml-samples")?;
                opts.samples = v.parse().map_err(|_| OptionError::BadValue {
                    option: "--oml-samples",
                    value: v.clone(),
                })?;
            }
            "--oml-interval" => {
                let v = value(&mut it, "--oml-interval")?;
                let secs: f64 = v.parse().map_err(|_| OptionError::BadValue {
                    option: "--oml-interval",
                    value: v.clone(),
                })?;
                if secs <= 0.0 {
                    return Err(OptionError::BadValue {
                        option: "--oml-interval",
                        value: v.clone(),
                    });
                }
                opts.interval = Some(secs);
            }
            "--oml-bufsize" => {
                let v = value(&mut it, "--oml-bufsize")?;
                opts.bufsize = v.parse().map_err(|_| OptionError::BadValue {
                    option: "--oml-bufsize",
                    value: v.clone(),
                })?;
            }
            "--oml-log-file" => opts.log_file = Some(value(&mut it, "--oml-log-file")?.clone()),
            "--oml-log-level" => opts.log_level = Some(value(&mut it, "--oml-log-level")?.clone()),
            "--oml-text" => opts.encoding = Some(ContentMode::Text),
            "--oml-binary" => opts.encoding = Some(ContentMode::Binary),
            "--oml-noop" => opts.noop = true,
            "--oml-help" => opts.help = true,
            "--oml-list-filters" => opts.list_filters = true,
            _ => rest.push(arg.clone()),
        }
    }

    apply_env(&mut opts)?;
    Ok((opts, rest))
}

fn apply_env(opts: &mut Options) -> Result<(), OptionError> {
    let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    if opts.node_id.is_none() {
        opts.node_id = env("OML_ID").or_else(|| env("OML_NAME"));
    }
    if opts.domain.is_none() {
        opts.domain = env("OML_DOMAIN").or_else(|| {
            env("OML_EXP_ID").inspect(|_| {
                tracing::warn!("environment variable OML_EXP_ID is deprecated, use OML_DOMAIN");
            })
        });
    }
    if opts.collect_uri.is_none() {
        opts.collect_uri = env("OML_COLLECT").or_else(|| {
            env("OML_SERVER").inspect(|_| {
                tracing::warn!("environment variable OML_SERVER is deprecated, use OML_COLLECT");
            })
        });
    }
    if opts.config_file.is_none() {
        opts.config_file = env("OML_CONFIG");
    }
    if opts.samples == 0 {
        if let Some(v) = env("OML_SAMPLES") {
            opts.samples = v.parse().map_err(|_| OptionError::BadValue {
                option: "OML_SAMPLES",
                value: v,
            })?;
        }
    }
    if opts.interval.is_none() {
        if let Some(v) = env("OML_INTERVAL") {
            opts.interval = Some(v.parse().map_err(|_| OptionError::BadValue {
                option: "OML_INTERVAL",
                value: v,
            })?);
        }
    }
    if opts.bufsize == 0 {
        if let Some(v) = env("OML_BUFSIZE") {
            opts.bufsize = v.parse().map_err(|_| OptionError::BadValue {
                option: "OML_BUFSIZE",
                value: v,
            })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Collection URI
// ---------------------------------------------------------------------------

/// Parsed collection destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectTarget {
    Tcp { host: String, port: u16 },
    File { path: String, flush: bool },
}

/// Parse `[scheme:][//]host[:service]`.
///
/// Schemes are `tcp` (the default for a bare host), `file` and `flush`
/// (filesystem paths, with `flush` disabling write buffering).  `udp` is
/// recognised by the grammar but not supported as a transport.
pub fn parse_collect_uri(uri: &str) -> Result<CollectTarget, OptionError> {
    let bad = |reason: &'static str| OptionError::BadUri {
        uri: uri.to_owned(),
        reason,
    };

    if uri.is_empty() {
        return Err(bad("empty URI"));
    }

    let (scheme, rest) = match uri.split_once(':') {
        Some((s, rest)) if matches!(s, "tcp" | "udp" | "file" | "flush") => (s, rest),
        _ => ("tcp", uri),
    };

    match scheme {
        "file" | "flush" => {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            if path.is_empty() {
                return Err(bad("missing file path"));
            }
            Ok(CollectTarget::File {
                path: path.to_owned(),
                flush: scheme == "flush",
            })
        }
        "udp" => Err(bad("udp transport is not supported")),
        _ => {
            let rest = rest.strip_prefix("//").unwrap_or(rest);
            if rest.is_empty() {
                return Err(bad("missing host"));
            }
            let (host, port) = match rest.rsplit_once(':') {
                Some((h, p)) => {
                    let port: u16 = p.parse().map_err(|_| bad("bad service port"))?;
                    (h, port)
                }
                None => (rest, DEFAULT_COLLECT_PORT),
            };
            if host.is_empty() {
                return Err(bad("missing host"));
            }
            Ok(CollectTarget::Tcp {
                host: host.to_owned(),
                port,
            })
        }
    }
}
