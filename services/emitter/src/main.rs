//! Synthetic measurement generator.
//!
//! Drives the client library against a collector (or a file sink) with a
//! configurable sample count and rate; handy for soak-testing a
//! collector deployment and for demos.

use std::time::Duration;

use clap::Parser;
use tracing::info;

use omsp_client::Client;
use omsp_protocol::{FieldDef, Value, ValueKind};

#[derive(Parser, Debug)]
#[command(name = "emitter", about = "Synthetic OMSP measurement source", version)]
struct Args {
    /// Collection URI ([tcp:]host[:port], file:PATH, flush:PATH).
    #[arg(long, default_value = "localhost")]
    collect: String,

    /// Sender id.
    #[arg(long, default_value = "emitter")]
    id: String,

    /// Experimental domain.
    #[arg(long, default_value = "emitter_demo")]
    domain: String,

    /// Number of samples to emit.
    #[arg(long, default_value_t = 1000)]
    count: u64,

    /// Samples per second.
    #[arg(long, default_value_t = 100.0)]
    rate: f64,

    /// Sample threshold handed to the client (--oml-samples).
    #[arg(long, default_value_t = 1)]
    samples: u32,

    /// Force the text encoding instead of the transport default.
    #[arg(long)]
    text: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut oml_args = vec![
        "--oml-collect".to_owned(),
        args.collect.clone(),
        "--oml-id".to_owned(),
        args.id.clone(),
        "--oml-domain".to_owned(),
        args.domain.clone(),
        "--oml-samples".to_owned(),
        args.samples.to_string(),
    ];
    if args.text {
        oml_args.push("--oml-text".to_owned());
    }

    let (client, _rest) = match Client::init("emitter", &oml_args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: client initialisation failed: {e}");
            std::process::exit(1);
        }
    };

    let mp = client
        .add_mp(
            "radio",
            &[
                FieldDef::new("frame", ValueKind::UInt64),
                FieldDef::new("rssi", ValueKind::Double),
                FieldDef::new("channel", ValueKind::UInt32),
                FieldDef::new("busy", ValueKind::Bool),
            ],
        )
        .expect("MP declaration failed");

    if let Err(e) = client.start() {
        eprintln!("FATAL: cannot start collection: {e}");
        std::process::exit(1);
    }

    let pause = Duration::from_secs_f64(1.0 / args.rate.max(0.001));
    info!(count = args.count, rate = args.rate, "emitting samples");
    for frame in 0..args.count {
        let phase = frame as f64 / 25.0;
        let sample = [
            Value::UInt64(frame),
            Value::Double(-45.0 + 10.0 * phase.sin()),
            Value::UInt32(1 + (frame % 11) as u32),
            Value::Bool(frame % 7 == 0),
        ];
        if let Err(e) = client.inject(&mp, &sample) {
            eprintln!("FATAL: injection failed: {e}");
            std::process::exit(1);
        }
        std::thread::sleep(pause);
    }

    client.close();
    let lost = client.lost_samples();
    if lost > 0 {
        info!(lost, "samples dropped under backpressure");
    }
    info!("done");
}
