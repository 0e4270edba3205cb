use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use collector::database::Registry;

#[derive(Parser, Debug)]
#[command(name = "collector", about = "OMSP measurement collection server", version)]
struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:3003")]
    listen: String,

    /// Directory holding one SQLite database per domain.
    #[arg(short, long, default_value = "/var/lib/omsp")]
    data_dir: PathBuf,

    /// Seconds after which idle client sockets are cleaned up.
    #[arg(short, long, default_value_t = 60)]
    timeout: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "collector starting");

    if let Err(e) = std::fs::create_dir_all(&args.data_dir) {
        error!(dir = %args.data_dir.display(), error = %e, "cannot create data directory");
        std::process::exit(2);
    }
    let registry = Arc::new(Registry::new(args.data_dir.clone()));

    let listener = match TcpListener::bind(&args.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %args.listen, error = %e, "cannot bind listening socket");
            std::process::exit(2);
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let signalled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let stop_tx = stop_tx.clone();
        let signalled = Arc::clone(&signalled);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("termination signal received, stopping");
                signalled.store(true, std::sync::atomic::Ordering::SeqCst);
                let _ = stop_tx.send(true);
            }
        });
    }

    let result = collector::server::run(
        listener,
        Arc::clone(&registry),
        Duration::from_secs(args.timeout),
        stop_rx,
    )
    .await;

    registry.close_all();

    match result {
        Ok(()) => {
            if signalled.load(std::sync::atomic::Ordering::SeqCst) {
                // A signal-triggered termination reports through the exit
                // status.
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!(error = %e, "server loop failed");
            std::process::exit(2);
        }
    }
}
