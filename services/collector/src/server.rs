//! TCP front end: accept loop and per-connection read loops.
//!
//! One task per connection feeds the protocol handler.  Handler callbacks
//! are synchronous and non-blocking apart from the storage backend, so a
//! connection task never parks the runtime while holding a lock.  Idle
//! connections are reaped after the configured timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::database::Registry;
use crate::handler::ClientHandler;

/// Run the accept loop until shutdown is signalled.
pub async fn run(
    listener: TcpListener,
    registry: Arc<Registry>,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening for clients");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("shutting down listener");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                let (sock, peer) = accepted?;
                debug!(%peer, "client connected");
                let registry = Arc::clone(&registry);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    handle_connection(sock, peer.to_string(), registry, idle_timeout, shutdown)
                        .await;
                });
            }
        }
    }
}

async fn handle_connection(
    mut sock: TcpStream,
    peer: String,
    registry: Arc<Registry>,
    idle_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handler = ClientHandler::new(peer.clone(), registry);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(%peer, "dropping connection at shutdown");
                    break;
                }
            }
            read = timeout(idle_timeout, sock.read_buf(&mut handler.buf)) => {
                match read {
                    Err(_) => {
                        info!(%peer, "idle timeout, dropping client");
                        break;
                    }
                    Ok(Ok(0)) => {
                        debug!(%peer, "client disconnected");
                        break;
                    }
                    Ok(Ok(_)) => {
                        if let Err(e) = handler.process() {
                            warn!(%peer, error = %e, "dropping client");
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(%peer, error = %e, "read error");
                        break;
                    }
                }
            }
        }
    }
    // Dropping the handler releases its database reference.
}
