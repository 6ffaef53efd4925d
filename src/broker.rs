//! Broker Event Loop — accepts TCP connections and keeps exactly one
//! receiver generation fed, replacing it on reload, failure, or crash.

use std::os::fd::AsRawFd;

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::addr::SockAddr;
use crate::config::Config;
use crate::receiver::{Receiver, SpawnMode};
use crate::systemd;

/// A hand-off failure addressed to the receiver generation it occurred
/// against, so the event loop can tell a stale failure (predecessor,
/// already replaced) from a live one.
struct ConnectionError {
    conn: TcpStream,
    addr: SockAddr,
    err: crate::error::TransportError,
}

const CONN_QUEUE_CAPACITY: usize = 1;
const ERR_QUEUE_CAPACITY: usize = 100;

/// Runs the broker until shutdown (SIGTERM/SIGINT) or a fatal error.
/// Never returns `Ok` except via a clean shutdown; all fatal conditions are
/// surfaced as `Err` for the caller to log and exit non-zero from.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let (mut reload_rx, mut shutdown_rx) = crate::signals::install()?;
    let watchdog = systemd::spawn_watchdog();

    let (conn_tx, mut conn_rx) = mpsc::channel::<TcpStream>(CONN_QUEUE_CAPACITY);
    let (err_tx, mut err_rx) = mpsc::channel::<ConnectionError>(ERR_QUEUE_CAPACITY);

    let tcp_listener = tokio::net::TcpListener::bind(("0.0.0.0", config.listen_port))
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind TCP listener on port {}: {e}", config.listen_port))?;
    log::info!("listening on 0.0.0.0:{}", config.listen_port);
    spawn_acceptor(tcp_listener, conn_tx.clone());

    let mode = spawn_mode(&config);
    let mut first_generation = true;

    loop {
        let mut receiver = Receiver::new(
            config.allowed_peer_uids.clone(),
            config.allowed_peer_gids.clone(),
        )?;
        receiver.start(&mode).await?;
        let active = receiver
            .active_handle()
            .expect("active_handle is Some immediately after a successful start");

        if first_generation {
            systemd::notify_ready();
            first_generation = false;
        }

        let should_replace = inner_loop(
            &active,
            &mut conn_rx,
            &mut reload_rx,
            &mut err_rx,
            &mut shutdown_rx,
            &conn_tx,
            &err_tx,
        )
        .await;

        receiver.stop();

        if !should_replace {
            watchdog.abort();
            return Ok(());
        }
    }
}

/// Drives one receiver generation: dispatches accepted connections to it
/// concurrently and watches for reload/failure/shutdown. Returns `true` if
/// the outer loop should construct a replacement generation, `false` if
/// the broker should shut down.
#[allow(clippy::too_many_arguments)]
async fn inner_loop(
    active: &crate::receiver::ActiveHandle,
    conn_rx: &mut mpsc::Receiver<TcpStream>,
    reload_rx: &mut crate::signals::ReloadRx,
    err_rx: &mut mpsc::Receiver<ConnectionError>,
    shutdown_rx: &mut crate::signals::ShutdownRx,
    conn_tx: &mpsc::Sender<TcpStream>,
    err_tx: &mpsc::Sender<ConnectionError>,
) -> bool {
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                log::info!("shutdown requested, stopping receiver {}", active.addr());
                return false;
            }

            Some(()) = reload_rx.recv() => {
                log::info!("reloading receiver {}", active.addr());
                systemd::notify_reloading();
                return true;
            }

            Some(conn_err) = err_rx.recv() => {
                if is_stale(&conn_err.addr, active.addr()) {
                    log::debug!(
                        "stale hand-off error for {} (current generation is {}), re-queuing",
                        conn_err.addr,
                        active.addr()
                    );
                    requeue(conn_tx.clone(), conn_err.conn);
                    continue;
                }
                log::warn!("receiver {} failed: {}", active.addr(), conn_err.err);
                requeue(conn_tx.clone(), conn_err.conn);
                return true;
            }

            Some(conn) = conn_rx.recv() => {
                dispatch(active.clone(), conn, err_tx.clone());
            }
        }
    }
}

/// A hand-off error is stale when it's addressed to a receiver generation
/// that isn't the one currently running — it belongs to a predecessor
/// already replaced and must never trigger a second replacement.
fn is_stale(err_addr: &SockAddr, current_addr: &SockAddr) -> bool {
    err_addr != current_addr
}

/// Spawns one task per accepted connection so a slow hand-off never blocks
/// the next accept.
fn dispatch(active: crate::receiver::ActiveHandle, conn: TcpStream, err_tx: mpsc::Sender<ConnectionError>) {
    tokio::spawn(async move {
        log::info!("accepted connection from {:?}", conn.peer_addr());
        let fd = conn.as_raw_fd();
        if let Err(err) = active.handle(fd).await {
            let addr = active.addr().clone();
            let _ = err_tx.send(ConnectionError { conn, addr, err }).await;
        }
    });
}

/// Re-enqueues a connection from a separate task so a full `connQ` can
/// never deadlock the inner select loop.
fn requeue(conn_tx: mpsc::Sender<TcpStream>, conn: TcpStream) {
    tokio::spawn(async move {
        if conn_tx.send(conn).await.is_err() {
            log::warn!("connQ closed while re-queuing a connection; dropping it");
        }
    });
}

fn spawn_mode(config: &Config) -> SpawnMode {
    if config.systemd_enabled {
        SpawnMode::ServiceManager {
            unit: config.receiver_unit.clone(),
        }
    } else {
        SpawnMode::Direct {
            path: config
                .receiver_path
                .clone()
                .expect("ConfigInvalid is rejected before broker::run is reached"),
        }
    }
}

fn spawn_acceptor(listener: tokio::net::TcpListener, conn_tx: mpsc::Sender<TcpStream>) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    log::debug!("accepted TCP connection from {peer}");
                    if conn_tx.send(conn).await.is_err() {
                        log::error!("connQ closed, acceptor exiting");
                        return;
                    }
                }
                Err(e) => {
                    log::error!("TCP accept failed: {e}");
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_addressed_to_current_generation_is_not_stale() {
        let addr = SockAddr::generate();
        assert!(!is_stale(&addr, &addr));
    }

    #[test]
    fn error_addressed_to_predecessor_generation_is_stale() {
        let predecessor = SockAddr::generate();
        let current = SockAddr::generate();
        assert!(is_stale(&predecessor, &current));
    }
}
