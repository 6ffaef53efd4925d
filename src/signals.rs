//! Signal & Reload Channel — SIGHUP coalesces into a single-slot reload
//! request; SIGTERM/SIGINT feed a shutdown watcher.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Receiving end of the reload channel. A single pending reload is all
/// that's ever buffered — further SIGHUPs arriving before it's consumed are
/// dropped, which is the coalescing behavior the broker loop relies on.
pub type ReloadRx = mpsc::Receiver<()>;
/// Receiving end of the shutdown channel (SIGTERM or SIGINT).
pub type ShutdownRx = mpsc::Receiver<()>;

/// Installs signal handlers and returns their receiving channels. Must be
/// called once, early in process startup, before any signal of interest
/// could otherwise be missed.
pub fn install() -> anyhow::Result<(ReloadRx, ShutdownRx)> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let (reload_tx, reload_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

    tokio::spawn(async move {
        loop {
            if sighup.recv().await.is_none() {
                return;
            }
            log::info!("received SIGHUP, requesting reload");
            // try_send drops the signal if a reload is already pending —
            // that's the coalescing the reload channel is for.
            let _ = reload_tx.try_send(());
        }
    });

    tokio::spawn(async move {
        tokio::select! {
            sig = sigterm.recv() => {
                if sig.is_some() {
                    log::info!("received SIGTERM, requesting shutdown");
                }
            }
            sig = sigint.recv() => {
                if sig.is_some() {
                    log::info!("received SIGINT, requesting shutdown");
                }
            }
        }
        let _ = shutdown_tx.try_send(());
    });

    Ok((reload_rx, shutdown_rx))
}
