//! Receiver Lifecycle — one generation's worth of spawned child, SCM
//! listener/connection, and the state machine between them.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;

use crate::addr::SockAddr;
use crate::error::{SpawnError, TransportError};
use crate::peer;
use crate::systemd;
use crate::transport::{ScmConnection, ScmListener};

/// How a receiver's child process comes into being.
#[derive(Debug, Clone)]
pub enum SpawnMode {
    /// `fork`+`exec` the binary at `path` directly.
    Direct { path: std::path::PathBuf },
    /// Instantiate `<unit>@<id>.service` via the system service manager.
    ServiceManager { unit: String },
}

/// Lifecycle stage of a single receiver generation. Mirrors the states
/// named in the data model: a fresh listener with no child yet, a spawned
/// but unverified child, a verified and serving child, and a torn-down
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Started,
    Active,
    Stopped,
}

/// One generation of spawned receiver: its SCM listener/connection, the
/// child's expected PID, and lifecycle state.
#[derive(Debug)]
pub struct Receiver {
    addr: SockAddr,
    listener: Option<ScmListener>,
    connection: Option<Arc<ScmConnection>>,
    state: State,
    allowed_uids: Vec<u32>,
    allowed_gids: Vec<u32>,
}

/// A cheaply-cloneable handle to one generation's active SCM connection,
/// handed to per-connection hand-off tasks so they don't need to borrow
/// the owning [`Receiver`] (which stays exclusively owned by the broker
/// loop for `start`/`stop`).
#[derive(Clone)]
pub struct ActiveHandle {
    connection: Arc<ScmConnection>,
    addr: SockAddr,
}

impl ActiveHandle {
    pub fn addr(&self) -> &SockAddr {
        &self.addr
    }

    /// Hands off one accepted TCP connection's fd to this generation's
    /// receiver.
    pub async fn handle(&self, socket_fd: std::os::fd::RawFd) -> Result<(), TransportError> {
        self.connection.send_fd(socket_fd).await
    }
}

impl Receiver {
    /// Generates a fresh address and binds the SCM listener on it. Does not
    /// spawn anything yet.
    pub fn new(allowed_uids: Vec<u32>, allowed_gids: Vec<u32>) -> Result<Self, TransportError> {
        let addr = SockAddr::generate();
        let listener = ScmListener::bind(addr.clone())?;
        log::info!("receiver {addr}: created");
        Ok(Self {
            addr,
            listener: Some(listener),
            connection: None,
            state: State::Created,
            allowed_uids,
            allowed_gids,
        })
    }

    pub fn addr(&self) -> &SockAddr {
        &self.addr
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Spawns the child (direct or service-manager mode), accepts its SCM
    /// connection, and verifies its peer identity before marking the
    /// generation `Active`.
    pub async fn start(&mut self, mode: &SpawnMode) -> Result<(), SpawnError> {
        let child_pid = match mode {
            SpawnMode::Direct { path } => self.spawn_direct(path)?,
            SpawnMode::ServiceManager { unit } => {
                systemd::start_unit(unit, self.addr.id()).await?
            }
        };
        self.state = State::Started;
        log::info!("receiver {}: started, expecting pid {child_pid}", self.addr);

        let listener = self
            .listener
            .as_ref()
            .expect("listener present until Stop");
        let conn = listener.accept().await.map_err(SpawnError::Transport)?;

        let observed = peer::peer_cred(&conn)?;
        peer::verify_peer(observed, child_pid, &self.allowed_uids, &self.allowed_gids)?;

        self.connection = Some(Arc::new(conn));
        self.state = State::Active;
        log::info!("receiver {}: active", self.addr);
        Ok(())
    }

    /// Returns a handle to the active connection for concurrent
    /// hand-off tasks, or `None` before `start` succeeds or after `stop`.
    pub fn active_handle(&self) -> Option<ActiveHandle> {
        Some(ActiveHandle {
            connection: Arc::clone(self.connection.as_ref()?),
            addr: self.addr.clone(),
        })
    }

    fn spawn_direct(&mut self, path: &std::path::Path) -> Result<u32, SpawnError> {
        let mut cmd = Command::new(path);
        cmd.arg("receiver")
            .arg(self.addr.as_str())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        unsafe {
            cmd.pre_exec(|| {
                // SAFETY: async-signal-safe syscall, no allocation or
                // locking; runs post-fork, pre-exec, single-threaded.
                if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP) } != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| SpawnError::Exec {
            path: path.to_path_buf(),
            source: e,
        })?;
        let pid = child.id().expect("freshly spawned child has a pid");

        // Reap asynchronously so a crashed direct-mode child never zombies;
        // the exit status itself isn't actionable here — failure surfaces
        // via the SCM transport (HandoffFailed/EOF) instead.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => log::debug!("direct receiver pid {pid} exited: {status}"),
                Err(e) => log::warn!("direct receiver pid {pid}: wait failed: {e}"),
            }
        });

        Ok(pid)
    }

    /// Closes the SCM listener then the SCM connection, in that order. The
    /// child observes EOF/EPIPE on its own transport and is expected to
    /// drain in-flight connections and exit on its own (direct-mode
    /// children are reaped by the task spawned in `spawn_direct`).
    pub fn stop(&mut self) {
        log::info!("receiver {}: stopped", self.addr);
        self.listener = None;
        self.connection = None;
        self.state = State::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_receiver_starts_in_created_state() {
        let r = Receiver::new(vec![], vec![]).expect("new");
        assert_eq!(r.state(), State::Created);
    }

    #[tokio::test]
    async fn stop_before_start_is_safe_and_sets_stopped() {
        let mut r = Receiver::new(vec![], vec![]).expect("new");
        r.stop();
        assert_eq!(r.state(), State::Stopped);
    }

    #[tokio::test]
    async fn active_handle_is_none_before_start() {
        let r = Receiver::new(vec![], vec![]).expect("new");
        assert!(r.active_handle().is_none());
    }
}
