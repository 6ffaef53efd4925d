//! Error taxonomy for the broker (see error handling design).
//!
//! Each variant corresponds to one row of the error-kind table: it names the
//! phase the error occurred in and whether the broker treats it as fatal or
//! as a signal to replace the current receiver.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("receiver_path is empty but systemd_enabled is false: no way to start a receiver")]
    MissingReceiverPath,

    #[error("listen_port must be nonzero")]
    InvalidListenPort,
}

/// Errors raised by the SCM transport (listen/dial/send/recv).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind SCM listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection kind unsupported for FD hand-off (must be TCP or UDP)")]
    UnsupportedKind,

    #[error("short write on control channel: sent {sent} of {expected} control bytes")]
    ShortWrite { sent: usize, expected: usize },

    #[error("hand-off failed: {0}")]
    HandoffFailed(#[source] std::io::Error),

    #[error("received ancillary data was not a single SCM_RIGHTS message")]
    InvalidAncillary,

    #[error("expected exactly one file descriptor, received {0}")]
    WrongFdCount(usize),

    #[error("transport closed by peer")]
    TransportClosed,
}

/// Errors raised while spawning or verifying a receiver.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to fork/exec receiver at {path}: {source}")]
    Exec {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("systemd StartUnit for {unit} did not complete: {result}")]
    UnitStartFailed { unit: String, result: String },

    #[error("systemd D-Bus call failed: {0}")]
    Dbus(String),

    #[error("unit {unit} reported a MainPID of unsupported D-Bus type {ty}")]
    InvalidMainPidType { unit: String, ty: String },

    #[error("peer pid {observed} does not match spawned pid {expected}")]
    PeerMismatch { observed: u32, expected: u32 },

    #[error("peer uid {uid} is not in the configured allow-list")]
    PeerUidNotAllowed { uid: u32 },

    #[error("peer gid {gid} is not in the configured allow-list")]
    PeerGidNotAllowed { gid: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
