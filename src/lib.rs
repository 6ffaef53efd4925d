// Library modules
pub mod addr;
pub mod broker;
pub mod config;
pub mod error;
pub mod peer;
pub mod receiver;
pub mod signals;
pub mod systemd;
pub mod transport;

// Re-export commonly used types
pub use addr::SockAddr;
pub use config::Config;
pub use error::{ConfigError, SpawnError, TransportError};
pub use peer::{peer_cred, verify_peer, PeerCred};
pub use receiver::{ActiveHandle, Receiver, SpawnMode, State};
pub use transport::{ScmConnection, ScmListener};
