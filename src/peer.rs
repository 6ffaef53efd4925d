//! Peer Authenticator — extracts and enforces peer credentials on the SCM
//! transport's UNIX-domain connection.

use std::os::fd::AsFd;

use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};

use crate::error::SpawnError;
use crate::transport::ScmConnection;

/// Kernel-attested identity of the process on the other end of a
/// UNIX-domain socket (`SO_PEERCRED` on Linux).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCred {
    pub pid: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Reads the peer credentials of `conn`.
pub fn peer_cred(conn: &ScmConnection) -> Result<PeerCred, SpawnError> {
    let fd = conn.as_fd();
    let creds = getsockopt(&fd, PeerCredentials).map_err(|e| {
        SpawnError::Dbus(format!("SO_PEERCRED failed: {e}")) // reused: no dedicated variant for a getsockopt failure
    })?;
    Ok(PeerCred {
        pid: creds.pid() as u32,
        uid: creds.uid(),
        gid: creds.gid(),
    })
}

/// Verifies `observed` is the process the broker itself spawned, and that
/// its uid/gid pass the configured allow-lists. Any failure is reported as
/// `PeerMismatch`/`PeerUidNotAllowed`/`PeerGidNotAllowed` — all three are
/// fatal for the current receiver generation, per the peer-authenticator
/// design.
pub fn verify_peer(
    observed: PeerCred,
    expected_pid: u32,
    allowed_uids: &[u32],
    allowed_gids: &[u32],
) -> Result<(), SpawnError> {
    if observed.pid != expected_pid {
        return Err(SpawnError::PeerMismatch {
            observed: observed.pid,
            expected: expected_pid,
        });
    }
    if !allowed_uids.is_empty() && !allowed_uids.contains(&observed.uid) {
        return Err(SpawnError::PeerUidNotAllowed { uid: observed.uid });
    }
    if !allowed_gids.is_empty() && !allowed_gids.contains(&observed.gid) {
        return Err(SpawnError::PeerGidNotAllowed { gid: observed.gid });
    }
    log::debug!(
        "peer verified: pid={} uid={} gid={}",
        observed.pid,
        observed.uid,
        observed.gid
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_mismatch_is_rejected() {
        let observed = PeerCred {
            pid: 100,
            uid: 0,
            gid: 0,
        };
        let err = verify_peer(observed, 200, &[], &[]).unwrap_err();
        assert!(matches!(err, SpawnError::PeerMismatch { .. }));
    }

    #[test]
    fn uid_not_in_allow_list_is_rejected() {
        let observed = PeerCred {
            pid: 100,
            uid: 1000,
            gid: 0,
        };
        let err = verify_peer(observed, 100, &[1, 2, 3], &[]).unwrap_err();
        assert!(matches!(err, SpawnError::PeerUidNotAllowed { uid: 1000 }));
    }

    #[test]
    fn empty_allow_lists_permit_any_uid_gid() {
        let observed = PeerCred {
            pid: 100,
            uid: 54321,
            gid: 54321,
        };
        assert!(verify_peer(observed, 100, &[], &[]).is_ok());
    }

    #[test]
    fn gid_not_in_allow_list_is_rejected_after_uid_passes() {
        let observed = PeerCred {
            pid: 100,
            uid: 1,
            gid: 999,
        };
        let err = verify_peer(observed, 100, &[1], &[5, 6]).unwrap_err();
        assert!(matches!(err, SpawnError::PeerGidNotAllowed { gid: 999 }));
    }
}
