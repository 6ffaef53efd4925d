//! Service-manager integration: `sd_notify`-protocol notifications over the
//! `NOTIFY_SOCKET` datagram socket, the watchdog heartbeat, and the D-Bus
//! `StartUnit`/`MainPID` dance used to instantiate a receiver unit.
//!
//! Notification is a UNIX datagram write (systemd's `sd_notify(3)` wire
//! format); unit management is a separate concern over the system D-Bus —
//! the two are not the same channel, mirroring the split in the reference
//! implementation between its notify helper and its `go-systemd/dbus`
//! client.

use std::os::unix::net::UnixDatagram;
use std::time::Duration;

use futures_util::StreamExt;
use zbus::Connection;

use crate::error::SpawnError;

/// How long to wait for systemd to report a unit's start job as finished
/// before giving up, mirroring the reference implementation's bounded wait
/// on `JobRemoved`.
const START_UNIT_TIMEOUT: Duration = Duration::from_secs(30);

/// True when the process appears to be running under a service manager
/// that speaks the `sd_notify` protocol (i.e. `NOTIFY_SOCKET` is set).
/// Unlike the reference implementation's `SYSTEMD` env flag, this derives
/// presence from the environment systemd itself sets up, which is what
/// `Config::systemd_enabled`'s default detection reads.
pub fn detected() -> bool {
    std::env::var_os("NOTIFY_SOCKET").is_some()
}

fn notify_socket_addr() -> Option<String> {
    std::env::var("NOTIFY_SOCKET").ok()
}

/// Sends a raw `sd_notify` payload. A no-op (returns `Ok(())`) when
/// `NOTIFY_SOCKET` is unset, so callers can invoke this unconditionally.
fn notify(payload: &str) -> std::io::Result<()> {
    let Some(addr) = notify_socket_addr() else {
        return Ok(());
    };
    let sock = UnixDatagram::unbound()?;
    sock.connect(&addr)?;
    sock.send(payload.as_bytes())?;
    Ok(())
}

/// Sends `READY=1`, signalling the first receiver generation is active.
pub fn notify_ready() {
    if let Err(e) = notify("READY=1") {
        log::warn!("systemd: READY notification failed: {e}");
    }
}

/// Sends `RELOADING=1` plus the current monotonic clock reading, per the
/// `sd_notify` reload protocol. Called before stopping the outgoing
/// receiver generation so the service manager knows a reload, not a crash,
/// is in progress.
pub fn notify_reloading() {
    let usec = monotonic_usec();
    if let Err(e) = notify(&format!("RELOADING=1\nMONOTONIC_USEC={usec}")) {
        log::warn!("systemd: RELOADING notification failed: {e}");
    }
}

fn monotonic_usec() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out-pointer for clock_gettime, sized and
    // aligned for `libc::timespec`.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

/// Spawns the watchdog heartbeat task. Always spawned; becomes a
/// permanently-idle task when not under a service manager or when
/// `WATCHDOG_USEC` is absent, per the ambient watchdog design.
pub fn spawn_watchdog() -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(usec) = watchdog_interval_usec() else {
            return;
        };
        let interval = Duration::from_micros(usec / 2);
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = notify("WATCHDOG=1") {
                log::warn!("systemd: WATCHDOG notification failed: {e}");
            }
        }
    })
}

fn watchdog_interval_usec() -> Option<u64> {
    if !detected() {
        return None;
    }
    std::env::var("WATCHDOG_USEC").ok()?.parse().ok()
}

/// Instantiates `<unit>@<id>.service` with mode "replace" via
/// `org.freedesktop.systemd1`, waits synchronously for the start job to
/// finish, and returns the unit's `MainPID`. Rejects if the job's result
/// token is anything but `"done"`.
pub async fn start_unit(unit_template: &str, id: &str) -> Result<u32, SpawnError> {
    let target = format!("{unit_template}@{id}.service");

    let conn = Connection::system()
        .await
        .map_err(|e| SpawnError::Dbus(e.to_string()))?;

    let manager = zbus::Proxy::new(
        &conn,
        "org.freedesktop.systemd1",
        "/org/freedesktop/systemd1",
        "org.freedesktop.systemd1.Manager",
    )
    .await
    .map_err(|e| SpawnError::Dbus(e.to_string()))?;

    // Subscribe before calling StartUnit, or a job that finishes fast could
    // emit JobRemoved before we're listening for it.
    let mut job_removed = manager
        .receive_signal("JobRemoved")
        .await
        .map_err(|e| SpawnError::Dbus(e.to_string()))?;

    let job_path: zbus::zvariant::OwnedObjectPath = manager
        .call("StartUnit", &(target.as_str(), "replace"))
        .await
        .map_err(|e| SpawnError::Dbus(e.to_string()))?;

    let result = tokio::time::timeout(START_UNIT_TIMEOUT, async {
        loop {
            let msg = job_removed.next().await.ok_or_else(|| {
                SpawnError::Dbus("JobRemoved signal stream closed before job completed".to_string())
            })?;
            let (_id, removed_job, _unit, result): (u32, zbus::zvariant::OwnedObjectPath, String, String) =
                msg.body()
                    .deserialize()
                    .map_err(|e| SpawnError::Dbus(e.to_string()))?;
            if removed_job == job_path {
                return Ok::<String, SpawnError>(result);
            }
        }
    })
    .await
    .map_err(|_| SpawnError::Dbus(format!("timed out waiting for {target} start job to finish")))??;

    if result != "done" {
        return Err(SpawnError::UnitStartFailed {
            unit: target,
            result,
        });
    }

    let unit_path: zbus::zvariant::OwnedObjectPath = manager
        .call("GetUnit", &(target.as_str(),))
        .await
        .map_err(|e| SpawnError::Dbus(e.to_string()))?;

    let service_proxy = zbus::Proxy::new(
        &conn,
        "org.freedesktop.systemd1",
        unit_path.as_ref(),
        "org.freedesktop.systemd1.Service",
    )
    .await
    .map_err(|e| SpawnError::Dbus(e.to_string()))?;

    // `MainPID` is documented as `u` (u32) but some systemd versions have
    // been observed exporting it as `t` (u64); try both rather than assume,
    // mirroring the reference implementation's type switch.
    if let Ok(pid) = service_proxy.get_property::<u32>("MainPID").await {
        return Ok(pid);
    }
    match service_proxy.get_property::<u64>("MainPID").await {
        Ok(pid) => u32::try_from(pid).map_err(|_| SpawnError::InvalidMainPidType {
            unit: target.clone(),
            ty: "u64 out of u32 range".to_string(),
        }),
        Err(e) => Err(SpawnError::InvalidMainPidType {
            unit: target,
            ty: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_without_socket_env_is_a_noop() {
        // SAFETY: test-local env mutation; no other test in this module
        // reads NOTIFY_SOCKET concurrently.
        unsafe {
            std::env::remove_var("NOTIFY_SOCKET");
        }
        assert!(notify("READY=1").is_ok());
        assert!(!detected());
    }

    #[test]
    fn watchdog_interval_none_without_env() {
        // SAFETY: see above.
        unsafe {
            std::env::remove_var("NOTIFY_SOCKET");
            std::env::remove_var("WATCHDOG_USEC");
        }
        assert_eq!(watchdog_interval_usec(), None);
    }
}
