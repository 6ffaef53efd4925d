//! Reference receiver binary: dials the broker's generated SCM address,
//! reads handed-off TCP connection fds in a loop, and greets each one
//! periodically until it closes.
//!
//! Spawned by the broker in direct mode as `receiver <addr>`; under a
//! service manager the same binary is the unit's `ExecStart`.

use std::os::fd::{FromRawFd, IntoRawFd};

use connbroker::SockAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let addr_arg = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("usage: receiver <addr>"))?;
    let addr = SockAddr::from_raw(addr_arg);

    let conn = connbroker::ScmConnection::dial(&addr).await?;

    loop {
        let fd = match conn.recv_fd().await {
            Ok(fd) => fd,
            Err(e) => {
                log::info!("SCM transport closed: {e}");
                break;
            }
        };

        tokio::spawn(async move {
            // SAFETY: `fd` was just received as sole owner via SCM_RIGHTS.
            let std_stream = unsafe { std::net::TcpStream::from_raw_fd(fd.into_raw_fd()) };
            std_stream.set_nonblocking(true).ok();
            let Ok(stream) = TcpStream::from_std(std_stream) else {
                return;
            };
            greet(stream).await;
        });
    }

    Ok(())
}

async fn greet(mut stream: TcpStream) {
    for _ in 0..1000 {
        if stream.write_all(b"Hello from connbroker!\n").await.is_err() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
    let _ = stream.shutdown().await;
}
