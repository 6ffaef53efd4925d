//! Integration tests driving the broker against the reference receiver
//! binary over real UNIX and TCP sockets. Privileged-port scenarios from
//! the concrete-scenario list are exercised on a high unprivileged port
//! instead, per the test-tooling design.

use std::time::Duration;

use connbroker::config::Config;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

fn receiver_bin() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_BIN_EXE_receiver"))
}

fn test_config(port: u16) -> Config {
    Config {
        systemd_enabled: false,
        receiver_unit: "unused".to_string(),
        receiver_path: Some(receiver_bin()),
        listen_port: port,
        allowed_peer_uids: Vec::new(),
        allowed_peer_gids: Vec::new(),
    }
}

/// Scenario 1: happy path. A client connecting to the broker's TCP port
/// is handed off to the spawned receiver and receives its greeting.
#[tokio::test]
async fn happy_path_client_receives_greeting() {
    let port = 19443;
    let config = test_config(port);

    tokio::spawn(connbroker::broker::run(config));
    let mut client = connect_with_retry(port).await;

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("read did not time out")
        .expect("read succeeded");

    assert!(n > 0, "expected a greeting from the receiver");
    assert!(String::from_utf8_lossy(&buf[..n]).contains("Hello"));
}

/// Scenario 6 (unit-level complement): a second client connecting after
/// the first still gets served, confirming the broker keeps accepting
/// while an earlier hand-off is still in flight.
#[tokio::test]
async fn multiple_clients_are_each_handed_off() {
    let port = 19444;
    let config = test_config(port);

    tokio::spawn(connbroker::broker::run(config));

    for i in 0..3 {
        let mut client = if i == 0 {
            connect_with_retry(port).await
        } else {
            TcpStream::connect(("127.0.0.1", port))
                .await
                .expect("connect to broker")
        };
        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("read did not time out")
            .expect("read succeeded");
        assert!(n > 0);
    }
}

/// Retries the connect itself (rather than probing with a throwaway
/// connection first) so the only connections the broker ever sees in this
/// test are ones we actually read a greeting from.
async fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("broker never opened port {port}");
}
