//! Shared helpers for integration tests: an in-process server on an
//! ephemeral port and packet-waiting utilities.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use procmux::config::{ProgramConfig, ServerSettings, SessionConfig};
use procmux::core::packet::Packet;
use procmux::{Client, Server};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<Server>,
    shutdown: CancellationToken,
    handle: JoinHandle<procmux::Result<()>>,
}

impl TestServer {
    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(WAIT, self.handle).await;
    }
}

/// Fast ticks so tests do not sit on the default 100ms interval.
pub fn session_config() -> SessionConfig {
    SessionConfig {
        tick_interval: Duration::from_millis(10),
        ..SessionConfig::default()
    }
}

pub fn settings(programs: Vec<ProgramConfig>) -> ServerSettings {
    let mut settings = ServerSettings::default();
    settings.server.address = "127.0.0.1:0".to_string();
    settings.session = session_config();
    settings.limiter.max_count = 1000;
    settings.console.sweep_interval = Duration::from_secs(60);
    settings.programs = programs;
    settings
}

/// A program running `command` through the exec loader.
pub fn exec_program(name: &str, command: &str) -> ProgramConfig {
    ProgramConfig {
        name: name.to_string(),
        path: std::env::temp_dir(),
        loader: "exec".to_string(),
        options: HashMap::from([("program".to_string(), command.to_string())]),
    }
}

pub async fn start(settings: ServerSettings) -> TestServer {
    let server = Arc::new(Server::new(settings).expect("valid settings"));
    let listener = server.bind().await.expect("bind");
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let handle = {
        let server = Arc::clone(&server);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { server.serve(listener, shutdown).await })
    };

    TestServer {
        addr,
        server,
        shutdown,
        handle,
    }
}

/// Connect and complete the handshake.
pub async fn connect(addr: SocketAddr) -> Client {
    let client = Client::connect(addr, session_config())
        .await
        .expect("connect");
    client.wait_connected(WAIT).await.expect("handshake");
    client
}

/// Wait for the first event matching `predicate`, skipping the rest.
pub async fn expect_packet<F>(client: &mut Client, predicate: F) -> Packet
where
    F: Fn(&Packet) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match client.next_event().await {
                Some(packet) if predicate(&packet) => return packet,
                Some(_) => continue,
                None => panic!("session closed while waiting for a packet"),
            }
        }
    })
    .await
    .expect("timed out waiting for packet")
}

/// Wait for the next event that is not console output.
pub async fn expect_reply(client: &mut Client) -> Packet {
    expect_packet(client, |p| !matches!(p, Packet::ConsoleMessages { .. })).await
}

/// Collect console lines until `count` have arrived.
pub async fn collect_lines(client: &mut Client, count: usize) -> Vec<String> {
    let mut lines = Vec::new();
    while lines.len() < count {
        match expect_packet(client, |p| matches!(p, Packet::ConsoleMessages { .. })).await {
            Packet::ConsoleMessages { lines: batch } => lines.extend(batch),
            _ => unreachable!(),
        }
    }
    lines
}

/// Poll `condition` until it holds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}
