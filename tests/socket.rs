// End-to-end tests driving the command server over a real Unix socket.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use knithost::config::Config;
use knithost::hardware::mock::MockSolenoidSink;
use knithost::knit::KnitEngine;
use knithost::server::{self, ServerContext};
use knithost::sled::SledTracker;

struct TestServer {
    _dir: tempfile::TempDir,
    shutdown: broadcast::Sender<()>,
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

async fn start_server(no_hardware: bool) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("knithost.sock");

    let config = Config::default();
    let sink = Arc::new(MockSolenoidSink::new());
    let engine = Arc::new(KnitEngine::new(config.machine.clone(), sink));
    let tracker = Arc::new(SledTracker::new(&config.machine, engine.clone()));
    let ctx = Arc::new(ServerContext::new(
        engine,
        tracker,
        config.server.max_bindata_bytes,
        no_hardware,
        false,
    ));

    let listener = UnixListener::bind(&socket_path).unwrap();
    let (shutdown, _) = broadcast::channel(1);
    tokio::spawn(server::run(listener, ctx, shutdown.subscribe()));

    let stream = UnixStream::connect(&socket_path).await.unwrap();
    let (read_half, writer) = stream.into_split();
    TestServer {
        _dir: dir,
        shutdown,
        reader: BufReader::new(read_half),
        writer,
    }
}

impl TestServer {
    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> serde_json::Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn command(&mut self, line: &str) -> serde_json::Value {
        self.send(line).await;
        self.recv().await
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// A 10x4 all-black bitmap: "P4" header plus 2 packed bytes per row.
fn solid_pnm() -> Vec<u8> {
    let mut data = b"P4\n10 4\n".to_vec();
    data.extend_from_slice(&[0xff; 8]);
    data
}

async fn send_pattern(server: &mut TestServer, payload: &[u8]) -> serde_json::Value {
    server
        .send(&format!("setpattern 0 0 off {}", payload.len()))
        .await;
    server.writer.write_all(payload).await.unwrap();
    server.writer.flush().await.unwrap();
    server.recv().await
}

#[tokio::test]
async fn status_reports_initial_state() {
    let mut server = start_server(true).await;
    let status = server.command("status").await;
    assert_eq!(status["msg_type"], "status");
    assert_eq!(status["knitting_mode"], false);
    assert_eq!(status["carriage_position_valid"], false);
    assert_eq!(status["repeat_mode"], "oneshot");
    assert_eq!(status["pattern_width"], 0);
}

#[tokio::test]
async fn setpattern_centers_and_status_reflects_it() {
    let mut server = start_server(true).await;
    let reply = send_pattern(&mut server, &solid_pnm()).await;
    assert_eq!(reply["msg_type"], "ok", "reply: {reply}");

    let status = server.command("status").await;
    assert_eq!(status["pattern_width"], 10);
    assert_eq!(status["pattern_height"], 4);
    assert_eq!(status["pattern_offset"], 95);
    assert_eq!(status["pattern_row"], 0);
}

#[tokio::test]
async fn knitting_lifecycle_over_the_socket() {
    let mut server = start_server(true).await;
    send_pattern(&mut server, &solid_pnm()).await;

    // No valid carriage position yet: cannot start.
    let reply = server.command("setknitmode on").await;
    assert_eq!(reply["msg_type"], "error");

    // Parking inside the pattern span is ambiguous.
    server.command("hwmock setpos 100").await;
    let reply = server.command("setknitmode on").await;
    assert_eq!(reply["msg_type"], "error");
    assert_eq!(server.command("status").await["knitting_mode"], false);

    // Parked left of the pattern the direction is known.
    server.command("hwmock setpos -20").await;
    let reply = server.command("setknitmode on").await;
    assert_eq!(reply["msg_type"], "ok");

    // A sweep past the right bound plus margin advances the row.
    server.command("hwmock setpos 220").await;
    let status = server.command("status").await;
    assert_eq!(status["knitting_mode"], true);
    assert_eq!(status["pattern_row"], 1);
}

#[tokio::test]
async fn getpattern_returns_length_prefixed_image() {
    let mut server = start_server(true).await;
    let reply = server.command("getpattern off").await;
    assert_eq!(reply["msg_type"], "error");

    send_pattern(&mut server, &solid_pnm()).await;
    let header = server.command("getpattern off").await;
    assert_eq!(header["msg_type"], "bindata");
    let length = header["bindata_length"].as_u64().unwrap() as usize;
    assert!(length > 0);

    let mut payload = vec![0u8; length];
    server.reader.read_exact(&mut payload).await.unwrap();
    assert!(payload.starts_with(b"P6"));
}

#[tokio::test]
async fn unknown_command_keeps_connection_usable() {
    let mut server = start_server(true).await;
    let reply = server.command("reboot").await;
    assert_eq!(reply["msg_type"], "error");
    // The connection survives an unknown command.
    assert_eq!(server.command("status").await["msg_type"], "status");
}

#[tokio::test]
async fn wrong_argument_count_severs_connection() {
    let mut server = start_server(true).await;
    let reply = server.command("status extra").await;
    assert_eq!(reply["msg_type"], "error");

    let mut line = String::new();
    let read = server.reader.read_line(&mut line).await.unwrap();
    assert_eq!(read, 0, "server should have closed the connection");
}

#[tokio::test]
async fn hwmock_is_rejected_with_real_hardware() {
    let mut server = start_server(false).await;
    let reply = server.command("hwmock setpos 10").await;
    assert_eq!(reply["msg_type"], "error");
}

#[tokio::test]
async fn statuswait_returns_after_timeout() {
    let mut server = start_server(true).await;
    let status = server.command("statuswait 50").await;
    assert_eq!(status["msg_type"], "status");
}

#[tokio::test]
async fn oversized_payload_is_fatal() {
    let mut server = start_server(true).await;
    let reply = server
        .command(&format!("setpattern 0 0 off {}", 64 * 1024 * 1024))
        .await;
    assert_eq!(reply["msg_type"], "error");

    let mut line = String::new();
    let read = server.reader.read_line(&mut line).await.unwrap();
    assert_eq!(read, 0);
}
