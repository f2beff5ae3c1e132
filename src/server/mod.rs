// src/server/mod.rs - Unix-socket command server, one worker task per client
pub mod command;

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::knit::{KnitEngine, StatusSnapshot};
use crate::pnm;
use crate::server::command::{Command, CommandError, EditOp};
use crate::sled::SledTracker;
use crate::sync::CompletionCounter;

/// Everything a connection worker needs, shared across all workers.
pub struct ServerContext {
    pub engine: Arc<KnitEngine>,
    pub tracker: Arc<SledTracker>,
    pub workers: Arc<CompletionCounter>,
    pub max_bindata_bytes: usize,
    pub no_hardware: bool,
    pub quit_after_single_connection: bool,
    next_client_id: AtomicU64,
}

impl ServerContext {
    pub fn new(
        engine: Arc<KnitEngine>,
        tracker: Arc<SledTracker>,
        max_bindata_bytes: usize,
        no_hardware: bool,
        quit_after_single_connection: bool,
    ) -> Self {
        Self {
            engine,
            tracker,
            workers: Arc::new(CompletionCounter::new()),
            max_bindata_bytes,
            no_hardware,
            quit_after_single_connection,
            next_client_id: AtomicU64::new(0),
        }
    }
}

/// Result of one executed command, deciding whether the connection
/// stays open. Malformed framing severs; ordinary command failures
/// only produce an error reply.
enum Outcome {
    Continue,
    Sever,
}

/// Accepts clients until shutdown, then waits for in-flight workers to
/// finish before returning.
pub async fn run(
    listener: UnixListener,
    ctx: Arc<ServerContext>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => stream,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            },
            _ = shutdown.recv() => break,
        };

        let client_id = ctx.next_client_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(client_id, "client connected");
        ctx.workers.increment();
        let worker_ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_client(stream, &worker_ctx).await {
                tracing::debug!(client_id, error = %err, "connection error");
            }
            tracing::debug!(client_id, "client disconnected");
            worker_ctx.workers.decrement();
        });

        if ctx.quit_after_single_connection {
            break;
        }
    }

    ctx.workers.wait_for(0).await;
}

async fn serve_client(stream: UnixStream, ctx: &ServerContext) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let cmd = match Command::parse(&line) {
            Ok(cmd) => cmd,
            Err(err) => {
                send_error(&mut writer, &err.to_string()).await?;
                // Wrong argument shape is malformed framing.
                if matches!(err, CommandError::Usage(_)) {
                    return Ok(());
                }
                continue;
            }
        };
        match execute(cmd, &mut reader, &mut writer, ctx).await? {
            Outcome::Continue => {}
            Outcome::Sever => return Ok(()),
        }
    }
}

async fn execute(
    cmd: Command,
    reader: &mut BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    ctx: &ServerContext,
) -> std::io::Result<Outcome> {
    match cmd {
        Command::Status => {
            send_status(writer, ctx).await?;
        }
        Command::StatusWait { timeout_ms } => {
            ctx.engine
                .wait_for_change(Duration::from_millis(timeout_ms))
                .await;
            send_status(writer, ctx).await?;
        }
        Command::SetPattern {
            offset_x,
            offset_y,
            merge,
            byte_len,
        } => {
            if byte_len > ctx.max_bindata_bytes {
                send_error(writer, "binary payload too large").await?;
                return Ok(Outcome::Sever);
            }
            let mut payload = vec![0u8; byte_len];
            if reader.read_exact(&mut payload).await.is_err() {
                // Short payload leaves the stream mid-frame.
                return Ok(Outcome::Sever);
            }
            match pnm::decode(&payload, offset_x, offset_y) {
                Ok(pattern) => match ctx.engine.set_pattern(pattern, merge).await {
                    Ok(()) => send_ok(writer, "pattern set").await?,
                    Err(err) => send_error(writer, &err.to_string()).await?,
                },
                Err(err) => send_error(writer, &format!("cannot decode pattern: {err}")).await?,
            }
        }
        Command::GetPattern { rawdata } => match ctx.engine.pattern_snapshot().await {
            Some(pattern) => {
                let encoded = pnm::encode(&pattern, rawdata);
                let header = json!({
                    "msg_type": "bindata",
                    "bindata_length": encoded.len(),
                });
                send_json(writer, &header).await?;
                writer.write_all(&encoded).await?;
                writer.flush().await?;
            }
            None => send_error(writer, "no pattern is set").await?,
        },
        Command::EditPattern(op) => {
            let result = match op {
                EditOp::Clear => {
                    ctx.engine.clear_pattern().await;
                    Ok(())
                }
                EditOp::Trim => ctx.engine.trim_pattern().await,
                EditOp::Center => ctx.engine.center_pattern().await,
            };
            match result {
                Ok(()) => send_ok(writer, "pattern edited").await?,
                Err(err) => send_error(writer, &err.to_string()).await?,
            }
        }
        Command::SetRow { row } => match ctx.engine.set_row(row).await {
            Ok(()) => send_ok(writer, &format!("row set to {row}")).await?,
            Err(err) => send_error(writer, &err.to_string()).await?,
        },
        Command::SetOffset { offset } => match ctx.engine.set_offset(offset).await {
            Ok(offset) => send_ok(writer, &format!("offset set to {offset}")).await?,
            Err(err) => send_error(writer, &err.to_string()).await?,
        },
        Command::SetKnitMode { on } => match ctx.engine.set_knit_mode(on).await {
            Ok(enabled) => {
                let text = if enabled { "knitting on" } else { "knitting off" };
                send_ok(writer, text).await?;
            }
            Err(err) => send_error(writer, &err.to_string()).await?,
        },
        Command::SetRepeatMode { mode } => {
            ctx.engine.set_repeat_mode(mode).await;
            send_ok(writer, &format!("repeat mode set to {}", mode.as_str())).await?;
        }
        Command::HwMock { position } => {
            if !ctx.no_hardware {
                send_error(writer, "hwmock is only available when real hardware is disabled")
                    .await?;
            } else {
                ctx.engine.mock_set_position(position).await;
                send_ok(writer, &format!("carriage position set to {position}")).await?;
            }
        }
    }
    Ok(Outcome::Continue)
}

async fn send_status(writer: &mut OwnedWriteHalf, ctx: &ServerContext) -> std::io::Result<()> {
    let status = ctx.engine.status().await;
    let value = status_json(&status, ctx.tracker.skipped_needles());
    send_json(writer, &value).await
}

fn status_json(status: &StatusSnapshot, skipped_needles: u32) -> serde_json::Value {
    json!({
        "msg_type": "status",
        "knitting_mode": status.knitting_mode,
        "repeat_mode": status.repeat_mode.as_str(),
        "carriage_position": status.carriage_position,
        "carriage_position_valid": status.carriage_position_valid,
        "even_rows_left_to_right": status.even_rows_left_to_right,
        "skipped_needles_count": skipped_needles,
        "pattern_row": status.pattern_row,
        "pattern_offset": status.pattern_offset,
        "pattern_min_x": status.pattern_min_x,
        "pattern_max_x": status.pattern_max_x,
        "pattern_min_y": status.pattern_min_y,
        "pattern_max_y": status.pattern_max_y,
        "pattern_width": status.pattern_width,
        "pattern_height": status.pattern_height,
    })
}

async fn send_ok(writer: &mut OwnedWriteHalf, message: &str) -> std::io::Result<()> {
    send_json(writer, &json!({ "msg_type": "ok", "message": message })).await
}

async fn send_error(writer: &mut OwnedWriteHalf, message: &str) -> std::io::Result<()> {
    send_json(writer, &json!({ "msg_type": "error", "message": message })).await
}

async fn send_json(writer: &mut OwnedWriteHalf, value: &serde_json::Value) -> std::io::Result<()> {
    let mut text = value.to_string();
    text.push('\n');
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}
