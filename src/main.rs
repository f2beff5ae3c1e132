// src/main.rs - Daemon entry point: wiring, socket setup, shutdown
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

use knithost::config::Config;
use knithost::debounce::Debouncer;
use knithost::hardware::mock::{MockEdgeSource, MockSolenoidSink};
use knithost::hardware::EdgeSource;
use knithost::knit::KnitEngine;
use knithost::server::{self, ServerContext};
use knithost::sled::SledTracker;

/// How long the edge reader blocks before re-checking for shutdown.
const EDGE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "knithost", about = "Knitting machine control daemon", version)]
struct Opts {
    /// Path of the Unix command socket to listen on.
    #[arg(short = 's', long, default_value = "knithost.sock")]
    socket: PathBuf,

    /// Optional TOML configuration file; defaults apply without one.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Run without real hardware; positions come from `hwmock` commands.
    #[arg(long)]
    no_hardware: bool,

    /// Remove a stale socket file before binding.
    #[arg(short = 'f', long)]
    force: bool,

    /// Exit after the first client disconnects (test harness mode).
    #[arg(long)]
    quit_after_single_connection: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("knithost={default_level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let opts = Opts::parse();
    init_logging(opts.verbose);

    let config = Config::load(opts.config.as_deref()).map_err(|err| {
        tracing::error!(error = %err, "failed to load configuration");
        err
    })?;

    if !opts.no_hardware {
        tracing::error!("no real hardware backend is available; run with --no-hardware");
        return Err("real hardware support is not built in".into());
    }

    let sink = Arc::new(MockSolenoidSink::new());
    let (edge_source, _injector) = MockEdgeSource::new();
    let edge_source = Arc::new(edge_source);

    let engine = Arc::new(KnitEngine::new(config.machine.clone(), sink));
    let tracker = Arc::new(SledTracker::new(&config.machine, engine.clone()));
    let debouncer = Arc::new(Debouncer::new(&config.debounce));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let debounce_task = debouncer
        .clone()
        .spawn(tracker.clone(), shutdown_tx.subscribe());

    // Raw edges flow from the hardware into the debouncer.
    let reader_task = {
        let debouncer = debouncer.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    edge = edge_source.wait_edge(EDGE_WAIT_TIMEOUT) => {
                        if let Some(edge) = edge {
                            debouncer.input(edge.line, edge.value, edge.at);
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    };

    if opts.force && opts.socket.exists() {
        std::fs::remove_file(&opts.socket)?;
    }
    let listener = UnixListener::bind(&opts.socket).map_err(|err| {
        tracing::error!(socket = %opts.socket.display(), error = %err, "cannot bind socket");
        err
    })?;
    tracing::info!(socket = %opts.socket.display(), "listening for clients");

    let ctx = Arc::new(ServerContext::new(
        engine,
        tracker,
        config.server.max_bindata_bytes,
        opts.no_hardware,
        opts.quit_after_single_connection,
    ));

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                let _ = shutdown_tx.send(());
            }
        });
    }

    server::run(listener, ctx, shutdown_tx.subscribe()).await;

    let _ = shutdown_tx.send(());
    let _ = reader_task.await;
    let _ = debounce_task.await;
    let _ = std::fs::remove_file(&opts.socket);
    tracing::info!("shut down cleanly");
    Ok(())
}
