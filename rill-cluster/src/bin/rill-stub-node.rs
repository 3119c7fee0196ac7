//! Stand-in node process for orchestration tests.
//!
//! Binds the given port and accepts (and immediately drops) connections
//! until interrupted. Startup delay, early exit, and outright failure can be
//! requested to exercise the orchestrator's readiness and teardown paths.
//!
//! ```bash
//! rill-stub-node --role broker --host 127.0.0.1 --port 6570 --startup-delay-ms 200
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Stand-in cluster node.
#[derive(Parser, Debug)]
#[command(name = "rill-stub-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Role name, used only in log output.
    #[arg(long, default_value = "broker")]
    role: String,

    /// Host to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind.
    #[arg(long)]
    port: u16,

    /// Data directory; created if missing.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Address of the coordination node, logged at startup.
    #[arg(long)]
    coordination: Option<String>,

    /// Sleep this long before binding.
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Exit on its own after this long.
    #[arg(long)]
    exit_after_ms: Option<u64>,

    /// Exit with an error instead of starting.
    #[arg(long)]
    fail: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_ansi(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(role = %args.role, port = args.port, coordination = ?args.coordination, "node starting");
    if args.fail {
        error!(role = %args.role, "startup failure requested");
        std::process::exit(1);
    }
    if let Some(dir) = &args.data_dir {
        std::fs::create_dir_all(dir)?;
    }

    tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(role = %args.role, %addr, "node ready");

    let exit_after = async {
        match args.exit_after_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(exit_after);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                if let Ok((_stream, peer)) = accepted {
                    info!(%peer, "connection accepted");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(role = %args.role, "interrupted, shutting down");
                break;
            }
            () = &mut exit_after => {
                info!(role = %args.role, "exit requested");
                break;
            }
        }
    }
    Ok(())
}
