//! tftpd - concurrent TFTP server daemon
//!
//! Serves RFC 1350 read and write requests on port 69 until terminated.

use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use tftp::{MAX_SESSIONS, ServerConfig, start_server};
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_DIR: &str = "/tmp";
const DEFAULT_TRACE_LEVEL: i32 = 3;

#[derive(FromArgs, Debug)]
/// Concurrent TFTP server.
///
/// Usage: tftpd [GET_DIR] [PUT_DIR] [max_concurrent_sessions] [trace_level]
struct Cli {
    /// directory files are read from on GET (default /tmp)
    #[argh(positional, default = "PathBuf::from(DEFAULT_DIR)")]
    get_dir: PathBuf,

    /// directory files are written to on PUT (default /tmp)
    #[argh(positional, default = "PathBuf::from(DEFAULT_DIR)")]
    put_dir: PathBuf,

    /// maximum concurrent sessions, 1 to 16 (default 16)
    #[argh(positional, default = "MAX_SESSIONS as i32")]
    max_concurrent_sessions: i32,

    /// trace level, 0 disabled through 4 pedantic (default 3)
    #[argh(positional, default = "DEFAULT_TRACE_LEVEL")]
    trace_level: i32,
}

fn level_filter(trace_level: i32) -> LevelFilter {
    match trace_level {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let trace_level = cli.trace_level.clamp(0, 4);
    tracing_subscriber::fmt().with_max_level(level_filter(trace_level)).init();

    let max_sessions = if (1..=MAX_SESSIONS as i32).contains(&cli.max_concurrent_sessions) {
        cli.max_concurrent_sessions as usize
    } else {
        tracing::warn!(
            "max_concurrent_sessions {} out of range, default value is used",
            cli.max_concurrent_sessions
        );
        MAX_SESSIONS
    };

    tracing::info!("GET_DIR={}", cli.get_dir.display());
    tracing::info!("PUT_DIR={}", cli.put_dir.display());
    tracing::info!("max_concurrent_sessions={}", max_sessions);
    tracing::info!("trace_level={}", trace_level);

    let mut config = ServerConfig::new(&cli.get_dir, &cli.put_dir);
    config.max_sessions = max_sessions;

    let handle = start_server(config).await.context("failed to start tftp server")?;
    handle.join().await;

    Ok(())
}
