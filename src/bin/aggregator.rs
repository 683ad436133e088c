//! Aggregator server binary: hosts per-source collectors and serves
//! `/feed`, `/conf`, `/e`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use profrelay::aggregator::{AggregatorServer, AggregatorServerConfig};

/// profrelay aggregator: receives profiling feeds from remote processes and
/// serves their runtime configuration.
#[derive(Parser)]
#[command(name = "profrelay-aggregator")]
#[command(about = "HTTP aggregation endpoint for profrelay feeds")]
struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the HTTP server to.
    #[arg(long, default_value_t = 9666)]
    port: u16,

    /// Directory `<sourceKey>/<bucket>.log` files are written under.
    #[arg(long, default_value = "__pflogs")]
    log_path: PathBuf,

    /// Directory rotated logs are zipped into.
    #[arg(long, default_value = "__pfarchive")]
    archive_path: PathBuf,

    /// Size, in bytes, at which a source's current logs are rotated into an
    /// archive. `0` disables archiving.
    #[arg(long, default_value_t = 0)]
    max_log_size_bytes: u64,

    /// Size, in bytes, the archive directory is trimmed down to. `0` keeps
    /// only the newest archive.
    #[arg(long, default_value_t = 0)]
    max_archive_size_bytes: u64,

    /// Check for rotation every Nth log request. Ignored when archiving is
    /// disabled.
    #[arg(long, default_value_t = 100)]
    log_request_archiving_modulo: u64,

    /// Sentinel file whose presence enables the aggregator.
    #[arg(long, default_value = "__pfenable")]
    command_file_path: PathBuf,

    /// JSON file of configuration overrides.
    #[arg(long, default_value = "__pfconfig")]
    configuration_file_path: PathBuf,

    /// Minimum interval, in milliseconds, between configuration refreshes.
    #[arg(long, default_value_t = 5000)]
    refresh_silence_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> profrelay::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let bind_address: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .map_err(|e| profrelay::Error::ConfigParse(format!("invalid host/port: {e}")))?;

    let config = AggregatorServerConfig {
        bind_address,
        log_path: cli.log_path,
        archive_path: cli.archive_path,
        max_log_size_bytes: cli.max_log_size_bytes,
        max_archive_size_bytes: cli.max_archive_size_bytes,
        log_request_archiving_modulo: cli.log_request_archiving_modulo,
        flush_delay: Duration::from_millis(0),
        command_file_path: cli.command_file_path,
        configuration_file_path: cli.configuration_file_path,
        refresh_silence_timeout: Duration::from_millis(cli.refresh_silence_timeout_ms),
    };

    AggregatorServer::new(config).serve().await
}
