//! scrapegridd — the ScrapeGrid daemon.
//!
//! One binary, two roles:
//! - **allocator**: watches monitoring resources, generates scrape jobs,
//!   serves them over HTTP
//! - **collector**: polls an allocator and applies the jobs for its shard
//!
//! # Usage
//!
//! ```text
//! scrapegridd allocator --config /etc/scrapegrid/allocator.toml
//! scrapegridd collector --allocator-url http://allocator:8080 --shard 1 \
//!     --output /etc/prometheus/scrape.yaml
//! ```

mod allocator_mode;
mod collector_mode;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "scrapegridd", about = "ScrapeGrid daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the allocator (watches monitoring resources, serves scrape configs).
    Allocator {
        /// Path to allocator.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run the collector-side config sync client.
    Collector {
        /// Base URL of the allocator.
        #[arg(long, env = "ALLOCATOR_URL", default_value = "http://localhost:8080")]
        allocator_url: String,

        /// Identity reported to the allocator's target endpoints.
        #[arg(long, env = "COLLECTOR_ID", default_value = "")]
        collector_id: String,

        /// Shard number substituted into generated relabel rules.
        #[arg(long, env = "SHARD", default_value = "0")]
        shard: String,

        /// Poll interval in seconds.
        #[arg(long, default_value = "30")]
        sync_interval: u64,

        /// Where the applied scrape configuration is written.
        #[arg(long, default_value = "scrape_configs.yaml")]
        output: PathBuf,

        /// Allocator request timeout in seconds.
        #[arg(long, default_value = "10")]
        request_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Allocator { config } => allocator_mode::run_allocator(config).await,
        Command::Collector {
            allocator_url,
            collector_id,
            shard,
            sync_interval,
            output,
            request_timeout,
        } => {
            collector_mode::run_collector(collector_mode::CollectorArgs {
                allocator_url,
                collector_id,
                shard,
                sync_interval,
                output,
                request_timeout,
            })
            .await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,scrapegridd=debug,scrapegrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
