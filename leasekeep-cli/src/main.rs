mod handlers;
mod server;

#[cfg(test)]
mod cli_test;

use std::time::Duration;

use clap::builder::RangedU64ValueParser;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use leasekeep_core::config::{KeySource, LeaseConfig};
use leasekeep_core::scheduler::ReclaimBackoff;

#[derive(Parser)]
#[command(
    name = "leasekeep",
    about = "leasekeep: lease locks over named resources",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the leasekeep HTTP server
    Serve(ServeOptions),

    /// Print resources and reclaim queue state of a storage backend as JSON
    Status {
        /// Storage backend: "memory" or "sqlite:<path>"
        #[arg(long, default_value = "memory", env = "LEASEKEEP_STORAGE")]
        storage: String,
    },

    /// Print version information
    Version,
}

#[derive(Args, Debug, Clone)]
pub struct ServeOptions {
    /// Port to listen on
    #[arg(short, long, default_value = "3100")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Storage backend: "memory" or "sqlite:<path>"
    #[arg(long, default_value = "memory", env = "LEASEKEEP_STORAGE")]
    pub storage: String,

    /// Resources created free at startup when missing
    #[arg(long = "resource", env = "LEASEKEEP_RESOURCES", value_delimiter = ',')]
    pub resources: Vec<String>,

    /// Who picks lease keys: "client" or "server"
    #[arg(long, default_value = "client", env = "LEASEKEEP_KEY_SOURCE")]
    pub key_source: KeySource,

    /// Exact key length
    #[arg(long, default_value = "10", value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub key_length: usize,

    /// Wait granted to an acquire that finds the resource held, in ms
    #[arg(long, default_value = "5000")]
    pub contention_wait_ms: u64,

    /// Interval between reclaim sweeps, in ms
    #[arg(long, default_value = "250", value_parser = clap::value_parser!(u64).range(1..))]
    pub reclaim_poll_ms: u64,

    /// Failed attempts before a reclaim is moved to the dead letters
    #[arg(long, default_value = "5", value_parser = clap::value_parser!(u32).range(1..))]
    pub reclaim_max_attempts: u32,

    /// Requests served concurrently
    #[arg(long, default_value = "256", value_parser = RangedU64ValueParser::<usize>::new().range(1..))]
    pub max_in_flight: usize,
}

impl ServeOptions {
    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            key_source: self.key_source,
            key_length: self.key_length,
            contention_wait: Duration::from_millis(self.contention_wait_ms),
            reclaim_backoff: ReclaimBackoff {
                max_attempts: self.reclaim_max_attempts,
                ..ReclaimBackoff::default()
            },
            ..LeaseConfig::default()
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(opts) => {
            if let Err(e) = server::run(&opts).await {
                tracing::error!("Server error: {}", e);
                std::process::exit(1);
            }
        }
        Commands::Status { storage } => match server::status(&storage) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Version => {
            println!("leasekeep {}", env!("CARGO_PKG_VERSION"));
            println!("Lease lock service for named resources");
        }
    }
}
