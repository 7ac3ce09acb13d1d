use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chanpool::cli;

#[derive(Parser)]
#[command(name = "chanpool")]
#[command(version, about = "Connection pool balancer with affinity routing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a configuration file and print it with defaults applied
    Validate {
        /// YAML or JSON config file
        config: String,
    },

    /// Run the balancer against a simulated transport and print statistics
    Simulate {
        /// Config file path (environment variables when omitted)
        #[arg(long)]
        config: Option<String>,

        /// Total number of calls
        #[arg(long, default_value = "1000")]
        calls: usize,

        /// Number of concurrent callers
        #[arg(long, default_value = "16")]
        concurrency: usize,

        /// Fraction of calls that end with deadline exceeded
        #[arg(long, default_value = "0.0")]
        deadline_rate: f64,

        /// Milliseconds a connection takes to become READY
        #[arg(long, default_value = "20")]
        connect_delay_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Validate { config } => cli::commands::cmd_validate(&config),
        Commands::Simulate {
            config,
            calls,
            concurrency,
            deadline_rate,
            connect_delay_ms,
        } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(cli::commands::cmd_simulate(
                config.as_deref(),
                calls,
                concurrency,
                deadline_rate,
                connect_delay_ms,
            ))
        }
    }
}
