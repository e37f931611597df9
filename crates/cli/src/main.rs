use clap::{Parser, Subcommand};

mod commands;
mod wiring;

use commands::{BackfillArgs, RunArgs};

#[derive(Parser)]
#[command(name = "candle-sync")]
#[command(about = "Real-time candle ingestion with gap reconciliation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream the configured subscriptions until Ctrl-C
    Run(RunArgs),
    /// Backfill one series over a time range through the versioned write path
    Backfill(BackfillArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Run(args) => args.log_file.as_deref(),
        Commands::Backfill(args) => args.log_file.as_deref(),
    };
    init_logging(log_file)?;

    match cli.command {
        Commands::Run(args) => commands::run_feed(args).await?,
        Commands::Backfill(args) => commands::run_backfill(args).await?,
    }

    Ok(())
}

fn init_logging(log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
