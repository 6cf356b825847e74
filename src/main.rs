//! Crypto guard - main entry point
//!
//! This binary provides three subcommands:
//! - run: Run the protection loop against a paper book, fed by JSON ticks on stdin
//! - replay: Replay recorded reference prices through the regime detector
//! - status: Show persisted trade limiter state

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "crypto-guard")]
#[command(about = "Market protection and adaptive exits for paper crypto trading", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the protection loop
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/guard.json")]
        config: String,

        /// Paper book with open positions and entry candidates
        #[arg(short, long, default_value = "state/paper_book.json")]
        book: String,

        /// Cycle interval in seconds (overrides config file)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Replay a reference price CSV and report regime transitions
    Replay {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/guard.json")]
        config: String,

        /// CSV with timestamp/datetime and price/close columns
        #[arg(short, long)]
        prices: String,

        /// Minutes between regime evaluations
        #[arg(long, default_value = "1")]
        step_minutes: u32,
    },

    /// Show trade limiter state
    Status {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/guard.json")]
        config: String,

        /// Show the trade permission for one symbol
        #[arg(short, long)]
        symbol: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    // Create logs directory
    std::fs::create_dir_all("logs")?;

    // Create log file with naming pattern: {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Set log level - filter out noisy external crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    if file_only {
        // JSON on stdout stays clean for piping
        let file_appender = tracing_appender::rolling::never("logs", &log_filename);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        let file_appender = tracing_appender::rolling::never("logs", &log_filename);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Run { .. } => ("run", false),
        Commands::Replay { .. } => ("replay", true),
        Commands::Status { .. } => ("status", true),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Run {
            config,
            book,
            interval,
        } => commands::run::run(config, book, interval),

        Commands::Replay {
            config,
            prices,
            step_minutes,
        } => commands::replay::run(config, prices, step_minutes),

        Commands::Status { config, symbol } => commands::status::run(config, symbol),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["crypto-guard", "replay", "--prices", "btc.csv"]).unwrap();
        match cli.command {
            Commands::Replay {
                config,
                prices,
                step_minutes,
            } => {
                assert_eq!(config, "configs/guard.json");
                assert_eq!(prices, "btc.csv");
                assert_eq!(step_minutes, 1);
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::try_parse_from(["crypto-guard", "-v", "run", "--interval", "5"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Run {
                interval: Some(5),
                ..
            }
        ));
    }

    #[test]
    fn test_file_only_logging_initializes() {
        assert!(setup_logging(false, "test", true).is_ok());
    }
}
