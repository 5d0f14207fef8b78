//! clamd client CLI.
//!
//! Pings a ClamAV daemon or streams a file to it for scanning.

use anyhow::{Context, Result};
use clamd_client::{ClamdClient, Config, ScanVerdict};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Client for the ClamAV daemon.
#[derive(Parser, Debug)]
#[command(name = "clamd-client")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file. Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print example configuration and exit.
    #[arg(long)]
    example_config: bool,

    /// Validate configuration and exit.
    #[arg(long)]
    validate: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that clamd answers PING with PONG.
    Ping,
    /// Print the clamd version string.
    Version,
    /// Stream a file to clamd for scanning. Use `-` for stdin.
    Scan {
        /// File to scan.
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    // Print example config if requested
    if args.example_config {
        println!("{}", Config::example());
        return Ok(ExitCode::SUCCESS);
    }

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };

    // Validate only if requested
    if args.validate {
        info!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    let client = ClamdClient::new(&config.clamd)?;

    let Some(command) = args.command else {
        anyhow::bail!("no command given, expected one of: ping, version, scan");
    };

    match command {
        Command::Ping => {
            if client.ping().await {
                println!("PONG");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("clamd not available at {}", client.endpoint());
                Ok(ExitCode::from(1))
            }
        }
        Command::Version => {
            let version = client.version().await?;
            println!("{}", version);
            Ok(ExitCode::SUCCESS)
        }
        Command::Scan { path } => {
            info!(
                input = %path.display(),
                endpoint = %client.endpoint(),
                "Scanning"
            );

            let verdict = if path.as_os_str() == "-" {
                let mut stdin = tokio::io::stdin();
                client.scan_stream(&mut stdin).await?
            } else {
                let mut file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?;
                client.scan_stream(&mut file).await?
            };

            println!("{}: {}", path.display(), verdict);
            Ok(exit_code(verdict))
        }
    }
}

fn exit_code(verdict: ScanVerdict) -> ExitCode {
    ExitCode::from(exit_status(verdict))
}

/// 0 when clean, 1 when infected, 2 when the scan failed.
fn exit_status(verdict: ScanVerdict) -> u8 {
    if verdict.is_clean() {
        0
    } else if verdict.is_infected() {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(ScanVerdict::Clean), 0);
        assert_eq!(exit_status(ScanVerdict::Infected), 1);
        assert_eq!(exit_status(ScanVerdict::Failed), 2);
    }

    #[test]
    fn test_args_parse_scan_stdin() {
        let args = Args::parse_from(["clamd-client", "scan", "-"]);
        match args.command {
            Some(Command::Scan { path }) => assert_eq!(path, PathBuf::from("-")),
            other => panic!("Expected scan command, got {:?}", other),
        }
    }
}
