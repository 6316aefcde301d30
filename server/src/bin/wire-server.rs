//! Diagnostic tool for the wire-protocol engines.

use clap::{Parser, Subcommand};
use server::config::Config;
use server::{decode, logging, metrics};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wire-server")]
#[command(about = "Inspect HTTP/1.1 and HTTP/2 client byte streams")]
struct Args {
    /// Path to configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a captured client-to-server byte stream and log every event
    Decode {
        /// File holding the raw bytes
        file: PathBuf,

        /// Print driver metrics after decoding
        #[arg(long)]
        metrics: bool,
    },
}

fn main() {
    let args = Args::parse();

    if args.print_config {
        print!("{}", Config::default_toml());
        return;
    }

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    match args.command {
        Some(Command::Decode { file, metrics }) => {
            if let Err(e) = run_decode(&config, &file, metrics) {
                tracing::error!(error = %e, "decode failed");
                std::process::exit(1);
            }
        }
        None => {
            eprintln!("No command given. Use `decode <file>` or --print-config");
            std::process::exit(2);
        }
    }
}

fn run_decode(
    config: &Config,
    file: &PathBuf,
    show_metrics: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(file)?;
    let (decoded, result) = decode::decode(&data, config);
    match decoded.protocol {
        Some(protocol) => tracing::info!(
            protocol = protocol.as_str(),
            events = decoded.events.len(),
            "capture decoded"
        ),
        None => tracing::warn!("capture too short to detect a protocol"),
    }
    if show_metrics {
        print!("{}", metrics::render());
    }
    result?;
    Ok(())
}
