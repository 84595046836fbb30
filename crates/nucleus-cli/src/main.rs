mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::config::ConfigSubcommand;
use nucleus_core::config::Settings;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::filter::LevelFilter;

#[derive(Parser)]
#[command(
    name = "nucleus-config",
    about = "Configure Nucleus servers and reverse proxies from stack lifecycle events",
    version,
    propagate_version = true
)]
struct Cli {
    /// Settings file (YAML). Environment variables override it.
    #[arg(long, global = true, env = "NUCLEUS_CONFIG")]
    config: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one lifecycle event and print the response body
    Handle {
        /// Event file, or `-` for stdin
        #[arg(long, default_value = "-")]
        event: PathBuf,
    },

    /// Render the script an event would dispatch, with credentials redacted.
    /// Makes no cloud calls.
    Render {
        /// Event file, or `-` for stdin
        #[arg(long, default_value = "-")]
        event: PathBuf,
    },

    /// Inspect and validate settings
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(cli.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: failed to load settings: {e}");
            std::process::exit(1);
        }
    };

    let level = LevelFilter::from_str(&settings.log_filter()).unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Handle { event } => cmd::handle::run(&settings, &event, cli.json),
        Commands::Render { event } => cmd::render::run(&event, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&settings, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
