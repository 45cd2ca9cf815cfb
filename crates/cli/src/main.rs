mod commands;
mod loader;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Sieve streaming policy decision point.
#[derive(Parser)]
#[command(name = "sieve", version, about = "Sieve streaming policy decision point")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decide a subscription against a set of policy documents
    Decide {
        /// Policy document file, or a directory of *.json documents
        #[arg(long)]
        policies: PathBuf,
        /// Path to the authorization subscription JSON file
        #[arg(long)]
        subscription: PathBuf,
        /// PDP configuration file, or a directory holding pdp.json
        #[arg(long)]
        config: Option<PathBuf>,
        /// Give up if no decision arrives within this many milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },

    /// Load and validate policy documents
    Check {
        /// Policy document file, or a directory of *.json documents
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Decide {
            policies,
            subscription,
            config,
            timeout_ms,
        } => {
            commands::decide::cmd_decide(
                &policies,
                &subscription,
                config.as_deref(),
                timeout_ms,
                cli.output,
                cli.quiet,
            );
        }
        Commands::Check { path } => {
            commands::check::cmd_check(&path, cli.output, cli.quiet);
        }
    }
}

/// Logs go to stderr so stdout stays parseable. `RUST_LOG` overrides the
/// default `warn` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Report an error in the requested output format.
pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    match output {
        OutputFormat::Json => {
            let err = serde_json::json!({ "error": msg });
            eprintln!(
                "{}",
                serde_json::to_string_pretty(&err).unwrap_or_else(|_| msg.to_string())
            );
        }
        OutputFormat::Text => {
            if !quiet {
                eprintln!("{}", msg);
            }
        }
    }
}
