//! annoline - batch language-model annotation of sentence datasets
//!
//! Converts dataset sentences into symbolic expressions with a language
//! model and keeps every outcome in a resumable Parquet result store.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "annoline")]
#[command(about = "Batch language-model annotation of sentence datasets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "debug")]
    quiet: bool,

    /// Config file path (default: ./annoline.toml or ~/.config/annoline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Annotate a dataset split (resumes earlier runs)
    Run(Box<cmd::run::RunArgs>),
    /// Inspect and maintain the result store
    Store(cmd::store::StoreArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let progress = Arc::new(annoline_core::ProgressContext::new());

    // TTY: warn unless --debug, progress bars show activity.
    // non-TTY: info unless --quiet, logs are the only progress indicator.
    let multi = progress.is_tty().then(|| progress.multi());
    annoline_core::init_logging(cli.debug, cli.quiet, multi)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run(args) => cmd::run::run(*args, &config, &progress),
        Command::Store(args) => cmd::store::run(args, &config).map(|()| ExitCode::SUCCESS),
        Command::Config => {
            let mut table = cmd::table(&["Setting", "Value"]);
            table.add_row(vec![
                "Result store".to_string(),
                config.output.dir.display().to_string(),
            ]);
            table.add_row(vec![
                "Compression level".to_string(),
                config.output.compression_level.to_string(),
            ]);
            table.add_row(vec![
                "Data root".to_string(),
                config.data.root.display().to_string(),
            ]);
            table.add_row(vec![
                "Hub".to_string(),
                if config.data.download {
                    config.data.hub_url.clone()
                } else {
                    "disabled".to_string()
                },
            ]);
            table.add_row(vec!["Ollama endpoint".to_string(), config.ollama.endpoint.clone()]);
            table.add_row(vec!["OpenAI base URL".to_string(), config.openai.base_url.clone()]);
            table.add_row(vec![
                "OpenAI API key".to_string(),
                if config.openai.api_key.is_some() {
                    "configured"
                } else {
                    "not set"
                }
                .to_string(),
            ]);
            table.add_row(vec![
                "Timeouts".to_string(),
                format!(
                    "connect {}s, request {}s",
                    config.http.connect_timeout, config.http.request_timeout
                ),
            ]);
            table.add_row(vec![
                "Concurrency".to_string(),
                config.workers.concurrency.to_string(),
            ]);

            eprintln!("\n{table}");
            Ok(ExitCode::SUCCESS)
        }
    }
}
