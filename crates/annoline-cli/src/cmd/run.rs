//! `annoline run` - annotate one dataset split

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color};

use annoline_annotate::{
    AnnotationClient, BackendKind, FileSource, HubFetch, LanguageModel, OllamaBackend,
    OpenAiBackend, RunConfig, RunCoordinator, RunError, RunReport, prompt,
};
use annoline_core::{CancelFlag, HttpConfig, SharedProgress, fmt_pct};
use annoline_store::{ResultStore, ResumePolicy};

use crate::config::Config;

/// Exit status when a fatal backend error aborted the run.
const EXIT_ABORTED: u8 = 2;
/// Exit status after SIGINT/SIGTERM or the run timeout.
const EXIT_CANCELLED: u8 = 130;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Load run settings from a run.toml (flags below override it)
    #[arg(long = "from", value_name = "RUN_TOML")]
    pub from: Option<PathBuf>,

    /// Dataset identifier on the hub (or directory under the data root)
    #[arg(long)]
    pub hf_id: Option<String>,

    /// Dataset file name
    #[arg(long)]
    pub filename: Option<String>,

    /// Dataset split
    #[arg(long)]
    pub split: Option<String>,

    /// Name the annotations are stored under
    #[arg(long)]
    pub model_name: Option<String>,

    /// Annotation set version
    #[arg(long)]
    pub version: Option<String>,

    /// Records to annotate this run (0 = all remaining)
    #[arg(long)]
    pub subset_size: Option<usize>,

    /// Records per batch
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Backend model that writes the expressions
    #[arg(long)]
    pub annotation_model: Option<String>,

    /// Backend (default: chosen from the model name)
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Guideline document used as the system prompt
    #[arg(long)]
    pub guideline: Option<PathBuf>,

    /// Retries per record after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Concurrent backend calls inside a batch
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Backoff unit in milliseconds for transient errors
    #[arg(long)]
    pub backoff_ms: Option<u64>,

    /// Stop the run after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Column holding the sentence
    #[arg(long)]
    pub text_column: Option<String>,

    /// Column holding the second sentence of a pair
    #[arg(long)]
    pub pair_column: Option<String>,

    /// Integer id column (default: row number)
    #[arg(long)]
    pub id_column: Option<String>,

    /// Re-annotate every record, ignoring earlier runs
    #[arg(long, conflicts_with = "skip_failed")]
    pub fresh: bool,

    /// Also skip records that failed in earlier runs
    #[arg(long)]
    pub skip_failed: bool,

    /// Result store directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Dataset root directory
    #[arg(long)]
    pub data_root: Option<PathBuf>,

    /// Never download missing datasets
    #[arg(long)]
    pub no_download: bool,
}

impl RunArgs {
    /// Effective run configuration: run.toml (or defaults), then flags.
    fn run_config(&self, config: &Config) -> Result<RunConfig> {
        let mut rc = match &self.from {
            Some(path) => RunConfig::from_file(path)?,
            None => {
                let mut rc = RunConfig::default();
                rc.batching.concurrency = config.workers.concurrency;
                rc
            }
        };

        fn set<T: Clone>(slot: &mut T, value: &Option<T>) {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
        set(&mut rc.dataset.source, &self.hf_id);
        set(&mut rc.dataset.filename, &self.filename);
        set(&mut rc.dataset.split, &self.split);
        set(&mut rc.dataset.columns.text, &self.text_column);
        if self.pair_column.is_some() {
            rc.dataset.columns.pair = self.pair_column.clone();
        }
        if self.id_column.is_some() {
            rc.dataset.columns.id = self.id_column.clone();
        }
        set(&mut rc.model.model_name, &self.model_name);
        set(&mut rc.model.version, &self.version);
        set(&mut rc.model.annotation_model, &self.annotation_model);
        if self.backend.is_some() {
            rc.model.backend = self.backend;
        }
        if self.guideline.is_some() {
            rc.model.guideline = self.guideline.clone();
        }
        set(&mut rc.batching.subset_size, &self.subset_size);
        set(&mut rc.batching.batch_size, &self.batch_size);
        set(&mut rc.batching.max_retries, &self.max_retries);
        set(&mut rc.batching.concurrency, &self.concurrency);
        set(&mut rc.batching.backoff_base_ms, &self.backoff_ms);
        if self.timeout.is_some() {
            rc.batching.timeout_secs = self.timeout;
        }
        if self.fresh {
            rc.batching.resume = ResumePolicy::Fresh;
        } else if self.skip_failed {
            rc.batching.resume = ResumePolicy::SkipFailed;
        }
        Ok(rc)
    }
}

fn build_backend(
    kind: BackendKind,
    config: &Config,
    http: &HttpConfig,
) -> Result<Arc<dyn LanguageModel>> {
    let backend: Arc<dyn LanguageModel> = match kind {
        BackendKind::Ollama => Arc::new(OllamaBackend::new(&config.ollama.endpoint, http)?),
        BackendKind::OpenAi => Arc::new(
            OpenAiBackend::new(&config.openai.base_url, config.openai.api_key.clone(), http)
                .context("set [openai].api_key or OPENAI_API_KEY")?,
        ),
    };
    Ok(backend)
}

pub fn run(args: RunArgs, config: &Config, progress: &SharedProgress) -> Result<ExitCode> {
    let run_config = args.run_config(config)?;
    run_config.validate()?;

    let http = config.http.to_http_config();
    let kind = run_config.model.backend_kind();
    let backend = build_backend(kind, config, &http)?;
    let guideline_path = run_config.model.guideline.as_deref();
    let guideline = prompt::load_guideline(guideline_path)
        .with_context(|| format!("failed to read guideline {guideline_path:?}"))?;
    let client = AnnotationClient::new(backend, guideline);

    let data_root = args.data_root.clone().unwrap_or_else(|| config.data.root.clone());
    let mut source = FileSource::new(
        run_config.dataset_id(),
        data_root,
        run_config.dataset.columns.clone(),
    );
    if config.data.download && !args.no_download {
        source = source.with_hub(HubFetch::new(&config.data.hub_url, http));
    }

    let output = args.output.clone().unwrap_or_else(|| config.output.dir.clone());
    let store = ResultStore::open(&output)?.with_zstd_level(config.output.compression_level);

    let mut cancel = CancelFlag::new();
    if let Some(timeout) = run_config.timeout() {
        cancel = cancel.with_timeout(timeout);
    }
    cancel
        .register_signals()
        .context("failed to install signal handlers")?;

    log::info!(
        "Annotating {} with {} via {kind}",
        run_config.dataset_id(),
        run_config.model.annotation_model
    );
    let result = RunCoordinator::new(&source, client, &store, run_config.settings())
        .with_progress(Arc::clone(progress))
        .run(&cancel);

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(RunError::BackendFatal { reason, report }) => {
            print_report(&report);
            log::error!("Run aborted by backend: {reason}");
            Ok(ExitCode::from(EXIT_ABORTED))
        }
        Err(RunError::Cancelled { reason, report }) => {
            print_report(&report);
            log::warn!("Run stopped: {reason}");
            Ok(ExitCode::from(EXIT_CANCELLED))
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &RunReport) {
    let mut table = super::table(&[
        "Run", "Outcome", "Total", "Success", "Failed", "Skipped", "Resumed",
    ]);
    let outcome = match report.outcome.label() {
        "completed" => Cell::new("completed").fg(Color::Green),
        "aborted" => Cell::new("aborted").fg(Color::Red),
        other => Cell::new(other).fg(Color::Yellow),
    };
    table.add_row(vec![
        Cell::new(&report.run_id),
        outcome,
        Cell::new(report.total),
        Cell::new(format!(
            "{} ({})",
            report.success,
            fmt_pct(report.success, report.total)
        )),
        Cell::new(report.failed),
        Cell::new(report.skipped),
        Cell::new(report.resumed),
    ]);
    eprintln!("\n{table}");
    eprintln!("Results: {}", report.dir.display());
}
