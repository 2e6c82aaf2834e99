//! `annoline store` - inspect and maintain the result store

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use comfy_table::{Cell, Color};

use annoline_store::{AnnotationStatus, ResultStore, RunMetadata, VerifyResult};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct StoreArgs {
    /// Result store directory (default: [output].dir)
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub action: StoreAction,
}

#[derive(Subcommand, Debug)]
pub enum StoreAction {
    /// List runs, oldest first
    List,
    /// Show one run and its first results
    Show {
        run_id: String,

        /// Result rows to print
        #[arg(short = 'n', long, default_value_t = 10)]
        records: usize,
    },
    /// Verify part hashes against run manifests
    Verify {
        /// Specific run (default: every finished run)
        run_id: Option<String>,
    },
    /// Remove leftover temporary files from interrupted writes
    Clean,
}

pub fn run(args: StoreArgs, config: &Config) -> Result<()> {
    let dir = args.dir.unwrap_or_else(|| config.output.dir.clone());
    match args.action {
        StoreAction::List => list(&dir),
        StoreAction::Show { run_id, records } => show(&dir, &run_id, records),
        StoreAction::Verify { run_id } => verify(&dir, run_id.as_deref()),
        StoreAction::Clean => clean(&dir),
    }
}

fn outcome_cell(meta: &RunMetadata) -> Cell {
    let label = meta.outcome.label();
    match label {
        "completed" => Cell::new(label).fg(Color::Green),
        "aborted" => Cell::new(label).fg(Color::Red),
        _ => Cell::new(label).fg(Color::Yellow),
    }
}

fn list(dir: &Path) -> Result<()> {
    let store = ResultStore::open(dir)?;
    let runs = store.list_runs()?;

    if runs.is_empty() {
        eprintln!("No runs.");
        return Ok(());
    }

    let mut table = super::table(&[
        "Run", "Dataset", "Model", "Version", "Outcome", "Total", "OK", "Failed", "Skipped",
    ]);
    for meta in &runs {
        table.add_row(vec![
            Cell::new(&meta.run_id),
            Cell::new(&meta.dataset),
            Cell::new(&meta.provenance.annotation_model),
            Cell::new(&meta.provenance.version),
            outcome_cell(meta),
            Cell::new(meta.total_records),
            Cell::new(meta.success_count),
            Cell::new(meta.failed_count),
            Cell::new(meta.skipped_count),
        ]);
    }

    eprintln!("\n{table}");
    eprintln!("{} runs total", runs.len());
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    let first = s.lines().next().unwrap_or_default();
    if first.chars().count() <= max && !s.contains('\n') {
        return first.to_string();
    }
    let cut: String = first.chars().take(max).collect();
    format!("{cut}...")
}

fn show(dir: &Path, run_id: &str, records: usize) -> Result<()> {
    let store = ResultStore::open(dir)?;
    let run = store.load_run(run_id)?;
    let meta = &run.metadata;

    let mut table = super::table(&["Field", "Value"]);
    table.add_row(vec![Cell::new("Run"), Cell::new(&meta.run_id)]);
    table.add_row(vec![Cell::new("Dataset"), Cell::new(&meta.dataset)]);
    table.add_row(vec![Cell::new("Dataset key"), Cell::new(&meta.dataset_key)]);
    table.add_row(vec![Cell::new("Model name"), Cell::new(&meta.provenance.model_name)]);
    table.add_row(vec![
        Cell::new("Annotation model"),
        Cell::new(&meta.provenance.annotation_model),
    ]);
    table.add_row(vec![Cell::new("Version"), Cell::new(&meta.provenance.version)]);
    table.add_row(vec![
        Cell::new("Guideline"),
        Cell::new(truncate(&meta.provenance.guideline_hash, 16)),
    ]);
    table.add_row(vec![Cell::new("Outcome"), Cell::new(&meta.outcome)]);
    table.add_row(vec![Cell::new("Started"), Cell::new(meta.started_at.to_rfc3339())]);
    table.add_row(vec![
        Cell::new("Finished"),
        Cell::new(
            meta.finished_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
        ),
    ]);
    table.add_row(vec![
        Cell::new("Records"),
        Cell::new(format!(
            "{} total, {} ok, {} failed, {} skipped, {} resumed",
            meta.total_records,
            meta.success_count,
            meta.failed_count,
            meta.skipped_count,
            meta.resumed_count
        )),
    ]);
    table.add_row(vec![Cell::new("Parts"), Cell::new(meta.parts)]);
    eprintln!("\n{table}");

    if records == 0 || run.results.is_empty() {
        return Ok(());
    }
    let mut rows = super::table(&["Id", "Status", "Attempts", "Text", "Expression / error"]);
    for r in run.results.iter().take(records) {
        let status = match r.status {
            AnnotationStatus::Success => Cell::new("success").fg(Color::Green),
            AnnotationStatus::Failed => Cell::new("failed").fg(Color::Red),
            AnnotationStatus::Skipped => Cell::new("skipped").fg(Color::DarkGrey),
        };
        let detail = match (&r.payload, &r.error) {
            (Some(payload), _) => truncate(payload, 48),
            (None, Some(e)) => format!("{}: {}", e.kind, truncate(&e.message, 40)),
            (None, None) => String::new(),
        };
        rows.add_row(vec![
            Cell::new(r.record.id),
            status,
            Cell::new(r.attempt_count),
            Cell::new(truncate(&r.record.text, 40)),
            Cell::new(detail),
        ]);
    }
    eprintln!("{rows}");
    if run.results.len() > records {
        eprintln!("... {} more", run.results.len() - records);
    }
    Ok(())
}

fn print_mismatches(run_id: &str, results: &[VerifyResult]) {
    for r in results.iter().filter(|r| !r.ok) {
        eprintln!("  MISMATCH in {run_id}: {}", r.path);
        eprintln!("    expected: {}", truncate(&r.expected, 8));
        eprintln!("    actual:   {}", truncate(&r.actual, 8));
    }
}

fn verify(dir: &Path, run_id: Option<&str>) -> Result<()> {
    let store = ResultStore::open(dir)?;

    let run_ids: Vec<String> = match run_id {
        Some(id) => vec![id.to_string()],
        None => store
            .list_runs()?
            .into_iter()
            .filter(RunMetadata::is_finished)
            .map(|m| m.run_id)
            .collect(),
    };
    if run_ids.is_empty() {
        eprintln!("No finished runs to verify.");
        return Ok(());
    }

    let mut table = super::table(&["Run", "Parts", "Status"]);
    let mut failures = Vec::new();
    for id in &run_ids {
        let results = store.verify(id)?;
        let ok = results.iter().all(|r| r.ok);
        let status = if ok {
            Cell::new("OK").fg(Color::Green)
        } else {
            Cell::new("FAIL").fg(Color::Red)
        };
        table.add_row(vec![Cell::new(id), Cell::new(results.len()), status]);
        if !ok {
            failures.push((id, results));
        }
    }
    eprintln!("\n{table}");

    for (id, results) in &failures {
        print_mismatches(id, results);
    }
    if !failures.is_empty() {
        bail!("{} of {} runs failed verification", failures.len(), run_ids.len());
    }
    eprintln!("All runs verified OK.");
    Ok(())
}

fn clean(dir: &Path) -> Result<()> {
    let store = ResultStore::open(dir)?;
    let removed = store.cleanup_tmp()?;
    if removed == 0 {
        eprintln!("Nothing to clean up.");
    } else {
        eprintln!("Removed {removed} temporary files.");
    }
    Ok(())
}
