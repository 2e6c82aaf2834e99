//! Append-only result store keyed by dataset and run
//!
//! Directory layout:
//! ```text
//! {base}/
//! ├── datasets/
//! │   └── {dataset-key}/
//! │       ├── dataset.json
//! │       └── runs/
//! │           └── {run-id}/
//! │               ├── run.json
//! │               ├── manifest.json      # written when the run finishes
//! │               └── part_00000.parquet # one per finished batch
//! ├── runs/
//! │   └── {run-id} -> ../datasets/{dataset-key}/runs/{run-id}
//! └── latest -> runs/{run-id}
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use annoline_core::sink::{DEFAULT_ZSTD_LEVEL, ParquetSink};
use annoline_core::{cleanup_tmp_files, write_rows};
use anyhow::{Context, Result, bail};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::hash;
use crate::manifest::{self, RunManifest};
use crate::model::{AnnotationResult, AnnotationStatus, DatasetId, RunMetadata, RunOutcome};
use crate::schema::{self, RESULT_SCHEMA, ResultAccumulator};

const RUN_FILE: &str = "run.json";
const DATASET_FILE: &str = "dataset.json";

/// Which earlier results count as done when a dataset is annotated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumePolicy {
    /// Skip records that succeeded before; failed ones are tried again.
    #[default]
    RetryFailed,
    /// Skip records that succeeded or failed before.
    SkipFailed,
    /// Ignore earlier runs.
    Fresh,
}

impl ResumePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetryFailed => "retry-failed",
            Self::SkipFailed => "skip-failed",
            Self::Fresh => "fresh",
        }
    }
}

impl fmt::Display for ResumePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResumePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry-failed" => Ok(Self::RetryFailed),
            "skip-failed" => Ok(Self::SkipFailed),
            "fresh" => Ok(Self::Fresh),
            other => Err(format!(
                "unknown resume policy `{other}` (expected retry-failed, skip-failed or fresh)"
            )),
        }
    }
}

/// Written once per dataset directory.
#[derive(Debug, Serialize, Deserialize)]
struct DatasetMeta {
    dataset: DatasetId,
    key: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Where a finished run landed.
#[derive(Debug, Clone)]
pub struct StoredRunHandle {
    pub run_id: String,
    pub dir: PathBuf,
    pub content_hash: String,
}

/// A run read back from disk.
#[derive(Debug)]
pub struct StoredRun {
    pub metadata: RunMetadata,
    pub results: Vec<AnnotationResult>,
}

/// Verification result for a single part.
#[derive(Debug)]
pub struct VerifyResult {
    pub path: String,
    pub expected: String,
    pub actual: String,
    pub ok: bool,
}

pub struct ResultStore {
    base: PathBuf,
    zstd_level: i32,
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = annoline_core::sink::tmp_path_for(path);
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to rename {}", tmp.display()))
}

fn read_run_meta(dir: &Path) -> Result<RunMetadata> {
    let path = dir.join(RUN_FILE);
    let json =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("failed to parse {}", path.display()))
}

impl ResultStore {
    /// Open (creating if needed) a store rooted at `base`.
    pub fn open(base: &Path) -> Result<Self> {
        for dir in [base.join("datasets"), base.join("runs")] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(Self {
            base: base.to_path_buf(),
            zstd_level: DEFAULT_ZSTD_LEVEL,
        })
    }

    pub fn with_zstd_level(mut self, level: i32) -> Self {
        self.zstd_level = level;
        self
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.base.join("runs")
    }

    pub fn dataset_dir(&self, dataset: &DatasetId) -> PathBuf {
        self.base.join("datasets").join(dataset.key())
    }

    /// Run directory, reached through the `runs/{run-id}` link.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    /// Create the run directory and write the initial `run.json`.
    ///
    /// Fails if a run with the same id already exists.
    pub fn begin_run(&self, metadata: RunMetadata) -> Result<RunWriter> {
        let dataset_dir = self.dataset_dir(&metadata.dataset);
        let dataset_file = dataset_dir.join(DATASET_FILE);
        if !dataset_file.exists() {
            fs::create_dir_all(&dataset_dir)
                .with_context(|| format!("failed to create {}", dataset_dir.display()))?;
            write_json_atomic(
                &dataset_file,
                &DatasetMeta {
                    dataset: metadata.dataset.clone(),
                    key: metadata.dataset_key.clone(),
                    created_at: chrono::Utc::now(),
                },
            )?;
        }

        let dir = dataset_dir.join("runs").join(&metadata.run_id);
        if dir.exists() {
            bail!("run directory {} already exists", dir.display());
        }
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let link = self.run_dir(&metadata.run_id);
        let target = PathBuf::from("../datasets")
            .join(&metadata.dataset_key)
            .join("runs")
            .join(&metadata.run_id);
        std::os::unix::fs::symlink(&target, &link).with_context(|| {
            format!("failed to create symlink {} → {}", link.display(), target.display())
        })?;

        write_json_atomic(&dir.join(RUN_FILE), &metadata)?;
        log::debug!("store: began run {} in {}", metadata.run_id, dir.display());

        Ok(RunWriter {
            accumulator: ResultAccumulator::new(
                &metadata.run_id,
                &metadata.dataset_key,
                &metadata.provenance.guideline,
            ),
            base: self.base.clone(),
            dir,
            metadata,
            zstd_level: self.zstd_level,
        })
    }

    /// Store a complete result set in one call.
    pub fn persist(
        &self,
        metadata: RunMetadata,
        results: Vec<AnnotationResult>,
    ) -> Result<StoredRunHandle> {
        let outcome = match &metadata.outcome {
            RunOutcome::Running => RunOutcome::Completed,
            other => other.clone(),
        };
        let mut writer = self.begin_run(metadata)?;
        writer.append(results)?;
        writer.finish(outcome)
    }

    /// Run directories of one dataset, oldest first.
    fn dataset_run_dirs(&self, dataset: &DatasetId) -> Result<Vec<PathBuf>> {
        let runs = self.dataset_dir(dataset).join("runs");
        if !runs.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&runs)? {
            let path = entry?.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        // Run ids start with their UTC start time.
        dirs.sort();
        Ok(dirs)
    }

    /// Record ids of `dataset` that earlier runs already finished, per `policy`.
    ///
    /// A success in any run counts. Parts of interrupted runs count too.
    pub fn completed_records(
        &self,
        dataset: &DatasetId,
        policy: ResumePolicy,
    ) -> Result<FxHashSet<u64>> {
        let mut done = FxHashSet::default();
        if policy == ResumePolicy::Fresh {
            return Ok(done);
        }

        let mut failed = FxHashSet::default();
        for dir in self.dataset_run_dirs(dataset)? {
            for part in manifest::list_parts(&dir)? {
                for (id, status) in schema::read_statuses(&part)? {
                    match status {
                        AnnotationStatus::Success => {
                            done.insert(id);
                        }
                        AnnotationStatus::Failed => {
                            failed.insert(id);
                        }
                        AnnotationStatus::Skipped => {}
                    }
                }
            }
        }

        if policy == ResumePolicy::SkipFailed {
            done.extend(failed);
        }
        Ok(done)
    }

    /// Most recent stored result for one record.
    pub fn lookup(&self, dataset: &DatasetId, record_id: u64) -> Result<Option<AnnotationResult>> {
        for dir in self.dataset_run_dirs(dataset)?.into_iter().rev() {
            let mut hit = None;
            for part in manifest::list_parts(&dir)? {
                if let Some(r) = schema::read_results(&part)?
                    .into_iter()
                    .find(|r| r.record.id == record_id)
                {
                    hit = Some(r);
                }
            }
            if hit.is_some() {
                return Ok(hit);
            }
        }
        Ok(None)
    }

    /// Metadata and all results of a run, results in stored order.
    pub fn load_run(&self, run_id: &str) -> Result<StoredRun> {
        let dir = self.run_dir(run_id);
        let metadata = read_run_meta(&dir).with_context(|| format!("unknown run {run_id}"))?;
        let mut results = Vec::new();
        for part in manifest::list_parts(&dir)? {
            results.extend(schema::read_results(&part)?);
        }
        Ok(StoredRun { metadata, results })
    }

    /// Every run in the store, oldest first.
    pub fn list_runs(&self) -> Result<Vec<RunMetadata>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(self.runs_dir())? {
            let entry = entry?;
            match read_run_meta(&entry.path()) {
                Ok(meta) => runs.push(meta),
                Err(e) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    log::warn!("skipping run {name}: {e:#}");
                }
            }
        }
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    /// Compare part hashes against the run's manifest.
    pub fn verify(&self, run_id: &str) -> Result<Vec<VerifyResult>> {
        let dir = self.run_dir(run_id);
        let manifest = RunManifest::read_from(&dir)
            .with_context(|| format!("no manifest for {run_id} (unfinished run?)"))?;

        let mut results = Vec::new();
        for (name, expected) in &manifest.part_hashes {
            let path = dir.join(name);
            let actual = if path.exists() {
                match hash::hash_file(&path) {
                    Ok(h) => h.to_hex().to_string(),
                    Err(e) => format!("error: {e}"),
                }
            } else {
                "MISSING".to_string()
            };
            results.push(VerifyResult {
                path: name.clone(),
                ok: actual == *expected,
                expected: expected.clone(),
                actual,
            });
        }

        // Parts written after the manifest are not covered by it.
        for part in manifest::list_parts(&dir)? {
            let name = part
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !manifest.part_hashes.contains_key(&name) {
                results.push(VerifyResult {
                    path: name,
                    expected: "UNLISTED".to_string(),
                    actual: String::new(),
                    ok: false,
                });
            }
        }
        Ok(results)
    }

    /// Remove stale `.tmp` files left by interrupted writes.
    pub fn cleanup_tmp(&self) -> Result<usize> {
        let pattern = self.base.join("datasets/*/runs/*");
        let mut count = 0;
        for dir in glob::glob(&pattern.to_string_lossy())
            .context("invalid glob pattern")?
            .filter_map(|e| e.ok())
            .filter(|p| p.is_dir())
        {
            count += cleanup_tmp_files(&dir)
                .with_context(|| format!("failed to clean {}", dir.display()))?;
        }
        Ok(count)
    }
}

/// Incremental writer for one run. Each [`append`](RunWriter::append)
/// lands as its own durable part.
pub struct RunWriter {
    accumulator: ResultAccumulator,
    base: PathBuf,
    dir: PathBuf,
    metadata: RunMetadata,
    zstd_level: i32,
}

impl RunWriter {
    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut RunMetadata {
        &mut self.metadata
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `results` as the next part and refresh `run.json`.
    ///
    /// Returns the part path, or `None` when `results` is empty.
    pub fn append(&mut self, results: Vec<AnnotationResult>) -> Result<Option<PathBuf>> {
        if results.is_empty() {
            return Ok(None);
        }
        let statuses: Vec<AnnotationStatus> = results.iter().map(|r| r.status).collect();

        let path = self
            .dir
            .join(format!("part_{:05}.parquet", self.metadata.parts));
        let mut sink = ParquetSink::create(&path, RESULT_SCHEMA.clone(), self.zstd_level)
            .with_context(|| format!("failed to create {}", path.display()))?;
        write_rows(&mut self.accumulator, results, &mut sink)
            .with_context(|| format!("failed to write {}", path.display()))?;
        let rows = sink
            .finalize()
            .with_context(|| format!("failed to finalize {}", path.display()))?;
        for status in statuses {
            self.metadata.tally(status);
        }
        self.metadata.parts += 1;

        write_json_atomic(&self.dir.join(RUN_FILE), &self.metadata)?;
        log::debug!("store: wrote {rows} results to {}", path.display());
        Ok(Some(path))
    }

    /// Seal the run: manifest, final `run.json`, `latest` link.
    pub fn finish(mut self, outcome: RunOutcome) -> Result<StoredRunHandle> {
        self.metadata.finish(outcome);

        let manifest = RunManifest::build(
            &self.metadata.run_id,
            &self.dir,
            self.metadata.total_records,
        )?;
        manifest.write_to(&self.dir)?;
        write_json_atomic(&self.dir.join(RUN_FILE), &self.metadata)?;

        let latest = self.base.join("latest");
        let _ = fs::remove_file(&latest);
        let target = PathBuf::from("runs").join(&self.metadata.run_id);
        if let Err(e) = std::os::unix::fs::symlink(&target, &latest) {
            log::warn!("failed to update latest link: {e}");
        }

        log::info!(
            "store: run {} {} ({} results, {} parts)",
            self.metadata.run_id,
            self.metadata.outcome,
            self.metadata.total_records,
            self.metadata.parts
        );
        Ok(StoredRunHandle {
            run_id: self.metadata.run_id.clone(),
            dir: self.dir,
            content_hash: manifest.content_hash,
        })
    }
}
