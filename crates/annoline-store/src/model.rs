//! Records, per-record results and run metadata

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash;

/// Identity of a source dataset: where it comes from, which file, which split.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId {
    pub source: String,
    pub filename: String,
    pub split: String,
}

impl DatasetId {
    pub fn new(
        source: impl Into<String>,
        filename: impl Into<String>,
        split: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            filename: filename.into(),
            split: split.into(),
        }
    }

    /// Stable directory key: sanitized source name plus a short hash of the
    /// full identity, e.g. `snli-3f2a9c1e`.
    pub fn key(&self) -> String {
        // Field order is fixed by the struct, so the JSON is canonical.
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let digest = hash::short_hash(&hash::hash_bytes(canonical.as_bytes()));
        let stem: String = self
            .source
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        if stem.is_empty() {
            digest
        } else {
            format!("{stem}-{digest}")
        }
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[{}]", self.source, self.filename, self.split)
    }
}

/// One source row. `pair_text` and `label` are set for sentence-pair datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: u64,
    pub text: String,
    pub pair_text: Option<String>,
    pub label: Option<String>,
}

impl Record {
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
            pair_text: None,
            label: None,
        }
    }

    pub fn with_pair(mut self, pair_text: impl Into<String>) -> Self {
        self.pair_text = Some(pair_text.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Terminal state of a record within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationStatus {
    Success,
    Failed,
    Skipped,
}

impl AnnotationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AnnotationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnnotationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown annotation status: {other}")),
        }
    }
}

/// Why a record did not end in Success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Connection failure, timeout, 429 or 5xx, retries exhausted.
    Transient,
    /// No usable expression in the response, retries exhausted.
    Malformed,
    /// Backend refused this request.
    Rejected,
    /// Backend unusable for the whole run (unauthorized, unknown model).
    Fatal,
    /// Never finished because an earlier record hit a fatal error.
    Aborted,
    /// Never finished because the run was cancelled.
    Cancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Malformed => "malformed",
            Self::Rejected => "rejected",
            Self::Fatal => "fatal",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "malformed" => Ok(Self::Malformed),
            "rejected" => Ok(Self::Rejected),
            "fatal" => Ok(Self::Fatal),
            "aborted" => Ok(Self::Aborted),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome for one record in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationResult {
    pub record: Record,
    pub status: AnnotationStatus,
    /// Expression for `record.text`, code fences stripped.
    pub payload: Option<String>,
    /// Expression for `record.pair_text`.
    pub pair_payload: Option<String>,
    pub error: Option<Failure>,
    /// Backend calls made; 0 for records skipped before being sent.
    pub attempt_count: u32,
    pub completed_at: DateTime<Utc>,
    /// User prompt sent for `record.text`.
    pub prompt: Option<String>,
    /// User prompt sent for `record.pair_text`, once the first expression existed.
    pub pair_prompt: Option<String>,
}

impl AnnotationResult {
    pub fn success(
        record: Record,
        payload: String,
        pair_payload: Option<String>,
        attempt_count: u32,
    ) -> Self {
        Self {
            record,
            status: AnnotationStatus::Success,
            payload: Some(payload),
            pair_payload,
            error: None,
            attempt_count,
            completed_at: Utc::now(),
            prompt: None,
            pair_prompt: None,
        }
    }

    pub fn failed(record: Record, error: Failure, attempt_count: u32) -> Self {
        Self {
            record,
            status: AnnotationStatus::Failed,
            payload: None,
            pair_payload: None,
            error: Some(error),
            attempt_count,
            completed_at: Utc::now(),
            prompt: None,
            pair_prompt: None,
        }
    }

    /// A record that never reached a backend call.
    pub fn skipped(record: Record, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            record,
            status: AnnotationStatus::Skipped,
            payload: None,
            pair_payload: None,
            error: Some(Failure::new(kind, reason)),
            attempt_count: 0,
            completed_at: Utc::now(),
            prompt: None,
            pair_prompt: None,
        }
    }

    pub fn with_prompts(mut self, prompt: Option<String>, pair_prompt: Option<String>) -> Self {
        self.prompt = prompt;
        self.pair_prompt = pair_prompt;
        self
    }

    pub fn record_id(&self) -> u64 {
        self.record.id
    }
}

/// Stable identifier of one stored result: 32 hex chars derived from run and record.
pub fn annotation_id(run_id: &str, record_id: u64) -> String {
    let hex = hash::hash_bytes(format!("{run_id}/{record_id}").as_bytes()).to_hex();
    hex[..32].to_string()
}

/// Model, convention and settings a run was produced with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Name of the annotation scheme (stored with every result set).
    pub model_name: String,
    /// Backend model that generated the expressions.
    pub annotation_model: String,
    pub version: String,
    /// blake3 of the system prompt handed to the model.
    pub guideline_hash: String,
    /// The system prompt itself.
    #[serde(default)]
    pub guideline: String,
    /// Effective run configuration as JSON.
    pub config_json: String,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunOutcome {
    Running,
    Completed,
    Aborted { reason: String },
    Cancelled { reason: String },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Cancelled { .. } => "cancelled",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted { reason } | Self::Cancelled { reason } => {
                write!(f, "{} ({reason})", self.label())
            }
            _ => f.write_str(self.label()),
        }
    }
}

/// Run-level record stored as `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub dataset: DatasetId,
    pub dataset_key: String,
    pub provenance: Provenance,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_records: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    /// Source records left out because earlier runs already finished them.
    pub resumed_count: usize,
    /// Parquet parts written so far.
    pub parts: usize,
    pub outcome: RunOutcome,
}

impl RunMetadata {
    /// Fresh metadata in the `running` state with a new run id.
    pub fn start(dataset: DatasetId, provenance: Provenance) -> Self {
        let started_at = Utc::now();
        let run_id = new_run_id(&dataset, &provenance, started_at);
        Self {
            run_id,
            dataset_key: dataset.key(),
            dataset,
            provenance,
            started_at,
            finished_at: None,
            total_records: 0,
            success_count: 0,
            failed_count: 0,
            skipped_count: 0,
            resumed_count: 0,
            parts: 0,
            outcome: RunOutcome::Running,
        }
    }

    /// Count one terminal result.
    pub fn tally(&mut self, status: AnnotationStatus) {
        self.total_records += 1;
        match status {
            AnnotationStatus::Success => self.success_count += 1,
            AnnotationStatus::Failed => self.failed_count += 1,
            AnnotationStatus::Skipped => self.skipped_count += 1,
        }
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn counts_balance(&self) -> bool {
        self.success_count + self.failed_count + self.skipped_count == self.total_records
    }
}

/// `20260301T120000123456Z-1a2b3c4d`: sortable by start time, unique per start.
pub fn new_run_id(dataset: &DatasetId, provenance: &Provenance, at: DateTime<Utc>) -> String {
    let seed = format!(
        "{}|{}|{}|{}|{}",
        dataset.key(),
        provenance.model_name,
        provenance.annotation_model,
        provenance.version,
        at.timestamp_nanos_opt().unwrap_or_default(),
    );
    format!(
        "{}-{}",
        at.format("%Y%m%dT%H%M%S%6fZ"),
        hash::short_hash(&hash::hash_bytes(seed.as_bytes()))
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn provenance() -> Provenance {
        Provenance {
            model_name: "example-model".into(),
            annotation_model: "gemma3:1b".into(),
            version: "v1".into(),
            guideline_hash: hash::text_digest("guideline"),
            guideline: "guideline".into(),
            config_json: "{}".into(),
        }
    }

    #[test]
    fn dataset_key_stable_and_distinct() {
        let a = DatasetId::new("stanfordnlp/snli", "train.parquet", "train");
        let b = DatasetId::new("stanfordnlp/snli", "train.parquet", "validation");
        assert_eq!(a.key(), a.clone().key());
        assert_ne!(a.key(), b.key());
        assert!(a.key().starts_with("snli-"));
    }

    #[test]
    fn dataset_key_sanitizes_source() {
        let id = DatasetId::new("My.Data Set", "f.jsonl", "train");
        assert!(id.key().starts_with("my_data_set-"));
    }

    #[test]
    fn dataset_display() {
        let id = DatasetId::new("squad", "train.parquet", "train");
        assert_eq!(id.to_string(), "squad/train.parquet[train]");
    }

    #[test]
    fn status_and_kind_parse_back() {
        for s in [
            AnnotationStatus::Success,
            AnnotationStatus::Failed,
            AnnotationStatus::Skipped,
        ] {
            assert_eq!(s.as_str().parse::<AnnotationStatus>().unwrap(), s);
        }
        assert_eq!("aborted".parse::<FailureKind>().unwrap(), FailureKind::Aborted);
        assert!("exploded".parse::<FailureKind>().is_err());
    }

    #[test]
    fn skipped_results_have_zero_attempts() {
        let r = AnnotationResult::skipped(Record::new(4, "x"), FailureKind::Aborted, "fatal");
        assert_eq!(r.status, AnnotationStatus::Skipped);
        assert_eq!(r.attempt_count, 0);
        assert_eq!(r.error.unwrap().kind, FailureKind::Aborted);
    }

    #[test]
    fn tally_keeps_counts_balanced() {
        let mut meta = RunMetadata::start(DatasetId::new("squad", "t.parquet", "train"), provenance());
        meta.tally(AnnotationStatus::Success);
        meta.tally(AnnotationStatus::Failed);
        meta.tally(AnnotationStatus::Skipped);
        assert_eq!(meta.total_records, 3);
        assert!(meta.counts_balance());
        assert!(!meta.is_finished());
        meta.finish(RunOutcome::Completed);
        assert!(meta.is_finished());
    }

    #[test]
    fn run_ids_sort_by_start_time() {
        let ds = DatasetId::new("squad", "t.parquet", "train");
        let p = provenance();
        let early = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let late = chrono::DateTime::from_timestamp(1_800_000_000, 0).unwrap();
        assert!(new_run_id(&ds, &p, early) < new_run_id(&ds, &p, late));
        assert!(new_run_id(&ds, &p, early).starts_with("20231114T221320000000Z-"));
    }

    #[test]
    fn outcome_json_shape() {
        let json = serde_json::to_string(&RunOutcome::Aborted {
            reason: "HTTP 401".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"aborted","reason":"HTTP 401"}"#);
        let back: RunOutcome = serde_json::from_str(r#"{"state":"completed"}"#).unwrap();
        assert_eq!(back, RunOutcome::Completed);
    }

    #[test]
    fn annotation_ids_differ_per_run_and_record() {
        let a = annotation_id("run-a", 7);
        assert_eq!(a.len(), 32);
        assert_eq!(a, annotation_id("run-a", 7));
        assert_ne!(a, annotation_id("run-a", 8));
        assert_ne!(a, annotation_id("run-b", 7));
    }

    #[test]
    fn provenance_without_guideline_text_still_loads() {
        let json = r#"{"model_name":"m","annotation_model":"a","version":"v1","guideline_hash":"h","config_json":"{}"}"#;
        let p: Provenance = serde_json::from_str(json).unwrap();
        assert!(p.guideline.is_empty());
    }
}
