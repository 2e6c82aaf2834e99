//! Per-run configuration: parse run.toml and derive run settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use annoline_core::RetryPolicy;
use annoline_store::{DatasetId, Provenance, ResumePolicy, text_digest};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::batch::{self, BatchError};
use crate::source::ColumnMap;

/// Top-level run.toml structure. Every section and field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub dataset: DatasetConfig,
    pub model: ModelConfig,
    pub batching: BatchingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Hub identifier or local directory name under the data root.
    pub source: String,
    pub filename: String,
    pub split: String,
    pub columns: ColumnMap,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            source: "squad".into(),
            filename: "train.parquet".into(),
            split: "train".into(),
            columns: ColumnMap::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Name the produced annotation set is stored under.
    pub model_name: String,
    /// Backend model that writes the expressions.
    pub annotation_model: String,
    pub version: String,
    /// Explicit backend; chosen from the model name when unset.
    pub backend: Option<BackendKind>,
    /// Guideline document used as the system prompt.
    pub guideline: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_name: "example-model".into(),
            annotation_model: "gemma3:1b".into(),
            version: "v1".into(),
            backend: None,
            guideline: None,
        }
    }
}

impl ModelConfig {
    pub fn backend_kind(&self) -> BackendKind {
        self.backend
            .unwrap_or_else(|| BackendKind::for_model(&self.annotation_model))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Records to annotate per run; 0 takes every remaining record.
    pub subset_size: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    /// Concurrent backend calls inside one batch.
    pub concurrency: usize,
    pub backoff_base_ms: u64,
    /// Wall-clock limit for the whole run.
    pub timeout_secs: Option<u64>,
    pub resume: ResumePolicy,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            subset_size: 10,
            batch_size: 10,
            max_retries: 3,
            concurrency: 4,
            backoff_base_ms: 1000,
            timeout_secs: None,
            resume: ResumePolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("{0}")]
    Invalid(String),
}

/// Everything the coordinator needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub model_name: String,
    pub annotation_model: String,
    pub version: String,
    /// `None` takes every remaining record.
    pub subset_size: Option<usize>,
    pub batch_size: usize,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    pub resume: ResumePolicy,
    /// Effective configuration, stored with the run.
    pub config_json: String,
}

impl RunSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        batch::validate_size(self.batch_size)?;
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.annotation_model.trim().is_empty() {
            return Err(ConfigError::Invalid("annotation model is empty".into()));
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::Invalid("model name is empty".into()));
        }
        Ok(())
    }

    pub fn provenance(&self, guideline: &str) -> Provenance {
        Provenance {
            model_name: self.model_name.clone(),
            annotation_model: self.annotation_model.clone(),
            version: self.version.clone(),
            guideline_hash: text_digest(guideline),
            guideline: guideline.to_string(),
            config_json: self.config_json.clone(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        RunConfig::default().settings()
    }
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("dataset.source", &self.dataset.source),
            ("dataset.filename", &self.dataset.filename),
            ("dataset.split", &self.dataset.split),
            ("dataset.columns.text", &self.dataset.columns.text),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{name} is empty")));
            }
        }
        self.settings().validate()
    }

    pub fn dataset_id(&self) -> DatasetId {
        DatasetId::new(
            &self.dataset.source,
            &self.dataset.filename,
            &self.dataset.split,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.batching.max_retries,
            backoff_base: Duration::from_millis(self.batching.backoff_base_ms),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.batching.timeout_secs.map(Duration::from_secs)
    }

    pub fn settings(&self) -> RunSettings {
        RunSettings {
            model_name: self.model.model_name.clone(),
            annotation_model: self.model.annotation_model.clone(),
            version: self.model.version.clone(),
            subset_size: (self.batching.subset_size > 0).then_some(self.batching.subset_size),
            batch_size: self.batching.batch_size,
            concurrency: self.batching.concurrency,
            retry: self.retry_policy(),
            resume: self.batching.resume,
            config_json: serde_json::to_string(self).unwrap_or_default(),
        }
    }
}
