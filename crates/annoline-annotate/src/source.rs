//! Record sources: ordered, lazy, deterministic record streams
//!
//! [`FileSource`] reads Parquet or JSON Lines files laid out under a data
//! root, optionally fetching them from a hub first. [`MemorySource`] serves
//! records already in memory.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use annoline_store::{DatasetId, Record};
use arrow::array::{Array, ArrayRef, RecordBatch, StringArray, UInt64Array};
use arrow::compute::{can_cast_types, cast};
use arrow::datatypes::{DataType, SchemaRef};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::hub::HubFetch;

const READ_BATCH_ROWS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("dataset {dataset} unavailable: {reason}")]
    Unavailable { dataset: String, reason: String },
    #[error("{path}: {reason}")]
    Format { path: String, reason: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SourceError {
    fn format(path: &Path, reason: impl Into<String>) -> Self {
        Self::Format {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

pub type RecordStream = Box<dyn Iterator<Item = Result<Record, SourceError>> + Send>;

/// Finite, ordered record provider for one dataset identity.
pub trait RecordSource: Send + Sync {
    fn dataset(&self) -> &DatasetId;

    /// Open the dataset. Schema problems are reported here, before any record
    /// is yielded; row-level problems surface as `Err` items.
    fn records(&self) -> Result<RecordStream, SourceError>;
}

/// Which columns hold what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub text: String,
    /// Second sentence of a pair; ignored when the file lacks it.
    pub pair: Option<String>,
    /// Gold label; ignored when the file lacks it.
    pub label: Option<String>,
    /// Integer id column. Row ordinals are used when unset.
    pub id: Option<String>,
    /// Rows are filtered on this column when the file has it.
    pub split: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            text: "premise".into(),
            pair: Some("hypothesis".into()),
            label: Some("label".into()),
            id: None,
            split: "split".into(),
        }
    }
}

/// In-memory records, served in the given order.
pub struct MemorySource {
    dataset: DatasetId,
    records: Arc<[Record]>,
}

impl MemorySource {
    pub fn new(dataset: DatasetId, records: Vec<Record>) -> Self {
        Self {
            dataset,
            records: records.into(),
        }
    }
}

impl RecordSource for MemorySource {
    fn dataset(&self) -> &DatasetId {
        &self.dataset
    }

    fn records(&self) -> Result<RecordStream, SourceError> {
        let records = Arc::clone(&self.records);
        Ok(Box::new(
            (0..records.len()).map(move |i| Ok::<_, SourceError>(records[i].clone())),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Parquet,
    JsonLines,
}

impl FileFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "parquet" => Some(Self::Parquet),
            "jsonl" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }
}

/// Dataset file under `{root}/{source}/{split}/{filename}` or
/// `{root}/{source}/{filename}`.
pub struct FileSource {
    dataset: DatasetId,
    root: PathBuf,
    columns: ColumnMap,
    hub: Option<HubFetch>,
}

impl FileSource {
    pub fn new(dataset: DatasetId, root: impl Into<PathBuf>, columns: ColumnMap) -> Self {
        Self {
            dataset,
            root: root.into(),
            columns,
            hub: None,
        }
    }

    /// Fetch missing files from `hub` instead of failing.
    pub fn with_hub(mut self, hub: HubFetch) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn candidates(&self) -> [PathBuf; 2] {
        let base = self.root.join(&self.dataset.source);
        [
            base.join(&self.dataset.split).join(&self.dataset.filename),
            base.join(&self.dataset.filename),
        ]
    }

    /// First existing candidate, downloading into the data root if allowed.
    pub fn resolve(&self) -> Result<PathBuf, SourceError> {
        let [by_split, flat] = self.candidates();
        if by_split.is_file() {
            return Ok(by_split);
        }
        if flat.is_file() {
            return Ok(flat);
        }
        match &self.hub {
            Some(hub) => {
                hub.download(&self.dataset, &flat)?;
                Ok(flat)
            }
            None => Err(SourceError::Unavailable {
                dataset: self.dataset.to_string(),
                reason: format!(
                    "not found at {} or {}",
                    by_split.display(),
                    flat.display()
                ),
            }),
        }
    }
}

impl RecordSource for FileSource {
    fn dataset(&self) -> &DatasetId {
        &self.dataset
    }

    fn records(&self) -> Result<RecordStream, SourceError> {
        let path = self.resolve()?;
        let format = FileFormat::from_path(&path).ok_or_else(|| {
            SourceError::format(&path, "unsupported file type (expected .parquet or .jsonl)")
        })?;
        log::debug!("Reading {} as {format:?}", path.display());
        match format {
            FileFormat::Parquet => Ok(Box::new(ParquetRecords::open(
                &path,
                &self.columns,
                &self.dataset.split,
            )?)),
            FileFormat::JsonLines => Ok(Box::new(JsonlRecords::open(
                &path,
                &self.columns,
                &self.dataset.split,
            )?)),
        }
    }
}

/// Rejects ids seen before.
#[derive(Default)]
struct IdGuard {
    seen: FxHashSet<u64>,
}

impl IdGuard {
    fn check(&mut self, id: u64, path: &Path) -> Result<(), SourceError> {
        if self.seen.insert(id) {
            Ok(())
        } else {
            Err(SourceError::format(path, format!("duplicate record id {id}")))
        }
    }
}

struct ParquetColumns {
    text: usize,
    pair: Option<usize>,
    label: Option<usize>,
    id: Option<usize>,
    split: Option<usize>,
}

impl ParquetColumns {
    fn resolve(schema: &SchemaRef, map: &ColumnMap, path: &Path) -> Result<Self, SourceError> {
        let text_like = |idx: usize| can_cast_types(schema.field(idx).data_type(), &DataType::Utf8);
        let optional = |name: &Option<String>| -> Result<Option<usize>, SourceError> {
            match name.as_deref().and_then(|n| schema.index_of(n).ok()) {
                Some(idx) if !text_like(idx) => Err(SourceError::format(
                    path,
                    format!("column `{}` cannot be read as text", schema.field(idx).name()),
                )),
                other => Ok(other),
            }
        };

        let text = schema
            .index_of(&map.text)
            .map_err(|_| SourceError::format(path, format!("missing text column `{}`", map.text)))?;
        if !text_like(text) {
            return Err(SourceError::format(
                path,
                format!("text column `{}` cannot be read as text", map.text),
            ));
        }

        let id = match &map.id {
            Some(name) => {
                let idx = schema
                    .index_of(name)
                    .map_err(|_| SourceError::format(path, format!("missing id column `{name}`")))?;
                if !schema.field(idx).data_type().is_integer() {
                    return Err(SourceError::format(
                        path,
                        format!("id column `{name}` must hold integers"),
                    ));
                }
                Some(idx)
            }
            None => None,
        };

        Ok(Self {
            text,
            pair: optional(&map.pair)?,
            label: optional(&map.label)?,
            id,
            split: optional(&Some(map.split.clone()))?,
        })
    }
}

struct ParquetRecords {
    path: PathBuf,
    reader: ParquetRecordBatchReader,
    columns: ParquetColumns,
    split: String,
    ordinal: u64,
    buffer: VecDeque<Record>,
    ids: IdGuard,
    done: bool,
}

fn text_column(array: &ArrayRef) -> Result<StringArray, String> {
    let cast = cast(array, &DataType::Utf8).map_err(|e| e.to_string())?;
    cast.as_any()
        .downcast_ref::<StringArray>()
        .cloned()
        .ok_or_else(|| "column did not cast to utf8".to_string())
}

fn opt_text(col: Option<&StringArray>, i: usize) -> Option<String> {
    col.filter(|c| c.is_valid(i)).map(|c| c.value(i).to_string())
}

impl ParquetRecords {
    fn open(path: &Path, map: &ColumnMap, split: &str) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|e| SourceError::io(path, e))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| SourceError::format(path, e.to_string()))?;
        let columns = ParquetColumns::resolve(builder.schema(), map, path)?;
        let reader = builder
            .with_batch_size(READ_BATCH_ROWS)
            .build()
            .map_err(|e| SourceError::format(path, e.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            reader,
            columns,
            split: split.to_string(),
            ordinal: 0,
            buffer: VecDeque::new(),
            ids: IdGuard::default(),
            done: false,
        })
    }

    fn decode(&mut self, batch: &RecordBatch) -> Result<(), SourceError> {
        let fmt = |e: String| SourceError::format(&self.path, e);
        let texts = text_column(batch.column(self.columns.text)).map_err(fmt)?;
        let optional = |idx: Option<usize>| -> Result<Option<StringArray>, SourceError> {
            idx.map(|i| text_column(batch.column(i)).map_err(fmt)).transpose()
        };
        let pairs = optional(self.columns.pair)?;
        let labels = optional(self.columns.label)?;
        let splits = optional(self.columns.split)?;
        let ids = match self.columns.id {
            Some(i) => {
                let cast = cast(batch.column(i), &DataType::UInt64)
                    .map_err(|e| SourceError::format(&self.path, e.to_string()))?;
                cast.as_any().downcast_ref::<UInt64Array>().cloned()
            }
            None => None,
        };

        for row in 0..batch.num_rows() {
            let ordinal = self.ordinal + row as u64;
            if splits.as_ref().is_some_and(|s| s.is_valid(row) && s.value(row) != self.split) {
                continue;
            }
            if texts.is_null(row) {
                return Err(SourceError::format(
                    &self.path,
                    format!("row {ordinal}: null text"),
                ));
            }
            let id = match &ids {
                Some(col) if col.is_valid(row) => col.value(row),
                Some(_) => {
                    return Err(SourceError::format(
                        &self.path,
                        format!("row {ordinal}: id is null or not a non-negative integer"),
                    ));
                }
                None => ordinal,
            };
            self.ids.check(id, &self.path)?;
            self.buffer.push_back(Record {
                id,
                text: texts.value(row).to_string(),
                pair_text: opt_text(pairs.as_ref(), row),
                label: opt_text(labels.as_ref(), row),
            });
        }
        self.ordinal += batch.num_rows() as u64;
        Ok(())
    }
}

impl Iterator for ParquetRecords {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffer.pop_front() {
                return Some(Ok(record));
            }
            if self.done {
                return None;
            }
            let step = match self.reader.next()? {
                Ok(batch) => self.decode(&batch),
                Err(e) => Err(SourceError::format(&self.path, e.to_string())),
            };
            if let Err(e) = step {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

struct JsonlRecords {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    peeked: Option<String>,
    columns: ColumnMap,
    split: String,
    ordinal: u64,
    ids: IdGuard,
    done: bool,
}

fn json_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl JsonlRecords {
    fn open(path: &Path, map: &ColumnMap, split: &str) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(|e| SourceError::io(path, e))?;
        let mut lines = BufReader::new(file).lines();

        // Validate the shape on the first row so a bad file fails before any batch.
        let mut peeked = None;
        for line in lines.by_ref() {
            let line = line.map_err(|e| SourceError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(&line)
                .map_err(|e| SourceError::format(path, format!("row 0: {e}")))?;
            if value.get(&map.text).is_none() {
                return Err(SourceError::format(
                    path,
                    format!("missing text column `{}`", map.text),
                ));
            }
            if let Some(id) = &map.id {
                if value.get(id).is_none() {
                    return Err(SourceError::format(path, format!("missing id column `{id}`")));
                }
            }
            peeked = Some(line);
            break;
        }

        Ok(Self {
            path: path.to_path_buf(),
            lines,
            peeked,
            columns: map.clone(),
            split: split.to_string(),
            ordinal: 0,
            ids: IdGuard::default(),
            done: false,
        })
    }

    fn next_line(&mut self) -> Option<Result<String, SourceError>> {
        if let Some(line) = self.peeked.take() {
            return Some(Ok(line));
        }
        for line in self.lines.by_ref() {
            match line {
                Ok(l) if l.trim().is_empty() => continue,
                Ok(l) => return Some(Ok(l)),
                Err(e) => return Some(Err(SourceError::io(&self.path, e))),
            }
        }
        None
    }

    /// `Ok(None)` for rows of another split.
    fn parse(&mut self, line: &str, ordinal: u64) -> Result<Option<Record>, SourceError> {
        let row: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| SourceError::format(&self.path, format!("row {ordinal}: {e}")))?;
        let field = |name: &str| row.get(name).and_then(json_text);

        if let Some(split) = field(&self.columns.split) {
            if split != self.split {
                return Ok(None);
            }
        }
        let text = field(&self.columns.text).ok_or_else(|| {
            SourceError::format(&self.path, format!("row {ordinal}: missing or null text"))
        })?;
        let id = match &self.columns.id {
            Some(name) => {
                let value = row.get(name.as_str());
                value
                    .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
                    .ok_or_else(|| {
                        SourceError::format(
                            &self.path,
                            format!("row {ordinal}: id is missing or not a non-negative integer"),
                        )
                    })?
            }
            None => ordinal,
        };
        self.ids.check(id, &self.path)?;

        Ok(Some(Record {
            id,
            text,
            pair_text: self.columns.pair.as_deref().and_then(field),
            label: self.columns.label.as_deref().and_then(field),
        }))
    }
}

impl Iterator for JsonlRecords {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.next_line()? {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let ordinal = self.ordinal;
            self.ordinal += 1;
            match self.parse(&line, ordinal) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        None
    }
}
