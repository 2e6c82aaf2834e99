//! Arrow schema of result parts, plus writer-side accumulator and reader

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use annoline_core::Accumulator;
use anyhow::{Context, Result, anyhow};
use arrow::array::{
    Array, RecordBatch, StringArray, StringBuilder, TimestampMillisecondArray,
    TimestampMillisecondBuilder, UInt32Array, UInt32Builder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use parquet::arrow::ProjectionMask;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

use crate::model::{AnnotationResult, AnnotationStatus, Failure, Record, annotation_id};

pub static RESULT_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    Arc::new(Schema::new(vec![
        Field::new("annotation_id", DataType::Utf8, false),
        Field::new("run_id", DataType::Utf8, false),
        Field::new("dataset_key", DataType::Utf8, false),
        Field::new("record_id", DataType::UInt64, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("pair_text", DataType::Utf8, true),
        Field::new("label", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, false),
        Field::new("payload", DataType::Utf8, true),
        Field::new("pair_payload", DataType::Utf8, true),
        Field::new("error_kind", DataType::Utf8, true),
        Field::new("error_message", DataType::Utf8, true),
        Field::new("attempt_count", DataType::UInt32, false),
        Field::new(
            "completed_at",
            DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ),
        Field::new("system_prompt", DataType::Utf8, false),
        Field::new("prompt", DataType::Utf8, true),
        Field::new("pair_prompt", DataType::Utf8, true),
    ]))
});

/// Column builders for one run's results.
pub struct ResultAccumulator {
    run_id: String,
    dataset_key: String,
    system_prompt: String,
    annotation_ids: StringBuilder,
    run_ids: StringBuilder,
    dataset_keys: StringBuilder,
    record_ids: UInt64Builder,
    texts: StringBuilder,
    pair_texts: StringBuilder,
    labels: StringBuilder,
    statuses: StringBuilder,
    payloads: StringBuilder,
    pair_payloads: StringBuilder,
    error_kinds: StringBuilder,
    error_messages: StringBuilder,
    attempts: UInt32Builder,
    completed: TimestampMillisecondBuilder,
    system_prompts: StringBuilder,
    prompts: StringBuilder,
    pair_prompts: StringBuilder,
    len: usize,
}

impl ResultAccumulator {
    pub fn new(run_id: &str, dataset_key: &str, system_prompt: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            dataset_key: dataset_key.to_string(),
            system_prompt: system_prompt.to_string(),
            annotation_ids: StringBuilder::new(),
            run_ids: StringBuilder::new(),
            dataset_keys: StringBuilder::new(),
            record_ids: UInt64Builder::new(),
            texts: StringBuilder::new(),
            pair_texts: StringBuilder::new(),
            labels: StringBuilder::new(),
            statuses: StringBuilder::new(),
            payloads: StringBuilder::new(),
            pair_payloads: StringBuilder::new(),
            error_kinds: StringBuilder::new(),
            error_messages: StringBuilder::new(),
            attempts: UInt32Builder::new(),
            completed: TimestampMillisecondBuilder::new().with_timezone("UTC"),
            system_prompts: StringBuilder::new(),
            prompts: StringBuilder::new(),
            pair_prompts: StringBuilder::new(),
            len: 0,
        }
    }
}

impl Accumulator for ResultAccumulator {
    type Row = AnnotationResult;

    fn push(&mut self, row: AnnotationResult) {
        self.annotation_ids
            .append_value(annotation_id(&self.run_id, row.record.id));
        self.run_ids.append_value(&self.run_id);
        self.dataset_keys.append_value(&self.dataset_key);
        self.record_ids.append_value(row.record.id);
        self.texts.append_value(&row.record.text);
        self.pair_texts.append_option(row.record.pair_text.as_deref());
        self.labels.append_option(row.record.label.as_deref());
        self.statuses.append_value(row.status.as_str());
        self.payloads.append_option(row.payload.as_deref());
        self.pair_payloads.append_option(row.pair_payload.as_deref());
        self.error_kinds
            .append_option(row.error.as_ref().map(|e| e.kind.as_str()));
        self.error_messages
            .append_option(row.error.as_ref().map(|e| e.message.as_str()));
        self.attempts.append_value(row.attempt_count);
        self.completed.append_value(row.completed_at.timestamp_millis());
        self.system_prompts.append_value(&self.system_prompt);
        self.prompts.append_option(row.prompt.as_deref());
        self.pair_prompts.append_option(row.pair_prompt.as_deref());
        self.len += 1;
    }

    fn len(&self) -> usize {
        self.len
    }

    fn take_batch(&mut self) -> Result<RecordBatch, ArrowError> {
        self.len = 0;
        RecordBatch::try_new(
            RESULT_SCHEMA.clone(),
            vec![
                Arc::new(self.annotation_ids.finish()),
                Arc::new(self.run_ids.finish()),
                Arc::new(self.dataset_keys.finish()),
                Arc::new(self.record_ids.finish()),
                Arc::new(self.texts.finish()),
                Arc::new(self.pair_texts.finish()),
                Arc::new(self.labels.finish()),
                Arc::new(self.statuses.finish()),
                Arc::new(self.payloads.finish()),
                Arc::new(self.pair_payloads.finish()),
                Arc::new(self.error_kinds.finish()),
                Arc::new(self.error_messages.finish()),
                Arc::new(self.attempts.finish()),
                Arc::new(self.completed.finish()),
                Arc::new(self.system_prompts.finish()),
                Arc::new(self.prompts.finish()),
                Arc::new(self.pair_prompts.finish()),
            ],
        )
    }
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .ok_or_else(|| anyhow!("result part is missing column `{name}`"))?
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("result column `{name}` has unexpected type"))
}

fn opt_str(col: &StringArray, i: usize) -> Option<String> {
    col.is_valid(i).then(|| col.value(i).to_string())
}

fn open_reader(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("invalid parquet file {}", path.display()))
}

/// Read every result in a part, in stored order.
pub fn read_results(path: &Path) -> Result<Vec<AnnotationResult>> {
    let reader = open_reader(path)?.build()?;
    let mut out = Vec::new();

    for batch in reader {
        let batch = batch.with_context(|| format!("failed to decode {}", path.display()))?;
        let ids = column::<UInt64Array>(&batch, "record_id")?;
        let texts = column::<StringArray>(&batch, "text")?;
        let pair_texts = column::<StringArray>(&batch, "pair_text")?;
        let labels = column::<StringArray>(&batch, "label")?;
        let statuses = column::<StringArray>(&batch, "status")?;
        let payloads = column::<StringArray>(&batch, "payload")?;
        let pair_payloads = column::<StringArray>(&batch, "pair_payload")?;
        let kinds = column::<StringArray>(&batch, "error_kind")?;
        let messages = column::<StringArray>(&batch, "error_message")?;
        let attempts = column::<UInt32Array>(&batch, "attempt_count")?;
        let completed = column::<TimestampMillisecondArray>(&batch, "completed_at")?;
        let prompts = column::<StringArray>(&batch, "prompt")?;
        let pair_prompts = column::<StringArray>(&batch, "pair_prompt")?;

        for i in 0..batch.num_rows() {
            let status: AnnotationStatus = statuses.value(i).parse().map_err(|e| anyhow!("{e}"))?;
            let error = match opt_str(kinds, i) {
                Some(kind) => Some(Failure {
                    kind: kind.parse().map_err(|e| anyhow!("{e}"))?,
                    message: opt_str(messages, i).unwrap_or_default(),
                }),
                None => None,
            };
            let completed_at = chrono::DateTime::from_timestamp_millis(completed.value(i))
                .ok_or_else(|| anyhow!("completed_at out of range in {}", path.display()))?;

            out.push(AnnotationResult {
                record: Record {
                    id: ids.value(i),
                    text: texts.value(i).to_string(),
                    pair_text: opt_str(pair_texts, i),
                    label: opt_str(labels, i),
                },
                status,
                payload: opt_str(payloads, i),
                pair_payload: opt_str(pair_payloads, i),
                error,
                attempt_count: attempts.value(i),
                completed_at,
                prompt: opt_str(prompts, i),
                pair_prompt: opt_str(pair_prompts, i),
            });
        }
    }

    Ok(out)
}

/// `(record_id, status)` pairs only, for resumption scans.
pub fn read_statuses(path: &Path) -> Result<Vec<(u64, AnnotationStatus)>> {
    let builder = open_reader(path)?;
    let schema = builder.schema().clone();
    let indices = [schema.index_of("record_id")?, schema.index_of("status")?];
    let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
    let reader = builder.with_projection(mask).build()?;

    let mut out = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("failed to decode {}", path.display()))?;
        let ids = column::<UInt64Array>(&batch, "record_id")?;
        let statuses = column::<StringArray>(&batch, "status")?;
        for i in 0..batch.num_rows() {
            let status = statuses.value(i).parse().map_err(|e| anyhow!("{e}"))?;
            out.push((ids.value(i), status));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailureKind;
    use annoline_core::sink::{DEFAULT_ZSTD_LEVEL, ParquetSink};
    use annoline_core::write_rows;

    fn sample() -> Vec<AnnotationResult> {
        vec![
            AnnotationResult::success(
                Record::new(0, "A man is smiling.")
                    .with_pair("Someone is happy.")
                    .with_label("entailment"),
                "(smiling man)".into(),
                Some("(happy someone)".into()),
                1,
            )
            .with_prompts(
                Some("premise prompt".into()),
                Some("hypothesis prompt".into()),
            ),
            AnnotationResult::failed(
                Record::new(1, "Kids play."),
                Failure::new(FailureKind::Malformed, "empty expression"),
                4,
            ),
            AnnotationResult::skipped(Record::new(2, "Dogs bark."), FailureKind::Cancelled, "SIGINT"),
        ]
    }

    fn write(path: &Path, rows: Vec<AnnotationResult>) {
        let mut acc = ResultAccumulator::new("run-1", "snli-0000", "guideline");
        let mut sink = ParquetSink::create(path, RESULT_SCHEMA.clone(), DEFAULT_ZSTD_LEVEL).unwrap();
        write_rows(&mut acc, rows, &mut sink).unwrap();
        sink.finalize().unwrap();
    }

    #[test]
    fn batch_matches_schema() {
        let mut acc = ResultAccumulator::new("run-1", "snli-0000", "guideline");
        for row in sample() {
            acc.push(row);
        }
        assert_eq!(acc.len(), 3);
        let batch = acc.take_batch().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.schema(), RESULT_SCHEMA.clone());
        assert!(acc.is_empty());
    }

    #[test]
    fn parquet_part_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part_00000.parquet");
        let rows = sample();
        write(&path, rows.clone());

        let back = read_results(&path).unwrap();
        assert_eq!(back.len(), rows.len());
        for (a, b) in back.iter().zip(&rows) {
            assert_eq!(a.record, b.record);
            assert_eq!(a.status, b.status);
            assert_eq!(a.payload, b.payload);
            assert_eq!(a.pair_payload, b.pair_payload);
            assert_eq!(a.error, b.error);
            assert_eq!(a.attempt_count, b.attempt_count);
            assert_eq!(a.completed_at.timestamp_millis(), b.completed_at.timestamp_millis());
            assert_eq!(a.prompt, b.prompt);
            assert_eq!(a.pair_prompt, b.pair_prompt);
        }
    }

    #[test]
    fn rows_carry_annotation_id_and_system_prompt() {
        let mut acc = ResultAccumulator::new("run-1", "snli-0000", "guideline");
        for row in sample() {
            acc.push(row);
        }
        let batch = acc.take_batch().unwrap();
        let ids = column::<StringArray>(&batch, "annotation_id").unwrap();
        let system = column::<StringArray>(&batch, "system_prompt").unwrap();
        let prompts = column::<StringArray>(&batch, "prompt").unwrap();
        assert_eq!(ids.value(0), annotation_id("run-1", 0));
        assert_eq!(ids.value(2), annotation_id("run-1", 2));
        assert!((0..3).all(|i| system.value(i) == "guideline"));
        assert_eq!(prompts.value(0), "premise prompt");
        assert!(prompts.is_null(1));
    }

    #[test]
    fn statuses_projection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part_00000.parquet");
        write(&path, sample());
        assert_eq!(
            read_statuses(&path).unwrap(),
            vec![
                (0, AnnotationStatus::Success),
                (1, AnnotationStatus::Failed),
                (2, AnnotationStatus::Skipped),
            ]
        );
    }

    #[test]
    fn reading_non_parquet_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.parquet");
        std::fs::write(&path, b"nope").unwrap();
        assert!(read_results(&path).is_err());
    }
}
