//! Row accumulator trait for building Arrow `RecordBatch`es

use arrow::array::RecordBatch;
use arrow::error::ArrowError;

use crate::sink::ParquetSink;

/// Rows buffered before a flush.
pub const DEFAULT_FLUSH_ROWS: usize = 8192;

/// Column-wise buffer of typed rows.
pub trait Accumulator {
    type Row;

    fn push(&mut self, row: Self::Row);

    /// Number of rows currently buffered
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_full(&self) -> bool {
        self.len() >= DEFAULT_FLUSH_ROWS
    }

    /// Take buffered rows as a RecordBatch, resetting internal state
    fn take_batch(&mut self) -> Result<RecordBatch, ArrowError>;
}

/// Push every row into `acc`, flushing full batches to `sink`, then flush the rest.
pub fn write_rows<A: Accumulator>(
    acc: &mut A,
    rows: impl IntoIterator<Item = A::Row>,
    sink: &mut ParquetSink,
) -> std::io::Result<usize> {
    let mut written = 0;
    for row in rows {
        acc.push(row);
        if acc.is_full() {
            written += flush(acc, sink)?;
        }
    }
    if !acc.is_empty() {
        written += flush(acc, sink)?;
    }
    Ok(written)
}

fn flush<A: Accumulator>(acc: &mut A, sink: &mut ParquetSink) -> std::io::Result<usize> {
    let batch = acc.take_batch().map_err(std::io::Error::other)?;
    sink.write_batch(&batch)?;
    Ok(batch.num_rows())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow::array::UInt64Array;
    use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

    struct Ids {
        schema: SchemaRef,
        buf: Vec<u64>,
    }

    impl Ids {
        fn new() -> Self {
            Self {
                schema: Arc::new(Schema::new(vec![Field::new("id", DataType::UInt64, false)])),
                buf: Vec::new(),
            }
        }
    }

    impl Accumulator for Ids {
        type Row = u64;

        fn push(&mut self, row: u64) {
            self.buf.push(row);
        }

        fn len(&self) -> usize {
            self.buf.len()
        }

        fn take_batch(&mut self) -> Result<RecordBatch, ArrowError> {
            let ids = UInt64Array::from(std::mem::take(&mut self.buf));
            RecordBatch::try_new(self.schema.clone(), vec![Arc::new(ids)])
        }
    }

    #[test]
    fn write_rows_flushes_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ids.parquet");
        let mut acc = Ids::new();
        let mut sink = ParquetSink::create(&path, acc.schema.clone(), 3).unwrap();

        let n = DEFAULT_FLUSH_ROWS as u64 + 5;
        assert_eq!(write_rows(&mut acc, 0..n, &mut sink).unwrap(), n as usize);
        assert!(acc.is_empty());
        assert_eq!(sink.finalize().unwrap(), n as usize);
    }
}
