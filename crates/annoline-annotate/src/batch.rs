//! Fixed-size, order-preserving batching

use annoline_store::Record;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("invalid batch size {0}: must be at least 1")]
    InvalidBatchSize(usize),
}

/// A contiguous slice of the input sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T = Record> {
    /// 0-based batch number.
    pub index: usize,
    /// Position of the first item in the full sequence.
    pub offset: usize,
    pub records: Vec<T>,
}

impl<T> Batch<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub fn validate_size(size: usize) -> Result<(), BatchError> {
    if size == 0 {
        return Err(BatchError::InvalidBatchSize(size));
    }
    Ok(())
}

/// Lazy batches over `items`; every batch but the last holds exactly `size` items.
pub fn batch<I: IntoIterator>(items: I, size: usize) -> Result<Batches<I::IntoIter>, BatchError> {
    validate_size(size)?;
    Ok(Batches {
        inner: items.into_iter(),
        size,
        next_index: 0,
        offset: 0,
    })
}

pub struct Batches<I> {
    inner: I,
    size: usize,
    next_index: usize,
    offset: usize,
}

impl<I: Iterator> Batches<I> {
    /// Advance past the next `k` batches without yielding them.
    /// Returns how many were actually skipped.
    pub fn skip_batches(&mut self, k: usize) -> usize {
        let mut skipped = 0;
        while skipped < k {
            let mut taken = 0;
            while taken < self.size && self.inner.next().is_some() {
                taken += 1;
            }
            if taken == 0 {
                break;
            }
            self.offset += taken;
            self.next_index += 1;
            skipped += 1;
        }
        skipped
    }

    pub fn batch_size(&self) -> usize {
        self.size
    }
}

impl<I: Iterator> Iterator for Batches<I> {
    type Item = Batch<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let records: Vec<I::Item> = self.inner.by_ref().take(self.size).collect();
        if records.is_empty() {
            return None;
        }
        let batch = Batch {
            index: self.next_index,
            offset: self.offset,
            records,
        };
        self.next_index += 1;
        self.offset += batch.len();
        Some(batch)
    }
}

/// `ceil(n / size)`
pub fn batch_count(n: usize, size: usize) -> usize {
    if size == 0 { 0 } else { n.div_ceil(size) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_rejected() {
        assert_eq!(
            batch(0..5, 0).err(),
            Some(BatchError::InvalidBatchSize(0))
        );
    }

    #[test]
    fn twenty_five_by_ten() {
        let sizes: Vec<usize> = batch(0..25, 10).unwrap().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(batch_count(25, 10), 3);
    }

    #[test]
    fn concatenation_equals_input() {
        for size in 1..=7 {
            let input: Vec<u32> = (0..23).collect();
            let batches: Vec<_> = batch(input.clone(), size).unwrap().collect();
            assert_eq!(batches.len(), batch_count(input.len(), size));
            let flat: Vec<u32> = batches.iter().flat_map(|b| b.records.clone()).collect();
            assert_eq!(flat, input);
            assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= size));
        }
    }

    #[test]
    fn indices_and_offsets() {
        let batches: Vec<_> = batch(0..7, 3).unwrap().collect();
        let meta: Vec<(usize, usize)> = batches.iter().map(|b| (b.index, b.offset)).collect();
        assert_eq!(meta, vec![(0, 0), (1, 3), (2, 6)]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(batch(Vec::<u8>::new(), 4).unwrap().count(), 0);
    }

    #[test]
    fn skip_batches_resumes_at_k() {
        let mut batches = batch(0..25, 10).unwrap();
        assert_eq!(batches.skip_batches(2), 2);
        let last = batches.next().unwrap();
        assert_eq!((last.index, last.offset), (2, 20));
        assert_eq!(last.records, vec![20, 21, 22, 23, 24]);
        assert!(batches.next().is_none());
    }

    #[test]
    fn skip_past_end_is_bounded() {
        let mut batches = batch(0..5, 2).unwrap();
        assert_eq!(batches.skip_batches(10), 3);
        assert!(batches.next().is_none());
    }

    #[test]
    fn deterministic_for_same_input() {
        let a: Vec<_> = batch(0..13, 4).unwrap().collect();
        let b: Vec<_> = batch(0..13, 4).unwrap().collect();
        assert_eq!(a, b);
    }
}
