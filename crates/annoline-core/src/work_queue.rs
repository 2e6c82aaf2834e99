//! Lock-free work queue for distributing a batch's records across workers

use std::sync::atomic::{AtomicUsize, Ordering};

/// Lock-free work queue.
///
/// Workers call [`claim()`](WorkQueue::claim) to atomically take the next
/// item together with its position, so results can be put back in input
/// order regardless of completion order.
pub struct WorkQueue<S> {
    items: Vec<S>,
    cursor: AtomicUsize,
}

impl<S> WorkQueue<S> {
    pub fn new(items: Vec<S>) -> Self {
        Self {
            items,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Claim the next item (lock-free).
    pub fn claim(&self) -> Option<(usize, &S)> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.items.get(i).map(|item| (i, item))
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    /// Number of items no worker has claimed yet.
    pub fn remaining(&self) -> usize {
        self.items
            .len()
            .saturating_sub(self.cursor.load(Ordering::Relaxed))
    }

    /// Items never handed to a worker, with their positions.
    ///
    /// Call once all workers have stopped.
    pub fn unclaimed(&self) -> impl Iterator<Item = (usize, &S)> {
        let start = self.cursor.load(Ordering::Relaxed).min(self.items.len());
        self.items[start..]
            .iter()
            .enumerate()
            .map(move |(i, item)| (start + i, item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_in_order_with_positions() {
        let q = WorkQueue::new(vec!['a', 'b', 'c']);
        assert_eq!(q.total(), 3);
        assert_eq!(q.claim(), Some((0, &'a')));
        assert_eq!(q.claim(), Some((1, &'b')));
        assert_eq!(q.claim(), Some((2, &'c')));
        assert_eq!(q.claim(), None);
    }

    #[test]
    fn remaining_never_underflows() {
        let q = WorkQueue::new(vec![1]);
        assert_eq!(q.remaining(), 1);
        q.claim();
        q.claim();
        q.claim();
        assert_eq!(q.remaining(), 0);
        assert_eq!(q.unclaimed().count(), 0);
    }

    #[test]
    fn unclaimed_after_partial_drain() {
        let q = WorkQueue::new(vec![10, 20, 30, 40]);
        q.claim();
        let rest: Vec<_> = q.unclaimed().collect();
        assert_eq!(rest, vec![(1, &20), (2, &30), (3, &40)]);
    }

    #[test]
    fn empty_queue() {
        let q: WorkQueue<i32> = WorkQueue::new(vec![]);
        assert_eq!(q.total(), 0);
        assert_eq!(q.claim(), None);
    }

    #[test]
    fn concurrent_claims_are_disjoint() {
        let q = WorkQueue::new((0..1000).collect::<Vec<u32>>());
        let seen = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while let Some((pos, _)) = q.claim() {
                        seen.lock().unwrap().push(pos);
                    }
                });
            }
        });
        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<usize>>());
    }
}
