//! Per-record state ledger for one run

use std::fmt;

use annoline_store::AnnotationStatus;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    InFlight,
    Success,
    Failed,
    Skipped,
}

impl RecordState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }
}

impl From<AnnotationStatus> for RecordState {
    fn from(status: AnnotationStatus) -> Self {
        match status {
            AnnotationStatus::Success => Self::Success,
            AnnotationStatus::Failed => Self::Failed,
            AnnotationStatus::Skipped => Self::Skipped,
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("record {0} appears more than once")]
    DuplicateId(u64),
    #[error("record {0} is not part of this run")]
    UnknownId(u64),
    #[error("record {id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        id: u64,
        from: RecordState,
        to: RecordState,
    },
}

/// Tallies of terminal states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StateCounts {
    pub fn terminal(&self) -> usize {
        self.success + self.failed + self.skipped
    }
}

/// Tracks every record of a run through
/// `Pending -> InFlight -> {Success, Failed, Skipped}`.
#[derive(Debug, Default)]
pub struct Ledger {
    states: FxHashMap<u64, RecordState>,
}

impl Ledger {
    /// All ids start Pending. Duplicate ids are rejected.
    pub fn new(ids: impl IntoIterator<Item = u64>) -> Result<Self, LedgerError> {
        let mut states = FxHashMap::default();
        for id in ids {
            if states.insert(id, RecordState::Pending).is_some() {
                return Err(LedgerError::DuplicateId(id));
            }
        }
        Ok(Self { states })
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, id: u64) -> Option<RecordState> {
        self.states.get(&id).copied()
    }

    fn transition(
        &mut self,
        id: u64,
        to: RecordState,
        allowed: impl Fn(RecordState) -> bool,
    ) -> Result<(), LedgerError> {
        let state = self.states.get_mut(&id).ok_or(LedgerError::UnknownId(id))?;
        if !allowed(*state) {
            return Err(LedgerError::IllegalTransition {
                id,
                from: *state,
                to,
            });
        }
        *state = to;
        Ok(())
    }

    /// Pending -> InFlight, when the record's batch starts.
    pub fn begin(&mut self, id: u64) -> Result<(), LedgerError> {
        self.transition(id, RecordState::InFlight, |s| s == RecordState::Pending)
    }

    /// InFlight -> terminal. Skipped is also reachable from Pending.
    pub fn resolve(&mut self, id: u64, status: AnnotationStatus) -> Result<(), LedgerError> {
        let to = RecordState::from(status);
        self.transition(id, to, |s| {
            s == RecordState::InFlight || (s == RecordState::Pending && to == RecordState::Skipped)
        })
    }

    pub fn counts(&self) -> StateCounts {
        let mut c = StateCounts::default();
        for state in self.states.values() {
            match state {
                RecordState::Pending => c.pending += 1,
                RecordState::InFlight => c.in_flight += 1,
                RecordState::Success => c.success += 1,
                RecordState::Failed => c.failed += 1,
                RecordState::Skipped => c.skipped += 1,
            }
        }
        c
    }

    pub fn all_terminal(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }
}
