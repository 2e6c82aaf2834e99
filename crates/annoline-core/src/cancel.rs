//! Run cancellation via a shared atomic flag and optional deadline.
//!
//! Each run owns its own [`CancelFlag`]; SIGINT/SIGTERM can be wired to it
//! with [`CancelFlag::register_signals`].

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// External abort (signal or explicit `cancel()`).
    Requested,
    /// Run deadline elapsed.
    TimedOut,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("cancellation requested"),
            Self::TimedOut => f.write_str("run timeout elapsed"),
        }
    }
}

/// Cloneable cancellation handle shared between the coordinator and workers.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same flag, additionally cancelled once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Set SIGINT/SIGTERM to raise this flag.
    pub fn register_signals(&self) -> io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.flag))?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&self.flag))?;
        Ok(())
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// `Some(reason)` once the flag is raised or the deadline has passed.
    pub fn reason(&self) -> Option<CancelReason> {
        if self.flag.load(Ordering::Relaxed) {
            return Some(CancelReason::Requested);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(CancelReason::TimedOut),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_flag_not_cancelled() {
        let flag = CancelFlag::new();
        assert!(!flag.is_cancelled());
        assert_eq!(flag.reason(), None);
    }

    #[test]
    fn cancel_visible_through_clones() {
        let flag = CancelFlag::new();
        let worker_view = flag.clone();
        flag.cancel();
        assert_eq!(worker_view.reason(), Some(CancelReason::Requested));
    }

    #[test]
    fn zero_timeout_cancels_immediately() {
        let flag = CancelFlag::new().with_timeout(Duration::ZERO);
        assert_eq!(flag.reason(), Some(CancelReason::TimedOut));
    }

    #[test]
    fn explicit_cancel_wins_over_deadline() {
        let flag = CancelFlag::new().with_timeout(Duration::ZERO);
        flag.cancel();
        assert_eq!(flag.reason(), Some(CancelReason::Requested));
    }

    #[test]
    fn independent_flags_do_not_interfere() {
        let a = CancelFlag::new();
        let b = CancelFlag::new();
        a.cancel();
        assert!(!b.is_cancelled());
    }
}
