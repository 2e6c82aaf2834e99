//! Annoline Core - shared infrastructure for annotation runs
//!
//! Logging, progress bars, cancellation, retry/backoff, the blocking HTTP
//! facade and the atomic Parquet writer used by the other crates.

pub mod accumulator;
pub mod cancel;
pub mod http;
pub mod logging;
pub mod progress;
pub mod retry;
pub mod sink;
pub mod work_queue;

// Re-exports for convenience
pub use accumulator::{Accumulator, write_rows};
pub use cancel::{CancelFlag, CancelReason};
pub use http::{HttpConfig, HttpError, SHARED_RUNTIME, block_on, build_client};
pub use logging::{IndicatifLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num, fmt_pct};
pub use retry::{RetryMode, RetryOutcome, RetryPolicy, Retryable, retry_with_backoff};
pub use sink::{ParquetSink, cleanup_tmp_files, is_valid_parquet, write_parquet};
pub use work_queue::WorkQueue;
