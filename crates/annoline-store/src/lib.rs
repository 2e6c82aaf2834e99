//! annoline-store: persistent, resumable storage for annotation runs
//!
//! Results are written as zstd Parquet parts under a per-dataset directory,
//! one part per finished batch, with run metadata in `run.json` and blake3
//! content hashes in `manifest.json`.

pub mod hash;
pub mod manifest;
pub mod model;
pub mod schema;
pub mod store;

pub use hash::{hash_bytes, hash_file, short_hash, text_digest};
pub use manifest::RunManifest;
pub use model::{
    AnnotationResult, AnnotationStatus, DatasetId, Failure, FailureKind, Provenance, Record,
    RunMetadata, RunOutcome, annotation_id,
};
pub use store::{ResultStore, ResumePolicy, RunWriter, StoredRun, StoredRunHandle, VerifyResult};
