//! Annoline Annotate - batch language-model annotation of sentence datasets
//!
//! Reads records from a [`RecordSource`], groups them into batches, asks a
//! [`LanguageModel`] backend for an expression per record through the
//! [`AnnotationClient`], and persists every outcome into a
//! [`ResultStore`](annoline_store::ResultStore) under run-level provenance.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use annoline_annotate::{
//!     AnnotationClient, ColumnMap, FileSource, OllamaBackend, RunConfig, RunCoordinator,
//!     prompt,
//! };
//! use annoline_core::{CancelFlag, HttpConfig};
//! use annoline_store::ResultStore;
//!
//! let config = RunConfig::default();
//! let source = FileSource::new(config.dataset_id(), "./data/raw", ColumnMap::default());
//! let backend = OllamaBackend::new("http://localhost:11434", &HttpConfig::default()).unwrap();
//! let client = AnnotationClient::new(Arc::new(backend), prompt::DEFAULT_GUIDELINE);
//! let store = ResultStore::open("./data/annotations".as_ref()).unwrap();
//!
//! let report = RunCoordinator::new(&source, client, &store, config.settings())
//!     .run(&CancelFlag::new())
//!     .expect("run failed");
//! println!("{} of {} records annotated", report.success, report.total);
//! ```

pub mod backend;
pub mod batch;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod hub;
pub mod prompt;
pub mod source;
pub mod state;

pub use backend::{
    BackendError, BackendKind, ChatRequest, LanguageModel, OllamaBackend, OpenAiBackend,
};
pub use batch::{Batch, BatchError, Batches, batch};
pub use client::{Annotation, AnnotationClient, AnnotationError};
pub use config::{ConfigError, RunConfig, RunSettings};
pub use coordinator::{RunCoordinator, RunError, RunReport};
pub use hub::HubFetch;
pub use source::{ColumnMap, FileSource, MemorySource, RecordSource, RecordStream, SourceError};
pub use state::{Ledger, LedgerError, RecordState};
