//! AnnotationClient: prompt, call, extract

use std::sync::Arc;

use annoline_core::{RetryMode, Retryable};
use annoline_store::{FailureKind, Record};

use crate::backend::{BackendError, ChatRequest, LanguageModel};
use crate::batch::Batch;
use crate::prompt::{self, ExtractError};

/// Expressions generated for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub payload: String,
    pub pair_payload: Option<String>,
    /// User prompts actually sent, kept as per-row provenance.
    pub prompt: String,
    pub pair_prompt: Option<String>,
}

/// Per-record failure taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnotationError {
    /// Connection failure, timeout, 429 or 5xx.
    #[error("transient backend error: {0}")]
    TransientBackend(String),
    /// Undecodable body or no usable expression.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// Backend refused this particular request.
    #[error("rejected by backend: {0}")]
    Rejected(String),
    /// Model unavailable or caller unauthorized; nothing else will succeed either.
    #[error("fatal backend error: {0}")]
    FatalBackend(String),
}

impl AnnotationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::TransientBackend(_) => FailureKind::Transient,
            Self::MalformedResponse(_) => FailureKind::Malformed,
            Self::Rejected(_) => FailureKind::Rejected,
            Self::FatalBackend(_) => FailureKind::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalBackend(_))
    }
}

impl Retryable for AnnotationError {
    fn retry_mode(&self) -> RetryMode {
        match self {
            Self::TransientBackend(_) => RetryMode::Backoff,
            Self::MalformedResponse(_) => RetryMode::Immediate,
            Self::Rejected(_) | Self::FatalBackend(_) => RetryMode::Never,
        }
    }
}

/// Map an HTTP status to the failure taxonomy.
pub fn classify_status(status: u16, detail: String) -> AnnotationError {
    match status {
        401 | 403 | 404 => AnnotationError::FatalBackend(format!("HTTP {status}: {detail}")),
        429 | 500..=599 => AnnotationError::TransientBackend(format!("HTTP {status}: {detail}")),
        _ => AnnotationError::Rejected(format!("HTTP {status}: {detail}")),
    }
}

impl From<BackendError> for AnnotationError {
    fn from(e: BackendError) -> Self {
        use annoline_core::HttpError;
        match e {
            BackendError::Http(HttpError::Status { status, body }) => classify_status(status, body),
            BackendError::Http(HttpError::Decode(msg)) | BackendError::Decode(msg) => {
                Self::MalformedResponse(msg)
            }
            BackendError::Http(HttpError::Build(msg)) | BackendError::Unavailable(msg) => {
                Self::FatalBackend(msg)
            }
            BackendError::Http(other) if other.is_transient() => {
                Self::TransientBackend(other.to_string())
            }
            BackendError::Http(other) => Self::Rejected(other.to_string()),
        }
    }
}

impl From<ExtractError> for AnnotationError {
    fn from(e: ExtractError) -> Self {
        Self::MalformedResponse(e.to_string())
    }
}

/// Outcome for one record of [`AnnotationClient::annotate`]; `None` when the
/// record was not attempted because an earlier one failed fatally.
pub type BatchOutcome = (u64, Option<Result<Annotation, AnnotationError>>);

/// Sends records to a [`LanguageModel`] under a fixed guideline.
#[derive(Clone)]
pub struct AnnotationClient {
    backend: Arc<dyn LanguageModel>,
    guideline: Arc<str>,
}

impl AnnotationClient {
    pub fn new(backend: Arc<dyn LanguageModel>, guideline: impl Into<Arc<str>>) -> Self {
        Self {
            backend,
            guideline: guideline.into(),
        }
    }

    pub fn guideline(&self) -> &str {
        &self.guideline
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// User prompt for the first sentence of `record`.
    pub fn prompt_for(&self, record: &Record) -> String {
        prompt::user_prompt(&record.text, None)
    }

    fn generate(&self, user: &str, model: &str) -> Result<String, AnnotationError> {
        let content = self.backend.complete(&ChatRequest {
            model,
            system: &self.guideline,
            user,
        })?;
        log::debug!("{model} response: {content:?}");
        Ok(prompt::extract_expression(content.as_deref())?)
    }

    /// One attempt at one record. For pairs, the second sentence is prompted
    /// with the first one's expression as context.
    pub fn annotate_record(
        &self,
        record: &Record,
        model: &str,
    ) -> Result<Annotation, AnnotationError> {
        let prompt = self.prompt_for(record);
        let payload = self.generate(&prompt, model)?;
        let (pair_payload, pair_prompt) = match &record.pair_text {
            Some(pair) => {
                let ctx = prompt::pair_context(&record.text, &payload, pair);
                let pair_prompt = prompt::user_prompt(pair, Some(&ctx));
                (Some(self.generate(&pair_prompt, model)?), Some(pair_prompt))
            }
            None => (None, None),
        };
        Ok(Annotation {
            payload,
            pair_payload,
            prompt,
            pair_prompt,
        })
    }

    /// Annotate a batch sequentially, single attempt per record, in record order.
    /// After a fatal error the remaining records are returned unattempted.
    pub fn annotate(&self, batch: &Batch, model: &str) -> Vec<BatchOutcome> {
        let mut out = Vec::with_capacity(batch.len());
        let mut fatal = false;
        for record in &batch.records {
            if fatal {
                out.push((record.id, None));
                continue;
            }
            let result = self.annotate_record(record, model);
            fatal = result.as_ref().is_err_and(AnnotationError::is_fatal);
            out.push((record.id, Some(result)));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replies from a fixed script, one entry per call.
    struct Scripted {
        replies: Mutex<Vec<Result<Option<String>, BackendError>>>,
        seen: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<Option<String>, BackendError>>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl LanguageModel for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn complete(&self, request: &ChatRequest<'_>) -> Result<Option<String>, BackendError> {
            self.seen.lock().unwrap().push(request.user.to_string());
            self.replies.lock().unwrap().pop().unwrap_or(Ok(None))
        }
    }

    fn status(code: u16) -> BackendError {
        BackendError::Http(annoline_core::HttpError::Status {
            status: code,
            body: "x".into(),
        })
    }

    #[test]
    fn status_classification() {
        assert!(matches!(AnnotationError::from(status(401)), AnnotationError::FatalBackend(_)));
        assert!(matches!(AnnotationError::from(status(404)), AnnotationError::FatalBackend(_)));
        assert!(matches!(AnnotationError::from(status(429)), AnnotationError::TransientBackend(_)));
        assert!(matches!(AnnotationError::from(status(502)), AnnotationError::TransientBackend(_)));
        assert!(matches!(AnnotationError::from(status(400)), AnnotationError::Rejected(_)));
        assert!(matches!(
            AnnotationError::from(BackendError::Http(annoline_core::HttpError::Timeout("t".into()))),
            AnnotationError::TransientBackend(_)
        ));
        assert!(matches!(
            AnnotationError::from(BackendError::Decode("eof".into())),
            AnnotationError::MalformedResponse(_)
        ));
    }

    #[test]
    fn retry_modes() {
        assert_eq!(AnnotationError::TransientBackend(String::new()).retry_mode(), RetryMode::Backoff);
        assert_eq!(AnnotationError::MalformedResponse(String::new()).retry_mode(), RetryMode::Immediate);
        assert_eq!(AnnotationError::Rejected(String::new()).retry_mode(), RetryMode::Never);
        assert_eq!(AnnotationError::FatalBackend(String::new()).retry_mode(), RetryMode::Never);
    }

    #[test]
    fn single_record_fence_stripped() {
        let backend = Arc::new(Scripted::new(vec![Ok(Some("```metta\n(barks dog)\n```".into()))]));
        let client = AnnotationClient::new(backend, "guide");
        let a = client.annotate_record(&Record::new(0, "A dog barks."), "m").unwrap();
        assert_eq!(a.payload, "(barks dog)");
        assert_eq!(a.pair_payload, None);
    }

    #[test]
    fn empty_content_is_malformed() {
        let backend = Arc::new(Scripted::new(vec![Ok(Some("```\n```".into())), Ok(None)]));
        let client = AnnotationClient::new(backend, "guide");
        let r = Record::new(0, "x");
        assert_eq!(client.annotate_record(&r, "m").unwrap_err().kind(), FailureKind::Malformed);
        assert_eq!(client.annotate_record(&r, "m").unwrap_err().kind(), FailureKind::Malformed);
    }

    #[test]
    fn pair_prompt_carries_premise_expression() {
        let backend = Arc::new(Scripted::new(vec![
            Ok(Some("(sleeps man)".into())),
            Ok(Some("(not (sleeps man))".into())),
        ]));
        let client = AnnotationClient::new(backend.clone(), "guide");
        let record = Record::new(0, "A man sleeps.").with_pair("A man is awake.");
        let a = client.annotate_record(&record, "m").unwrap();
        assert_eq!(a.pair_payload.as_deref(), Some("(not (sleeps man))"));

        let seen = backend.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].contains("(sleeps man)"));
        assert!(seen[1].contains("\"A man is awake.\""));
        assert_eq!(a.prompt, seen[0]);
        assert_eq!(a.pair_prompt.as_deref(), Some(seen[1].as_str()));
    }

    #[test]
    fn annotate_stops_after_fatal() {
        let backend = Arc::new(Scripted::new(vec![
            Ok(Some("(a)".into())),
            Err(status(401)),
            Ok(Some("(c)".into())),
        ]));
        let client = AnnotationClient::new(backend, "guide");
        let batch = Batch {
            index: 0,
            offset: 0,
            records: (0..3).map(|i| Record::new(i, format!("s{i}"))).collect(),
        };
        let out = client.annotate(&batch, "m");
        let ids: Vec<u64> = out.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(matches!(out[0].1, Some(Ok(_))));
        assert!(matches!(out[1].1, Some(Err(AnnotationError::FatalBackend(_)))));
        assert!(out[2].1.is_none());
    }
}
