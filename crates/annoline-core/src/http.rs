//! Blocking HTTP facade over async reqwest.
//!
//! Requests run on a shared tokio runtime so rayon workers can call them
//! synchronously.

use std::sync::LazyLock;
use std::time::Duration;

/// Shared tokio runtime for HTTP operations.
///
/// Panics on first use only if the OS refuses to spawn runtime threads.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("annoline-http")
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Run a future to completion on the shared runtime.
pub fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    SHARED_RUNTIME.handle().block_on(fut)
}

/// Client timeouts.
#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Whole-request timeout; generation on slow models can take minutes.
    pub request_timeout: Duration,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
            pool_max_idle_per_host: 8,
        }
    }
}

/// Build a pooled async client with the configured timeouts.
pub fn build_client(config: &HttpConfig) -> Result<reqwest::Client, HttpError> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(concat!("annoline/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| HttpError::Build(e.to_string()))
}

/// HTTP failure, classified for retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("failed to build HTTP client: {0}")]
    Build(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("undecodable response body: {0}")]
    Decode(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else if e.is_decode() || e.is_body() {
            Self::Decode(e.to_string())
        } else {
            Self::Connect(e.to_string())
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Connection trouble, timeouts, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Io(e) => e.kind() != std::io::ErrorKind::StorageFull,
            Self::Build(_) | Self::Decode(_) => false,
        }
    }
}

/// Read a response's status; on non-2xx, return its body (truncated) in the error.
pub async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HttpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > 512 {
        let mut cut = 512;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(HttpError::Status {
        status: status.as_u16(),
        body,
    })
}
