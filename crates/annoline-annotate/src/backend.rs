//! Language-model backends
//!
//! Both backends are chat-style request/response services reached over HTTP
//! through the shared runtime in `annoline_core::http`.

use std::fmt;
use std::str::FromStr;

use annoline_core::http::{self, HttpConfig, HttpError};
use serde::{Deserialize, Serialize};

pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://localhost:11434";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// One chat exchange: system guideline plus user prompt.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub user: &'a str,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("could not decode backend response: {0}")]
    Decode(String),
    #[error("backend not usable: {0}")]
    Unavailable(String),
}

/// Synchronous chat completion. `Ok(None)` means the backend answered without content.
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    fn complete(&self, request: &ChatRequest<'_>) -> Result<Option<String>, BackendError>;
}

/// Which backend family serves a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Ollama,
    OpenAi,
}

impl BackendKind {
    /// `gpt*` and `o1*` models go to OpenAI, everything else to Ollama.
    pub fn for_model(model: &str) -> Self {
        if model.starts_with("gpt") || model.starts_with("o1") {
            Self::OpenAi
        } else {
            Self::Ollama
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAi),
            other => Err(format!("unknown backend `{other}` (expected ollama or openai)")),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

fn messages<'a>(request: &ChatRequest<'a>) -> [ChatMessage<'a>; 2] {
    [
        ChatMessage {
            role: "system",
            content: request.system,
        },
        ChatMessage {
            role: "user",
            content: request.user,
        },
    ]
}

/// Ollama `/api/chat`, non-streaming.
pub struct OllamaBackend {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: Option<OllamaMessage>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: Option<String>,
}

impl OllamaBackend {
    pub fn new(endpoint: impl Into<String>, http: &HttpConfig) -> Result<Self, BackendError> {
        Ok(Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            client: http::build_client(http)?,
        })
    }
}

impl LanguageModel for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn complete(&self, request: &ChatRequest<'_>) -> Result<Option<String>, BackendError> {
        let url = format!("{}/api/chat", self.endpoint);
        let body = OllamaChatRequest {
            model: request.model,
            messages: messages(request),
            stream: false,
        };

        let parsed: OllamaChatResponse = http::block_on(async {
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| HttpError::from_reqwest(&e))?;
            let response = http::check_status(response).await?;
            response
                .json::<OllamaChatResponse>()
                .await
                .map_err(|e| BackendError::Decode(e.to_string()))
        })?;

        Ok(parsed.message.and_then(|m| m.content))
    }
}

/// OpenAI-compatible `/chat/completions`.
pub struct OpenAiBackend {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        http: &HttpConfig,
    ) -> Result<Self, BackendError> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| BackendError::Unavailable("no OpenAI API key configured".into()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            client: http::build_client(http)?,
        })
    }
}

impl LanguageModel for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    fn complete(&self, request: &ChatRequest<'_>) -> Result<Option<String>, BackendError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAiChatRequest {
            model: request.model,
            messages: messages(request),
        };

        let parsed: OpenAiChatResponse = http::block_on(async {
            let response = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| HttpError::from_reqwest(&e))?;
            let response = http::check_status(response).await?;
            response
                .json::<OpenAiChatResponse>()
                .await
                .map_err(|e| BackendError::Decode(e.to_string()))
        })?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_prefix_selects_backend() {
        assert_eq!(BackendKind::for_model("gpt-4o-mini"), BackendKind::OpenAi);
        assert_eq!(BackendKind::for_model("o1-preview"), BackendKind::OpenAi);
        assert_eq!(BackendKind::for_model("gemma3:1b"), BackendKind::Ollama);
        assert_eq!(BackendKind::for_model("llama3.2"), BackendKind::Ollama);
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("openai".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);
        assert_eq!(BackendKind::Ollama.to_string(), "ollama");
        assert!("bedrock".parse::<BackendKind>().is_err());
    }

    #[test]
    fn openai_requires_key() {
        let http = HttpConfig::default();
        assert!(matches!(
            OpenAiBackend::new(DEFAULT_OPENAI_BASE_URL, None, &http),
            Err(BackendError::Unavailable(_))
        ));
        assert!(OpenAiBackend::new(DEFAULT_OPENAI_BASE_URL, Some(String::new()), &http).is_err());
        assert!(OpenAiBackend::new(DEFAULT_OPENAI_BASE_URL, Some("sk-test".into()), &http).is_ok());
    }

    #[test]
    fn ollama_request_shape() {
        let req = ChatRequest {
            model: "gemma3:1b",
            system: "rules",
            user: "convert",
        };
        let json = serde_json::to_value(OllamaChatRequest {
            model: req.model,
            messages: messages(&req),
            stream: false,
        })
        .unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "convert");
    }

    #[test]
    fn responses_decode() {
        let ollama: OllamaChatResponse =
            serde_json::from_str(r#"{"model":"m","message":{"role":"assistant","content":"(a b)"},"done":true}"#)
                .unwrap();
        assert_eq!(ollama.message.and_then(|m| m.content).as_deref(), Some("(a b)"));

        let openai: OpenAiChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#)
                .unwrap();
        assert!(openai.choices[0].message.content.is_none());
    }

    #[test]
    #[ignore] // requires a local Ollama with gemma3:1b pulled
    fn live_ollama_completion() {
        let backend = OllamaBackend::new(DEFAULT_OLLAMA_ENDPOINT, &HttpConfig::default()).unwrap();
        let out = backend
            .complete(&ChatRequest {
                model: "gemma3:1b",
                system: crate::prompt::DEFAULT_GUIDELINE,
                user: &crate::prompt::user_prompt("A dog sleeps.", None),
            })
            .unwrap();
        assert!(out.is_some());
    }
}
