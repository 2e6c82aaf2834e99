//! Configuration loading from TOML files

use std::path::{Path, PathBuf};
use std::time::Duration;

use annoline_annotate::backend::{DEFAULT_OLLAMA_ENDPOINT, DEFAULT_OPENAI_BASE_URL};
use annoline_annotate::hub::DEFAULT_HUB_URL;
use annoline_core::HttpConfig;
use anyhow::{Context, Result};
use serde::Deserialize;

/// Global configuration for annoline
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub output: OutputConfig,
    pub data: DataConfig,
    pub ollama: OllamaConfig,
    pub openai: OpenAiConfig,
    pub http: HttpSettings,
    pub workers: WorkersConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Result store root.
    pub dir: PathBuf,
    pub compression_level: i32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/annotations"),
            compression_level: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Where dataset files are looked up and downloaded to.
    pub root: PathBuf,
    pub hub_url: String,
    /// Fetch missing datasets from the hub.
    pub download: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/raw"),
            hub_url: DEFAULT_HUB_URL.to_string(),
            download: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub endpoint: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_OLLAMA_ENDPOINT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub base_url: String,
    #[serde(deserialize_with = "deserialize_env_var")]
    pub api_key: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            api_key: std::env::var("OPENAI_API_KEY").ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub connect_timeout: u64,
    /// Seconds allowed for one completion.
    pub request_timeout: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        let defaults = HttpConfig::default();
        Self {
            connect_timeout: defaults.connect_timeout.as_secs(),
            request_timeout: defaults.request_timeout.as_secs(),
        }
    }
}

impl HttpSettings {
    pub fn to_http_config(self) -> HttpConfig {
        HttpConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            request_timeout: Duration::from_secs(self.request_timeout),
            ..HttpConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Concurrent backend calls per batch when run.toml does not say.
    pub concurrency: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// Deserialize a string that may contain environment variable reference like ${VAR}
fn deserialize_env_var<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    Ok(opt.and_then(|s| expand_env_var(&s)))
}

/// Expand ${VAR} to environment variable value
fn expand_env_var(s: &str) -> Option<String> {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).ok()
    } else {
        Some(s.to_string())
    }
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Search order:
    /// 1. ./annoline.toml (current directory)
    /// 2. ~/.config/annoline/config.toml
    ///
    /// If no config file found, returns default config.
    pub fn load() -> Result<Self> {
        let local_config = PathBuf::from("annoline.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "annoline") {
            let user_config = config_dir.config_dir().join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        log::debug!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.output.dir, PathBuf::from("./data/annotations"));
        assert_eq!(config.ollama.endpoint, "http://localhost:11434");
        assert!(config.data.download);
        assert_eq!(config.workers.concurrency, 4);
    }

    #[test]
    fn expand_env_var_simple() {
        std::env::set_var("ANNOLINE_TEST_KEY", "sk-test");
        assert_eq!(expand_env_var("${ANNOLINE_TEST_KEY}"), Some("sk-test".to_string()));
        std::env::remove_var("ANNOLINE_TEST_KEY");
    }

    #[test]
    fn expand_env_var_literal() {
        assert_eq!(expand_env_var("literal"), Some("literal".to_string()));
    }

    #[test]
    fn expand_env_var_missing() {
        assert_eq!(expand_env_var("${NONEXISTENT_VAR_12345}"), None);
    }

    #[test]
    fn parse_config_toml() {
        let toml = r#"
[output]
dir = "/tmp/annotations"
compression_level = 9

[data]
root = "/srv/datasets"
download = false

[ollama]
endpoint = "http://gpu-box:11434"

[openai]
api_key = "sk-literal"

[http]
request_timeout = 60

[workers]
concurrency = 2
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.output.dir, PathBuf::from("/tmp/annotations"));
        assert_eq!(config.output.compression_level, 9);
        assert!(!config.data.download);
        assert_eq!(config.data.hub_url, DEFAULT_HUB_URL);
        assert_eq!(config.ollama.endpoint, "http://gpu-box:11434");
        assert_eq!(config.openai.api_key.as_deref(), Some("sk-literal"));
        assert_eq!(config.workers.concurrency, 2);

        let http = config.http.to_http_config();
        assert_eq!(http.request_timeout, Duration::from_secs(60));
        assert_eq!(http.connect_timeout, Duration::from_secs(30));
    }
}
