//! Dataset download from a Hugging Face-style hub

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use annoline_core::http::{self, HttpConfig, HttpError};
use annoline_core::sink::tmp_path_for;
use annoline_store::DatasetId;

use crate::source::SourceError;

pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";

#[derive(Debug, Clone)]
pub struct HubFetch {
    pub base_url: String,
    pub http: HttpConfig,
}

impl HubFetch {
    pub fn new(base_url: impl Into<String>, http: HttpConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    /// `{hub}/datasets/{source}/resolve/main/{filename}`
    pub fn file_url(&self, dataset: &DatasetId) -> String {
        format!(
            "{}/datasets/{}/resolve/main/{}",
            self.base_url, dataset.source, dataset.filename
        )
    }

    /// Download the dataset file to `dest` (tmp file, then rename). Returns bytes written.
    pub fn download(&self, dataset: &DatasetId, dest: &Path) -> Result<u64, SourceError> {
        let url = self.file_url(dataset);
        let unavailable = |reason: String| SourceError::Unavailable {
            dataset: dataset.to_string(),
            reason,
        };
        let io_err = |source: std::io::Error| SourceError::Io {
            path: dest.display().to_string(),
            source,
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = tmp_path_for(dest);
        let mut file = File::create(&tmp).map_err(io_err)?;

        log::info!("Downloading {url}");
        let client = http::build_client(&self.http).map_err(|e| unavailable(e.to_string()))?;
        let written = http::block_on(async {
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| HttpError::from_reqwest(&e))?;
            let mut response = http::check_status(response).await?;
            let mut written = 0u64;
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| HttpError::from_reqwest(&e))?
            {
                file.write_all(&chunk)?;
                written += chunk.len() as u64;
            }
            file.flush()?;
            Ok::<_, HttpError>(written)
        });
        drop(file);

        let written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(match e {
                    HttpError::Status { status: 404, .. } => {
                        unavailable(format!("not found on hub ({url})"))
                    }
                    HttpError::Io(source) => io_err(source),
                    other => unavailable(format!("download failed: {other}")),
                });
            }
        };

        fs::rename(&tmp, dest).map_err(io_err)?;
        log::info!("Saved {} ({written} bytes)", dest.display());
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_url_layout() {
        let hub = HubFetch::new("https://hub.example/", HttpConfig::default());
        let ds = DatasetId::new("stanfordnlp/snli", "plain_text/train.parquet", "train");
        assert_eq!(
            hub.file_url(&ds),
            "https://hub.example/datasets/stanfordnlp/snli/resolve/main/plain_text/train.parquet"
        );
    }

    #[test]
    fn unreachable_hub_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let hub = HubFetch::new(
            "http://127.0.0.1:9",
            HttpConfig {
                connect_timeout: std::time::Duration::from_millis(200),
                ..HttpConfig::default()
            },
        );
        let dest = dir.path().join("squad/train.parquet");
        let err = hub
            .download(&DatasetId::new("squad", "train.parquet", "train"), &dest)
            .unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
        assert!(!dest.exists());
        assert!(!tmp_path_for(&dest).exists());
    }
}
