//! Run manifest: content hashes of every result part

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hash;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Written next to the parts when a run finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    /// Part filename → full blake3 hex.
    pub part_hashes: BTreeMap<String, String>,
    /// Combined hash of all parts in filename order.
    pub content_hash: String,
    pub row_count: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Result parts of a run directory, sorted by part number.
pub fn list_parts(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("part_*.parquet");
    let mut parts: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
        .context("invalid glob pattern")?
        .filter_map(|e| e.ok())
        .filter(|p| p.is_file())
        .collect();
    parts.sort();
    Ok(parts)
}

/// Hash every part in `dir`. Returns (per-part hashes, combined hash).
pub fn compute_part_hashes(dir: &Path) -> Result<(BTreeMap<String, String>, blake3::Hash)> {
    let mut part_hashes = BTreeMap::new();
    let mut all = Vec::new();

    for path in list_parts(dir)? {
        let h = hash::hash_file(&path)
            .with_context(|| format!("failed to hash {}", path.display()))?;
        let Some(name) = path.file_name() else {
            continue;
        };
        part_hashes.insert(name.to_string_lossy().into_owned(), h.to_hex().to_string());
        all.push(h);
    }

    let combined = if all.is_empty() {
        hash::hash_bytes(b"empty")
    } else {
        hash::combine_hashes(&all)
    };
    Ok((part_hashes, combined))
}

impl RunManifest {
    pub fn build(run_id: &str, dir: &Path, row_count: usize) -> Result<Self> {
        let (part_hashes, content_hash) = compute_part_hashes(dir)?;
        Ok(Self {
            run_id: run_id.to_string(),
            part_hashes,
            content_hash: content_hash.to_hex().to_string(),
            row_count,
            created_at: chrono::Utc::now(),
        })
    }

    pub fn write_to(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self).context("failed to serialize manifest")?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn read_from(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn short_content_hash(&self) -> &str {
        &self.content_hash[..8.min(self.content_hash.len())]
    }
}
