//! Local filesystem store for manual PDFs.
//!
//! Files live under `[storage].root` as `<manual_id>_<sanitized name>`, so
//! two uploads with the same original filename never collide.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

pub const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Clone)]
pub struct ManualStore {
    root: PathBuf,
}

impl ManualStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` for the given manual and return the stored path.
    pub async fn save(&self, manual_id: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create storage dir: {}", self.root.display()))?;

        let path = self
            .root
            .join(format!("{}_{}", manual_id, sanitize_filename(filename)));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write manual file: {}", path.display()))?;
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read manual file: {}", path.display()))
    }

    pub async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    /// Remove a stored file. Missing files are not an error.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }
}

/// Keep ASCII alphanumerics and `._-`; everything else becomes `_`.
pub fn sanitize_filename(filename: &str) -> String {
    let safe: String = filename
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "manual.pdf".to_string()
    } else {
        safe
    }
}

pub fn file_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}
