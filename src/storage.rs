//! Date-partitioned storage for uploaded images

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

/// A file written by [`UploadStorage::save`]
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Path below the upload root, always with `/` separators
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

/// Writes uploads under `<root>/YYYY/MM/DD/<uuid>.<ext>`
#[derive(Debug, Clone)]
pub struct UploadStorage {
    root: PathBuf,
}

impl UploadStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn save(&self, bytes: &[u8], extension: &str, now: DateTime<Utc>) -> Result<StoredFile> {
        let day = now.format("%Y/%m/%d").to_string();
        let dir = self.root.join(&day);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create upload directory {:?}", dir))?;

        let file_name = format!("{}.{}", Uuid::new_v4(), extension);
        let absolute_path = dir.join(&file_name);
        std::fs::write(&absolute_path, bytes)
            .with_context(|| format!("Failed to write upload {:?}", absolute_path))?;

        Ok(StoredFile {
            relative_path: format!("{day}/{file_name}"),
            absolute_path,
        })
    }

    /// Remove files whose database records were never written
    pub fn discard(&self, files: &[StoredFile]) {
        for file in files {
            if let Err(e) = std::fs::remove_file(&file.absolute_path) {
                warn!(
                    path = %file.absolute_path.display(),
                    error = %e,
                    "Failed to remove stored upload"
                );
            }
        }
    }
}
