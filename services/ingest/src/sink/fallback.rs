//! Local fallback for batches the sink would not take.
//!
//! Each batch becomes one JSON Lines file named
//! `batch-{created_at}-{batch_id}.jsonl`, one document per line. Files are
//! written under a temporary name and renamed, so a reader never sees a
//! half-written batch.

use crate::record::Batch;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("Fallback directory {path} is unusable: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write fallback file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode document: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct FallbackStore {
    dir: PathBuf,
}

impl FallbackStore {
    /// Open (and create if needed) the fallback directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, FallbackError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| FallbackError::Directory {
                path: dir.clone(),
                source,
            })?;

        info!(dir = %dir.display(), "Fallback store ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the batch to disk, returning the final file path.
    #[instrument(skip(self, batch), fields(batch_id = %batch.id(), records = batch.len()))]
    pub async fn persist(&self, batch: &Batch) -> Result<PathBuf, FallbackError> {
        let mut body = Vec::with_capacity(batch.len() * 64);
        for document in batch.documents() {
            serde_json::to_writer(&mut body, &document)?;
            body.push(b'\n');
        }

        let name = format!(
            "batch-{}-{}.jsonl",
            batch.created_at().format("%Y%m%dT%H%M%S%.3fZ"),
            batch.id()
        );
        let path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!(".{}.tmp", name));

        let write = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &path).await
        };

        if let Err(source) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(FallbackError::Write { path, source });
        }

        Ok(path)
    }
}
