//! Atomic persistence of the status document.

use crate::status::models::StatusDocument;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use ulid::Ulid;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("status file {path} is not a valid status document: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode status document: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("run {0} is not the active run")]
    StaleHandle(Ulid),
}

/// The status document on disk. Readers only ever see a complete file: every
/// save goes to a sibling temp file that is flushed and renamed over it.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: io::Error) -> StatusError {
        StatusError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// `None` when no document has been written yet.
    pub async fn load(&self) -> Result<Option<StatusDocument>, StatusError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StatusError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    pub async fn save(&self, doc: &StatusDocument) -> Result<(), StatusError> {
        let bytes = serde_json::to_vec_pretty(doc).map_err(StatusError::Encode)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;
        drop(file);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }
}
