// src/store/journal.rs
//! Append-only JSONL journals
//!
//! One serialized line per record, flushed on every append. A crash can at
//! worst leave a torn final line; readers skip lines that fail to parse, so
//! prior records are never corrupted.

use crate::utils::errors::{Result, RunnerError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::warn;

/// Durable append-only record log
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    /// Open (or create) a journal at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                RunnerError::Store(format!("journal dir {}: {}", parent.display(), e))
            })?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| RunnerError::Store(format!("journal {}: {}", path.display(), e)))?;

        Self::seal_torn_tail(&mut file, &path).await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Terminate an unfinished final line left by a crash mid-append, so the
    /// next record starts on its own line.
    async fn seal_torn_tail(file: &mut File, path: &Path) -> Result<()> {
        let len = file
            .metadata()
            .await
            .map_err(|e| RunnerError::Store(format!("journal stat {}: {}", path.display(), e)))?
            .len();
        if len == 0 {
            return Ok(());
        }

        file.seek(SeekFrom::End(-1))
            .await
            .map_err(|e| RunnerError::Store(format!("journal seek: {}", e)))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)
            .await
            .map_err(|e| RunnerError::Store(format!("journal read tail: {}", e)))?;

        if last[0] != b'\n' {
            warn!(path = %path.display(), "sealing torn journal tail");
            file.write_all(b"\n")
                .await
                .map_err(|e| RunnerError::Store(format!("journal seal: {}", e)))?;
        }
        Ok(())
    }

    /// Append one record as a single JSON line.
    pub async fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .map_err(|e| RunnerError::Store(format!("journal serialize: {}", e)))?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| RunnerError::Store(format!("journal append: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| RunnerError::Store(format!("journal flush: {}", e)))?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every parseable record from a journal file.
///
/// Unparsable lines (a torn tail after a crash) are skipped with a warning.
pub async fn read_journal(path: impl AsRef<Path>) -> Result<Vec<serde_json::Value>> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Store(format!("journal read {}: {}", path.display(), e)))?;

    let mut records = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => records.push(value),
            Err(_) => warn!(path = %path.display(), "skipping unparsable journal line"),
        }
    }
    Ok(records)
}
