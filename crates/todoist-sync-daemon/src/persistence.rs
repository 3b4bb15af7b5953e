//! File-backed sync journal.
//!
//! The journal lives at `<data dir>/sync-journal.json`. Saves write a sibling
//! temp file and rename it over the journal, so a crash mid-save leaves the
//! previous document intact. Backups are written next to the journal as
//! `sync-journal.<label>.<timestamp>.json`.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};
use todoist_sync_core::store::{JournalBackend, JournalError, Result};
use tokio::fs;
use tracing::debug;

pub const JOURNAL_FILE: &str = "sync-journal.json";

/// Journal storage in a data directory.
pub struct FileJournalBackend {
    /// Path to the journal file
    path: PathBuf,
}

impl FileJournalBackend {
    /// Store the journal in `data_dir`, creating the directory on first save.
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(JOURNAL_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(self.dir()).await.map_err(io_error)
    }

    /// Write `contents` to `target` through a uniquely named temp file.
    async fn write_atomic(&self, target: &Path, contents: &str) -> Result<()> {
        self.ensure_dir().await?;
        let suffix: [u8; 6] = rand::rng().random();
        let tmp = self
            .dir()
            .join(format!(".{}.{}.tmp", JOURNAL_FILE, hex::encode(suffix)));

        fs::write(&tmp, contents).await.map_err(io_error)?;
        if let Err(e) = fs::rename(&tmp, target).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_error(e));
        }
        Ok(())
    }
}

fn io_error(e: std::io::Error) -> JournalError {
    JournalError::Io(e.to_string())
}

#[async_trait]
impl JournalBackend for FileJournalBackend {
    async fn load(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    async fn save(&self, contents: &str) -> Result<()> {
        self.write_atomic(&self.path, contents).await?;
        debug!("Wrote journal to {:?}", self.path);
        Ok(())
    }

    async fn backup(&self, label: &str, contents: &str) -> Result<String> {
        let stem = JOURNAL_FILE.trim_end_matches(".json");
        let name = format!(
            "{}.{}.{}.json",
            stem,
            label,
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        );
        self.write_atomic(&self.dir().join(&name), contents).await?;
        Ok(name)
    }
}
