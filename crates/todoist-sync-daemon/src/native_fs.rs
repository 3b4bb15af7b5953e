//! Vault directory implementation of `LocalNoteStore` using tokio::fs.
//!
//! Note ids come from frontmatter (`todoist-sync-id`, `id`, `uid`). Notes
//! without one are identified by device and inode on unix, which survives a
//! rename or move within the same filesystem. The store never writes an id
//! into a note.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use todoist_sync_core::fs::{LocalNoteStore, LocalStoreError, NoteFile, Result};
use todoist_sync_core::markdown;
use tokio::fs;
use tracing::{debug, warn};

const INODE_PREFIX: &str = "ino:";

/// Markdown notes under a vault directory.
pub struct VaultNoteStore {
    base_path: PathBuf,
}

impl VaultNoteStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// Every `.md` file below the vault root, skipping dot-directories.
    async fn walk(&self) -> Result<Vec<(String, std::fs::Metadata)>> {
        let mut found = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(dir_rel) = pending.pop() {
            let mut dir = fs::read_dir(self.full_path(&dir_rel))
                .await
                .map_err(io_error)?;
            while let Some(entry) = dir.next_entry().await.map_err(io_error)? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let rel = if dir_rel.is_empty() {
                    name.clone()
                } else {
                    format!("{}/{}", dir_rel, name)
                };
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!("Skipping {}: {}", rel, e);
                        continue;
                    }
                };
                if metadata.is_dir() {
                    pending.push(rel);
                } else if name.ends_with(".md") {
                    found.push((rel, metadata));
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}

fn io_error(e: std::io::Error) -> LocalStoreError {
    LocalStoreError::Io(e.to_string())
}

fn map_read_error(path: &str, e: std::io::Error) -> LocalStoreError {
    if e.kind() == std::io::ErrorKind::NotFound {
        LocalStoreError::NotFound(path.to_string())
    } else {
        io_error(e)
    }
}

fn mtime_millis(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .map(|t| {
            t.duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

#[cfg(unix)]
fn inode_id(metadata: &std::fs::Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    Some(format!("{}{}:{}", INODE_PREFIX, metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
fn inode_id(_metadata: &std::fs::Metadata) -> Option<String> {
    None
}

#[async_trait]
impl LocalNoteStore for VaultNoteStore {
    async fn read_file(&self, path: &str) -> Result<String> {
        fs::read_to_string(self.full_path(path))
            .await
            .map_err(|e| map_read_error(path, e))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let full_path = self.full_path(path);
        if !fs::try_exists(&full_path).await.map_err(io_error)? {
            return Err(LocalStoreError::NotFound(path.to_string()));
        }
        fs::write(&full_path, content).await.map_err(io_error)
    }

    async fn list_files(&self) -> Result<Vec<NoteFile>> {
        Ok(self
            .walk()
            .await?
            .into_iter()
            .map(|(path, metadata)| NoteFile {
                path,
                mtime_millis: mtime_millis(&metadata),
            })
            .collect())
    }

    async fn resolve_note_id(&self, path: &str) -> Result<Option<String>> {
        let content = self.read_file(path).await?;
        if let Some(id) = markdown::note_id(&content) {
            return Ok(Some(id));
        }
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_read_error(path, e))?;
        Ok(inode_id(&metadata))
    }

    async fn find_by_note_id(&self, note_id: &str) -> Result<Option<String>> {
        if note_id.is_empty() {
            return Ok(None);
        }
        let by_inode = note_id.starts_with(INODE_PREFIX);
        for (path, metadata) in self.walk().await? {
            let matches = if by_inode {
                inode_id(&metadata).as_deref() == Some(note_id)
            } else {
                match self.read_file(&path).await {
                    Ok(content) => markdown::note_id(&content).as_deref() == Some(note_id),
                    Err(e) => {
                        debug!("Skipping {} during note id lookup: {}", path, e);
                        false
                    }
                }
            };
            if matches {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vault() -> (TempDir, VaultNoteStore) {
        let dir = TempDir::new().unwrap();
        let store = VaultNoteStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn test_lists_markdown_recursively() {
        let (dir, store) = vault();
        std::fs::create_dir_all(dir.path().join("Projects/Home")).unwrap();
        std::fs::create_dir_all(dir.path().join(".obsidian")).unwrap();
        std::fs::write(dir.path().join("Inbox.md"), "- [ ] a").unwrap();
        std::fs::write(dir.path().join("Projects/Home/Roof.md"), "").unwrap();
        std::fs::write(dir.path().join("image.png"), "").unwrap();
        std::fs::write(dir.path().join(".obsidian/workspace.md"), "").unwrap();

        let paths: Vec<String> = store
            .list_files()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();

        assert_eq!(paths, vec!["Inbox.md", "Projects/Home/Roof.md"]);
    }

    #[tokio::test]
    async fn test_read_missing_is_not_found() {
        let (_dir, store) = vault();
        assert!(matches!(
            store.read_file("nope.md").await,
            Err(LocalStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.write_file("nope.md", "x").await,
            Err(LocalStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_frontmatter_id_follows_rename() {
        let (dir, store) = vault();
        std::fs::write(dir.path().join("a.md"), "---\nid: groceries\n---\n- [ ] milk\n").unwrap();
        assert_eq!(
            store.resolve_note_id("a.md").await.unwrap().as_deref(),
            Some("groceries")
        );

        std::fs::create_dir(dir.path().join("Archive")).unwrap();
        std::fs::rename(dir.path().join("a.md"), dir.path().join("Archive/b.md")).unwrap();

        assert_eq!(
            store.find_by_note_id("groceries").await.unwrap().as_deref(),
            Some("Archive/b.md")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_inode_id_follows_rename() {
        let (dir, store) = vault();
        std::fs::write(dir.path().join("a.md"), "- [ ] milk\n").unwrap();
        let id = store.resolve_note_id("a.md").await.unwrap().unwrap();
        assert!(id.starts_with(INODE_PREFIX));

        std::fs::rename(dir.path().join("a.md"), dir.path().join("c.md")).unwrap();

        assert_eq!(
            store.find_by_note_id(&id).await.unwrap().as_deref(),
            Some("c.md")
        );
        assert_eq!(store.find_by_note_id("ino:0:0").await.unwrap(), None);
    }
}
