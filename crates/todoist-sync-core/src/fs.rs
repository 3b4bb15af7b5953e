//! LocalNoteStore trait abstraction over the note vault.
//!
//! Implementations:
//! - `InMemoryNoteStore` - For testing
//! - `VaultNoteStore` (in todoist-sync-daemon) - Markdown files in a vault directory
//!
//! The sync core only needs five operations: read, write, enumerate with
//! modification times, and the two directions of the stable note-id mapping
//! that lets a tracked task survive a rename or move.

use crate::clock::{Clock, SystemClock};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalStoreError {
    #[error("Note not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, LocalStoreError>;

/// A note in the vault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteFile {
    /// Vault-relative path
    pub path: String,
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
}

#[async_trait]
pub trait LocalNoteStore: Send + Sync {
    /// Read note contents
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Replace note contents
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Enumerate every Markdown note
    async fn list_files(&self) -> Result<Vec<NoteFile>>;

    /// Stable identifier of the note at `path`, if it has one
    async fn resolve_note_id(&self, path: &str) -> Result<Option<String>>;

    /// Current path of the note carrying `note_id`
    async fn find_by_note_id(&self, note_id: &str) -> Result<Option<String>>;
}

#[derive(Debug, Clone)]
struct InMemoryNote {
    content: String,
    mtime: u64,
    note_id: String,
}

/// In-memory vault for testing.
///
/// Every note gets a note id on creation that follows it through `rename`.
pub struct InMemoryNoteStore {
    notes: RwLock<HashMap<String, InMemoryNote>>,
    writes: RwLock<HashMap<String, usize>>,
    next_id: RwLock<u64>,
    clock: Arc<dyn Clock>,
}

impl InMemoryNoteStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Modification times come from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            notes: RwLock::new(HashMap::new()),
            writes: RwLock::new(HashMap::new()),
            next_id: RwLock::new(1),
            clock,
        }
    }

    /// Create or replace a note without counting it as a sync write.
    pub fn insert(&self, path: &str, content: &str) {
        let mtime = self.clock.now_millis();
        let mut notes = self.notes.write().unwrap();
        if let Some(note) = notes.get_mut(path) {
            note.content = content.to_string();
            note.mtime = mtime;
            return;
        }
        let mut next_id = self.next_id.write().unwrap();
        let note_id = format!("note-{}", *next_id);
        *next_id += 1;
        notes.insert(
            path.to_string(),
            InMemoryNote {
                content: content.to_string(),
                mtime,
                note_id,
            },
        );
    }

    /// Move a note, keeping its note id.
    pub fn rename(&self, from: &str, to: &str) {
        let mut notes = self.notes.write().unwrap();
        if let Some(note) = notes.remove(from) {
            notes.insert(to.to_string(), note);
        }
    }

    pub fn delete(&self, path: &str) {
        self.notes.write().unwrap().remove(path);
    }

    /// Set a specific mtime for testing incremental scans
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        if let Some(note) = self.notes.write().unwrap().get_mut(path) {
            note.mtime = mtime;
        }
    }

    /// Drop the note id, as for a note created before ids existed.
    pub fn clear_note_id(&self, path: &str) {
        if let Some(note) = self.notes.write().unwrap().get_mut(path) {
            note.note_id.clear();
        }
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.notes.read().unwrap().get(path).map(|n| n.content.clone())
    }

    /// Number of `write_file` calls made for `path`.
    pub fn write_count(&self, path: &str) -> usize {
        self.writes.read().unwrap().get(path).copied().unwrap_or(0)
    }
}

impl Default for InMemoryNoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalNoteStore for InMemoryNoteStore {
    async fn read_file(&self, path: &str) -> Result<String> {
        self.content(path)
            .ok_or_else(|| LocalStoreError::NotFound(path.to_string()))
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        if !self.notes.read().unwrap().contains_key(path) {
            return Err(LocalStoreError::NotFound(path.to_string()));
        }
        self.insert(path, content);
        *self
            .writes
            .write()
            .unwrap()
            .entry(path.to_string())
            .or_default() += 1;
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<NoteFile>> {
        let notes = self.notes.read().unwrap();
        let mut files: Vec<NoteFile> = notes
            .iter()
            .map(|(path, note)| NoteFile {
                path: path.clone(),
                mtime_millis: note.mtime,
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn resolve_note_id(&self, path: &str) -> Result<Option<String>> {
        let notes = self.notes.read().unwrap();
        Ok(notes
            .get(path)
            .map(|n| n.note_id.clone())
            .filter(|id| !id.is_empty()))
    }

    async fn find_by_note_id(&self, note_id: &str) -> Result<Option<String>> {
        if note_id.is_empty() {
            return Ok(None);
        }
        let notes = self.notes.read().unwrap();
        Ok(notes
            .iter()
            .find(|(_, note)| note.note_id == note_id)
            .map(|(path, _)| path.clone()))
    }
}
