//! Frontmatter lookup for stable note identifiers.
//!
//! Notes may carry an identifier in their YAML frontmatter that survives
//! renames and moves:
//! ```markdown
//! ---
//! id: 20240501-groceries
//! ---
//!
//! - [ ] Buy milk
//! ```
//! Only the frontmatter block is parsed; the body is never interpreted here.

use std::collections::HashMap;

/// Frontmatter keys checked for a note id, in order of preference.
pub const NOTE_ID_KEYS: [&str; 3] = ["todoist-sync-id", "id", "uid"];

/// Parse the frontmatter block at the start of a note.
///
/// Returns `None` when there is no frontmatter, it is not closed, or it is
/// not a YAML mapping.
pub fn frontmatter(content: &str) -> Option<HashMap<String, serde_yaml::Value>> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    match serde_yaml::from_str::<HashMap<String, serde_yaml::Value>>(rest[..end].trim()) {
        Ok(fm) if !fm.is_empty() => Some(fm),
        _ => None,
    }
}

/// The note id declared in the frontmatter, if any.
pub fn note_id(content: &str) -> Option<String> {
    let fm = frontmatter(content)?;
    NOTE_ID_KEYS.iter().find_map(|key| match fm.get(*key)? {
        serde_yaml::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
