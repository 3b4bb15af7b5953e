//! TaskLocator: line-literal recognition of checkbox tasks and their Todoist links.
//!
//! Pure functions over text lines. A linked task looks like:
//!
//! ```markdown
//! - [ ] Buy milk
//!     - [Todoist](https://todoist.com/showTask?id=abc123)
//! ```
//!
//! The link may sit on the task line itself or on any deeper-indented line
//! below it; the sub-item scope ends at the first non-blank line indented at
//! or above the task's own level.

use once_cell::sync::Lazy;
use regex::Regex;

/// `- [ ] text`, `* [x] text`, `1. [/] text`, with any leading indentation.
static TASK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+\[(.)\](?:\s|$)").unwrap());

/// Todoist task URLs. The captured segment ends with the task id; app URLs
/// prefix it with a slug (`buy-milk-abc123`).
static TODOIST_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:https?://(?:app\.)?todoist\.com/(?:showTask\?id=|app/task/)|todoist://task\?id=)([A-Za-z0-9_-]+)",
    )
    .unwrap()
});

/// An existing Tasks-style completion date (`✅ 2024-05-01`).
static COMPLETION_STAMP: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"✅\s*\d{4}-\d{2}-\d{2}").unwrap());

const TAB_WIDTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Open,
    Completed,
    /// Any other single-character marker (`[/]`, `[-]`, `[>]`, ...)
    Other(char),
}

impl TaskStatus {
    pub fn is_completed(self) -> bool {
        self == TaskStatus::Completed
    }
}

/// A task line carrying a Todoist link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedTask {
    pub line_index: usize,
    pub remote_id: String,
    pub status: TaskStatus,
    pub line: String,
}

pub fn is_task_line(line: &str) -> bool {
    TASK_LINE.is_match(line)
}

/// Completion category of a line. `None` when it is not a task line.
pub fn task_status(line: &str) -> Option<TaskStatus> {
    let marker = TASK_LINE.captures(line)?.get(1)?.as_str().chars().next()?;
    Some(match marker {
        ' ' => TaskStatus::Open,
        'x' | 'X' => TaskStatus::Completed,
        other => TaskStatus::Other(other),
    })
}

/// Indentation width in columns (tabs count as four).
pub fn indent_depth(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { TAB_WIDTH } else { 1 })
        .sum()
}

/// Extract a Todoist task id from a single line.
pub fn extract_remote_id(line: &str) -> Option<String> {
    let segment = TODOIST_LINK.captures(line)?.get(1)?.as_str();
    let id = segment.rsplit('-').next().unwrap_or(segment);
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

/// Find the remote id linked to the task at `task_index`.
pub fn find_linked_remote_id<S: AsRef<str>>(lines: &[S], task_index: usize) -> Option<String> {
    let task_line = lines.get(task_index)?.as_ref();
    if !is_task_line(task_line) {
        return None;
    }
    if let Some(id) = extract_remote_id(task_line) {
        return Some(id);
    }

    // Nested tasks own their subtree, links inside it belong to them
    let task_depth = indent_depth(task_line);
    let mut nested_depth: Option<usize> = None;
    for line in lines.iter().skip(task_index + 1).map(AsRef::as_ref) {
        if line.trim().is_empty() {
            continue;
        }
        let depth = indent_depth(line);
        if depth <= task_depth {
            break;
        }
        match nested_depth {
            Some(nested) if depth > nested => continue,
            _ => nested_depth = None,
        }
        if is_task_line(line) {
            nested_depth = Some(depth);
            continue;
        }
        if let Some(id) = extract_remote_id(line) {
            return Some(id);
        }
    }
    None
}

/// Every linked task in a document.
pub fn scan_linked_tasks(content: &str) -> Vec<LocatedTask> {
    let lines: Vec<&str> = content.lines().collect();
    lines
        .iter()
        .enumerate()
        .filter_map(|(index, line)| {
            let status = task_status(line)?;
            let remote_id = find_linked_remote_id(&lines, index)?;
            Some(LocatedTask {
                line_index: index,
                remote_id,
                status,
                line: line.to_string(),
            })
        })
        .collect()
}

/// Find the line index of the task linked to `remote_id`.
pub fn locate_task<S: AsRef<str>>(lines: &[S], remote_id: &str) -> Option<usize> {
    (0..lines.len()).find(|&index| {
        find_linked_remote_id(lines, index).as_deref() == Some(remote_id)
    })
}

/// Rewrite the checkbox marker. `None` when the line is not a task line.
pub fn set_completion(line: &str, completed: bool) -> Option<String> {
    let marker = TASK_LINE.captures(line)?.get(1)?;
    let replacement = if completed { "x" } else { " " };
    let mut rewritten = String::with_capacity(line.len());
    rewritten.push_str(&line[..marker.start()]);
    rewritten.push_str(replacement);
    rewritten.push_str(&line[marker.end()..]);
    Some(rewritten)
}

/// Whether the line already carries a completion timestamp.
pub fn has_completion_timestamp(line: &str, stamp: &str) -> bool {
    COMPLETION_STAMP.is_match(line) || (!stamp.is_empty() && line.contains(stamp))
}

/// Append `stamp` unless a completion timestamp is already present.
pub fn append_completion_timestamp(line: &str, stamp: &str) -> String {
    if stamp.is_empty() || has_completion_timestamp(line, stamp) {
        return line.to_string();
    }
    format!("{} {}", line.trim_end(), stamp)
}

/// Replace line `index` of `content`, keeping every line ending as it was.
pub fn replace_line(content: &str, index: usize, replacement: &str) -> Option<String> {
    let mut start = 0;
    for (i, segment) in content.split_inclusive('\n').enumerate() {
        if i == index {
            let body_len = segment
                .strip_suffix("\r\n")
                .or_else(|| segment.strip_suffix('\n'))
                .unwrap_or(segment)
                .len();
            let mut updated = String::with_capacity(content.len() + replacement.len());
            updated.push_str(&content[..start]);
            updated.push_str(replacement);
            updated.push_str(&content[start + body_len..]);
            return Some(updated);
        }
        start += segment.len();
    }
    None
}
