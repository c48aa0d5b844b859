//! Git-style unified diff parsing.
//!
//! Hunk lines keep the line terminator they will have in the target file, so
//! `foo\r` followed by the patch newline becomes `foo\r\n`, and a line marked
//! with `\ No newline at end of file` carries no terminator at all.

use std::collections::HashSet;
use std::path::{Component, Path};

use crate::PatchError;

const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineKind {
    Context,
    Remove,
    Add,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HunkLine {
    pub kind: LineKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    /// Text after the closing `@@`, usually the enclosing function signature.
    pub section: String,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    pub fn old_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.kind != LineKind::Add)
            .map(|l| l.text.as_str())
            .collect()
    }

    pub fn new_side(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|l| l.kind != LineKind::Remove)
            .map(|l| l.text.as_str())
            .collect()
    }

    pub fn is_pure_addition(&self) -> bool {
        self.lines.iter().all(|l| l.kind == LineKind::Add)
    }

    /// Zero-based index of the first old line in the target file.
    pub fn declared_index(&self) -> usize {
        if self.old_count == 0 {
            self.old_start
        } else {
            self.old_start.saturating_sub(1)
        }
    }

    fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_count, self.new_start, self.new_count
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilePatch {
    /// `None` when the old side is `/dev/null`.
    pub old_path: Option<String>,
    /// `None` when the new side is `/dev/null`.
    pub new_path: Option<String>,
    pub is_new: bool,
    pub is_delete: bool,
    pub is_rename: bool,
    pub is_binary: bool,
    pub new_mode: Option<u32>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    /// Path the result is written to, or the deleted path for deletions.
    pub fn target_path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or("")
    }

    pub fn source_path(&self) -> Option<&str> {
        if self.is_new {
            None
        } else {
            self.old_path.as_deref()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedPatch {
    pub files: Vec<FilePatch>,
    pub binary_sections_stripped: usize,
}

/// Parses `text`, drops binary sections and validates hunk structure.
pub fn parse_patch(text: &str) -> Result<ParsedPatch, PatchError> {
    let lines = split_patch_lines(text);
    let first = lines
        .iter()
        .position(|l| l.starts_with("diff --git "))
        .ok_or_else(|| PatchError::Corrupt("missing diff --git header".to_string()))?;
    if lines[..first]
        .iter()
        .any(|l| l.starts_with("@@ ") || l.starts_with("+++ "))
    {
        return Err(PatchError::Corrupt(
            "hunk content before the first diff --git header".to_string(),
        ));
    }

    let mut parsed = ParsedPatch::default();
    let mut idx = first;
    while idx < lines.len() {
        if !lines[idx].starts_with("diff --git ") {
            idx += 1;
            continue;
        }
        let (file, next) = parse_file_block(&lines, idx)?;
        idx = next;
        if file.is_binary {
            parsed.binary_sections_stripped += 1;
            continue;
        }
        parsed.files.push(file);
    }

    if parsed.files.is_empty() {
        return Err(PatchError::Corrupt(
            "patch contains no applicable text changes".to_string(),
        ));
    }
    validate_files(&parsed.files)?;
    Ok(parsed)
}

fn split_patch_lines(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

fn parse_file_block(lines: &[&str], start: usize) -> Result<(FilePatch, usize), PatchError> {
    let mut file = FilePatch::default();
    let (git_old, git_new) = parse_git_header(lines[start])?;
    file.old_path = Some(git_old);
    file.new_path = Some(git_new);

    let mut idx = start + 1;
    let mut saw_minus = false;
    let mut saw_plus = false;
    while idx < lines.len() {
        let line = lines[idx];
        if line.starts_with("diff --git ") {
            break;
        }
        if line.starts_with("GIT binary patch") || line.starts_with("Binary files ") {
            file.is_binary = true;
            idx += 1;
            while idx < lines.len() && !lines[idx].starts_with("diff --git ") {
                idx += 1;
            }
            break;
        }
        if let Some(mode) = line.strip_prefix("new file mode ") {
            file.is_new = true;
            file.new_mode = parse_mode(mode);
        } else if line.starts_with("deleted file mode ") {
            file.is_delete = true;
        } else if let Some(mode) = line.strip_prefix("new mode ") {
            file.new_mode = parse_mode(mode);
        } else if let Some(path) = line.strip_prefix("rename from ") {
            file.is_rename = true;
            file.old_path = Some(unquote_path(path));
        } else if let Some(path) = line.strip_prefix("rename to ") {
            file.is_rename = true;
            file.new_path = Some(unquote_path(path));
        } else if let Some(path) = line.strip_prefix("--- ") {
            if idx + 1 >= lines.len() || !lines[idx + 1].starts_with("+++ ") {
                return Err(PatchError::Corrupt(format!(
                    "'--- {}' is not followed by a +++ line",
                    path.trim()
                )));
            }
            saw_minus = true;
            match strip_side_prefix(path, "a/") {
                None => file.is_new = true,
                Some(p) => file.old_path = Some(p),
            }
        } else if let Some(path) = line.strip_prefix("+++ ") {
            if !saw_minus {
                return Err(PatchError::Corrupt(format!(
                    "'+++ {}' without a preceding --- line",
                    path.trim()
                )));
            }
            saw_plus = true;
            match strip_side_prefix(path, "b/") {
                None => file.is_delete = true,
                Some(p) => file.new_path = Some(p),
            }
        } else if line.starts_with("@@") {
            if !saw_plus {
                return Err(PatchError::Corrupt(format!(
                    "hunk in {} without ---/+++ headers",
                    file.target_path()
                )));
            }
            let (hunk, next) = parse_hunk(lines, idx, file.target_path())?;
            file.hunks.push(hunk);
            idx = next;
            continue;
        }
        idx += 1;
    }

    if file.is_new {
        file.old_path = None;
    }
    if file.is_delete {
        file.new_path = None;
    }
    Ok((file, idx))
}

fn parse_git_header(line: &str) -> Result<(String, String), PatchError> {
    let rest = line.trim_start_matches("diff --git ").trim();
    let split = rest
        .rfind(" b/")
        .ok_or_else(|| PatchError::Corrupt(format!("malformed header: {}", line)))?;
    let old = rest[..split].trim();
    let new = rest[split + 1..].trim();
    let old = old.strip_prefix("a/").unwrap_or(old);
    let new = new.strip_prefix("b/").unwrap_or(new);
    if old.is_empty() || new.is_empty() {
        return Err(PatchError::Corrupt(format!("malformed header: {}", line)));
    }
    Ok((unquote_path(old), unquote_path(new)))
}

fn strip_side_prefix(raw: &str, prefix: &str) -> Option<String> {
    let path = raw.split('\t').next().unwrap_or(raw).trim_end();
    if path == DEV_NULL {
        return None;
    }
    let path = unquote_path(path);
    Some(path.strip_prefix(prefix).map(str::to_string).unwrap_or(path))
}

fn unquote_path(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        raw[1..raw.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        raw.to_string()
    }
}

fn parse_mode(raw: &str) -> Option<u32> {
    u32::from_str_radix(raw.trim(), 8).ok()
}

fn parse_range(raw: &str) -> Option<(usize, usize)> {
    match raw.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((raw.parse().ok()?, 1)),
    }
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize, usize, String)> {
    let rest = line.strip_prefix("@@ ")?;
    let close = rest.find(" @@")?;
    let mut ranges = rest[..close].split_whitespace();
    let (old_start, old_count) = parse_range(ranges.next()?.strip_prefix('-')?)?;
    let (new_start, new_count) = parse_range(ranges.next()?.strip_prefix('+')?)?;
    if ranges.next().is_some() {
        return None;
    }
    let section = rest[close + 3..].trim().to_string();
    Some((old_start, old_count, new_start, new_count, section))
}

fn parse_hunk(lines: &[&str], start: usize, path: &str) -> Result<(Hunk, usize), PatchError> {
    let (old_start, old_count, new_start, new_count, section) = parse_hunk_header(lines[start])
        .ok_or_else(|| {
            PatchError::Corrupt(format!("malformed hunk header in {}: {}", path, lines[start]))
        })?;
    let mut hunk = Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        section,
        lines: Vec::new(),
    };

    let mut seen_old = 0usize;
    let mut seen_new = 0usize;
    let mut idx = start + 1;
    while idx < lines.len() {
        let line = lines[idx];
        if line.starts_with('\\') {
            if let Some(last) = hunk.lines.last_mut() {
                if last.text.ends_with('\n') {
                    last.text.pop();
                }
            }
            idx += 1;
            continue;
        }
        if seen_old >= old_count && seen_new >= new_count {
            break;
        }
        let (kind, body) = match line.chars().next() {
            Some(' ') => (LineKind::Context, &line[1..]),
            Some('-') => (LineKind::Remove, &line[1..]),
            Some('+') => (LineKind::Add, &line[1..]),
            None => (LineKind::Context, ""),
            Some(_) => break,
        };
        match kind {
            LineKind::Context => {
                seen_old += 1;
                seen_new += 1;
            }
            LineKind::Remove => seen_old += 1,
            LineKind::Add => seen_new += 1,
        }
        hunk.lines.push(HunkLine {
            kind,
            text: format!("{}\n", body),
        });
        idx += 1;
    }

    if seen_old != old_count || seen_new != new_count {
        return Err(PatchError::Corrupt(format!(
            "{} in {} declares {} old/{} new lines but supplies {}/{}",
            hunk.header(),
            path,
            old_count,
            new_count,
            seen_old,
            seen_new
        )));
    }
    if idx < lines.len() && is_surplus_body_line(lines[idx]) {
        return Err(PatchError::Corrupt(format!(
            "{} in {} supplies more lines than declared",
            hunk.header(),
            path
        )));
    }
    Ok((hunk, idx))
}

/// A body-looking line after a hunk's declared counts are used up. The
/// `-- ` signature separator that format-patch appends is not one.
fn is_surplus_body_line(line: &str) -> bool {
    if line == "--" || line == "-- " || line.starts_with("--- ") || line.starts_with("+++ ") {
        return false;
    }
    line.starts_with('+') || line.starts_with('-') || (line.starts_with(' ') && line.len() > 1)
}

fn validate_files(files: &[FilePatch]) -> Result<(), PatchError> {
    let mut seen_hunks: HashSet<(String, String, Vec<HunkLine>)> = HashSet::new();
    for file in files {
        for path in [file.old_path.as_deref(), file.new_path.as_deref()]
            .into_iter()
            .flatten()
        {
            validate_path(path)?;
        }
        if file.is_new && file.is_delete {
            return Err(PatchError::Corrupt(format!(
                "{} is marked both new and deleted",
                file.target_path()
            )));
        }

        let mut prev_end: Option<usize> = None;
        for hunk in &file.hunks {
            let key = (
                file.target_path().to_string(),
                hunk.header(),
                hunk.lines.clone(),
            );
            if !seen_hunks.insert(key) {
                return Err(PatchError::Corrupt(format!(
                    "duplicate hunk {} for {}",
                    hunk.header(),
                    file.target_path()
                )));
            }
            let start = if hunk.old_count == 0 {
                hunk.old_start + 1
            } else {
                hunk.old_start
            };
            if let Some(end) = prev_end {
                if start < end {
                    return Err(PatchError::Corrupt(format!(
                        "hunk {} overlaps the previous hunk in {}",
                        hunk.header(),
                        file.target_path()
                    )));
                }
            }
            prev_end = Some(start + hunk.old_count);
        }
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<(), PatchError> {
    let p = Path::new(path);
    let escapes = p.is_absolute()
        || p.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
    if path.is_empty() || escapes {
        return Err(PatchError::Corrupt(format!(
            "path escapes the working tree: {}",
            path
        )));
    }
    Ok(())
}
