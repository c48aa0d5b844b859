//! Applies unified diffs to a working tree, escalating from an exact
//! (vanilla) application to fuzzy and structural placement per file.
//!
//! All files of a patch are staged in memory; the tree is only written when
//! every file applied.

use anyhow::Result;
use bench_core::{FileApplyResult, PatchApplyResult, PatchFailureKind, PatchMode};
use std::io;
use std::path::Path;
use tracing::{debug, info};

mod fit;
pub mod parse;
mod tree;

pub use parse::{parse_patch, FilePatch, Hunk, HunkLine, LineKind, ParsedPatch};
pub use tree::{DirTree, MemTree, WorkTree};

use fit::{fuzzy_fit, join_lines, split_lines, structural_fit, vanilla_fit, Placement, Scope};
use tree::StagedTree;

pub const DEFAULT_FUZZY_WINDOW: usize = 50;
pub const DEFAULT_FUZZ_FACTOR: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("corrupt patch: {0}")]
    Corrupt(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("file already exists: {0}")]
    FileAlreadyExists(String),
    #[error("context mismatch in {path}: {detail}")]
    ContextMismatch { path: String, detail: String },
}

impl PatchError {
    pub fn kind(&self) -> PatchFailureKind {
        match self {
            PatchError::Corrupt(_) => PatchFailureKind::CorruptPatch,
            PatchError::FileNotFound(_) => PatchFailureKind::FileNotFound,
            PatchError::FileAlreadyExists(_) => PatchFailureKind::FileAlreadyExists,
            PatchError::ContextMismatch { .. } => PatchFailureKind::ContextMismatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Lines searched on either side of a hunk's expected position.
    pub fuzzy_window: usize,
    /// Context lines that may be dropped from each end of a hunk.
    pub fuzz_factor: usize,
    /// Most permissive strategy allowed.
    pub max_mode: PatchMode,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            fuzzy_window: DEFAULT_FUZZY_WINDOW,
            fuzz_factor: DEFAULT_FUZZ_FACTOR,
            max_mode: PatchMode::Structural,
        }
    }
}

/// Applies `diff` to `tree`. Patch-level failures are reported in the result;
/// `Err` is reserved for I/O failures of the tree itself.
pub fn apply_patch(
    tree: &mut dyn WorkTree,
    diff: &str,
    options: &ApplyOptions,
) -> Result<PatchApplyResult> {
    let parsed = match parse_patch(diff) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "patch rejected before application");
            return Ok(PatchApplyResult::failed(err.kind(), err.to_string()));
        }
    };

    let mut result = PatchApplyResult {
        patch_index: 0,
        mode_used: PatchMode::Vanilla,
        applied: true,
        failure_kind: None,
        detail: None,
        files: Vec::with_capacity(parsed.files.len()),
        binary_sections_stripped: parsed.binary_sections_stripped,
    };

    let changes = {
        let mut staged = StagedTree::new(&*tree);
        for file in &parsed.files {
            match apply_file(&mut staged, file, options) {
                Ok(mode) => {
                    result.mode_used = result.mode_used.max(mode);
                    result.files.push(FileApplyResult {
                        path: file.target_path().to_string(),
                        mode_used: mode,
                        applied: true,
                        failure_kind: None,
                        detail: None,
                    });
                }
                Err(FileFailure::Patch(mode, err)) => {
                    result.mode_used = result.mode_used.max(mode);
                    result.applied = false;
                    result.failure_kind = Some(err.kind());
                    result.detail = Some(err.to_string());
                    result.files.push(FileApplyResult {
                        path: file.target_path().to_string(),
                        mode_used: mode,
                        applied: false,
                        failure_kind: Some(err.kind()),
                        detail: Some(err.to_string()),
                    });
                    break;
                }
                Err(FileFailure::Io(err)) => return Err(err.into()),
            }
        }
        staged.into_changes()
    };

    if result.applied {
        changes.commit(tree)?;
        if result.mode_used > PatchMode::Vanilla {
            info!(
                mode = result.mode_used.as_str(),
                files = result.files.len(),
                "patch applied with fallback"
            );
        }
    }
    Ok(result)
}

/// Applies `diff` to the directory tree rooted at `root`.
pub fn apply_patch_to_dir(
    root: &Path,
    diff: &str,
    options: &ApplyOptions,
) -> Result<PatchApplyResult> {
    let mut tree = DirTree::new(root);
    apply_patch(&mut tree, diff, options)
}

enum FileFailure {
    Patch(PatchMode, PatchError),
    Io(io::Error),
}

enum Attempt {
    Patch(PatchError),
    Io(io::Error),
}

impl From<PatchError> for Attempt {
    fn from(err: PatchError) -> Self {
        Attempt::Patch(err)
    }
}

impl From<io::Error> for Attempt {
    fn from(err: io::Error) -> Self {
        Attempt::Io(err)
    }
}

struct FileChange {
    remove: Option<String>,
    write: Option<(String, String)>,
    mode: Option<u32>,
}

fn apply_file(
    staged: &mut StagedTree<'_>,
    file: &FilePatch,
    options: &ApplyOptions,
) -> Result<PatchMode, FileFailure> {
    let mut mode = PatchMode::Vanilla;
    loop {
        match attempt_file(staged, file, mode, options) {
            Ok(change) => {
                if let Some(path) = &change.remove {
                    staged.stage_remove(path);
                }
                if let Some((path, text)) = change.write {
                    if let Some(bits) = change.mode {
                        staged.stage_mode(&path, bits);
                    }
                    staged.stage_write(&path, text);
                }
                return Ok(mode);
            }
            Err(Attempt::Io(err)) => return Err(FileFailure::Io(err)),
            Err(Attempt::Patch(err)) => {
                let next = match (mode, err.kind()) {
                    (PatchMode::Vanilla, kind) if kind.allows_fallback() => PatchMode::Fuzzy,
                    (PatchMode::Fuzzy, PatchFailureKind::ContextMismatch) => PatchMode::Structural,
                    _ => return Err(FileFailure::Patch(mode, err)),
                };
                if next > options.max_mode {
                    return Err(FileFailure::Patch(mode, err));
                }
                debug!(
                    path = file.target_path(),
                    failed_mode = mode.as_str(),
                    error = %err,
                    "escalating patch mode"
                );
                mode = next;
            }
        }
    }
}

fn attempt_file(
    staged: &StagedTree<'_>,
    file: &FilePatch,
    mode: PatchMode,
    options: &ApplyOptions,
) -> Result<FileChange, Attempt> {
    let target = file.target_path().to_string();

    let (source, content) = if file.is_new {
        if staged.exists(&target)? {
            return Err(PatchError::FileAlreadyExists(target).into());
        }
        (None, String::new())
    } else {
        let source = file.source_path().unwrap_or(&target).to_string();
        if file.is_rename && source != target && staged.exists(&target)? {
            return Err(PatchError::FileAlreadyExists(target).into());
        }
        match read_text(staged, &source)? {
            Some(text) => (Some(source), text),
            None => {
                let creatable = mode >= PatchMode::Fuzzy
                    && !file.is_delete
                    && !file.is_rename
                    && !file.hunks.is_empty()
                    && file.hunks.iter().all(Hunk::is_pure_addition);
                if !creatable {
                    return Err(PatchError::FileNotFound(source).into());
                }
                (None, String::new())
            }
        }
    };

    let mut lines = split_lines(&content);
    apply_hunks(&mut lines, &target, &file.hunks, mode, options)?;

    if file.is_delete {
        if !lines.is_empty() {
            return Err(PatchError::ContextMismatch {
                path: target,
                detail: "deleted file still has content after its hunks".to_string(),
            }
            .into());
        }
        return Ok(FileChange {
            remove: source,
            write: None,
            mode: None,
        });
    }

    let remove = source.filter(|s| *s != target);
    Ok(FileChange {
        remove,
        write: Some((target, join_lines(&lines))),
        mode: file.new_mode,
    })
}

fn read_text(staged: &StagedTree<'_>, path: &str) -> Result<Option<String>, Attempt> {
    match staged.read_text(path) {
        Ok(text) => Ok(text),
        Err(err) if err.kind() == io::ErrorKind::InvalidData => Err(PatchError::ContextMismatch {
            path: path.to_string(),
            detail: err.to_string(),
        }
        .into()),
        Err(err) => Err(err.into()),
    }
}

fn apply_hunks(
    lines: &mut Vec<String>,
    path: &str,
    hunks: &[Hunk],
    mode: PatchMode,
    options: &ApplyOptions,
) -> Result<(), PatchError> {
    let mut offset: isize = 0;
    let mut floor = 0usize;
    for hunk in hunks {
        let declared = hunk.declared_index();
        let expected = (declared as isize + offset).max(0) as usize;
        let placement = locate(lines, hunk, expected, floor, mode, options).ok_or_else(|| {
            PatchError::ContextMismatch {
                path: path.to_string(),
                detail: format!(
                    "hunk at old line {} did not match ({} mode)",
                    hunk.old_start,
                    mode.as_str()
                ),
            }
        })?;
        let inserted = splice(lines, hunk, &placement);
        let start = placement.index as isize - placement.trimmed_lead as isize;
        offset = start - declared as isize + hunk.new_count as isize - hunk.old_count as isize;
        floor = placement.index + inserted;
    }
    Ok(())
}

fn locate(
    lines: &[String],
    hunk: &Hunk,
    expected: usize,
    floor: usize,
    mode: PatchMode,
    options: &ApplyOptions,
) -> Option<Placement> {
    if expected >= floor && vanilla_fit(lines, hunk, expected) {
        return Some(Placement::exact(expected));
    }
    if mode == PatchMode::Vanilla {
        return None;
    }
    let scope = Scope::window(expected, options.fuzzy_window, floor);
    if let Some(placement) = fuzzy_fit(lines, hunk, scope, options.fuzz_factor) {
        return Some(placement);
    }
    if mode == PatchMode::Structural {
        return structural_fit(lines, hunk, expected, floor, options.fuzz_factor);
    }
    None
}

/// Replaces the matched region and returns how many lines now occupy it.
/// Matched context keeps the file's own text.
fn splice(lines: &mut Vec<String>, hunk: &Hunk, placement: &Placement) -> usize {
    let total = hunk.lines.len();
    let mut leading = placement.trimmed_lead;
    let mut body_end = total;
    let mut trailing = placement.trimmed_trail;
    while trailing > 0 && body_end > 0 && hunk.lines[body_end - 1].kind == LineKind::Context {
        body_end -= 1;
        trailing -= 1;
    }
    let mut body_start = 0;
    while leading > 0 && body_start < body_end && hunk.lines[body_start].kind == LineKind::Context {
        body_start += 1;
        leading -= 1;
    }

    let mut cursor = placement.index;
    let mut replacement = Vec::new();
    for line in &hunk.lines[body_start..body_end] {
        match line.kind {
            LineKind::Context => {
                replacement.push(lines[cursor].clone());
                cursor += 1;
            }
            LineKind::Remove => cursor += 1,
            LineKind::Add => replacement.push(line.text.clone()),
        }
    }
    let inserted = replacement.len();
    lines.splice(placement.index..cursor, replacement);

    // A line that lost its end-of-file position needs a terminator again.
    let last = lines.len().saturating_sub(1);
    for line in lines.iter_mut().take(last) {
        if !line.ends_with('\n') {
            line.push('\n');
        }
    }
    inserted
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::testutil::{git_available, TempDirGuard};

    fn apply(tree: &mut MemTree, diff: &str) -> PatchApplyResult {
        apply_patch(tree, diff, &ApplyOptions::default()).expect("apply")
    }

    const EDIT_B: &str = "\
diff --git a/f.txt b/f.txt
--- a/f.txt
+++ b/f.txt
@@ -2,3 +2,3 @@
 a
-b
+B
 c
";

    #[test]
    fn vanilla_applies_at_declared_location() {
        let mut tree = MemTree::default().with_file("f.txt", "top\na\nb\nc\nend\n");
        let result = apply(&mut tree, EDIT_B);
        assert!(result.applied);
        assert_eq!(result.mode_used, PatchMode::Vanilla);
        assert_eq!(tree.text("f.txt").as_deref(), Some("top\na\nB\nc\nend\n"));
    }

    #[test]
    fn shifted_context_falls_back_to_fuzzy() {
        let mut tree =
            MemTree::default().with_file("f.txt", "x\ny\nz\ntop\na\nb\nc\nend\n");
        let result = apply(&mut tree, EDIT_B);
        assert!(result.applied, "{:?}", result);
        assert_eq!(result.mode_used, PatchMode::Fuzzy);
        assert_eq!(
            tree.text("f.txt").as_deref(),
            Some("x\ny\nz\ntop\na\nB\nc\nend\n")
        );
    }

    #[test]
    fn vanilla_only_reports_context_mismatch() {
        let mut tree = MemTree::default().with_file("f.txt", "x\ntop\na\nb\nc\n");
        let options = ApplyOptions {
            max_mode: PatchMode::Vanilla,
            ..ApplyOptions::default()
        };
        let result = apply_patch(&mut tree, EDIT_B, &options).expect("apply");
        assert!(!result.applied);
        assert_eq!(result.failure_kind, Some(PatchFailureKind::ContextMismatch));
        assert_eq!(tree.text("f.txt").as_deref(), Some("x\ntop\na\nb\nc\n"));
    }

    #[test]
    fn new_file_over_existing_path_is_rejected_without_overwrite() {
        let diff = "\
diff --git a/f.txt b/f.txt
new file mode 100644
--- /dev/null
+++ b/f.txt
@@ -0,0 +1 @@
+fresh
";
        let mut tree = MemTree::default().with_file("f.txt", "original\n");
        let result = apply(&mut tree, diff);
        assert!(!result.applied);
        assert_eq!(result.failure_kind, Some(PatchFailureKind::FileAlreadyExists));
        assert_eq!(result.mode_used, PatchMode::Vanilla);
        assert_eq!(tree.text("f.txt").as_deref(), Some("original\n"));
    }

    #[test]
    fn modify_header_on_absent_file_creates_it_in_fuzzy_mode() {
        let diff = "\
diff --git a/notes.txt b/notes.txt
--- a/notes.txt
+++ b/notes.txt
@@ -10,0 +11,2 @@
+first
+second
";
        let mut tree = MemTree::default();
        let result = apply(&mut tree, diff);
        assert!(result.applied, "{:?}", result);
        assert_eq!(result.mode_used, PatchMode::Fuzzy);
        assert_eq!(tree.text("notes.txt").as_deref(), Some("first\nsecond\n"));

        let options = ApplyOptions {
            max_mode: PatchMode::Vanilla,
            ..ApplyOptions::default()
        };
        let mut empty = MemTree::default();
        let strict = apply_patch(&mut empty, diff, &options).expect("apply");
        assert_eq!(strict.failure_kind, Some(PatchFailureKind::FileNotFound));
    }

    #[test]
    fn modify_with_context_on_absent_file_stays_not_found() {
        let mut tree = MemTree::default();
        let result = apply(&mut tree, EDIT_B);
        assert!(!result.applied);
        assert_eq!(result.failure_kind, Some(PatchFailureKind::FileNotFound));
        assert_eq!(result.mode_used, PatchMode::Fuzzy);
    }

    #[test]
    fn failure_in_second_file_leaves_tree_untouched() {
        let diff = format!(
            "{}diff --git a/g.txt b/g.txt\n--- a/g.txt\n+++ b/g.txt\n@@ -1 +1 @@\n-missing\n+present\n",
            EDIT_B
        );
        let mut tree = MemTree::default()
            .with_file("f.txt", "top\na\nb\nc\n")
            .with_file("g.txt", "unrelated\n");
        let before = tree.clone();
        let result = apply(&mut tree, &diff);
        assert!(!result.applied);
        assert_eq!(result.files.len(), 2);
        assert!(result.files[0].applied);
        assert!(!result.files[1].applied);
        assert_eq!(tree, before);
    }

    #[test]
    fn corrupt_patch_is_not_retried() {
        let diff = "\
diff --git a/f.txt b/f.txt
--- a/f.txt
+++ b/f.txt
@@ -1,6 +1,6 @@
 a
-b
+B
 c
";
        let mut tree = MemTree::default().with_file("f.txt", "a\nb\nc\n");
        let result = apply(&mut tree, diff);
        assert_eq!(result.failure_kind, Some(PatchFailureKind::CorruptPatch));
        assert_eq!(result.mode_used, PatchMode::Vanilla);
        assert!(result.files.is_empty());
    }

    #[test]
    fn structural_handles_moved_function() {
        let diff = "\
diff --git a/mod.py b/mod.py
--- a/mod.py
+++ b/mod.py
@@ -2,2 +2,2 @@ def target():
     x = 0
-    return x
+    return x + 1
";
        let mut moved = String::new();
        for i in 0..200 {
            moved.push_str(&format!("CONST_{} = {}\n", i, i));
        }
        moved.push_str("\ndef target():\n    x = 0\n    return x\n");

        let mut tree = MemTree::default().with_file("mod.py", &moved);
        let result = apply(&mut tree, diff);
        assert!(result.applied, "{:?}", result);
        assert_eq!(result.mode_used, PatchMode::Structural);
        assert!(tree
            .text("mod.py")
            .unwrap_or_default()
            .ends_with("def target():\n    x = 0\n    return x + 1\n"));
    }

    #[test]
    fn whitespace_only_drift_matches_in_fuzzy_mode() {
        let mut tree = MemTree::default().with_file("f.txt", "top\na \nb\nc\t\n");
        let result = apply(&mut tree, EDIT_B);
        assert!(result.applied, "{:?}", result);
        assert_eq!(result.mode_used, PatchMode::Fuzzy);
        assert_eq!(tree.text("f.txt").as_deref(), Some("top\na \nB\nc\t\n"));
    }

    #[test]
    fn rename_delete_and_mode_changes() {
        let diff = "\
diff --git a/old.txt b/new.txt
similarity index 90%
rename from old.txt
rename to new.txt
--- a/old.txt
+++ b/new.txt
@@ -1 +1 @@
-hello
+hello world
diff --git a/gone.txt b/gone.txt
deleted file mode 100644
--- a/gone.txt
+++ /dev/null
@@ -1 +0,0 @@
-bye
diff --git a/run.sh b/run.sh
old mode 100644
new mode 100755
";
        let mut tree = MemTree::default()
            .with_file("old.txt", "hello\n")
            .with_file("gone.txt", "bye\n")
            .with_file("run.sh", "echo\n");
        let result = apply(&mut tree, diff);
        assert!(result.applied, "{:?}", result);
        assert!(tree.text("old.txt").is_none());
        assert_eq!(tree.text("new.txt").as_deref(), Some("hello world\n"));
        assert!(tree.text("gone.txt").is_none());
        assert_eq!(tree.modes.get("run.sh"), Some(&0o100755));
    }

    #[test]
    fn vanilla_output_matches_git_apply() {
        if !git_available() {
            eprintln!("skipping: git not available");
            return;
        }
        let diff = "\
diff --git a/src/m.py b/src/m.py
--- a/src/m.py
+++ b/src/m.py
@@ -1,4 +1,5 @@
 import os\r
-X = 1\r
+X = 2\r
+Y = 3\r
 \r
 def f():\r
@@ -7,2 +8,2 @@ def f():
     pass
-# end
\\ No newline at end of file
+# done
diff --git a/docs/new.md b/docs/new.md
new file mode 100644
--- /dev/null
+++ b/docs/new.md
@@ -0,0 +1,2 @@
+# Title
+body
";
        let original = "import os\r\nX = 1\r\n\r\ndef f():\r\n    return 1\r\n\n    pass\n# end";
        let ours = TempDirGuard::new("bench_patch_ours");
        let theirs = TempDirGuard::new("bench_patch_git");
        for root in [ours.path(), theirs.path()] {
            std::fs::create_dir_all(root.join("src")).expect("src");
            std::fs::write(root.join("src/m.py"), original).expect("seed");
        }

        let result = apply_patch_to_dir(ours.path(), diff, &ApplyOptions::default()).expect("apply");
        assert!(result.applied, "{:?}", result);
        assert_eq!(result.mode_used, PatchMode::Vanilla);

        std::fs::write(theirs.path().join("change.diff"), diff).expect("diff file");
        let status = std::process::Command::new("git")
            .current_dir(theirs.path())
            .args(["apply", "--whitespace=nowarn", "change.diff"])
            .status()
            .expect("git apply");
        assert!(status.success());

        for rel in ["src/m.py", "docs/new.md"] {
            let a = std::fs::read(ours.path().join(rel)).expect("ours");
            let b = std::fs::read(theirs.path().join(rel)).expect("theirs");
            assert_eq!(a, b, "{} differs from git apply", rel);
        }
    }

    #[test]
    fn missing_trailing_newline_round_trips() {
        let diff = "\
diff --git a/f b/f
--- a/f
+++ b/f
@@ -1,2 +1,2 @@
 keep
-old
\\ No newline at end of file
+new
\\ No newline at end of file
";
        let mut tree = MemTree::default().with_file("f", "keep\nold");
        let result = apply(&mut tree, diff);
        assert!(result.applied, "{:?}", result);
        assert_eq!(tree.text("f").as_deref(), Some("keep\nnew"));
    }
}
