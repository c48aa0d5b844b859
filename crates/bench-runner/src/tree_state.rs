//! Snapshot and restore of a working tree around a run.
//!
//! The pre-state is the diff from the base revision to whatever the tree
//! held before the run (staged, unstaged and untracked), plus a digest
//! manifest of every non-ignored file. Restoring checks out the base, removes
//! untracked files and reapplies the diff; the manifest then proves the
//! restore was exact.

use anyhow::{anyhow, Context, Result};
use bench_core::{diff_manifests, sha256_file};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;

use crate::{git, run_checked_command, run_checked_command_with_input};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreState {
    pub base_revision: String,
    pub diff: String,
    pub manifest: BTreeMap<String, String>,
}

impl PreState {
    pub fn is_clean(&self) -> bool {
        self.diff.trim().is_empty()
    }
}

/// Captures the tree without touching the real index: staging happens in a
/// scratch copy of it, so anything the caller had staged stays staged.
pub fn capture(repo: &Path, base_revision: &str) -> Result<PreState> {
    let index = git_path(repo, "index")?;
    let scratch = index.with_extension("bench-capture");
    if index.is_file() {
        fs::copy(&index, &scratch)
            .with_context(|| format!("failed to copy {}", index.display()))?;
    }
    let diff_result = staged_diff(repo, &scratch, base_revision);
    let _ = fs::remove_file(&scratch);

    let out = diff_result?;
    let diff = String::from_utf8(out.stdout)
        .map_err(|_| anyhow!("pre-state diff against {} is not UTF-8", base_revision))?;
    Ok(PreState {
        base_revision: base_revision.to_string(),
        diff,
        manifest: tree_manifest(repo)?,
    })
}

fn staged_diff(repo: &Path, scratch_index: &Path, base_revision: &str) -> Result<Output> {
    let mut add = git(repo);
    add.env("GIT_INDEX_FILE", scratch_index).args(["add", "-A"]);
    run_checked_command(add, "git add")?;

    let mut diff = git(repo);
    diff.env("GIT_INDEX_FILE", scratch_index)
        .args(["diff", "--cached", "--binary", "--full-index", base_revision]);
    run_checked_command(diff, "git diff")
}

fn git_path(repo: &Path, name: &str) -> Result<PathBuf> {
    let mut cmd = git(repo);
    cmd.args(["rev-parse", "--git-path", name]);
    let out = run_checked_command(cmd, "git rev-parse")?;
    let raw = String::from_utf8_lossy(&out.stdout).trim().to_string();
    let path = PathBuf::from(raw);
    Ok(if path.is_absolute() { path } else { repo.join(path) })
}

/// Digest of every tracked or untracked, non-ignored file.
pub fn tree_manifest(repo: &Path) -> Result<BTreeMap<String, String>> {
    let mut ls = git(repo);
    ls.args(["ls-files", "-z", "-c", "-o", "--exclude-standard"]);
    let out = run_checked_command(ls, "git ls-files")?;
    let mut manifest = BTreeMap::new();
    for raw in out.stdout.split(|b| *b == 0) {
        if raw.is_empty() {
            continue;
        }
        let rel = String::from_utf8_lossy(raw).to_string();
        let full = repo.join(&rel);
        // Tracked files deleted in the worktree are listed but absent.
        if !full.is_file() {
            continue;
        }
        manifest.insert(rel, sha256_file(&full)?);
    }
    Ok(manifest)
}

pub fn checkout(repo: &Path, revision: &str) -> Result<()> {
    let mut cmd = git(repo);
    cmd.args(["-c", "advice.detachedHead=false", "checkout", "-q", "-f", revision]);
    run_checked_command(cmd, "git checkout")?;
    Ok(())
}

/// Returns the tree to `pre`. An empty pre-state diff is never applied.
pub fn reset(repo: &Path, pre: &PreState) -> Result<()> {
    checkout(repo, &pre.base_revision)?;

    let mut clean = git(repo);
    clean.args(["clean", "-fdq"]);
    run_checked_command(clean, "git clean")?;

    if pre.is_clean() {
        return Ok(());
    }
    let mut apply = git(repo);
    apply.args(["apply", "--binary", "--whitespace=nowarn", "-"]);
    run_checked_command_with_input(apply, pre.diff.clone().into_bytes(), "git apply pre-state")?;
    Ok(())
}

/// Paths whose current contents differ from the captured manifest.
pub fn verify(repo: &Path, pre: &PreState) -> Result<Vec<String>> {
    Ok(diff_manifests(&pre.manifest, &tree_manifest(repo)?))
}
