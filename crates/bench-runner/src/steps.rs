//! Script steps that touch the working tree. The local sandbox calls these
//! in-process; inside containers the `bench sandbox` helper calls them and
//! prints the resulting log lines.

use bench_core::{PatchApplyResult, PatchFailureKind, RunLog};
use bench_grade::Marker;
use bench_patch::{apply_patch_to_dir, ApplyOptions};
use std::path::Path;
use tracing::{debug, warn};

use crate::tree_state::{self, PreState};

/// Paths listed in an env-reset failure before the list is elided.
const MAX_REPORTED_PATHS: usize = 20;

pub fn capture_step(repo: &Path, base_revision: &str, log: &mut RunLog) -> Option<PreState> {
    match tree_state::capture(repo, base_revision) {
        Ok(pre) => Some(pre),
        Err(err) => {
            warn!(instance_id = %log.instance_id, error = %err, "pre-state capture failed");
            log.append_line(&Marker::ResetFailed.with_payload(&format!(
                "pre-state capture failed: {}",
                one_line(&err.to_string())
            )));
            None
        }
    }
}

pub fn checkout_step(repo: &Path, revision: &str, log: &mut RunLog) -> bool {
    match tree_state::checkout(repo, revision) {
        Ok(()) => true,
        Err(err) => {
            log.append_line(&Marker::ResetFailed.with_payload(&format!(
                "checkout of {} failed: {}",
                revision,
                one_line(&err.to_string())
            )));
            false
        }
    }
}

/// Applies one patch, logging its result. Returns whether it applied.
pub fn apply_step(
    repo: &Path,
    patch: &str,
    index: usize,
    label: &str,
    options: &ApplyOptions,
    log: &mut RunLog,
) -> bool {
    let mut result = match apply_patch_to_dir(repo, patch, options) {
        Ok(result) => result,
        Err(err) => PatchApplyResult::failed(
            PatchFailureKind::ContextMismatch,
            format!("working tree error: {}", err),
        ),
    };
    result.patch_index = index;
    match serde_json::to_string(&result) {
        Ok(raw) => log.append_line(&Marker::PatchResult.with_payload(&raw)),
        Err(err) => debug!(error = %err, "patch result not serializable"),
    }
    if result.applied {
        return true;
    }
    let kind = result
        .failure_kind
        .map(PatchFailureKind::as_str)
        .unwrap_or("unknown");
    log.append_line(&Marker::PatchApplyFailed.with_payload(&format!(
        "patch {} ({}): {}: {}",
        index,
        label,
        kind,
        one_line(result.detail.as_deref().unwrap_or(""))
    )));
    false
}

/// Restores the tree and checks it against the captured manifest. Never
/// fails; problems are logged as reset markers.
pub fn reset_step(repo: &Path, pre: &PreState, log: &mut RunLog) {
    if let Err(err) = tree_state::reset(repo, pre) {
        warn!(instance_id = %log.instance_id, error = %err, "reset failed");
        log.append_line(
            &Marker::ResetFailed.with_payload(&one_line(&err.to_string())),
        );
        return;
    }
    match tree_state::verify(repo, pre) {
        Ok(changed) if changed.is_empty() => log.append_line(&Marker::ResetCompleted.line()),
        Ok(changed) => {
            warn!(
                instance_id = %log.instance_id,
                changed = changed.len(),
                "tree differs from pre-state after reset"
            );
            let mut listed = changed
                .iter()
                .take(MAX_REPORTED_PATHS)
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            if changed.len() > MAX_REPORTED_PATHS {
                listed.push_str(&format!(" (+{} more)", changed.len() - MAX_REPORTED_PATHS));
            }
            log.append_line(&Marker::EnvResetFailed.with_payload(&listed));
        }
        Err(err) => log.append_line(
            &Marker::EnvResetFailed.with_payload(&one_line(&err.to_string())),
        ),
    }
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
