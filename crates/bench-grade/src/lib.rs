//! Turns a captured run log into a verdict. Grading reads nothing but the
//! log text, so re-grading an old log always yields the same verdict.

mod markers;
mod parsers;

pub use markers::{Marker, APPLIED_SENTINEL, MARKER_VERSION};
pub use parsers::parse_test_output;

use bench_core::{
    PatchApplyResult, RunLog, TestDelta, TestPhase, TestStatus, Transition, Verdict, VerdictKind,
};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
struct ScannedLog {
    events: Vec<(usize, Marker, String)>,
    sections: BTreeMap<TestPhase, String>,
    patches: Vec<PatchApplyResult>,
    unreadable_patch_results: usize,
    /// Sentinel seen on a line outside any test output section.
    applied: bool,
}

fn has_sentinel(line: &str) -> bool {
    line.to_ascii_lowercase().contains(APPLIED_SENTINEL)
}

fn scan(text: &str) -> ScannedLog {
    let mut scanned = ScannedLog::default();
    let mut open: Option<TestPhase> = None;
    for (idx, line) in text.lines().enumerate() {
        let Some((marker, payload)) = Marker::parse(line) else {
            match open {
                Some(phase) => {
                    let section = scanned.sections.entry(phase).or_default();
                    section.push_str(line);
                    section.push('\n');
                }
                None => scanned.applied |= has_sentinel(line),
            }
            continue;
        };
        scanned.applied |= has_sentinel(line);
        match marker {
            Marker::StartTestOutput => {
                open = TestPhase::parse(payload);
                if let Some(phase) = open {
                    scanned.sections.entry(phase).or_default();
                }
            }
            Marker::PatchResult => match serde_json::from_str::<PatchApplyResult>(payload) {
                Ok(result) => scanned.patches.push(result),
                Err(_) => scanned.unreadable_patch_results += 1,
            },
            // Any other marker closes an open section, even without a matching end.
            _ => open = None,
        }
        scanned.events.push((idx, marker, payload.to_string()));
    }
    scanned
}

fn failure_verdict(marker: Marker) -> Option<VerdictKind> {
    match marker {
        Marker::PatchApplyFailed => Some(VerdictKind::ApplyFailed),
        Marker::ResetFailed => Some(VerdictKind::ResetFailed),
        Marker::EnvResetFailed => Some(VerdictKind::EnvResetFailed),
        Marker::TestsErrored => Some(VerdictKind::TestsErrored),
        Marker::TestsTimedOut => Some(VerdictKind::TestsTimedOut),
        _ => None,
    }
}

fn is_reset_failure(marker: Marker) -> bool {
    matches!(marker, Marker::ResetFailed | Marker::EnvResetFailed)
}

fn transition(before: Option<TestStatus>, after: Option<TestStatus>) -> Transition {
    let was_passing = before == Some(TestStatus::Passed);
    let was_failing = before.map_or(true, TestStatus::is_failing);
    match after {
        Some(TestStatus::Passed) if was_failing => Transition::FailToPass,
        Some(status) if status.is_failing() && (was_passing || before.is_none()) => {
            Transition::NewlyFailing
        }
        _ => Transition::Unchanged,
    }
}

pub fn compute_deltas(
    before: &BTreeMap<String, TestStatus>,
    after: &BTreeMap<String, TestStatus>,
) -> Vec<TestDelta> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    names
        .into_iter()
        .map(|name| {
            let b = before.get(name).copied();
            let a = after.get(name).copied();
            TestDelta {
                test: name.clone(),
                before: b,
                after: a,
                transition: transition(b, a),
            }
        })
        .collect()
}

pub fn grade(log: &RunLog) -> Verdict {
    let instance_id = log.instance_id.as_str();
    if log.is_blank() {
        return Verdict::new(instance_id, VerdictKind::InfrastructureFailure, MARKER_VERSION)
            .with_detail("run log is empty");
    }

    let text = log.text();
    let scanned = scan(text);
    let applied = scanned.applied;
    let last_test_terminal = scanned
        .events
        .iter()
        .filter(|(_, marker, _)| marker.is_test_terminal())
        .map(|(idx, _, _)| *idx)
        .max();

    let mut sandbox_tainted = false;
    let mut decided: Option<(VerdictKind, String)> = None;
    for (idx, marker, payload) in &scanned.events {
        let Some(kind) = failure_verdict(*marker) else {
            continue;
        };
        let after_tests = last_test_terminal.is_some_and(|last| *idx > last);
        if is_reset_failure(*marker) && after_tests {
            sandbox_tainted = true;
            continue;
        }
        if decided.is_none() {
            decided = Some((kind, payload.clone()));
        }
    }

    let mut verdict = match decided {
        Some((kind, payload)) => {
            let verdict = Verdict::new(instance_id, kind, MARKER_VERSION);
            if payload.is_empty() {
                verdict
            } else {
                verdict.with_detail(payload)
            }
        }
        None if !applied => Verdict::new(instance_id, VerdictKind::ApplyFailed, MARKER_VERSION)
            .with_detail("no applied-patch sentinel in log"),
        None => {
            let before = scanned
                .sections
                .get(&TestPhase::Before)
                .map(|s| parse_test_output(s))
                .unwrap_or_default();
            let after = scanned
                .sections
                .get(&TestPhase::After)
                .map(|s| parse_test_output(s))
                .unwrap_or_default();
            let deltas = compute_deltas(&before, &after);
            let kind = if after.is_empty() {
                VerdictKind::NoTestsExecuted
            } else {
                let fixed = deltas
                    .iter()
                    .any(|d| d.transition == Transition::FailToPass);
                let failing = after.values().any(|s| s.is_failing());
                match (fixed, failing) {
                    (true, false) => VerdictKind::Resolved,
                    (true, true) => VerdictKind::PartiallyResolved,
                    (false, _) => VerdictKind::Unresolved,
                }
            };
            let mut verdict = Verdict::new(instance_id, kind, MARKER_VERSION);
            verdict.deltas = deltas;
            verdict
        }
    };

    verdict.applied = applied && verdict.verdict_kind != VerdictKind::ApplyFailed;
    verdict.patch_mode_used = scanned
        .patches
        .iter()
        .filter(|p| p.applied)
        .map(|p| p.mode_used)
        .max();
    verdict.patches = scanned.patches;
    verdict.sandbox_tainted = sandbox_tainted;
    if scanned.unreadable_patch_results > 0 && verdict.detail.is_none() {
        verdict.detail = Some(format!(
            "{} patch result line(s) could not be parsed",
            scanned.unreadable_patch_results
        ));
    }
    verdict
}
