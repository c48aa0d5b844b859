use serde::{Deserialize, Serialize};

/// Patch application strategies, ordered from strictest to most permissive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchMode {
    Vanilla,
    Fuzzy,
    Structural,
}

impl PatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchMode::Vanilla => "vanilla",
            PatchMode::Fuzzy => "fuzzy",
            PatchMode::Structural => "structural",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchFailureKind {
    CorruptPatch,
    FileNotFound,
    FileAlreadyExists,
    ContextMismatch,
}

impl PatchFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchFailureKind::CorruptPatch => "corrupt_patch",
            PatchFailureKind::FileNotFound => "file_not_found",
            PatchFailureKind::FileAlreadyExists => "file_already_exists",
            PatchFailureKind::ContextMismatch => "context_mismatch",
        }
    }

    /// Whether the fuzzy strategy may be attempted after this failure.
    pub fn allows_fallback(self) -> bool {
        matches!(
            self,
            PatchFailureKind::FileNotFound | PatchFailureKind::ContextMismatch
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileApplyResult {
    pub path: String,
    pub mode_used: PatchMode,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<PatchFailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchApplyResult {
    #[serde(default)]
    pub patch_index: usize,
    pub mode_used: PatchMode,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<PatchFailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub files: Vec<FileApplyResult>,
    #[serde(default)]
    pub binary_sections_stripped: usize,
}

impl PatchApplyResult {
    pub fn failed(kind: PatchFailureKind, detail: impl Into<String>) -> Self {
        Self {
            patch_index: 0,
            mode_used: PatchMode::Vanilla,
            applied: false,
            failure_kind: Some(kind),
            detail: Some(detail.into()),
            files: Vec::new(),
            binary_sections_stripped: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Before,
    After,
}

impl TestPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            TestPhase::Before => "before",
            TestPhase::After => "after",
        }
    }

    pub fn parse(raw: &str) -> Option<TestPhase> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "before" => Some(TestPhase::Before),
            "after" => Some(TestPhase::After),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Errored,
    Skipped,
}

impl TestStatus {
    pub fn is_failing(self) -> bool {
        matches!(self, TestStatus::Failed | TestStatus::Errored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    FailToPass,
    NewlyFailing,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDelta {
    pub test: String,
    pub before: Option<TestStatus>,
    pub after: Option<TestStatus>,
    pub transition: Transition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Resolved,
    PartiallyResolved,
    Unresolved,
    NoTestsExecuted,
    ApplyFailed,
    ResetFailed,
    EnvResetFailed,
    TestsErrored,
    TestsTimedOut,
    InfrastructureFailure,
}

impl VerdictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictKind::Resolved => "resolved",
            VerdictKind::PartiallyResolved => "partially_resolved",
            VerdictKind::Unresolved => "unresolved",
            VerdictKind::NoTestsExecuted => "no_tests_executed",
            VerdictKind::ApplyFailed => "apply_failed",
            VerdictKind::ResetFailed => "reset_failed",
            VerdictKind::EnvResetFailed => "env_reset_failed",
            VerdictKind::TestsErrored => "tests_errored",
            VerdictKind::TestsTimedOut => "tests_timed_out",
            VerdictKind::InfrastructureFailure => "infrastructure_failure",
        }
    }

    pub fn is_scored(self) -> bool {
        self != VerdictKind::InfrastructureFailure
    }

    /// Applied and tests ran to completion, whatever the outcome.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            VerdictKind::Resolved
                | VerdictKind::PartiallyResolved
                | VerdictKind::Unresolved
                | VerdictKind::NoTestsExecuted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub instance_id: String,
    pub applied: bool,
    pub patch_mode_used: Option<PatchMode>,
    pub verdict_kind: VerdictKind,
    #[serde(default)]
    pub deltas: Vec<TestDelta>,
    #[serde(default)]
    pub patches: Vec<PatchApplyResult>,
    pub scored: bool,
    #[serde(default)]
    pub sandbox_tainted: bool,
    pub marker_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Verdict {
    pub fn new(instance_id: impl Into<String>, kind: VerdictKind, marker_version: &str) -> Self {
        Self {
            instance_id: instance_id.into(),
            applied: false,
            patch_mode_used: None,
            verdict_kind: kind,
            deltas: Vec::new(),
            patches: Vec::new(),
            scored: kind.is_scored(),
            sandbox_tainted: false,
            marker_version: marker_version.to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn fail_to_pass(&self) -> impl Iterator<Item = &TestDelta> {
        self.deltas
            .iter()
            .filter(|d| d.transition == Transition::FailToPass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_modes_order_by_permissiveness() {
        assert!(PatchMode::Vanilla < PatchMode::Fuzzy);
        assert!(PatchMode::Fuzzy < PatchMode::Structural);
        assert_eq!(
            [PatchMode::Fuzzy, PatchMode::Vanilla].iter().max(),
            Some(&PatchMode::Fuzzy)
        );
    }

    #[test]
    fn only_locating_failures_allow_fallback() {
        assert!(PatchFailureKind::ContextMismatch.allows_fallback());
        assert!(PatchFailureKind::FileNotFound.allows_fallback());
        assert!(!PatchFailureKind::CorruptPatch.allows_fallback());
        assert!(!PatchFailureKind::FileAlreadyExists.allows_fallback());
    }

    #[test]
    fn infrastructure_failures_are_unscored() {
        let verdict = Verdict::new("a", VerdictKind::InfrastructureFailure, "v1");
        assert!(!verdict.scored);
        assert!(Verdict::new("a", VerdictKind::ApplyFailed, "v1").scored);
    }

    #[test]
    fn verdict_kind_serializes_snake_case() {
        let raw = serde_json::to_string(&VerdictKind::TestsTimedOut).expect("serialize");
        assert_eq!(raw, "\"tests_timed_out\"");
        assert_eq!(VerdictKind::TestsTimedOut.as_str(), "tests_timed_out");
    }
}
