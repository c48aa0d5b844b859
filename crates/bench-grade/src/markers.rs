//! Sentinel lines written into run logs by the execution script.
//!
//! The strings are part of the log format: changing any of them requires a
//! new `MARKER_VERSION`.

use bench_core::TestPhase;

pub const MARKER_VERSION: &str = "bench_markers_v1";

/// Case-insensitive substring that proves every patch applied. Only lines
/// outside test output sections are searched.
pub const APPLIED_SENTINEL: &str = "applied patch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    AppliedPatch,
    PatchApplyFailed,
    PatchResult,
    ResetFailed,
    EnvResetFailed,
    ResetCompleted,
    StartTestOutput,
    EndTestOutput,
    TestsCompleted,
    TestsErrored,
    TestsTimedOut,
}

impl Marker {
    pub const ALL: [Marker; 11] = [
        Marker::AppliedPatch,
        Marker::PatchApplyFailed,
        Marker::PatchResult,
        Marker::ResetFailed,
        Marker::EnvResetFailed,
        Marker::ResetCompleted,
        Marker::StartTestOutput,
        Marker::EndTestOutput,
        Marker::TestsCompleted,
        Marker::TestsErrored,
        Marker::TestsTimedOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Marker::AppliedPatch => ">>>>> Applied Patch",
            Marker::PatchApplyFailed => ">>>>> Patch Apply Failed",
            Marker::PatchResult => ">>>>> Patch Result",
            Marker::ResetFailed => ">>>>> Reset Failed",
            Marker::EnvResetFailed => ">>>>> Env Reset Failed",
            Marker::ResetCompleted => ">>>>> Reset Completed",
            Marker::StartTestOutput => ">>>>> Start Test Output",
            Marker::EndTestOutput => ">>>>> End Test Output",
            Marker::TestsCompleted => ">>>>> Tests Completed",
            Marker::TestsErrored => ">>>>> Tests Errored",
            Marker::TestsTimedOut => ">>>>> Tests Timed Out",
        }
    }

    pub fn line(self) -> String {
        self.as_str().to_string()
    }

    pub fn with_phase(self, phase: TestPhase) -> String {
        format!("{} {}", self.as_str(), phase.as_str())
    }

    pub fn with_payload(self, payload: &str) -> String {
        format!("{} {}", self.as_str(), payload)
    }

    /// Marker at the start of `line` plus the text after it.
    pub fn parse(line: &str) -> Option<(Marker, &str)> {
        let line = line.trim_end_matches(['\r', '\n']);
        Marker::ALL.iter().find_map(|marker| {
            let rest = line.strip_prefix(marker.as_str())?;
            if rest.is_empty() || rest.starts_with(' ') {
                Some((*marker, rest.trim()))
            } else {
                None
            }
        })
    }

    pub fn is_test_terminal(self) -> bool {
        matches!(
            self,
            Marker::TestsCompleted | Marker::TestsErrored | Marker::TestsTimedOut
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_strings_are_pinned() {
        let pinned: Vec<&str> = Marker::ALL.iter().map(|m| m.as_str()).collect();
        assert_eq!(
            pinned,
            vec![
                ">>>>> Applied Patch",
                ">>>>> Patch Apply Failed",
                ">>>>> Patch Result",
                ">>>>> Reset Failed",
                ">>>>> Env Reset Failed",
                ">>>>> Reset Completed",
                ">>>>> Start Test Output",
                ">>>>> End Test Output",
                ">>>>> Tests Completed",
                ">>>>> Tests Errored",
                ">>>>> Tests Timed Out",
            ]
        );
        assert_eq!(MARKER_VERSION, "bench_markers_v1");
    }

    #[test]
    fn only_the_success_marker_contains_the_sentinel() {
        for marker in Marker::ALL {
            let hit = marker.as_str().to_ascii_lowercase().contains(APPLIED_SENTINEL);
            assert_eq!(hit, marker == Marker::AppliedPatch, "{:?}", marker);
        }
    }

    #[test]
    fn parse_splits_payload_and_rejects_prefix_collisions() {
        assert_eq!(
            Marker::parse(">>>>> Start Test Output after\r\n"),
            Some((Marker::StartTestOutput, "after"))
        );
        assert_eq!(
            Marker::parse(">>>>> Tests Timed Out"),
            Some((Marker::TestsTimedOut, ""))
        );
        assert_eq!(Marker::parse(">>>>> Applied Patches galore"), None);
        assert_eq!(Marker::parse("log: >>>>> Reset Failed"), None);
        assert_eq!(
            Marker::TestsCompleted.with_phase(TestPhase::Before),
            ">>>>> Tests Completed before"
        );
    }
}
