//! Test-runner output parsers. Each recognizes per-test result lines of one
//! runner; lines they do not understand are ignored. Later lines win.

use bench_core::TestStatus;
use std::collections::BTreeMap;

pub fn parse_test_output(text: &str) -> BTreeMap<String, TestStatus> {
    let mut statuses = BTreeMap::new();
    for raw in text.lines() {
        let line = strip_ansi(raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = parse_pytest_summary(line)
            .or_else(|| parse_pytest_verbose(line))
            .or_else(|| parse_cargo_test(line))
            .or_else(|| parse_go_test(line));
        if let Some((name, status)) = parsed {
            statuses.insert(name, status);
        }
    }
    statuses
}

fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

fn pytest_status(word: &str) -> Option<TestStatus> {
    match word {
        "PASSED" | "XFAIL" => Some(TestStatus::Passed),
        "FAILED" | "XPASS" => Some(TestStatus::Failed),
        "ERROR" => Some(TestStatus::Errored),
        "SKIPPED" => Some(TestStatus::Skipped),
        _ => None,
    }
}

/// `PASSED tests/test_a.py::test_x` and `FAILED tests/test_a.py::test_y - msg`
/// from `pytest -rA`.
fn parse_pytest_summary(line: &str) -> Option<(String, TestStatus)> {
    let (word, rest) = line.split_once(' ')?;
    let status = pytest_status(word)?;
    let rest = rest.trim();
    if rest.starts_with('[') {
        // `SKIPPED [1] tests/x.py:12: reason` names a location, not a test.
        return None;
    }
    let name = match rest.find(" - ") {
        Some(idx) => &rest[..idx],
        None => rest,
    };
    let name = name.trim();
    if !is_test_id(name) {
        return None;
    }
    Some((name.to_string(), status))
}

/// A pytest node id (`path::name`) or a bare module path. Rejects unittest's
/// `FAILED (failures=1)` tally.
fn is_test_id(name: &str) -> bool {
    if name.is_empty() || name.starts_with('(') || name.ends_with(')') && !name.contains("::") {
        return false;
    }
    if name.contains("::") {
        return true;
    }
    !name.contains(' ') && (name.contains('/') || name.ends_with(".py"))
}

/// `tests/test_a.py::test_x PASSED [ 50%]` from `pytest -v`.
fn parse_pytest_verbose(line: &str) -> Option<(String, TestStatus)> {
    let mut parts = line.split_whitespace();
    let name = parts.next()?;
    if !name.contains("::") {
        return None;
    }
    let status = pytest_status(parts.next()?)?;
    Some((name.to_string(), status))
}

/// `test module::case ... ok` from `cargo test`.
fn parse_cargo_test(line: &str) -> Option<(String, TestStatus)> {
    let rest = line.strip_prefix("test ")?;
    let (name, outcome) = rest.rsplit_once(" ... ")?;
    let status = match outcome.trim() {
        "ok" => TestStatus::Passed,
        "FAILED" => TestStatus::Failed,
        "ignored" => TestStatus::Skipped,
        other if other.starts_with("ignored,") => TestStatus::Skipped,
        _ => return None,
    };
    Some((name.trim().to_string(), status))
}

/// `--- PASS: TestName (0.00s)` from `go test -v`.
fn parse_go_test(line: &str) -> Option<(String, TestStatus)> {
    let rest = line.strip_prefix("--- ")?;
    let (word, rest) = rest.split_once(": ")?;
    let status = match word {
        "PASS" => TestStatus::Passed,
        "FAIL" => TestStatus::Failed,
        "SKIP" => TestStatus::Skipped,
        _ => return None,
    };
    let name = rest.split_whitespace().next()?;
    Some((name.to_string(), status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pytest_summary_lines() {
        let out = parse_test_output(
            "\
============ short test summary info ============
PASSED tests/test_a.py::test_ok
FAILED tests/test_a.py::test_bad[param 1] - AssertionError: boom
ERROR tests/test_b.py::test_setup
SKIPPED [1] tests/test_c.py:10: needs network
XFAIL tests/test_a.py::test_known - reason
",
        );
        assert_eq!(out.get("tests/test_a.py::test_ok"), Some(&TestStatus::Passed));
        assert_eq!(
            out.get("tests/test_a.py::test_bad[param 1]"),
            Some(&TestStatus::Failed)
        );
        assert_eq!(out.get("tests/test_b.py::test_setup"), Some(&TestStatus::Errored));
        assert_eq!(out.get("tests/test_a.py::test_known"), Some(&TestStatus::Passed));
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn pytest_verbose_lines_with_color() {
        let out = parse_test_output(
            "tests/test_a.py::test_ok \u{1b}[32mPASSED\u{1b}[0m [ 50%]\ntests/test_a.py::test_bad FAILED [100%]\n",
        );
        assert_eq!(out.get("tests/test_a.py::test_ok"), Some(&TestStatus::Passed));
        assert_eq!(out.get("tests/test_a.py::test_bad"), Some(&TestStatus::Failed));
    }

    #[test]
    fn cargo_and_go_lines() {
        let out = parse_test_output(
            "\
test parser::tests::round_trip ... ok
test parser::tests::slow ... ignored, needs data
test engine::it_fails ... FAILED
--- PASS: TestServe (0.01s)
--- FAIL: TestClose (0.00s)
",
        );
        assert_eq!(out.get("parser::tests::round_trip"), Some(&TestStatus::Passed));
        assert_eq!(out.get("parser::tests::slow"), Some(&TestStatus::Skipped));
        assert_eq!(out.get("engine::it_fails"), Some(&TestStatus::Failed));
        assert_eq!(out.get("TestServe"), Some(&TestStatus::Passed));
        assert_eq!(out.get("TestClose"), Some(&TestStatus::Failed));
    }

    #[test]
    fn unittest_tally_lines_are_not_tests() {
        let out = parse_test_output(
            "Ran 3 tests in 0.01s\n\nFAILED (failures=1)\nFAILED (errors=2, skipped=1)\nOK\nOK (skipped=1)\n",
        );
        assert!(out.is_empty(), "{:?}", out);

        let out = parse_test_output("ERROR tests/test_broken.py\nFAILED (failures=1)\n");
        assert_eq!(out.get("tests/test_broken.py"), Some(&TestStatus::Errored));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn unrelated_output_is_ignored() {
        let out = parse_test_output("collecting ...\nPASSED\nrunning 3 tests\ntest result: ok. 3 passed\n");
        assert!(out.is_empty(), "{:?}", out);
    }
}
