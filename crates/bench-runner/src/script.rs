use bench_core::{Instance, TestPhase};
use bench_grade::Marker;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::{shell_join, shell_quote};

/// One ordered action of an execution script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    CapturePreState,
    CheckoutBase { revision: String },
    /// Applies `ExecutionScript::patches[index]`.
    ApplyPatch { index: usize, label: String },
    MarkApplied,
    RunTests { phase: TestPhase, command: String },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionScript {
    pub instance_id: String,
    pub base_revision: String,
    pub patches: Vec<String>,
    pub env: Vec<(String, String)>,
    pub test_timeout_secs: u64,
    pub steps: Vec<Step>,
}

impl ExecutionScript {
    pub fn test_phases(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| matches!(s, Step::RunTests { .. }))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOptions {
    pub baseline_tests: bool,
    pub test_timeout_secs: u64,
    /// Where the repository lives inside the sandbox.
    pub repo_dir: String,
    /// Scratch directory inside the sandbox holding patches and the pre-state.
    pub work_dir: String,
    /// `bench` executable inside the sandbox.
    pub bench_binary: String,
    pub fuzzy_window: usize,
    pub fuzz_factor: usize,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            baseline_tests: true,
            test_timeout_secs: 1_800,
            repo_dir: "/testbed".to_string(),
            work_dir: "/tmp/bench".to_string(),
            bench_binary: "/tmp/bench/bench".to_string(),
            fuzzy_window: bench_patch::DEFAULT_FUZZY_WINDOW,
            fuzz_factor: bench_patch::DEFAULT_FUZZ_FACTOR,
        }
    }
}

fn patch_label(instance: &Instance, index: usize) -> String {
    let baseline = instance.baseline_patch_count();
    if instance.patch_list.len() > baseline && index == instance.patch_list.len() - 1 {
        "final".to_string()
    } else {
        format!("setup-{}", index)
    }
}

/// Test files touched by the patches, in first-seen order.
pub fn derive_test_directives(patches: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for patch in patches {
        let Ok(parsed) = bench_patch::parse_patch(patch) else {
            continue;
        };
        for file in parsed.files {
            if file.is_delete {
                continue;
            }
            let path = file.target_path().to_string();
            if is_test_path(&path) && seen.insert(path.clone()) {
                out.push(path);
            }
        }
    }
    out
}

fn is_test_path(path: &str) -> bool {
    let mut parts: Vec<&str> = path.split('/').collect();
    let Some(name) = parts.pop() else {
        return false;
    };
    if parts
        .iter()
        .any(|dir| matches!(*dir, "test" | "tests" | "testing"))
    {
        return true;
    }
    let stem = name.split('.').next().unwrap_or(name);
    name.starts_with("test_")
        || stem.ends_with("_test")
        || stem.ends_with("_tests")
        || name.contains(".test.")
        || name.contains(".spec.")
}

pub fn test_command_for(instance: &Instance) -> String {
    let directives = if instance.test_directives.is_empty() {
        derive_test_directives(&instance.patch_list)
    } else {
        instance.test_directives.clone()
    };
    let base = instance.environment_spec.test_command.trim();
    if directives.is_empty() {
        return base.to_string();
    }
    format!("{} {}", base, shell_join(&directives))
}

/// Builds the step list: capture, checkout, baseline patches, optional
/// baseline tests, remaining patches, success sentinel, tests, reset.
pub fn synthesize(instance: &Instance, options: &ScriptOptions) -> ExecutionScript {
    let command = test_command_for(instance);
    let baseline = instance.baseline_patch_count();
    let mut steps = vec![
        Step::CapturePreState,
        Step::CheckoutBase {
            revision: instance.base_revision.clone(),
        },
    ];
    let apply = |index: usize| Step::ApplyPatch {
        index,
        label: patch_label(instance, index),
    };
    steps.extend((0..baseline).map(apply));
    if options.baseline_tests {
        steps.push(Step::RunTests {
            phase: TestPhase::Before,
            command: command.clone(),
        });
    }
    steps.extend((baseline..instance.patch_list.len()).map(apply));
    steps.push(Step::MarkApplied);
    steps.push(Step::RunTests {
        phase: TestPhase::After,
        command,
    });
    steps.push(Step::Reset);

    ExecutionScript {
        instance_id: instance.id.clone(),
        base_revision: instance.base_revision.clone(),
        patches: instance.patch_list.clone(),
        env: instance
            .environment_spec
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        test_timeout_secs: options.test_timeout_secs,
        steps,
    }
}

pub fn patch_file_name(index: usize) -> String {
    format!("patch_{}.diff", index)
}

/// Renders the script for bash inside a container. Apply, capture and reset
/// go through the `bench sandbox` helper; an EXIT trap guarantees the reset.
pub fn render_shell(script: &ExecutionScript, options: &ScriptOptions) -> String {
    let bench = shell_quote(&options.bench_binary);
    let repo = shell_quote(&options.repo_dir);
    let work = shell_quote(&options.work_dir);
    let state = shell_quote(&format!("{}/pre_state.json", options.work_dir));

    let mut out = String::new();
    let _ = writeln!(out, "#!/usr/bin/env bash");
    let _ = writeln!(out, "# instance: {}", script.instance_id);
    let _ = writeln!(out, "set -uo pipefail");
    let _ = writeln!(out, "export RUST_LOG=warn");
    for (key, value) in &script.env {
        let _ = writeln!(out, "export {}={}", key, shell_quote(value));
    }
    let _ = writeln!(out, "mkdir -p {}", work);
    let _ = writeln!(out, "cd {} || exit 1", repo);
    let _ = writeln!(
        out,
        "bench_reset() {{ {} sandbox reset --repo {} --state {}; }}",
        bench, repo, state
    );

    for step in &script.steps {
        match step {
            Step::CapturePreState => {
                let _ = writeln!(
                    out,
                    "{} sandbox capture --repo {} --base {} --out {} || exit 1",
                    bench,
                    repo,
                    shell_quote(&script.base_revision),
                    state
                );
                let _ = writeln!(out, "trap bench_reset EXIT");
            }
            Step::CheckoutBase { revision } => {
                let _ = writeln!(
                    out,
                    "git -c advice.detachedHead=false checkout -q -f {} || {{ echo {}; exit 1; }}",
                    shell_quote(revision),
                    shell_quote(
                        &Marker::ResetFailed.with_payload(&format!("checkout of {} failed", revision))
                    )
                );
            }
            Step::ApplyPatch { index, label } => {
                let _ = writeln!(
                    out,
                    "{} sandbox apply --repo {} --patch {} --index {} --label {} --fuzzy-window {} --fuzz-factor {} || exit 1",
                    bench,
                    repo,
                    shell_quote(&format!("{}/{}", options.work_dir, patch_file_name(*index))),
                    index,
                    shell_quote(label),
                    options.fuzzy_window,
                    options.fuzz_factor
                );
            }
            Step::MarkApplied => {
                let _ = writeln!(out, "echo {}", shell_quote(Marker::AppliedPatch.as_str()));
            }
            Step::RunTests { phase, command } => {
                render_test_step(&mut out, *phase, command, script.test_timeout_secs);
            }
            Step::Reset => {
                let _ = writeln!(out, "trap - EXIT");
                let _ = writeln!(out, "bench_reset");
            }
        }
    }
    out
}

/// Exit 124 means `timeout` fired. 137 is only a timeout when the budget
/// elapsed; an earlier SIGKILL (OOM killer, a test killing itself) is an error.
fn render_test_step(out: &mut String, phase: TestPhase, command: &str, timeout_secs: u64) {
    let echo = |marker: Marker| shell_quote(&marker.with_phase(phase));
    let _ = writeln!(out, "echo {}", echo(Marker::StartTestOutput));
    let _ = writeln!(out, "started=$SECONDS");
    let _ = writeln!(
        out,
        "timeout -k 5 {} bash -c {} 2>&1",
        timeout_secs,
        shell_quote(command)
    );
    let _ = writeln!(out, "rc=$?");
    let _ = writeln!(out, "echo {}", echo(Marker::EndTestOutput));
    let _ = writeln!(out, "case $rc in");
    let _ = writeln!(out, "  124) echo {}; exit 1 ;;", echo(Marker::TestsTimedOut));
    let _ = writeln!(
        out,
        "  137) if (( SECONDS - started >= {} )); then echo {}; else echo {}\" killed exit 137\"; fi; exit 1 ;;",
        timeout_secs,
        echo(Marker::TestsTimedOut),
        echo(Marker::TestsErrored)
    );
    let _ = writeln!(
        out,
        "  126|127) echo {}\" exit $rc\"; exit 1 ;;",
        echo(Marker::TestsErrored)
    );
    let _ = writeln!(out, "  *) echo {} ;;", echo(Marker::TestsCompleted));
    let _ = writeln!(out, "esac");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_core::EnvironmentSpec;

    const TEST_PATCH: &str = "\
diff --git a/tests/test_calc.py b/tests/test_calc.py
--- a/tests/test_calc.py
+++ b/tests/test_calc.py
@@ -1 +1,2 @@
 import calc
+assert calc.add(1, 1) == 2
";

    const FIX_PATCH: &str = "\
diff --git a/calc.py b/calc.py
--- a/calc.py
+++ b/calc.py
@@ -1 +1 @@
-def add(a, b): return a - b
+def add(a, b): return a + b
";

    fn instance() -> Instance {
        Instance {
            id: "calc__calc-7".to_string(),
            repository: "https://example.invalid/calc.git".to_string(),
            base_revision: "abc123".to_string(),
            environment_spec: EnvironmentSpec {
                platform: "ubuntu:22.04".to_string(),
                toolchain: "python3.11".to_string(),
                test_command: "pytest -rA".to_string(),
                ..EnvironmentSpec::default()
            },
            test_directives: Vec::new(),
            patch_list: vec![TEST_PATCH.to_string(), FIX_PATCH.to_string()],
            baseline_patches: None,
            setup: Vec::new(),
        }
    }

    #[test]
    fn steps_follow_run_order() {
        let script = synthesize(&instance(), &ScriptOptions::default());
        let names: Vec<String> = script
            .steps
            .iter()
            .map(|s| match s {
                Step::CapturePreState => "capture".to_string(),
                Step::CheckoutBase { .. } => "checkout".to_string(),
                Step::ApplyPatch { index, label } => format!("apply{}:{}", index, label),
                Step::MarkApplied => "applied".to_string(),
                Step::RunTests { phase, .. } => format!("tests:{}", phase.as_str()),
                Step::Reset => "reset".to_string(),
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "capture",
                "checkout",
                "apply0:setup-0",
                "tests:before",
                "apply1:final",
                "applied",
                "tests:after",
                "reset"
            ]
        );
        assert_eq!(script.test_phases(), 2);
    }

    #[test]
    fn baseline_tests_can_be_disabled() {
        let options = ScriptOptions {
            baseline_tests: false,
            ..ScriptOptions::default()
        };
        let script = synthesize(&instance(), &options);
        assert_eq!(script.test_phases(), 1);
        assert_eq!(script.steps.last(), Some(&Step::Reset));
    }

    #[test]
    fn directives_are_derived_from_touched_test_files() {
        assert_eq!(test_command_for(&instance()), "pytest -rA tests/test_calc.py");
        let mut explicit = instance();
        explicit.test_directives = vec!["tests/test_calc.py::test_add".to_string()];
        assert_eq!(
            test_command_for(&explicit),
            "pytest -rA tests/test_calc.py::test_add"
        );
    }

    #[test]
    fn test_path_heuristics() {
        for path in [
            "tests/unit/helpers.py",
            "pkg/test/x.go",
            "test_thing.py",
            "pkg/thing_test.go",
            "src/app.test.ts",
            "src/app.spec.js",
            "crate/lib_tests.rs",
        ] {
            assert!(is_test_path(path), "{}", path);
        }
        for path in ["src/contest.py", "latest/notes.md", "testimony.txt"] {
            assert!(!is_test_path(path), "{}", path);
        }
    }

    #[test]
    fn rendered_script_emits_markers_and_traps_reset() {
        let script = synthesize(&instance(), &ScriptOptions::default());
        let shell = render_shell(&script, &ScriptOptions::default());
        assert!(shell.contains("trap bench_reset EXIT"));
        assert!(shell.contains(
            "/tmp/bench/bench sandbox apply --repo /testbed --patch /tmp/bench/patch_1.diff --index 1 --label final"
        ));
        assert!(shell.contains("echo '>>>>> Applied Patch'"));
        assert!(shell.contains("timeout -k 5 1800 bash -c 'pytest -rA tests/test_calc.py' 2>&1"));
        assert!(shell.contains("124) echo '>>>>> Tests Timed Out after'; exit 1 ;;"));
        let apply_final = shell.find("--index 1").expect("final apply");
        let sentinel = shell.find("echo '>>>>> Applied Patch'").expect("sentinel");
        assert!(apply_final < sentinel);
        assert!(shell.trim_end().ends_with("bench_reset"));
    }

    fn run_test_step(command: &str, timeout_secs: u64) -> String {
        let mut step = String::new();
        render_test_step(&mut step, TestPhase::After, command, timeout_secs);
        let out = std::process::Command::new("bash")
            .arg("-c")
            .arg(&step)
            .output()
            .expect("run bash");
        String::from_utf8_lossy(&out.stdout).to_string()
    }

    #[test]
    fn sigkill_before_the_budget_is_an_error_not_a_timeout() {
        let killed = run_test_step("kill -9 $$", 60);
        assert!(killed.contains(">>>>> Tests Errored after killed exit 137"), "{}", killed);
        assert!(!killed.contains("Timed Out"), "{}", killed);

        let slow = run_test_step("sleep 30", 1);
        assert!(slow.contains(">>>>> Tests Timed Out after"), "{}", slow);

        let done = run_test_step("echo PASSED tests/t.py::a", 60);
        assert!(done.contains(">>>>> Tests Completed after"), "{}", done);
    }
}
