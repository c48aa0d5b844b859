use anyhow::{anyhow, Context, Result};
use bench_core::{ensure_dir, Instance, LayerKey, RunLog, TestPhase};
use bench_grade::Marker;
use bench_patch::ApplyOptions;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::images::{docker_image_name, LocalLayerBuilder};
use crate::script::{patch_file_name, render_shell, ExecutionScript, ScriptOptions, Step};
use crate::steps;
use crate::tree_state::PreState;
use crate::{hard_kill_pid_and_group, run_checked_command, spawn_in_new_group};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const SCRIPT_FILE: &str = "script.sh";
const PATCHES_DIR: &str = "patches";

#[derive(Debug, Error)]
pub enum SandboxError {
    /// The sandbox never started; retrying may help.
    #[error("sandbox launch failed: {0}")]
    Launch(String),
    #[error("sandbox execution failed: {0}")]
    Execution(String),
}

impl SandboxError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SandboxError::Launch(_))
    }
}

pub struct ExecutionContext<'a> {
    pub worker_id: usize,
    pub instance: &'a Instance,
    /// Instance layer the sandbox starts from.
    pub layer: &'a LayerKey,
    /// Per-instance output directory.
    pub instance_dir: &'a Path,
}

pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;
    fn preflight(&self) -> Result<()>;
    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        script: &ExecutionScript,
    ) -> Result<RunLog, SandboxError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Completed(Option<i32>),
    Errored(String),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct TestRun {
    pub output: String,
    pub outcome: TestOutcome,
}

fn spawn_line_reader<R: Read + Send + 'static>(
    pipe: R,
    lines: Arc<Mutex<Vec<String>>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if let Ok(mut lines) = lines.lock() {
                        lines.push(line);
                    }
                }
            }
        }
    })
}

fn drain_lines(lines: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    lines
        .lock()
        .map(|mut l| std::mem::take(&mut *l))
        .unwrap_or_default()
}

/// Waits for `child` until `deadline`; `None` means it was killed.
fn wait_with_deadline(
    child: &mut Child,
    deadline: Instant,
    kill: impl Fn(&mut Child),
) -> Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait().context("try_wait child")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill(child);
            child.wait().context("wait child after kill")?;
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Runs `command` under bash in its own process group with stderr folded into
/// stdout. On timeout the whole group is killed; after a normal exit any
/// stragglers left in the group are killed too.
pub fn run_test_command(
    dir: &Path,
    command: &str,
    env: &[(String, String)],
    timeout: Duration,
) -> TestRun {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(format!("exec 2>&1\n{}", command))
        .current_dir(dir)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    spawn_in_new_group(&mut cmd);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            return TestRun {
                output: String::new(),
                outcome: TestOutcome::Errored(format!("failed to spawn bash: {}", err)),
            }
        }
    };
    let pid = child.id();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let reader = child
        .stdout
        .take()
        .map(|pipe| spawn_line_reader(pipe, lines.clone()));

    let waited = wait_with_deadline(&mut child, Instant::now() + timeout, |_| {
        hard_kill_pid_and_group(pid)
    });
    hard_kill_pid_and_group(pid);
    if let Some(reader) = reader {
        let _ = reader.join();
    }
    let output = drain_lines(&lines).join("\n");

    let outcome = match waited {
        Ok(None) => TestOutcome::TimedOut,
        Ok(Some(status)) => match status.code() {
            Some(code @ (126 | 127)) => TestOutcome::Errored(format!("exit {}", code)),
            Some(code) => TestOutcome::Completed(Some(code)),
            None => TestOutcome::Errored(format!("killed by signal {}", signal_of(&status))),
        },
        Err(err) => TestOutcome::Errored(format!("{:#}", err)),
    };
    TestRun { output, outcome }
}

#[cfg(unix)]
fn signal_of(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or_default()
}

#[cfg(not(unix))]
fn signal_of(_status: &ExitStatus) -> i32 {
    0
}

fn run_tests_step(
    tree: &Path,
    phase: TestPhase,
    command: &str,
    env: &[(String, String)],
    timeout: Duration,
    log: &mut RunLog,
) -> bool {
    log.append_line(&Marker::StartTestOutput.with_phase(phase));
    let run = run_test_command(tree, command, env, timeout);
    if !run.output.is_empty() {
        log.append_line(&run.output);
    }
    log.append_line(&Marker::EndTestOutput.with_phase(phase));
    match run.outcome {
        TestOutcome::Completed(_) => {
            log.append_line(&Marker::TestsCompleted.with_phase(phase));
            true
        }
        TestOutcome::TimedOut => {
            warn!(instance_id = %log.instance_id, phase = phase.as_str(), "tests timed out");
            log.append_line(&Marker::TestsTimedOut.with_phase(phase));
            false
        }
        TestOutcome::Errored(detail) => {
            log.append_line(&format!(
                "{} {}",
                Marker::TestsErrored.with_phase(phase),
                detail
            ));
            false
        }
    }
}

/// Runs the steps in-process against `tree`. Once a step fails every
/// remaining step except the reset is skipped.
pub fn interpret(
    tree: &Path,
    script: &ExecutionScript,
    options: &ApplyOptions,
    test_timeout: Duration,
    log: &mut RunLog,
) {
    let mut pre: Option<PreState> = None;
    let mut halted = false;
    for step in &script.steps {
        match step {
            Step::Reset => {
                if let Some(pre) = &pre {
                    steps::reset_step(tree, pre, log);
                }
            }
            _ if halted => {}
            Step::CapturePreState => match steps::capture_step(tree, &script.base_revision, log) {
                Some(state) => pre = Some(state),
                // Nothing was touched yet and there is nothing to reset to.
                None => return,
            },
            Step::CheckoutBase { revision } => {
                halted = !steps::checkout_step(tree, revision, log);
            }
            Step::ApplyPatch { index, label } => {
                let applied = match script.patches.get(*index) {
                    Some(patch) => steps::apply_step(tree, patch, *index, label, options, log),
                    None => {
                        log.append_line(
                            &Marker::PatchApplyFailed
                                .with_payload(&format!("patch {} missing from script", index)),
                        );
                        false
                    }
                };
                halted = !applied;
            }
            Step::MarkApplied => log.append_line(&Marker::AppliedPatch.line()),
            Step::RunTests { phase, command } => {
                halted = !run_tests_step(tree, *phase, command, &script.env, test_timeout, log);
            }
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Runs scripts on the host in a per-worker copy of the instance layer.
pub struct LocalProcessSandbox {
    layers: LocalLayerBuilder,
    work_root: PathBuf,
    apply_options: ApplyOptions,
    test_timeout: Duration,
}

impl LocalProcessSandbox {
    pub fn new(
        layers: LocalLayerBuilder,
        work_root: PathBuf,
        apply_options: ApplyOptions,
        test_timeout: Duration,
    ) -> Self {
        Self {
            layers,
            work_root,
            apply_options,
            test_timeout,
        }
    }

    /// Working tree owned by one worker for one instance layer.
    pub fn worker_tree(&self, worker_id: usize, layer: &LayerKey) -> PathBuf {
        self.work_root
            .join(format!("worker-{}", worker_id))
            .join(&layer.id)
    }

    fn prepare_tree(&self, tree: &Path, layer: &LayerKey) -> Result<()> {
        if tree.join(".git").is_dir() {
            return Ok(());
        }
        let origin = self.layers.repo_dir(layer);
        if !origin.join(".git").is_dir() {
            return Err(anyhow!("instance layer {} has no repository", layer));
        }
        if tree.exists() {
            fs::remove_dir_all(tree)?;
        }
        if let Some(parent) = tree.parent() {
            ensure_dir(parent)?;
        }
        let staging = tree.with_file_name(format!("{}.partial", layer.id));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        copy_tree(&origin, &staging)
            .with_context(|| format!("failed to copy layer {} into worker tree", layer))?;
        fs::rename(&staging, tree)?;
        debug!(layer = %layer, tree = %tree.display(), "worker tree prepared");
        Ok(())
    }

    /// Removes `tree` when the run could not restore it, so the next job on
    /// this worker starts from a fresh copy of the layer.
    fn discard_if_unrestored(&self, tree: &Path, log: &RunLog) -> Result<bool> {
        let unrestored = log.text().lines().filter_map(Marker::parse).any(|(m, _)| {
            matches!(m, Marker::ResetFailed | Marker::EnvResetFailed)
        });
        if !unrestored {
            return Ok(false);
        }
        warn!(instance_id = %log.instance_id, tree = %tree.display(), "reset failed; discarding worker tree");
        if tree.exists() {
            fs::remove_dir_all(tree)
                .with_context(|| format!("failed to discard worker tree {}", tree.display()))?;
        }
        Ok(true)
    }
}

impl Sandbox for LocalProcessSandbox {
    fn name(&self) -> &'static str {
        "local"
    }

    fn preflight(&self) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("--version");
        run_checked_command(cmd, "git preflight")?;
        let mut cmd = Command::new("bash");
        cmd.args(["-c", "true"]);
        run_checked_command(cmd, "bash preflight")?;
        ensure_dir(&self.work_root)?;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        script: &ExecutionScript,
    ) -> Result<RunLog, SandboxError> {
        let tree = self.worker_tree(ctx.worker_id, ctx.layer);
        self.prepare_tree(&tree, ctx.layer)
            .map_err(|e| SandboxError::Launch(format!("{:#}", e)))?;
        let mut log = RunLog::new(script.instance_id.clone());
        interpret(&tree, script, &self.apply_options, self.test_timeout, &mut log);
        self.discard_if_unrestored(&tree, &log)
            .map_err(|e| SandboxError::Execution(format!("{:#}", e)))?;
        Ok(log)
    }
}

struct ContainerCleanupGuard {
    container_id: String,
}

impl Drop for ContainerCleanupGuard {
    fn drop(&mut self) {
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.container_id])
            .output();
    }
}

/// Runs the rendered script in a throwaway container started from the
/// instance image. The container is removed afterwards, so a run killed at
/// the wall clock leaves nothing to reset.
pub struct DockerSandbox {
    bench_binary: PathBuf,
    script_options: ScriptOptions,
    config: RunnerConfig,
}

impl DockerSandbox {
    pub fn new(bench_binary: PathBuf, config: &RunnerConfig) -> Self {
        Self {
            bench_binary,
            script_options: config.script_options(),
            config: config.clone(),
        }
    }

    fn stage(&self, ctx: &ExecutionContext<'_>, script: &ExecutionScript) -> Result<(PathBuf, PathBuf)> {
        let patches_dir = ctx.instance_dir.join(PATCHES_DIR);
        ensure_dir(&patches_dir)?;
        for (idx, patch) in script.patches.iter().enumerate() {
            fs::write(patches_dir.join(patch_file_name(idx)), patch)?;
        }
        let script_path = ctx.instance_dir.join(SCRIPT_FILE);
        fs::write(&script_path, render_shell(script, &self.script_options))?;
        Ok((patches_dir, script_path))
    }

    fn launch(&self, image: &str, instance_id: &str, patches_dir: &Path, script_path: &Path) -> Result<ContainerCleanupGuard> {
        let mut create = Command::new("docker");
        create
            .args(["create", "--label"])
            .arg(format!("bench.instance={}", instance_id))
            .arg(image)
            .args(["tail", "-f", "/dev/null"]);
        let out = run_checked_command(create, "docker create")?;
        let container_id = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(anyhow!("docker create returned no container id"));
        }
        let guard = ContainerCleanupGuard { container_id };
        let id = guard.container_id.as_str();

        let mut start = Command::new("docker");
        start.args(["start", id]);
        run_checked_command(start, "docker start")?;

        let work = &self.script_options.work_dir;
        let mut mkdir = Command::new("docker");
        mkdir.args(["exec", id, "mkdir", "-p", work]);
        run_checked_command(mkdir, "docker exec mkdir")?;

        let copies = [
            (self.bench_binary.clone(), self.script_options.bench_binary.clone()),
            (patches_dir.join("."), format!("{}/", work)),
            (script_path.to_path_buf(), format!("{}/{}", work, SCRIPT_FILE)),
        ];
        for (src, dst) in copies {
            let mut cp = Command::new("docker");
            cp.arg("cp").arg(&src).arg(format!("{}:{}", id, dst));
            run_checked_command(cp, &format!("docker cp {}", src.display()))?;
        }
        Ok(guard)
    }
}

impl Sandbox for DockerSandbox {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn preflight(&self) -> Result<()> {
        let mut info = Command::new("docker");
        info.args(["info", "--format", "{{.ServerVersion}}"]);
        run_checked_command(info, "docker daemon unreachable")?;
        if !self.bench_binary.is_file() {
            return Err(anyhow!(
                "bench binary for sandboxes not found: {}",
                self.bench_binary.display()
            ));
        }
        Ok(())
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        script: &ExecutionScript,
    ) -> Result<RunLog, SandboxError> {
        let (patches_dir, script_path) = self
            .stage(ctx, script)
            .map_err(|e| SandboxError::Launch(format!("staging failed: {:#}", e)))?;
        let image = docker_image_name(ctx.layer);
        let guard = self
            .launch(&image, &script.instance_id, &patches_dir, &script_path)
            .map_err(|e| SandboxError::Launch(format!("{:#}", e)))?;
        info!(instance_id = %script.instance_id, image = %image, "container started");

        let mut exec = Command::new("docker");
        exec.args(["exec", &guard.container_id, "bash"])
            .arg(format!("{}/{}", self.script_options.work_dir, SCRIPT_FILE))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = exec
            .spawn()
            .map_err(|e| SandboxError::Execution(format!("docker exec: {}", e)))?;
        let lines = Arc::new(Mutex::new(Vec::new()));
        let readers: Vec<JoinHandle<()>> = [
            child.stdout.take().map(|p| spawn_line_reader(p, lines.clone())),
            child.stderr.take().map(|p| spawn_line_reader(p, lines.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();

        let budget = self.config.wall_clock_budget(script.test_phases());
        let container_id = guard.container_id.clone();
        let killed = wait_with_deadline(&mut child, Instant::now() + budget, |child| {
            let _ = Command::new("docker").args(["kill", &container_id]).output();
            let _ = child.kill();
        })
        .map_err(|e| SandboxError::Execution(format!("{:#}", e)))?
        .is_none();
        for reader in readers {
            let _ = reader.join();
        }

        let mut log = RunLog::new(script.instance_id.clone());
        for line in drain_lines(&lines) {
            log.append_line(&line);
        }
        if killed {
            warn!(instance_id = %script.instance_id, budget_secs = budget.as_secs(), "wall clock exceeded; container killed");
            log.append_line(&Marker::TestsTimedOut.with_payload("wall clock exceeded"));
        }
        drop(guard);
        Ok(log)
    }
}
