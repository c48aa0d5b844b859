use anyhow::{anyhow, Result};
use std::env;
use std::io::Write;
use std::process::{Command, Output, Stdio};
use std::thread;

pub mod config;
pub mod images;
pub mod layers;
pub mod orchestrator;
pub mod records;
pub mod sandbox;
pub mod script;
pub mod sink;
pub mod steps;
pub mod tree_state;

pub use config::{Backend, RunnerConfig};
pub use images::{docker_image_name, DockerLayerBuilder, LocalLayerBuilder};
pub use layers::{list_layers, retry_failed, LayerBuilder, LayerCache, LayerError, LayerRecord};
pub use orchestrator::{EvaluationOutcome, Orchestrator, RunSummary};
pub use records::{build_jobs, load_instances, load_predictions, EvaluationJob};
pub use sandbox::{DockerSandbox, ExecutionContext, LocalProcessSandbox, Sandbox, SandboxError};
pub use script::{derive_test_directives, render_shell, synthesize, ExecutionScript, ScriptOptions, Step};
pub use tree_state::PreState;

fn command_failure_detail(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        "command exited non-zero".to_string()
    }
}

pub(crate) fn run_checked_command(mut cmd: Command, step: &str) -> Result<Output> {
    let out = cmd
        .output()
        .map_err(|e| anyhow!("{}: failed to spawn: {}", step, e))?;
    if out.status.success() {
        return Ok(out);
    }
    Err(anyhow!("{}: {}", step, command_failure_detail(&out)))
}

/// Like `run_checked_command`, feeding `input` on stdin from a helper thread
/// so large inputs cannot deadlock against a full output pipe.
pub(crate) fn run_checked_command_with_input(
    mut cmd: Command,
    input: Vec<u8>,
    step: &str,
) -> Result<Output> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow!("{}: failed to spawn: {}", step, e))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("{}: stdin unavailable", step))?;
    let writer = thread::spawn(move || stdin.write_all(&input));
    let out = child.wait_with_output()?;
    match writer.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) if out.status.success() => {
            return Err(anyhow!("{}: writing stdin failed: {}", step, err))
        }
        Ok(Err(_)) => {}
        Err(_) => return Err(anyhow!("{}: stdin writer panicked", step)),
    }
    if out.status.success() {
        return Ok(out);
    }
    Err(anyhow!("{}: {}", step, command_failure_detail(&out)))
}

pub(crate) fn git(repo: &std::path::Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(repo);
    cmd
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

pub(crate) fn parse_optional_positive_usize_env(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<usize>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

pub(crate) fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

/// Kills `pid` and every process in the group it leads.
pub(crate) fn hard_kill_pid_and_group(pid: u32) {
    #[cfg(unix)]
    {
        let Ok(pid) = i32::try_from(pid) else {
            return;
        };
        unsafe {
            let _ = libc::kill(-pid, libc::SIGKILL);
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Makes the spawned child lead a fresh process group so a timeout can take
/// down everything it started.
pub(crate) fn spawn_in_new_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt as _;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 && libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    pub use bench_core::testutil::{git_available, TempDirGuard};
    use std::fs;
    use std::path::Path;
    use std::process::Command;

    pub fn run_git(repo: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args([
                "-c",
                "user.name=bench",
                "-c",
                "user.email=bench@example.invalid",
                "-c",
                "commit.gpgsign=false",
            ])
            .args(args)
            .output()
            .expect("spawn git");
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    /// A one-commit repository with the given files; returns its HEAD revision.
    pub fn init_repo(dir: &Path, files: &[(&str, &str)]) -> String {
        fs::create_dir_all(dir).expect("create repo dir");
        run_git(dir, &["init", "-q"]);
        for (path, contents) in files {
            let full = dir.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).expect("create parent");
            }
            fs::write(full, contents).expect("write file");
        }
        run_git(dir, &["add", "-A"]);
        run_git(dir, &["commit", "-q", "-m", "init"]);
        run_git(dir, &["rev-parse", "HEAD"])
    }
}
