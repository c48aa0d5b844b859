use anyhow::{anyhow, Context, Result};
use bench_core::{PatchApplyResult, RunLog, Verdict};
use bench_grade::Marker;
use bench_patch::{apply_patch_to_dir, ApplyOptions};
use bench_runner::steps;
use bench_runner::tree_state::PreState;
use bench_runner::{
    build_jobs, list_layers, load_instances, load_predictions, render_shell, retry_failed,
    synthesize, Backend, DockerLayerBuilder, DockerSandbox, LayerBuilder, LayerCache,
    LocalLayerBuilder, LocalProcessSandbox, Orchestrator, RunSummary, RunnerConfig, Sandbox,
};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bench", version = "0.3.0", about = "Patch application and evaluation harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    #[value(name = "local")]
    Local,
    #[value(name = "docker")]
    Docker,
}

impl From<BackendArg> for Backend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Local => Backend::Local,
            BackendArg::Docker => Backend::Docker,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate predictions (or the instances' own patches) end to end.
    Run {
        #[arg(long)]
        instances: PathBuf,
        #[arg(long)]
        predictions: Option<PathBuf>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        #[arg(long)]
        workers: Option<usize>,
        /// Per test phase, in seconds.
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        force_rebuild: bool,
        #[arg(long)]
        rerun: bool,
        #[arg(long)]
        json: bool,
    },
    /// Apply one patch to a directory with fuzzy and structural fallbacks.
    Apply {
        #[arg(long)]
        repo: PathBuf,
        patch: PathBuf,
        #[arg(long)]
        fuzzy_window: Option<usize>,
        #[arg(long)]
        fuzz_factor: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Grade a captured run log.
    Grade {
        log: PathBuf,
        #[arg(long)]
        instance_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Helpers invoked by scripts inside sandboxes.
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
    Layers {
        #[command(subcommand)]
        command: LayersCommands,
    },
    /// Print the rendered sandbox script for one instance.
    Script {
        #[arg(long)]
        instances: PathBuf,
        #[arg(long)]
        instance_id: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SandboxCommands {
    Capture {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        base: String,
        #[arg(long)]
        out: PathBuf,
    },
    Reset {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        state: PathBuf,
    },
    Apply {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long)]
        patch: PathBuf,
        #[arg(long)]
        index: usize,
        #[arg(long)]
        label: String,
        #[arg(long)]
        fuzzy_window: Option<usize>,
        #[arg(long)]
        fuzz_factor: Option<usize>,
    },
}

#[derive(Subcommand)]
enum LayersCommands {
    List {
        #[arg(long)]
        cache_root: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Clear failed layers so the next run rebuilds them.
    Retry {
        #[arg(long)]
        cache_root: PathBuf,
        key: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            instances,
            predictions,
            config,
            backend,
            workers,
            timeout,
            run_id,
            output,
            force_rebuild,
            rerun,
            json,
        } => {
            let mut config = RunnerConfig::load(config.as_deref())?;
            if let Some(backend) = backend {
                config.backend = backend.into();
            }
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            if let Some(timeout) = timeout {
                config.test_timeout_secs = timeout;
            }
            if run_id.is_some() {
                config.run_id = run_id;
            }
            if let Some(output) = output {
                config.output_dir = output;
            }
            config.force_rebuild |= force_rebuild;
            config.rerun |= rerun;
            config.validate()?;
            return run_evaluation(config, &instances, predictions.as_deref(), json);
        }
        Commands::Apply {
            repo,
            patch,
            fuzzy_window,
            fuzz_factor,
            json,
        } => {
            let diff = fs::read_to_string(&patch)
                .with_context(|| format!("failed to read patch {}", patch.display()))?;
            let options = apply_options(fuzzy_window, fuzz_factor);
            let result = apply_patch_to_dir(&repo, &diff, &options)?;
            if json {
                let payload = json!({
                    "ok": result.applied,
                    "command": "apply",
                    "result": result,
                });
                if !result.applied {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            print_apply_result(&result);
            if !result.applied {
                std::process::exit(1);
            }
        }
        Commands::Grade {
            log,
            instance_id,
            json,
        } => {
            let text = fs::read_to_string(&log)
                .with_context(|| format!("failed to read run log {}", log.display()))?;
            let instance_id = instance_id.unwrap_or_else(|| instance_id_from_log_path(&log));
            let verdict = bench_grade::grade(&RunLog::from_text(instance_id, text));
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "grade",
                    "verdict": verdict,
                })));
            }
            print_verdict(&verdict);
        }
        Commands::Sandbox { command } => run_sandbox_command(command)?,
        Commands::Layers { command } => return run_layers_command(command),
        Commands::Script {
            instances,
            instance_id,
            config,
            json,
        } => {
            let config = RunnerConfig::load(config.as_deref())?;
            let instances = load_instances(&instances)?;
            let instance = instances
                .iter()
                .find(|i| i.id == instance_id)
                .ok_or_else(|| anyhow!("instance not found: {}", instance_id))?;
            let options = config.script_options();
            let script = synthesize(instance, &options);
            let rendered = render_shell(&script, &options);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "script",
                    "instance_id": instance.id,
                    "steps": script.steps,
                    "script": rendered,
                })));
            }
            print!("{}", rendered);
        }
    }
    Ok(None)
}

fn run_evaluation(
    config: RunnerConfig,
    instances: &Path,
    predictions: Option<&Path>,
    json: bool,
) -> Result<Option<Value>> {
    let instances = load_instances(instances)?;
    let predictions = predictions.map(load_predictions).transpose()?;
    let jobs = build_jobs(&instances, predictions.as_deref());
    let run_id = config.resolve_run_id();

    let (builder, sandbox): (Arc<dyn LayerBuilder>, Arc<dyn Sandbox>) = match config.backend {
        Backend::Local => (
            Arc::new(LocalLayerBuilder::new(&config.cache_root)),
            Arc::new(LocalProcessSandbox::new(
                LocalLayerBuilder::new(&config.cache_root),
                config.work_root.clone(),
                config.apply_options(),
                config.test_timeout(),
            )),
        ),
        Backend::Docker => {
            let bench_binary = match &config.bench_binary {
                Some(path) => path.clone(),
                None => std::env::current_exe().context("failed to locate the bench binary")?,
            };
            (
                Arc::new(DockerLayerBuilder),
                Arc::new(DockerSandbox::new(bench_binary, &config)),
            )
        }
    };
    sandbox
        .preflight()
        .with_context(|| format!("{} backend preflight failed", sandbox.name()))?;

    let cache = LayerCache::open(builder, &config.cache_root, config.force_rebuild)?;
    let run_dir = config.run_dir(&run_id);
    let orchestrator = Orchestrator::new(config, Arc::new(cache), sandbox);
    let stop = orchestrator.stop_handle();
    if let Err(err) = ctrlc::set_handler(move || {
        stop.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %err, "failed to install Ctrl-C handler");
    }

    let summary = orchestrator.run(&run_id, jobs)?;
    let payload = json!({
        "ok": !summary.all_infrastructure_failures(),
        "command": "run",
        "run_id": run_id,
        "run_dir": run_dir.display().to_string(),
        "summary": summary,
    });
    if summary.all_infrastructure_failures() {
        if json {
            emit_json(&json_error(
                "all_infrastructure_failures",
                "every instance ended in infrastructure_failure".to_string(),
                payload,
            ));
            std::process::exit(1);
        }
        print_summary(&summary, &run_dir);
        return Err(anyhow!("every instance ended in infrastructure_failure"));
    }
    if json {
        return Ok(Some(payload));
    }
    print_summary(&summary, &run_dir);
    Ok(None)
}

/// Sandbox helpers print log lines on stdout for the script to capture and
/// exit 1 when the step failed.
fn run_sandbox_command(command: SandboxCommands) -> Result<()> {
    let mut log = RunLog::new("sandbox");
    let ok = match command {
        SandboxCommands::Capture { repo, base, out } => {
            match steps::capture_step(&repo, &base, &mut log) {
                Some(pre) => {
                    let write = serde_json::to_vec(&pre)
                        .map_err(anyhow::Error::from)
                        .and_then(|raw| fs::write(&out, raw).map_err(anyhow::Error::from));
                    match write {
                        Ok(()) => true,
                        Err(err) => {
                            log.append_line(&Marker::ResetFailed.with_payload(&format!(
                                "pre-state not saved: {}",
                                err
                            )));
                            false
                        }
                    }
                }
                None => false,
            }
        }
        SandboxCommands::Reset { repo, state } => {
            let pre = fs::read(&state)
                .map_err(anyhow::Error::from)
                .and_then(|raw| serde_json::from_slice::<PreState>(&raw).map_err(anyhow::Error::from));
            match pre {
                Ok(pre) => {
                    steps::reset_step(&repo, &pre, &mut log);
                    !log.text().lines().any(|line| {
                        matches!(
                            Marker::parse(line),
                            Some((Marker::ResetFailed | Marker::EnvResetFailed, _))
                        )
                    })
                }
                Err(err) => {
                    log.append_line(&Marker::ResetFailed.with_payload(&format!(
                        "pre-state unreadable: {}",
                        err
                    )));
                    false
                }
            }
        }
        SandboxCommands::Apply {
            repo,
            patch,
            index,
            label,
            fuzzy_window,
            fuzz_factor,
        } => match fs::read_to_string(&patch) {
            Ok(diff) => steps::apply_step(
                &repo,
                &diff,
                index,
                &label,
                &apply_options(fuzzy_window, fuzz_factor),
                &mut log,
            ),
            Err(err) => {
                log.append_line(&Marker::PatchApplyFailed.with_payload(&format!(
                    "patch {} ({}): unreadable: {}",
                    index, label, err
                )));
                false
            }
        },
    };
    let mut stdout = std::io::stdout();
    stdout.write_all(log.text().as_bytes())?;
    stdout.flush()?;
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn run_layers_command(command: LayersCommands) -> Result<Option<Value>> {
    match command {
        LayersCommands::List { cache_root, json } => {
            let layers = list_layers(&cache_root)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "layers list",
                    "layers": layers,
                })));
            }
            if layers.is_empty() {
                println!("no layers recorded under {}", cache_root.display());
            }
            for layer in &layers {
                let error = match &layer.build_state {
                    bench_core::BuildState::Failed { error } => format!("  {}", error),
                    _ => String::new(),
                };
                println!(
                    "{:<8} {:<8} {:<48} {:<8} {}{}",
                    layer.backend,
                    layer.key.kind.as_str(),
                    layer.key.id,
                    layer.build_state.as_str(),
                    layer.updated_at,
                    error
                );
            }
        }
        LayersCommands::Retry {
            cache_root,
            key,
            json,
        } => {
            let cleared = retry_failed(&cache_root, key.as_deref())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "layers retry",
                    "cleared": cleared,
                })));
            }
            if cleared.is_empty() {
                println!("no failed layers");
            }
            for id in &cleared {
                println!("cleared: {}", id);
            }
        }
    }
    Ok(None)
}

fn apply_options(fuzzy_window: Option<usize>, fuzz_factor: Option<usize>) -> ApplyOptions {
    let defaults = ApplyOptions::default();
    ApplyOptions {
        fuzzy_window: fuzzy_window.unwrap_or(defaults.fuzzy_window),
        fuzz_factor: fuzz_factor.unwrap_or(defaults.fuzz_factor),
        ..defaults
    }
}

/// `<output>/<run>/<model>/<instance>/run.log` names its instance by directory.
fn instance_id_from_log_path(log: &Path) -> String {
    log.parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn print_apply_result(result: &PatchApplyResult) {
    if result.applied {
        println!("applied: mode={}", result.mode_used.as_str());
        for file in &result.files {
            println!("  {} ({})", file.path, file.mode_used.as_str());
        }
    } else {
        println!(
            "failed: {}: {}",
            result.failure_kind.map(|k| k.as_str()).unwrap_or("unknown"),
            result.detail.as_deref().unwrap_or("")
        );
    }
}

fn print_verdict(verdict: &Verdict) {
    println!("instance_id: {}", verdict.instance_id);
    println!("verdict: {}", verdict.verdict_kind.as_str());
    println!("applied: {}", verdict.applied);
    if let Some(mode) = verdict.patch_mode_used {
        println!("patch_mode: {}", mode.as_str());
    }
    println!("scored: {}", verdict.scored);
    if verdict.sandbox_tainted {
        println!("sandbox_tainted: true");
    }
    if let Some(detail) = &verdict.detail {
        println!("detail: {}", detail);
    }
    for delta in verdict.fail_to_pass() {
        println!("fail_to_pass: {}", delta.test);
    }
}

fn print_summary(summary: &RunSummary, run_dir: &Path) {
    println!("run_id: {}", summary.run_id);
    println!("run_dir: {}", run_dir.display());
    println!(
        "jobs: {} evaluated: {} skipped: {}",
        summary.total_jobs, summary.evaluated, summary.skipped
    );
    for (model, stats) in &summary.models {
        println!(
            "{}: completed={} resolved={} unresolved={} error={} infrastructure={}",
            model,
            stats.completed_ids.len(),
            stats.resolved_ids.len(),
            stats.unresolved_ids.len(),
            stats.error_ids.len(),
            stats.infrastructure_ids.len()
        );
    }
    if !summary.removed_layers.is_empty() {
        println!("removed_layers: {}", summary.removed_layers.len());
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Apply { json, .. }
        | Commands::Grade { json, .. }
        | Commands::Script { json, .. } => *json,
        Commands::Layers {
            command: LayersCommands::List { json, .. } | LayersCommands::Retry { json, .. },
        } => *json,
        Commands::Sandbox { .. } => false,
    }
}
