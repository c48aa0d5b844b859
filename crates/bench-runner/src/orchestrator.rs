use anyhow::{anyhow, Context, Result};
use bench_core::{ensure_dir, sanitize_for_fs, RunLog, Verdict, VerdictKind};
use bench_grade::{grade, MARKER_VERSION};
use bench_schemas::{compile_schema, validate_record, JSONSchema, VERDICT_SCHEMA};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::layers::LayerCache;
use crate::records::EvaluationJob;
use crate::sandbox::{ExecutionContext, Sandbox};
use crate::script::synthesize;
use crate::sink::{JsonlRunSink, RunManifestRecord, RunSink, TestDeltaRow, VerdictRow};

pub const RUN_LOG_FILE: &str = "run.log";
pub const VERDICT_FILE: &str = "verdict.json";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub instance_id: String,
    pub model_name: String,
    pub model_dir: String,
    pub verdict: Verdict,
    /// Graded from a `run.log` left by an earlier run.
    pub reused_log: bool,
    /// Sandbox launches, zero when nothing was executed.
    pub attempts: usize,
    #[serde(skip)]
    pub instance_dir: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub completed_ids: Vec<String>,
    pub resolved_ids: Vec<String>,
    pub unresolved_ids: Vec<String>,
    pub error_ids: Vec<String>,
    pub infrastructure_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total_jobs: usize,
    pub evaluated: usize,
    /// Jobs never dequeued because a stop was requested.
    pub skipped: usize,
    pub models: BTreeMap<String, ModelSummary>,
    pub removed_layers: Vec<String>,
}

impl RunSummary {
    fn record(&mut self, outcome: &EvaluationOutcome) {
        self.evaluated += 1;
        let model = self.models.entry(outcome.model_name.clone()).or_default();
        let id = outcome.instance_id.clone();
        let kind = outcome.verdict.verdict_kind;
        if kind.is_completed() {
            model.completed_ids.push(id.clone());
        }
        match kind {
            VerdictKind::Resolved => model.resolved_ids.push(id),
            VerdictKind::PartiallyResolved
            | VerdictKind::Unresolved
            | VerdictKind::NoTestsExecuted => model.unresolved_ids.push(id),
            VerdictKind::InfrastructureFailure => model.infrastructure_ids.push(id),
            VerdictKind::ApplyFailed
            | VerdictKind::ResetFailed
            | VerdictKind::EnvResetFailed
            | VerdictKind::TestsErrored
            | VerdictKind::TestsTimedOut => model.error_ids.push(id),
        }
    }

    fn sort(&mut self) {
        for model in self.models.values_mut() {
            for ids in [
                &mut model.completed_ids,
                &mut model.resolved_ids,
                &mut model.unresolved_ids,
                &mut model.error_ids,
                &mut model.infrastructure_ids,
            ] {
                ids.sort();
            }
        }
    }

    pub fn resolved_count(&self) -> usize {
        self.models.values().map(|m| m.resolved_ids.len()).sum()
    }

    pub fn infrastructure_count(&self) -> usize {
        self.models.values().map(|m| m.infrastructure_ids.len()).sum()
    }

    /// True when at least one job ran and every one of them ended in an
    /// infrastructure failure.
    pub fn all_infrastructure_failures(&self) -> bool {
        self.evaluated > 0 && self.infrastructure_count() == self.evaluated
    }
}

/// Evaluates jobs on a fixed pool of worker threads. One job's failure,
/// error or panic only ever produces that job's verdict.
pub struct Orchestrator {
    config: RunnerConfig,
    layers: Arc<LayerCache>,
    sandbox: Arc<dyn Sandbox>,
    stop: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: RunnerConfig, layers: Arc<LayerCache>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            config,
            layers,
            sandbox,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops workers from dequeuing; in-flight jobs finish.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn run(&self, run_id: &str, jobs: Vec<EvaluationJob>) -> Result<RunSummary> {
        let run_dir = self.config.run_dir(run_id);
        ensure_dir(&run_dir)?;
        let mut sink = JsonlRunSink::new(&run_dir)?;
        let model_names: BTreeSet<String> = jobs.iter().map(|j| j.model_name.clone()).collect();
        let instance_ids: BTreeSet<&str> = jobs.iter().map(|j| j.instance_id()).collect();
        let workers = self.config.max_workers.max(1).min(jobs.len().max(1));
        sink.write_run_manifest(&RunManifestRecord {
            schema_version: "run_manifest_v1".to_string(),
            run_id: run_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            backend: self.sandbox.name().to_string(),
            max_workers: workers,
            marker_version: MARKER_VERSION.to_string(),
            model_names: model_names.into_iter().collect(),
            instance_count: instance_ids.len(),
        })?;
        let verdict_schema = compile_schema(VERDICT_SCHEMA)?;

        let mut summary = RunSummary {
            run_id: run_id.to_string(),
            total_jobs: jobs.len(),
            ..RunSummary::default()
        };
        info!(run_id, jobs = jobs.len(), workers, backend = self.sandbox.name(), "starting run");

        let queue = Mutex::new(jobs.into_iter().collect::<VecDeque<_>>());
        let (tx, rx) = mpsc::channel::<EvaluationOutcome>();
        thread::scope(|scope| -> Result<()> {
            for worker_id in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                let run_dir = run_dir.as_path();
                thread::Builder::new()
                    .name(format!("bench-worker-{}", worker_id))
                    .spawn_scoped(scope, move || self.worker_loop(worker_id, queue, run_dir, tx))
                    .map_err(|e| anyhow!("failed to spawn worker thread: {}", e))?;
            }
            drop(tx);
            for outcome in rx {
                if let Err(err) = self.record_outcome(run_id, &outcome, &verdict_schema, &mut sink) {
                    warn!(instance_id = %outcome.instance_id, error = %err, "failed to record outcome");
                }
                summary.record(&outcome);
            }
            Ok(())
        })?;
        sink.flush()?;

        summary.skipped = summary.total_jobs.saturating_sub(summary.evaluated);
        if summary.skipped > 0 {
            warn!(skipped = summary.skipped, "run stopped before all jobs were dequeued");
        }
        match self.layers.remove_above(self.config.cache_level) {
            Ok(removed) => summary.removed_layers = removed.into_iter().map(|k| k.id).collect(),
            Err(err) => warn!(error = %err, "layer cleanup failed"),
        }
        summary.sort();
        fs::write(run_dir.join(SUMMARY_FILE), serde_json::to_vec_pretty(&summary)?)?;
        info!(
            run_id,
            evaluated = summary.evaluated,
            resolved = summary.resolved_count(),
            infrastructure = summary.infrastructure_count(),
            "run finished"
        );
        Ok(summary)
    }

    fn worker_loop(
        &self,
        worker_id: usize,
        queue: &Mutex<VecDeque<EvaluationJob>>,
        run_dir: &Path,
        tx: mpsc::Sender<EvaluationOutcome>,
    ) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                debug!(worker_id, "stop requested");
                break;
            }
            let next = match queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => {
                    error!(worker_id, "job queue lock poisoned");
                    break;
                }
            };
            let Some(job) = next else { break };
            let outcome =
                match panic::catch_unwind(AssertUnwindSafe(|| self.evaluate(worker_id, &job, run_dir))) {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!(worker_id, instance_id = %job.instance_id(), panic = %message, "worker panicked");
                        infrastructure_outcome(
                            &job,
                            instance_dir(run_dir, &job),
                            format!("worker panicked: {}", message),
                            0,
                        )
                    }
                };
            if tx.send(outcome).is_err() {
                break;
            }
        }
    }

    fn evaluate(&self, worker_id: usize, job: &EvaluationJob, run_dir: &Path) -> EvaluationOutcome {
        let instance_id = job.instance_id();
        let dir = instance_dir(run_dir, job);
        if let Err(err) = ensure_dir(&dir) {
            return infrastructure_outcome(job, dir, format!("{:#}", err), 0);
        }
        let log_path = dir.join(RUN_LOG_FILE);
        if !self.config.rerun {
            if let Some(log) = read_existing_log(&log_path, instance_id) {
                info!(instance_id, model = %job.model_name, "grading existing run log");
                return outcome(job, dir, grade(&log), true, 0);
            }
        }

        let layer = match self.layers.ensure_chain(&job.instance) {
            Ok(layer) => layer,
            Err(err) => {
                warn!(instance_id, error = %err, "layer unavailable");
                return infrastructure_outcome(job, dir, err.to_string(), 0);
            }
        };
        let script = synthesize(&job.instance, &self.config.script_options());
        let ctx = ExecutionContext {
            worker_id,
            instance: &job.instance,
            layer: &layer,
            instance_dir: &dir,
        };

        let mut attempts = 0;
        let executed = loop {
            attempts += 1;
            match self.sandbox.execute(&ctx, &script) {
                Ok(log) => break Ok(log),
                Err(err) if err.is_retryable() && attempts <= self.config.launch_retries => {
                    let backoff = self.config.retry_backoff(attempts - 1);
                    warn!(
                        instance_id,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "sandbox launch failed; retrying"
                    );
                    thread::sleep(backoff);
                }
                Err(err) => break Err(err),
            }
        };
        match executed {
            Ok(log) => {
                if let Err(err) = fs::write(&log_path, log.text()) {
                    warn!(instance_id, error = %err, "failed to write run log");
                }
                let verdict = grade(&log);
                info!(instance_id, model = %job.model_name, verdict = verdict.verdict_kind.as_str(), "instance graded");
                outcome(job, dir, verdict, false, attempts)
            }
            Err(err) => {
                warn!(instance_id, attempts, error = %err, "sandbox failed");
                infrastructure_outcome(job, dir, err.to_string(), attempts)
            }
        }
    }

    fn record_outcome(
        &self,
        run_id: &str,
        outcome: &EvaluationOutcome,
        verdict_schema: &JSONSchema,
        sink: &mut dyn RunSink,
    ) -> Result<()> {
        let value = serde_json::to_value(&outcome.verdict)?;
        if let Err(err) = validate_record(verdict_schema, VERDICT_SCHEMA, &value) {
            warn!(instance_id = %outcome.instance_id, error = %err, "verdict does not match schema");
        }
        fs::write(
            outcome.instance_dir.join(VERDICT_FILE),
            serde_json::to_vec_pretty(&value)?,
        )
        .with_context(|| format!("failed to write verdict for {}", outcome.instance_id))?;
        sink.append_verdict(&VerdictRow::from_verdict(
            run_id,
            &outcome.model_name,
            &outcome.verdict,
            outcome.reused_log,
            outcome.attempts,
        ))?;
        sink.append_test_deltas(&TestDeltaRow::rows(run_id, &outcome.model_name, &outcome.verdict))
    }
}

fn instance_dir(run_dir: &Path, job: &EvaluationJob) -> PathBuf {
    run_dir
        .join(&job.model_dir)
        .join(sanitize_for_fs(job.instance_id()))
}

fn read_existing_log(path: &Path, instance_id: &str) -> Option<RunLog> {
    let text = fs::read_to_string(path).ok()?;
    let log = RunLog::from_text(instance_id, text);
    (!log.is_blank()).then_some(log)
}

fn outcome(
    job: &EvaluationJob,
    instance_dir: PathBuf,
    verdict: Verdict,
    reused_log: bool,
    attempts: usize,
) -> EvaluationOutcome {
    EvaluationOutcome {
        instance_id: job.instance_id().to_string(),
        model_name: job.model_name.clone(),
        model_dir: job.model_dir.clone(),
        verdict,
        reused_log,
        attempts,
        instance_dir,
    }
}

fn infrastructure_outcome(
    job: &EvaluationJob,
    instance_dir: PathBuf,
    detail: String,
    attempts: usize,
) -> EvaluationOutcome {
    let verdict = Verdict::new(
        job.instance_id(),
        VerdictKind::InfrastructureFailure,
        MARKER_VERSION,
    )
    .with_detail(detail);
    outcome(job, instance_dir, verdict, false, attempts)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
