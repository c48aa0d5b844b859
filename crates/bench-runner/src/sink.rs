use anyhow::Result;
use bench_core::{TestDelta, TestStatus, Transition, Verdict};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const FACTS_DIR: &str = "facts";
const FACTS_VERDICTS_FILE: &str = "verdicts.jsonl";
const FACTS_TEST_DELTAS_FILE: &str = "test_deltas.jsonl";
const FACTS_RUN_MANIFEST_FILE: &str = "run_manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestRecord {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: String,
    pub backend: String,
    pub max_workers: usize,
    pub marker_version: String,
    pub model_names: Vec<String>,
    pub instance_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictRow {
    pub run_id: String,
    pub model_name: String,
    pub instance_id: String,
    pub verdict_kind: String,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_mode_used: Option<String>,
    pub scored: bool,
    pub sandbox_tainted: bool,
    pub fail_to_pass: usize,
    pub newly_failing: usize,
    pub reused_log: bool,
    pub attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl VerdictRow {
    pub fn from_verdict(
        run_id: &str,
        model_name: &str,
        verdict: &Verdict,
        reused_log: bool,
        attempts: usize,
    ) -> Self {
        let count = |t: Transition| verdict.deltas.iter().filter(|d| d.transition == t).count();
        Self {
            run_id: run_id.to_string(),
            model_name: model_name.to_string(),
            instance_id: verdict.instance_id.clone(),
            verdict_kind: verdict.verdict_kind.as_str().to_string(),
            applied: verdict.applied,
            patch_mode_used: verdict.patch_mode_used.map(|m| m.as_str().to_string()),
            scored: verdict.scored,
            sandbox_tainted: verdict.sandbox_tainted,
            fail_to_pass: count(Transition::FailToPass),
            newly_failing: count(Transition::NewlyFailing),
            reused_log,
            attempts,
            detail: verdict.detail.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDeltaRow {
    pub run_id: String,
    pub model_name: String,
    pub instance_id: String,
    pub test: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<TestStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<TestStatus>,
    pub transition: Transition,
}

impl TestDeltaRow {
    pub fn rows(run_id: &str, model_name: &str, verdict: &Verdict) -> Vec<TestDeltaRow> {
        verdict
            .deltas
            .iter()
            .map(|d: &TestDelta| TestDeltaRow {
                run_id: run_id.to_string(),
                model_name: model_name.to_string(),
                instance_id: verdict.instance_id.clone(),
                test: d.test.clone(),
                before: d.before,
                after: d.after,
                transition: d.transition,
            })
            .collect()
    }
}

pub trait RunSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()>;
    fn append_verdict(&mut self, row: &VerdictRow) -> Result<()>;
    fn append_test_deltas(&mut self, rows: &[TestDeltaRow]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlRunSink {
    run_manifest_path: PathBuf,
    verdicts_writer: BufWriter<File>,
    test_deltas_writer: BufWriter<File>,
}

impl JsonlRunSink {
    pub fn new(run_dir: &Path) -> Result<Self> {
        let facts_dir = run_dir.join(FACTS_DIR);
        fs::create_dir_all(&facts_dir)?;

        Ok(Self {
            run_manifest_path: facts_dir.join(FACTS_RUN_MANIFEST_FILE),
            verdicts_writer: open_append(facts_dir.join(FACTS_VERDICTS_FILE))?,
            test_deltas_writer: open_append(facts_dir.join(FACTS_TEST_DELTAS_FILE))?,
        })
    }
}

impl RunSink for JsonlRunSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()> {
        fs::write(&self.run_manifest_path, serde_json::to_vec_pretty(run)?)?;
        Ok(())
    }

    fn append_verdict(&mut self, row: &VerdictRow) -> Result<()> {
        append_row(&mut self.verdicts_writer, row)
    }

    fn append_test_deltas(&mut self, rows: &[TestDeltaRow]) -> Result<()> {
        for row in rows {
            append_row(&mut self.test_deltas_writer, row)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.verdicts_writer.flush()?;
        self.test_deltas_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
