use anyhow::{anyhow, Context, Result};
use bench_core::CacheLevel;
use bench_patch::ApplyOptions;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::script::ScriptOptions;
use crate::{parse_optional_positive_u64_env, parse_optional_positive_usize_env};

pub const BENCH_MAX_WORKERS_ENV: &str = "BENCH_MAX_WORKERS";
pub const BENCH_TEST_TIMEOUT_SECS_ENV: &str = "BENCH_TEST_TIMEOUT_SECS";
pub const BENCH_LAUNCH_RETRIES_ENV: &str = "BENCH_LAUNCH_RETRIES";

const DEFAULT_TEST_TIMEOUT_SECS: u64 = 1_800;
const DEFAULT_WALL_CLOCK_GRACE_SECS: u64 = 120;
const DEFAULT_LAUNCH_RETRIES: usize = 2;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Local,
    Docker,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Docker => "docker",
        }
    }

    pub fn parse(raw: &str) -> Result<Backend> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Backend::Local),
            "docker" => Ok(Backend::Docker),
            other => Err(anyhow!("unknown backend: {} (expected local|docker)", other)),
        }
    }
}

pub fn default_max_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 4).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub run_id: Option<String>,
    pub backend: Backend,
    pub max_workers: usize,
    /// Per test phase.
    pub test_timeout_secs: u64,
    /// Added on top of the test budget before the whole sandbox is killed.
    pub wall_clock_grace_secs: u64,
    pub baseline_tests: bool,
    pub fuzzy_window: usize,
    pub fuzz_factor: usize,
    pub launch_retries: usize,
    pub retry_backoff_ms: u64,
    pub cache_root: PathBuf,
    pub work_root: PathBuf,
    pub output_dir: PathBuf,
    pub force_rebuild: bool,
    pub cache_level: CacheLevel,
    /// Linux `bench` binary copied into docker sandboxes. Defaults to the
    /// running executable.
    pub bench_binary: Option<PathBuf>,
    pub rerun: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            backend: Backend::Local,
            max_workers: default_max_workers(),
            test_timeout_secs: DEFAULT_TEST_TIMEOUT_SECS,
            wall_clock_grace_secs: DEFAULT_WALL_CLOCK_GRACE_SECS,
            baseline_tests: true,
            fuzzy_window: bench_patch::DEFAULT_FUZZY_WINDOW,
            fuzz_factor: bench_patch::DEFAULT_FUZZ_FACTOR,
            launch_retries: DEFAULT_LAUNCH_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            cache_root: PathBuf::from(".bench/cache"),
            work_root: PathBuf::from(".bench/work"),
            output_dir: PathBuf::from("runs"),
            force_rebuild: false,
            cache_level: CacheLevel::default(),
            bench_binary: None,
            rerun: false,
        }
    }
}

impl RunnerConfig {
    /// Defaults, overlaid by the YAML file when given, overlaid by the
    /// `BENCH_*` environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                serde_yaml::from_str::<RunnerConfig>(&raw)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => RunnerConfig::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(workers) = parse_optional_positive_usize_env(BENCH_MAX_WORKERS_ENV)? {
            self.max_workers = workers;
        }
        if let Some(timeout) = parse_optional_positive_u64_env(BENCH_TEST_TIMEOUT_SECS_ENV)? {
            self.test_timeout_secs = timeout;
        }
        if let Some(retries) = parse_optional_positive_usize_env(BENCH_LAUNCH_RETRIES_ENV)? {
            self.launch_retries = retries;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.test_timeout_secs == 0 {
            return Err(anyhow!("test_timeout_secs must be > 0"));
        }
        if let Some(run_id) = &self.run_id {
            if bench_core::sanitize_for_fs(run_id) != *run_id {
                return Err(anyhow!(
                    "run_id may only contain letters, digits, '-', '_' and '.' (got: {})",
                    run_id
                ));
            }
        }
        Ok(())
    }

    pub fn resolve_run_id(&self) -> String {
        self.run_id
            .clone()
            .unwrap_or_else(|| format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S")))
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            fuzzy_window: self.fuzzy_window,
            fuzz_factor: self.fuzz_factor,
            ..ApplyOptions::default()
        }
    }

    /// Options for synthesizing scripts; sandbox paths keep their defaults.
    pub fn script_options(&self) -> ScriptOptions {
        ScriptOptions {
            baseline_tests: self.baseline_tests,
            test_timeout_secs: self.test_timeout_secs,
            fuzzy_window: self.fuzzy_window,
            fuzz_factor: self.fuzz_factor,
            ..ScriptOptions::default()
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.output_dir.join(run_id)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_secs)
    }

    /// Hard limit for a sandbox running `phases` test phases.
    pub fn wall_clock_budget(&self, phases: usize) -> Duration {
        Duration::from_secs(
            self.test_timeout_secs
                .saturating_mul(phases.max(1) as u64)
                .saturating_add(self.wall_clock_grace_secs),
        )
    }

    pub fn retry_backoff(&self, attempt: usize) -> Duration {
        let factor = 1u64 << attempt.min(10);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TempDirGuard;

    #[test]
    fn yaml_overrides_defaults_field_by_field() {
        let tmp = TempDirGuard::new("config");
        let path = tmp.path().join("bench.yaml");
        fs::write(
            &path,
            "backend: docker\nmax_workers: 3\ncache_level: instance\nbaseline_tests: false\n",
        )
        .expect("write config");
        let config: RunnerConfig =
            serde_yaml::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(config.backend, Backend::Docker);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.cache_level, CacheLevel::Instance);
        assert!(!config.baseline_tests);
        assert_eq!(config.fuzzy_window, 50);
        assert_eq!(config.test_timeout_secs, DEFAULT_TEST_TIMEOUT_SECS);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert_eq!(Backend::parse("Docker").expect("docker"), Backend::Docker);
        assert!(Backend::parse("k8s").is_err());
    }

    #[test]
    fn default_pool_is_a_quarter_of_the_cpus() {
        assert!(default_max_workers() >= 1);
        assert_eq!(RunnerConfig::default().max_workers, default_max_workers());
    }

    #[test]
    fn run_id_must_be_filesystem_safe() {
        let mut config = RunnerConfig {
            run_id: Some("nightly-01".to_string()),
            ..RunnerConfig::default()
        };
        config.validate().expect("valid run id");
        config.run_id = Some("../escape".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = RunnerConfig {
            retry_backoff_ms: 100,
            ..RunnerConfig::default()
        };
        assert_eq!(config.retry_backoff(0), Duration::from_millis(100));
        assert_eq!(config.retry_backoff(2), Duration::from_millis(400));
        assert_eq!(
            config.wall_clock_budget(2),
            Duration::from_secs(2 * DEFAULT_TEST_TIMEOUT_SECS + DEFAULT_WALL_CLOCK_GRACE_SECS)
        );
    }
}
