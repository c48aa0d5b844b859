use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::canonical_json_digest;

/// Model name recorded when instances run with their own patch list only.
pub const GOLD_MODEL_NAME: &str = "gold";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Base sandbox image reference, e.g. `ubuntu:22.04`.
    pub platform: String,
    /// Toolchain label, e.g. `python3.11`.
    pub toolchain: String,
    #[serde(default)]
    pub toolchain_install: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub test_command: String,
}

impl EnvironmentSpec {
    pub fn toolchain_digest(&self) -> String {
        canonical_json_digest(&json!({
            "platform": self.platform,
            "toolchain": self.toolchain,
            "toolchain_install": self.toolchain_install,
        }))
    }

    pub fn dependency_hash(&self) -> String {
        canonical_json_digest(&json!({
            "dependencies": self.dependencies,
            "env": self.env,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub repository: String,
    pub base_revision: String,
    pub environment_spec: EnvironmentSpec,
    #[serde(default)]
    pub test_directives: Vec<String>,
    #[serde(default)]
    pub patch_list: Vec<String>,
    /// Patches applied before the baseline test run. Defaults to all but the last.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline_patches: Option<usize>,
    /// Commands run once in the instance layer after checkout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<String>,
}

impl Instance {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(anyhow!("instance id must not be empty"));
        }
        if self.repository.trim().is_empty() {
            return Err(anyhow!("instance {}: repository must not be empty", self.id));
        }
        if self.base_revision.trim().is_empty() {
            return Err(anyhow!("instance {}: base_revision must not be empty", self.id));
        }
        if self.environment_spec.test_command.trim().is_empty() {
            return Err(anyhow!("instance {}: test_command must not be empty", self.id));
        }
        if let Some(n) = self.baseline_patches {
            if n > self.patch_list.len() {
                return Err(anyhow!(
                    "instance {}: baseline_patches={} exceeds patch_list length {}",
                    self.id,
                    n,
                    self.patch_list.len()
                ));
            }
        }
        Ok(())
    }

    pub fn baseline_patch_count(&self) -> usize {
        let total = self.patch_list.len();
        self.baseline_patches
            .unwrap_or_else(|| total.saturating_sub(1))
            .min(total)
    }

    /// Copy of this instance with the prediction's patch appended last.
    pub fn with_prediction(&self, prediction: &Prediction) -> Instance {
        let mut out = self.clone();
        out.patch_list.push(prediction.patch_text().to_string());
        out.baseline_patches = Some(self.patch_list.len());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub instance_id: String,
    pub model_name_or_path: String,
    #[serde(default)]
    pub model_patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_output: Option<String>,
}

impl Prediction {
    pub fn patch_text(&self) -> &str {
        self.model_patch.as_deref().unwrap_or("")
    }

    /// Directory name for this model's outputs: `org/model` becomes `org__model`.
    pub fn model_dir_name(&self) -> String {
        model_dir_name(&self.model_name_or_path)
    }
}

pub fn model_dir_name(model_name_or_path: &str) -> String {
    crate::sanitize_for_fs(&model_name_or_path.replace('/', "__"))
}

/// Captured output of one sandboxed execution. Text only grows while capturing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLog {
    pub instance_id: String,
    text: String,
}

impl RunLog {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            text: String::new(),
        }
    }

    pub fn from_text(instance_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            text: text.into(),
        }
    }

    pub fn append(&mut self, chunk: &str) {
        self.text.push_str(chunk);
    }

    pub fn append_line(&mut self, line: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(patches: usize) -> Instance {
        Instance {
            id: "repo__proj-1".to_string(),
            repository: "https://example.invalid/repo.git".to_string(),
            base_revision: "abc123".to_string(),
            environment_spec: EnvironmentSpec {
                platform: "ubuntu:22.04".to_string(),
                toolchain: "python3.11".to_string(),
                test_command: "pytest -rA".to_string(),
                ..EnvironmentSpec::default()
            },
            test_directives: vec!["tests/test_a.py".to_string()],
            patch_list: (0..patches).map(|i| format!("patch-{}", i)).collect(),
            baseline_patches: None,
            setup: Vec::new(),
        }
    }

    #[test]
    fn baseline_defaults_to_all_but_last_patch() {
        assert_eq!(instance(0).baseline_patch_count(), 0);
        assert_eq!(instance(1).baseline_patch_count(), 0);
        assert_eq!(instance(3).baseline_patch_count(), 2);
        let mut explicit = instance(3);
        explicit.baseline_patches = Some(1);
        assert_eq!(explicit.baseline_patch_count(), 1);
    }

    #[test]
    fn prediction_is_appended_after_instance_patches() {
        let base = instance(1);
        let prediction = Prediction {
            instance_id: base.id.clone(),
            model_name_or_path: "org/model-7b".to_string(),
            model_patch: Some("model diff".to_string()),
            full_output: None,
        };
        let merged = base.with_prediction(&prediction);
        assert_eq!(merged.patch_list, vec!["patch-0", "model diff"]);
        assert_eq!(merged.baseline_patch_count(), 1);
        assert_eq!(prediction.model_dir_name(), "org__model-7b");
    }

    #[test]
    fn missing_model_patch_is_empty_text() {
        let prediction: Prediction = serde_json::from_str(
            r#"{"instance_id": "a", "model_name_or_path": "m", "model_patch": null}"#,
        )
        .expect("prediction");
        assert_eq!(prediction.patch_text(), "");
    }

    #[test]
    fn validate_rejects_out_of_range_baseline() {
        let mut inst = instance(2);
        inst.baseline_patches = Some(3);
        let err = inst.validate().expect_err("baseline too large");
        assert!(err.to_string().contains("baseline_patches=3"), "{}", err);
        inst.baseline_patches = Some(2);
        inst.validate().expect("valid");
    }

    #[test]
    fn dependency_hash_depends_on_env_and_dependencies_only() {
        let a = instance(0).environment_spec;
        let mut b = a.clone();
        b.test_command = "pytest -x".to_string();
        assert_eq!(a.dependency_hash(), b.dependency_hash());
        b.env.insert("PYTHONHASHSEED".to_string(), "0".to_string());
        assert_ne!(a.dependency_hash(), b.dependency_hash());
    }

    #[test]
    fn run_log_lines_are_newline_terminated() {
        let mut log = RunLog::new("x");
        assert!(log.is_blank());
        log.append("partial");
        log.append_line(">>>>> marker");
        assert_eq!(log.text(), "partial\n>>>>> marker\n");
    }
}
