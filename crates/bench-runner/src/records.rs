use anyhow::{anyhow, Context, Result};
use bench_core::{model_dir_name, read_json_records, Instance, Prediction, GOLD_MODEL_NAME};
use bench_schemas::{compile_schema, validate_record, INSTANCE_SCHEMA, PREDICTION_SCHEMA};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::warn;

/// One instance evaluated for one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationJob {
    pub instance: Instance,
    pub model_name: String,
    pub model_dir: String,
}

impl EvaluationJob {
    pub fn instance_id(&self) -> &str {
        &self.instance.id
    }
}

pub fn load_instances(path: &Path) -> Result<Vec<Instance>> {
    let schema = compile_schema(INSTANCE_SCHEMA)?;
    let mut seen = HashSet::new();
    let mut instances = Vec::new();
    for (idx, row) in read_json_records(path)?.into_iter().enumerate() {
        validate_record(&schema, INSTANCE_SCHEMA, &row)
            .with_context(|| format!("{} record {}", path.display(), idx + 1))?;
        let instance: Instance = serde_json::from_value(row)
            .with_context(|| format!("{} record {}", path.display(), idx + 1))?;
        instance.validate()?;
        if !seen.insert(instance.id.clone()) {
            return Err(anyhow!(
                "{}: duplicate instance id {}",
                path.display(),
                instance.id
            ));
        }
        instances.push(instance);
    }
    Ok(instances)
}

pub fn load_predictions(path: &Path) -> Result<Vec<Prediction>> {
    let schema = compile_schema(PREDICTION_SCHEMA)?;
    read_json_records(path)?
        .into_iter()
        .enumerate()
        .map(|(idx, row)| {
            validate_record(&schema, PREDICTION_SCHEMA, &row)
                .with_context(|| format!("{} line {}", path.display(), idx + 1))?;
            serde_json::from_value(row)
                .with_context(|| format!("{} line {}", path.display(), idx + 1))
        })
        .collect()
}

/// Pairs predictions with their instances. Without predictions every instance
/// runs with its own patch list under the gold model name. Predictions for
/// unknown instances are skipped with a warning; a repeated
/// (model, instance) pair keeps the first prediction.
pub fn build_jobs(instances: &[Instance], predictions: Option<&[Prediction]>) -> Vec<EvaluationJob> {
    let Some(predictions) = predictions else {
        return instances
            .iter()
            .map(|instance| EvaluationJob {
                instance: instance.clone(),
                model_name: GOLD_MODEL_NAME.to_string(),
                model_dir: model_dir_name(GOLD_MODEL_NAME),
            })
            .collect();
    };

    let by_id: BTreeMap<&str, &Instance> =
        instances.iter().map(|i| (i.id.as_str(), i)).collect();
    let mut seen = HashSet::new();
    let mut jobs = Vec::new();
    for prediction in predictions {
        let Some(instance) = by_id.get(prediction.instance_id.as_str()) else {
            warn!(
                instance_id = %prediction.instance_id,
                model = %prediction.model_name_or_path,
                "prediction references unknown instance; skipping"
            );
            continue;
        };
        let pair = (
            prediction.model_name_or_path.clone(),
            prediction.instance_id.clone(),
        );
        if !seen.insert(pair) {
            warn!(
                instance_id = %prediction.instance_id,
                model = %prediction.model_name_or_path,
                "duplicate prediction; keeping the first"
            );
            continue;
        }
        jobs.push(EvaluationJob {
            instance: instance.with_prediction(prediction),
            model_name: prediction.model_name_or_path.clone(),
            model_dir: prediction.model_dir_name(),
        });
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TempDirGuard;
    use std::fs;

    const INSTANCE: &str = r#"{"id":"proj__1","repository":"https://example.invalid/p.git","base_revision":"abc","environment_spec":{"platform":"ubuntu:22.04","toolchain":"python3.11","test_command":"pytest -rA"},"patch_list":["diff --git a/t b/t\n"]}"#;

    #[test]
    fn loads_jsonl_and_array_instances() {
        let tmp = TempDirGuard::new("records");
        let jsonl = tmp.path().join("instances.jsonl");
        fs::write(&jsonl, format!("{}\n", INSTANCE)).expect("write");
        let array = tmp.path().join("instances.json");
        fs::write(&array, format!("[{}]", INSTANCE)).expect("write");
        assert_eq!(load_instances(&jsonl).expect("jsonl").len(), 1);
        let loaded = load_instances(&array).expect("array");
        assert_eq!(loaded[0].id, "proj__1");
        assert_eq!(loaded[0].environment_spec.test_command, "pytest -rA");
    }

    #[test]
    fn duplicate_and_invalid_instances_are_rejected() {
        let tmp = TempDirGuard::new("records_dup");
        let path = tmp.path().join("instances.jsonl");
        fs::write(&path, format!("{}\n{}\n", INSTANCE, INSTANCE)).expect("write");
        let err = load_instances(&path).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"), "{}", err);

        fs::write(&path, r#"{"id":"x","repository":"r"}"#).expect("write");
        assert!(load_instances(&path).is_err());
    }

    #[test]
    fn predictions_append_to_patch_list_and_skip_unknown_ids() {
        let instance: Instance = serde_json::from_str(INSTANCE).expect("instance");
        let predictions = vec![
            Prediction {
                instance_id: "proj__1".to_string(),
                model_name_or_path: "org/model-a".to_string(),
                model_patch: Some("diff --git a/x b/x\n".to_string()),
                full_output: None,
            },
            Prediction {
                instance_id: "missing".to_string(),
                model_name_or_path: "org/model-a".to_string(),
                model_patch: None,
                full_output: None,
            },
        ];
        let jobs = build_jobs(std::slice::from_ref(&instance), Some(&predictions));
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].model_dir, "org__model-a");
        assert_eq!(jobs[0].instance.patch_list.len(), 2);
        assert_eq!(jobs[0].instance.baseline_patch_count(), 1);

        let gold = build_jobs(&[instance], None);
        assert_eq!(gold[0].model_name, GOLD_MODEL_NAME);
        assert_eq!(gold[0].instance.patch_list.len(), 1);
    }
}
