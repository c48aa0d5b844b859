use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;

mod layer;
mod model;
mod outcome;
#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use layer::{BuildState, CacheLevel, LayerKey, LayerKind};
pub use model::{model_dir_name, EnvironmentSpec, Instance, Prediction, RunLog, GOLD_MODEL_NAME};
pub use outcome::{
    FileApplyResult, PatchApplyResult, PatchFailureKind, PatchMode, TestDelta, TestPhase,
    TestStatus, Transition, Verdict, VerdictKind,
};

pub const SHORT_DIGEST_LEN: usize = 12;

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}

/// Hex prefix of a `sha256:` digest, used in layer names and image tags.
pub fn short_digest(digest: &str) -> String {
    let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
    hex.chars().take(SHORT_DIGEST_LEN).collect()
}

pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_json_string(s),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", quote_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}

fn quote_json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))?;
    Ok(())
}

pub fn sanitize_for_fs(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || out.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        out
    }
}

/// Reads either a JSON array or a JSONL stream of objects.
pub fn read_json_records(path: &Path) -> Result<Vec<Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_json_records(&raw).with_context(|| format!("invalid records in {}", path.display()))
}

pub fn parse_json_records(raw: &str) -> Result<Vec<Value>> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        let value: Value = serde_json::from_str(trimmed)?;
        return match value {
            Value::Array(items) => Ok(items),
            _ => Err(anyhow!("expected a JSON array")),
        };
    }
    let mut rows = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row: Value = serde_json::from_str(line)
            .map_err(|e| anyhow!("line {}: {}", idx + 1, e))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Relative path to digest for every regular file under `root`, skipping the
/// given top-level entries.
pub fn collect_tree_manifest(root: &Path, exclude: &[&str]) -> Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    if !root.exists() {
        return Ok(files);
    }
    let walker = walkdir::WalkDir::new(root).into_iter().filter_entry(|entry| {
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        !exclude.iter().any(|prefix| rel.starts_with(prefix))
    });
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.insert(rel, sha256_file(entry.path())?);
    }
    Ok(files)
}

/// Paths whose digest differs between two manifests, including paths present
/// in only one of them.
pub fn diff_manifests(
    expected: &BTreeMap<String, String>,
    actual: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut changed = Vec::new();
    for (path, digest) in expected {
        if actual.get(path) != Some(digest) {
            changed.push(path.clone());
        }
    }
    for path in actual.keys() {
        if !expected.contains_key(path) {
            changed.push(path.clone());
        }
    }
    changed.sort();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TempDirGuard;
    use serde_json::json;

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"b": [1, 2], "a": {"y": true, "x": null}});
        let b = json!({"a": {"x": null, "y": true}, "b": [1, 2]});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"x":null,"y":true},"b":[1,2]}"#);
    }

    #[test]
    fn short_digest_strips_algorithm_prefix() {
        let digest = sha256_bytes(b"abc");
        let short = short_digest(&digest);
        assert_eq!(short.len(), SHORT_DIGEST_LEN);
        assert!(digest["sha256:".len()..].starts_with(&short));
        assert_eq!(short_digest(&short), short);
    }

    #[test]
    fn sanitize_for_fs_replaces_separators() {
        assert_eq!(sanitize_for_fs("org/model:v1"), "org_model_v1");
        assert_eq!(sanitize_for_fs(".."), "unnamed");
        assert_eq!(sanitize_for_fs("django__django-1234"), "django__django-1234");
    }

    #[test]
    fn json_records_accept_array_and_jsonl() {
        let array = parse_json_records(r#"[{"id": "a"}, {"id": "b"}]"#).expect("array");
        assert_eq!(array.len(), 2);
        let lines = parse_json_records("{\"id\": \"a\"}\n\n{\"id\": \"b\"}\n").expect("jsonl");
        assert_eq!(lines, array);
        let err = parse_json_records("{\"id\": \"a\"}\nnot json\n").expect_err("bad line");
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn tree_manifest_skips_excluded_prefixes_and_reports_changes() {
        let root = TempDirGuard::new("bench_core_manifest");
        ensure_dir(&root.path().join(".git")).expect("git dir");
        ensure_dir(&root.path().join("src")).expect("src dir");
        fs::write(root.path().join(".git/HEAD"), "ref").expect("head");
        fs::write(root.path().join("src/lib.py"), "x = 1\n").expect("lib");
        fs::write(root.path().join("README"), "hi\n").expect("readme");

        let before = collect_tree_manifest(root.path(), &[".git"]).expect("manifest");
        assert_eq!(
            before.keys().cloned().collect::<Vec<_>>(),
            vec!["README".to_string(), "src/lib.py".to_string()]
        );

        fs::write(root.path().join("src/lib.py"), "x = 2\n").expect("rewrite");
        fs::write(root.path().join("new.txt"), "n\n").expect("new");
        fs::remove_file(root.path().join("README")).expect("remove");
        let after = collect_tree_manifest(root.path(), &[".git"]).expect("manifest");
        assert_eq!(
            diff_manifests(&before, &after),
            vec![
                "README".to_string(),
                "new.txt".to_string(),
                "src/lib.py".to_string()
            ]
        );
        assert!(diff_manifests(&after, &after).is_empty());
    }
}
