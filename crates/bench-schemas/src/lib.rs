use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::Draft;
pub use jsonschema::JSONSchema;
use serde_json::Value;
use std::fs;
use std::path::Path;

pub const INSTANCE_SCHEMA: &str = "instance_v1.jsonschema";
pub const PREDICTION_SCHEMA: &str = "prediction_v1.jsonschema";
pub const VERDICT_SCHEMA: &str = "verdict_v1.jsonschema";

static SCHEMAS_DIR: Dir = include_dir!("$CARGO_MANIFEST_DIR/../../schemas");

pub fn schema_names() -> Vec<String> {
    let mut names: Vec<String> = SCHEMAS_DIR
        .files()
        .filter_map(|f| {
            f.path()
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .collect();
    names.sort();
    names
}

pub fn load_schema(name: &str) -> Result<Value> {
    if let Some(file) = SCHEMAS_DIR.get_file(name) {
        let data = std::str::from_utf8(file.contents())?;
        return Ok(serde_json::from_str(data)?);
    }

    // Dev fallback: schema files added after this crate was last built.
    let fs_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../schemas")
        .join(name);
    if fs_path.exists() {
        let data = fs::read_to_string(fs_path)?;
        return Ok(serde_json::from_str(&data)?);
    }

    Err(anyhow!("schema not found: {}", name))
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let schema = load_schema(name)?;
    let schema = Box::leak(Box::new(schema));
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)?;
    Ok(compiled)
}

/// Validates one record, joining every violation into the error message.
pub fn validate_record(schema: &JSONSchema, schema_name: &str, value: &Value) -> Result<()> {
    if let Err(errors) = schema.validate(value) {
        let msgs = errors
            .map(|e| {
                let at = e.instance_path.to_string();
                if at.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", at, e)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(anyhow!("schema validation failed ({}): {}", schema_name, msgs));
    }
    Ok(())
}
