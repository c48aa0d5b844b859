use anyhow::{anyhow, Context, Result};
use bench_core::{
    canonical_json_digest, collect_tree_manifest, ensure_dir, Instance, LayerKey, LayerKind,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::layers::LayerBuilder;
use crate::{git, run_checked_command, run_checked_command_with_input, shell_quote};

pub const TESTBED_DIR: &str = "/testbed";
const IMAGE_PREFIX: &str = "bench";
const LOCAL_LAYER_RECORD: &str = "layer.json";
const LOCAL_REPO_DIR: &str = "repo";

/// Docker repository name for a layer: `bench.base.<h>`, `bench.env.<h>`,
/// `bench.inst.<h>`. Separator runs docker would reject collapse to `-`.
pub fn docker_image_name(key: &LayerKey) -> String {
    image_name_for_id(&key.id)
}

fn image_name_for_id(id: &str) -> String {
    let raw = format!("{}.{}", IMAGE_PREFIX, id).to_ascii_lowercase();
    let mut out = String::with_capacity(raw.len());
    let mut run = String::new();
    let flush = |run: &mut String, out: &mut String| {
        if run.is_empty() {
            return;
        }
        let allowed = run == "." || run == "_" || run == "__" || run.chars().all(|c| c == '-');
        if !out.is_empty() {
            out.push_str(if allowed { run.as_str() } else { "-" });
        }
        run.clear();
    };
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            flush(&mut run, &mut out);
            out.push(c);
        } else {
            run.push(if matches!(c, '.' | '_' | '-') { c } else { '-' });
        }
    }
    out
}

fn dockerfile(key: &LayerKey, instance: &Instance) -> Result<String> {
    let spec = &instance.environment_spec;
    let parent = || {
        key.parent
            .as_deref()
            .map(image_name_for_id)
            .ok_or_else(|| anyhow!("layer {} has no parent", key))
    };
    let mut lines = Vec::new();
    match key.kind {
        LayerKind::Base => {
            lines.push(format!("FROM {}", spec.platform));
            lines.push("SHELL [\"/bin/bash\", \"-c\"]".to_string());
            for cmd in &spec.toolchain_install {
                lines.push(format!("RUN {}", cmd));
            }
            lines.push("RUN mkdir -p /tmp/bench".to_string());
        }
        LayerKind::Env => {
            lines.push(format!("FROM {}", parent()?));
            for (k, v) in &spec.env {
                lines.push(format!("ENV {}={}", k, serde_json::to_string(v)?));
            }
            for cmd in &spec.dependencies {
                lines.push(format!("RUN {}", cmd));
            }
        }
        LayerKind::Instance => {
            lines.push(format!("FROM {}", parent()?));
            lines.push(format!(
                "RUN git clone --quiet {} {} && git -C {} -c advice.detachedHead=false checkout -q -f {}",
                shell_quote(&instance.repository),
                TESTBED_DIR,
                TESTBED_DIR,
                shell_quote(&instance.base_revision)
            ));
            lines.push(format!("WORKDIR {}", TESTBED_DIR));
            for cmd in &instance.setup {
                lines.push(format!("RUN {}", cmd));
            }
        }
    }
    lines.push(format!("LABEL bench.layer={}", key.id));
    Ok(lines.join("\n") + "\n")
}

fn tar_context(dockerfile: &str) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let bytes = dockerfile.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", bytes)?;
    Ok(builder.into_inner()?)
}

/// Builds layers as docker images from generated Dockerfiles.
#[derive(Debug, Default)]
pub struct DockerLayerBuilder;

impl LayerBuilder for DockerLayerBuilder {
    fn backend(&self) -> &'static str {
        "docker"
    }

    fn probe(&self, key: &LayerKey) -> Result<bool> {
        let out = Command::new("docker")
            .args(["image", "inspect", "--format", "{{.Id}}"])
            .arg(docker_image_name(key))
            .output()
            .context("failed to run docker image inspect")?;
        Ok(out.status.success())
    }

    fn build(&self, key: &LayerKey, instance: &Instance) -> Result<()> {
        let tag = docker_image_name(key);
        let context = tar_context(&dockerfile(key, instance)?)?;
        let mut cmd = Command::new("docker");
        cmd.args(["build", "--quiet", "-t", &tag, "-"]);
        run_checked_command_with_input(cmd, context, &format!("docker build {}", tag))?;
        info!(layer = %key, image = %tag, "docker layer ready");
        Ok(())
    }

    fn remove(&self, key: &LayerKey) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["image", "rm", "-f"]).arg(docker_image_name(key));
        match run_checked_command(cmd, "docker image rm") {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("No such image") => Ok(()),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalLayerRecord {
    key: LayerKey,
    created_at: String,
    spec: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tree_digest: Option<String>,
}

/// Layers as directories under `<cache_root>/layers`. Base and Env record
/// the toolchain and dependency spec the host is expected to provide; the
/// Instance layer is a clone at the base revision that worker trees are
/// cloned from.
#[derive(Debug, Clone)]
pub struct LocalLayerBuilder {
    root: PathBuf,
}

impl LocalLayerBuilder {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            root: cache_root.join("layers"),
        }
    }

    pub fn layer_dir(&self, key: &LayerKey) -> PathBuf {
        self.root.join(&key.id)
    }

    pub fn repo_dir(&self, key: &LayerKey) -> PathBuf {
        self.layer_dir(key).join(LOCAL_REPO_DIR)
    }

    fn populate(&self, dir: &Path, key: &LayerKey, instance: &Instance) -> Result<LocalLayerRecord> {
        let spec = &instance.environment_spec;
        let (spec_value, tree_digest) = match key.kind {
            LayerKind::Base => (
                json!({"platform": spec.platform, "toolchain": spec.toolchain}),
                None,
            ),
            LayerKind::Env => (
                json!({"dependencies": spec.dependencies, "env": spec.env}),
                None,
            ),
            LayerKind::Instance => {
                let repo = dir.join(LOCAL_REPO_DIR);
                let mut clone = Command::new("git");
                clone
                    .args(["clone", "--quiet", "--no-checkout"])
                    .arg(&instance.repository)
                    .arg(&repo);
                run_checked_command(clone, "git clone")?;
                let mut checkout = git(&repo);
                checkout.args([
                    "-c",
                    "advice.detachedHead=false",
                    "checkout",
                    "-q",
                    "-f",
                    &instance.base_revision,
                ]);
                run_checked_command(checkout, "git checkout")?;
                for setup in &instance.setup {
                    let mut cmd = Command::new("bash");
                    cmd.arg("-c").arg(setup).current_dir(&repo).envs(&spec.env);
                    run_checked_command(cmd, &format!("setup `{}`", setup))?;
                }
                let manifest = collect_tree_manifest(&repo, &[".git"])?;
                (
                    json!({"repository": instance.repository, "base_revision": instance.base_revision}),
                    Some(canonical_json_digest(&serde_json::to_value(&manifest)?)),
                )
            }
        };
        Ok(LocalLayerRecord {
            key: key.clone(),
            created_at: Utc::now().to_rfc3339(),
            spec: spec_value,
            tree_digest,
        })
    }
}

impl LayerBuilder for LocalLayerBuilder {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn probe(&self, key: &LayerKey) -> Result<bool> {
        Ok(self.layer_dir(key).join(LOCAL_LAYER_RECORD).is_file())
    }

    fn build(&self, key: &LayerKey, instance: &Instance) -> Result<()> {
        ensure_dir(&self.root)?;
        let final_dir = self.layer_dir(key);
        let staging = self
            .root
            .join(format!(".{}.partial-{}", key.id, std::process::id()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        ensure_dir(&staging)?;
        let record = match self.populate(&staging, key, instance) {
            Ok(record) => record,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };
        fs::write(
            staging.join(LOCAL_LAYER_RECORD),
            serde_json::to_vec_pretty(&record)?,
        )?;
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&staging, &final_dir)
            .with_context(|| format!("failed to publish layer {}", final_dir.display()))?;
        debug!(layer = %key, dir = %final_dir.display(), "local layer ready");
        Ok(())
    }

    fn remove(&self, key: &LayerKey) -> Result<()> {
        let dir = self.layer_dir(key);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}
