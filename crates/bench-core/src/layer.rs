use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::{canonical_json_digest, short_digest, Instance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Base,
    Env,
    Instance,
}

impl LayerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LayerKind::Base => "base",
            LayerKind::Env => "env",
            LayerKind::Instance => "instance",
        }
    }
}

/// Identity of a cached layer. Keys chain Base -> Env -> Instance through
/// `parent`; the digest covers the parent id so a changed base invalidates
/// everything built on it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerKey {
    pub kind: LayerKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl LayerKey {
    pub fn base(instance: &Instance) -> LayerKey {
        let digest = instance.environment_spec.toolchain_digest();
        LayerKey {
            kind: LayerKind::Base,
            id: format!("base.{}", short_digest(&digest)),
            parent: None,
        }
    }

    pub fn env(base: &LayerKey, instance: &Instance) -> LayerKey {
        let digest = canonical_json_digest(&json!({
            "base": base.id,
            "dependency_hash": instance.environment_spec.dependency_hash(),
        }));
        LayerKey {
            kind: LayerKind::Env,
            id: format!("env.{}", short_digest(&digest)),
            parent: Some(base.id.clone()),
        }
    }

    /// Keyed by repository, revision and setup only; instances that share
    /// them share the layer.
    pub fn instance(env: &LayerKey, instance: &Instance) -> LayerKey {
        let digest = canonical_json_digest(&json!({
            "env": env.id,
            "repository": instance.repository,
            "base_revision": instance.base_revision,
            "setup": instance.setup,
        }));
        LayerKey {
            kind: LayerKind::Instance,
            id: format!("inst.{}", short_digest(&digest)),
            parent: Some(env.id.clone()),
        }
    }

    /// Base, Env and Instance keys for one instance, in build order.
    pub fn chain(instance: &Instance) -> [LayerKey; 3] {
        let base = LayerKey::base(instance);
        let env = LayerKey::env(&base, instance);
        let inst = LayerKey::instance(&env, instance);
        [base, env, inst]
    }
}

impl fmt::Display for LayerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Building,
    Ready,
    Failed { error: String },
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Pending => "pending",
            BuildState::Building => "building",
            BuildState::Ready => "ready",
            BuildState::Failed { .. } => "failed",
        }
    }
}

/// Highest layer tier kept after a run; tiers above it that were built
/// during the run are removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheLevel {
    None,
    Base,
    #[default]
    Env,
    Instance,
}

impl CacheLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheLevel::None => "none",
            CacheLevel::Base => "base",
            CacheLevel::Env => "env",
            CacheLevel::Instance => "instance",
        }
    }

    pub fn keeps(self, kind: LayerKind) -> bool {
        let rank = match kind {
            LayerKind::Base => CacheLevel::Base,
            LayerKind::Env => CacheLevel::Env,
            LayerKind::Instance => CacheLevel::Instance,
        };
        rank <= self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EnvironmentSpec;

    fn instance(id: &str, revision: &str, deps: &[&str]) -> Instance {
        Instance {
            id: id.to_string(),
            repository: "https://example.invalid/proj.git".to_string(),
            base_revision: revision.to_string(),
            environment_spec: EnvironmentSpec {
                platform: "ubuntu:22.04".to_string(),
                toolchain: "python3.11".to_string(),
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                test_command: "pytest -rA".to_string(),
                ..EnvironmentSpec::default()
            },
            test_directives: Vec::new(),
            patch_list: Vec::new(),
            baseline_patches: None,
            setup: Vec::new(),
        }
    }

    #[test]
    fn chain_links_parents_bottom_up() {
        let [base, env, inst] = LayerKey::chain(&instance("Proj__1", "aaa", &["pip install -e ."]));
        assert_eq!(base.kind, LayerKind::Base);
        assert!(base.parent.is_none());
        assert_eq!(env.parent.as_deref(), Some(base.id.as_str()));
        assert_eq!(inst.parent.as_deref(), Some(env.id.as_str()));
        assert!(inst.id.starts_with("inst."), "{}", inst.id);
        assert!(!inst.id.contains("proj__1"), "{}", inst.id);
    }

    #[test]
    fn instances_sharing_an_environment_share_lower_layers() {
        let a = LayerKey::chain(&instance("a", "rev1", &["numpy"]));
        let b = LayerKey::chain(&instance("b", "rev2", &["numpy"]));
        let c = LayerKey::chain(&instance("c", "rev1", &["scipy"]));
        assert_eq!(a[0], b[0]);
        assert_eq!(a[1], b[1]);
        assert_ne!(a[2], b[2]);
        assert_eq!(a[0], c[0]);
        assert_ne!(a[1], c[1]);
    }

    #[test]
    fn instances_at_the_same_revision_share_the_instance_layer() {
        let a = LayerKey::chain(&instance("proj__1", "rev1", &["numpy"]));
        let b = LayerKey::chain(&instance("proj__2", "rev1", &["numpy"]));
        assert_eq!(a[2], b[2]);

        let mut with_setup = instance("proj__3", "rev1", &["numpy"]);
        with_setup.setup = vec!["make build".to_string()];
        assert_ne!(a[2], LayerKey::chain(&with_setup)[2]);
    }

    #[test]
    fn cache_level_keeps_lower_tiers() {
        assert!(!CacheLevel::None.keeps(LayerKind::Base));
        assert!(CacheLevel::Env.keeps(LayerKind::Base));
        assert!(CacheLevel::Env.keeps(LayerKind::Env));
        assert!(!CacheLevel::Env.keeps(LayerKind::Instance));
        assert!(CacheLevel::Instance.keeps(LayerKind::Instance));
    }

    #[test]
    fn build_state_is_tagged() {
        let raw = serde_json::to_string(&BuildState::Failed {
            error: "boom".to_string(),
        })
        .expect("serialize");
        assert_eq!(raw, r#"{"state":"failed","error":"boom"}"#);
    }
}
