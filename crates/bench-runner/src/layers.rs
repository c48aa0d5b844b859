//! Single-flight cache of Base/Env/Instance layers.
//!
//! Each key moves Pending -> Building -> Ready | Failed once per cache
//! lifetime. Only the Pending -> Building transition is taken under the
//! lock; the build itself runs outside it while other requesters for the same
//! key wait on the condvar. Failures are sticky and recorded in the registry
//! file so later runs see them until `retry_failed` clears them.

use anyhow::{anyhow, Context, Result};
use bench_core::{BuildState, CacheLevel, Instance, LayerKey};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{info, warn};

pub const LAYER_REGISTRY_FILE: &str = "layers.json";
const LAYER_REGISTRY_SCHEMA_V1: &str = "layer_registry_v1";

/// Builds and inspects layers of one backend.
pub trait LayerBuilder: Send + Sync {
    fn backend(&self) -> &'static str;
    /// Whether the layer already exists in the backend.
    fn probe(&self, key: &LayerKey) -> Result<bool>;
    fn build(&self, key: &LayerKey, instance: &Instance) -> Result<()>;
    fn remove(&self, key: &LayerKey) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("layer {key} failed to build: {error}")]
    Failed { key: String, error: String },
    #[error("layer cache unavailable: {0}")]
    Cache(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub key: LayerKey,
    pub backend: String,
    pub build_state: BuildState,
    pub updated_at: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LayerRegistry {
    schema_version: String,
    layers: Vec<LayerRecord>,
}

fn read_registry(path: &Path) -> Result<LayerRegistry> {
    if !path.exists() {
        return Ok(LayerRegistry {
            schema_version: LAYER_REGISTRY_SCHEMA_V1.to_string(),
            layers: Vec::new(),
        });
    }
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let registry: LayerRegistry = serde_json::from_slice(&raw)
        .with_context(|| format!("invalid layer registry {}", path.display()))?;
    if registry.schema_version != LAYER_REGISTRY_SCHEMA_V1 {
        return Err(anyhow!(
            "unsupported layer registry schema {} in {}",
            registry.schema_version,
            path.display()
        ));
    }
    Ok(registry)
}

fn write_registry(path: &Path, registry: &LayerRegistry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(registry)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn list_layers(cache_root: &Path) -> Result<Vec<LayerRecord>> {
    let mut layers = read_registry(&cache_root.join(LAYER_REGISTRY_FILE))?.layers;
    layers.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(layers)
}

/// Clears failed layers (all of them, or the one with id `key`) so the next
/// request rebuilds them. Returns the cleared ids.
pub fn retry_failed(cache_root: &Path, key: Option<&str>) -> Result<Vec<String>> {
    let path = cache_root.join(LAYER_REGISTRY_FILE);
    let mut registry = read_registry(&path)?;
    let mut cleared = Vec::new();
    registry.layers.retain(|record| {
        let matches = key.map_or(true, |k| record.key.id == k);
        if matches && matches!(record.build_state, BuildState::Failed { .. }) {
            cleared.push(record.key.id.clone());
            false
        } else {
            true
        }
    });
    if let Some(k) = key {
        if cleared.is_empty() {
            return Err(anyhow!("no failed layer with id {}", k));
        }
    }
    write_registry(&path, &registry)?;
    Ok(cleared)
}

pub struct LayerCache {
    builder: Arc<dyn LayerBuilder>,
    registry_path: PathBuf,
    force_rebuild: bool,
    slots: Mutex<HashMap<LayerKey, BuildState>>,
    changed: Condvar,
    built: Mutex<Vec<LayerKey>>,
    registry_lock: Mutex<()>,
}

impl LayerCache {
    /// Opens the cache, restoring sticky failures from the registry. Ready
    /// entries are re-probed on first use since the backend may have lost them.
    pub fn open(
        builder: Arc<dyn LayerBuilder>,
        cache_root: &Path,
        force_rebuild: bool,
    ) -> Result<Self> {
        let registry_path = cache_root.join(LAYER_REGISTRY_FILE);
        let registry = read_registry(&registry_path)?;
        let slots = registry
            .layers
            .into_iter()
            .filter(|r| r.backend == builder.backend())
            .filter(|r| matches!(r.build_state, BuildState::Failed { .. }))
            .map(|r| (r.key, r.build_state))
            .collect();
        Ok(Self {
            builder,
            registry_path,
            force_rebuild,
            slots: Mutex::new(slots),
            changed: Condvar::new(),
            built: Mutex::new(Vec::new()),
            registry_lock: Mutex::new(()),
        })
    }

    pub fn backend(&self) -> &'static str {
        self.builder.backend()
    }

    fn lock_slots(&self) -> Result<MutexGuard<'_, HashMap<LayerKey, BuildState>>, LayerError> {
        self.slots
            .lock()
            .map_err(|_| LayerError::Cache("layer slots lock poisoned".to_string()))
    }

    pub fn state(&self, key: &LayerKey) -> Result<BuildState, LayerError> {
        Ok(self
            .lock_slots()?
            .get(key)
            .cloned()
            .unwrap_or(BuildState::Pending))
    }

    /// Makes `key` Ready, building it at most once across all callers.
    pub fn ensure(&self, key: &LayerKey, instance: &Instance) -> Result<(), LayerError> {
        let mut slots = self.lock_slots()?;
        loop {
            match slots.get(key).cloned() {
                Some(BuildState::Ready) => return Ok(()),
                Some(BuildState::Failed { error }) => {
                    return Err(LayerError::Failed {
                        key: key.id.clone(),
                        error,
                    })
                }
                Some(BuildState::Building) => {
                    slots = self
                        .changed
                        .wait(slots)
                        .map_err(|_| LayerError::Cache("layer slots lock poisoned".to_string()))?;
                }
                Some(BuildState::Pending) | None => {
                    slots.insert(key.clone(), BuildState::Building);
                    break;
                }
            }
        }
        drop(slots);

        let lease = BuildLease {
            cache: self,
            key: key.clone(),
            resolved: false,
        };
        let outcome = self.probe_or_build(key, instance);
        lease.resolve(outcome)
    }

    /// Ensures Base, Env and Instance in order and returns the Instance key.
    pub fn ensure_chain(&self, instance: &Instance) -> Result<LayerKey, LayerError> {
        let [base, env, inst] = LayerKey::chain(instance);
        self.ensure(&base, instance)?;
        self.ensure(&env, instance)?;
        self.ensure(&inst, instance)?;
        Ok(inst)
    }

    fn probe_or_build(&self, key: &LayerKey, instance: &Instance) -> Result<bool> {
        if !self.force_rebuild && self.builder.probe(key)? {
            return Ok(false);
        }
        info!(layer = %key, kind = key.kind.as_str(), backend = self.backend(), "building layer");
        self.builder.build(key, instance)?;
        Ok(true)
    }

    fn finish(&self, key: &LayerKey, state: BuildState, built: bool) {
        if built {
            if let Ok(mut list) = self.built.lock() {
                list.push(key.clone());
            }
        }
        if let Err(err) = self.record(key, &state) {
            warn!(layer = %key, error = %err, "failed to update layer registry");
        }
        if let Ok(mut slots) = self.slots.lock() {
            slots.insert(key.clone(), state);
        }
        self.changed.notify_all();
    }

    fn record(&self, key: &LayerKey, state: &BuildState) -> Result<()> {
        let _guard = self
            .registry_lock
            .lock()
            .map_err(|_| anyhow!("layer registry lock poisoned"))?;
        let mut registry = read_registry(&self.registry_path)?;
        registry.layers.retain(|r| &r.key != key);
        registry.layers.push(LayerRecord {
            key: key.clone(),
            backend: self.backend().to_string(),
            build_state: state.clone(),
            updated_at: Utc::now().to_rfc3339(),
        });
        write_registry(&self.registry_path, &registry)
    }

    /// Layers this cache built during its lifetime.
    pub fn built_this_run(&self) -> Vec<LayerKey> {
        self.built.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Removes layers built during this run whose tier sits above `level`,
    /// topmost tier first. Returns the removed keys.
    pub fn remove_above(&self, level: CacheLevel) -> Result<Vec<LayerKey>> {
        let mut doomed: Vec<LayerKey> = self
            .built_this_run()
            .into_iter()
            .filter(|key| !level.keeps(key.kind))
            .collect();
        doomed.sort_by(|a, b| b.kind.cmp(&a.kind).then_with(|| a.id.cmp(&b.id)));
        for key in &doomed {
            self.builder.remove(key)?;
            {
                let _guard = self
                    .registry_lock
                    .lock()
                    .map_err(|_| anyhow!("layer registry lock poisoned"))?;
                let mut registry = read_registry(&self.registry_path)?;
                registry.layers.retain(|r| &r.key != key);
                write_registry(&self.registry_path, &registry)?;
            }
            if let Ok(mut slots) = self.slots.lock() {
                slots.remove(key);
            }
            info!(layer = %key, level = level.as_str(), "removed layer above cache level");
        }
        Ok(doomed)
    }
}

/// Resolves its slot exactly once. A lease dropped without `resolve` (the
/// builder panicked) marks the layer Failed so waiters are released.
struct BuildLease<'a> {
    cache: &'a LayerCache,
    key: LayerKey,
    resolved: bool,
}

impl BuildLease<'_> {
    fn resolve(mut self, outcome: Result<bool>) -> Result<(), LayerError> {
        self.resolved = true;
        match outcome {
            Ok(built) => {
                self.cache.finish(&self.key, BuildState::Ready, built);
                Ok(())
            }
            Err(err) => {
                let error = format!("{:#}", err);
                warn!(layer = %self.key, error = %error, "layer build failed");
                self.cache.finish(
                    &self.key,
                    BuildState::Failed {
                        error: error.clone(),
                    },
                    false,
                );
                Err(LayerError::Failed {
                    key: self.key.id.clone(),
                    error,
                })
            }
        }
    }
}

impl Drop for BuildLease<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.cache.finish(
                &self.key,
                BuildState::Failed {
                    error: "layer builder panicked".to_string(),
                },
                false,
            );
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeBuilder;
    use super::*;
    use bench_core::LayerKind;
    use crate::testutil::TempDirGuard;
    use bench_core::EnvironmentSpec;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    fn instance(id: &str) -> Instance {
        Instance {
            id: id.to_string(),
            repository: "https://example.invalid/r.git".to_string(),
            base_revision: "abc".to_string(),
            environment_spec: EnvironmentSpec {
                platform: "ubuntu:22.04".to_string(),
                toolchain: "python3.11".to_string(),
                test_command: "pytest".to_string(),
                ..EnvironmentSpec::default()
            },
            test_directives: Vec::new(),
            patch_list: Vec::new(),
            baseline_patches: None,
            setup: Vec::new(),
        }
    }

    #[test]
    fn concurrent_requesters_share_one_build() {
        let tmp = TempDirGuard::new("layers_single_flight");
        let builder = Arc::new(FakeBuilder {
            build_delay: Duration::from_millis(50),
            ..FakeBuilder::default()
        });
        let cache = Arc::new(LayerCache::open(builder.clone(), tmp.path(), false).expect("open"));
        let inst = instance("a__1");
        let key = LayerKey::base(&inst);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let inst = inst.clone();
                let key = key.clone();
                thread::spawn(move || cache.ensure(&key, &inst))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join").expect("ensure");
        }
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.state(&key).expect("state"), BuildState::Ready);
    }

    #[test]
    fn shared_env_layer_is_built_once_for_many_instances() {
        let tmp = TempDirGuard::new("layers_chain");
        let builder = Arc::new(FakeBuilder::default());
        let cache = LayerCache::open(builder.clone(), tmp.path(), false).expect("open");
        cache.ensure_chain(&instance("a__1")).expect("first chain");
        let mut later = instance("a__2");
        later.base_revision = "def".to_string();
        cache.ensure_chain(&later).expect("second chain");
        // Same repository and revision as a__1, so its instance layer too.
        cache.ensure_chain(&instance("a__3")).expect("third chain");
        // One base, one env, two instance layers.
        assert_eq!(builder.builds.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn failure_is_sticky_and_persisted_until_retry() {
        let tmp = TempDirGuard::new("layers_sticky");
        let builder = Arc::new(FakeBuilder {
            fail_kind: Some(LayerKind::Env),
            ..FakeBuilder::default()
        });
        let cache = LayerCache::open(builder.clone(), tmp.path(), false).expect("open");
        let inst = instance("a__1");
        let first = cache.ensure_chain(&inst).expect_err("env fails");
        let second = cache.ensure_chain(&inst).expect_err("still failed");
        assert_eq!(first, second);
        assert!(first.to_string().contains("toolchain install exited 2"));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);

        // A new cache over the same registry sees the failure without building.
        let reopened = LayerCache::open(builder.clone(), tmp.path(), false).expect("reopen");
        assert!(reopened.ensure_chain(&inst).is_err());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);

        let env_id = LayerKey::env(&LayerKey::base(&inst), &inst).id;
        let cleared = retry_failed(tmp.path(), None).expect("retry");
        assert_eq!(cleared, vec![env_id]);
        let retried = LayerCache::open(builder.clone(), tmp.path(), false).expect("reopen");
        assert!(retried.ensure_chain(&inst).is_err());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_builder_releases_waiters_with_failure() {
        let tmp = TempDirGuard::new("layers_panic");
        let builder = Arc::new(FakeBuilder {
            panic_kind: Some(LayerKind::Base),
            build_delay: Duration::from_millis(30),
            ..FakeBuilder::default()
        });
        let cache = Arc::new(LayerCache::open(builder.clone(), tmp.path(), false).expect("open"));
        let inst = instance("a__1");
        let key = LayerKey::base(&inst);
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let cache = cache.clone();
                let inst = inst.clone();
                let key = key.clone();
                thread::spawn(move || cache.ensure(&key, &inst))
            })
            .collect();
        let mut failures = 0;
        for handle in handles {
            match handle.join() {
                Ok(result) => {
                    let err = result.expect_err("waiter sees failure");
                    assert!(err.to_string().contains("panicked"), "{}", err);
                    failures += 1;
                }
                Err(_) => failures += 1,
            }
        }
        assert_eq!(failures, 3);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn existing_layers_are_reused_unless_forced() {
        let tmp = TempDirGuard::new("layers_probe");
        let inst = instance("a__1");
        let key = LayerKey::base(&inst);
        let builder = Arc::new(FakeBuilder::default());
        builder.existing.lock().expect("lock").insert(key.id.clone());

        let cache = LayerCache::open(builder.clone(), tmp.path(), false).expect("open");
        cache.ensure(&key, &inst).expect("ensure");
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);
        assert!(cache.built_this_run().is_empty());

        let forced = LayerCache::open(builder.clone(), tmp.path(), true).expect("open");
        forced.ensure(&key, &inst).expect("ensure");
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cleanup_removes_tiers_above_cache_level() {
        let tmp = TempDirGuard::new("layers_cleanup");
        let builder = Arc::new(FakeBuilder::default());
        let cache = LayerCache::open(builder.clone(), tmp.path(), false).expect("open");
        let inst = instance("a__1");
        cache.ensure_chain(&inst).expect("chain");

        let removed = cache.remove_above(CacheLevel::Base).expect("cleanup");
        let kinds: Vec<LayerKind> = removed.iter().map(|k| k.kind).collect();
        assert_eq!(kinds, vec![LayerKind::Instance, LayerKind::Env]);
        let remaining = list_layers(tmp.path()).expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key.kind, LayerKind::Base);
    }
}
