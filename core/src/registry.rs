//! Stage Registry & Resolver.
//!
//! Loads stages by name and performs transitive requirement discovery: a
//! work-queue walk starting from the requested stages, pulling in every
//! stage reachable through a `Require::stage` declaration, collecting each
//! stage's declared config keys/defaults along the way. Translated
//! line-for-line from `eqasim/pipeline/pipeline.py::run`'s discovery loop
//! (`pending_stages`/`available_stages`/`config_dependencies`/
//! `stage_dependencies`); the by-name lookup contract follows
//! `plugin_system/registry.rs`'s `HashMap<String, _>`-backed registry shape.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::config::{ConfigValue, FlatConfig};
use crate::error::RegistryError;
use crate::stage::{Require, Stage};

/// Loads [`Stage`] implementations by name. A static, compile-time-assembled
/// registry (as implemented by [`StaticRegistry`]) is a conforming
/// implementation; nothing in the discovery algorithm requires dynamic
/// loading.
pub trait Registry: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<dyn Stage>>;
}

/// A registry whose stages are all known and registered up front.
#[derive(Default)]
pub struct StaticRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name().to_string(), stage);
    }
}

impl Registry for StaticRegistry {
    fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }
}

/// The outcome of transitive stage discovery: every reachable stage plus
/// the dependency and config-requirement edges collected while walking it.
pub struct Discovery {
    pub stages: HashMap<String, Arc<dyn Stage>>,
    pub dependencies: HashMap<String, HashSet<String>>,
    pub declared_config: HashMap<String, HashSet<String>>,
    pub config_defaults: HashMap<String, ConfigValue>,
}

/// Walk outward from `requested`, pulling in every stage reachable through
/// declared upstream dependencies, and resolve default config values along
/// the way. A config key declared with conflicting defaults by two
/// different stages is an error, exactly as in the source
/// (`config_dependencies[key]` collision check).
pub fn discover(registry: &dyn Registry, requested: &[String]) -> Result<Discovery, RegistryError> {
    let mut discovered: HashMap<String, Arc<dyn Stage>> = HashMap::new();
    let mut dependencies: HashMap<String, HashSet<String>> = HashMap::new();
    let mut declared_config: HashMap<String, HashSet<String>> = HashMap::new();
    let mut default_candidates: HashMap<String, Vec<(ConfigValue, String)>> = HashMap::new();

    let mut queue: VecDeque<String> = requested.iter().cloned().collect();
    let mut queued: HashSet<String> = requested.iter().cloned().collect();

    while let Some(name) = queue.pop_front() {
        if discovered.contains_key(&name) {
            continue;
        }

        let stage = registry.get(&name).ok_or_else(|| RegistryError::StageNotFound { name: name.clone() })?;

        let mut require = Require::new();
        stage.configure(&mut require);

        let mut own_config = HashSet::new();
        for (key, default) in require.config_keys() {
            own_config.insert(key.to_string());
            if let Some(default) = default {
                default_candidates.entry(key.to_string()).or_default().push((default.clone(), name.clone()));
            }
        }
        declared_config.insert(name.clone(), own_config);

        let mut own_deps = HashSet::new();
        for upstream in require.stages() {
            own_deps.insert(upstream.to_string());
            if !queued.contains(upstream) {
                queue.push_back(upstream.to_string());
                queued.insert(upstream.to_string());
            }
        }
        dependencies.insert(name.clone(), own_deps);

        discovered.insert(name.clone(), stage);
    }

    let mut config_defaults = HashMap::new();
    for (key, candidates) in default_candidates {
        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for (value, stage) in &candidates {
            grouped.entry(format!("{value:?}")).or_default().push(stage.clone());
        }

        if grouped.len() > 1 {
            let conflicts = candidates
                .iter()
                .map(|(value, stage)| (format!("{value:?}"), vec![stage.clone()]))
                .collect::<Vec<_>>();
            return Err(RegistryError::DefaultValueConflict { key, conflicts });
        }

        config_defaults.insert(key, candidates[0].0.clone());
    }

    Ok(Discovery { stages: discovered, dependencies, declared_config, config_defaults })
}

/// Merge user-supplied config with resolved defaults, and verify every
/// declared key is present in the result -- a declared key missing from
/// both the user config and every stage's defaults is a hard error.
pub fn resolve_config(discovery: &Discovery, user_config: &FlatConfig) -> Result<FlatConfig, RegistryError> {
    let mut resolved = user_config.clone();
    for (key, default) in &discovery.config_defaults {
        resolved.entry(key.clone()).or_insert_with(|| default.clone());
    }

    for (stage, keys) in &discovery.declared_config {
        for key in keys {
            if !resolved.contains_key(key) {
                return Err(RegistryError::MissingConfigKey { stage: stage.clone(), key: key.clone() });
            }
        }
    }

    Ok(resolved)
}
