//! The Stage contract.
//!
//! A stage declares what it needs (`configure`), reports a version token for
//! staleness purposes (`verify`), and produces a result (`execute`). Shape
//! grounded on `stage_manager/mod.rs::Stage` (async, `Send + Sync`, id/name
//! plus an execute hook) generalized to the three-hook contract described by
//! `eqasim/pipeline/pipeline.py`'s `Require`/`ConfigContext`/`ExecutorConfig`
//! classes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::config::{ConfigValue, FlatConfig};
use crate::error::ExecutorError;
use crate::progress::ProgressHandle;

/// Opaque result artifact produced by a stage's `execute` hook and consumed
/// by its downstream dependents. Backed by `serde_json::Value` so that any
/// `Serialize`/`Deserialize` type can cross the stage boundary without the
/// engine itself needing to know the concrete type -- the "injected codec"
/// noted as an open design question in the source material.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StageValue(pub JsonValue);

impl StageValue {
    pub fn new<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(StageValue(serde_json::to_value(value)?))
    }

    pub fn extract<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.0.clone())
    }

    pub fn null() -> Self {
        StageValue(JsonValue::Null)
    }
}

/// Collects a stage's declared requirements during `configure`: which
/// config keys it reads (with an optional default) and which upstream
/// stages it depends on. Mirrors the source's `Require` object passed into
/// every stage's `configure(context, require)`.
#[derive(Debug, Default)]
pub struct Require {
    config: HashMap<String, Option<ConfigValue>>,
    stages: HashSet<String>,
}

impl Require {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a read dependency on `key`, optionally with a default value
    /// supplied when the caller's configuration omits it.
    pub fn config(&mut self, key: impl Into<String>, default: Option<ConfigValue>) {
        self.config.insert(key.into(), default);
    }

    /// Declare a dependency on the named upstream stage.
    pub fn stage(&mut self, name: impl Into<String>) {
        self.stages.insert(name.into());
    }

    pub fn config_keys(&self) -> impl Iterator<Item = (&str, &Option<ConfigValue>)> {
        self.config.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.as_str())
    }
}

/// Read-only access to a stage's declared configuration slice. Shared by
/// `verify` and as the basis of `ExecuteContext`. Reading an undeclared key
/// is a programmer error in the source (`KeyError` on an unrequested key)
/// and is modeled the same way here: an explicit [`ExecutorError`].
pub struct ConfigContext<'a> {
    pub(crate) stage: &'a str,
    pub(crate) declared: &'a HashSet<String>,
    pub(crate) config: &'a FlatConfig,
}

impl<'a> ConfigContext<'a> {
    pub fn new(stage: &'a str, declared: &'a HashSet<String>, config: &'a FlatConfig) -> Self {
        Self { stage, declared, config }
    }

    pub fn config(&self, key: &str) -> Result<&ConfigValue, ExecutorError> {
        if !self.declared.contains(key) {
            return Err(ExecutorError::UnrequestedStageAccess {
                stage: self.stage.to_string(),
                target: format!("config:{key}"),
            });
        }

        self.config.get(key).ok_or_else(|| ExecutorError::UnrequestedStageAccess {
            stage: self.stage.to_string(),
            target: format!("config:{key}"),
        })
    }
}

/// Context passed to `Stage::verify`. Exposes only config reads -- the
/// version token computed from them must not itself depend on upstream
/// results or the working directory.
pub type VerifyContext<'a> = ConfigContext<'a>;

/// Context passed to `Stage::execute`: config reads, upstream result
/// reads, cache paths, and a progress tracker factory. Every accessor
/// enforces that the stage only reaches into config keys and upstream
/// stages it declared in `configure`.
pub struct ExecuteContext<'a> {
    pub(crate) stage: &'a str,
    pub(crate) declared_config: &'a HashSet<String>,
    pub(crate) declared_stages: &'a HashSet<String>,
    pub(crate) config: &'a FlatConfig,
    pub(crate) results: &'a HashMap<String, StageValue>,
    pub(crate) workspace_dir: &'a Path,
    pub(crate) progress_port: u16,
}

impl<'a> ExecuteContext<'a> {
    /// Construct a context directly. Exposed for stage implementations'
    /// own tests (which live in other crates and so cannot reach the
    /// `pub(crate)` fields); the executor builds contexts through this
    /// same constructor.
    pub fn new(
        stage: &'a str,
        declared_config: &'a HashSet<String>,
        declared_stages: &'a HashSet<String>,
        config: &'a FlatConfig,
        results: &'a HashMap<String, StageValue>,
        workspace_dir: &'a Path,
        progress_port: u16,
    ) -> Self {
        Self { stage, declared_config, declared_stages, config, results, workspace_dir, progress_port }
    }

    pub fn config(&self, key: &str) -> Result<&ConfigValue, ExecutorError> {
        if !self.declared_config.contains(key) {
            return Err(ExecutorError::UnrequestedStageAccess {
                stage: self.stage.to_string(),
                target: format!("config:{key}"),
            });
        }

        self.config.get(key).ok_or_else(|| ExecutorError::UnrequestedStageAccess {
            stage: self.stage.to_string(),
            target: format!("config:{key}"),
        })
    }

    /// Read the result artifact produced by an upstream stage.
    pub fn stage<T: DeserializeOwned>(&self, name: &str) -> Result<T, ExecutorError> {
        if !self.declared_stages.contains(name) {
            return Err(ExecutorError::UnrequestedStageAccess {
                stage: self.stage.to_string(),
                target: name.to_string(),
            });
        }

        let value = self.results.get(name).ok_or_else(|| ExecutorError::UnrequestedStageAccess {
            stage: self.stage.to_string(),
            target: name.to_string(),
        })?;

        value.extract().map_err(|source| ExecutorError::Codec {
            stage: self.stage.to_string(),
            what: "upstream result",
            source,
        })
    }

    /// A private scratch directory this stage may use for side files that
    /// are not the tracked result artifact (e.g. large intermediate
    /// outputs). `None` resolves to this stage's own cache directory;
    /// `Some(other)` must name a declared upstream stage, same restriction
    /// as [`Self::stage`].
    pub fn cache_path(&self, name: Option<&str>) -> Result<PathBuf, ExecutorError> {
        match name {
            None => Ok(self.workspace_dir.join(format!("{}_cache", self.stage))),
            Some(other) => {
                if !self.declared_stages.contains(other) {
                    return Err(ExecutorError::UnrequestedStageAccess {
                        stage: self.stage.to_string(),
                        target: format!("cache:{other}"),
                    });
                }
                Ok(self.workspace_dir.join(format!("{other}_cache")))
            }
        }
    }

    /// Obtain a scoped progress tracker. Acquired eagerly, released when
    /// the returned handle is dropped.
    pub fn progress(
        &self,
        desc: Option<String>,
        total: Option<u64>,
        interval: Option<f64>,
    ) -> Result<ProgressHandle, ExecutorError> {
        ProgressHandle::new(self.progress_port, desc, total, interval).map_err(|source| {
            ExecutorError::StageFailure { stage: self.stage.to_string(), source: Box::new(source) }
        })
    }
}

/// A unit of computation in the pipeline. Implementors are registered by
/// name and wired together purely through the requirements they declare in
/// `configure`.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable identifier used in configuration, logs, and cache file names.
    fn name(&self) -> &str;

    /// Declare the config keys and upstream stages this stage needs. Called
    /// once per discovered stage before scheduling. Optional; a stage with
    /// no config reads and no dependencies may leave this as a no-op.
    fn configure(&self, _require: &mut Require) {}

    /// Produce a token summarizing this stage's "logical version" (e.g. a
    /// code/version string). Used for version-sensitivity staleness checks.
    /// Optional; `None` means this stage has no separate version axis and
    /// is never made stale by a verify-token change.
    fn verify(&self, _ctx: &VerifyContext<'_>) -> Result<Option<String>, ExecutorError> {
        Ok(None)
    }

    /// Compute this stage's result.
    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StageValue, Box<dyn std::error::Error + Send + Sync + 'static>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_value_round_trips_through_json() {
        let value = StageValue::new(&vec![1, 2, 3]).unwrap();
        let back: Vec<i32> = value.extract().unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }

    #[test]
    fn require_collects_config_and_stages() {
        let mut require = Require::new();
        require.config("threshold", Some(ConfigValue::Int(3)));
        require.stage("upstream");

        assert_eq!(require.config_keys().count(), 1);
        assert_eq!(require.stages().collect::<Vec<_>>(), vec!["upstream"]);
    }

    #[test]
    fn config_context_rejects_undeclared_key() {
        let declared = HashSet::new();
        let config = FlatConfig::new();
        let ctx = ConfigContext { stage: "s", declared: &declared, config: &config };
        let err = ctx.config("nope").unwrap_err();
        assert!(matches!(err, ExecutorError::UnrequestedStageAccess { .. }));
    }

    #[test]
    fn cache_path_rejects_an_undeclared_upstream() {
        let declared_config = HashSet::new();
        let declared_stages = HashSet::new();
        let config = FlatConfig::new();
        let results = HashMap::new();
        let ctx = ExecuteContext::new(
            "s",
            &declared_config,
            &declared_stages,
            &config,
            &results,
            Path::new("/tmp"),
            0,
        );

        let err = ctx.cache_path(Some("upstream")).unwrap_err();
        assert!(matches!(err, ExecutorError::UnrequestedStageAccess { .. }));
        assert!(ctx.cache_path(None).is_ok());
    }
}
