//! End-to-end scenarios exercising the full `run_with_progress` path against
//! a three-stage linear chain (`load` -> `transform` -> `save`), grounded on
//! the staleness/execution scenarios implied by
//! `eqasim/pipeline/pipeline.py::run`: a fresh run executes everything, a
//! clean rerun executes nothing, a config change deep in the chain forces
//! that stage and everything downstream of it to re-execute (upstream
//! identity propagation), and a version bump has the same effect without
//! any config change at all.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pipeline_core::config::ConfigValue;
use pipeline_core::error::ExecutorError;
use pipeline_core::registry::StaticRegistry;
use pipeline_core::stage::{ExecuteContext, Require, Stage, StageValue, VerifyContext};
use serde_json::json;

struct Load {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Stage for Load {
    fn name(&self) -> &str {
        "load"
    }

    fn configure(&self, require: &mut Require) {
        require.config("seed", None);
    }

    // No separate version axis for this stage: default `verify` (`Ok(None)`).

    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StageValue, Box<dyn std::error::Error + Send + Sync + 'static>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let seed = match ctx.config("seed")? {
            ConfigValue::Int(i) => *i,
            other => return Err(format!("expected int, got {other:?}").into()),
        };
        Ok(StageValue::new(&seed)?)
    }
}

/// `version` is shared with the test driver (`Chain::transform_version`) so
/// a test can bump it between runs and observe a verify-token-triggered
/// rerun with no config change at all.
struct Transform {
    calls: Arc<AtomicUsize>,
    version: Arc<Mutex<String>>,
}

#[async_trait]
impl Stage for Transform {
    fn name(&self) -> &str {
        "transform"
    }

    fn configure(&self, require: &mut Require) {
        require.stage("load");
        require.config("multiplier", None);
    }

    fn verify(&self, _ctx: &VerifyContext<'_>) -> Result<Option<String>, ExecutorError> {
        Ok(Some(self.version.lock().unwrap().clone()))
    }

    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StageValue, Box<dyn std::error::Error + Send + Sync + 'static>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let seed: i64 = ctx.stage("load")?;
        let multiplier = match ctx.config("multiplier")? {
            ConfigValue::Int(i) => *i,
            other => return Err(format!("expected int, got {other:?}").into()),
        };
        Ok(StageValue::new(&(seed * multiplier))?)
    }
}

struct Save {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Stage for Save {
    fn name(&self) -> &str {
        "save"
    }

    fn configure(&self, require: &mut Require) {
        require.stage("transform");
    }

    // No separate version axis for this stage: default `verify` (`Ok(None)`).

    async fn execute(
        &self,
        ctx: &ExecuteContext<'_>,
    ) -> Result<StageValue, Box<dyn std::error::Error + Send + Sync + 'static>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let value: i64 = ctx.stage("transform")?;
        Ok(StageValue::new(&value)?)
    }
}

async fn spawn_progress() -> u16 {
    let port = pipeline_core::progress::pick_free_port().unwrap();
    tokio::spawn(pipeline_core::progress::run_server(port));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    port
}

struct Chain {
    load_calls: Arc<AtomicUsize>,
    transform_calls: Arc<AtomicUsize>,
    save_calls: Arc<AtomicUsize>,
    transform_version: Arc<Mutex<String>>,
}

impl Chain {
    fn new() -> (Self, StaticRegistry) {
        let load_calls = Arc::new(AtomicUsize::new(0));
        let transform_calls = Arc::new(AtomicUsize::new(0));
        let save_calls = Arc::new(AtomicUsize::new(0));
        let transform_version = Arc::new(Mutex::new("v1".to_string()));

        let mut registry = StaticRegistry::new();
        registry.register(Arc::new(Load { calls: load_calls.clone() }));
        registry.register(Arc::new(Transform {
            calls: transform_calls.clone(),
            version: transform_version.clone(),
        }));
        registry.register(Arc::new(Save { calls: save_calls.clone() }));

        (Self { load_calls, transform_calls, save_calls, transform_version }, registry)
    }
}

#[tokio::test]
async fn fresh_run_executes_every_stage_once() {
    let (chain, registry) = Chain::new();
    let port = spawn_progress().await;
    let dir = tempfile::tempdir().unwrap();

    let config = json!({
        "working_directory": dir.path().join("work").to_str().unwrap(),
        "stages": ["save"],
        "seed": 2,
        "multiplier": 3,
    });

    let report = pipeline_core::run_with_progress(config, &registry, port).await.unwrap();

    assert_eq!(report.executed.len(), 3);
    assert_eq!(chain.load_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chain.transform_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chain.save_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clean_rerun_skips_every_stage() {
    let (chain, registry) = Chain::new();
    let port = spawn_progress().await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");

    let config = json!({
        "working_directory": work.to_str().unwrap(),
        "stages": ["save"],
        "seed": 2,
        "multiplier": 3,
    });

    pipeline_core::run_with_progress(config.clone(), &registry, port).await.unwrap();
    let report = pipeline_core::run_with_progress(config, &registry, port).await.unwrap();

    assert!(report.executed.is_empty());
    assert_eq!(report.skipped.len(), 3);
    assert_eq!(chain.load_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chain.transform_calls.load(Ordering::SeqCst), 1);
    assert_eq!(chain.save_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn config_change_deep_in_chain_propagates_downstream() {
    let (chain, registry) = Chain::new();
    let port = spawn_progress().await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");

    let first = json!({
        "working_directory": work.to_str().unwrap(),
        "stages": ["save"],
        "seed": 2,
        "multiplier": 3,
    });
    pipeline_core::run_with_progress(first, &registry, port).await.unwrap();

    // Changing "multiplier" (read only by `transform`) must re-execute
    // `transform` and, transitively, `save` -- but not `load`.
    let second = json!({
        "working_directory": work.to_str().unwrap(),
        "stages": ["save"],
        "seed": 2,
        "multiplier": 5,
    });
    let report = pipeline_core::run_with_progress(second, &registry, port).await.unwrap();

    assert_eq!(chain.load_calls.load(Ordering::SeqCst), 1, "load's own config did not change");
    assert_eq!(chain.transform_calls.load(Ordering::SeqCst), 2);
    assert_eq!(chain.save_calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.executed.into_iter().collect::<HashSet<_>>(), HashSet::from(["transform".to_string(), "save".to_string()]));
}

#[tokio::test]
async fn verify_token_bump_forces_rerun_without_any_config_change() {
    let (chain, registry) = Chain::new();
    let port = spawn_progress().await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");

    let config = json!({
        "working_directory": work.to_str().unwrap(),
        "stages": ["save"],
        "seed": 2,
        "multiplier": 3,
    });

    pipeline_core::run_with_progress(config.clone(), &registry, port).await.unwrap();
    assert_eq!(chain.transform_calls.load(Ordering::SeqCst), 1);

    *chain.transform_version.lock().unwrap() = "v2".to_string();
    let report = pipeline_core::run_with_progress(config, &registry, port).await.unwrap();

    assert_eq!(chain.load_calls.load(Ordering::SeqCst), 1, "load's own config and version did not change");
    assert_eq!(chain.transform_calls.load(Ordering::SeqCst), 2);
    assert_eq!(chain.save_calls.load(Ordering::SeqCst), 2, "save depends on transform's identity");
    assert_eq!(
        report.executed.into_iter().collect::<HashSet<_>>(),
        HashSet::from(["transform".to_string(), "save".to_string()])
    );
}

#[tokio::test]
async fn requested_stage_reruns_even_when_nothing_changed() {
    let (chain, registry) = Chain::new();
    let port = spawn_progress().await;
    let dir = tempfile::tempdir().unwrap();
    let work = dir.path().join("work");

    let config = json!({
        "working_directory": work.to_str().unwrap(),
        "stages": ["load"],
        "seed": 2,
        "multiplier": 3,
    });

    pipeline_core::run_with_progress(config.clone(), &registry, port).await.unwrap();
    pipeline_core::run_with_progress(config, &registry, port).await.unwrap();

    assert_eq!(chain.load_calls.load(Ordering::SeqCst), 2, "explicitly requested stage always reruns");
    assert_eq!(chain.transform_calls.load(Ordering::SeqCst), 0, "never requested or depended upon");
}

#[tokio::test]
async fn unknown_stage_in_config_is_a_registry_error() {
    let (_chain, registry) = Chain::new();
    let port = spawn_progress().await;
    let dir = tempfile::tempdir().unwrap();

    let config = json!({
        "working_directory": dir.path().join("work").to_str().unwrap(),
        "stages": ["does-not-exist"],
    });

    let err = pipeline_core::run_with_progress(config, &registry, port).await.unwrap_err();
    assert!(matches!(err, pipeline_core::error::EngineError::Registry(_)));
}

#[tokio::test]
async fn missing_declared_config_key_is_a_registry_error() {
    let (_chain, registry) = Chain::new();
    let port = spawn_progress().await;
    let dir = tempfile::tempdir().unwrap();

    // "seed" is declared by `load` with no default and is omitted here.
    let config = json!({
        "working_directory": dir.path().join("work").to_str().unwrap(),
        "stages": ["save"],
        "multiplier": 3,
    });

    let err = pipeline_core::run_with_progress(config, &registry, port).await.unwrap_err();
    assert!(matches!(err, pipeline_core::error::EngineError::Registry(_)));
}
