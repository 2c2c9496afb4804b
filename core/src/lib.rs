//! `pipeline_core`: a dependency-aware staged computation engine.
//!
//! A caller hands [`run`] a nested configuration document (must contain
//! `working_directory` and `stages`) plus a [`Registry`] of available
//! stages; the engine discovers every stage transitively reachable from
//! the requested ones, topologically orders them, skips whatever is still
//! valid in the cache, and executes the rest.

pub mod config;
pub mod error;
pub mod executor;
pub mod progress;
pub mod registry;
pub mod scheduler;
pub mod sidecar;
pub mod stage;
pub mod workspace;

use std::collections::HashSet;

use config::{extract_top_level, flatten_config, NestedConfig};
use error::Result;
use executor::{run_stages, ExecutionReport};
use progress::ProgressService;
use registry::{discover, resolve_config, Registry};
use scheduler::topological_order;
use workspace::Workspace;

/// Run the pipeline described by `config` against `registry`, spawning a
/// dedicated Progress Service process for the duration of the run.
pub async fn run(config: NestedConfig, registry: &dyn Registry) -> Result<ExecutionReport> {
    let progress = ProgressService::spawn()?;
    let result = run_with_progress(config, registry, progress.port()).await;
    progress.close_and_join()?;
    result
}

/// Run the pipeline against an already-running Progress Service at
/// `progress_port`. Exposed separately so tests can point at an in-process
/// server (`tokio::spawn(pipeline_core::progress::run_server(port))`)
/// instead of paying for a subprocess per test.
pub async fn run_with_progress(
    config: NestedConfig,
    registry: &dyn Registry,
    progress_port: u16,
) -> Result<ExecutionReport> {
    let top = extract_top_level(config)?;
    let flat_remainder = flatten_config(&top.remainder)?;

    let discovery = discover(registry, &top.requested_stages)?;
    let resolved_config = resolve_config(&discovery, &flat_remainder)?;

    let all_stages: Vec<String> = discovery.stages.keys().cloned().collect();
    let order = topological_order(&all_stages, &discovery.dependencies)?;

    let workspace = Workspace::open(&top.working_directory).await?;
    let requested: HashSet<String> = top.requested_stages.into_iter().collect();

    run_stages(&order, &discovery, &requested, &resolved_config, &workspace, progress_port).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticRegistry;
    use crate::stage::{ExecuteContext, Require, Stage, StageValue};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct Greeter;

    #[async_trait]
    impl Stage for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        fn configure(&self, require: &mut Require) {
            require.config("name", Some(crate::config::ConfigValue::String("world".into())));
        }

        async fn execute(
            &self,
            ctx: &ExecuteContext<'_>,
        ) -> std::result::Result<StageValue, Box<dyn std::error::Error + Send + Sync + 'static>> {
            let name: String = match ctx.config("name")? {
                crate::config::ConfigValue::String(s) => s.clone(),
                _ => "?".to_string(),
            };
            Ok(StageValue::new(&format!("hello, {name}"))?)
        }
    }

    #[tokio::test]
    async fn end_to_end_run_executes_requested_stage() {
        let dir = tempfile::tempdir().unwrap();
        let port = crate::progress::pick_free_port().unwrap();
        tokio::spawn(crate::progress::run_server(port));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut registry = StaticRegistry::new();
        registry.register(Arc::new(Greeter));

        let config = json!({
            "working_directory": dir.path().join("work").to_str().unwrap(),
            "stages": ["greeter"],
            "name": "rust",
        });

        let report = run_with_progress(config, &registry, port).await.unwrap();
        assert_eq!(report.executed, vec!["greeter".to_string()]);
    }
}
