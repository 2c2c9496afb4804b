//! Staleness Analyzer & Executor.
//!
//! Walks the scheduled stages in order, decides for each one whether its
//! cached result is still valid, and executes it if not. Grounded on
//! `eqasim/pipeline/pipeline.py::run`'s staleness/execution section: the
//! five checks below (no sidecar, no cached result, version token change,
//! config change, upstream identity change) are exactly the conditions
//! computed there as `stale_stages`, and `expected_uuids`/`current_uuids`
//! is the identity-propagation mechanism that makes staleness transitive
//! without re-diffing every ancestor on every run. The sequential
//! `for stage in execution_order`, abort-on-error loop follows
//! `stage_manager/pipeline.rs::execute`.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::config::FlatConfig;
use crate::error::{ExecutorError, Result};
use crate::registry::Discovery;
use crate::sidecar::Sidecar;
use crate::stage::{ConfigContext, ExecuteContext, StageValue};
use crate::workspace::Workspace;

pub struct ExecutionReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub uuids: HashMap<String, Uuid>,
}

/// Execute `order` (already topologically sorted) against `discovery` and
/// `resolved_config`, persisting sidecars/results to `workspace`. Stages
/// named in `requested` are always re-executed regardless of staleness --
/// an explicit ask to run a stage overrides the cache, matching the
/// source's treatment of the top-level `stages` list as a request to
/// (re)produce those specific outputs.
pub async fn run_stages(
    order: &[String],
    discovery: &Discovery,
    requested: &HashSet<String>,
    resolved_config: &FlatConfig,
    workspace: &Workspace,
    progress_port: u16,
) -> Result<ExecutionReport> {
    let mut results: HashMap<String, StageValue> = HashMap::new();
    let mut current_uuids: HashMap<String, Uuid> = HashMap::new();
    let mut executed = Vec::new();
    let mut skipped = Vec::new();

    for name in order {
        let stage = discovery
            .stages
            .get(name)
            .expect("topological order must only contain discovered stages");
        let declared_config = discovery.declared_config.get(name).cloned().unwrap_or_default();
        let declared_stages = discovery.dependencies.get(name).cloned().unwrap_or_default();

        let mut own_config = FlatConfig::new();
        for key in &declared_config {
            if let Some(value) = resolved_config.get(key) {
                own_config.insert(key.clone(), value.clone());
            }
        }

        let verify_ctx = ConfigContext { stage: name, declared: &declared_config, config: resolved_config };
        let token = stage.verify(&verify_ctx)?;

        let expected_uuids: HashMap<String, Uuid> = declared_stages
            .iter()
            .filter_map(|dep| current_uuids.get(dep).map(|uuid| (dep.clone(), *uuid)))
            .collect();

        let sidecar = workspace.read_sidecar(name).await?;
        let cached_result = workspace.read_result(name).await?;

        let stale = requested.contains(name)
            || sidecar.is_none()
            || cached_result.is_none()
            || !workspace.cache_dir(name).is_dir()
            || sidecar.as_ref().is_some_and(|s| s.verification_token != token)
            || sidecar.as_ref().is_some_and(|s| s.config != own_config)
            || sidecar.as_ref().is_some_and(|s| s.expected_uuids != expected_uuids);

        if !stale {
            let sidecar = sidecar.expect("checked above");
            current_uuids.insert(name.clone(), sidecar.uuid);
            results.insert(name.clone(), cached_result.expect("checked above"));
            skipped.push(name.clone());
            log::info!("stage '{name}' is up to date, skipping");
            continue;
        }

        log::info!("executing stage '{name}'");
        workspace.ensure_cache_dir(name).await?;

        let exec_ctx = ExecuteContext {
            stage: name,
            declared_config: &declared_config,
            declared_stages: &declared_stages,
            config: resolved_config,
            results: &results,
            workspace_dir: workspace.root(),
            progress_port,
        };

        let value = stage
            .execute(&exec_ctx)
            .await
            .map_err(|source| ExecutorError::StageFailure { stage: name.clone(), source })?;

        let new_sidecar = Sidecar::new(token, own_config, expected_uuids);
        workspace.write_sidecar(name, &new_sidecar).await?;
        workspace.write_result(name, &value).await?;

        current_uuids.insert(name.clone(), new_sidecar.uuid);
        results.insert(name.clone(), value);
        executed.push(name.clone());
    }

    Ok(ExecutionReport { executed, skipped, uuids: current_uuids })
}
