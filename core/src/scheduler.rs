//! DAG Scheduler.
//!
//! Orders discovered stages so that every stage is scheduled after all of
//! its upstream dependencies. Grounded on
//! `eqasim/pipeline/pipeline.py::_flatten_dag`: repeatedly pull out stages
//! whose dependencies are already in the order, and detect a cycle by
//! noticing that a full pass made no progress -- the exact technique used
//! there (comparing the ordered-count before and after each pass). The
//! explicit `Result`/dedicated error type idiom follows
//! `stage_manager/pipeline.rs`'s `get_execution_order`.

use std::collections::{HashMap, HashSet};

use crate::error::SchedulerError;

/// Topologically order `stages` with respect to `dependencies` (stage name
/// -> set of upstream stage names it depends on). Ties are broken by
/// insertion order within `stages` for a deterministic, reproducible
/// ordering.
pub fn topological_order(
    stages: &[String],
    dependencies: &HashMap<String, HashSet<String>>,
) -> Result<Vec<String>, SchedulerError> {
    let mut ordered: Vec<String> = Vec::with_capacity(stages.len());
    let mut placed: HashSet<String> = HashSet::new();
    let mut remaining: Vec<String> = stages.to_vec();

    while !remaining.is_empty() {
        let before = ordered.len();

        remaining.retain(|name| {
            let deps = dependencies.get(name).cloned().unwrap_or_default();
            if deps.iter().all(|dep| placed.contains(dep)) {
                ordered.push(name.clone());
                placed.insert(name.clone());
                false
            } else {
                true
            }
        });

        if ordered.len() == before {
            return Err(SchedulerError::CircularDependency { remaining });
        }
    }

    Ok(ordered)
}
