//! Config Flattener.
//!
//! Flattens a nested configuration tree into a single-level mapping with
//! dotted keys, exactly as `eqasim/pipeline/pipeline.py::_flatten_config`
//! does: a breadth-first walk of the tree carrying a path prefix, rejecting
//! keys that contain `.` and leaves that are neither scalars nor maps.

use std::collections::HashMap;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ConfigError;

/// A legal configuration leaf. Nothing else is a legal leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl ConfigValue {
    fn from_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::String(s) => Some(ConfigValue::String(s.clone())),
            JsonValue::Bool(b) => Some(ConfigValue::Bool(*b)),
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(ConfigValue::Int(i))
                } else {
                    n.as_f64().map(ConfigValue::Float)
                }
            }
            _ => None,
        }
    }
}

impl From<ConfigValue> for JsonValue {
    fn from(value: ConfigValue) -> Self {
        match value {
            ConfigValue::String(s) => JsonValue::String(s),
            ConfigValue::Int(i) => JsonValue::Number(i.into()),
            ConfigValue::Float(f) => serde_json::Number::from_f64(f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ConfigValue::Bool(b) => JsonValue::Bool(b),
        }
    }
}

/// A nested configuration tree: internal nodes are maps, leaves are
/// [`ConfigValue`]s. Represented as raw JSON since the engine is agnostic to
/// how its caller parsed the configuration (YAML/JSON/TOML are all
/// equivalent once loaded into a `serde_json::Value`).
pub type NestedConfig = JsonValue;

/// Flat configuration: an unordered mapping from dotted-key strings to
/// configuration values.
pub type FlatConfig = HashMap<String, ConfigValue>;

/// Breadth-first flatten of a nested configuration map.
///
/// `working_directory` and `stages` must already have been stripped by the
/// caller (see [`crate::run`]) -- this function only ever sees the remainder
/// of the user configuration.
pub fn flatten_config(config: &JsonValue) -> Result<FlatConfig, ConfigError> {
    let mut flat = FlatConfig::new();
    let mut queue: VecDeque<(Vec<String>, &JsonValue)> = VecDeque::new();
    queue.push_back((Vec::new(), config));

    while let Some((path, item)) = queue.pop_front() {
        let object = match item.as_object() {
            Some(object) => object,
            None => continue,
        };

        for (key, value) in object {
            if key.contains('.') {
                let mut full_key = path.clone();
                full_key.push(key.clone());
                return Err(ConfigError::InvalidConfigKey {
                    key: full_key.join("."),
                });
            }

            let mut full_path = path.clone();
            full_path.push(key.clone());
            let full_key = full_path.join(".");

            if let Some(scalar) = ConfigValue::from_json(value) {
                flat.insert(full_key, scalar);
            } else if value.is_object() {
                queue.push_back((full_path, value));
            } else {
                return Err(ConfigError::InvalidConfigValueType { key: full_key });
            }
        }
    }

    Ok(flat)
}

/// The two pre-engine keys stripped from the user config before flattening.
pub struct TopLevelConfig {
    pub working_directory: String,
    pub requested_stages: Vec<String>,
    pub remainder: JsonValue,
}

/// Extract `working_directory` and `stages` from the raw top-level config,
/// leaving the rest to be flattened.
pub fn extract_top_level(mut config: JsonValue) -> Result<TopLevelConfig, ConfigError> {
    let object = config
        .as_object_mut()
        .ok_or(ConfigError::MissingWorkspace)?;

    let working_directory = object
        .remove("working_directory")
        .ok_or(ConfigError::MissingWorkspace)?
        .as_str()
        .ok_or(ConfigError::MissingWorkspace)?
        .to_string();

    let stages_value = object.remove("stages").ok_or(ConfigError::MissingStagesList)?;
    let stages_array = stages_value
        .as_array()
        .ok_or(ConfigError::MissingStagesList)?;

    let requested_stages = stages_array
        .iter()
        .map(|v| v.as_str().map(|s| s.to_string()))
        .collect::<Option<Vec<String>>>()
        .ok_or(ConfigError::MissingStagesList)?;

    Ok(TopLevelConfig {
        working_directory,
        requested_stages,
        remainder: config,
    })
}
