//! Thin binary wiring a YAML config file and a static stage registry into
//! `pipeline_core::run`. Grounded on `eqasim/pipeline/run.py` for the
//! override grammar and on the teacher's `crates/gini/src/main.rs` for the
//! top-level "match on the run result, eprintln! and exit non-zero" idiom.

use std::env;
use std::fs;
use std::sync::Arc;

use pipeline_core::registry::StaticRegistry;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.len() >= 3 && args[1] == "--progress-server" {
        run_progress_server(&args[2]).await;
        return;
    }

    if args.len() < 2 {
        eprintln!("usage: pipeline <config.yml> [--set:key.path=value ...] [--stages +a,-b]");
        std::process::exit(2);
    }

    let config_path = &args[1];
    let text = match fs::read_to_string(config_path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("failed to read config '{config_path}': {e}");
            std::process::exit(1);
        }
    };

    let mut config: serde_json::Value = match serde_yaml::from_str(&text) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("failed to parse config '{config_path}' as YAML: {e}");
            std::process::exit(1);
        }
    };

    if let Err(message) = apply_overrides(&mut config, &args[2..]) {
        eprintln!("{message}");
        std::process::exit(1);
    }

    let mut registry = StaticRegistry::new();
    registry.register(Arc::new(logging_stage::WordCountStage));
    registry.register(Arc::new(uppercase_stage::UppercaseStage));

    match pipeline_core::run(config, &registry).await {
        Ok(report) => {
            log::info!(
                "executed {} stage(s), skipped {} up-to-date stage(s)",
                report.executed.len(),
                report.skipped.len()
            );
        }
        Err(e) => {
            eprintln!("pipeline failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_progress_server(port_arg: &str) {
    let port: u16 = match port_arg.parse() {
        Ok(port) => port,
        Err(e) => {
            eprintln!("invalid progress server port '{port_arg}': {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = pipeline_core::progress::run_server(port).await {
        eprintln!("progress server error: {e}");
        std::process::exit(1);
    }
}

/// Apply `--set:dotted.key=value` and `--stages +a,-b` CLI overrides,
/// mirroring `eqasim/pipeline/run.py::_adapt_config`. Numeric/boolean
/// values are coerced the same way the source's adapter does; any other
/// unrecognized argument is logged and ignored rather than treated as an
/// error (SPEC_FULL.md §11, Open Question 1).
fn apply_overrides(config: &mut serde_json::Value, args: &[String]) -> Result<(), String> {
    for arg in args {
        if let Some(rest) = arg.strip_prefix("--set:") {
            let (path, raw_value) =
                rest.split_once('=').ok_or_else(|| format!("malformed --set: override: {arg}"))?;
            set_nested(config, path, coerce_value(raw_value))?;
        } else if let Some(rest) = arg.strip_prefix("--stages") {
            let rest = rest.trim_start_matches('=').trim_start();
            apply_stage_overrides(config, rest)?;
        } else {
            log::warn!("ignoring unrecognized argument: {arg}");
        }
    }
    Ok(())
}

fn coerce_value(raw: &str) -> serde_json::Value {
    if let Ok(i) = raw.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return serde_json::Value::from(f);
    }
    match raw {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => serde_json::Value::String(raw.to_string()),
    }
}

fn set_nested(config: &mut serde_json::Value, path: &str, value: serde_json::Value) -> Result<(), String> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cursor = config;

    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            let object =
                cursor.as_object_mut().ok_or_else(|| format!("cannot set '{path}': '{part}' is not an object"))?;
            object.insert(part.to_string(), value);
            return Ok(());
        }

        let object =
            cursor.as_object_mut().ok_or_else(|| format!("cannot set '{path}': '{part}' is not an object"))?;
        cursor = object.entry(part.to_string()).or_insert_with(|| serde_json::Value::Object(Default::default()));
    }

    Ok(())
}

fn apply_stage_overrides(config: &mut serde_json::Value, spec: &str) -> Result<(), String> {
    let object = config.as_object_mut().ok_or_else(|| "config root is not an object".to_string())?;
    let mut stages: Vec<String> = object
        .get("stages")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    for token in spec.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }

        if let Some(name) = token.strip_prefix('+') {
            if !stages.iter().any(|s| s == name) {
                stages.push(name.to_string());
            }
        } else if let Some(name) = token.strip_prefix('-') {
            stages.retain(|s| s != name);
        } else {
            log::warn!("ignoring malformed --stages token: {token}");
        }
    }

    object.insert(
        "stages".to_string(),
        serde_json::Value::Array(stages.into_iter().map(serde_json::Value::String).collect()),
    );
    Ok(())
}
