//! Dataset loaders.
//!
//! Parsers are lenient: malformed records are logged and skipped so one bad
//! line never aborts a load.  Loading the same file twice yields equal task
//! sequences.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::task::Task;

/// Load HumanEval (JSON-lines: `task_id`, `prompt`, `canonical_solution`,
/// `test`, `entry_point`).
pub fn load_humaneval(path: impl AsRef<Path>) -> Result<Vec<Task>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading HumanEval dataset at {}", path.display()))?;

    let mut tasks = Vec::new();
    for (line_number, line) in raw.lines().enumerate() {
        let line_number = line_number + 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!(line_number, error = %e, "skipping malformed HumanEval line");
                continue;
            }
        };
        let (Some(task_id), Some(prompt)) = (
            record.get("task_id").and_then(Value::as_str),
            record.get("prompt").and_then(Value::as_str),
        ) else {
            warn!(line_number, "skipping HumanEval line without task_id/prompt");
            continue;
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("original_task_id".to_string(), Value::from(task_id));
        metadata.insert("line_number".to_string(), Value::from(line_number));

        tasks.push(Task {
            task_id: format!("humaneval_{task_id}"),
            dataset: "humaneval".to_string(),
            prompt: prompt.to_string(),
            canonical_solution: record
                .get("canonical_solution")
                .and_then(Value::as_str)
                .map(str::to_string),
            test_code: record.get("test").and_then(Value::as_str).map(str::to_string),
            entry_point: record
                .get("entry_point")
                .and_then(Value::as_str)
                .map(str::to_string),
            metadata,
        });
    }

    info!(count = tasks.len(), path = %path.display(), "loaded HumanEval tasks");
    Ok(tasks)
}

/// Load MBPP (JSON array: `task_id`/`id`, `text`, `code`, `test_list`).
pub fn load_mbpp(path: impl AsRef<Path>) -> Result<Vec<Task>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading MBPP dataset at {}", path.display()))?;
    let records: Vec<Value> =
        serde_json::from_str(&raw).with_context(|| "MBPP dataset is not a JSON array")?;

    let mut tasks = Vec::new();
    for record in records {
        let task_id = record
            .get("task_id")
            .or_else(|| record.get("id"))
            .map(value_to_id)
            .unwrap_or_default();
        let prompt = record.get("text").and_then(Value::as_str).unwrap_or_default();
        if task_id.is_empty() || prompt.is_empty() {
            warn!("skipping MBPP record without id/text");
            continue;
        }

        let test_list: Vec<String> = record
            .get("test_list")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let test_code = if test_list.is_empty() {
            None
        } else {
            Some(test_list.join("\n"))
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("original_task_id".to_string(), Value::from(task_id.clone()));
        metadata.insert("test_count".to_string(), Value::from(test_list.len()));

        tasks.push(Task {
            task_id: format!("mbpp_{task_id}"),
            dataset: "mbpp".to_string(),
            prompt: prompt.to_string(),
            canonical_solution: record.get("code").and_then(Value::as_str).map(str::to_string),
            test_code,
            entry_point: None,
            metadata,
        });
    }

    info!(count = tasks.len(), path = %path.display(), "loaded MBPP tasks");
    Ok(tasks)
}

fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}
