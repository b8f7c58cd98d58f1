//! Output-tree layout and atomic JSON artifact writes.
//!
//! Layout per run:
//! ```text
//! <out>/
//!   <dataset>/
//!     <task_id>/attempt-<k>/
//!       workspace/
//!       snapshots/final/
//!       sandbox_metadata.json
//!       result.json
//!     evaluation_report.json
//!   combined_report.json        (when >1 dataset)
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::task::{CombinedReport, EvaluationReport};

/// Make a task id safe as a single path component (`HumanEval/0` → `HumanEval_0`).
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            other => other,
        })
        .collect()
}

pub fn dataset_dir(out_dir: &Path, dataset: &str) -> PathBuf {
    out_dir.join(sanitize_component(dataset))
}

pub fn attempt_dir(out_dir: &Path, dataset: &str, task_id: &str, attempt: usize) -> PathBuf {
    dataset_dir(out_dir, dataset)
        .join(sanitize_component(task_id))
        .join(format!("attempt-{attempt}"))
}

pub fn report_path(out_dir: &Path, dataset: &str) -> PathBuf {
    dataset_dir(out_dir, dataset).join("evaluation_report.json")
}

pub fn combined_report_path(out_dir: &Path) -> PathBuf {
    out_dir.join("combined_report.json")
}

/// Write JSON via a temp file in the same directory, then rename into place,
/// so readers never observe a partial document.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::other(e.to_string()))?;

    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, rendered)?;
    std::fs::rename(&tmp, path)
}

pub fn read_report(path: impl AsRef<Path>) -> Result<EvaluationReport> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading report at {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing report at {}", path.display()))
}

/// Roll several dataset reports into `combined_report.json`.
pub fn write_combined_report(
    out_dir: &Path,
    model_name: &str,
    reports: &[EvaluationReport],
) -> std::io::Result<PathBuf> {
    let combined = CombinedReport {
        model_name: model_name.to_string(),
        timestamp: Utc::now(),
        datasets: reports.to_vec(),
    };
    let path = combined_report_path(out_dir);
    write_json_atomic(&path, &combined)?;
    Ok(path)
}
