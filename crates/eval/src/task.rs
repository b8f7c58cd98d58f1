//! Benchmark task and result records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gauntlet_sandbox::SandboxMetrics;

/// One benchmark entry, read-only once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub dataset: String,
    pub prompt: String,
    pub canonical_solution: Option<String>,
    pub test_code: Option<String>,
    pub entry_point: Option<String>,
    /// Opaque; carried through into results unchanged.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Outcome of one (task, attempt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub dataset: String,
    pub attempt_number: usize,
    /// A solution was produced (a candidate file existed at extraction time).
    pub success: bool,
    /// Tests ran and exited 0.  Implies `success`.
    pub passed_tests: bool,
    pub error_message: Option<String>,
    pub solution_code: Option<String>,
    pub execution_time_seconds: f64,
    pub agent_iterations: u64,
    pub commands_executed: u64,
    pub files_created: u64,
    pub files_modified: u64,
    pub tokens_generated: u64,
    pub sandbox_metrics: Option<SandboxMetrics>,
}

/// Side-by-side numbers against one shipped baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineComparison {
    pub baseline_name: String,
    pub baseline_pass_at_1: f64,
    pub baseline_pass_at_k: BTreeMap<u32, f64>,
    pub our_pass_at_1: f64,
    pub our_pass_at_k: BTreeMap<u32, f64>,
    /// ours − baseline.
    pub pass_at_1_delta: f64,
    pub pass_at_k_delta: BTreeMap<u32, f64>,
}

/// Per-dataset aggregate over all attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub dataset: String,
    pub model_name: String,
    pub timestamp: DateTime<Utc>,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    /// Number of results (not tasks) whose tests passed.
    pub passed_tests: usize,
    pub pass_at_1: f64,
    pub pass_at_k: BTreeMap<u32, f64>,
    /// ks that could not be computed directly (fewer attempts than k) and
    /// were substituted from k = attempts.
    pub substituted_ks: Vec<u32>,
    pub average_execution_time: f64,
    pub average_iterations: f64,
    pub average_commands: f64,
    pub average_tokens: f64,
    pub efficiency_score: f64,
    pub task_results: Vec<TaskResult>,
    pub baseline_comparisons: Vec<BaselineComparison>,
}

/// Cross-dataset roll-up written when one run covers several datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedReport {
    pub model_name: String,
    pub timestamp: DateTime<Utc>,
    pub datasets: Vec<EvaluationReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task_id: &str) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            dataset: "humaneval".to_string(),
            attempt_number: 1,
            success: true,
            passed_tests: true,
            error_message: None,
            solution_code: Some("def f(): pass\n".to_string()),
            execution_time_seconds: 1.25,
            agent_iterations: 2,
            commands_executed: 3,
            files_created: 1,
            files_modified: 0,
            tokens_generated: 64,
            sandbox_metrics: None,
        }
    }

    #[test]
    fn task_result_json_roundtrip() {
        let original = result("humaneval_HumanEval/0");
        let json = serde_json::to_string(&original).unwrap();
        let back: TaskResult = serde_json::from_str(&json).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn report_json_roundtrip() {
        let report = EvaluationReport {
            dataset: "humaneval".to_string(),
            model_name: "test-model".to_string(),
            timestamp: Utc::now(),
            total_tasks: 1,
            successful_tasks: 1,
            passed_tests: 1,
            pass_at_1: 1.0,
            pass_at_k: BTreeMap::from([(1, 1.0), (5, 1.0), (10, 1.0), (100, 1.0)]),
            substituted_ks: vec![5, 10, 100],
            average_execution_time: 1.25,
            average_iterations: 2.0,
            average_commands: 3.0,
            average_tokens: 64.0,
            efficiency_score: 0.99,
            task_results: vec![result("t1")],
            baseline_comparisons: vec![],
        };
        let json = serde_json::to_string_pretty(&report).unwrap();
        let back: EvaluationReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report, back);
    }
}
