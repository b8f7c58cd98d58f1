//! Top-level evaluation orchestrator.
//!
//! For each (task, attempt) work unit: provision and start a sandbox, run a
//! coding agent against it under a wall-clock budget, run the dataset's test
//! harness on the extracted solution, and fold everything into one
//! [`TaskResult`].  Work units run on a bounded worker pool; the sandbox is
//! cleaned up on every exit path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use gauntlet_agent::{extract_solution, CodingAgent};
use gauntlet_config::AppConfig;
use gauntlet_llm::{ChatEndpoint, GenerationParams};
use gauntlet_sandbox::Sandbox;

use crate::aggregate::{generate_report, EvalError};
use crate::artifacts::{attempt_dir, dataset_dir, report_path, write_json_atomic};
use crate::task::{EvaluationReport, Task, TaskResult};

pub struct Evaluator {
    endpoint: Arc<dyn ChatEndpoint>,
    config: Arc<AppConfig>,
}

impl Evaluator {
    pub fn new(endpoint: Arc<dyn ChatEndpoint>, config: AppConfig) -> Self {
        Self {
            endpoint,
            config: Arc::new(config),
        }
    }

    /// Evaluate every task in a dataset and write the per-dataset report.
    ///
    /// `cancel` is checked before each work unit starts: once set, no new
    /// attempts begin, in-flight attempts finish (bounded by their own
    /// timeout), and their sandboxes are still released.
    pub async fn evaluate_dataset(
        &self,
        dataset: &str,
        mut tasks: Vec<Task>,
        cancel: Arc<AtomicBool>,
    ) -> Result<EvaluationReport, EvalError> {
        if let Some(limit) = self.config.evaluation.max_tasks {
            tasks.truncate(limit);
        }

        let out_dir = PathBuf::from(&self.config.evaluation.output_dir);
        std::fs::create_dir_all(dataset_dir(&out_dir, dataset))?;

        let attempts_per_task = self.config.evaluation.attempts_per_task.max(1);
        let workers = self.config.evaluation.workers.max(1);
        info!(
            dataset,
            tasks = tasks.len(),
            attempts_per_task,
            workers,
            "starting evaluation"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskResult>();

        let mut dispatched = 0usize;
        for task in &tasks {
            for attempt_number in 1..=attempts_per_task {
                dispatched += 1;
                let endpoint = Arc::clone(&self.endpoint);
                let config = Arc::clone(&self.config);
                let task = task.clone();
                let out_dir = out_dir.clone();
                let semaphore = Arc::clone(&semaphore);
                let cancel = Arc::clone(&cancel);
                let tx = tx.clone();

                tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    if cancel.load(Ordering::Relaxed) {
                        debug!(task_id = %task.task_id, attempt_number, "cancelled before start");
                        return;
                    }
                    let result =
                        evaluate_attempt(endpoint, config, task, attempt_number, out_dir).await;
                    let _ = tx.send(result);
                });
            }
        }
        drop(tx);

        let mut results = Vec::with_capacity(dispatched);
        while let Some(result) = rx.recv().await {
            results.push(result);
        }
        if results.len() < dispatched {
            warn!(
                dataset,
                completed = results.len(),
                dispatched,
                "evaluation ended early (cancelled)"
            );
        }
        results.sort_by(|a, b| {
            a.task_id
                .cmp(&b.task_id)
                .then(a.attempt_number.cmp(&b.attempt_number))
        });

        let report = generate_report(dataset, &self.config.llm.model, results)?;
        let path = report_path(&out_dir, dataset);
        if let Err(e) = write_json_atomic(&path, &report) {
            warn!(path = %path.display(), error = %e, "failed to write evaluation report");
        }
        Ok(report)
    }
}

#[derive(Default)]
struct AttemptCore {
    solution_code: Option<String>,
    passed_tests: bool,
    error_message: Option<String>,
    iterations: u64,
    tokens_generated: u64,
    files_created: u64,
    files_modified: u64,
}

/// One (task, attempt): returns exactly one result, cleans up unconditionally.
async fn evaluate_attempt(
    endpoint: Arc<dyn ChatEndpoint>,
    config: Arc<AppConfig>,
    task: Task,
    attempt_number: usize,
    out_dir: PathBuf,
) -> TaskResult {
    let started = Instant::now();
    let attempt_dir = attempt_dir(&out_dir, &task.dataset, &task.task_id, attempt_number);
    info!(task_id = %task.task_id, attempt_number, "evaluating attempt");

    let mut sandbox = match Sandbox::provision(&task.task_id, &attempt_dir, &config.sandbox) {
        Ok(sandbox) => sandbox,
        Err(e) => {
            return finish_result(
                &task,
                attempt_number,
                started,
                AttemptCore {
                    error_message: Some(format!("sandbox provision failed: {e}")),
                    ..AttemptCore::default()
                },
                None,
                &attempt_dir,
            );
        }
    };

    let core = run_attempt(&mut sandbox, &endpoint, &config, &task, attempt_number).await;

    sandbox.metrics.success = core.passed_tests;
    sandbox.metrics.error_message = core.error_message.clone();
    sandbox.metrics.files_created = core.files_created;
    sandbox.metrics.files_modified = core.files_modified;
    sandbox.cleanup(config.evaluation.keep_snapshots).await;

    let metrics = sandbox.metrics.clone();
    finish_result(&task, attempt_number, started, core, Some(metrics), &attempt_dir)
}

fn finish_result(
    task: &Task,
    attempt_number: usize,
    started: Instant,
    core: AttemptCore,
    metrics: Option<gauntlet_sandbox::SandboxMetrics>,
    attempt_dir: &Path,
) -> TaskResult {
    let commands_executed = metrics.as_ref().map(|m| m.commands_executed).unwrap_or(0);
    let result = TaskResult {
        task_id: task.task_id.clone(),
        dataset: task.dataset.clone(),
        attempt_number,
        success: core.solution_code.is_some(),
        passed_tests: core.passed_tests,
        error_message: core.error_message,
        solution_code: core.solution_code,
        execution_time_seconds: started.elapsed().as_secs_f64(),
        agent_iterations: core.iterations,
        commands_executed,
        files_created: core.files_created,
        files_modified: core.files_modified,
        tokens_generated: core.tokens_generated,
        sandbox_metrics: metrics,
    };
    if let Err(e) = write_json_atomic(&attempt_dir.join("result.json"), &result) {
        warn!(task_id = %result.task_id, error = %e, "failed to write attempt result");
    }
    result
}

async fn run_attempt(
    sandbox: &mut Sandbox,
    endpoint: &Arc<dyn ChatEndpoint>,
    config: &AppConfig,
    task: &Task,
    attempt_number: usize,
) -> AttemptCore {
    let mut core = AttemptCore::default();

    if let Err(e) = sandbox.start().await {
        core.error_message = Some(format!("sandbox start failed: {e}"));
        return core;
    }

    let initial_files = snapshot_mtimes(sandbox.workspace_dir());

    let mut agent = CodingAgent::new(
        Arc::clone(endpoint),
        generation_params(config, attempt_number),
        config.llm.max_context_tokens,
        config.evaluation.max_iterations,
        Duration::from_secs(config.sandbox.command_timeout_secs),
    );
    let prompt = build_task_prompt(task);
    let budget = Duration::from_secs(config.evaluation.timeout_seconds);

    // The wall clock bounds the whole attempt regardless of iteration count.
    match tokio::time::timeout(budget, agent.run(sandbox, &prompt)).await {
        Ok(Ok(outcome)) => {
            core.iterations = outcome.iterations;
            core.tokens_generated = outcome.tokens_generated;
        }
        Ok(Err(e)) => {
            core.error_message = Some(format!("llm transport failure: {e}"));
        }
        Err(_) => {
            core.error_message = Some(format!("attempt timed out after {}s", budget.as_secs()));
        }
    }

    let extension = language_extension(&task.dataset);
    core.solution_code = extract_solution(sandbox.workspace_dir(), extension);

    // Tests only run for attempts that got this far cleanly.
    if core.error_message.is_none() {
        match (&core.solution_code, &task.test_code) {
            (Some(_), Some(test_code)) => {
                let solution = core.solution_code.clone().unwrap_or_default();
                let (passed, error) = run_tests(
                    sandbox,
                    &solution,
                    test_code,
                    task.entry_point.as_deref(),
                    extension,
                    Duration::from_secs(config.sandbox.command_timeout_secs),
                )
                .await;
                core.passed_tests = passed;
                core.error_message = error;
            }
            (Some(_), None) => {
                core.error_message = Some("no test code available; tests not run".to_string());
            }
            (None, _) => {
                core.error_message = Some("no solution code generated".to_string());
            }
        }
    }

    let final_files = snapshot_mtimes(sandbox.workspace_dir());
    for (path, modified) in &final_files {
        match initial_files.get(path) {
            None => core.files_created += 1,
            Some(initial) if modified > initial => core.files_modified += 1,
            Some(_) => {}
        }
    }

    core
}

/// Write `solution.<ext>` and `test_solution.<ext>` into the workspace and
/// run the harness.  Pass iff exit code 0; otherwise stderr (stdout as
/// fallback) becomes the error.
async fn run_tests(
    sandbox: &mut Sandbox,
    solution: &str,
    test_code: &str,
    entry_point: Option<&str>,
    extension: &str,
    timeout: Duration,
) -> (bool, Option<String>) {
    let workspace = sandbox.workspace_dir().to_path_buf();
    if let Err(e) = std::fs::write(workspace.join(format!("solution.{extension}")), solution) {
        return (false, Some(format!("failed to write solution file: {e}")));
    }
    let harness = build_test_harness(test_code, entry_point);
    if let Err(e) = std::fs::write(workspace.join(format!("test_solution.{extension}")), harness) {
        return (false, Some(format!("failed to write test harness: {e}")));
    }

    let command = format!("python3 test_solution.{extension}");
    match sandbox.execute_command(&command, None, timeout).await {
        Ok(output) if output.exit_code == 0 => (true, None),
        Ok(output) => {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            let message = if detail.is_empty() {
                format!("tests failed with exit code {}", output.exit_code)
            } else {
                detail
            };
            (false, Some(message))
        }
        Err(e) => (false, Some(format!("test execution failed: {e}"))),
    }
}

/// Harness: import the solution, run the dataset's test body, call a
/// HumanEval-style `check(entry_point)` when one is defined, exit 0 only on
/// full success.
fn build_test_harness(test_code: &str, entry_point: Option<&str>) -> String {
    let check_call = match entry_point {
        Some(entry_point) => format!(
            "        if \"check\" in globals() and callable(globals().get(\"check\")):\n            check({entry_point})\n"
        ),
        None => String::new(),
    };
    format!(
        "import sys\nimport traceback\n\nfrom solution import *\n\n{test_code}\n\nif __name__ == \"__main__\":\n    try:\n{check_call}        print(\"All tests passed\")\n    except Exception:\n        traceback.print_exc()\n        sys.exit(1)\n    sys.exit(0)\n"
    )
}

fn build_task_prompt(task: &Task) -> String {
    let mut parts = vec![format!("Task: {}", task.prompt)];
    if let Some(ref entry_point) = task.entry_point {
        parts.push(format!("\nFunction signature: {entry_point}"));
    }
    if let Some(ref test_code) = task.test_code {
        parts.push(format!("\nTest code:\n```python\n{test_code}\n```"));
    }
    parts.push(
        "\nPlease implement a solution. Write your code to a Python file in the workspace."
            .to_string(),
    );
    parts.join("\n")
}

fn generation_params(config: &AppConfig, attempt_number: usize) -> GenerationParams {
    GenerationParams {
        temperature: config.llm.temperature,
        max_tokens: config.llm.max_tokens,
        top_p: config.llm.top_p,
        top_k: config.llm.top_k,
        repetition_penalty: config.llm.repetition_penalty,
        // Seed derived from the attempt number.
        seed: Some(attempt_number as u64),
    }
}

fn language_extension(_dataset: &str) -> &'static str {
    // HumanEval and MBPP are both Python suites.
    "py"
}

fn snapshot_mtimes(workspace: &Path) -> BTreeMap<PathBuf, SystemTime> {
    let mut files = BTreeMap::new();
    for entry in walkdir::WalkDir::new(workspace)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) {
            files.insert(entry.path().to_path_buf(), modified);
        }
    }
    files
}

// ── Tests ────────────────────────────────────────────────────────────────────
