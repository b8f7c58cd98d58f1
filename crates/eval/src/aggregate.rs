//! Reduction of per-attempt results into dataset reports.

use std::collections::BTreeMap;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

use crate::baselines::baselines_for;
use crate::task::{BaselineComparison, EvaluationReport, TaskResult};

/// ks reported for every dataset.
pub const PASS_AT_KS: [u32; 4] = [1, 5, 10, 100];

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("no results to aggregate")]
    EmptyResults,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Unbiased pass@k estimator: `1 − C(n−c, k) / C(n, k)` for `n` attempts with
/// `c` correct, computed in product form so large `n` stays stable.
///
/// When `n − c < k` a miss across k samples is impossible and the estimate
/// is 1.  Callers must ensure `k ≤ n`.
pub fn pass_at_k(n: u64, c: u64, k: u64) -> f64 {
    debug_assert!(k <= n, "pass@k needs k <= n");
    if n == 0 || k == 0 {
        return 0.0;
    }
    if n - c < k {
        return 1.0;
    }
    // C(n-c, k) / C(n, k) = prod_{i=n-c+1}^{n} (1 - k/i)
    let mut miss = 1.0_f64;
    for i in (n - c + 1)..=n {
        miss *= 1.0 - k as f64 / i as f64;
    }
    1.0 - miss
}

/// Build the per-dataset report.  Refuses to aggregate nothing.
pub fn generate_report(
    dataset: &str,
    model_name: &str,
    results: Vec<TaskResult>,
) -> Result<EvaluationReport, EvalError> {
    if results.is_empty() {
        return Err(EvalError::EmptyResults);
    }

    // Group attempts by task: (n, c) per task.
    let mut per_task: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for result in &results {
        let entry = per_task.entry(result.task_id.as_str()).or_insert((0, 0));
        entry.0 += 1;
        if result.passed_tests {
            entry.1 += 1;
        }
    }

    let total_tasks = per_task.len();
    let successful_tasks = results.iter().filter(|r| r.success).count();
    let passed_tests = results.iter().filter(|r| r.passed_tests).count();

    let mut pass_at_k_map: BTreeMap<u32, f64> = BTreeMap::new();
    let mut substituted_ks: Vec<u32> = Vec::new();
    for k in PASS_AT_KS {
        let mut sum = 0.0;
        let mut substituted = false;
        for &(n, c) in per_task.values() {
            let effective_k = if u64::from(k) > n {
                substituted = true;
                n
            } else {
                u64::from(k)
            };
            sum += pass_at_k(n, c, effective_k);
        }
        pass_at_k_map.insert(k, sum / total_tasks as f64);
        if substituted {
            substituted_ks.push(k);
        }
    }
    let pass_at_1 = pass_at_k_map[&1];

    // Execution time averages over everything; activity-like fields only over
    // results that actually recorded activity.
    let average_execution_time = mean(results.iter().map(|r| r.execution_time_seconds));
    let average_iterations = positive_mean(results.iter().map(|r| r.agent_iterations as f64));
    let average_commands = positive_mean(results.iter().map(|r| r.commands_executed as f64));
    let average_tokens = positive_mean(results.iter().map(|r| r.tokens_generated as f64));

    let efficiency_score = pass_at_1 * 0.5
        + 1.0 / (1.0 + average_execution_time / 60.0) * 0.2
        + 1.0 / (1.0 + average_iterations / 5.0) * 0.15
        + 1.0 / (1.0 + average_commands / 20.0) * 0.15;

    let baseline_comparisons = compare_with_baselines(dataset, pass_at_1, &pass_at_k_map);

    info!(
        dataset,
        total_tasks,
        passed_tests,
        pass_at_1,
        efficiency_score,
        "generated evaluation report"
    );

    Ok(EvaluationReport {
        dataset: dataset.to_string(),
        model_name: model_name.to_string(),
        timestamp: Utc::now(),
        total_tasks,
        successful_tasks,
        passed_tests,
        pass_at_1,
        pass_at_k: pass_at_k_map,
        substituted_ks,
        average_execution_time,
        average_iterations,
        average_commands,
        average_tokens,
        efficiency_score,
        task_results: results,
        baseline_comparisons,
    })
}

fn compare_with_baselines(
    dataset: &str,
    our_pass_at_1: f64,
    our_pass_at_k: &BTreeMap<u32, f64>,
) -> Vec<BaselineComparison> {
    baselines_for(dataset)
        .into_iter()
        .map(|baseline| {
            let pass_at_k_delta: BTreeMap<u32, f64> = PASS_AT_KS
                .iter()
                .map(|k| {
                    let ours = our_pass_at_k.get(k).copied().unwrap_or(our_pass_at_1);
                    let theirs = baseline.pass_at_k.get(k).copied().unwrap_or(baseline.pass_at_1);
                    (*k, ours - theirs)
                })
                .collect();
            BaselineComparison {
                baseline_name: baseline.name.to_string(),
                baseline_pass_at_1: baseline.pass_at_1,
                baseline_pass_at_k: baseline.pass_at_k,
                our_pass_at_1,
                our_pass_at_k: our_pass_at_k.clone(),
                pass_at_1_delta: our_pass_at_1 - baseline.pass_at_1,
                pass_at_k_delta,
            }
        })
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn positive_mean(values: impl Iterator<Item = f64>) -> f64 {
    mean(values.filter(|v| *v > 0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task_id: &str, attempt: usize, passed: bool) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            dataset: "humaneval".to_string(),
            attempt_number: attempt,
            success: passed,
            passed_tests: passed,
            error_message: if passed { None } else { Some("tests failed".to_string()) },
            solution_code: passed.then(|| "def f(): pass\n".to_string()),
            execution_time_seconds: 2.0,
            agent_iterations: 2,
            commands_executed: 4,
            files_created: 1,
            files_modified: 0,
            tokens_generated: 0,
            sandbox_metrics: None,
        }
    }

    #[test]
    fn estimator_matches_combination_ratio() {
        // n=5, c=2, k=3: 1 - C(3,3)/C(5,3) = 1 - 1/10
        assert!((pass_at_k(5, 2, 3) - 0.9).abs() < 1e-12);
        // n=10, c=1, k=1: c/n
        assert!((pass_at_k(10, 1, 1) - 0.1).abs() < 1e-12);
        // n=4, c=0 → 0
        assert_eq!(pass_at_k(4, 0, 2), 0.0);
        // impossible to miss k in a row
        assert_eq!(pass_at_k(5, 4, 3), 1.0);
    }

    #[test]
    fn estimator_is_monotone_in_k_and_bounded() {
        for c in 0..=10u64 {
            let mut previous = 0.0;
            for k in 1..=10u64 {
                let value = pass_at_k(10, c, k);
                assert!((0.0..=1.0).contains(&value));
                assert!(value + 1e-12 >= previous, "pass@k must not decrease in k");
                previous = value;
            }
        }
    }

    #[test]
    fn multi_attempt_report_uses_the_estimator() {
        // Task a: 4/5 pass, task b: 1/5 pass, task c: 0/5 pass.
        let mut results = Vec::new();
        for attempt in 1..=5 {
            results.push(result("a", attempt, attempt <= 4));
            results.push(result("b", attempt, attempt == 5));
            results.push(result("c", attempt, false));
        }

        let report = generate_report("humaneval", "m", results).unwrap();
        // pass@1 mean: (4/5 + 1/5 + 0) / 3 = 1/3
        assert!((report.pass_at_1 - 1.0 / 3.0).abs() < 1e-9);
        // pass@5: any task with c >= 1 scores 1 → 2/3
        assert!((report.pass_at_k[&5] - 2.0 / 3.0).abs() < 1e-9);
        // k > n substituted from k = n
        assert_eq!(report.pass_at_k[&10], report.pass_at_k[&5]);
        assert_eq!(report.pass_at_k[&100], report.pass_at_k[&5]);
        assert_eq!(report.substituted_ks, vec![10, 100]);
        assert_eq!(report.total_tasks, 3);
        assert_eq!(report.passed_tests, 5);
    }

    #[test]
    fn single_attempt_substitutes_everything_above_one() {
        let results = vec![result("a", 1, true), result("b", 1, false)];
        let report = generate_report("humaneval", "m", results).unwrap();
        assert!((report.pass_at_1 - 0.5).abs() < 1e-12);
        assert_eq!(report.pass_at_k[&5], report.pass_at_1);
        assert_eq!(report.pass_at_k[&100], report.pass_at_1);
        assert_eq!(report.substituted_ks, vec![5, 10, 100]);
    }

    #[test]
    fn empty_results_are_a_hard_error() {
        assert!(matches!(
            generate_report("humaneval", "m", vec![]),
            Err(EvalError::EmptyResults)
        ));
    }

    #[test]
    fn efficiency_score_stays_in_unit_interval() {
        // Perfect and instant: approaches 1.
        let fast = vec![TaskResult {
            execution_time_seconds: 0.0,
            agent_iterations: 0,
            commands_executed: 0,
            ..result("a", 1, true)
        }];
        let report = generate_report("humaneval", "m", fast).unwrap();
        assert!(report.efficiency_score <= 1.0 + 1e-12);
        assert!(report.efficiency_score >= 0.0);

        // Slow failure: still non-negative.
        let slow = vec![TaskResult {
            execution_time_seconds: 100_000.0,
            agent_iterations: 500,
            commands_executed: 900,
            ..result("a", 1, false)
        }];
        let report = generate_report("humaneval", "m", slow).unwrap();
        assert!(report.efficiency_score >= 0.0);
        assert!(report.efficiency_score <= 1.0);
    }

    #[test]
    fn activity_means_skip_zero_results() {
        let mut idle = result("a", 1, false);
        idle.agent_iterations = 0;
        idle.commands_executed = 0;
        let mut busy = result("b", 1, true);
        busy.agent_iterations = 4;
        busy.commands_executed = 8;

        let report = generate_report("humaneval", "m", vec![idle, busy]).unwrap();
        assert_eq!(report.average_iterations, 4.0);
        assert_eq!(report.average_commands, 8.0);
        // Execution time averages over all results.
        assert_eq!(report.average_execution_time, 2.0);
    }

    #[test]
    fn baseline_comparisons_cover_all_shipped_baselines() {
        let report =
            generate_report("humaneval", "m", vec![result("a", 1, true)]).unwrap();
        assert_eq!(report.baseline_comparisons.len(), 4);
        let gpt4 = report
            .baseline_comparisons
            .iter()
            .find(|c| c.baseline_name == "GPT-4")
            .unwrap();
        assert!((gpt4.pass_at_1_delta - (1.0 - 0.674)).abs() < 1e-9);
        assert_eq!(gpt4.pass_at_k_delta.len(), 4);
    }
}
