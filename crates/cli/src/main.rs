use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gauntlet_config::AppConfig;
use gauntlet_eval::{
    load_humaneval, load_mbpp, read_report, write_combined_report, EvaluationReport, Evaluator,
    Task,
};
use gauntlet_llm::HttpLlmClient;
use gauntlet_sandbox::SandboxMetadata;

#[derive(Debug, Parser)]
#[command(
    name = "gauntlet",
    version,
    about = "Sandboxed coding-benchmark evaluation harness"
)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "gauntlet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Evaluate one or more datasets against the configured model.
    Run {
        /// Dataset to evaluate as `kind=path` (kind: humaneval, mbpp).  Repeatable.
        #[arg(long = "dataset", value_name = "KIND=PATH", required = true)]
        datasets: Vec<String>,
        /// Output directory for results, reports, and sandbox artifacts.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Attempts per task (pass@k needs several).
        #[arg(long)]
        attempts: Option<usize>,
        /// Worker pool size (bounded; containers are a shared resource).
        #[arg(long)]
        workers: Option<usize>,
        /// Evaluate only the first N tasks of each dataset.
        #[arg(long)]
        max_tasks: Option<usize>,
        /// Override the configured model name.
        #[arg(long)]
        model: Option<String>,
    },
    /// Print the summary of a saved evaluation report.
    Report {
        /// Path to an `evaluation_report.json`.
        path: PathBuf,
    },
    /// Show the sandbox command log of a finished attempt.
    Review {
        /// An `attempt-<k>` directory containing `sandbox_metadata.json`.
        attempt_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            datasets,
            out,
            attempts,
            workers,
            max_tasks,
            model,
        } => run(config, datasets, out, attempts, workers, max_tasks, model).await,
        Commands::Report { path } => {
            let report = read_report(&path)?;
            print_summary(&report);
            Ok(())
        }
        Commands::Review { attempt_dir } => review(&attempt_dir),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    mut config: AppConfig,
    dataset_specs: Vec<String>,
    out: Option<PathBuf>,
    attempts: Option<usize>,
    workers: Option<usize>,
    max_tasks: Option<usize>,
    model: Option<String>,
) -> Result<()> {
    if let Some(out) = out {
        config.evaluation.output_dir = out.display().to_string();
    }
    if let Some(attempts) = attempts {
        config.evaluation.attempts_per_task = attempts;
    }
    if let Some(workers) = workers {
        config.evaluation.workers = workers;
    }
    if let Some(max_tasks) = max_tasks {
        config.evaluation.max_tasks = Some(max_tasks);
    }
    if let Some(model) = model {
        config.llm.model = model;
    }

    let loaded: Vec<(String, Vec<Task>)> = dataset_specs
        .iter()
        .map(|spec| load_dataset(spec))
        .collect::<Result<_>>()?;

    let mut client = HttpLlmClient::new(&config.llm.base_url, &config.llm.model);
    if let Ok(key) = std::env::var("GAUNTLET_API_KEY") {
        if !key.is_empty() {
            client = client.with_api_key(key);
        }
    }
    let model_name = config.llm.model.clone();
    let out_dir = PathBuf::from(&config.evaluation.output_dir);
    let evaluator = Evaluator::new(Arc::new(client), config);

    // A first Ctrl-C stops dispatching new attempts; in-flight attempts finish
    // within their own timeouts and release their sandboxes.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received: finishing in-flight attempts, dispatching no more");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let mut reports: Vec<EvaluationReport> = Vec::new();
    for (dataset, tasks) in loaded {
        info!(dataset, tasks = tasks.len(), "evaluating dataset");
        let report = evaluator
            .evaluate_dataset(&dataset, tasks, Arc::clone(&cancel))
            .await
            .with_context(|| format!("evaluating dataset '{dataset}'"))?;
        print_summary(&report);
        reports.push(report);
    }

    if reports.len() > 1 {
        let path = write_combined_report(&out_dir, &model_name, &reports)?;
        println!("combined report: {}", path.display());
    }

    Ok(())
}

fn load_dataset(spec: &str) -> Result<(String, Vec<Task>)> {
    let Some((kind, path)) = spec.split_once('=') else {
        bail!("dataset spec '{spec}' must be KIND=PATH (e.g. humaneval=data/HumanEval.jsonl)");
    };
    let tasks = match kind {
        "humaneval" => load_humaneval(path)?,
        "mbpp" => load_mbpp(path)?,
        other => bail!("unknown dataset kind '{other}' (expected humaneval or mbpp)"),
    };
    Ok((kind.to_string(), tasks))
}

fn print_summary(report: &EvaluationReport) {
    println!();
    println!("── {} ({})", report.dataset, report.model_name);
    println!(
        "   tasks: {}   tests passed: {}   produced solutions: {}",
        report.total_tasks, report.passed_tests, report.successful_tasks
    );
    for (k, value) in &report.pass_at_k {
        let marker = if report.substituted_ks.contains(k) {
            " (substituted)"
        } else {
            ""
        };
        println!("   pass@{k}: {value:.4}{marker}");
    }
    println!(
        "   avg time: {:.1}s   avg iterations: {:.1}   avg commands: {:.1}",
        report.average_execution_time, report.average_iterations, report.average_commands
    );
    println!("   efficiency score: {:.4}", report.efficiency_score);
    for comparison in &report.baseline_comparisons {
        println!(
            "   vs {:<16} pass@1 {:+.3}",
            comparison.baseline_name, comparison.pass_at_1_delta
        );
    }
}

fn review(attempt_dir: &Path) -> Result<()> {
    let path = attempt_dir.join("sandbox_metadata.json");
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("no sandbox metadata at {}", path.display()))?;
    let metadata: SandboxMetadata = serde_json::from_str(&raw)?;

    println!("task: {}", metadata.task_id);
    println!("container: {}", metadata.container_name);
    println!("workspace: {}", metadata.workspace_dir.display());
    println!(
        "commands: {}   files created: {}   files modified: {}   duration: {:.1}s",
        metadata.metrics.commands_executed,
        metadata.metrics.files_created,
        metadata.metrics.files_modified,
        metadata.metrics.duration_seconds(),
    );
    for (index, record) in metadata.command_log.iter().enumerate() {
        println!();
        println!(
            "[{index}] {} (exit {}, {:.2}s, cwd {})",
            record.command, record.exit_code, record.duration_seconds, record.working_directory
        );
        if !record.stdout.trim().is_empty() {
            println!("  stdout: {}", first_lines(&record.stdout, 5));
        }
        if !record.stderr.trim().is_empty() {
            println!("  stderr: {}", first_lines(&record.stderr, 5));
        }
    }
    Ok(())
}

fn first_lines(text: &str, limit: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().take(limit).collect();
    let mut out = lines.join("\n          ");
    if text.trim_end().lines().count() > limit {
        out.push_str("\n          …");
    }
    out
}
