//! Isolated, observed execution environments for benchmark attempts.
//!
//! One [`Sandbox`] hosts all tool-initiated execution for one attempt: a
//! fresh container (or a bare process backend) with a single writable
//! workspace bind-mounted at `/workspace`, resource caps, an append-only
//! command log, and snapshot/metadata persistence for later review.
//!
//! Lifecycle: `provisioned → running → stopped → released`.  [`Sandbox::cleanup`]
//! is legal from any non-released state, never fails, and must run on every
//! exit path of every caller: a sandbox that reached `running` must always
//! reach `released`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod runtime;
pub mod workspace;

pub use runtime::{ContainerRuntime, ResourceCaps};
pub use workspace::ensure_within_workspace;

use gauntlet_config::SandboxConfig;

/// Where the workspace is mounted inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Captured output is truncated at this many bytes (on a char boundary).
const MAX_CAPTURED_OUTPUT: usize = 65_536;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("{operation} requires state {required:?}, sandbox is {actual:?}")]
    InvalidState {
        operation: &'static str,
        required: SandboxState,
        actual: SandboxState,
    },
    #[error("path escapes workspace boundary: {0}")]
    PathEscape(String),
    #[error("unsupported sandbox runtime: {0}")]
    UnknownRuntime(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Provisioned,
    Running,
    Stopped,
    Released,
}

/// Running counters for one sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxMetrics {
    pub task_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub commands_executed: u64,
    pub files_created: u64,
    pub files_modified: u64,
    pub iterations: u64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl SandboxMetrics {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            commands_executed: 0,
            files_created: 0,
            files_modified: 0,
            iterations: 0,
            success: false,
            error_message: None,
        }
    }

    pub fn duration_seconds(&self) -> f64 {
        match self.end_time {
            Some(end) => (end - self.start_time).num_milliseconds() as f64 / 1000.0,
            None => 0.0,
        }
    }
}

/// One entry in the append-only command log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub working_directory: String,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_seconds: f64,
}

/// Result of one `execute_command` call.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_seconds: f64,
}

/// Everything persisted by [`Sandbox::save_metadata`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMetadata {
    pub task_id: String,
    pub metrics: SandboxMetrics,
    pub command_log: Vec<CommandRecord>,
    pub container_name: String,
    pub workspace_dir: PathBuf,
}

pub struct Sandbox {
    task_id: String,
    runtime: ContainerRuntime,
    caps: ResourceCaps,
    /// Per-attempt root: holds `workspace/`, `snapshots/`, `sandbox_metadata.json`.
    root_dir: PathBuf,
    workspace_dir: PathBuf,
    container_name: String,
    state: SandboxState,
    pub metrics: SandboxMetrics,
    pub command_log: Vec<CommandRecord>,
}

impl Sandbox {
    /// Create the host-side workspace for an attempt.  No container yet.
    pub fn provision(
        task_id: &str,
        sandbox_dir: impl Into<PathBuf>,
        config: &SandboxConfig,
    ) -> Result<Self, SandboxError> {
        let runtime = ContainerRuntime::parse(&config.runtime)?;
        let root_dir = sandbox_dir.into();
        let workspace_dir = root_dir.join("workspace");
        std::fs::create_dir_all(&workspace_dir)?;

        // Unique per attempt so parallel attempts of one task never collide.
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let container_name = format!(
            "gauntlet-sandbox-{}-{}",
            sanitize_name(task_id),
            &suffix[..8]
        );

        info!(task_id, workspace = %workspace_dir.display(), "provisioned sandbox");

        Ok(Self {
            task_id: task_id.to_string(),
            runtime,
            caps: ResourceCaps {
                base_image: config.base_image.clone(),
                memory_limit: config.memory_limit.clone(),
                cpus: config.cpus,
                network_enabled: config.network_enabled,
            },
            root_dir,
            workspace_dir,
            container_name,
            state: SandboxState::Provisioned,
            metrics: SandboxMetrics::new(task_id),
            command_log: Vec::new(),
        })
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Launch the container.  Requires `Provisioned`.
    ///
    /// A runtime that cannot start a container is fatal to the attempt; the
    /// caller still owes a `cleanup`.
    pub async fn start(&mut self) -> Result<(), SandboxError> {
        self.require_state("start", SandboxState::Provisioned)?;

        if let Some(binary) = self.runtime.binary() {
            // A stale container with our name would make `run` fail.
            let _ = runtime::run_cli(binary, &runtime::remove_args(&self.container_name)).await;

            let args = runtime::create_args(&self.container_name, &self.workspace_dir, &self.caps);
            let output = runtime::run_cli(binary, &args)
                .await
                .map_err(|e| SandboxError::RuntimeUnavailable(format!("{binary}: {e}")))?;
            if !output.status.success() {
                return Err(SandboxError::RuntimeUnavailable(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
            info!(container = %self.container_name, image = %self.caps.base_image, "started sandbox container");
        } else {
            debug!(task_id = %self.task_id, "process runtime: no container to start");
        }

        self.state = SandboxState::Running;
        Ok(())
    }

    /// Run one command inside the sandbox and log the outcome.
    ///
    /// Timeouts and spawn failures are not errors: they are recorded with
    /// exit code −1 and returned, so the attempt can continue.  Only calling
    /// from the wrong state is an `Err`.
    pub async fn execute_command(
        &mut self,
        command: &str,
        working_directory: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput, SandboxError> {
        self.require_state("execute_command", SandboxState::Running)?;

        let cwd = working_directory.unwrap_or(CONTAINER_WORKSPACE).to_string();
        let timestamp = Utc::now();
        let started = Instant::now();

        let result = match self.runtime.binary() {
            Some(binary) => {
                let args = runtime::exec_args(&self.container_name, &cwd, command);
                tokio::time::timeout(timeout, runtime::run_cli(binary, &args)).await
            }
            None => {
                let host_cwd = self.host_cwd(&cwd)?;
                tokio::time::timeout(
                    timeout,
                    tokio::process::Command::new("sh")
                        .arg("-c")
                        .arg(command)
                        .current_dir(&host_cwd)
                        .stdin(Stdio::null())
                        .stdout(Stdio::piped())
                        .stderr(Stdio::piped())
                        .kill_on_drop(true)
                        .output(),
                )
                .await
            }
        };

        let duration_seconds = started.elapsed().as_secs_f64();
        let (stdout, stderr, exit_code) = match result {
            Ok(Ok(output)) => (
                truncate_output(&String::from_utf8_lossy(&output.stdout)),
                truncate_output(&String::from_utf8_lossy(&output.stderr)),
                output.status.code().map(i64::from).unwrap_or(-1),
            ),
            Ok(Err(e)) => {
                warn!(command, error = %e, "command failed to start");
                (String::new(), format!("failed to start command: {e}"), -1)
            }
            Err(_) => {
                warn!(command, timeout_secs = timeout.as_secs(), "command timed out");
                (
                    String::new(),
                    format!("command timed out after {}s", timeout.as_secs()),
                    -1,
                )
            }
        };

        let record = CommandRecord {
            timestamp,
            command: command.to_string(),
            working_directory: cwd,
            exit_code,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            duration_seconds,
        };
        self.command_log.push(record);
        self.metrics.commands_executed += 1;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            duration_seconds,
        })
    }

    /// Write a tarball (or tree copy) of the workspace under
    /// `snapshots/<name>/`.  Failures are logged, not raised.
    pub async fn snapshot_filesystem(&self, name: &str) -> Result<PathBuf, SandboxError> {
        if self.state == SandboxState::Released {
            return Err(SandboxError::InvalidState {
                operation: "snapshot_filesystem",
                required: SandboxState::Running,
                actual: self.state,
            });
        }

        let snapshot_dir = self.root_dir.join("snapshots").join(name);
        std::fs::create_dir_all(&snapshot_dir)?;

        if self.runtime.is_container() && self.state == SandboxState::Running {
            let binary = self.runtime.binary().unwrap_or("docker");
            match runtime::run_cli(binary, &runtime::export_args(&self.container_name)).await {
                Ok(output) if output.status.success() => {
                    std::fs::write(snapshot_dir.join("filesystem.tar"), &output.stdout)?;
                    debug!(snapshot = %snapshot_dir.display(), "captured container snapshot");
                    return Ok(snapshot_dir);
                }
                Ok(output) => {
                    warn!(
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "container export failed, copying host workspace instead"
                    );
                }
                Err(e) => {
                    warn!(error = %e, "container export unavailable, copying host workspace instead");
                }
            }
        }

        copy_tree(&self.workspace_dir, &snapshot_dir)?;
        Ok(snapshot_dir)
    }

    /// Persist metrics, the command log, and identifiers for later review.
    pub fn save_metadata(&self) -> Result<PathBuf, SandboxError> {
        let metadata = SandboxMetadata {
            task_id: self.task_id.clone(),
            metrics: self.metrics.clone(),
            command_log: self.command_log.clone(),
            container_name: self.container_name.clone(),
            workspace_dir: self.workspace_dir.clone(),
        };
        let path = self.root_dir.join("sandbox_metadata.json");
        let rendered = serde_json::to_string_pretty(&metadata)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::write(&path, rendered)?;
        Ok(path)
    }

    /// Release all host resources.  Idempotent, legal from any state, and
    /// never raises; callers rely on this from error paths.
    pub async fn cleanup(&mut self, keep_snapshot: bool) {
        if self.state == SandboxState::Released {
            return;
        }

        if keep_snapshot {
            if let Err(e) = self.snapshot_filesystem("final").await {
                warn!(task_id = %self.task_id, error = %e, "final snapshot failed");
            }
            if let Err(e) = self.save_metadata() {
                warn!(task_id = %self.task_id, error = %e, "metadata save failed");
            }
        }

        if self.runtime.is_container() && self.state == SandboxState::Running {
            let binary = self.runtime.binary().unwrap_or("docker");
            if let Err(e) = runtime::run_cli(binary, &runtime::stop_args(&self.container_name)).await
            {
                warn!(container = %self.container_name, error = %e, "container stop failed");
            }
            self.state = SandboxState::Stopped;
            if let Err(e) =
                runtime::run_cli(binary, &runtime::remove_args(&self.container_name)).await
            {
                warn!(container = %self.container_name, error = %e, "container remove failed");
            }
        }

        if self.metrics.end_time.is_none() {
            self.metrics.end_time = Some(Utc::now());
        }
        self.state = SandboxState::Released;
        info!(task_id = %self.task_id, "sandbox released");
    }

    /// Map a container-style working directory onto the host workspace.
    fn host_cwd(&self, cwd: &str) -> Result<PathBuf, SandboxError> {
        let relative = cwd
            .strip_prefix(CONTAINER_WORKSPACE)
            .unwrap_or(cwd)
            .trim_start_matches('/');
        if relative.is_empty() {
            return Ok(self.workspace_dir.clone());
        }
        ensure_within_workspace(&self.workspace_dir, Path::new(relative))
    }

    fn require_state(
        &self,
        operation: &'static str,
        required: SandboxState,
    ) -> Result<(), SandboxError> {
        if self.state != required {
            return Err(SandboxError::InvalidState {
                operation,
                required,
                actual: self.state,
            });
        }
        Ok(())
    }
}

fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Truncate on a char boundary so tool output can't blow up the context.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_CAPTURED_OUTPUT {
        return s.to_string();
    }
    let mut end = MAX_CAPTURED_OUTPUT;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated at {} bytes]", &s[..end], MAX_CAPTURED_OUTPUT)
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn process_config() -> SandboxConfig {
        SandboxConfig {
            runtime: "process".to_string(),
            ..SandboxConfig::default()
        }
    }

    fn timeout() -> Duration {
        Duration::from_secs(10)
    }

    #[tokio::test]
    async fn lifecycle_records_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::provision("demo-1", dir.path(), &process_config()).unwrap();
        assert_eq!(sandbox.state(), SandboxState::Provisioned);

        sandbox.start().await.unwrap();
        assert_eq!(sandbox.state(), SandboxState::Running);

        let output = sandbox
            .execute_command("echo hello", None, timeout())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("hello"));
        assert_eq!(sandbox.command_log.len(), 1);
        assert_eq!(sandbox.metrics.commands_executed, 1);

        sandbox.cleanup(false).await;
        assert_eq!(sandbox.state(), SandboxState::Released);
    }

    #[tokio::test]
    async fn execute_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::provision("demo-2", dir.path(), &process_config()).unwrap();
        let result = sandbox.execute_command("echo hi", None, timeout()).await;
        assert!(matches!(result, Err(SandboxError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn released_sandbox_rejects_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::provision("demo-3", dir.path(), &process_config()).unwrap();
        sandbox.start().await.unwrap();
        sandbox.cleanup(false).await;

        let result = sandbox.execute_command("echo hi", None, timeout()).await;
        assert!(matches!(result, Err(SandboxError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::provision("demo-4", dir.path(), &process_config()).unwrap();
        sandbox.start().await.unwrap();
        sandbox.cleanup(true).await;
        sandbox.cleanup(true).await;
        assert_eq!(sandbox.state(), SandboxState::Released);
        assert!(sandbox.metrics.end_time.is_some());
    }

    #[tokio::test]
    async fn timed_out_command_is_logged_with_minus_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::provision("demo-5", dir.path(), &process_config()).unwrap();
        sandbox.start().await.unwrap();

        let output = sandbox
            .execute_command("sleep 5", None, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(output.exit_code, -1);
        assert!(output.stderr.contains("timed out"));
        assert_eq!(sandbox.command_log.len(), 1);
        assert_eq!(sandbox.command_log[0].exit_code, -1);

        // The attempt may keep going after a command timeout.
        let next = sandbox
            .execute_command("echo still-alive", None, timeout())
            .await
            .unwrap();
        assert_eq!(next.exit_code, 0);

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn commands_run_inside_workspace_subdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::provision("demo-6", dir.path(), &process_config()).unwrap();
        sandbox.start().await.unwrap();
        std::fs::create_dir_all(sandbox.workspace_dir().join("sub")).unwrap();

        let output = sandbox
            .execute_command("pwd", Some("/workspace/sub"), timeout())
            .await
            .unwrap();
        assert!(output.stdout.trim().ends_with("sub"));
        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn snapshot_copies_workspace_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::provision("demo-7", dir.path(), &process_config()).unwrap();
        sandbox.start().await.unwrap();
        std::fs::write(sandbox.workspace_dir().join("solution.py"), "x = 1\n").unwrap();

        let snapshot = sandbox.snapshot_filesystem("mid").await.unwrap();
        assert!(snapshot.join("solution.py").exists());

        // Re-capturing with an unchanged workspace yields the same bytes.
        let again = sandbox.snapshot_filesystem("mid2").await.unwrap();
        assert_eq!(
            std::fs::read(snapshot.join("solution.py")).unwrap(),
            std::fs::read(again.join("solution.py")).unwrap(),
        );
        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn cleanup_persists_snapshot_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = Sandbox::provision("demo-8", dir.path(), &process_config()).unwrap();
        sandbox.start().await.unwrap();
        std::fs::write(sandbox.workspace_dir().join("out.txt"), "done\n").unwrap();
        sandbox
            .execute_command("echo logged", None, timeout())
            .await
            .unwrap();

        sandbox.cleanup(true).await;

        let metadata_path = dir.path().join("sandbox_metadata.json");
        assert!(metadata_path.exists());
        let metadata: SandboxMetadata =
            serde_json::from_str(&std::fs::read_to_string(metadata_path).unwrap()).unwrap();
        assert_eq!(metadata.command_log.len(), 1);
        assert_eq!(metadata.metrics.commands_executed, 1);
        assert!(dir.path().join("snapshots/final/out.txt").exists());
    }

    #[test]
    fn unknown_runtime_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            runtime: "vm".to_string(),
            ..SandboxConfig::default()
        };
        let result = Sandbox::provision("demo-9", dir.path(), &config);
        assert!(matches!(result, Err(SandboxError::UnknownRuntime(_))));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_CAPTURED_OUTPUT);
        let truncated = truncate_output(&long);
        assert!(truncated.contains("[truncated"));
    }

    #[test]
    fn container_names_are_unique_per_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let a = Sandbox::provision("same/task", dir.path().join("a"), &process_config()).unwrap();
        let b = Sandbox::provision("same/task", dir.path().join("b"), &process_config()).unwrap();
        assert_ne!(a.container_name(), b.container_name());
        assert!(a.container_name().starts_with("gauntlet-sandbox-same-task-"));
    }
}
