//! Container runtime selection and CLI argument construction.
//!
//! Commands are built programmatically as argument vectors and handed to
//! `tokio::process::Command`; user-supplied values (container names, images,
//! commands) never pass through a host shell.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::SandboxError;

/// Execution backend for a sandbox.
///
/// `Docker` and `Podman` drive the respective container CLI.  `Process` runs
/// commands directly in the host workspace directory with no isolation; it
/// exists for tests and local development and must be selected explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
    Process,
}

impl ContainerRuntime {
    pub fn parse(s: &str) -> Result<Self, SandboxError> {
        match s {
            "docker" => Ok(Self::Docker),
            "podman" => Ok(Self::Podman),
            "process" => Ok(Self::Process),
            other => Err(SandboxError::UnknownRuntime(other.to_string())),
        }
    }

    /// Binary name for container runtimes; `None` for direct execution.
    pub fn binary(&self) -> Option<&'static str> {
        match self {
            Self::Docker => Some("docker"),
            Self::Podman => Some("podman"),
            Self::Process => None,
        }
    }

    pub fn is_container(&self) -> bool {
        self.binary().is_some()
    }
}

/// Resource caps applied to a sandbox container.
#[derive(Debug, Clone)]
pub struct ResourceCaps {
    pub base_image: String,
    pub memory_limit: String,
    pub cpus: f64,
    pub network_enabled: bool,
}

/// `run` arguments for a fresh detached sandbox container: workspace bind
/// mount, resource caps, no network unless enabled, no-op long-lived
/// entrypoint so commands can be exec'd in later.
pub fn create_args(name: &str, workspace: &Path, caps: &ResourceCaps) -> Vec<String> {
    let cpu_quota = (caps.cpus * 100_000.0) as i64;
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-v".to_string(),
        format!("{}:/workspace", workspace.display()),
        "-w".to_string(),
        "/workspace".to_string(),
        "--memory".to_string(),
        caps.memory_limit.clone(),
        "--cpu-period".to_string(),
        "100000".to_string(),
        "--cpu-quota".to_string(),
        cpu_quota.to_string(),
    ];
    if !caps.network_enabled {
        args.push("--network".to_string());
        args.push("none".to_string());
    }
    args.push(caps.base_image.clone());
    args.extend(["tail", "-f", "/dev/null"].map(String::from));
    args
}

/// `exec` arguments running `command` through `sh -c` inside the container.
pub fn exec_args(name: &str, cwd: &str, command: &str) -> Vec<String> {
    vec![
        "exec".to_string(),
        "-w".to_string(),
        cwd.to_string(),
        name.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]
}

pub fn stop_args(name: &str) -> Vec<String> {
    vec!["stop".to_string(), "-t".to_string(), "10".to_string(), name.to_string()]
}

pub fn remove_args(name: &str) -> Vec<String> {
    vec!["rm".to_string(), "-f".to_string(), name.to_string()]
}

/// `cp <name>:/workspace -` streams the workspace as a tar archive to stdout.
pub fn export_args(name: &str) -> Vec<String> {
    vec!["cp".to_string(), format!("{name}:/workspace"), "-".to_string()]
}

/// Run a container CLI invocation to completion, capturing output.
pub(crate) async fn run_cli(binary: &str, args: &[String]) -> std::io::Result<std::process::Output> {
    Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
}
