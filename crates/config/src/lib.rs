use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible inference endpoint.  Overridden at
    /// runtime by the `GAUNTLET_LLM_BASE_URL` environment variable when set.
    pub base_url: String,
    pub model: String,
    pub max_context_tokens: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            model: "Qwen/Qwen3-30B-A3B-Thinking-2507".to_string(),
            max_context_tokens: 131_072,
            temperature: 0.7,
            max_tokens: 2048,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Container runtime: "docker", "podman", or "process" (run commands
    /// directly in the host workspace with no isolation; intended for tests
    /// and local development).
    pub runtime: String,
    pub base_image: String,
    pub memory_limit: String,
    pub cpus: f64,
    pub network_enabled: bool,
    pub command_timeout_secs: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            base_image: "python:3.11-slim".to_string(),
            memory_limit: "2g".to_string(),
            cpus: 1.0,
            network_enabled: false,
            command_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub output_dir: String,
    pub attempts_per_task: usize,
    pub max_iterations: usize,
    pub timeout_seconds: u64,
    /// Bounded worker pool size.  The container daemon is a shared resource,
    /// so unbounded parallelism is never allowed.
    pub workers: usize,
    pub max_tasks: Option<usize>,
    pub keep_snapshots: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            output_dir: "./benchmark-results".to_string(),
            attempts_per_task: 1,
            max_iterations: 10,
            timeout_seconds: 300,
            workers: 1,
            max_tasks: None,
            keep_snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub evaluation: EvalConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("GAUNTLET_LLM_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}
