//! The tool surface exposed to the model, and its dispatcher.
//!
//! Tool names arriving from the model are parsed into a closed [`ToolRequest`]
//! sum type; dispatch is an exhaustive match.  Unknown names and bad arguments
//! become error result objects fed back to the model, never a crash and never
//! a thrown error.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::debug;

use gauntlet_llm::{ToolCall, ToolDefinition};
use gauntlet_sandbox::{ensure_within_workspace, Sandbox, CONTAINER_WORKSPACE};

/// Tool results larger than this are truncated (on a char boundary).
const MAX_RESULT_BYTES: usize = 65_536;

/// A structured request decoded from one model tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    ReadFile { file_path: String },
    WriteFile { file_path: String, content: String },
    ListFiles { directory: Option<String> },
    ReadDirectory { directory: Option<String> },
    ExecuteCommand { command: String, working_directory: Option<String> },
    Unknown { name: String },
}

impl ToolRequest {
    pub fn from_call(call: &ToolCall) -> Self {
        let args = &call.function.arguments;
        let get = |key: &str| args.get(key).and_then(Value::as_str).map(str::to_string);
        let get_nonempty = |key: &str| get(key).filter(|s| !s.is_empty());

        match call.function.name.as_str() {
            "read_file" => Self::ReadFile {
                file_path: get("file_path").unwrap_or_default(),
            },
            "write_file" => Self::WriteFile {
                file_path: get("file_path").unwrap_or_default(),
                content: get("content").unwrap_or_default(),
            },
            "list_files" => Self::ListFiles {
                directory: get_nonempty("directory"),
            },
            "read_directory" => Self::ReadDirectory {
                directory: get_nonempty("directory"),
            },
            "execute_command" => Self::ExecuteCommand {
                command: get("command").unwrap_or_default(),
                working_directory: get_nonempty("working_directory"),
            },
            other => Self::Unknown {
                name: other.to_string(),
            },
        }
    }
}

/// Execute one tool request against the sandbox workspace.
///
/// Always returns a JSON result object; failures carry an `error` field.
pub async fn dispatch(
    request: ToolRequest,
    sandbox: &mut Sandbox,
    command_timeout: Duration,
) -> Value {
    debug!(?request, "dispatching tool call");
    match request {
        ToolRequest::ReadFile { file_path } => read_file(sandbox.workspace_dir(), &file_path),
        ToolRequest::WriteFile { file_path, content } => {
            write_file(sandbox.workspace_dir(), &file_path, &content)
        }
        ToolRequest::ListFiles { directory } => {
            list_directory(sandbox.workspace_dir(), directory.as_deref(), false)
        }
        ToolRequest::ReadDirectory { directory } => {
            list_directory(sandbox.workspace_dir(), directory.as_deref(), true)
        }
        ToolRequest::ExecuteCommand {
            command,
            working_directory,
        } => execute_command(sandbox, &command, working_directory.as_deref(), command_timeout).await,
        ToolRequest::Unknown { name } => json!({ "error": format!("unknown tool: {name}") }),
    }
}

fn read_file(workspace: &Path, file_path: &str) -> Value {
    if file_path.is_empty() {
        return json!({ "error": "file_path is required" });
    }
    let resolved = match ensure_within_workspace(workspace, Path::new(file_path)) {
        Ok(path) => path,
        Err(e) => return json!({ "error": e.to_string() }),
    };
    match std::fs::read_to_string(&resolved) {
        Ok(content) => json!({
            "file_path": file_path,
            "content": truncate(&content),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            json!({ "error": format!("file not found: {file_path}") })
        }
        Err(e) => json!({ "error": format!("error reading file: {e}") }),
    }
}

fn write_file(workspace: &Path, file_path: &str, content: &str) -> Value {
    if file_path.is_empty() {
        return json!({ "error": "file_path is required" });
    }
    let resolved = match ensure_within_workspace(workspace, Path::new(file_path)) {
        Ok(path) => path,
        Err(e) => return json!({ "error": e.to_string() }),
    };
    if let Some(parent) = resolved.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return json!({ "error": format!("error creating directories: {e}") });
        }
    }
    match std::fs::write(&resolved, content) {
        Ok(()) => json!({
            "success": true,
            "file_path": file_path,
            "bytes_written": content.len(),
        }),
        Err(e) => json!({ "error": format!("error writing file: {e}") }),
    }
}

fn list_directory(workspace: &Path, directory: Option<&str>, detailed: bool) -> Value {
    let requested = directory.unwrap_or("");
    let resolved = if requested.is_empty() {
        workspace.to_path_buf()
    } else {
        match ensure_within_workspace(workspace, Path::new(requested)) {
            Ok(path) => path,
            Err(e) => return json!({ "error": e.to_string() }),
        }
    };

    let entries = match std::fs::read_dir(&resolved) {
        Ok(entries) => entries,
        Err(e) => return json!({ "error": format!("error listing directory: {e}") }),
    };

    let mut items = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let kind = if path.is_dir() { "directory" } else { "file" };
        let relative = path
            .strip_prefix(workspace)
            .unwrap_or(&path)
            .display()
            .to_string();
        let mut item = json!({
            "name": entry.file_name().to_string_lossy(),
            "type": kind,
            "path": relative,
        });
        if detailed && kind == "file" {
            if let Ok(metadata) = entry.metadata() {
                item["size_bytes"] = json!(metadata.len());
            }
        }
        items.push(item);
    }
    items.sort_by(|a, b| a["path"].as_str().cmp(&b["path"].as_str()));

    json!({
        "directory": if requested.is_empty() { "." } else { requested },
        "items": items,
    })
}

async fn execute_command(
    sandbox: &mut Sandbox,
    command: &str,
    working_directory: Option<&str>,
    timeout: Duration,
) -> Value {
    if command.is_empty() {
        return json!({ "error": "command is required" });
    }

    // Resolve and validate the working directory against the host workspace,
    // then hand the sandbox its container-side path.
    let container_cwd = match working_directory {
        Some(dir) => {
            if let Err(e) = ensure_within_workspace(sandbox.workspace_dir(), Path::new(dir)) {
                return json!({ "error": e.to_string() });
            }
            format!("{CONTAINER_WORKSPACE}/{}", dir.trim_start_matches('/'))
        }
        None => CONTAINER_WORKSPACE.to_string(),
    };

    match sandbox
        .execute_command(command, Some(&container_cwd), timeout)
        .await
    {
        Ok(output) => json!({
            "command": command,
            "working_directory": container_cwd,
            "stdout": truncate(&output.stdout),
            "stderr": truncate(&output.stderr),
            "returncode": output.exit_code,
        }),
        Err(e) => json!({ "error": format!("error executing command: {e}") }),
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= MAX_RESULT_BYTES {
        return s.to_string();
    }
    let mut end = MAX_RESULT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated at {} bytes]", &s[..end], MAX_RESULT_BYTES)
}

/// The tool contract advertised to the model.
pub fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read the contents of a file. Use this to examine code files, \
                          configuration files, or any text files."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "Path to the file to read (relative to workspace root)",
                    }
                },
                "required": ["file_path"],
            }),
        },
        ToolDefinition {
            name: "write_file".to_string(),
            description: "Write content to a file. Use this to create or modify files.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "file_path": {
                        "type": "string",
                        "description": "Path to the file to write (relative to workspace root)",
                    },
                    "content": {
                        "type": "string",
                        "description": "Content to write to the file",
                    }
                },
                "required": ["file_path", "content"],
            }),
        },
        ToolDefinition {
            name: "list_files".to_string(),
            description: "List files and directories in a directory.".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "directory": {
                        "type": "string",
                        "description": "Directory path to list (relative to workspace root, \
                                        defaults to workspace root)",
                    }
                },
                "required": [],
            }),
        },
        ToolDefinition {
            name: "read_directory".to_string(),
            description: "Get detailed information about files and subdirectories in a directory."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "directory": {
                        "type": "string",
                        "description": "Directory path (relative to workspace root, defaults to \
                                        workspace root)",
                    }
                },
                "required": [],
            }),
        },
        ToolDefinition {
            name: "execute_command".to_string(),
            description: "Execute a shell command in the workspace. Use this to run scripts, \
                          tests, or any shell commands. Commands run in the workspace directory."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "Shell command to execute",
                    },
                    "working_directory": {
                        "type": "string",
                        "description": "Working directory for the command (relative to \
                                        workspace root, defaults to workspace root)",
                    }
                },
                "required": ["command"],
            }),
        },
    ]
}
