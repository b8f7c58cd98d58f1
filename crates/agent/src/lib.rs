//! Coding agent: a tool-calling conversation with an external model, resolved
//! against one sandboxed workspace.
//!
//! The agent holds the conversation history, streams each assistant turn to
//! completion, executes any emitted tool calls strictly in order (one tool
//! turn per call), and loops until the model answers without tools or the
//! iteration budget runs out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use gauntlet_llm::{
    ChatEndpoint, ChatMessage, ChatRequest, GenerationParams, LlmError,
};
use gauntlet_sandbox::Sandbox;

pub mod extract;
pub mod tools;

pub use extract::extract_solution;
pub use tools::{dispatch, tool_definitions, ToolRequest};

const SYSTEM_PROMPT: &str = "\
You are a coding agent working inside an isolated workspace mounted at /workspace.
All file paths are relative to the workspace root; you cannot access anything outside it.

You have these tools: read_file, write_file, list_files, read_directory, execute_command.
Use write_file to create your solution as a source file in the workspace, and
execute_command to run code or tests. When you are confident the solution is complete,
reply without calling any tool.";

/// What one agent run produced and observed.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// The last assistant text (the final answer when the loop ended cleanly).
    pub final_text: String,
    /// Assistant turns consumed, including tool-calling ones.
    pub iterations: u64,
    /// Completion tokens across all turns, when the endpoint reports usage.
    pub tokens_generated: u64,
}

pub struct CodingAgent {
    endpoint: Arc<dyn ChatEndpoint>,
    params: GenerationParams,
    max_context_tokens: usize,
    max_iterations: usize,
    command_timeout: Duration,
    history: Vec<ChatMessage>,
}

impl CodingAgent {
    pub fn new(
        endpoint: Arc<dyn ChatEndpoint>,
        params: GenerationParams,
        max_context_tokens: usize,
        max_iterations: usize,
        command_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            params,
            max_context_tokens,
            max_iterations,
            command_timeout,
            history: Vec::new(),
        }
    }

    /// Full conversation so far (system + user + assistant + tool turns).
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Run one attempt: seed the conversation with the task, then iterate
    /// model turns against the sandbox until convergence or budget exhaustion.
    pub async fn run(
        &mut self,
        sandbox: &mut Sandbox,
        task_prompt: &str,
    ) -> Result<AgentOutcome, LlmError> {
        self.history = vec![
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user(task_prompt),
        ];

        let tools = tools::tool_definitions();
        let mut iterations: u64 = 0;
        let mut tokens_generated: u64 = 0;
        let mut final_text = String::new();

        for round in 0..self.max_iterations {
            let request = ChatRequest {
                messages: self.history.clone(),
                params: self.params.clone(),
                tools: tools.clone(),
                max_context_tokens: self.max_context_tokens,
            };

            let response = self.endpoint.chat(request).await?;
            iterations += 1;
            tokens_generated += response.tokens_generated;
            debug!(
                round,
                tool_calls = response.tool_calls.len(),
                finish_reason = %response.finish_reason,
                "assistant turn complete"
            );

            self.history.push(ChatMessage::assistant_turn(
                response.content.clone(),
                response.tool_calls.clone(),
            ));
            final_text = response.content;

            if response.tool_calls.is_empty() {
                break;
            }

            // One tool turn per call, in emission order, before the model
            // sees anything else.
            for call in &response.tool_calls {
                let request = ToolRequest::from_call(call);
                let result = tools::dispatch(request, sandbox, self.command_timeout).await;
                let serialized = serde_json::to_string(&result)
                    .unwrap_or_else(|e| format!("{{\"error\":\"unserializable tool result: {e}\"}}"));
                self.history.push(ChatMessage::tool_result(&call.id, serialized));
            }
        }

        sandbox.metrics.iterations = iterations;
        info!(iterations, tokens_generated, "agent run finished");

        Ok(AgentOutcome {
            final_text,
            iterations,
            tokens_generated,
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use gauntlet_config::SandboxConfig;
    use gauntlet_llm::{ChatChunk, ChunkStream, ToolCallDelta};

    /// Scripted endpoint: each entry is the chunk sequence for one turn.
    struct ScriptedEndpoint {
        turns: Mutex<VecDeque<Vec<ChatChunk>>>,
    }

    impl ScriptedEndpoint {
        fn new(turns: Vec<Vec<ChatChunk>>) -> Arc<Self> {
            Arc::new(Self {
                turns: Mutex::new(turns.into()),
            })
        }
    }

    #[async_trait]
    impl ChatEndpoint for ScriptedEndpoint {
        async fn chat_stream(&self, _request: ChatRequest) -> Result<ChunkStream, LlmError> {
            let chunks = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| vec![final_chunk("stop")]);
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for chunk in chunks {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    fn text_chunk(text: &str) -> ChatChunk {
        ChatChunk {
            delta_content: Some(text.to_string()),
            ..Default::default()
        }
    }

    fn final_chunk(reason: &str) -> ChatChunk {
        ChatChunk {
            is_final: true,
            finish_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }

    fn tool_chunk(id: &str, name: &str, arguments: serde_json::Value) -> ChatChunk {
        ChatChunk {
            delta_tool_calls: vec![ToolCallDelta {
                index: 0,
                id: Some(id.to_string()),
                name: Some(name.to_string()),
                arguments: Some(arguments.to_string()),
            }],
            ..Default::default()
        }
    }

    async fn running_sandbox(dir: &std::path::Path) -> Sandbox {
        let config = SandboxConfig {
            runtime: "process".to_string(),
            ..SandboxConfig::default()
        };
        let mut sandbox = Sandbox::provision("agent-test", dir, &config).unwrap();
        sandbox.start().await.unwrap();
        sandbox
    }

    fn agent(endpoint: Arc<dyn ChatEndpoint>, max_iterations: usize) -> CodingAgent {
        CodingAgent::new(
            endpoint,
            GenerationParams::default(),
            8192,
            max_iterations,
            Duration::from_secs(10),
        )
    }

    #[tokio::test]
    async fn write_then_answer_converges_in_two_turns() {
        let endpoint = ScriptedEndpoint::new(vec![
            vec![
                tool_chunk(
                    "call_w",
                    "write_file",
                    json!({"file_path": "solution.py", "content": "def add(a, b):\n    return a + b\n"}),
                ),
                final_chunk("tool_calls"),
            ],
            vec![text_chunk("Solution written."), final_chunk("stop")],
        ]);

        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = running_sandbox(dir.path()).await;
        let mut agent = agent(endpoint, 10);

        let outcome = agent.run(&mut sandbox, "Write add(a,b).").await.unwrap();
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.final_text, "Solution written.");
        assert!(sandbox.workspace_dir().join("solution.py").exists());

        // Exactly one tool turn, correlated by id.
        let tool_turns: Vec<_> = agent
            .history()
            .iter()
            .filter(|m| m.tool_call_id.is_some())
            .collect();
        assert_eq!(tool_turns.len(), 1);
        assert_eq!(tool_turns[0].tool_call_id.as_deref(), Some("call_w"));
        let result: serde_json::Value =
            serde_json::from_str(tool_turns[0].content.as_deref().unwrap()).unwrap();
        assert_eq!(result["success"], true);

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn escape_attempt_feeds_error_back_and_continues() {
        let endpoint = ScriptedEndpoint::new(vec![
            vec![
                tool_chunk(
                    "call_e",
                    "read_file",
                    json!({"file_path": "../../etc/hostname"}),
                ),
                final_chunk("tool_calls"),
            ],
            vec![text_chunk("Understood."), final_chunk("stop")],
        ]);

        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = running_sandbox(dir.path()).await;
        let mut agent = agent(endpoint, 10);

        let outcome = agent.run(&mut sandbox, "task").await.unwrap();
        assert_eq!(outcome.iterations, 2);

        let tool_turn = agent
            .history()
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_e"))
            .unwrap();
        let result: serde_json::Value =
            serde_json::from_str(tool_turn.content.as_deref().unwrap()).unwrap();
        assert!(result["error"]
            .as_str()
            .unwrap()
            .contains("escapes workspace boundary"));

        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn iteration_budget_bounds_a_looping_model() {
        // Model lists files forever; never answers.
        let list_turn = || {
            vec![
                tool_chunk("call_l", "list_files", json!({})),
                final_chunk("tool_calls"),
            ]
        };
        let endpoint = ScriptedEndpoint::new(vec![list_turn(), list_turn(), list_turn(), list_turn()]);

        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = running_sandbox(dir.path()).await;
        let mut agent = agent(endpoint, 3);

        let outcome = agent.run(&mut sandbox, "task").await.unwrap();
        assert_eq!(outcome.iterations, 3);
        assert!(extract_solution(sandbox.workspace_dir(), "py").is_none());
        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn zero_iteration_budget_never_calls_the_model() {
        let endpoint = ScriptedEndpoint::new(vec![vec![
            text_chunk("never seen"),
            final_chunk("stop"),
        ]]);

        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = running_sandbox(dir.path()).await;
        let mut agent = agent(endpoint, 0);

        let outcome = agent.run(&mut sandbox, "task").await.unwrap();
        assert_eq!(outcome.iterations, 0);
        assert!(outcome.final_text.is_empty());
        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_turn_not_a_crash() {
        let endpoint = ScriptedEndpoint::new(vec![
            vec![
                tool_chunk("call_u", "summon_demon", json!({})),
                final_chunk("tool_calls"),
            ],
            vec![text_chunk("ok"), final_chunk("stop")],
        ]);

        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = running_sandbox(dir.path()).await;
        let mut agent = agent(endpoint, 5);

        agent.run(&mut sandbox, "task").await.unwrap();
        let tool_turn = agent
            .history()
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_u"))
            .unwrap();
        assert!(tool_turn.content.as_deref().unwrap().contains("unknown tool"));
        sandbox.cleanup(false).await;
    }

    #[tokio::test]
    async fn multiple_calls_in_one_turn_execute_in_order() {
        let endpoint = ScriptedEndpoint::new(vec![
            vec![
                ChatChunk {
                    delta_tool_calls: vec![
                        ToolCallDelta {
                            index: 0,
                            id: Some("call_1".into()),
                            name: Some("write_file".into()),
                            arguments: Some(
                                json!({"file_path": "a.py", "content": "a = 1\n"}).to_string(),
                            ),
                        },
                        ToolCallDelta {
                            index: 1,
                            id: Some("call_2".into()),
                            name: Some("read_file".into()),
                            arguments: Some(json!({"file_path": "a.py"}).to_string()),
                        },
                    ],
                    ..Default::default()
                },
                final_chunk("tool_calls"),
            ],
            vec![text_chunk("done"), final_chunk("stop")],
        ]);

        let dir = tempfile::tempdir().unwrap();
        let mut sandbox = running_sandbox(dir.path()).await;
        let mut agent = agent(endpoint, 5);
        agent.run(&mut sandbox, "task").await.unwrap();

        // The read (second call) sees the write (first call).
        let read_turn = agent
            .history()
            .iter()
            .find(|m| m.tool_call_id.as_deref() == Some("call_2"))
            .unwrap();
        let result: serde_json::Value =
            serde_json::from_str(read_turn.content.as_deref().unwrap()).unwrap();
        assert_eq!(result["content"], "a = 1\n");
        sandbox.cleanup(false).await;
    }
}
