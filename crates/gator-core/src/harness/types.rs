//! Shared types for the [`super::Harness`] adapter interface.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use uuid::Uuid;

/// A task materialized into a form a harness can execute: a working
/// directory, the prompt/description, and the invariant commands that
/// will later gate its completion.
#[derive(Debug, Clone)]
pub struct MaterializedTask {
    pub task_id: Uuid,
    pub name: String,
    pub description: String,
    pub invariant_commands: Vec<String>,
    pub working_dir: PathBuf,
    pub env_vars: HashMap<String, String>,
}

/// A handle to a spawned agent process.
///
/// `stdin` is `None` once the process has exited or for harnesses that do
/// not support interactive continuation.
#[derive(Debug)]
pub struct AgentHandle {
    pub pid: u32,
    pub stdin: Option<tokio::process::ChildStdin>,
    pub task_id: Uuid,
    pub attempt: i32,
    pub harness_name: String,
}

/// A single event emitted by an agent during its run.
///
/// This is the closed variant set every harness adapter normalizes its
/// SDK-specific stream into; `PartialEq` is derived to make event-stream
/// assertions in tests straightforward.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A chat-style message from the agent or the harness itself.
    Message { role: String, content: String },
    /// The agent invoked a tool.
    ToolCall { tool: String, input: Value },
    /// A tool call returned a result.
    ToolResult { tool: String, output: Value },
    /// Token usage reported by the underlying model.
    TokenUsage { input_tokens: u64, output_tokens: u64 },
    /// An error surfaced by the agent or the harness.
    Error { message: String },
    /// The agent's run has ended; always the last event on the stream.
    Completed,
}
