//! GitHub Copilot CLI harness adapter.
//!
//! Thin stand-in, same rationale as [`super::codex::CodexAdapter`]: no
//! example in this corpus covers Copilot's agent wire protocol, so this
//! adapter only probes `$PATH` and otherwise reports itself unavailable.

use std::pin::Pin;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::Stream;
use tokio::process::Command;

use super::trait_def::Harness;
use super::types::{AgentEvent, AgentHandle, MaterializedTask};

/// Thin "not available" stand-in for the Copilot CLI harness.
pub struct CopilotAdapter {
    binary_path: String,
}

impl CopilotAdapter {
    pub fn new() -> Self {
        Self {
            binary_path: "copilot".to_string(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }

    async fn on_path(&self) -> bool {
        Command::new(&self.binary_path)
            .arg("--version")
            .output()
            .await
            .is_ok_and(|out| out.status.success())
    }
}

impl Default for CopilotAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Harness for CopilotAdapter {
    fn name(&self) -> &str {
        "copilot"
    }

    async fn spawn(&self, _task: &MaterializedTask) -> Result<AgentHandle> {
        if !self.on_path().await {
            bail!(
                "copilot binary '{}' not found on PATH; copilot adapter is not implemented, \
                 falling back to the next SDK in the chain",
                self.binary_path
            );
        }
        bail!(
            "copilot adapter does not implement the copilot wire protocol; \
             falling back to the next SDK in the chain"
        );
    }

    fn events(&self, _handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
        Box::pin(futures::stream::empty())
    }

    async fn send(&self, _handle: &AgentHandle, _message: &str) -> Result<()> {
        bail!("copilot adapter does not support send()")
    }

    async fn kill(&self, _handle: &AgentHandle) -> Result<()> {
        Ok(())
    }

    async fn is_running(&self, _handle: &AgentHandle) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_name_is_copilot() {
        assert_eq!(CopilotAdapter::new().name(), "copilot");
    }

    #[tokio::test]
    async fn spawn_fails_when_binary_missing() {
        let adapter = CopilotAdapter::with_binary("/nonexistent/path/to/copilot");
        let task = MaterializedTask {
            task_id: uuid::Uuid::new_v4(),
            name: "t".to_string(),
            description: String::new(),
            invariant_commands: vec![],
            working_dir: std::path::PathBuf::from("/tmp"),
            env_vars: std::collections::HashMap::new(),
        };
        let err = adapter.spawn(&task).await.unwrap_err();
        assert!(format!("{err:#}").contains("not found on PATH"));
    }
}
