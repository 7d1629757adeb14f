//! Codex CLI harness adapter.
//!
//! Unlike [`super::claude_code::ClaudeCodeAdapter`], this adapter does not
//! speak Codex's wire protocol: nothing in this codebase's corpus of
//! examples captures its event stream format. It only reports whether the
//! `codex` binary is reachable on `$PATH`, so [`crate::agent_pool::AgentPool`]'s
//! fallback chain can skip over it cleanly instead of treating an
//! unimplemented SDK as a hard error.

use std::pin::Pin;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::Stream;
use tokio::process::Command;

use super::trait_def::Harness;
use super::types::{AgentEvent, AgentHandle, MaterializedTask};

/// Thin "not available" stand-in for the Codex CLI harness.
pub struct CodexAdapter {
    binary_path: String,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            binary_path: "codex".to_string(),
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

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Harness for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    async fn spawn(&self, _task: &MaterializedTask) -> Result<AgentHandle> {
        if !self.on_path().await {
            bail!(
                "codex binary '{}' not found on PATH; codex adapter is not implemented, \
                 falling back to the next SDK in the chain",
                self.binary_path
            );
        }
        bail!(
            "codex adapter does not implement the codex wire protocol; \
             falling back to the next SDK in the chain"
        );
    }

    fn events(&self, _handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentEvent> + Send>> {
        Box::pin(futures::stream::empty())
    }

    async fn send(&self, _handle: &AgentHandle, _message: &str) -> Result<()> {
        bail!("codex adapter does not support send()")
    }

    async fn kill(&self, _handle: &AgentHandle) -> Result<()> {
        Ok(())
    }

    async fn is_running(&self, _handle: &AgentHandle) -> bool {
        false
    }
}
