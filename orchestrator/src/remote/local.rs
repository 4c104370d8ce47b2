//! Shell on the orchestrator's own machine

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::OrchestratorError;
use crate::events::LogStream;
use crate::remote::process::run_streaming;
use crate::remote::{command_label, ExecOutput, Shell};

#[derive(Debug, Clone, Default)]
pub struct LocalShell;

impl LocalShell {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Shell for LocalShell {
    async fn execute(
        &self,
        command: &str,
        log: Option<&LogStream>,
    ) -> Result<ExecOutput, OrchestratorError> {
        debug!("local: {}", command_label(command));
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(command);
        run_streaming(cmd, log).await
    }

    async fn fetch_file(&self, remote: &str, local: &Path) -> Result<(), OrchestratorError> {
        if Path::new(remote) != local {
            tokio::fs::copy(remote, local).await?;
        }
        Ok(())
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), OrchestratorError> {
        if Path::new(remote) != local {
            tokio::fs::copy(local, remote).await?;
        }
        Ok(())
    }

    fn is_remote(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}
