//! Child process execution with line streaming

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::errors::OrchestratorError;
use crate::events::LogStream;
use crate::remote::ExecOutput;

/// Spawn `cmd`, stream stdout and stderr line by line into `log`, and collect
/// both. Exit status is reported, not interpreted.
pub async fn run_streaming(
    mut cmd: Command,
    log: Option<&LogStream>,
) -> Result<ExecOutput, OrchestratorError> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OrchestratorError::Internal("child stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| OrchestratorError::Internal("child stderr not captured".to_string()))?;

    let (stdout, stderr) = tokio::join!(collect_lines(stdout, log), collect_lines(stderr, log));
    let status = child.wait().await?;

    Ok(ExecOutput {
        stdout: stdout?,
        stderr: stderr?,
        // killed by signal
        exit_code: status.code().unwrap_or(-1),
    })
}

async fn collect_lines<R>(reader: R, log: Option<&LogStream>) -> Result<String, OrchestratorError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut collected = String::new();
    while let Some(line) = lines.next_line().await? {
        if let Some(log) = log {
            log.line(line.clone());
        }
        collected.push_str(&line);
        collected.push('\n');
    }
    Ok(collected)
}
