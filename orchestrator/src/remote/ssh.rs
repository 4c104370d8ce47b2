//! Persistent SSH sessions
//!
//! A session owns an OpenSSH control master (`ssh -M`) bound to a socket under
//! the data directory. Every command and file transfer is multiplexed over
//! that master, so authentication happens once per session.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::OrchestratorError;
use crate::events::LogStream;
use crate::remote::process::run_streaming;
use crate::remote::{command_label, ExecOutput, Shell};
use crate::utils::{scrub_credentials, shell_quote, tail_lines};

/// OpenSSH reserves this exit code for its own failures
const SSH_CONNECTION_FAILURE: i32 = 255;

const CONNECT_TIMEOUT_SECS: u32 = 15;
const CONTROL_PERSIST_SECS: u32 = 600;

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub address: String,
    pub port: u16,
    pub user: String,
}

impl SshTarget {
    fn destination(&self) -> String {
        format!("{}@{}", self.user, self.address)
    }
}

/// Opened credentials for a session
pub enum SshAuth {
    Password(SecretString),

    /// Key material lives in a 0600 temp file for the life of the session
    PrivateKey(NamedTempFile),
}

impl SshAuth {
    pub fn private_key(key: &SecretString) -> Result<Self, OrchestratorError> {
        let mut file = NamedTempFile::new()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }
        let mut material = key.expose_secret().trim_end().to_string();
        material.push('\n');
        file.write_all(material.as_bytes())?;
        file.flush()?;
        Ok(SshAuth::PrivateKey(file))
    }
}

pub struct SshSession {
    target: SshTarget,
    control_path: PathBuf,
    auth: SshAuth,
    lock: Mutex<()>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .field("control_path", &self.control_path)
            .finish()
    }
}

impl SshSession {
    pub fn new(target: SshTarget, control_path: PathBuf, auth: SshAuth) -> Self {
        Self {
            target,
            control_path,
            auth,
            lock: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-o".into(),
            "StrictHostKeyChecking=accept-new".into(),
            "-o".into(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
        ]
    }

    /// Multiplexed client invocation of `program` (`ssh` or `scp`)
    fn client_command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(self.common_options());
        // the master already authenticated; never prompt
        cmd.args(["-o", "BatchMode=yes"]);
        cmd
    }

    /// Start the control master
    pub async fn connect(&self) -> Result<(), OrchestratorError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.control_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut cmd = match &self.auth {
            SshAuth::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh");
                cmd.env("SSHPASS", password.expose_secret());
                cmd.args(["-o", "PubkeyAuthentication=no"]);
                cmd.args(["-o", "PreferredAuthentications=password,keyboard-interactive"]);
                cmd
            }
            SshAuth::PrivateKey(key_file) => {
                let mut cmd = Command::new("ssh");
                cmd.arg("-i").arg(key_file.path());
                cmd.args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]);
                cmd
            }
        };
        cmd.args(self.common_options())
            .args(["-o", "ControlMaster=yes"])
            .arg("-o")
            .arg(format!("ControlPersist={}", CONTROL_PERSIST_SECS))
            .args(["-M", "-N", "-f"])
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg(self.target.destination());

        let output = run_streaming(cmd, None).await?;
        if !output.success() {
            let reason = tail_lines(output.stderr.trim(), 5);
            return Err(OrchestratorError::ConnectionError(format!(
                "ssh to {}:{} failed: {}",
                self.target.destination(),
                self.target.port,
                scrub_credentials(&reason)
            )));
        }
        info!(
            "Opened SSH session to {}:{}",
            self.target.destination(),
            self.target.port
        );
        Ok(())
    }

    /// Whether the control master still answers
    pub async fn is_alive(&self) -> bool {
        if tokio::fs::metadata(&self.control_path).await.is_err() {
            return false;
        }
        let mut cmd = self.client_command("ssh");
        cmd.args(["-O", "check"]).arg(self.target.destination());
        matches!(run_streaming(cmd, None).await, Ok(output) if output.success())
    }

    /// Stop the control master
    pub async fn close(&self) {
        let _guard = self.lock.lock().await;
        let mut cmd = self.client_command("ssh");
        cmd.args(["-O", "exit"]).arg(self.target.destination());
        match run_streaming(cmd, None).await {
            Ok(output) if output.success() => {
                debug!("Closed SSH session to {}", self.target.destination())
            }
            Ok(output) => warn!(
                "Closing SSH session to {} reported: {}",
                self.target.destination(),
                output.stderr.trim()
            ),
            Err(e) => warn!(
                "Failed to close SSH session to {}: {}",
                self.target.destination(),
                e
            ),
        }
    }

    fn remote_spec(&self, path: &str) -> String {
        format!("{}:{}", self.target.destination(), path)
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), OrchestratorError> {
        let _guard = self.lock.lock().await;
        let mut cmd = self.client_command("scp");
        cmd.arg("-q")
            .arg("-P")
            .arg(self.target.port.to_string())
            .arg(from)
            .arg(to);
        let output = run_streaming(cmd, None).await?;
        self.check_connection(&output)?;
        output
            .into_result(&format!("scp {} {}", from, to))
            .map(|_| ())
    }

    fn check_connection(&self, output: &ExecOutput) -> Result<(), OrchestratorError> {
        if output.exit_code == SSH_CONNECTION_FAILURE {
            return Err(OrchestratorError::ConnectionError(format!(
                "lost connection to {}: {}",
                self.target.destination(),
                scrub_credentials(&tail_lines(output.stderr.trim(), 5))
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Shell for SshSession {
    async fn execute(
        &self,
        command: &str,
        log: Option<&LogStream>,
    ) -> Result<ExecOutput, OrchestratorError> {
        let _guard = self.lock.lock().await;
        debug!("{}: {}", self.target.destination(), command_label(command));

        let mut cmd = self.client_command("ssh");
        cmd.arg("-p")
            .arg(self.target.port.to_string())
            .arg(self.target.destination())
            .arg("--")
            .arg(format!("bash -c {}", shell_quote(command)));

        let output = run_streaming(cmd, log).await?;
        self.check_connection(&output)?;
        Ok(output)
    }

    async fn fetch_file(&self, remote: &str, local: &Path) -> Result<(), OrchestratorError> {
        let local = local.to_string_lossy().to_string();
        self.copy(&self.remote_spec(remote), &local).await
    }

    async fn push_file(&self, local: &Path, remote: &str) -> Result<(), OrchestratorError> {
        let local = local.to_string_lossy().to_string();
        self.copy(&local, &self.remote_spec(remote)).await
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        self.target.destination()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key_written_with_trailing_newline() {
        let key = SecretString::from("-----BEGIN KEY-----\nabc\n-----END KEY-----".to_string());
        let auth = SshAuth::private_key(&key).unwrap();
        match auth {
            SshAuth::PrivateKey(file) => {
                let written = std::fs::read_to_string(file.path()).unwrap();
                assert!(written.ends_with("-----END KEY-----\n"));
                #[cfg(unix)]
                {
                    use std::os::unix::fs::MetadataExt;
                    let mode = std::fs::metadata(file.path()).unwrap().mode() & 0o777;
                    assert_eq!(mode, 0o600);
                }
            }
            SshAuth::Password(_) => panic!("expected key auth"),
        }
    }

    #[test]
    fn test_exit_255_is_connection_error() {
        let session = SshSession::new(
            SshTarget {
                address: "10.0.0.5".into(),
                port: 22,
                user: "root".into(),
            },
            PathBuf::from("/tmp/none.sock"),
            SshAuth::Password(SecretString::from("pw".to_string())),
        );
        let output = ExecOutput {
            stdout: String::new(),
            stderr: "ssh: connect to host 10.0.0.5 port 22: Connection refused".into(),
            exit_code: 255,
        };
        assert!(matches!(
            session.check_connection(&output),
            Err(OrchestratorError::ConnectionError(_))
        ));
        let ok = ExecOutput {
            exit_code: 1,
            ..output
        };
        assert!(session.check_connection(&ok).is_ok());
    }
}
