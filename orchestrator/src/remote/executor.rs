//! Session registry keyed by host id

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::OrchestratorError;
use crate::models::host::{AuthMethod, Host};
use crate::remote::local::LocalShell;
use crate::remote::ssh::{SshAuth, SshSession, SshTarget};
use crate::remote::{Shell, ShellProvider};
use crate::utils::sha256_hex;
use crate::vault::CredentialVault;

/// Per-host slot; held while the session is checked or (re)connected
type SessionSlot = Arc<Mutex<Option<Arc<SshSession>>>>;

/// Owns one live SSH session per host. The registry lock only guards slot
/// lookup, so a slow host never stalls the others.
pub struct RemoteExecutor {
    vault: CredentialVault,
    control_dir: PathBuf,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    local: Arc<LocalShell>,
}

impl RemoteExecutor {
    pub fn new(vault: CredentialVault, control_dir: impl Into<PathBuf>) -> Self {
        Self {
            vault,
            control_dir: control_dir.into(),
            sessions: Mutex::new(HashMap::new()),
            local: Arc::new(LocalShell::new()),
        }
    }

    /// Socket paths must stay short (sun_path is ~104 bytes)
    fn control_path(&self, host_id: &str) -> PathBuf {
        self.control_dir
            .join(format!("{}.sock", &sha256_hex(host_id.as_bytes())[..16]))
    }

    async fn slot(&self, host_id: &str) -> SessionSlot {
        self.sessions
            .lock()
            .await
            .entry(host_id.to_string())
            .or_default()
            .clone()
    }

    /// Live session for `host`, reused while its control master answers.
    /// Concurrent callers for the same host share one connect.
    pub async fn connect(&self, host: &Host) -> Result<Arc<SshSession>, OrchestratorError> {
        let slot = self.slot(&host.id).await;
        let mut current = slot.lock().await;

        if let Some(session) = current.take() {
            if session.target().address == host.connection.address && session.is_alive().await {
                *current = Some(session.clone());
                return Ok(session);
            }
            debug!("Discarding stale session for host {}", host.id);
            session.close().await;
        }

        let secret = self.vault.open(&host.connection.encrypted_secret)?;
        let auth = match host.connection.auth_method {
            AuthMethod::Password => SshAuth::Password(secret),
            AuthMethod::PrivateKey => SshAuth::private_key(&secret)?,
        };
        let target = SshTarget {
            address: host.connection.address.clone(),
            port: host.connection.port,
            user: host.connection.user.clone(),
        };

        let session = Arc::new(SshSession::new(target, self.control_path(&host.id), auth));
        session.connect().await?;
        *current = Some(session.clone());
        Ok(session)
    }

    pub async fn disconnect(&self, host_id: &str) {
        let slot = self.sessions.lock().await.remove(host_id);
        if let Some(slot) = slot {
            if let Some(session) = slot.lock().await.take() {
                session.close().await;
            }
        }
    }

    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (host_id, slot) in drained {
            if let Some(session) = slot.lock().await.take() {
                debug!("Closing session for host {}", host_id);
                session.close().await;
            }
        }
        info!("Closed all SSH sessions");
    }

    pub async fn session_count(&self) -> usize {
        let slots: Vec<SessionSlot> = self.sessions.lock().await.values().cloned().collect();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }
}

#[async_trait]
impl ShellProvider for RemoteExecutor {
    async fn shell(&self, host: Option<&Host>) -> Result<Arc<dyn Shell>, OrchestratorError> {
        match host {
            Some(host) => {
                let session: Arc<dyn Shell> = self.connect(host).await?;
                Ok(session)
            }
            None => {
                let local: Arc<dyn Shell> = self.local.clone();
                Ok(local)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::AesGcmCipher;

    #[tokio::test]
    async fn test_hostless_resolves_to_local_shell() {
        let vault = CredentialVault::new(Arc::new(AesGcmCipher::new(&[1u8; 32]).unwrap()));
        let executor = RemoteExecutor::new(vault, "/tmp/dockhand-test-ssh");
        let shell = executor.shell(None).await.unwrap();
        assert!(!shell.is_remote());
        assert_eq!(executor.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_busy_host_does_not_block_other_hosts() {
        let vault = CredentialVault::new(Arc::new(AesGcmCipher::new(&[1u8; 32]).unwrap()));
        let executor = RemoteExecutor::new(vault, "/tmp/dockhand-test-ssh");

        let slow = executor.slot("host-a").await;
        let _connecting = slow.lock().await;

        let other = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            let slot = executor.slot("host-b").await;
            let guard = slot.lock().await;
            guard.is_none()
        })
        .await;
        assert_eq!(other.ok(), Some(true));
        assert!(Arc::ptr_eq(&slow, &executor.slot("host-a").await));

        let local = tokio::time::timeout(std::time::Duration::from_secs(1), executor.shell(None)).await;
        assert!(local.is_ok());
    }

    #[test]
    fn test_control_path_is_short_and_stable() {
        let vault = CredentialVault::new(Arc::new(AesGcmCipher::new(&[1u8; 32]).unwrap()));
        let executor = RemoteExecutor::new(vault, "/var/lib/dockhand/ssh");
        let a = executor.control_path("0b9f2c1e-5d4a-4c1b-9e7f-1234567890ab");
        let b = executor.control_path("0b9f2c1e-5d4a-4c1b-9e7f-1234567890ab");
        assert_eq!(a, b);
        assert!(a.to_string_lossy().len() < 100);
    }
}
