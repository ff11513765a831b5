//! Remote execution channel: upload a file and run a command over SSH.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use russh_sftp::client::SftpSession;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::Config;

/// SSH extended-data stream number for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Keepalives detect a host that powered off under an open session.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const KEEPALIVE_MAX: usize = 3;
/// Upper bound on a silent session even if keepalives are answered.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("SSH connection failed: {0}")]
    Connect(String),

    #[error("SSH authentication rejected for user '{0}'")]
    Auth(String),

    #[error("SSH host key mismatch: expected {expected}, server offered {actual}")]
    HostKey { expected: String, actual: String },

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Remote command failed: {0}")]
    Command(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Key(#[from] russh_keys::Error),
}

/// Output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the channel closed without reporting an exit status.
    pub exit_code: Option<u32>,
    pub stdout: String,
    pub stderr: String,
}

/// Opens sessions against the remote host.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// One authenticated connection. Owned by a single shutdown run.
#[async_trait]
pub trait RemoteSession: Send {
    /// Copy `local` to `remote`, replacing any existing file.
    async fn upload_file(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError>;

    async fn run_command(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;

    async fn disconnect(&mut self) -> Result<(), RemoteError>;
}

#[derive(Clone)]
enum SshAuth {
    Password(String),
    Key(PathBuf),
}

/// [`RemoteConnector`] backed by russh.
#[derive(Clone)]
pub struct SshConnector {
    host: String,
    port: u16,
    username: String,
    auth: SshAuth,
    host_fingerprint: Option<String>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("host_fingerprint", &self.host_fingerprint)
            .finish_non_exhaustive()
    }
}

impl SshConnector {
    /// Key authentication wins when both a key file and a password are set.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let auth = match (&config.ssh_key_file, &config.ssh_password) {
            (Some(path), _) => SshAuth::Key(path.clone()),
            (None, Some(password)) => SshAuth::Password(password.clone()),
            (None, None) => anyhow::bail!("No SSH credentials configured"),
        };
        Ok(Self {
            host: config.ssh_host.clone(),
            port: config.ssh_port,
            username: config.ssh_username.clone(),
            auth,
            host_fingerprint: config.ssh_host_fingerprint.clone(),
            connect_timeout: config.ssh_connect_timeout,
        })
    }

    async fn open(&self) -> Result<client::Handle<HostKeyCheck>, RemoteError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(INACTIVITY_TIMEOUT),
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });
        let handler = HostKeyCheck {
            expected: self.host_fingerprint.clone(),
        };
        let mut handle = client::connect(config, (self.host.as_str(), self.port), handler)
            .await
            .map_err(|e| match e {
                RemoteError::Ssh(e) => RemoteError::Connect(format!("{}:{}: {e}", self.host, self.port)),
                other => other,
            })?;

        let authenticated = match &self.auth {
            SshAuth::Password(password) => {
                handle
                    .authenticate_password(self.username.as_str(), password.as_str())
                    .await?
            }
            SshAuth::Key(path) => {
                let key_pair = russh_keys::load_secret_key(path, None)?;
                handle
                    .authenticate_publickey(self.username.as_str(), Arc::new(key_pair))
                    .await?
            }
        };
        if !authenticated {
            return Err(RemoteError::Auth(self.username.clone()));
        }
        Ok(handle)
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        tracing::debug!(host = %self.host, port = self.port, user = %self.username, "Opening SSH session");
        let handle = tokio::time::timeout(self.connect_timeout, self.open())
            .await
            .map_err(|_| RemoteError::Timeout(self.connect_timeout))??;
        tracing::info!(host = %self.host, "SSH session established");
        Ok(Box::new(SshSession { handle }))
    }
}

/// Strip the `SHA256:` prefix and base64 padding so fingerprints copied from
/// `ssh-keygen -l` compare equal to russh's rendering.
fn normalize_fingerprint(fp: &str) -> &str {
    let fp = fp.trim();
    fp.strip_prefix("SHA256:").unwrap_or(fp).trim_end_matches('=')
}

struct HostKeyCheck {
    expected: Option<String>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = RemoteError;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let actual = server_public_key.fingerprint();
        match &self.expected {
            Some(expected)
                if normalize_fingerprint(expected) != normalize_fingerprint(&actual) =>
            {
                Err(RemoteError::HostKey {
                    expected: expected.clone(),
                    actual: format!("SHA256:{actual}"),
                })
            }
            Some(_) => Ok(true),
            None => {
                tracing::warn!(
                    fingerprint = %format!("SHA256:{actual}"),
                    "Accepting unpinned SSH host key; set SSH_HOST_FINGERPRINT to pin it"
                );
                Ok(true)
            }
        }
    }
}

struct SshSession {
    handle: client::Handle<HostKeyCheck>,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn upload_file(&mut self, local: &Path, remote: &str) -> Result<(), RemoteError> {
        let contents = tokio::fs::read(local)
            .await
            .map_err(|e| RemoteError::Upload(format!("reading {}: {e}", local.display())))?;

        let channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| RemoteError::Upload(format!("starting SFTP: {e}")))?;

        let mut file = sftp
            .create(remote)
            .await
            .map_err(|e| RemoteError::Upload(format!("creating {remote}: {e}")))?;
        file.write_all(&contents)
            .await
            .map_err(|e| RemoteError::Upload(format!("writing {remote}: {e}")))?;
        file.shutdown()
            .await
            .map_err(|e| RemoteError::Upload(format!("closing {remote}: {e}")))?;

        tracing::info!(bytes = contents.len(), remote = %remote, "Uploaded shutdown script");
        Ok(())
    }

    async fn run_command(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let mut channel = self.handle.channel_open_session().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| RemoteError::Command(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn disconnect(&mut self) -> Result<(), RemoteError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("SHA256:abc+/def"), "abc+/def");
        assert_eq!(normalize_fingerprint("abc+/def="), "abc+/def");
        assert_eq!(normalize_fingerprint("  SHA256:abc  "), "abc");
    }

    #[test]
    fn test_remote_error_messages() {
        let e = RemoteError::Auth("root".into());
        assert_eq!(e.to_string(), "SSH authentication rejected for user 'root'");
        let e = RemoteError::HostKey {
            expected: "SHA256:a".into(),
            actual: "SHA256:b".into(),
        };
        assert!(e.to_string().contains("expected SHA256:a"));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let connector = SshConnector {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "root".to_string(),
            auth: SshAuth::Password("secret".to_string()),
            host_fingerprint: None,
            connect_timeout: Duration::from_secs(5),
        };
        assert!(connector.connect().await.is_err());
    }

    #[test]
    fn test_debug_omits_credentials() {
        let connector = SshConnector {
            host: "esxi.local".to_string(),
            port: 22,
            username: "root".to_string(),
            auth: SshAuth::Password("hunter2".to_string()),
            host_fingerprint: None,
            connect_timeout: Duration::from_secs(5),
        };
        assert!(!format!("{connector:?}").contains("hunter2"));
    }
}
