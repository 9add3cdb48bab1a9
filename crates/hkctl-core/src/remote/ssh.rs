//! SSH implementation of [`RemoteExecutor`]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tracing::debug;

use super::{encode_command, RemoteExecutor, RemoteOutput};
use crate::{RemoteError, Result};

/// Port every server accepts SSH on
pub const SSH_PORT: u16 = 22;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STDERR_STREAM: u32 = 1;

/// Accepts whatever host key the server presents.
///
/// Servers are contacted seconds after creation with a provider-generated
/// host key that cannot be known in advance.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens a new authenticated session for every command
pub struct SshExecutor {
    private_key: PathBuf,
    config: Arc<client::Config>,
}

impl SshExecutor {
    /// Executor authenticating with the key at `private_key`
    pub fn new(private_key: impl Into<PathBuf>) -> Self {
        Self {
            private_key: private_key.into(),
            config: Arc::new(client::Config::default()),
        }
    }

    async fn connect(
        &self,
        address: &str,
        user: &str,
        key: KeyPair,
    ) -> std::result::Result<client::Handle<AcceptAnyHostKey>, RemoteError> {
        let connect = client::connect(self.config.clone(), (address, SSH_PORT), AcceptAnyHostKey);

        let mut session = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| RemoteError::Connect {
                address: address.to_string(),
                message: format!("timed out after {:?}", CONNECT_TIMEOUT),
            })?
            .map_err(|e| RemoteError::Connect {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        let accepted = session
            .authenticate_publickey(user, Arc::new(key))
            .await
            .map_err(|e| RemoteError::Connect {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        if !accepted {
            return Err(RemoteError::AuthRejected {
                address: address.to_string(),
                user: user.to_string(),
            });
        }

        Ok(session)
    }
}

async fn load_key(path: &Path) -> std::result::Result<KeyPair, RemoteError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RemoteError::KeyRead {
            path: path.to_path_buf(),
            source,
        })?;

    russh_keys::decode_secret_key(&text, None).map_err(|e| RemoteError::KeyParse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

async fn run(
    session: &client::Handle<AcceptAnyHostKey>,
    address: &str,
    command: &str,
) -> std::result::Result<RemoteOutput, RemoteError> {
    let session_error = |e: russh::Error| RemoteError::Session {
        address: address.to_string(),
        message: e.to_string(),
    };

    let mut channel = session.channel_open_session().await.map_err(session_error)?;
    channel
        .exec(true, encode_command(command))
        .await
        .map_err(session_error)?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_status = None;

    while let Some(message) = channel.wait().await {
        match message {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_STREAM => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
            _ => {}
        }
    }

    let stdout = String::from_utf8_lossy(&stdout).into_owned();
    let stderr = String::from_utf8_lossy(&stderr).into_owned();
    debug!(address = %address, stdout = %stdout, stderr = %stderr, "Remote command output");

    match exit_status {
        Some(0) => Ok(RemoteOutput { stdout, stderr }),
        Some(status) => Err(RemoteError::NonZeroExit {
            address: address.to_string(),
            status,
            stdout,
            stderr,
        }),
        None => Err(RemoteError::Session {
            address: address.to_string(),
            message: format!("channel closed without exit status (stderr: {})", stderr.trim()),
        }),
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(&self, address: &str, user: &str, command: &str) -> Result<RemoteOutput> {
        debug!(address = %address, user = %user, bytes = command.len(), "Executing remote command");

        let key = load_key(&self.private_key).await?;
        let session = self.connect(address, user, key).await?;
        let result = run(&session, address, command).await;

        if let Err(e) = session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(address = %address, error = %e, "Disconnect failed");
        }

        Ok(result?)
    }
}
