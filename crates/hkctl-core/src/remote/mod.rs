//! Remote command execution
//!
//! Every command runs in a fresh SSH session as a given user. Commands are
//! shipped base64-encoded and piped into `sudo bash` so multi-line scripts
//! need no quoting.

mod ssh;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};

#[cfg(test)]
use mockall::automock;

pub use ssh::{SshExecutor, SSH_PORT};

use crate::Result;

/// Output of a command that exited successfully
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// Runs one command on one host
///
/// A non-zero exit is an error ([`crate::RemoteError::NonZeroExit`]) that
/// still carries the captured output.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `address` authenticating as `user`
    async fn execute(&self, address: &str, user: &str, command: &str) -> Result<RemoteOutput>;
}

/// Wrap a script so it survives the remote shell unchanged
pub fn encode_command(command: &str) -> String {
    format!("echo {} | base64 -d | sudo bash", STANDARD.encode(command))
}
