//! Error types for cluster lifecycle operations
//!
//! The taxonomy mirrors how failures are handled by the orchestrator:
//!
//! - provider "not found" is never an error (lookups return `Option`)
//! - transient failures are plain variants that retry loops log and swallow
//! - [`Error::RetryLimitReached`] and [`Error::Cancelled`] are terminal and are
//!   never retried by an enclosing loop
//! - [`Error::Step`] adds the name of the pipeline step that failed

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for cluster operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Cloud provider API returned an error
    #[error("provider error: {0}")]
    Provider(String),

    /// A resource exists (or is expected) but cannot be used yet
    #[error("not ready: {0}")]
    NotReady(String),

    /// Transport-level failure talking to the provider API
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote command execution failed
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A bounded retry budget was exhausted
    #[error("{operation}: retry limit reached after {attempts} attempts")]
    RetryLimitReached {
        /// Operation that was being retried
        operation: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// The run was cancelled by the operator
    #[error("{operation}: cancelled")]
    Cancelled {
        /// Operation that observed the cancellation
        operation: String,
    },

    /// Invalid configuration, detected before any resource is touched
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A provisioning step failed
    #[error("{step}: {source}")]
    Step {
        /// Human readable step name
        step: &'static str,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a not-ready error with the given message
    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a cancellation error for the given operation
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a retry-limit error for the given operation
    pub fn retry_limit(operation: impl Into<String>, attempts: u32) -> Self {
        Self::RetryLimitReached {
            operation: operation.into(),
            attempts,
        }
    }

    /// The innermost error, looking through step wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// True if the run was cancelled
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled { .. })
    }

    /// True if a bounded retry budget was exhausted
    pub fn is_retry_limit(&self) -> bool {
        matches!(self.root(), Error::RetryLimitReached { .. })
    }

    /// Standard error of a failed remote command, looking through step wrappers
    pub fn remote_stderr(&self) -> &str {
        match self.root() {
            Error::Remote(remote) => remote.stderr(),
            _ => "",
        }
    }

    /// Terminal errors stop every enclosing retry loop immediately
    pub fn is_terminal(&self) -> bool {
        self.is_cancelled() || self.is_retry_limit()
    }
}

/// Attach a step name to a failed result
pub trait StepContext<T> {
    /// Wrap the error as [`Error::Step`]
    fn step(self, step: &'static str) -> Result<T, Error>;
}

impl<T, E: Into<Error>> StepContext<T> for Result<T, E> {
    fn step(self, step: &'static str) -> Result<T, Error> {
        self.map_err(|e| Error::Step {
            step,
            source: Box::new(e.into()),
        })
    }
}

/// Failures of a single remote command execution
///
/// Every variant is distinguishable so callers can tell an unreachable host
/// from a script that ran and failed. Output captured before a failure is
/// preserved on [`RemoteError::NonZeroExit`].
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Private key file could not be read
    #[error("failed to read private key {}: {source}", path.display())]
    KeyRead {
        /// Key path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Private key could not be parsed
    #[error("failed to parse private key {}: {message}", path.display())]
    KeyParse {
        /// Key path
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// TCP/SSH handshake failed
    #[error("failed to connect to {address}: {message}")]
    Connect {
        /// Remote address
        address: String,
        /// Failure description
        message: String,
    },

    /// Server rejected the public key
    #[error("authentication as {user} rejected by {address}")]
    AuthRejected {
        /// Remote address
        address: String,
        /// Principal used
        user: String,
    },

    /// Channel or session level failure after authentication
    #[error("session error on {address}: {message}")]
    Session {
        /// Remote address
        address: String,
        /// Failure description
        message: String,
    },

    /// The command ran and exited with a non-zero status
    #[error("command exited with status {status} on {address}")]
    NonZeroExit {
        /// Remote address
        address: String,
        /// Exit status reported by the server
        status: u32,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },
}

impl RemoteError {
    /// Standard error captured from the remote command, if any
    pub fn stderr(&self) -> &str {
        match self {
            RemoteError::NonZeroExit { stderr, .. } => stderr,
            _ => "",
        }
    }
}
