//! Remote command execution on nodes.

mod ssh;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::Zeroizing;

pub use ssh::OpenSsh;

use crate::host::HostTarget;

/// Password obtained from the operator. Never logged, wiped on drop.
#[derive(Clone)]
pub struct Secret(Zeroizing<String>);

impl Secret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Expose the secret for handing to the transport.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// How to authenticate remote sessions.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Private key the node already trusts.
    ExistingKey {
        /// Path to the private key.
        identity_file: PathBuf,
    },
    /// Password supplied out of band by the operator.
    PasswordPrompt(Secret),
}

/// Result of a remote command that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code of the remote command.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Whether the remote command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Failures of the transport itself (as opposed to the remote command).
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The host refused our credentials.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The host could not be reached.
    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// The command did not finish in time.
    #[error("remote command timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    /// The local transport program could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A program the transport needs is not installed.
    #[error("required program '{0}' not found in PATH")]
    ToolMissing(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Other(String),
}

/// Generic "run command on host as user with timeout" capability.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` on `host`, authenticating with `auth`.
    ///
    /// Returns `Ok` whenever the command itself ran, whatever its exit code.
    /// Dropping the returned future must tear the session down.
    async fn run(
        &self,
        host: &HostTarget,
        auth: &AuthMethod,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError>;

    /// Check that sessions with `auth` can be started at all, before any
    /// node is powered.
    ///
    /// # Errors
    /// Returns [`RemoteError::ToolMissing`] when a local program is absent.
    fn preflight(&self, _auth: &AuthMethod) -> Result<(), RemoteError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let auth = AuthMethod::PasswordPrompt(Secret::new("raspberry"));
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("raspberry"));
        assert!(rendered.contains("***"));
    }
}
