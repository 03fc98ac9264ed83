//! Public key installation.
//!
//! The key is appended to `~/.ssh/authorized_keys` by a single POSIX `sh`
//! script executed over the remote transport. The script is idempotent (an
//! existing identical line is left alone) and replaces the file with an
//! atomic rename, so a concurrent `sshd` never reads a half-written file.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::host::HostTarget;
use crate::remote::{AuthMethod, RemoteError, RemoteExecutor};

/// Key types accepted as the first field of a public key line.
const KEY_TYPE_PREFIXES: [&str; 4] = ["ssh-", "ecdsa-sha2-", "sk-ssh-", "sk-ecdsa-"];

/// Printed by the install script when the key was already present.
const MARKER_PRESENT: &str = "clusterhat:present";

/// Printed by the install script after appending the key.
const MARKER_INSTALLED: &str = "clusterhat:installed";

/// Remote install script. `$1` is the public key line.
const INSTALL_SCRIPT: &str = r#"umask 077
k="$1"
d="$HOME/.ssh"
f="$d/authorized_keys"
mkdir -p "$d" && chmod 700 "$d" || exit 10
[ -f "$f" ] || : > "$f" || exit 11
if grep -qxF -- "$k" "$f"; then
  echo clusterhat:present
  exit 0
fi
t=$(mktemp "$d/.authorized_keys.XXXXXX") || exit 12
if cat "$f" > "$t" \
  && { [ ! -s "$t" ] || [ -z "$(tail -c 1 "$t")" ] || printf '\n' >> "$t"; } \
  && printf '%s\n' "$k" >> "$t" \
  && chmod 600 "$t" \
  && mv -f "$t" "$f"; then
  echo clusterhat:installed
  exit 0
fi
rm -f "$t"
exit 13
"#;

/// A validated single-line OpenSSH public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicCredential(String);

impl PublicCredential {
    /// Validate a public key line.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidPublicKey`] if the text is not a single
    /// `<type> <base64> [comment]` line.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let line = text.trim();
        let invalid = |reason: &str| ConfigError::InvalidPublicKey(reason.to_string());

        if line.is_empty() {
            return Err(invalid("key is empty"));
        }
        if line.contains('\n') || line.contains('\r') {
            return Err(invalid("key must be a single line"));
        }
        if line.chars().any(|c| c.is_control() && c != '\t') {
            return Err(invalid("key contains control characters"));
        }
        if line.contains("PRIVATE KEY") {
            return Err(invalid("this is a private key"));
        }

        let mut fields = line.split_whitespace();
        let key_type = fields.next().unwrap_or_default();
        let blob = fields.next().unwrap_or_default();

        if !KEY_TYPE_PREFIXES.iter().any(|p| key_type.starts_with(p)) {
            return Err(invalid("unrecognised key type"));
        }
        let blob_ok = !blob.is_empty()
            && blob
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='));
        if !blob_ok {
            return Err(invalid("key data is not base64"));
        }

        Ok(Self(line.to_string()))
    }

    /// Read and validate a `.pub` file.
    ///
    /// # Errors
    /// Returns [`ConfigError::PublicKeyUnreadable`] or
    /// [`ConfigError::InvalidPublicKey`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::PublicKeyUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// The key line.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Comment field, if any (usually `user@host`).
    #[must_use]
    pub fn comment(&self) -> Option<&str> {
        let mut fields = self.0.splitn(3, char::is_whitespace);
        fields.nth(2).map(str::trim).filter(|c| !c.is_empty())
    }
}

/// Why installation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialErrorKind {
    /// The node refused the supplied credentials.
    AuthRejected,
    /// The node could not be reached.
    HostUnreachable,
    /// Anything else.
    Other,
}

/// Credential installation failure.
#[derive(Error, Debug)]
#[error("{kind:?}: {message}")]
pub struct CredentialError {
    /// Failure class.
    pub kind: CredentialErrorKind,
    /// Human readable detail.
    pub message: String,
}

impl CredentialError {
    fn new(kind: CredentialErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<RemoteError> for CredentialError {
    fn from(err: RemoteError) -> Self {
        let kind = match &err {
            RemoteError::AuthRejected(_) => CredentialErrorKind::AuthRejected,
            RemoteError::Unreachable(_) | RemoteError::TimedOut(_) => {
                CredentialErrorKind::HostUnreachable
            }
            RemoteError::Spawn { .. } | RemoteError::ToolMissing(_) | RemoteError::Other(_) => {
                CredentialErrorKind::Other
            }
        };
        Self::new(kind, err.to_string())
    }
}

/// Successful installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Installed {
    /// The key was already authorized; nothing was written.
    pub already_present: bool,
}

/// Remote command line that installs `key`.
#[must_use]
pub fn install_command(key: &PublicCredential) -> String {
    format!(
        "sh -c {} clusterhat-install {}",
        quote(INSTALL_SCRIPT),
        quote(key.as_str())
    )
}

/// Quote one shell word. Only NUL bytes make `shlex` refuse, and neither the
/// script nor a validated key contains one.
fn quote(word: &str) -> String {
    shlex::try_quote(word).map_or_else(
        |_| format!("'{}'", word.replace('\0', "").replace('\'', r"'\''")),
        std::borrow::Cow::into_owned,
    )
}

/// Install `key` for the login user of `host`.
///
/// # Errors
/// Returns [`CredentialError`] when the session cannot be established or the
/// install script fails. Nothing is written in that case.
pub async fn install_credential(
    remote: &dyn RemoteExecutor,
    host: &HostTarget,
    key: &PublicCredential,
    auth: &AuthMethod,
    timeout: Duration,
) -> Result<Installed, CredentialError> {
    info!(host = %host, key = key.comment().unwrap_or("<no comment>"), "Installing public key");

    let output = remote
        .run(host, auth, &install_command(key), timeout)
        .await?;

    if output.success() && output.stdout.contains(MARKER_PRESENT) {
        info!(host = %host, "Public key already authorized");
        return Ok(Installed {
            already_present: true,
        });
    }
    if output.success() && output.stdout.contains(MARKER_INSTALLED) {
        info!(host = %host, "Public key installed");
        return Ok(Installed {
            already_present: false,
        });
    }

    warn!(
        host = %host,
        exit_code = ?output.exit_code,
        stderr = %output.stderr.trim(),
        "Key install script failed"
    );
    Err(CredentialError::new(
        CredentialErrorKind::Other,
        format!(
            "install script exited with {:?}: {}",
            output.exit_code,
            output.stderr.trim()
        ),
    ))
}
