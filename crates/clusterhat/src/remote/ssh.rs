//! OpenSSH-backed executor.
//!
//! Key authentication runs `ssh` in batch mode. Password authentication wraps
//! it in `sshpass -e`, which reads the password from `SSHPASS` so it never
//! shows up in the process list.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{AuthMethod, CommandOutput, RemoteError, RemoteExecutor};
use crate::host::HostTarget;

/// Exit status `ssh` uses for its own failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// `sshpass` exit status for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// `sshpass` exit status for an unknown host key.
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;

const UNREACHABLE_MARKERS: [&str; 8] = [
    "Connection refused",
    "Connection timed out",
    "timed out",
    "No route to host",
    "Could not resolve hostname",
    "Network is unreachable",
    "Host is down",
    "Connection closed",
];

const AUTH_MARKERS: [&str; 2] = ["Permission denied", "Too many authentication failures"];

/// Remote executor using the system `ssh` client.
#[derive(Debug, Clone)]
pub struct OpenSsh {
    ssh_program: String,
    sshpass_program: String,
}

impl Default for OpenSsh {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenSsh {
    /// Executor using `ssh` and `sshpass` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            sshpass_program: "sshpass".to_string(),
        }
    }

    /// Override the `ssh` binary.
    #[must_use]
    pub fn with_ssh_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// Override the `sshpass` binary.
    #[must_use]
    pub fn with_sshpass_program(mut self, program: impl Into<String>) -> Self {
        self.sshpass_program = program.into();
        self
    }

    /// Arguments passed to `ssh` (not including the program itself).
    fn ssh_args(host: &HostTarget, auth: &AuthMethod, command: &str, timeout: Duration) -> Vec<String> {
        let connect_timeout = timeout.as_secs().max(1);
        let mut args = vec![
            "-p".to_string(),
            host.port.to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={connect_timeout}"),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];

        match auth {
            AuthMethod::ExistingKey { identity_file } => {
                args.extend([
                    "-i".to_string(),
                    identity_file.display().to_string(),
                    "-o".to_string(),
                    "BatchMode=yes".to_string(),
                    "-o".to_string(),
                    "IdentitiesOnly=yes".to_string(),
                ]);
            }
            AuthMethod::PasswordPrompt(_) => {
                args.extend([
                    "-o".to_string(),
                    "PreferredAuthentications=password,keyboard-interactive".to_string(),
                    "-o".to_string(),
                    "PubkeyAuthentication=no".to_string(),
                    "-o".to_string(),
                    "NumberOfPasswordPrompts=1".to_string(),
                ]);
            }
        }

        args.push(format!("{}@{}", host.username, host.address));
        args.push(command.to_string());
        args
    }

    fn build_command(
        &self,
        host: &HostTarget,
        auth: &AuthMethod,
        command: &str,
        timeout: Duration,
    ) -> tokio::process::Command {
        let ssh_args = Self::ssh_args(host, auth, command, timeout);

        let mut cmd = match auth {
            AuthMethod::ExistingKey { .. } => tokio::process::Command::new(&self.ssh_program),
            AuthMethod::PasswordPrompt(secret) => {
                let mut cmd = tokio::process::Command::new(&self.sshpass_program);
                cmd.arg("-e").arg(&self.ssh_program).env("SSHPASS", secret.expose());
                cmd
            }
        };

        cmd.args(ssh_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn program_name(&self, auth: &AuthMethod) -> &str {
        match auth {
            AuthMethod::ExistingKey { .. } => &self.ssh_program,
            AuthMethod::PasswordPrompt(_) => &self.sshpass_program,
        }
    }
}

/// Map a transport-level exit into an error, or `None` if the remote command
/// itself produced the exit code.
fn classify_failure(exit_code: Option<i32>, stderr: &str, via_sshpass: bool) -> Option<RemoteError> {
    let detail = || stderr.trim().to_string();

    match exit_code {
        Some(SSHPASS_BAD_PASSWORD) if via_sshpass => Some(RemoteError::AuthRejected(detail())),
        Some(SSHPASS_HOST_KEY_UNKNOWN) if via_sshpass => Some(RemoteError::Other(format!(
            "host key not accepted: {}",
            detail()
        ))),
        Some(SSH_TRANSPORT_FAILURE) => {
            if AUTH_MARKERS.iter().any(|m| stderr.contains(m)) {
                Some(RemoteError::AuthRejected(detail()))
            } else if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
                Some(RemoteError::Unreachable(detail()))
            } else {
                Some(RemoteError::Other(detail()))
            }
        }
        None => Some(RemoteError::Other(format!(
            "transport killed by signal: {}",
            detail()
        ))),
        Some(_) => None,
    }
}

#[async_trait]
impl RemoteExecutor for OpenSsh {
    async fn run(
        &self,
        host: &HostTarget,
        auth: &AuthMethod,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, RemoteError> {
        debug!(host = %host, timeout_secs = timeout.as_secs(), "Running remote command");

        let child = self.build_command(host, auth, command, timeout).output();
        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| RemoteError::TimedOut(timeout))?
            .map_err(|source| RemoteError::Spawn {
                program: self.program_name(auth).to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        let via_sshpass = matches!(auth, AuthMethod::PasswordPrompt(_));
        if let Some(err) = classify_failure(exit_code, &stderr, via_sshpass) {
            debug!(host = %host, error = %err, "Remote transport failed");
            return Err(err);
        }

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn preflight(&self, auth: &AuthMethod) -> Result<(), RemoteError> {
        let mut required = vec![self.ssh_program.as_str()];
        if matches!(auth, AuthMethod::PasswordPrompt(_)) {
            required.push(self.sshpass_program.as_str());
        }
        for program in required {
            let path = which::which(program).map_err(|_| RemoteError::ToolMissing(program.to_string()))?;
            debug!(program, path = %path.display(), "Found transport program");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::remote::Secret;

    fn host() -> HostTarget {
        HostTarget {
            address: "172.19.181.1".into(),
            username: "pi".into(),
            port: 22,
        }
    }

    #[test]
    fn test_key_auth_args() {
        let auth = AuthMethod::ExistingKey {
            identity_file: PathBuf::from("/home/pi/.ssh/id_rsa"),
        };
        let args = OpenSsh::ssh_args(&host(), &auth, "echo up", Duration::from_secs(5));

        assert!(args.windows(2).any(|w| w == ["-i", "/home/pi/.ssh/id_rsa"]));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert_eq!(args[args.len() - 2], "pi@172.19.181.1");
        assert_eq!(args[args.len() - 1], "echo up");
    }

    #[test]
    fn test_password_auth_keeps_secret_off_argv() {
        let auth = AuthMethod::PasswordPrompt(Secret::new("hunter2"));
        let args = OpenSsh::ssh_args(&host(), &auth, "true", Duration::from_millis(300));

        assert!(args.iter().all(|a| !a.contains("hunter2")));
        assert!(args.contains(&"PubkeyAuthentication=no".to_string()));
        assert!(args.contains(&"ConnectTimeout=1".to_string()));
    }

    #[test]
    fn test_failure_classification() {
        assert!(matches!(
            classify_failure(Some(255), "pi@p1.local: Permission denied (publickey,password).", false),
            Some(RemoteError::AuthRejected(_))
        ));
        assert!(matches!(
            classify_failure(Some(255), "ssh: connect to host p1.local port 22: Connection refused", false),
            Some(RemoteError::Unreachable(_))
        ));
        assert!(matches!(
            classify_failure(Some(255), "ssh: Could not resolve hostname p1.local", false),
            Some(RemoteError::Unreachable(_))
        ));
        assert!(matches!(
            classify_failure(Some(5), "", true),
            Some(RemoteError::AuthRejected(_))
        ));
        assert!(matches!(
            classify_failure(Some(255), "Host key verification failed.", false),
            Some(RemoteError::Other(_))
        ));
    }

    #[test]
    fn test_remote_exit_codes_pass_through() {
        assert!(classify_failure(Some(0), "", false).is_none());
        assert!(classify_failure(Some(1), "grep: no match", false).is_none());
        // sshpass codes only mean something when sshpass is in the loop
        assert!(classify_failure(Some(5), "", false).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_preflight_requires_sshpass_for_password_auth() {
        let ssh = OpenSsh::new()
            .with_ssh_program("sh")
            .with_sshpass_program("clusterhat-no-such-sshpass");

        let key = AuthMethod::ExistingKey {
            identity_file: PathBuf::from("/home/pi/.ssh/id_rsa"),
        };
        assert!(ssh.preflight(&key).is_ok());

        let password = AuthMethod::PasswordPrompt(Secret::new("raspberry"));
        match ssh.preflight(&password) {
            Err(RemoteError::ToolMissing(program)) => assert_eq!(program, "clusterhat-no-such-sshpass"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_preflight_requires_ssh() {
        let ssh = OpenSsh::new().with_ssh_program("clusterhat-no-such-ssh");
        let key = AuthMethod::ExistingKey {
            identity_file: PathBuf::from("/home/pi/.ssh/id_rsa"),
        };
        assert!(matches!(ssh.preflight(&key), Err(RemoteError::ToolMissing(_))));
    }
}
