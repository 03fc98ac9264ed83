//! `clusterctrl` command line client.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::models::{Ack, Auxiliary, BoardError, BoardStatus, Switch};
use super::BoardController;
use crate::config::BoardConfig;
use crate::host::NodeLabel;

/// Default controller binary.
pub const DEFAULT_COMMAND: &str = "clusterctrl";

/// Default timeout for a single controller command.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Board controller backed by the `clusterctrl` tool.
#[derive(Debug, Clone)]
pub struct ClusterCtrl {
    /// Program plus leading arguments (e.g. `["sudo", "clusterctrl"]`).
    program: Vec<String>,
    /// Upper bound for one invocation.
    timeout: Duration,
}

impl Default for ClusterCtrl {
    fn default() -> Self {
        Self {
            program: vec![DEFAULT_COMMAND.to_string()],
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ClusterCtrl {
    /// Create a client for the given command line prefix.
    ///
    /// The prefix is split shell-style, so `"sudo clusterctrl"` works. An
    /// empty or unparsable prefix falls back to plain `clusterctrl`.
    #[must_use]
    pub fn new(command: &str) -> Self {
        let program = shlex::split(command)
            .filter(|parts| !parts.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_COMMAND.to_string()]);
        Self {
            program,
            ..Self::default()
        }
    }

    /// Create a client from the `board` config section.
    #[must_use]
    pub fn from_config(config: &BoardConfig) -> Self {
        Self::new(&config.command).with_timeout(Duration::from_secs(config.timeout_secs))
    }

    /// Set the per-command timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command_line(&self, args: &[&str]) -> String {
        self.program
            .iter()
            .map(String::as_str)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Execute one controller command.
    async fn run(&self, args: &[&str]) -> Result<Ack, BoardError> {
        let command = self.command_line(args);
        debug!(command = %command, "Executing board command");

        let (program, leading) = self
            .program
            .split_first()
            .map_or((DEFAULT_COMMAND, &[][..]), |(p, rest)| (p.as_str(), rest));

        let child = tokio::process::Command::new(program)
            .args(leading)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| BoardError::TimedOut {
                command: command.clone(),
                timeout: self.timeout,
            })?
            .map_err(|source| BoardError::Spawn {
                command: command.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(Ack {
                output: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            })
        } else {
            Err(BoardError::CommandFailed {
                command,
                exit_status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl BoardController for ClusterCtrl {
    async fn power_on(&self, label: &NodeLabel) -> Result<Ack, BoardError> {
        info!(node = %label, "Powering on node");
        self.run(&["on", label.as_str()]).await
    }

    async fn power_off(&self, label: &NodeLabel) -> Result<Ack, BoardError> {
        info!(node = %label, "Powering off node");
        self.run(&["off", label.as_str()]).await
    }

    async fn power_all(&self, state: Switch) -> Result<Ack, BoardError> {
        info!(state = %state, "Switching all nodes");
        let state = state.to_string();
        self.run(&[state.as_str(), "all"]).await
    }

    async fn set_auxiliary(&self, aux: Auxiliary, state: Switch) -> Result<Ack, BoardError> {
        info!(auxiliary = %aux, state = %state, "Switching auxiliary");
        let state = state.to_string();
        self.run(&[aux.as_str(), state.as_str()]).await
    }

    async fn status(&self) -> Result<BoardStatus, BoardError> {
        let ack = self.run(&["status"]).await?;
        Ok(BoardStatus::parse(&ack.output))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::board::PowerState;

    /// Write a fake `clusterctrl` that logs its arguments and fails on `p9`.
    fn fake_clusterctrl(dir: &Path) -> ClusterCtrl {
        let script = dir.join("clusterctrl.sh");
        let log = dir.join("calls.log");
        let body = format!(
            r#"echo "$*" >> '{log}'
case "$*" in
  "on p9") echo "no such node" >&2; exit 3 ;;
  status) printf 'hat_version:2.3\np1:1\np2:0\nfan:1\n' ;;
  "slow") sleep 5 ;;
esac
exit 0
"#,
            log = log.display()
        );
        std::fs::write(&script, body).unwrap();
        ClusterCtrl::new(&format!("sh {}", script.display()))
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_power_and_auxiliary_commands() {
        let dir = tempfile::tempdir().unwrap();
        let board = fake_clusterctrl(dir.path());
        let p1 = NodeLabel::parse("p1").unwrap();

        board.power_on(&p1).await.unwrap();
        board.power_off(&p1).await.unwrap();
        board.set_auxiliary(Auxiliary::Fan, Switch::On).await.unwrap();
        board.power_all(Switch::Off).await.unwrap();

        assert_eq!(calls(dir.path()), vec!["on p1", "off p1", "fan on", "off all"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_board_error() {
        let dir = tempfile::tempdir().unwrap();
        let board = fake_clusterctrl(dir.path());

        let err = board
            .power_on(&NodeLabel::parse("p9").unwrap())
            .await
            .unwrap_err();

        match err {
            BoardError::CommandFailed {
                exit_status, stderr, ..
            } => {
                assert_eq!(exit_status, Some(3));
                assert_eq!(stderr, "no such node");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_status_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let board = fake_clusterctrl(dir.path());

        let status = board.status().await.unwrap();
        assert_eq!(status.node_power(&NodeLabel::parse("p1").unwrap()), PowerState::On);
        assert_eq!(status.auxiliary(Auxiliary::Fan), Some(PowerState::On));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let board = ClusterCtrl::new("/nonexistent/clusterctrl");
        let err = board.status().await.unwrap_err();
        assert!(matches!(err, BoardError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let board = fake_clusterctrl(dir.path()).with_timeout(Duration::from_millis(200));

        let err = board.run(&["slow"]).await.unwrap_err();
        assert!(matches!(err, BoardError::TimedOut { .. }));
    }

    #[test]
    fn test_command_prefix_parsing() {
        let board = ClusterCtrl::new("sudo clusterctrl");
        assert_eq!(board.command_line(&["on", "p1"]), "sudo clusterctrl on p1");

        let fallback = ClusterCtrl::new("  ");
        assert_eq!(fallback.command_line(&["status"]), "clusterctrl status");
    }
}
