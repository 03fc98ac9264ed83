//! Bounded-wait reachability probing.
//!
//! A freshly powered node needs tens of seconds to boot. The prober runs a
//! trivial remote command at a fixed interval until it succeeds or the
//! overall deadline passes. The interval does not grow: boot time dominates,
//! so backing off would only delay detection.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::host::HostTarget;
use crate::remote::{AuthMethod, RemoteError, RemoteExecutor};

/// Command run against the node on every attempt.
pub const PROBE_COMMAND: &str = "echo up";

/// Expected output of [`PROBE_COMMAND`].
const PROBE_MARKER: &str = "up";

/// Timing of one reachability wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Hard limit for a single attempt.
    pub per_attempt_timeout: Duration,
    /// Total time to keep trying.
    pub overall_deadline: Duration,
    /// Pause between failed attempts.
    pub poll_interval: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            per_attempt_timeout: Duration::from_secs(5),
            overall_deadline: Duration::from_secs(120),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// The node answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reachable {
    /// Time from the first attempt until success.
    pub elapsed: Duration,
    /// Number of attempts made, including the successful one.
    pub attempts: u32,
}

/// Why a reachability wait ended without success.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The overall deadline passed.
    #[error(
        "host did not respond within {}s ({attempts} attempts){}",
        .elapsed.as_secs(),
        last_error_suffix(.last_error)
    )]
    TimedOut {
        elapsed: Duration,
        attempts: u32,
        /// Failure of the final attempt.
        last_error: Option<String>,
    },

    /// An attempt failed in a way retrying cannot fix: the host refused the
    /// credentials, or the local transport could not be started.
    #[error("reachability check refused: {reason}")]
    Refused {
        elapsed: Duration,
        attempts: u32,
        reason: String,
    },

    /// The caller cancelled the wait.
    #[error("reachability wait cancelled after {}s", .elapsed.as_secs())]
    Cancelled { elapsed: Duration },
}

#[allow(clippy::ref_option)]
fn last_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_deref()
        .map(|e| format!("; last error: {e}"))
        .unwrap_or_default()
}

impl ProbeError {
    /// Time spent waiting.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match self {
            Self::TimedOut { elapsed, .. }
            | Self::Refused { elapsed, .. }
            | Self::Cancelled { elapsed } => *elapsed,
        }
    }
}

/// Poll `host` until it runs [`PROBE_COMMAND`] successfully.
///
/// Each attempt is bounded by the per-attempt timeout, clamped so no attempt
/// or sleep runs past the overall deadline. Cancellation is honoured at any
/// point; the in-flight attempt is dropped, which kills its session.
///
/// Connection failures are retried. A rejected login or a transport that
/// cannot be started ends the wait at once.
///
/// # Errors
/// [`ProbeError::TimedOut`] once the deadline passes,
/// [`ProbeError::Refused`] for non-retryable failures,
/// [`ProbeError::Cancelled`] if `cancel` fires first.
pub async fn await_reachable(
    remote: &dyn RemoteExecutor,
    host: &HostTarget,
    auth: &AuthMethod,
    settings: ProbeSettings,
    cancel: &CancellationToken,
) -> Result<Reachable, ProbeError> {
    let start = Instant::now();
    let deadline = start + settings.overall_deadline;
    let mut attempts = 0u32;
    let mut last_error: Option<String> = None;

    info!(
        host = %host,
        deadline_secs = settings.overall_deadline.as_secs(),
        "Waiting for host to become reachable"
    );

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ProbeError::TimedOut {
                elapsed: now - start,
                attempts,
                last_error,
            });
        }

        attempts += 1;
        let attempt_timeout = settings.per_attempt_timeout.min(deadline - now);
        let attempt = remote.run(host, auth, PROBE_COMMAND, attempt_timeout);

        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ProbeError::Cancelled { elapsed: start.elapsed() });
            }
            result = tokio::time::timeout(attempt_timeout, attempt) => result,
        };

        match result {
            Ok(Ok(output)) if output.success() && output.stdout.contains(PROBE_MARKER) => {
                let elapsed = start.elapsed();
                info!(host = %host, attempts, elapsed_secs = elapsed.as_secs(), "Host is reachable");
                return Ok(Reachable { elapsed, attempts });
            }
            Ok(Ok(output)) => {
                debug!(host = %host, attempt = attempts, exit_code = ?output.exit_code, "Probe command failed");
                last_error = Some(format!(
                    "probe command exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ));
            }
            Ok(Err(
                e @ (RemoteError::AuthRejected(_)
                | RemoteError::Spawn { .. }
                | RemoteError::ToolMissing(_)),
            )) => {
                warn!(host = %host, attempt = attempts, error = %e, "Probe refused, not retrying");
                return Err(ProbeError::Refused {
                    elapsed: start.elapsed(),
                    attempts,
                    reason: e.to_string(),
                });
            }
            Ok(Err(e)) => {
                debug!(host = %host, attempt = attempts, error = %e, "Probe attempt failed");
                last_error = Some(e.to_string());
            }
            Err(_) => {
                debug!(host = %host, attempt = attempts, "Probe attempt timed out");
                last_error = Some(format!("attempt timed out after {}s", attempt_timeout.as_secs()));
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ProbeError::TimedOut {
                elapsed: now - start,
                attempts,
                last_error,
            });
        }

        let pause = settings.poll_interval.min(deadline - now);
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ProbeError::Cancelled { elapsed: start.elapsed() });
            }
            () = tokio::time::sleep(pause) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::remote::{CommandOutput, RemoteError};

    /// Fails the first `failures` attempts, then answers.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        attempt_cost: Duration,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                attempt_cost: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl RemoteExecutor for Flaky {
        async fn run(
            &self,
            _host: &HostTarget,
            _auth: &AuthMethod,
            _command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, RemoteError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.attempt_cost).await;
            if n < self.failures {
                return Err(RemoteError::Unreachable("Connection refused".into()));
            }
            Ok(CommandOutput {
                stdout: "up\n".into(),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    fn host() -> HostTarget {
        HostTarget {
            address: "172.19.181.1".into(),
            username: "pi".into(),
            port: 22,
        }
    }

    fn auth() -> AuthMethod {
        AuthMethod::ExistingKey {
            identity_file: "/tmp/id_rsa".into(),
        }
    }

    fn settings(deadline: u64, interval: u64) -> ProbeSettings {
        ProbeSettings {
            per_attempt_timeout: Duration::from_secs(5),
            overall_deadline: Duration::from_secs(deadline),
            poll_interval: Duration::from_secs(interval),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success() {
        let remote = Flaky::new(0);
        let reachable = await_reachable(&remote, &host(), &auth(), settings(30, 5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reachable.attempts, 1);
        assert_eq!(reachable.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_boot_delay() {
        let remote = Flaky::new(2);
        let reachable = await_reachable(&remote, &host(), &auth(), settings(30, 5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(reachable.attempts, 3);
        assert_eq!(reachable.elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_boundary() {
        for (deadline, interval) in [(30, 5), (30, 7), (10, 3), (1, 5)] {
            let remote = Flaky::new(u32::MAX);
            let err = await_reachable(
                &remote,
                &host(),
                &auth(),
                settings(deadline, interval),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

            let elapsed = err.elapsed();
            assert!(matches!(err, ProbeError::TimedOut { .. }));
            assert!(elapsed >= Duration::from_secs(deadline), "{elapsed:?} < {deadline}s");
            assert!(
                elapsed < Duration::from_secs(deadline + interval),
                "{elapsed:?} >= {deadline}s + {interval}s"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempts_are_clamped_to_deadline() {
        let mut remote = Flaky::new(u32::MAX);
        remote.attempt_cost = Duration::from_secs(60);

        let err = await_reachable(&remote, &host(), &auth(), settings(12, 5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.elapsed() >= Duration::from_secs(12));
        assert!(err.elapsed() < Duration::from_secs(17));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let remote = Flaky::new(u32::MAX);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });

        let err = await_reachable(&remote, &host(), &auth(), settings(120, 5), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Cancelled { .. }));
        assert!(err.elapsed() < Duration::from_secs(15));
        assert!(remote.calls.load(Ordering::SeqCst) <= 4);
    }

    /// Always fails with the error built by `make`.
    struct Failing {
        calls: AtomicU32,
        make: fn() -> RemoteError,
    }

    #[async_trait]
    impl RemoteExecutor for Failing {
        async fn run(
            &self,
            _host: &HostTarget,
            _auth: &AuthMethod,
            _command: &str,
            _timeout: Duration,
        ) -> Result<CommandOutput, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.make)())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_login_is_not_retried() {
        let remote = Failing {
            calls: AtomicU32::new(0),
            make: || RemoteError::AuthRejected("Permission denied (password)".into()),
        };

        let err = await_reachable(&remote, &host(), &auth(), settings(120, 5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Refused { attempts: 1, .. }));
        assert!(err.to_string().contains("Permission denied"));
        assert_eq!(err.elapsed(), Duration::ZERO);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_transport_is_not_retried() {
        let remote = Failing {
            calls: AtomicU32::new(0),
            make: || RemoteError::Spawn {
                program: "sshpass".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            },
        };

        let err = await_reachable(&remote, &host(), &auth(), settings(120, 5), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProbeError::Refused { .. }));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_last_error() {
        let remote = Flaky::new(u32::MAX);

        let err = await_reachable(&remote, &host(), &auth(), settings(10, 5), &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            ProbeError::TimedOut { last_error, .. } => {
                assert!(last_error.as_deref().unwrap().contains("Connection refused"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(err.to_string().contains("last error: host unreachable: Connection refused"));
    }
}
