//! Node provisioning orchestrator.
//!
//! Nodes are handled strictly one after another (the board's power budget
//! and the operator prompts do not tolerate concurrency). Each node runs the
//! state machine
//!
//! ```text
//! Idle → PoweringOn → WaitingForReachability → DistributingCredential → PoweringOff → Completed
//!            ↘               ↘                          ↘                       ↘
//!                                   Failed(reason)
//! ```
//!
//! A failure is recorded in the [`RunReport`] and the run moves on to the
//! next node. The whole loop runs inside the auxiliary bracket, so the fan
//! is switched off no matter how the loop ends.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::board::{Auxiliary, BoardController, BoardError};
use crate::bracket::with_auxiliary_enabled;
use crate::config::{AuthMode, ConfigError, RunConfig};
use crate::credential::{install_credential, PublicCredential};
use crate::host::{HostTarget, NodeLabel};
use crate::probe::{await_reachable, ProbeError, ProbeSettings};
use crate::remote::{AuthMethod, RemoteExecutor, Secret};
use crate::report::{NodeOutcome, NodeReport, RunReport};

/// Fatal run errors. Per-node failures never surface here.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Configuration is unusable; nothing was touched.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The bracketed auxiliary could not be switched on; no node was touched.
    #[error("failed to engage auxiliary: {0}")]
    AuxiliaryEnable(#[source] BoardError),
}

/// Why a node's attempt ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Power-on was refused.
    PowerOnFailed,
    /// The node never became reachable.
    TimedOut,
    /// The key could not be installed.
    CredentialCopyFailed,
    /// Power-off was refused.
    PowerOffFailed,
}

impl From<FailureReason> for NodeOutcome {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::PowerOnFailed => Self::PowerOnFailed,
            FailureReason::TimedOut => Self::TimedOut,
            FailureReason::CredentialCopyFailed => Self::CredentialCopyFailed,
            FailureReason::PowerOffFailed => Self::PowerOffFailed,
        }
    }
}

/// State of one node's provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Not started.
    Idle,
    /// Asking the board to power the slot.
    PoweringOn,
    /// Polling the node until it answers.
    WaitingForReachability,
    /// Installing the public key.
    DistributingCredential,
    /// Asking the board to cut power again.
    PoweringOff,
    /// Done; node is off with the key installed.
    Completed,
    /// Stopped early.
    Failed(FailureReason),
}

/// Result of the action performed in a non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// The action succeeded.
    Succeeded,
    /// The action failed.
    Failed,
    /// The node answered but refused the credentials, or the transport could
    /// not be started. Waiting longer cannot help.
    Refused,
}

impl AttemptState {
    /// Next state once the action of `self` has finished with `result`.
    ///
    /// Terminal states stay put.
    #[must_use]
    pub fn advance(self, result: StepResult) -> Self {
        match (self, result) {
            (Self::Idle, _) => Self::PoweringOn,
            (Self::PoweringOn, StepResult::Succeeded) => Self::WaitingForReachability,
            (Self::PoweringOn, StepResult::Failed | StepResult::Refused) => {
                Self::Failed(FailureReason::PowerOnFailed)
            }
            (Self::WaitingForReachability, StepResult::Succeeded) => Self::DistributingCredential,
            (Self::WaitingForReachability, StepResult::Failed) => Self::Failed(FailureReason::TimedOut),
            (Self::WaitingForReachability, StepResult::Refused)
            | (Self::DistributingCredential, StepResult::Failed | StepResult::Refused) => {
                Self::Failed(FailureReason::CredentialCopyFailed)
            }
            (Self::DistributingCredential, StepResult::Succeeded) => Self::PoweringOff,
            (Self::PoweringOff, StepResult::Succeeded) => Self::Completed,
            (Self::PoweringOff, StepResult::Failed | StepResult::Refused) => {
                Self::Failed(FailureReason::PowerOffFailed)
            }
            (terminal @ (Self::Completed | Self::Failed(_)), _) => terminal,
        }
    }

    /// Report outcome, for terminal states.
    #[must_use]
    pub fn outcome(self) -> Option<NodeOutcome> {
        match self {
            Self::Completed => Some(NodeOutcome::Success),
            Self::Failed(reason) => Some(reason.into()),
            _ => None,
        }
    }
}

/// Transient per-node attempt, folded into the report when it ends.
#[derive(Debug, Clone)]
pub struct ProvisionAttempt {
    /// Node slot.
    pub label: NodeLabel,
    /// Where the node is reached.
    pub host: HostTarget,
    /// Current state.
    pub state: AttemptState,
    /// Time spent waiting for reachability.
    pub elapsed_wait: Duration,
    /// Error text of the failing step.
    pub detail: Option<String>,
}

impl ProvisionAttempt {
    fn new(node: &PlannedNode) -> Self {
        Self {
            label: node.label.clone(),
            host: node.host.clone(),
            state: AttemptState::Idle,
            elapsed_wait: Duration::ZERO,
            detail: None,
        }
    }

    fn into_report(self, outcome: NodeOutcome) -> NodeReport {
        NodeReport {
            label: self.label,
            host: self.host.address,
            outcome,
            final_power_state: outcome.final_power_state(),
            elapsed_wait_secs: self.elapsed_wait.as_secs(),
            detail: self.detail,
        }
    }
}

/// A node with its resolved host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNode {
    /// Node slot.
    pub label: NodeLabel,
    /// Resolved host target.
    pub host: HostTarget,
}

/// Everything a run needs, validated up front.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    /// Nodes in processing order.
    pub nodes: Vec<PlannedNode>,
    /// Key to install.
    pub credential: PublicCredential,
    /// Authentication for probing and installing.
    pub auth: AuthMethod,
    /// Reachability timing.
    pub probe: ProbeSettings,
    /// Bound for the key installation session.
    pub credential_timeout: Duration,
    /// Auxiliary kept on during the run.
    pub auxiliary: Auxiliary,
}

impl ProvisionPlan {
    /// Validate `config` and resolve every node.
    ///
    /// `secret` is required when the config selects password authentication.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`]; nothing has touched hardware yet.
    pub fn build(config: &RunConfig, secret: Option<Secret>) -> Result<Self, ConfigError> {
        config.validate()?;

        let policy = config.host_policy();
        let nodes = config
            .nodes
            .iter()
            .map(|label| {
                let host = policy.resolve(label, config.overrides.get(label))?;
                Ok(PlannedNode {
                    label: label.clone(),
                    host,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let credential = PublicCredential::from_file(&config.public_key_path())?;

        let auth = match config.auth {
            AuthMode::Key => {
                let identity_file = config.identity_file();
                if !identity_file.is_file() {
                    return Err(ConfigError::IdentityFileMissing(identity_file));
                }
                AuthMethod::ExistingKey { identity_file }
            }
            AuthMode::Password => AuthMethod::PasswordPrompt(secret.ok_or(ConfigError::MissingSecret)?),
        };

        Ok(Self {
            nodes,
            credential,
            auth,
            probe: config.probe_settings(),
            credential_timeout: Duration::from_secs(config.credential_timeout_secs),
            auxiliary: config.auxiliary,
        })
    }
}

/// The operator cancelled a reachability wait.
struct Aborted;

/// Drives provisioning of every node in a plan.
pub struct Orchestrator {
    board: Arc<dyn BoardController>,
    remote: Arc<dyn RemoteExecutor>,
}

impl Orchestrator {
    /// Create an orchestrator over the given board and transport.
    #[must_use]
    pub fn new(board: Arc<dyn BoardController>, remote: Arc<dyn RemoteExecutor>) -> Self {
        Self { board, remote }
    }

    /// Provision every node in `plan`.
    ///
    /// The transport is checked first, then the auxiliary is switched on
    /// before the first node and off after the last entry is recorded.
    /// Cancelling `cancel` stops the run at the next reachability wait or
    /// before the next node is powered; the report then names that node in
    /// `aborted_at`.
    ///
    /// # Errors
    /// Only fatal errors: an empty plan, an unusable transport, or the
    /// auxiliary refusing to switch on. Per-node failures are recorded in the
    /// report instead.
    pub async fn run(
        &self,
        plan: &ProvisionPlan,
        cancel: &CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        if plan.nodes.is_empty() {
            return Err(ConfigError::EmptyNodeList.into());
        }
        self.remote
            .preflight(&plan.auth)
            .map_err(|e| ConfigError::TransportUnavailable(e.to_string()))?;

        info!(
            nodes = plan.nodes.len(),
            auxiliary = %plan.auxiliary,
            "Starting provisioning run"
        );

        let report = with_auxiliary_enabled(
            self.board.as_ref(),
            plan.auxiliary,
            self.provision_all(plan, cancel),
        )
        .await
        .map_err(OrchestratorError::AuxiliaryEnable)?;

        info!(
            succeeded = report.nodes.iter().filter(|n| n.outcome == NodeOutcome::Success).count(),
            processed = report.nodes.len(),
            "Provisioning run finished"
        );
        Ok(report)
    }

    async fn provision_all(&self, plan: &ProvisionPlan, cancel: &CancellationToken) -> RunReport {
        let mut report = RunReport::new();

        for node in &plan.nodes {
            if cancel.is_cancelled() {
                warn!(node = %node.label, "Run aborted by operator before powering node");
                report.aborted_at = Some(node.label.clone());
                break;
            }

            match self.provision_node(node, plan, cancel).await {
                Ok(entry) => report.record(entry),
                Err(Aborted) => {
                    warn!(node = %node.label, "Run aborted by operator; node left powered on");
                    report.aborted_at = Some(node.label.clone());
                    report.aborted_node_powered = true;
                    break;
                }
            }
        }

        report.finish()
    }

    async fn provision_node(
        &self,
        node: &PlannedNode,
        plan: &ProvisionPlan,
        cancel: &CancellationToken,
    ) -> Result<NodeReport, Aborted> {
        let mut attempt = ProvisionAttempt::new(node);

        let outcome = loop {
            if let Some(outcome) = attempt.state.outcome() {
                break outcome;
            }

            let result = match attempt.state {
                AttemptState::Idle | AttemptState::Completed | AttemptState::Failed(_) => {
                    StepResult::Succeeded
                }
                AttemptState::PoweringOn => match self.board.power_on(&attempt.label).await {
                    Ok(_) => StepResult::Succeeded,
                    Err(e) => {
                        attempt.detail = Some(e.to_string());
                        StepResult::Failed
                    }
                },
                AttemptState::WaitingForReachability => {
                    match await_reachable(
                        self.remote.as_ref(),
                        &attempt.host,
                        &plan.auth,
                        plan.probe,
                        cancel,
                    )
                    .await
                    {
                        Ok(reachable) => {
                            attempt.elapsed_wait = reachable.elapsed;
                            StepResult::Succeeded
                        }
                        Err(ProbeError::Cancelled { .. }) => return Err(Aborted),
                        Err(e) => {
                            attempt.elapsed_wait = e.elapsed();
                            attempt.detail = Some(e.to_string());
                            if matches!(e, ProbeError::Refused { .. }) {
                                StepResult::Refused
                            } else {
                                StepResult::Failed
                            }
                        }
                    }
                }
                AttemptState::DistributingCredential => {
                    match install_credential(
                        self.remote.as_ref(),
                        &attempt.host,
                        &plan.credential,
                        &plan.auth,
                        plan.credential_timeout,
                    )
                    .await
                    {
                        Ok(_) => StepResult::Succeeded,
                        Err(e) => {
                            attempt.detail = Some(e.to_string());
                            StepResult::Failed
                        }
                    }
                }
                AttemptState::PoweringOff => match self.board.power_off(&attempt.label).await {
                    Ok(_) => StepResult::Succeeded,
                    Err(e) => {
                        attempt.detail = Some(e.to_string());
                        StepResult::Failed
                    }
                },
            };

            let next = attempt.state.advance(result);
            info!(node = %attempt.label, from = ?attempt.state, to = ?next, "Node state transition");
            attempt.state = next;
        };

        if outcome == NodeOutcome::Success {
            info!(node = %attempt.label, host = %attempt.host, "Node provisioned");
        } else {
            warn!(
                node = %attempt.label,
                outcome = %outcome,
                power = %outcome.final_power_state(),
                detail = attempt.detail.as_deref().unwrap_or(""),
                "Node provisioning failed"
            );
        }

        Ok(attempt.into_report(outcome))
    }
}
