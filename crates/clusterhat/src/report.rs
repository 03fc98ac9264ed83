//! Per-run provisioning report.

use std::fmt;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::host::NodeLabel;

/// Terminal outcome for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Key installed and node powered back off.
    Success,
    /// Node never answered within the deadline.
    TimedOut,
    /// The controller refused to power the node on.
    PowerOnFailed,
    /// The node answered but the key could not be installed.
    CredentialCopyFailed,
    /// Key installed but the node could not be powered off.
    PowerOffFailed,
}

impl NodeOutcome {
    /// Power state the node is left in after this outcome.
    #[must_use]
    pub fn final_power_state(self) -> FinalPowerState {
        match self {
            Self::Success => FinalPowerState::Off,
            Self::TimedOut | Self::CredentialCopyFailed => FinalPowerState::On,
            Self::PowerOnFailed | Self::PowerOffFailed => FinalPowerState::Unknown,
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::TimedOut => write!(f, "timed out"),
            Self::PowerOnFailed => write!(f, "power-on failed"),
            Self::CredentialCopyFailed => write!(f, "key copy failed"),
            Self::PowerOffFailed => write!(f, "power-off failed"),
        }
    }
}

/// Power state a node was left in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalPowerState {
    /// Deliberately left on for diagnosis or manual fix-up.
    On,
    /// Powered off.
    Off,
    /// A power command failed; the state is not known.
    Unknown,
}

impl fmt::Display for FinalPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// One node's line in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    /// Node slot.
    pub label: NodeLabel,
    /// Address the node was contacted at.
    pub host: String,
    /// Terminal outcome.
    pub outcome: NodeOutcome,
    /// Power state the node was left in.
    pub final_power_state: FinalPowerState,
    /// Seconds spent waiting for reachability.
    pub elapsed_wait_secs: u64,
    /// Underlying error text for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl NodeReport {
    /// Whether the node was deliberately left powered and needs follow-up.
    #[must_use]
    pub fn left_powered_on(&self) -> bool {
        self.final_power_state == FinalPowerState::On
    }
}

/// Ordered result of a provisioning run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// One entry per processed node, in processing order.
    pub nodes: Vec<NodeReport>,
    /// First node not provisioned because the operator cancelled the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_at: Option<NodeLabel>,
    /// The cancel hit during that node's reachability wait, so it is still
    /// powered on. Otherwise it was never touched.
    #[serde(default)]
    pub aborted_node_powered: bool,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub(crate) fn new() -> Self {
        let now = Utc::now();
        Self {
            nodes: Vec::new(),
            aborted_at: None,
            aborted_node_powered: false,
            started_at: now,
            finished_at: now,
        }
    }

    pub(crate) fn record(&mut self, entry: NodeReport) {
        self.nodes.push(entry);
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    /// Entry for `label`, if it was processed.
    #[must_use]
    pub fn get(&self, label: &NodeLabel) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.label == label)
    }

    /// Every processed node succeeded and the run was not aborted.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.aborted_at.is_none() && self.nodes.iter().all(|n| n.outcome == NodeOutcome::Success)
    }

    /// Nodes that were deliberately left powered on.
    pub fn left_powered_on(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.left_powered_on())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<6} {:<22} {:<18} {:<8} {:>6}", "NODE", "HOST", "OUTCOME", "POWER", "WAIT")?;
        for node in &self.nodes {
            let outcome = format!("{:<18}", node.outcome.to_string());
            let outcome = if node.outcome == NodeOutcome::Success {
                outcome.green()
            } else {
                outcome.red()
            };
            writeln!(
                f,
                "{:<6} {:<22} {} {:<8} {:>5}s",
                node.label.as_str().to_uppercase(),
                node.host,
                outcome,
                node.final_power_state.to_string(),
                node.elapsed_wait_secs
            )?;
            if let Some(detail) = &node.detail {
                writeln!(f, "       {}", detail.dimmed())?;
            }
        }

        if let Some(label) = &self.aborted_at {
            let label = label.as_str().to_uppercase();
            let message = if self.aborted_node_powered {
                format!("Aborted while waiting for {label}; it is still powered on.")
            } else {
                format!("Aborted before powering {label}; it and later nodes were not touched.")
            };
            writeln!(f, "{}", message.yellow())?;
        }

        let follow_up: Vec<String> = self
            .left_powered_on()
            .map(|n| n.label.as_str().to_uppercase())
            .collect();
        if !follow_up.is_empty() {
            writeln!(f, "Left powered on for manual follow-up: {}", follow_up.join(", "))?;
        }
        Ok(())
    }
}
