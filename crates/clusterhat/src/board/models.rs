//! Board controller models.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::NodeLabel;

// ============================================================================
// Errors
// ============================================================================

/// Errors from the board controller.
///
/// The controller reports nothing beyond its exit status, so a failure is
/// opaque apart from the command line and whatever it wrote to stderr.
#[derive(Error, Debug)]
pub enum BoardError {
    /// Command exited non-zero (or was killed by a signal).
    #[error("'{command}' failed with exit status {}: {stderr}", display_status(.exit_status))]
    CommandFailed {
        command: String,
        exit_status: Option<i32>,
        stderr: String,
    },

    /// Command could not be started at all.
    #[error("failed to run '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Command did not finish within its timeout.
    #[error("'{command}' did not finish within {}s", .timeout.as_secs())]
    TimedOut { command: String, timeout: Duration },
}

#[allow(clippy::ref_option)]
fn display_status(status: &Option<i32>) -> String {
    status.map_or_else(|| "signal".to_string(), |code| code.to_string())
}

impl BoardError {
    /// Command line that failed.
    #[must_use]
    pub fn command(&self) -> &str {
        match self {
            Self::CommandFailed { command, .. }
            | Self::Spawn { command, .. }
            | Self::TimedOut { command, .. } => command,
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Successful controller acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Trimmed stdout of the command.
    pub output: String,
}

/// On/off argument for controller commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    /// Switch on.
    On,
    /// Switch off.
    Off,
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "on"),
            Self::Off => write!(f, "off"),
        }
    }
}

impl FromStr for Switch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on" | "1" | "true" => Ok(Self::On),
            "off" | "0" | "false" => Ok(Self::Off),
            _ => Err(format!("expected 'on' or 'off', got '{s}'")),
        }
    }
}

/// Board accessories controllable through `clusterctrl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Auxiliary {
    /// USB hub power.
    Hub,
    /// Status LEDs.
    Led,
    /// Alert LED.
    Alert,
    /// EEPROM write protect.
    Wp,
    /// Cooling fan.
    #[default]
    Fan,
}

impl Auxiliary {
    /// All accessories, in status-summary order.
    pub const ALL: [Self; 5] = [Self::Hub, Self::Led, Self::Alert, Self::Wp, Self::Fan];

    /// Name used on the `clusterctrl` command line.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Led => "led",
            Self::Alert => "alert",
            Self::Wp => "wp",
            Self::Fan => "fan",
        }
    }

    /// Keys this accessory may appear under in `clusterctrl status`.
    fn status_keys(self) -> &'static [&'static str] {
        match self {
            Self::Hub => &["hub"],
            Self::Led => &["led"],
            Self::Alert => &["hat_alert", "alert"],
            Self::Wp => &["wp"],
            Self::Fan => &["fan"],
        }
    }
}

impl fmt::Display for Auxiliary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Auxiliary {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|aux| aux.as_str() == s.to_lowercase())
            .ok_or_else(|| format!("unknown auxiliary '{s}'. Supported: hub, led, alert, wp, fan"))
    }
}

// ============================================================================
// Status
// ============================================================================

/// Power state as reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    /// Powered.
    On,
    /// Unpowered.
    Off,
}

impl PowerState {
    fn from_flag(value: &str) -> Self {
        if value == "1" {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "ON"),
            Self::Off => write!(f, "OFF"),
        }
    }
}

/// Parsed `clusterctrl status` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BoardStatus {
    fields: BTreeMap<String, String>,
}

impl BoardStatus {
    /// Parse `key:value` lines. Lines without a colon are skipped.
    #[must_use]
    pub fn parse(output: &str) -> Self {
        let fields = output
            .lines()
            .filter_map(|line| line.trim().split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        Self { fields }
    }

    /// Raw value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Power state of a node slot. Slots missing from the output read as off.
    #[must_use]
    pub fn node_power(&self, label: &NodeLabel) -> PowerState {
        self.get(label.as_str())
            .map_or(PowerState::Off, PowerState::from_flag)
    }

    /// State of an accessory, if the board reports it.
    #[must_use]
    pub fn auxiliary(&self, aux: Auxiliary) -> Option<PowerState> {
        aux.status_keys()
            .iter()
            .find_map(|key| self.get(key))
            .map(PowerState::from_flag)
    }

    /// Node slots present in the output (`p1`, `p2`, ...), in slot order.
    #[must_use]
    pub fn node_labels(&self) -> Vec<NodeLabel> {
        let mut labels: Vec<NodeLabel> = self
            .fields
            .keys()
            .filter(|key| {
                key.len() > 1
                    && key.starts_with('p')
                    && key[1..].chars().all(|c| c.is_ascii_digit())
            })
            .filter_map(|key| NodeLabel::parse(key).ok())
            .collect();
        labels.sort_by_key(NodeLabel::slot);
        labels
    }

    /// One-line summary, e.g. `P1=ON | P2=OFF | FAN=ON`.
    #[must_use]
    pub fn summary(&self) -> String {
        let nodes = self
            .node_labels()
            .into_iter()
            .map(|label| {
                format!(
                    "{}={}",
                    label.as_str().to_uppercase(),
                    self.node_power(&label)
                )
            });
        let extras = Auxiliary::ALL.into_iter().filter_map(|aux| {
            self.auxiliary(aux)
                .map(|state| format!("{}={state}", aux.as_str().to_uppercase()))
        });
        nodes.chain(extras).collect::<Vec<_>>().join(" | ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
clusterhat:1
maxpi:4
hat_version:2.3
hat_alert:0
hat_wp:1
hub:1
led:1
p1:1
p2:0
p3:1
p4:0
fan:1
garbage line
";

    #[test]
    fn test_status_parsing() {
        let status = BoardStatus::parse(SAMPLE);
        assert_eq!(status.get("hat_version"), Some("2.3"));
        assert_eq!(status.node_power(&NodeLabel::parse("p1").unwrap()), PowerState::On);
        assert_eq!(status.node_power(&NodeLabel::parse("p2").unwrap()), PowerState::Off);
        assert_eq!(status.node_power(&NodeLabel::parse("p9").unwrap()), PowerState::Off);
        assert_eq!(status.auxiliary(Auxiliary::Fan), Some(PowerState::On));
        assert_eq!(status.auxiliary(Auxiliary::Alert), Some(PowerState::Off));
        assert_eq!(status.auxiliary(Auxiliary::Wp), None);
    }

    #[test]
    fn test_status_summary() {
        let status = BoardStatus::parse(SAMPLE);
        assert_eq!(
            status.summary(),
            "P1=ON | P2=OFF | P3=ON | P4=OFF | HUB=ON | LED=ON | ALERT=OFF | FAN=ON"
        );
    }

    #[test]
    fn test_node_labels_sorted_by_slot() {
        let status = BoardStatus::parse("p10:0\np2:1\np1:0\npi_model:4\n");
        let labels: Vec<String> = status.node_labels().iter().map(ToString::to_string).collect();
        assert_eq!(labels, vec!["p1", "p2", "p10"]);
    }

    #[test]
    fn test_auxiliary_round_trip_names() {
        for aux in Auxiliary::ALL {
            assert_eq!(aux.as_str().parse::<Auxiliary>().unwrap(), aux);
        }
        assert!("pump".parse::<Auxiliary>().is_err());
    }

    #[test]
    fn test_board_error_display() {
        let err = BoardError::CommandFailed {
            command: "clusterctrl on p1".into(),
            exit_status: Some(1),
            stderr: "Invalid node".into(),
        };
        assert_eq!(err.to_string(), "'clusterctrl on p1' failed with exit status 1: Invalid node");
        assert_eq!(err.command(), "clusterctrl on p1");
    }
}
