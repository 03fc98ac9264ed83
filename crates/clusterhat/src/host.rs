//! Node labels and host resolution.
//!
//! A node label names a power slot on the board (`p1`..`p6`). How that slot
//! is reached over the network depends on the operator-selected
//! [`NetworkMode`]: in address-translated (CNAT) mode the controller Pi NATs a
//! private subnet and every slot has a fixed address, in bridged (CBRIDGE)
//! mode the nodes sit on the LAN and announce `<label>.local` over mDNS.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// Private subnet the ClusterHAT CNAT image hands out to its slots.
pub const DEFAULT_NAT_PREFIX: &str = "172.19.181.";

/// mDNS domain used in bridged mode.
pub const DEFAULT_BRIDGED_DOMAIN: &str = "local";

/// Account created on the stock node images.
pub const DEFAULT_USERNAME: &str = "pi";

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Identifier of a power-controllable node slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeLabel(String);

impl NodeLabel {
    /// Parse and validate a label.
    ///
    /// Labels are lowercased; only ASCII alphanumerics, `-` and `_` are
    /// accepted since the label ends up on a `clusterctrl` command line and
    /// in a hostname.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidLabel`] for empty or malformed labels.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let label = raw.trim().to_lowercase();
        let valid = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid || label == "all" {
            return Err(ConfigError::InvalidLabel(raw.to_string()));
        }
        Ok(Self(label))
    }

    /// Label as passed to the board controller.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Slot number carried in the label (`p3` → 3).
    #[must_use]
    pub fn slot(&self) -> Option<u8> {
        let digits_at = self
            .0
            .rfind(|c: char| !c.is_ascii_digit())
            .map_or(0, |i| i + 1);
        let digits = &self.0[digits_at..];
        if digits.is_empty() {
            return None;
        }
        digits.parse::<u8>().ok().filter(|n| *n > 0)
    }
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeLabel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for NodeLabel {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NodeLabel> for String {
    fn from(label: NodeLabel) -> Self {
        label.0
    }
}

/// How node labels map to connectable hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Nodes live on the controller's NAT subnet (ClusterHAT "CNAT" image).
    #[default]
    #[serde(alias = "cnat", alias = "nat")]
    AddressTranslated,
    /// Nodes are bridged onto the LAN and resolved by mDNS ("CBRIDGE" image).
    #[serde(alias = "cbridge", alias = "bridge")]
    Bridged,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddressTranslated => write!(f, "address_translated"),
            Self::Bridged => write!(f, "bridged"),
        }
    }
}

impl FromStr for NetworkMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "address_translated" | "cnat" | "nat" => Ok(Self::AddressTranslated),
            "bridged" | "cbridge" | "bridge" => Ok(Self::Bridged),
            _ => Err(ConfigError::InvalidNetworkMode(s.to_string())),
        }
    }
}

/// Operator override for a single node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeOverride {
    /// Address or hostname to use instead of the computed one.
    #[serde(default)]
    pub address: Option<String>,
    /// Login user to use instead of the default.
    #[serde(default)]
    pub username: Option<String>,
}

/// Where and as whom to reach a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTarget {
    /// IP address or hostname.
    pub address: String,
    /// Login user.
    pub username: String,
    /// SSH port.
    pub port: u16,
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.address)?;
        if self.port != DEFAULT_SSH_PORT {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

/// Addressing rules for the active network mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPolicy {
    /// Active network mode.
    pub mode: NetworkMode,
    /// Prefix the slot number is appended to in address-translated mode.
    pub nat_prefix: String,
    /// Domain appended to the label in bridged mode.
    pub bridged_domain: String,
    /// Login user when no override is given.
    pub default_username: String,
    /// SSH port for every node.
    pub port: u16,
}

impl HostPolicy {
    /// Policy with the stock ClusterHAT defaults for `mode`.
    #[must_use]
    pub fn new(mode: NetworkMode) -> Self {
        Self {
            mode,
            nat_prefix: DEFAULT_NAT_PREFIX.to_string(),
            bridged_domain: DEFAULT_BRIDGED_DOMAIN.to_string(),
            default_username: DEFAULT_USERNAME.to_string(),
            port: DEFAULT_SSH_PORT,
        }
    }

    /// Resolve `label` to a host target.
    ///
    /// An override address wins over the computed one for this node only,
    /// and likewise for the username.
    ///
    /// # Errors
    /// Returns [`ConfigError::NoSlotNumber`] when address-translated mode
    /// needs a slot number the label does not carry and no override address
    /// was given.
    pub fn resolve(
        &self,
        label: &NodeLabel,
        node_override: Option<&NodeOverride>,
    ) -> Result<HostTarget, ConfigError> {
        let override_address = node_override.and_then(|o| o.address.clone());
        let address = match override_address {
            Some(address) => address,
            None => self.default_address(label)?,
        };

        let username = node_override
            .and_then(|o| o.username.clone())
            .unwrap_or_else(|| self.default_username.clone());

        Ok(HostTarget {
            address,
            username,
            port: self.port,
        })
    }

    fn default_address(&self, label: &NodeLabel) -> Result<String, ConfigError> {
        match self.mode {
            NetworkMode::AddressTranslated => {
                let slot = label
                    .slot()
                    .ok_or_else(|| ConfigError::NoSlotNumber(label.to_string()))?;
                Ok(format!("{}{slot}", self.nat_prefix))
            }
            NetworkMode::Bridged => {
                let domain = self.bridged_domain.trim_start_matches('.');
                if domain.is_empty() {
                    Ok(label.to_string())
                } else {
                    Ok(format!("{label}.{domain}"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> NodeLabel {
        NodeLabel::parse(s).unwrap()
    }

    #[test]
    fn test_label_parsing() {
        assert_eq!(label(" P2 ").as_str(), "p2");
        assert!(NodeLabel::parse("").is_err());
        assert!(NodeLabel::parse("p1; rm -rf /").is_err());
        assert!(NodeLabel::parse("all").is_err());
    }

    #[test]
    fn test_slot_number() {
        assert_eq!(label("p1").slot(), Some(1));
        assert_eq!(label("p12").slot(), Some(12));
        assert_eq!(label("node").slot(), None);
        assert_eq!(label("p0").slot(), None);
    }

    #[test]
    fn test_address_translated_resolution() {
        let policy = HostPolicy::new(NetworkMode::AddressTranslated);
        let target = policy.resolve(&label("p3"), None).unwrap();
        assert_eq!(target.address, "172.19.181.3");
        assert_eq!(target.username, "pi");
        assert_eq!(target.port, 22);
    }

    #[test]
    fn test_bridged_resolution() {
        let policy = HostPolicy::new(NetworkMode::Bridged);
        let target = policy.resolve(&label("p1"), None).unwrap();
        assert_eq!(target.address, "p1.local");
        assert_eq!(target.username, "pi");
    }

    #[test]
    fn test_override_applies_to_single_node() {
        let policy = HostPolicy::new(NetworkMode::AddressTranslated);
        let custom = NodeOverride {
            address: Some("10.0.0.7".into()),
            username: Some("admin".into()),
        };

        let overridden = policy.resolve(&label("p1"), Some(&custom)).unwrap();
        assert_eq!(overridden.address, "10.0.0.7");
        assert_eq!(overridden.username, "admin");

        let untouched = policy.resolve(&label("p2"), None).unwrap();
        assert_eq!(untouched.address, "172.19.181.2");
        assert_eq!(untouched.username, "pi");
    }

    #[test]
    fn test_missing_slot_needs_override() {
        let policy = HostPolicy::new(NetworkMode::AddressTranslated);
        assert!(matches!(
            policy.resolve(&label("controller"), None),
            Err(ConfigError::NoSlotNumber(_))
        ));

        let custom = NodeOverride {
            address: Some("192.168.1.50".into()),
            username: None,
        };
        let target = policy.resolve(&label("controller"), Some(&custom)).unwrap();
        assert_eq!(target.address, "192.168.1.50");
    }

    #[test]
    fn test_network_mode_aliases() {
        assert_eq!("cnat".parse::<NetworkMode>().unwrap(), NetworkMode::AddressTranslated);
        assert_eq!("CBRIDGE".parse::<NetworkMode>().unwrap(), NetworkMode::Bridged);
        assert_eq!(
            "address-translated".parse::<NetworkMode>().unwrap(),
            NetworkMode::AddressTranslated
        );
        assert!("wifi".parse::<NetworkMode>().is_err());
    }

    #[test]
    fn test_host_target_display() {
        let target = HostTarget {
            address: "p1.local".into(),
            username: "pi".into(),
            port: 2222,
        };
        assert_eq!(target.to_string(), "pi@p1.local:2222");
    }
}
