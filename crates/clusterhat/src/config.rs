//! Run configuration.
//!
//! Settings live in a YAML file (by default
//! `~/.config/clusterhat/config.yaml`). Every field is optional; a missing
//! file means stock ClusterHAT defaults. The CLI layers its flags on top of
//! whatever was loaded here.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::board::{Auxiliary, DEFAULT_COMMAND, DEFAULT_TIMEOUT_SECS};
use crate::host::{
    HostPolicy, NetworkMode, NodeLabel, NodeOverride, DEFAULT_BRIDGED_DOMAIN, DEFAULT_NAT_PREFIX,
    DEFAULT_SSH_PORT, DEFAULT_USERNAME,
};
use crate::probe::ProbeSettings;

/// Configuration errors. All of them are fatal and raised before any
/// hardware is touched.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No nodes to provision.
    #[error("node list is empty")]
    EmptyNodeList,

    /// Node label is malformed.
    #[error("invalid node label '{0}'")]
    InvalidLabel(String),

    /// Node listed more than once.
    #[error("node '{0}' is listed more than once")]
    DuplicateLabel(String),

    /// Unknown network mode string.
    #[error("unknown network mode '{0}'. Supported: address_translated (cnat), bridged (cbridge)")]
    InvalidNetworkMode(String),

    /// Address-translated mode needs a slot number in the label.
    #[error("node '{0}' has no slot number; give it an address override")]
    NoSlotNumber(String),

    /// A timing value is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Public key file could not be read.
    #[error("cannot read public key {}: {source}", .path.display())]
    PublicKeyUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Public key content is not usable.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Private key for key authentication does not exist.
    #[error("identity file {} not found", .0.display())]
    IdentityFileMissing(PathBuf),

    /// Password authentication selected but no secret supplied.
    #[error("password authentication selected but no password was provided")]
    MissingSecret,

    /// The remote transport cannot be started on this machine.
    #[error("remote transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Config file could not be read.
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid YAML for [`RunConfig`].
    #[error("cannot parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// How remote sessions authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Use `identity_file`, which the nodes already trust.
    #[default]
    Key,
    /// Prompt the operator for the node password.
    Password,
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "key" => Ok(Self::Key),
            "password" => Ok(Self::Password),
            _ => Err(format!("unknown auth mode '{s}'. Supported: key, password")),
        }
    }
}

/// Board controller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoardConfig {
    /// Controller command line prefix (e.g. `sudo clusterctrl`).
    pub command: String,
    /// Timeout for one controller command.
    pub timeout_secs: u64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_COMMAND.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

/// Full run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// Nodes to provision, in order.
    pub nodes: Vec<NodeLabel>,
    /// Addressing scheme.
    pub network_mode: NetworkMode,
    /// Hard limit for a single reachability attempt.
    pub per_attempt_timeout_secs: u64,
    /// How long to wait for a node to boot.
    pub overall_deadline_secs: u64,
    /// Pause between reachability attempts.
    pub poll_interval_secs: u64,
    /// Bound for the key installation session.
    pub credential_timeout_secs: u64,
    /// Address prefix in address-translated mode.
    pub nat_prefix: String,
    /// mDNS domain in bridged mode.
    pub bridged_domain: String,
    /// Login user on the nodes.
    pub default_username: String,
    /// SSH port on the nodes.
    pub ssh_port: u16,
    /// Private key used for key authentication.
    pub identity_file: PathBuf,
    /// Public key to install. Defaults to `<identity_file>.pub`.
    pub public_key: Option<PathBuf>,
    /// Authentication mode.
    pub auth: AuthMode,
    /// Auxiliary kept on during the run.
    pub auxiliary: Auxiliary,
    /// Board controller settings.
    pub board: BoardConfig,
    /// Per-node address/user overrides.
    pub overrides: BTreeMap<NodeLabel, NodeOverride>,
}

impl Default for RunConfig {
    fn default() -> Self {
        let nodes = (1..=4)
            .filter_map(|i| NodeLabel::parse(&format!("p{i}")).ok())
            .collect();
        Self {
            nodes,
            network_mode: NetworkMode::default(),
            per_attempt_timeout_secs: 5,
            overall_deadline_secs: 120,
            poll_interval_secs: 5,
            credential_timeout_secs: 30,
            nat_prefix: DEFAULT_NAT_PREFIX.to_string(),
            bridged_domain: DEFAULT_BRIDGED_DOMAIN.to_string(),
            default_username: DEFAULT_USERNAME.to_string(),
            ssh_port: DEFAULT_SSH_PORT,
            identity_file: default_identity_file(),
            public_key: None,
            auth: AuthMode::default(),
            auxiliary: Auxiliary::Fan,
            board: BoardConfig::default(),
            overrides: BTreeMap::new(),
        }
    }
}

fn default_identity_file() -> PathBuf {
    dirs::home_dir().map_or_else(|| PathBuf::from("~/.ssh/id_rsa"), |home| home.join(".ssh/id_rsa"))
}

/// Expand a leading `~/` to the home directory.
#[must_use]
pub fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl RunConfig {
    /// Default config file location.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("clusterhat").join("config.yaml"))
    }

    /// Load configuration.
    ///
    /// With an explicit `path` the file must exist. Without one, the default
    /// location is tried and a missing file yields [`RunConfig::default`].
    ///
    /// # Errors
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = Self::from_yaml(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), nodes = config.nodes.len(), "Loaded config");
        Ok(config)
    }

    /// Parse configuration from YAML text.
    ///
    /// # Errors
    /// Returns the YAML error if the text does not describe a [`RunConfig`].
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }

    /// Check node list and timings.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::EmptyNodeList);
        }

        let mut seen = HashSet::new();
        for label in &self.nodes {
            if !seen.insert(label) {
                return Err(ConfigError::DuplicateLabel(label.to_string()));
            }
        }

        for (name, value) in [
            ("per_attempt_timeout_secs", self.per_attempt_timeout_secs),
            ("overall_deadline_secs", self.overall_deadline_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("credential_timeout_secs", self.credential_timeout_secs),
            ("board.timeout_secs", self.board.timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        Ok(())
    }

    /// Addressing rules derived from this config.
    #[must_use]
    pub fn host_policy(&self) -> HostPolicy {
        HostPolicy {
            mode: self.network_mode,
            nat_prefix: self.nat_prefix.clone(),
            bridged_domain: self.bridged_domain.clone(),
            default_username: self.default_username.clone(),
            port: self.ssh_port,
        }
    }

    /// Reachability timing derived from this config.
    #[must_use]
    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            per_attempt_timeout: Duration::from_secs(self.per_attempt_timeout_secs),
            overall_deadline: Duration::from_secs(self.overall_deadline_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
        }
    }

    /// Private key path with `~` expanded.
    #[must_use]
    pub fn identity_file(&self) -> PathBuf {
        expand_home(&self.identity_file)
    }

    /// Public key path with `~` expanded.
    #[must_use]
    pub fn public_key_path(&self) -> PathBuf {
        match &self.public_key {
            Some(path) => expand_home(path),
            None => {
                let mut path = self.identity_file().into_os_string();
                path.push(".pub");
                PathBuf::from(path)
            }
        }
    }
}
