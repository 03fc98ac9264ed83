//! Node bring-up for ClusterHAT / ClusterCTRL boards.
//!
//! This crate powers compute-node slots behind a shared board controller,
//! waits for each node to answer over SSH, installs a public key on it for
//! passwordless access and powers it back down. The cooling fan (or any other
//! board auxiliary) is kept on for the whole run and is switched off again on
//! every exit path.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use clusterhat::board::ClusterCtrl;
//! use clusterhat::config::RunConfig;
//! use clusterhat::orchestrator::{Orchestrator, ProvisionPlan};
//! use clusterhat::remote::OpenSsh;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::load(None)?;
//!     let plan = ProvisionPlan::build(&config, None)?;
//!
//!     let orchestrator = Orchestrator::new(
//!         Arc::new(ClusterCtrl::from_config(&config.board)),
//!         Arc::new(OpenSsh::new()),
//!     );
//!
//!     let report = orchestrator.run(&plan, &CancellationToken::new()).await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod board;
pub mod bracket;
pub mod config;
pub mod credential;
pub mod host;
pub mod orchestrator;
pub mod probe;
pub mod remote;
pub mod report;

pub use board::{Auxiliary, BoardController, BoardError, BoardStatus, ClusterCtrl, Switch};
pub use config::{ConfigError, RunConfig};
pub use host::{HostTarget, NetworkMode, NodeLabel};
pub use orchestrator::{Orchestrator, OrchestratorError, ProvisionPlan};
pub use remote::{AuthMethod, OpenSsh, RemoteExecutor};
pub use report::{FinalPowerState, NodeOutcome, RunReport};
