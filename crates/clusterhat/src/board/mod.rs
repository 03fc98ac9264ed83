//! Board controller access.
//!
//! The ClusterHAT / ClusterCTRL controller is driven through the
//! `clusterctrl` command line tool. Every call maps to one invocation and is
//! classified by exit status only; retry policy belongs to the caller.
//!
//! ## Requirements
//!
//! - `clusterctrl` installed on the controller and in `PATH`
//! - permission to access the controller's I2C bus (usually root or the
//!   `i2c` group)

mod client;
mod models;

use async_trait::async_trait;

pub use client::{ClusterCtrl, DEFAULT_COMMAND, DEFAULT_TIMEOUT_SECS};
pub use models::*;

use crate::host::NodeLabel;

/// Power and accessory control of the shared board.
#[async_trait]
pub trait BoardController: Send + Sync {
    /// Switch a node slot on. Repeating this on a powered node is a no-op.
    async fn power_on(&self, label: &NodeLabel) -> Result<Ack, BoardError>;

    /// Switch a node slot off.
    async fn power_off(&self, label: &NodeLabel) -> Result<Ack, BoardError>;

    /// Switch every node slot on or off.
    async fn power_all(&self, state: Switch) -> Result<Ack, BoardError>;

    /// Switch an auxiliary (fan, hub, ...) on or off.
    async fn set_auxiliary(&self, aux: Auxiliary, state: Switch) -> Result<Ack, BoardError>;

    /// Read and parse the controller status.
    async fn status(&self) -> Result<BoardStatus, BoardError>;
}
