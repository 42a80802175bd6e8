//! Stream connector that routes source records to per-subscriber checkpoint
//! topics and commits source offsets under a configurable QoS tier.
//!
//! Errors are logged with `error = ?e` or `{e:#}` so the full cause chain is
//! visible; `anyhow` is only used at the service boundary.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod kafka;
pub mod metrics_consts;
pub mod metrics_server;
pub mod process;
pub mod qos;
pub mod registry;
pub mod service;
pub mod sharding;
pub mod subscriber;
pub mod topic_manager;

pub use config::Config;
pub use dispatch::dispatcher::BatchDispatcher;
pub use error::{ConfigError, DispatchError};
