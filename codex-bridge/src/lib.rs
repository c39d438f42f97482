//! codex-bridge: request/response bridge to a Codex app-server subprocess.
//!
//! The app-server speaks line-delimited JSON over stdio and reports the
//! outcome of long-running work through notifications. This crate owns the
//! child process, correlates replies with requests, fans notifications out to
//! subscribers, and turns "start, then wait for the completion notification"
//! into a single awaitable call.

mod health;
mod version;

pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod service;
pub mod subscriptions;
pub mod supervisor;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::{BridgeConfig, ConfigError};
pub use engine::ProtocolEngine;
pub use error::BridgeError;
pub use health::{Health, SetupResult, SetupStatus};
pub use service::{BridgeService, HealthSnapshot};
pub use subscriptions::{NotificationFilter, NotificationHandler, Subscription, SubscriptionId};
pub use supervisor::{ChildSpawner, ClientInfo, CodexSpawner, ProcessSupervisor, SupervisorConfig};
pub use tracker::{OperationSpec, OperationTracker};
pub use version::{BRIDGE_VERSION, VersionInfo};
