//! Health status types for the bridge.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the bridge and its app-server child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    /// Just created, nothing started
    #[default]
    Unknown,
    /// Spawning the child and running the handshake
    Starting,
    /// Child alive, initialized, pump running
    Ready,
    /// Health loop is restarting a dead child
    Recovering,
    /// Initial startup failed
    SetupFailed,
    /// Last restart attempt failed; retried on the next tick
    Defunct,
}

/// Status of the startup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Starting,
    Succeeded,
    Failed,
}

/// Outcome of the initial spawn and handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupResult {
    /// ISO 8601.
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub status: SetupStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SetupResult {
    pub fn starting() -> Self {
        Self {
            started_at: chrono::Utc::now().to_rfc3339(),
            completed_at: None,
            status: SetupStatus::Starting,
            error: None,
        }
    }

    pub fn succeeded(mut self) -> Self {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.status = SetupStatus::Succeeded;
        self
    }

    pub fn failed(mut self, error: String) -> Self {
        self.completed_at = Some(chrono::Utc::now().to_rfc3339());
        self.status = SetupStatus::Failed;
        self.error = Some(error);
        self
    }
}
