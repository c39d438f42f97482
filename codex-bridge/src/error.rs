//! Error taxonomy for the bridge core.

use std::time::Duration;

use crate::bridge::protocol::{RequestId, RpcError};
use crate::supervisor::SpawnError;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// No live app-server child (or the message pump is not running).
    #[error("app-server process is not running")]
    NotRunning,

    #[error("app-server closed its output stream")]
    ProcessClosed,

    #[error("app-server already initialized")]
    AlreadyInitialized,

    #[error("initialize failed: {0}")]
    Handshake(RpcError),

    #[error("initialize timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Structured error returned verbatim by the app-server.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("request {method} (id {id}) timed out after {timeout:?}")]
    RequestTimeout {
        method: String,
        id: RequestId,
        timeout: Duration,
    },

    /// The triggering call succeeded but its completion notification never arrived.
    #[error("operation {expected_id} did not complete within {timeout:?}")]
    OperationTimeout {
        expected_id: String,
        timeout: Duration,
    },

    #[error("no {method} notification within {timeout:?}")]
    NotificationTimeout { method: String, timeout: Duration },

    #[error("protocol engine stopped")]
    EngineStopped,

    #[error("failed to spawn app-server: {0}")]
    Spawn(#[from] SpawnError),

    #[error("app-server pipe error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Local deadline exceeded (direct reply or completion notification).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout { .. } | Self::OperationTimeout { .. } | Self::HandshakeTimeout(_)
        )
    }
}
