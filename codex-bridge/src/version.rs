//! Version information for the bridge.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by `/` and `/health`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub bridge: &'static str,
    /// The app-server's user agent, learned from the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codex: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            codex: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_codex(mut self, user_agent: String) -> Self {
        self.codex = Some(user_agent);
        self
    }
}
