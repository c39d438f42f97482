//! App-server process lifecycle.
//!
//! Spawns `<codex> app-server` with piped stdio, performs the
//! initialize/initialized handshake directly on the transport (before any pump
//! exists), and terminates the child with SIGTERM followed by SIGKILL.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use crate::bridge::protocol::{Envelope, HANDSHAKE_ID};
use crate::bridge::transport::{Inbound, MessageTransport};
use crate::error::BridgeError;

/// Subcommand that runs the line protocol on stdio.
const APP_SERVER_SUBCOMMAND: &str = "app-server";

/// How long a child gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("child {0} was not piped")]
    MissingPipe(&'static str),
}

/// Extension point for how the app-server is launched.
pub trait ChildSpawner: Send + Sync {
    fn spawn(&self, program: &Path) -> Result<Child, SpawnError>;
}

/// Runs `[program, "app-server"]` with all three streams piped.
pub struct CodexSpawner;

impl ChildSpawner for CodexSpawner {
    fn spawn(&self, program: &Path) -> Result<Child, SpawnError> {
        let child = Command::new(program)
            .arg(APP_SERVER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Identity sent in the `initialize` handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub title: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "codex-bridge-server".to_string(),
            title: "Codex Bridge Server".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub struct SupervisorConfig {
    pub codex_path: PathBuf,
    pub client_info: ClientInfo,
    pub init_timeout: Duration,
    pub spawner: Arc<dyn ChildSpawner>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            codex_path: PathBuf::from("codex"),
            client_info: ClientInfo::default(),
            init_timeout: Duration::from_secs(30),
            spawner: Arc::new(CodexSpawner),
        }
    }
}

impl SupervisorConfig {
    pub fn with_codex_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.codex_path = path.into();
        self
    }

    pub fn with_client_info(mut self, client_info: ClientInfo) -> Self {
        self.client_info = client_info;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ChildSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    transport: Arc<MessageTransport>,
    initialized: bool,
    started_at: DateTime<Utc>,
}

impl ProcessHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    handle: Mutex<Option<ProcessHandle>>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn the app-server. No-op while a live child exists.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_mut()
            && handle.is_alive()
        {
            tracing::debug!(pid = ?handle.pid, "app-server already running");
            return Ok(());
        }

        let mut child = self.config.spawner.spawn(&self.config.codex_path)?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            drain_stderr(stderr, pid);
        }

        tracing::info!(
            pid = ?pid,
            path = %self.config.codex_path.display(),
            "Started app-server"
        );

        *guard = Some(ProcessHandle {
            child,
            pid,
            transport: Arc::new(MessageTransport::new(stdin, stdout)),
            initialized: false,
            started_at: Utc::now(),
        });
        Ok(())
    }

    /// True while a child exists and no exit status has been observed.
    pub async fn is_alive(&self) -> bool {
        match self.handle.lock().await.as_mut() {
            Some(handle) => handle.is_alive(),
            None => false,
        }
    }

    /// Run the initialize/initialized handshake and return the server's result.
    ///
    /// `timeout` bounds the whole exchange, not the gap between lines.
    pub async fn initialize(&self, timeout: Duration) -> Result<Value, BridgeError> {
        let (transport, pid) = {
            let mut guard = self.handle.lock().await;
            let Some(handle) = guard.as_mut() else {
                return Err(BridgeError::NotRunning);
            };
            if handle.initialized {
                tracing::warn!(pid = ?handle.pid, "app-server already initialized");
                return Err(BridgeError::AlreadyInitialized);
            }
            if !handle.is_alive() {
                return Err(BridgeError::NotRunning);
            }
            (Arc::clone(&handle.transport), handle.pid)
        };

        tracing::debug!(pid = ?pid, "Sending initialize");
        let handshake = async {
            let params = json!({ "clientInfo": self.config.client_info });
            transport
                .send(Envelope::request(HANDSHAKE_ID, "initialize", params))
                .await?;
            read_handshake_reply(&transport).await
        };
        let result = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| BridgeError::HandshakeTimeout(timeout))??;

        transport
            .send(Envelope::notification("initialized", json!({})))
            .await?;

        if let Some(handle) = self.handle.lock().await.as_mut()
            && handle.pid == pid
        {
            handle.initialized = true;
        }
        tracing::info!(pid = ?pid, "app-server initialized");
        Ok(result)
    }

    /// Terminate the child: SIGTERM, then SIGKILL after the grace window.
    pub async fn stop(&self) {
        let Some(mut handle) = self.handle.lock().await.take() else {
            return;
        };
        handle.transport.close().await;

        if !handle.is_alive() {
            tracing::debug!(pid = ?handle.pid, "app-server already exited");
            return;
        }

        request_termination(&mut handle.child);
        match tokio::time::timeout(TERMINATE_GRACE, handle.child.wait()).await {
            Ok(Ok(status)) => tracing::info!(pid = ?handle.pid, %status, "app-server stopped"),
            Ok(Err(e)) => tracing::warn!(pid = ?handle.pid, error = %e, "Failed to wait for app-server"),
            Err(_) => {
                tracing::warn!(
                    pid = ?handle.pid,
                    grace = ?TERMINATE_GRACE,
                    "app-server ignored SIGTERM, killing"
                );
                if let Err(e) = handle.child.kill().await {
                    tracing::error!(pid = ?handle.pid, error = %e, "Failed to kill app-server");
                }
            }
        }
    }

    /// Restart and re-initialize a dead child. Returns whether a restart happened.
    ///
    /// Single attempt, no backoff. Invalidates every id pending on the old
    /// transport, so only the supervising health loop should call this.
    pub async fn ensure_alive(&self) -> Result<bool, BridgeError> {
        if self.is_alive().await {
            return Ok(false);
        }
        tracing::warn!("app-server is not running, restarting");
        self.stop().await;
        self.start().await?;
        self.initialize(self.config.init_timeout).await?;
        Ok(true)
    }

    pub async fn transport(&self) -> Option<Arc<MessageTransport>> {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| Arc::clone(&h.transport))
    }

    pub async fn pid(&self) -> Option<u32> {
        self.handle.lock().await.as_ref().and_then(|h| h.pid)
    }

    pub async fn is_initialized(&self) -> bool {
        self.handle
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| h.initialized)
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        self.handle.lock().await.as_ref().map(|h| h.started_at)
    }
}

/// Read raw lines until the handshake response arrives.
async fn read_handshake_reply(transport: &MessageTransport) -> Result<Value, BridgeError> {
    loop {
        match transport.read_line().await {
            Inbound::Message(Envelope::Response(resp)) if resp.id == HANDSHAKE_ID => {
                return resp.outcome.map_err(BridgeError::Handshake);
            }
            Inbound::Message(other) => {
                tracing::debug!(
                    id = ?other.id(),
                    method = ?other.method(),
                    "Ignoring message during handshake"
                );
            }
            Inbound::Skipped => {}
            Inbound::Closed => return Err(BridgeError::ProcessClosed),
        }
    }
}

/// Forward child stderr to tracing. Never parsed as protocol.
fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::debug!(target: "codex_bridge::child", pid = ?pid, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(target: "codex_bridge::child", pid = ?pid, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to terminate app-server");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bridge::protocol::RpcError;
    use crate::test_support::ScriptSpawner;

    const HANDSHAKE_OK: &str = r#"
read -r line
printf '%s\n' '{"method":"codex/event","params":{}}'
printf '%s\n' 'not json'
printf '%s\n' '{"method":"item/tool/call","id":0,"params":{}}'
printf '%s\n' '{"id":0,"result":{"userAgent":"codex/0.1"}}'
read -r line
printf '%s\n' "$line" > "$1"
exec cat > /dev/null
"#;

    fn supervisor(script: &'static str) -> (ProcessSupervisor, tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let side_channel = dir.path().join("side-channel");
        let config = SupervisorConfig::default()
            .with_spawner(Arc::new(ScriptSpawner::new(script, side_channel.clone())));
        (ProcessSupervisor::new(config), dir, side_channel)
    }

    async fn wait_for_file(path: &Path) -> String {
        for _ in 0..250 {
            if let Ok(contents) = std::fs::read_to_string(path)
                && !contents.is_empty()
            {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} was never written", path.display());
    }

    #[tokio::test]
    async fn handshake_success_sends_initialized() {
        let (sup, _dir, side_channel) = supervisor(HANDSHAKE_OK);
        sup.start().await.unwrap();
        assert!(sup.is_alive().await);
        assert!(!sup.is_initialized().await);

        let result = sup.initialize(Duration::from_secs(10)).await.unwrap();
        assert_eq!(result, json!({"userAgent": "codex/0.1"}));
        assert!(sup.is_initialized().await);

        let sent = wait_for_file(&side_channel).await;
        assert_eq!(sent.trim(), r#"{"method":"initialized","params":{}}"#);

        sup.stop().await;
        assert!(!sup.is_alive().await);
        assert!(sup.pid().await.is_none());
    }

    #[tokio::test]
    async fn handshake_error_aborts_without_initialized() {
        let (sup, _dir, side_channel) = supervisor(
            r#"
read -r line
printf '%s\n' '{"id":0,"error":{"code":-32600,"message":"unsupported client"}}'
if read -r next; then printf '%s\n' "$next" > "$1"; fi
"#,
        );
        sup.start().await.unwrap();

        let err = sup.initialize(Duration::from_secs(10)).await.unwrap_err();
        match err {
            BridgeError::Handshake(RpcError { code, message, .. }) => {
                assert_eq!(code, -32600);
                assert_eq!(message, "unsupported client");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!sup.is_initialized().await);

        sup.stop().await;
        assert!(!side_channel.exists());
    }

    #[tokio::test]
    async fn handshake_fails_when_output_closes() {
        let (sup, _dir, _) = supervisor("read -r line; exit 0");
        sup.start().await.unwrap();

        let err = sup.initialize(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, BridgeError::ProcessClosed));
    }

    #[tokio::test]
    async fn handshake_times_out() {
        let (sup, _dir, _) = supervisor("read -r line; exec sleep 30");
        sup.start().await.unwrap();

        let err = sup
            .initialize(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::HandshakeTimeout(_)));
        assert!(err.is_timeout());

        sup.stop().await;
        assert!(!sup.is_alive().await);
    }

    #[tokio::test]
    async fn initialize_requires_running_child() {
        let (sup, _dir, _) = supervisor(HANDSHAKE_OK);
        let err = sup.initialize(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotRunning));
    }

    #[tokio::test]
    async fn second_initialize_is_rejected() {
        let (sup, _dir, _) = supervisor(HANDSHAKE_OK);
        sup.start().await.unwrap();
        sup.initialize(Duration::from_secs(10)).await.unwrap();

        let err = sup.initialize(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyInitialized));
        sup.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_while_alive() {
        let (sup, _dir, _) = supervisor(HANDSHAKE_OK);
        sup.start().await.unwrap();
        let pid = sup.pid().await;
        let transport = sup.transport().await.unwrap();

        sup.start().await.unwrap();
        assert_eq!(sup.pid().await, pid);
        assert!(Arc::ptr_eq(&transport, &sup.transport().await.unwrap()));
        assert!(sup.started_at().await.is_some());
        sup.stop().await;
    }

    #[tokio::test]
    async fn stop_without_child_is_noop() {
        let (sup, _dir, _) = supervisor(HANDSHAKE_OK);
        sup.stop().await;
        assert!(!sup.is_alive().await);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_kills_child_that_ignores_sigterm() {
        let (sup, _dir, _) = supervisor("trap '' TERM; while :; do sleep 1; done");
        sup.start().await.unwrap();

        sup.stop().await;
        assert!(!sup.is_alive().await);
        assert!(sup.transport().await.is_none());
    }

    #[tokio::test]
    async fn ensure_alive_restarts_exited_child() {
        let (sup, _dir, _) = supervisor(
            r#"
read -r line
printf '%s\n' '{"id":0,"result":{}}'
read -r line
exit 0
"#,
        );
        sup.start().await.unwrap();
        sup.initialize(Duration::from_secs(10)).await.unwrap();

        for _ in 0..250 {
            if !sup.is_alive().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!sup.is_alive().await);
        let old_pid = sup.pid().await;

        assert!(sup.ensure_alive().await.unwrap());
        assert!(sup.is_initialized().await);
        assert_ne!(sup.pid().await, old_pid);
        sup.stop().await;
    }
}
