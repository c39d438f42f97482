//! BridgeService: wires the supervisor, engine and tracker together.
//!
//! This service owns:
//! - Startup (spawn, handshake, pump) and shutdown ordering
//! - Health tracking (state, setup result, app-server version)
//! - The supervising health loop, the only caller of `ensure_alive`
//!
//! Transports (HTTP) delegate to this service and never touch the core directly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::BridgeConfig;
use crate::engine::ProtocolEngine;
use crate::error::BridgeError;
use crate::health::{Health, SetupResult};
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::tracker::{OperationSpec, OperationTracker};
use crate::version::VersionInfo;

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub state: Health,
    pub codex_alive: bool,
    pub initialized: bool,
    pub pid: Option<u32>,
    pub pending_calls: usize,
    /// When the current child was spawned (RFC 3339).
    pub started_at: Option<String>,
    pub setup_result: Option<SetupResult>,
    pub version: VersionInfo,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.state == Health::Ready && self.codex_alive
    }
}

pub struct BridgeService {
    supervisor: ProcessSupervisor,
    engine: Arc<ProtocolEngine>,
    tracker: OperationTracker,

    health: RwLock<Health>,
    setup_result: RwLock<Option<SetupResult>>,
    version: RwLock<VersionInfo>,

    health_check_interval: Option<Duration>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BridgeService {
    /// Nothing is spawned until `start()`.
    pub fn new(supervisor_config: SupervisorConfig, request_timeout: Duration) -> Self {
        let engine = Arc::new(ProtocolEngine::new(request_timeout));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            supervisor: ProcessSupervisor::new(supervisor_config),
            tracker: OperationTracker::new(Arc::clone(&engine)),
            engine,
            health: RwLock::new(Health::Unknown),
            setup_result: RwLock::new(None),
            version: RwLock::new(VersionInfo::new()),
            health_check_interval: Some(Duration::from_secs(5)),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.supervisor_config(), config.request_timeout)
            .with_health_check_interval(config.health_check_interval)
    }

    /// `None` disables the health loop.
    pub fn with_health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    /// Spawn the app-server, run the handshake and start the message pump.
    pub async fn start(&self) -> Result<(), BridgeError> {
        *self.health.write().await = Health::Starting;
        let setup = SetupResult::starting();

        match self.bring_up().await {
            Ok(()) => {
                *self.setup_result.write().await = Some(setup.succeeded());
                *self.health.write().await = Health::Ready;
                let pid = self.supervisor.pid().await;
                tracing::info!(pid = ?pid, "Bridge ready");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Bridge startup failed");
                self.supervisor.stop().await;
                *self.setup_result.write().await = Some(setup.failed(e.to_string()));
                *self.health.write().await = Health::SetupFailed;
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<(), BridgeError> {
        self.supervisor.start().await?;
        let handshake = self
            .supervisor
            .initialize(self.supervisor.config().init_timeout)
            .await?;
        self.record_handshake(&handshake).await;

        let transport = self
            .supervisor
            .transport()
            .await
            .ok_or(BridgeError::NotRunning)?;
        self.engine.start(transport).await;
        Ok(())
    }

    async fn record_handshake(&self, handshake: &Value) {
        if let Some(user_agent) = handshake.get("userAgent").and_then(Value::as_str) {
            tracing::info!(user_agent, "app-server identified");
            let version = VersionInfo::new().with_codex(user_agent.to_string());
            *self.version.write().await = version;
        }
    }

    /// Stop the pump (failing outstanding calls), then the child.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.engine.stop().await;
        self.supervisor.stop().await;
        tracing::info!("Bridge shut down");
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// One health-loop tick. Returns whether a restart happened.
    ///
    /// Not safe to run concurrently with itself: a restart invalidates every
    /// pending id, which is why only the health loop calls it.
    pub async fn check_and_recover(&self) -> Result<bool, BridgeError> {
        if *self.shutdown_rx.borrow() {
            return Ok(false);
        }
        let alive = self.supervisor.is_alive().await;
        if alive && self.engine.is_running().await {
            return Ok(false);
        }

        tracing::warn!(codex_alive = alive, "app-server unavailable, recovering");
        *self.health.write().await = Health::Recovering;
        self.engine.stop().await;

        match self.recover(alive).await {
            Ok(()) => {
                *self.health.write().await = Health::Ready;
                let pid = self.supervisor.pid().await;
                tracing::info!(pid = ?pid, "app-server recovered");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(error = %e, "app-server recovery failed");
                // Leave nothing half-initialized for the next tick.
                self.supervisor.stop().await;
                *self.health.write().await = Health::Defunct;
                Err(e)
            }
        }
    }

    async fn recover(&self, alive: bool) -> Result<(), BridgeError> {
        if alive {
            // The pump ended under a live child; its output is gone, so replace it.
            self.supervisor.stop().await;
        }
        self.supervisor.ensure_alive().await?;
        let transport = self
            .supervisor
            .transport()
            .await
            .ok_or(BridgeError::NotRunning)?;
        self.engine.start(transport).await;
        Ok(())
    }

    /// Spawn the supervising loop. Returns `None` when the interval is disabled.
    ///
    /// One recovery attempt per tick, no backoff. Exits on `shutdown()`.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.health_check_interval?;
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately; the service was just started.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }

                    _ = ticker.tick() => {
                        if let Err(e) = service.check_and_recover().await {
                            tracing::warn!(error = %e, "Health check will retry");
                        }
                    }
                }
            }
            tracing::debug!("Health monitor stopped");
        }))
    }

    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: *self.health.read().await,
            codex_alive: self.supervisor.is_alive().await,
            initialized: self.supervisor.is_initialized().await,
            pid: self.supervisor.pid().await,
            pending_calls: self.engine.pending_calls().await,
            started_at: self
                .supervisor
                .started_at()
                .await
                .map(|t| t.to_rfc3339()),
            setup_result: self.setup_result.read().await.clone(),
            version: self.version.read().await.clone(),
        }
    }

    pub async fn version(&self) -> VersionInfo {
        self.version.read().await.clone()
    }

    /// Fire-and-reply call with the default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        self.engine.call(method, params, None).await
    }

    /// Start/await operation with the default timeout.
    pub async fn start_and_await(
        &self,
        spec: &OperationSpec,
        params: Value,
    ) -> Result<Value, BridgeError> {
        self.tracker.start_and_await(spec, params, None).await
    }

    /// Run the pump over an in-memory transport, skipping the child entirely.
    #[cfg(test)]
    pub(crate) async fn start_with_transport(
        &self,
        transport: Arc<crate::bridge::transport::MessageTransport>,
    ) {
        self.engine.start(transport).await;
        *self.health.write().await = Health::Ready;
    }
}
