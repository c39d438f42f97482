//! Request/response correlation over the app-server line protocol.
//!
//! One pump task per transport reads every inbound message and routes it:
//! responses resolve the matching pending call, notifications fan out to
//! subscriptions. The pump is the only resolver. When it ends, every pending
//! call is failed so no caller outlives the transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Envelope, RequestId};
use crate::bridge::transport::MessageTransport;
use crate::error::BridgeError;
use crate::subscriptions::{
    NotificationFilter, NotificationHandler, Subscription, SubscriptionId, SubscriptionRegistry,
};

type CallResult = Result<Value, BridgeError>;

struct PendingCall {
    method: String,
    created_at: Instant,
    reply: oneshot::Sender<CallResult>,
}

/// Why the pump stopped; decides how outstanding calls fail.
#[derive(Debug, Clone, Copy)]
enum StopReason {
    Cancelled,
    OutputClosed,
}

impl StopReason {
    fn error(self) -> BridgeError {
        match self {
            Self::Cancelled => BridgeError::EngineStopped,
            Self::OutputClosed => BridgeError::ProcessClosed,
        }
    }
}

/// State shared between callers and the pump for one transport.
struct Session {
    transport: Arc<MessageTransport>,
    pending: DashMap<RequestId, PendingCall>,
    /// Requests the pump to stop.
    cancel: CancellationToken,
    /// Cancelled by the pump just before it fails outstanding calls.
    closed: CancellationToken,
}

impl Session {
    fn fail_all(&self, reason: StopReason) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| *e.key()).collect();
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), ?reason, "Failing outstanding calls");
        }
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                tracing::debug!(id, method = %call.method, "Failing pending call");
                let _ = call.reply.send(Err(reason.error()));
            }
        }
    }
}

struct ActiveSession {
    shared: Arc<Session>,
    task: JoinHandle<()>,
}

/// Removes a pending entry on every exit path of `call`.
struct PendingGuard<'a> {
    pending: &'a DashMap<RequestId, PendingCall>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct ProtocolEngine {
    next_id: AtomicU64,
    default_timeout: Duration,
    subscriptions: Arc<SubscriptionRegistry>,
    session: RwLock<Option<ActiveSession>>,
}

impl ProtocolEngine {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            default_timeout,
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            session: RwLock::new(None),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Next request id. Starts at 1 and is never reused, even across restarts.
    pub fn next_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start the pump over `transport`. No-op while a pump is running.
    pub async fn start(&self, transport: Arc<MessageTransport>) {
        let mut slot = self.session.write().await;
        if let Some(active) = slot.as_ref()
            && !active.shared.closed.is_cancelled()
        {
            tracing::debug!("Message pump already running");
            return;
        }

        let messages = transport.messages().await;
        let shared = Arc::new(Session {
            transport,
            pending: DashMap::new(),
            cancel: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        let task = tokio::spawn(run_pump(
            Arc::clone(&shared),
            Arc::clone(&self.subscriptions),
            messages,
        ));
        *slot = Some(ActiveSession { shared, task });
        tracing::info!("Message pump started");
    }

    /// Stop the pump and fail outstanding calls with `EngineStopped`.
    pub async fn stop(&self) {
        let Some(active) = self.session.write().await.take() else {
            return;
        };
        active.shared.cancel.cancel();
        if let Err(e) = active.task.await {
            tracing::error!(error = %e, "Message pump task failed");
        }
        // The pump may already have ended; make sure nothing is left waiting.
        active.shared.closed.cancel();
        active.shared.fail_all(StopReason::Cancelled);
        tracing::info!("Message pump stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|a| !a.shared.closed.is_cancelled())
    }

    /// Size of the correlation table.
    pub async fn pending_calls(&self) -> usize {
        self.session
            .read()
            .await
            .as_ref()
            .map(|a| a.shared.pending.len())
            .unwrap_or(0)
    }

    /// Token cancelled once the current pump has ended (already cancelled if none runs).
    pub async fn stopped(&self) -> CancellationToken {
        match self.session.read().await.as_ref() {
            Some(active) => active.shared.closed.clone(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    async fn current_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|a| Arc::clone(&a.shared))
    }

    /// Send a request and wait for its response.
    ///
    /// `None` uses the engine's default timeout. A timeout only abandons the
    /// local wait; a late response for the id is dropped by the pump.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let session = self.current_session().await.ok_or(BridgeError::NotRunning)?;

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        session.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                created_at: Instant::now(),
                reply: tx,
            },
        );
        let _guard = PendingGuard {
            pending: &session.pending,
            id,
        };

        // Registered first, so a pump that is draining either sees this entry
        // or has already closed.
        if session.closed.is_cancelled() {
            return Err(BridgeError::NotRunning);
        }

        tracing::debug!(method, id, "Calling app-server");
        session
            .transport
            .send(Envelope::request(id, method, params))
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::EngineStopped),
            Err(_) => {
                tracing::warn!(method, id, ?timeout, "Request timed out");
                Err(BridgeError::RequestTimeout {
                    method: method.to_string(),
                    id,
                    timeout,
                })
            }
        }
    }

    /// Register a handler for `method`. Handlers run on the pump in registration order.
    pub fn on_notification(&self, method: &str, handler: NotificationHandler) -> SubscriptionId {
        self.subscriptions.add(method, handler, None)
    }

    /// No-op if the subscription is not registered.
    pub fn remove_notification_handler(&self, method: &str, id: SubscriptionId) -> bool {
        self.subscriptions.remove(method, id)
    }

    pub fn handler_count(&self, method: &str) -> usize {
        self.subscriptions.handler_count(method)
    }

    /// Register a handler that stays subscribed for as long as the guard lives.
    pub fn subscribe(
        &self,
        method: &str,
        handler: NotificationHandler,
        filter: Option<NotificationFilter>,
    ) -> Subscription {
        let id = self.subscriptions.add(method, handler, filter);
        Subscription::new(Arc::clone(&self.subscriptions), method.to_string(), id)
    }

    /// Wait for the first `method` notification accepted by `filter`.
    pub async fn wait_for_notification(
        &self,
        method: &str,
        filter: Option<NotificationFilter>,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let stopped = self.stopped().await;
        if stopped.is_cancelled() {
            return Err(BridgeError::NotRunning);
        }

        // Capacity one: the first match wins, later ones are ignored.
        let (tx, mut rx) = mpsc::channel(1);
        let handler: NotificationHandler = Arc::new(move |params| {
            let _ = tx.try_send(params.clone());
            Ok(())
        });
        let _subscription = self.subscribe(method, handler, filter);

        tokio::select! {
            biased;
            received = rx.recv() => received.ok_or(BridgeError::EngineStopped),
            _ = stopped.cancelled() => Err(BridgeError::EngineStopped),
            _ = tokio::time::sleep(timeout) => Err(BridgeError::NotificationTimeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }
}

async fn run_pump(
    session: Arc<Session>,
    subscriptions: Arc<SubscriptionRegistry>,
    mut messages: BoxStream<'static, Envelope>,
) {
    let reason = loop {
        tokio::select! {
            biased;

            _ = session.cancel.cancelled() => break StopReason::Cancelled,

            message = messages.next() => match message {
                Some(envelope) => route(&session, &subscriptions, envelope),
                None => break StopReason::OutputClosed,
            },
        }
    };

    tracing::info!(?reason, "Message pump exiting");
    session.closed.cancel();
    session.fail_all(reason);
}

fn route(session: &Session, subscriptions: &SubscriptionRegistry, envelope: Envelope) {
    match envelope {
        Envelope::Response(response) => match session.pending.remove(&response.id) {
            Some((_, call)) => {
                tracing::debug!(
                    id = response.id,
                    method = %call.method,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "Resolving call"
                );
                let _ = call.reply.send(response.outcome.map_err(BridgeError::Rpc));
            }
            None => {
                tracing::warn!(id = response.id, "Dropping response with no pending call");
            }
        },
        Envelope::Notification(notification) => {
            let invoked = subscriptions.dispatch(&notification.method, &notification.params);
            tracing::trace!(method = %notification.method, invoked, "Dispatched notification");
        }
        Envelope::Request(request) => {
            tracing::warn!(
                method = %request.method,
                id = request.id,
                "Dropping request from app-server"
            );
        }
    }
}
