//! Start/await-completion correlation.
//!
//! Some app-server operations (e.g. `turn/start`) reply at once with an
//! in-progress entity and report the real result later through a completion
//! notification, preceded by interim item notifications. The tracker
//! subscribes before issuing the start call, matches the completion by the
//! entity id from the immediate reply, and folds the interim items into the
//! result when the completion carries none of its own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::engine::ProtocolEngine;
use crate::error::BridgeError;
use crate::subscriptions::NotificationHandler;

/// Methods and payload layout of one start/await operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    pub start_method: String,
    pub completion_method: String,
    pub interim_method: Option<String>,
    /// Key of the tracked entity in replies and completions, e.g. `turn`.
    pub entity: String,
}

impl OperationSpec {
    /// The entity key defaults to the start method's prefix (`turn` for `turn/start`).
    pub fn new(start_method: impl Into<String>, completion_method: impl Into<String>) -> Self {
        let start_method = start_method.into();
        let entity = start_method
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            start_method,
            completion_method: completion_method.into(),
            interim_method: None,
            entity,
        }
    }

    pub fn with_interim(mut self, method: impl Into<String>) -> Self {
        self.interim_method = Some(method.into());
        self
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = entity.into();
        self
    }

    fn operation_id(&self, payload: &Value) -> Option<String> {
        match payload.pointer(&format!("/{}/id", self.entity))? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Use `interim` as the completion's items unless it already has some.
    fn splice_items(&self, mut completion: Value, interim: Vec<Value>) -> Value {
        if interim.is_empty() {
            return completion;
        }
        let Some(Value::Object(entity)) = completion.get_mut(&self.entity) else {
            return completion;
        };
        match entity.get("items") {
            Some(Value::Array(items)) if !items.is_empty() => {}
            Some(Value::Array(_)) | Some(Value::Null) | None => {
                entity.insert("items".to_string(), Value::Array(interim));
            }
            Some(other) => {
                tracing::warn!(entity = %self.entity, ?other, "Completion items are not a list");
            }
        }
        completion
    }
}

/// Notifications observed while an operation is in flight, in arrival order.
enum Observed {
    Interim(Value),
    Completion(Value),
}

pub struct OperationTracker {
    engine: Arc<ProtocolEngine>,
}

impl OperationTracker {
    pub fn new(engine: Arc<ProtocolEngine>) -> Self {
        Self { engine }
    }

    /// Issue `spec.start_method` and wait for its matching completion.
    ///
    /// `timeout` bounds the wait for the completion (the start call itself uses
    /// the engine default). One tracked operation per method pair at a time:
    /// interim items are not filtered by id.
    pub async fn start_and_await(
        &self,
        spec: &OperationSpec,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let timeout = timeout.unwrap_or(self.engine.default_timeout());
        let stopped = self.engine.stopped().await;

        // Subscribe before the start call so an early completion is never missed.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let on_completion: NotificationHandler = {
            let tx = tx.clone();
            Arc::new(move |params| {
                let _ = tx.send(Observed::Completion(params.clone()));
                Ok(())
            })
        };
        let _completion = self
            .engine
            .subscribe(&spec.completion_method, on_completion, None);
        let _interim = spec.interim_method.as_deref().map(|method| {
            let on_interim: NotificationHandler = Arc::new(move |params| {
                let item = params.get("item").cloned().unwrap_or_else(|| params.clone());
                let _ = tx.send(Observed::Interim(item));
                Ok(())
            });
            self.engine.subscribe(method, on_interim, None)
        });

        let started = self.engine.call(&spec.start_method, params, None).await?;
        let Some(expected_id) = spec.operation_id(&started) else {
            tracing::warn!(
                method = %spec.start_method,
                "No operation id in start reply, treating it as final"
            );
            return Ok(started);
        };
        tracing::debug!(
            method = %spec.start_method,
            operation_id = %expected_id,
            "Awaiting completion"
        );

        let mut interim = Vec::new();
        let wait = async {
            while let Some(observed) = rx.recv().await {
                match observed {
                    Observed::Interim(item) => interim.push(item),
                    Observed::Completion(payload) => {
                        if spec.operation_id(&payload).as_deref() == Some(expected_id.as_str()) {
                            return Ok(payload);
                        }
                        tracing::debug!(
                            method = %spec.completion_method,
                            operation_id = ?spec.operation_id(&payload),
                            "Ignoring completion for another operation"
                        );
                    }
                }
            }
            Err(BridgeError::EngineStopped)
        };

        let outcome = tokio::select! {
            biased;
            completion = wait => completion,
            _ = stopped.cancelled() => Err(BridgeError::EngineStopped),
            _ = tokio::time::sleep(timeout) => Err(BridgeError::OperationTimeout {
                expected_id: expected_id.clone(),
                timeout,
            }),
        };

        match outcome {
            Ok(completion) => {
                tracing::debug!(
                    operation_id = %expected_id,
                    interim_items = interim.len(),
                    "Operation completed"
                );
                Ok(spec.splice_items(completion, interim))
            }
            Err(e) => {
                tracing::warn!(operation_id = %expected_id, error = %e, "Operation did not complete");
                Err(e)
            }
        }
    }
}
