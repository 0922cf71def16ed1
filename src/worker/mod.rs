//! Background worker protocol and lifecycle.
//!
//! The worker itself is a separately deployed artifact. This module only describes
//! how to talk to it: correlated request/response messages and the lifecycle signals
//! it broadcasts. The message shapes must stay in lockstep with the worker script.

mod checker;

pub use checker::*;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::errors::CheckError;
use crate::events::{EventBus, UpdateEvent};

/// Requests understood by the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    VersionCheck,
    ClearCaches,
    SkipWaiting,
}

/// A message on the wire, correlated by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message: WorkerMessage,
    pub sent_at: DateTime<Utc>,
}

impl WorkerEnvelope {
    pub fn new(message: WorkerMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            sent_at: Utc::now(),
        }
    }
}

/// Replies sent back by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    Ack,
    VersionCheck { ready: bool },
    CachesCleared { deleted: Vec<String> },
}

/// Notifications from the worker's own state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// A new worker is installed and waiting to take control
    Waiting,
    Activating,
    /// Worker activated; `first_install` when no worker controlled the page before
    Activated { first_install: bool },
    /// A new worker has taken control of the page
    ControllerChanged,
}

/// Observed worker lifecycle. Transitions are driven by the worker, not by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerLifecycleState {
    #[default]
    Unregistered,
    Registering,
    Registered,
    WaitingToActivate,
    Activating,
    Active,
}

impl WorkerLifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerLifecycleState::Unregistered => "unregistered",
            WorkerLifecycleState::Registering => "registering",
            WorkerLifecycleState::Registered => "registered",
            WorkerLifecycleState::WaitingToActivate => "waiting-to-activate",
            WorkerLifecycleState::Activating => "activating",
            WorkerLifecycleState::Active => "active",
        }
    }

    /// State after the worker reports `signal`.
    pub fn observe(self, signal: LifecycleSignal) -> Self {
        match signal {
            LifecycleSignal::Waiting => WorkerLifecycleState::WaitingToActivate,
            LifecycleSignal::Activating => WorkerLifecycleState::Activating,
            LifecycleSignal::Activated { .. } | LifecycleSignal::ControllerChanged => {
                WorkerLifecycleState::Active
            }
        }
    }
}

impl std::fmt::Display for WorkerLifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrow view of the runtime's background worker facilities.
#[async_trait]
pub trait WorkerHost: Send + Sync {
    fn is_supported(&self) -> bool;

    async fn register(&self, script_url: &str, scope: &str) -> Result<(), CheckError>;

    /// Unregister this application's worker. `Ok(false)` when none was registered.
    async fn unregister(&self) -> Result<bool, CheckError>;

    /// Unregister every known registration, returning how many were removed.
    async fn unregister_all(&self) -> Result<usize, CheckError>;

    async fn post_message(&self, envelope: WorkerEnvelope) -> Result<WorkerReply, CheckError>;

    /// Whether a worker currently controls the page.
    fn has_controller(&self) -> bool;

    fn signals(&self) -> broadcast::Receiver<LifecycleSignal>;
}

/// Send `message` and wait for the correlated reply, bounded by `timeout`.
pub async fn send_message(
    host: &dyn WorkerHost,
    message: WorkerMessage,
    timeout: Duration,
) -> Result<WorkerReply, CheckError> {
    let envelope = WorkerEnvelope::new(message);
    let id = envelope.id;
    match tokio::time::timeout(timeout, host.post_message(envelope)).await {
        Ok(reply) => reply,
        Err(_) => Err(CheckError::Timeout(format!(
            "Worker did not answer {:?} ({}) within {:?}",
            message, id, timeout
        ))),
    }
}

/// Callbacks handed to page code so it can invalidate caches on its own terms.
#[derive(Clone)]
pub struct UpdateActions {
    host: Arc<dyn WorkerHost>,
    events: EventBus,
    timeout: Duration,
}

impl UpdateActions {
    pub fn new(host: Arc<dyn WorkerHost>, events: EventBus, timeout: Duration) -> Self {
        Self {
            host,
            events,
            timeout,
        }
    }

    /// Ask the worker to drop its caches; publishes `cache-cleared` on success.
    pub async fn clear_caches(&self) -> Result<Vec<String>, CheckError> {
        let reply = send_message(self.host.as_ref(), WorkerMessage::ClearCaches, self.timeout).await?;
        let deleted = match reply {
            WorkerReply::CachesCleared { deleted } => deleted,
            _ => Vec::new(),
        };
        tracing::info!("Worker cleared {} caches", deleted.len());
        self.events.publish(UpdateEvent::CacheCleared {
            deleted: deleted.clone(),
        });
        Ok(deleted)
    }

    /// Ask the waiting worker to take control now.
    pub async fn force_update(&self) -> Result<(), CheckError> {
        send_message(self.host.as_ref(), WorkerMessage::SkipWaiting, self.timeout).await?;
        Ok(())
    }
}

impl std::fmt::Debug for UpdateActions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateActions")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingWorkerHost;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = WorkerEnvelope::new(WorkerMessage::SkipWaiting);
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "SKIP_WAITING");
        assert!(json["id"].is_string());
        assert!(json["sentAt"].is_string());

        let reply: WorkerReply =
            serde_json::from_str(r#"{"type":"CACHES_CLEARED","deleted":["app-v1"]}"#).unwrap();
        assert_eq!(
            reply,
            WorkerReply::CachesCleared {
                deleted: vec!["app-v1".to_string()]
            }
        );
    }

    #[test]
    fn test_lifecycle_follows_signals() {
        let state = WorkerLifecycleState::Registered
            .observe(LifecycleSignal::Waiting)
            .observe(LifecycleSignal::Activating);
        assert_eq!(state, WorkerLifecycleState::Activating);
        assert_eq!(
            state.observe(LifecycleSignal::Activated {
                first_install: false
            }),
            WorkerLifecycleState::Active
        );
        assert_eq!(WorkerLifecycleState::WaitingToActivate.to_string(), "waiting-to-activate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_times_out() {
        let host = RecordingWorkerHost::new().silent();
        let err = send_message(&host, WorkerMessage::VersionCheck, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_actions_clear_caches_publishes_event() {
        let host = Arc::new(RecordingWorkerHost::new());
        let events = EventBus::default();
        let mut sub = events.subscribe();
        let actions = UpdateActions::new(host.clone(), events, Duration::from_secs(1));

        let deleted = actions.clear_caches().await.unwrap();
        actions.force_update().await.unwrap();

        assert_eq!(deleted, vec!["build-sentinel-static-v1".to_string()]);
        assert_eq!(
            host.messages(),
            vec![WorkerMessage::ClearCaches, WorkerMessage::SkipWaiting]
        );
        assert_eq!(sub.try_recv().map(|e| e.name()), Some("cache-cleared"));
    }
}
