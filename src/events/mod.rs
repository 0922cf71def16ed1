//! Typed publish/subscribe channel for update notifications.
//!
//! Publishing is fire-and-forget: events sent while nobody is subscribed are dropped,
//! and a subscriber that falls too far behind skips the oldest events.

use tokio::sync::broadcast;

use crate::errors::CheckError;
use crate::models::VersionDescriptor;
use crate::worker::UpdateActions;

const DEFAULT_CAPACITY: usize = 64;

/// What raised a `sw-update-available` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A new worker finished installing and is waiting to take control
    Lifecycle,
    /// A descriptor check found a different build
    VersionCheck,
}

#[derive(Debug, Clone)]
pub enum UpdateEvent {
    CheckStarted,
    CheckCompleted {
        success: bool,
        update_available: bool,
        current: Option<VersionDescriptor>,
        latest: Option<VersionDescriptor>,
    },
    CheckFailed {
        error: CheckError,
        attempt: u32,
    },
    UpdateAvailable {
        current: Option<VersionDescriptor>,
        latest: VersionDescriptor,
    },
    WorkerRegistered {
        scope: String,
    },
    WorkerUpdateReady {
        origin: UpdateOrigin,
        current: Option<VersionDescriptor>,
        latest: Option<VersionDescriptor>,
        actions: UpdateActions,
    },
    WorkerUpdated,
    CacheCleared {
        deleted: Vec<String>,
    },
    OfflineReady,
}

impl UpdateEvent {
    /// Stable event name, as seen by page code.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateEvent::CheckStarted => "check-started",
            UpdateEvent::CheckCompleted { .. } => "check-completed",
            UpdateEvent::CheckFailed { .. } => "check-failed",
            UpdateEvent::UpdateAvailable { .. } => "update-available",
            UpdateEvent::WorkerRegistered { .. } => "sw-registered",
            UpdateEvent::WorkerUpdateReady { .. } => "sw-update-available",
            UpdateEvent::WorkerUpdated => "sw-updated",
            UpdateEvent::CacheCleared { .. } => "cache-cleared",
            UpdateEvent::OfflineReady => "offline-ready",
        }
    }
}

/// Cloneable handle to the event channel shared by every component.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UpdateEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish to every live subscriber, returning how many were reached.
    pub fn publish(&self, event: UpdateEvent) -> usize {
        tracing::trace!(event = event.name(), "publishing update event");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live subscription; dropping it (or calling [`Subscription::unsubscribe`]) detaches it.
pub struct Subscription {
    rx: broadcast::Receiver<UpdateEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<UpdateEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next already-published event without waiting.
    pub fn try_recv(&mut self) -> Option<UpdateEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain everything published so far.
    pub fn drain(&mut self) -> Vec<UpdateEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn unsubscribe(self) {}
}
