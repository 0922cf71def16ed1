//! Process-wide instances of each component.
//!
//! Nothing is constructed implicitly: the application calls `create_*` at start-up,
//! other modules look instances up with the getters, and `destroy_*` tears them down.
//! Creating a new instance tears down the one it replaces.

use std::sync::{Arc, Mutex};

use crate::checker::{lock, VersionChecker};
use crate::config::{CheckConfig, WorkerOptions};
use crate::coordinator::{Coordinator, CoordinatorDeps, CoordinatorOptions};
use crate::errors::CheckError;
use crate::events::EventBus;
use crate::fetch::DescriptorSource;
use crate::store::StateStore;
use crate::worker::{WorkerAwareChecker, WorkerHost};

struct Slot<T> {
    value: Mutex<Option<T>>,
}

impl<T: Clone> Slot<T> {
    const fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    fn install(&self, value: T) -> Option<T> {
        lock(&self.value).replace(value)
    }

    fn get(&self) -> Option<T> {
        lock(&self.value).clone()
    }

    fn take(&self) -> Option<T> {
        lock(&self.value).take()
    }
}

static CHECKER: Slot<VersionChecker> = Slot::new();
static WORKER_CHECKER: Slot<WorkerAwareChecker> = Slot::new();
static COORDINATOR: Slot<Coordinator> = Slot::new();

pub async fn create_checker(
    config: CheckConfig,
    source: Arc<dyn DescriptorSource>,
    store: Arc<dyn StateStore>,
    events: EventBus,
) -> Result<VersionChecker, CheckError> {
    let checker = VersionChecker::new(config, source, store, events).await?;
    if let Some(previous) = CHECKER.install(checker.clone()) {
        previous.stop();
        tracing::debug!("Replaced process-wide version checker");
    }
    Ok(checker)
}

pub fn checker() -> Option<VersionChecker> {
    CHECKER.get()
}

pub fn destroy_checker() {
    if let Some(checker) = CHECKER.take() {
        checker.stop();
    }
}

pub async fn create_worker_checker(
    config: CheckConfig,
    options: WorkerOptions,
    source: Arc<dyn DescriptorSource>,
    store: Arc<dyn StateStore>,
    host: Arc<dyn WorkerHost>,
    events: EventBus,
) -> Result<WorkerAwareChecker, CheckError> {
    let checker = WorkerAwareChecker::new(config, options, source, store, host, events).await?;
    if let Some(previous) = WORKER_CHECKER.install(checker.clone()) {
        previous.destroy().await;
        tracing::debug!("Replaced process-wide worker-aware checker");
    }
    Ok(checker)
}

pub fn worker_checker() -> Option<WorkerAwareChecker> {
    WORKER_CHECKER.get()
}

pub async fn destroy_worker_checker() {
    if let Some(checker) = WORKER_CHECKER.take() {
        checker.destroy().await;
    }
}

/// Construct a coordinator and install it. It still has to be initialized.
pub async fn create_coordinator(
    options: CoordinatorOptions,
    deps: CoordinatorDeps,
) -> Coordinator {
    let coordinator = Coordinator::new(options, deps);
    if let Some(previous) = COORDINATOR.install(coordinator.clone()) {
        previous.shutdown().await;
    }
    coordinator
}

pub fn coordinator() -> Option<Coordinator> {
    COORDINATOR.get()
}

pub async fn destroy_coordinator() {
    if let Some(coordinator) = COORDINATOR.take() {
        coordinator.shutdown().await;
    }
}

pub(crate) fn publish_coordinator(coordinator: Coordinator) {
    let previous = COORDINATOR.install(coordinator.clone());
    if previous.is_some_and(|p| !p.ptr_eq(&coordinator)) {
        tracing::warn!("Another coordinator was already published; replacing it");
    }
}

/// Remove `coordinator` from the registry if it is the published one.
pub(crate) fn withdraw_coordinator(coordinator: &Coordinator) {
    let mut slot = lock(&COORDINATOR.value);
    if slot.as_ref().is_some_and(|c| c.ptr_eq(coordinator)) {
        slot.take();
    }
}
