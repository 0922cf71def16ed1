//! Polling version checker.
//!
//! Owns the polling timer, fetches the descriptor with retries, compares it against
//! the last recorded build and persists the result. Knows nothing about background
//! workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{CheckConfig, ConfigPatch};
use crate::errors::CheckError;
use crate::events::{EventBus, Subscription, UpdateEvent};
use crate::fetch::DescriptorSource;
pub use crate::models::is_update;
use crate::models::{CheckOutcome, CheckState, VersionDescriptor};
use crate::store::{clear_state, load_state, save_state, StateStore};

type SharedCheck = Shared<BoxFuture<'static, CheckOutcome>>;

/// Replacement for the plain check on each timer tick.
pub(crate) type TickHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs after a new build is recorded and before `update-available` is published.
pub(crate) type AnnounceHook =
    Arc<dyn Fn(VersionDescriptor) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cheap-to-clone handle to a checker; clones share state and timer.
#[derive(Clone)]
pub struct VersionChecker {
    inner: Arc<CheckerInner>,
}

struct CheckerInner {
    config: RwLock<CheckConfig>,
    state: Mutex<CheckState>,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Check currently in progress, tagged so only its own callers clear it
    in_flight: Mutex<Option<(u64, SharedCheck)>>,
    flight_seq: AtomicU64,
    tick_hook: Mutex<Option<TickHook>>,
    announce_hook: Mutex<Option<AnnounceHook>>,
    source: Arc<dyn DescriptorSource>,
    store: Arc<dyn StateStore>,
    events: EventBus,
}

impl VersionChecker {
    /// Create a checker, restoring any state persisted by a previous instance.
    pub async fn new(
        config: CheckConfig,
        source: Arc<dyn DescriptorSource>,
        store: Arc<dyn StateStore>,
        events: EventBus,
    ) -> Result<Self, CheckError> {
        config.validate()?;
        let state = load_state(store.as_ref()).await;

        Ok(Self {
            inner: Arc::new(CheckerInner {
                config: RwLock::new(config),
                state: Mutex::new(state),
                timer: Mutex::new(None),
                in_flight: Mutex::new(None),
                flight_seq: AtomicU64::new(0),
                tick_hook: Mutex::new(None),
                announce_hook: Mutex::new(None),
                source,
                store,
                events,
            }),
        })
    }

    /// Start polling: one immediate check, then one per interval.
    ///
    /// Returns `false` without doing anything when already running or disabled.
    pub fn start(&self) -> bool {
        let config = self.get_config();
        if !config.enabled {
            tracing::debug!("Version checking is disabled, not starting");
            return false;
        }

        let mut timer = lock(&self.inner.timer);
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = config.check_interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                // Checks run detached so stopping the ticker never aborts a fetch
                let hook = lock(&inner.tick_hook).clone();
                let checker = VersionChecker { inner };
                tokio::spawn(async move {
                    match hook {
                        Some(hook) => hook().await,
                        None => {
                            checker.check_version().await;
                        }
                    }
                });
            }
        }));

        tracing::info!(
            "Version checking started for {} every {:?}",
            config.endpoint,
            period
        );
        true
    }

    /// Cancel the polling timer. Checks already in flight still complete.
    pub fn stop(&self) -> bool {
        let Some(handle) = lock(&self.inner.timer).take() else {
            return false;
        };
        handle.abort();
        tracing::info!("Version checking stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.timer)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Fetch the descriptor and compare it with the recorded build.
    ///
    /// Concurrent callers share a single in-flight check. Never fails: errors are
    /// reported through the outcome and `check-failed` events.
    pub async fn check_version(&self) -> CheckOutcome {
        let (id, flight) = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref() {
                Some((id, flight)) => (*id, flight.clone()),
                None => {
                    let id = self.inner.flight_seq.fetch_add(1, Ordering::Relaxed);
                    let inner = self.inner.clone();
                    let flight = async move { inner.run_check().await }.boxed().shared();
                    *slot = Some((id, flight.clone()));
                    (id, flight)
                }
            }
        };

        let outcome = flight.await;

        let mut slot = lock(&self.inner.in_flight);
        if slot.as_ref().is_some_and(|(current, _)| *current == id) {
            *slot = None;
        }
        outcome
    }

    /// Adopt the latest descriptor as the running build and clear the update flag.
    pub async fn acknowledge_update(&self) {
        let snapshot = {
            let mut state = lock(&self.inner.state);
            if let Some(latest) = state.latest_descriptor.clone() {
                state.current_descriptor = Some(latest);
            }
            state.update_available = false;
            state.clone()
        };
        save_state(self.inner.store.as_ref(), &snapshot).await;
    }

    /// Forget everything and clear the persisted state.
    pub async fn reset(&self) {
        *lock(&self.inner.state) = CheckState::default();
        clear_state(self.inner.store.as_ref()).await;
        tracing::info!("Version check state reset");
    }

    pub fn get_state(&self) -> CheckState {
        lock(&self.inner.state).clone()
    }

    pub fn get_config(&self) -> CheckConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and install a new configuration, rescheduling a running timer.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<(), CheckError> {
        let merged = self.get_config().merged(patch);
        merged.validate()?;

        *self
            .inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = merged;

        if self.is_running() {
            self.stop();
            self.start();
        }
        Ok(())
    }

    /// Route timer ticks through `hook`, used by wrappers that decorate checks.
    pub(crate) fn set_tick_hook(&self, hook: TickHook) {
        *lock(&self.inner.tick_hook) = Some(hook);
    }

    /// Let a wrapper react to a newly detected build before listeners hear about it.
    pub(crate) fn set_announce_hook(&self, hook: AnnounceHook) {
        *lock(&self.inner.announce_hook) = Some(hook);
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }
}

impl CheckerInner {
    async fn run_check(self: Arc<Self>) -> CheckOutcome {
        let config = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let attempts = config.max_retries.max(1);

        self.events.publish(UpdateEvent::CheckStarted);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch_descriptor(&config.endpoint).await {
                Ok(latest) => return self.record_success(latest).await,
                Err(err) => {
                    let state = self.record_failure().await;
                    tracing::warn!(attempt, attempts, "Version check failed: {}", err);
                    self.events.publish(UpdateEvent::CheckFailed {
                        error: err.clone(),
                        attempt,
                    });

                    if !err.is_transient() || attempt >= attempts {
                        return CheckOutcome::failed(&state, err);
                    }
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }

    async fn fetch_descriptor(&self, endpoint: &str) -> Result<VersionDescriptor, CheckError> {
        let response = self.source.fetch(endpoint).await?;
        if !response.is_success() {
            return Err(CheckError::HttpStatus {
                status: response.status,
                url: response.url,
            });
        }
        VersionDescriptor::from_json(&response.body)
    }

    async fn record_success(&self, latest: VersionDescriptor) -> CheckOutcome {
        let (snapshot, newly_available) = {
            let mut state = lock(&self.state);
            let available = is_update(state.current_descriptor.as_ref(), &latest);
            let already_reported =
                state.update_available && state.latest_descriptor.as_ref() == Some(&latest);

            if state.current_descriptor.is_none() {
                state.current_descriptor = Some(latest.clone());
            }
            state.latest_descriptor = Some(latest);
            state.update_available = available;
            state.failure_count = 0;
            state.last_checked_at = Some(Utc::now());

            (state.clone(), available && !already_reported)
        };

        save_state(self.store.as_ref(), &snapshot).await;

        tracing::debug!(
            update_available = snapshot.update_available,
            "Version check completed"
        );
        self.events.publish(UpdateEvent::CheckCompleted {
            success: true,
            update_available: snapshot.update_available,
            current: snapshot.current_descriptor.clone(),
            latest: snapshot.latest_descriptor.clone(),
        });

        if newly_available {
            if let Some(latest) = snapshot.latest_descriptor.clone() {
                tracing::info!(
                    "New build available: {} ({})",
                    latest.version,
                    latest.build_id
                );
                let hook = lock(&self.announce_hook).clone();
                if let Some(hook) = hook {
                    hook(latest.clone()).await;
                }
                self.events.publish(UpdateEvent::UpdateAvailable {
                    current: snapshot.current_descriptor.clone(),
                    latest,
                });
            }
        }

        CheckOutcome::succeeded(&snapshot)
    }

    async fn record_failure(&self) -> CheckState {
        let snapshot = {
            let mut state = lock(&self.state);
            state.failure_count += 1;
            state.last_checked_at = Some(Utc::now());
            state.clone()
        };
        save_state(self.store.as_ref(), &snapshot).await;
        snapshot
    }
}
