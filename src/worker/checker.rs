//! Version checker that coordinates with a background worker.
//!
//! Wraps a [`VersionChecker`] rather than replacing it: descriptor comparison stays in
//! the core, this layer decides *when* a check is meaningful and what happens to the
//! caches once an update is confirmed. If the worker cannot be registered the
//! wrapper behaves exactly like the plain checker for the rest of its life.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{
    send_message, LifecycleSignal, UpdateActions, WorkerHost, WorkerLifecycleState, WorkerMessage,
    WorkerReply,
};
use crate::checker::{lock, VersionChecker};
use crate::config::{CacheStrategy, CheckConfig, ConfigPatch, WorkerOptions};
use crate::errors::CheckError;
use crate::events::{EventBus, Subscription, UpdateEvent, UpdateOrigin};
use crate::fetch::DescriptorSource;
use crate::models::{CheckOutcome, CheckState, VersionDescriptor};
use crate::store::StateStore;

#[derive(Clone)]
pub struct WorkerAwareChecker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    core: VersionChecker,
    host: Arc<dyn WorkerHost>,
    options: RwLock<WorkerOptions>,
    worker_enabled: AtomicBool,
    lifecycle: Mutex<WorkerLifecycleState>,
    /// Latest build the invalidation strategy already ran for
    handled_build: Mutex<Option<VersionDescriptor>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerAwareChecker {
    /// Build the checker and, when configured and supported, register the worker.
    pub async fn new(
        config: CheckConfig,
        options: WorkerOptions,
        source: Arc<dyn DescriptorSource>,
        store: Arc<dyn StateStore>,
        host: Arc<dyn WorkerHost>,
        events: EventBus,
    ) -> Result<Self, CheckError> {
        let core = VersionChecker::new(config, source, store, events).await?;
        let wanted = options.enabled && host.is_supported();
        if options.enabled && !wanted {
            tracing::info!("Background workers unsupported, using plain version checks");
        }

        let checker = Self {
            inner: Arc::new(WorkerInner {
                core,
                host,
                options: RwLock::new(options),
                worker_enabled: AtomicBool::new(wanted),
                lifecycle: Mutex::new(WorkerLifecycleState::Unregistered),
                handled_build: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        };

        let weak = Arc::downgrade(&checker.inner);
        checker.inner.core.set_tick_hook(Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    WorkerAwareChecker { inner }.check_version().await;
                }
            }
            .boxed()
        }));

        let weak = Arc::downgrade(&checker.inner);
        checker
            .inner
            .core
            .set_announce_hook(Arc::new(move |latest: VersionDescriptor| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        WorkerAwareChecker { inner }.on_new_build(latest).await;
                    }
                }
                .boxed()
            }));

        if wanted {
            checker.register().await;
        }
        Ok(checker)
    }

    async fn register(&self) {
        let options = self.options();
        self.set_lifecycle(WorkerLifecycleState::Registering);

        // Subscribe first so no signal raised during registration is missed
        let signals = self.inner.host.signals();

        match self
            .inner
            .host
            .register(&options.script_url, &options.scope)
            .await
        {
            Ok(()) => {
                self.set_lifecycle(WorkerLifecycleState::Registered);
                self.spawn_listener(signals);
                tracing::info!("Background worker registered for scope {}", options.scope);
                self.events().publish(UpdateEvent::WorkerRegistered {
                    scope: options.scope,
                });
            }
            Err(err) => {
                tracing::warn!(
                    "Background worker registration failed, continuing without it: {}",
                    err
                );
                self.inner.worker_enabled.store(false, Ordering::SeqCst);
                self.set_lifecycle(WorkerLifecycleState::Unregistered);
            }
        }
    }

    fn spawn_listener(&self, mut signals: broadcast::Receiver<LifecycleSignal>) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let signal = match signals.recv().await {
                    Ok(signal) => signal,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} worker lifecycle signals", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                WorkerAwareChecker { inner }.handle_signal(signal).await;
            }
        });
        self.track(handle);
    }

    /// React to a worker lifecycle transition.
    pub async fn handle_signal(&self, signal: LifecycleSignal) {
        let state = {
            let mut lifecycle = lock(&self.inner.lifecycle);
            *lifecycle = lifecycle.observe(signal);
            *lifecycle
        };
        tracing::debug!("Worker lifecycle: {}", state);

        match signal {
            LifecycleSignal::Waiting => {
                let strategy = self.options().strategy;
                self.apply_strategy(strategy).await;
                let snapshot = self.get_state();
                self.events().publish(UpdateEvent::WorkerUpdateReady {
                    origin: UpdateOrigin::Lifecycle,
                    current: snapshot.current_descriptor,
                    latest: snapshot.latest_descriptor,
                    actions: self.actions(),
                });
            }
            LifecycleSignal::Activating => {}
            LifecycleSignal::Activated { first_install } => {
                if first_install {
                    tracing::info!("Background worker installed, offline support ready");
                    self.events().publish(UpdateEvent::OfflineReady);
                }
            }
            LifecycleSignal::ControllerChanged => {
                tracing::info!("New background worker took control");
                self.events().publish(UpdateEvent::WorkerUpdated);
            }
        }
    }

    /// Confirm worker readiness, then run the core check.
    ///
    /// A newly detected build is invalidated per strategy from inside the core check,
    /// before `update-available` is published.
    pub async fn check_version(&self) -> CheckOutcome {
        if self.worker_enabled() {
            let timeout = self.options().message_timeout;
            match send_message(
                self.inner.host.as_ref(),
                WorkerMessage::VersionCheck,
                timeout,
            )
            .await
            {
                Ok(WorkerReply::VersionCheck { ready: false }) => {
                    tracing::debug!("Worker not ready yet, checking anyway");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("Worker readiness check failed: {}", err),
            }
        }

        self.inner.core.check_version().await
    }

    /// Invalidate per strategy once per build, before `update-available` goes out.
    async fn on_new_build(&self, latest: VersionDescriptor) {
        if !self.worker_enabled() {
            return;
        }
        {
            let mut handled = lock(&self.inner.handled_build);
            if handled.as_ref() == Some(&latest) {
                return;
            }
            *handled = Some(latest.clone());
        }

        let strategy = self.options().strategy;
        self.apply_strategy(strategy).await;
        self.events().publish(UpdateEvent::WorkerUpdateReady {
            origin: UpdateOrigin::VersionCheck,
            current: self.get_state().current_descriptor,
            latest: Some(latest),
            actions: self.actions(),
        });
    }

    async fn apply_strategy(&self, strategy: CacheStrategy) {
        let actions = self.actions();
        match strategy {
            CacheStrategy::Immediate => {
                if let Err(err) = actions.clear_caches().await {
                    tracing::warn!("Failed to clear caches: {}", err);
                }
                if let Err(err) = actions.force_update().await {
                    tracing::warn!("Failed to activate waiting worker: {}", err);
                }
            }
            CacheStrategy::Background => {
                let options = self.options();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(options.background_delay).await;
                    if let Err(err) = actions.clear_caches().await {
                        tracing::warn!("Failed to clear caches: {}", err);
                    }
                    if options.force_activate {
                        if let Err(err) = actions.force_update().await {
                            tracing::warn!("Failed to activate waiting worker: {}", err);
                        }
                    }
                });
                self.track(handle);
            }
            CacheStrategy::UserConsent => {
                tracing::debug!("Leaving cache invalidation to the application");
            }
        }
    }

    /// Clear worker caches now.
    pub async fn clear_caches(&self) -> Result<Vec<String>, CheckError> {
        self.actions().clear_caches().await
    }

    /// Ask a waiting worker to take control now.
    pub async fn force_update(&self) -> Result<(), CheckError> {
        self.actions().force_update().await
    }

    pub fn actions(&self) -> UpdateActions {
        UpdateActions::new(
            self.inner.host.clone(),
            self.events().clone(),
            self.options().message_timeout,
        )
    }

    /// Stop polling, drop background tasks and unregister the worker.
    pub async fn destroy(&self) {
        self.inner.core.stop();
        for handle in lock(&self.inner.tasks).drain(..) {
            handle.abort();
        }

        if self.inner.worker_enabled.swap(false, Ordering::SeqCst) {
            match self.inner.host.unregister().await {
                Ok(true) => tracing::info!("Background worker unregistered"),
                Ok(false) => tracing::debug!("No background worker to unregister"),
                Err(err) => tracing::warn!("Failed to unregister background worker: {}", err),
            }
        }
        self.set_lifecycle(WorkerLifecycleState::Unregistered);
    }

    pub fn start(&self) -> bool {
        self.inner.core.start()
    }

    pub fn stop(&self) -> bool {
        self.inner.core.stop()
    }

    pub fn is_running(&self) -> bool {
        self.inner.core.is_running()
    }

    pub async fn acknowledge_update(&self) {
        self.inner.core.acknowledge_update().await;
    }

    pub async fn reset(&self) {
        *lock(&self.inner.handled_build) = None;
        self.inner.core.reset().await;
    }

    pub fn get_state(&self) -> CheckState {
        self.inner.core.get_state()
    }

    pub fn get_config(&self) -> CheckConfig {
        self.inner.core.get_config()
    }

    pub fn options(&self) -> WorkerOptions {
        self.inner
            .options
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a patch to both the polling and the worker settings.
    ///
    /// Registration is fixed at construction, so scope changes only affect
    /// later instances.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<(), CheckError> {
        self.inner.core.update_config(patch)?;
        let merged = self.options().merged(patch);
        *self
            .inner
            .options
            .write()
            .unwrap_or_else(PoisonError::into_inner) = merged;
        Ok(())
    }

    pub fn worker_enabled(&self) -> bool {
        self.inner.worker_enabled.load(Ordering::SeqCst)
    }

    pub fn lifecycle(&self) -> WorkerLifecycleState {
        *lock(&self.inner.lifecycle)
    }

    pub fn core(&self) -> &VersionChecker {
        &self.inner.core
    }

    pub fn events(&self) -> &EventBus {
        self.inner.core.events()
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.core.subscribe()
    }

    fn set_lifecycle(&self, state: WorkerLifecycleState) {
        *lock(&self.inner.lifecycle) = state;
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.inner.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::MemoryStateStore;
    use crate::test_support::{descriptor_json, test_config, RecordingWorkerHost, ScriptedSource};

    struct Harness {
        checker: WorkerAwareChecker,
        host: Arc<RecordingWorkerHost>,
        source: Arc<ScriptedSource>,
        events: Subscription,
    }

    async fn harness(host: RecordingWorkerHost, strategy: CacheStrategy) -> Harness {
        let host = Arc::new(host);
        let source = Arc::new(ScriptedSource::new());
        source.push_body(descriptor_json("1.0.0", "b1"));
        source.push_body(descriptor_json("1.0.0", "b2"));
        let bus = EventBus::default();
        let events = bus.subscribe();
        let options = WorkerOptions {
            strategy,
            ..WorkerOptions::default()
        };
        let checker = WorkerAwareChecker::new(
            test_config(),
            options,
            source.clone(),
            Arc::new(MemoryStateStore::new()),
            host.clone(),
            bus,
        )
        .await
        .unwrap();
        Harness {
            checker,
            host,
            source,
            events,
        }
    }

    fn names(events: &[UpdateEvent]) -> Vec<&'static str> {
        events.iter().map(UpdateEvent::name).collect()
    }

    #[tokio::test]
    async fn test_registers_worker_on_construction() {
        let mut h = harness(RecordingWorkerHost::new(), CacheStrategy::Background).await;

        assert!(h.checker.worker_enabled());
        assert_eq!(h.checker.lifecycle(), WorkerLifecycleState::Registered);
        assert_eq!(h.host.registrations(), vec![("/sw.js".to_string(), "/".to_string())]);
        assert_eq!(names(&h.events.drain()), vec!["sw-registered"]);
    }

    #[tokio::test]
    async fn test_registration_failure_degrades_to_plain_checker() {
        let mut h = harness(
            RecordingWorkerHost::new().failing_registration(),
            CacheStrategy::Immediate,
        )
        .await;

        assert!(!h.checker.worker_enabled());
        assert_eq!(h.checker.lifecycle(), WorkerLifecycleState::Unregistered);

        h.checker.check_version().await;
        let outcome = h.checker.check_version().await;

        assert!(outcome.update_available);
        assert!(h.host.messages().is_empty());
        let seen = names(&h.events.drain());
        assert!(seen.contains(&"update-available"));
        assert!(!seen.contains(&"sw-update-available"));
    }

    #[tokio::test]
    async fn test_unsupported_runtime_never_registers() {
        let h = harness(RecordingWorkerHost::new().unsupported(), CacheStrategy::Immediate).await;

        assert!(!h.checker.worker_enabled());
        assert!(h.host.registrations().is_empty());
    }

    #[tokio::test]
    async fn test_immediate_strategy_invalidates_before_returning() {
        let mut h = harness(RecordingWorkerHost::new(), CacheStrategy::Immediate).await;

        h.checker.check_version().await;
        let outcome = h.checker.check_version().await;

        assert!(outcome.update_available);
        assert_eq!(
            h.host.messages(),
            vec![
                WorkerMessage::VersionCheck,
                WorkerMessage::VersionCheck,
                WorkerMessage::ClearCaches,
                WorkerMessage::SkipWaiting,
            ]
        );

        let seen = names(&h.events.drain());
        let cleared = seen.iter().position(|n| *n == "cache-cleared").unwrap();
        let ready = seen.iter().position(|n| *n == "sw-update-available").unwrap();
        let available = seen.iter().position(|n| *n == "update-available").unwrap();
        assert!(cleared < ready);
        assert!(cleared < available);
    }

    #[tokio::test]
    async fn test_user_consent_strategy_only_exposes_actions() {
        let mut h = harness(RecordingWorkerHost::new(), CacheStrategy::UserConsent).await;

        h.checker.check_version().await;
        h.checker.check_version().await;

        assert_eq!(
            h.host.messages(),
            vec![WorkerMessage::VersionCheck, WorkerMessage::VersionCheck]
        );

        let actions = h
            .events
            .drain()
            .into_iter()
            .find_map(|e| match e {
                UpdateEvent::WorkerUpdateReady {
                    origin: UpdateOrigin::VersionCheck,
                    latest,
                    actions,
                    ..
                } => {
                    assert_eq!(latest.unwrap().build_id, "b2");
                    Some(actions)
                }
                _ => None,
            })
            .expect("sw-update-available event");

        actions.clear_caches().await.unwrap();
        actions.force_update().await.unwrap();
        assert_eq!(
            &h.host.messages()[2..],
            &[WorkerMessage::ClearCaches, WorkerMessage::SkipWaiting]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_strategy_clears_after_delay() {
        let h = harness(RecordingWorkerHost::new(), CacheStrategy::Background).await;

        h.checker.check_version().await;
        h.checker.check_version().await;
        assert!(!h.host.messages().contains(&WorkerMessage::ClearCaches));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let messages = h.host.messages();
        assert!(messages.contains(&WorkerMessage::ClearCaches));
        assert!(!messages.contains(&WorkerMessage::SkipWaiting));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_strategy_force_activates_after_delay() {
        let h = harness(RecordingWorkerHost::new(), CacheStrategy::Background).await;
        h.checker
            .update_config(&ConfigPatch {
                force_activate: Some(true),
                ..ConfigPatch::default()
            })
            .unwrap();

        h.checker.check_version().await;
        h.checker.check_version().await;
        assert!(!h.host.messages().contains(&WorkerMessage::SkipWaiting));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            &h.host.messages()[2..],
            &[WorkerMessage::ClearCaches, WorkerMessage::SkipWaiting]
        );
    }

    #[tokio::test]
    async fn test_waiting_worker_under_immediate_strategy_is_activated() {
        let mut h = harness(RecordingWorkerHost::new(), CacheStrategy::Immediate).await;
        h.events.drain();

        h.checker.handle_signal(LifecycleSignal::Waiting).await;

        assert_eq!(
            h.host.messages(),
            vec![WorkerMessage::ClearCaches, WorkerMessage::SkipWaiting]
        );
        assert_eq!(
            names(&h.events.drain()),
            vec!["cache-cleared", "sw-update-available"]
        );
    }

    #[tokio::test]
    async fn test_strategy_runs_once_per_build() {
        let h = harness(RecordingWorkerHost::new(), CacheStrategy::Immediate).await;

        h.checker.check_version().await;
        h.checker.check_version().await;
        h.checker.check_version().await;

        let clears = h
            .host
            .messages()
            .into_iter()
            .filter(|m| *m == WorkerMessage::ClearCaches)
            .count();
        assert_eq!(clears, 1);
        assert_eq!(h.source.fetch_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_does_not_block_checks() {
        let h = harness(RecordingWorkerHost::new().silent(), CacheStrategy::UserConsent).await;

        let outcome = h.checker.check_version().await;

        assert!(outcome.success);
        assert_eq!(h.source.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_signals_map_to_events() {
        let mut h = harness(RecordingWorkerHost::new(), CacheStrategy::UserConsent).await;
        h.events.drain();

        h.checker.handle_signal(LifecycleSignal::Waiting).await;
        assert_eq!(h.checker.lifecycle(), WorkerLifecycleState::WaitingToActivate);
        h.checker.handle_signal(LifecycleSignal::Activating).await;
        h.checker
            .handle_signal(LifecycleSignal::Activated {
                first_install: true,
            })
            .await;
        h.checker
            .handle_signal(LifecycleSignal::ControllerChanged)
            .await;
        assert_eq!(h.checker.lifecycle(), WorkerLifecycleState::Active);

        assert_eq!(
            names(&h.events.drain()),
            vec!["sw-update-available", "offline-ready", "sw-updated"]
        );
    }

    #[tokio::test]
    async fn test_signals_from_host_reach_listener() {
        let mut h = harness(RecordingWorkerHost::new(), CacheStrategy::UserConsent).await;
        h.events.drain();

        h.host.emit(LifecycleSignal::ControllerChanged);

        let event = tokio::time::timeout(Duration::from_secs(1), h.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "sw-updated");
    }

    #[tokio::test]
    async fn test_timer_ticks_run_worker_aware_check() {
        let h = harness(RecordingWorkerHost::new(), CacheStrategy::Background).await;
        h.checker.start();

        for _ in 0..100 {
            if h.checker.get_state().current_descriptor.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(h.source.fetch_count(), 1);
        assert_eq!(h.host.messages(), vec![WorkerMessage::VersionCheck]);
        h.checker.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_unregisters_and_swallows_errors() {
        let h = harness(RecordingWorkerHost::new(), CacheStrategy::Background).await;
        h.checker.start();
        h.checker.destroy().await;

        assert!(!h.checker.is_running());
        assert!(!h.checker.worker_enabled());
        assert_eq!(h.host.unregister_calls(), 1);

        let failing = harness(
            RecordingWorkerHost::new().failing_unregister(),
            CacheStrategy::Background,
        )
        .await;
        failing.checker.destroy().await;
        assert_eq!(failing.checker.lifecycle(), WorkerLifecycleState::Unregistered);
    }

    #[tokio::test]
    async fn test_update_config_changes_strategy() {
        let h = harness(RecordingWorkerHost::new(), CacheStrategy::UserConsent).await;

        h.checker
            .update_config(&ConfigPatch {
                strategy: Some(CacheStrategy::Immediate),
                force_activate: Some(true),
                ..ConfigPatch::default()
            })
            .unwrap();

        assert_eq!(h.checker.options().strategy, CacheStrategy::Immediate);
        assert!(h.checker.options().force_activate);
        assert!(h
            .checker
            .update_config(&ConfigPatch {
                check_interval: Some(Duration::from_millis(100)),
                ..ConfigPatch::default()
            })
            .is_err());
    }
}
