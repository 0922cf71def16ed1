//! System coordinator: the single entry point the application holds on to.
//!
//! Gates the whole feature on runtime capabilities and user preference, wires
//! settings changes into the worker-aware checker, and optionally wraps the network
//! layer in a debug observer.

mod debug;
mod runtime;

pub use debug::*;
pub use runtime::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::checker::lock;
use crate::config::{CheckConfig, ConfigPatch, WorkerOptions};
use crate::events::{EventBus, Subscription, UpdateEvent};
use crate::fetch::{DescriptorSource, InterceptedSource};
use crate::registry;
use crate::store::StateStore;
use crate::worker::{
    send_message, WorkerAwareChecker, WorkerHost, WorkerLifecycleState, WorkerMessage,
};

/// Cache bucket prefix used when none is configured.
pub const DEFAULT_CACHE_PREFIX: &str = "build-sentinel-";

/// Static options for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub check: CheckConfig,
    pub worker: WorkerOptions,
    /// Cache buckets whose name starts with this prefix belong to the application
    pub cache_prefix: String,
    /// Route descriptor requests through [`DebugFetchObserver`]
    pub debug: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            check: CheckConfig::default(),
            worker: WorkerOptions::default(),
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            debug: false,
        }
    }
}

/// Collaborators supplied by the embedding application.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub source: Arc<dyn DescriptorSource>,
    pub store: Arc<dyn StateStore>,
    pub host: Arc<dyn WorkerHost>,
    pub caches: Arc<dyn CacheStorage>,
    pub probe: Arc<dyn RuntimeProbe>,
    pub settings: Arc<dyn SettingsProvider>,
}

/// Point-in-time view of the update system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemStatus {
    pub initialized: bool,
    pub worker_registered: bool,
    pub checker_active: bool,
    pub install_eligible: bool,
    pub standalone: bool,
    pub offline: bool,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    options: CoordinatorOptions,
    deps: CoordinatorDeps,
    events: EventBus,
    observer: Option<Arc<DebugFetchObserver>>,
    init_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    published: AtomicBool,
    checker: Mutex<Option<WorkerAwareChecker>>,
    /// Explicit enable/disable from the application, overriding settings
    preference: Mutex<Option<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(options: CoordinatorOptions, deps: CoordinatorDeps) -> Self {
        let observer = options.debug.then(|| Arc::new(DebugFetchObserver::new()));
        Self {
            inner: Arc::new(CoordinatorInner {
                options,
                deps,
                events: EventBus::default(),
                observer,
                init_lock: tokio::sync::Mutex::new(()),
                initialized: AtomicBool::new(false),
                published: AtomicBool::new(false),
                checker: Mutex::new(None),
                preference: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bring the update system up. Returns `false`, without error, when the runtime
    /// lacks a capability or the user opted out.
    pub async fn initialize(&self) -> bool {
        let _guard = self.inner.init_lock.lock().await;
        if self.is_initialized() {
            return true;
        }

        if !self.is_compatible() {
            tracing::info!("Runtime lacks worker, cache or fetch support; update checks disabled");
            return false;
        }

        // Watch settings ahead of the preference gate
        if lock(&self.inner.tasks).is_empty() {
            self.wire_listeners();
        }

        let patch = self.effective_patch(&self.inner.deps.settings.current());
        if patch.enabled == Some(false) {
            tracing::info!("Update checks disabled by preference");
            return false;
        }

        self.bring_up(&patch).await
    }

    /// Opt in and bring the system up.
    pub async fn enable_pwa(&self) -> bool {
        *lock(&self.inner.preference) = Some(true);
        self.initialize().await
    }

    /// Opt out: stop checking and unregister every worker registration.
    pub async fn disable_pwa(&self) {
        *lock(&self.inner.preference) = Some(false);
        let _guard = self.inner.init_lock.lock().await;
        self.teardown().await;

        match self.inner.deps.host.unregister_all().await {
            Ok(count) => tracing::info!("Removed {} worker registrations", count),
            Err(err) => tracing::warn!("Failed to remove worker registrations: {}", err),
        }
    }

    pub fn get_status(&self) -> SystemStatus {
        let probe = &self.inner.deps.probe;
        let checker = self.checker();
        let standalone = probe.is_standalone();

        SystemStatus {
            initialized: self.is_initialized(),
            worker_registered: checker.as_ref().is_some_and(|c| {
                c.worker_enabled() && c.lifecycle() != WorkerLifecycleState::Unregistered
            }),
            checker_active: checker.as_ref().is_some_and(WorkerAwareChecker::is_running),
            install_eligible: probe.supports_workers()
                && probe.supports_cache_storage()
                && probe.supports_install_prompt()
                && !standalone,
            standalone,
            offline: !probe.is_online(),
        }
    }

    /// Tell the controlling worker to skip waiting. Returns whether it was asked.
    pub async fn force_update(&self) -> bool {
        let host = &self.inner.deps.host;
        if !host.has_controller() {
            tracing::debug!("No controlling worker, nothing to activate");
            return false;
        }

        let timeout = self.inner.options.worker.message_timeout;
        match send_message(host.as_ref(), WorkerMessage::SkipWaiting, timeout).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("Failed to activate waiting worker: {}", err);
                false
            }
        }
    }

    /// Delete this application's cache buckets, leaving unrelated ones alone.
    pub async fn clear_caches(&self) -> Vec<String> {
        let caches = &self.inner.deps.caches;
        let names = match caches.keys().await {
            Ok(names) => names,
            Err(err) => {
                tracing::warn!("Failed to list caches: {}", err);
                return Vec::new();
            }
        };

        let mut deleted = Vec::new();
        for name in names.into_iter().filter(|n| self.owns_cache(n)) {
            match caches.delete(&name).await {
                Ok(true) => deleted.push(name),
                Ok(false) => {}
                Err(err) => tracing::warn!("Failed to delete cache {}: {}", name, err),
            }
        }

        tracing::info!("Cleared {} application caches", deleted.len());
        self.inner.events.publish(UpdateEvent::CacheCleared {
            deleted: deleted.clone(),
        });
        deleted
    }

    /// Tear everything down and withdraw from the process registry.
    pub async fn shutdown(&self) {
        let _guard = self.inner.init_lock.lock().await;
        self.teardown().await;
        registry::withdraw_coordinator(self);
        self.inner.published.store(false, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn checker(&self) -> Option<WorkerAwareChecker> {
        lock(&self.inner.checker).clone()
    }

    pub fn debug_observer(&self) -> Option<Arc<DebugFetchObserver>> {
        self.inner.observer.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn ptr_eq(&self, other: &Coordinator) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn is_compatible(&self) -> bool {
        let probe = &self.inner.deps.probe;
        probe.supports_workers() && probe.supports_cache_storage() && probe.supports_fetch()
    }

    fn owns_cache(&self, name: &str) -> bool {
        name.starts_with(&self.inner.options.cache_prefix)
    }

    fn source(&self) -> Arc<dyn DescriptorSource> {
        let source = self.inner.deps.source.clone();
        match &self.inner.observer {
            Some(observer) => Arc::new(InterceptedSource::new(source, observer.clone())),
            None => source,
        }
    }

    fn effective_patch(&self, settings: &UpdateSettings) -> ConfigPatch {
        let mut patch = settings.patch();
        if let Some(preferred) = *lock(&self.inner.preference) {
            patch.enabled = Some(preferred);
        }
        patch
    }

    fn wire_listeners(&self) {
        let mut events = self.inner.events.subscribe();
        let logger = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match &event {
                    UpdateEvent::UpdateAvailable { latest, .. } => {
                        tracing::info!("Update available: {} ({})", latest.version, latest.build_id)
                    }
                    UpdateEvent::CheckFailed { error, attempt } => {
                        tracing::debug!(attempt, "Update check failed: {}", error)
                    }
                    other => tracing::debug!("Update event: {}", other.name()),
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let mut settings = self.inner.deps.settings.watch();
        let watcher = tokio::spawn(async move {
            while settings.changed().await.is_ok() {
                let current = settings.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Coordinator { inner }.on_settings_changed(&current).await;
            }
        });

        let mut tasks = lock(&self.inner.tasks);
        tasks.push(logger);
        tasks.push(watcher);
    }

    /// Create and start the checker. Caller holds `init_lock`.
    async fn bring_up(&self, patch: &ConfigPatch) -> bool {
        let checker = match WorkerAwareChecker::new(
            self.inner.options.check.merged(patch),
            self.inner.options.worker.merged(patch),
            self.source(),
            self.inner.deps.store.clone(),
            self.inner.deps.host.clone(),
            self.inner.events.clone(),
        )
        .await
        {
            Ok(checker) => checker,
            Err(err) => {
                tracing::warn!("Failed to set up update checks: {}", err);
                return false;
            }
        };

        *lock(&self.inner.checker) = Some(checker.clone());
        checker.start();
        self.inner.initialized.store(true, Ordering::SeqCst);

        if !self.inner.published.swap(true, Ordering::SeqCst) {
            registry::publish_coordinator(self.clone());
        }

        tracing::info!("Update system initialized");
        true
    }

    async fn on_settings_changed(&self, settings: &UpdateSettings) {
        let _guard = self.inner.init_lock.lock().await;
        if self.checker().is_some() {
            self.apply_settings(settings);
            return;
        }

        let patch = self.effective_patch(settings);
        if patch.enabled != Some(false) {
            tracing::info!("Update checks enabled by settings");
            self.bring_up(&patch).await;
        }
    }

    fn apply_settings(&self, settings: &UpdateSettings) {
        let Some(checker) = self.checker() else {
            return;
        };
        let patch = self.effective_patch(settings);
        tracing::info!("Applying updated settings: {:?}", settings);

        if let Err(err) = checker.update_config(&patch) {
            tracing::warn!("Rejected settings change: {}", err);
            return;
        }
        if patch.enabled == Some(false) {
            checker.stop();
        } else {
            checker.start();
        }
    }

    async fn teardown(&self) {
        for handle in lock(&self.inner.tasks).drain(..) {
            handle.abort();
        }
        let checker = lock(&self.inner.checker).take();
        if let Some(checker) = checker {
            checker.destroy().await;
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
    }
}
