//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::CheckConfig;
use crate::coordinator::{CacheStorage, RuntimeProbe};
use crate::errors::CheckError;
use crate::fetch::{DescriptorSource, FetchedDocument};
use crate::models::{Environment, VersionDescriptor};
use crate::store::StateStore;
use crate::worker::{LifecycleSignal, WorkerEnvelope, WorkerHost, WorkerMessage, WorkerReply};

pub const TEST_ENDPOINT: &str = "http://app.test/version.json";

/// Serializes tests that touch the process-wide registry slots.
pub static REGISTRY_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

pub fn descriptor(version: &str, build_id: &str) -> VersionDescriptor {
    VersionDescriptor {
        version: version.to_string(),
        timestamp: 1_700_000_000_000,
        build_id: build_id.to_string(),
        revision_id: "abc".to_string(),
        environment: Environment::Production,
        content_hash: None,
    }
}

pub fn descriptor_json(version: &str, build_id: &str) -> String {
    serde_json::to_string(&descriptor(version, build_id)).unwrap()
}

pub fn test_config() -> CheckConfig {
    CheckConfig {
        endpoint: TEST_ENDPOINT.to_string(),
        check_interval: Duration::from_secs(60),
        enabled: true,
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
    }
}

/// Serves queued responses in order, repeating the last one once the queue is empty.
#[derive(Default)]
pub struct ScriptedSource {
    queue: Mutex<VecDeque<Result<FetchedDocument, CheckError>>>,
    last: Mutex<Option<Result<FetchedDocument, CheckError>>>,
    delay: Mutex<Duration>,
    fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_body(&self, body: String) {
        self.push(Ok(FetchedDocument {
            url: TEST_ENDPOINT.to_string(),
            status: 200,
            body,
        }));
    }

    pub fn push_status(&self, status: u16) {
        self.push(Ok(FetchedDocument {
            url: TEST_ENDPOINT.to_string(),
            status,
            body: String::new(),
        }));
    }

    pub fn push_error(&self, error: CheckError) {
        self.push(Err(error));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn push(&self, response: Result<FetchedDocument, CheckError>) {
        self.queue.lock().unwrap().push_back(response);
    }
}

#[async_trait]
impl DescriptorSource for ScriptedSource {
    async fn fetch(&self, _endpoint: &str) -> Result<FetchedDocument, CheckError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let next = self.queue.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = Some(next);
        }
        last.clone()
            .unwrap_or_else(|| Err(CheckError::Network("no scripted response".to_string())))
    }
}

/// Store whose every operation fails.
pub struct FailingStore;

#[async_trait]
impl StateStore for FailingStore {
    async fn read(&self, _key: &str) -> Result<Option<String>, CheckError> {
        Err(CheckError::Persistence("storage unavailable".to_string()))
    }

    async fn write(&self, _key: &str, _value: &str) -> Result<(), CheckError> {
        Err(CheckError::Persistence("quota exceeded".to_string()))
    }

    async fn remove(&self, _key: &str) -> Result<(), CheckError> {
        Err(CheckError::Persistence("storage unavailable".to_string()))
    }
}

/// Worker host that records every interaction and answers messages itself.
pub struct RecordingWorkerHost {
    supported: bool,
    fail_register: bool,
    fail_unregister: bool,
    silent: bool,
    controller: AtomicBool,
    messages: Mutex<Vec<WorkerMessage>>,
    registrations: Mutex<Vec<(String, String)>>,
    unregister_calls: AtomicUsize,
    unregister_all_calls: AtomicUsize,
    signals: broadcast::Sender<LifecycleSignal>,
}

impl RecordingWorkerHost {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(16);
        Self {
            supported: true,
            fail_register: false,
            fail_unregister: false,
            silent: false,
            controller: AtomicBool::new(false),
            messages: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            unregister_calls: AtomicUsize::new(0),
            unregister_all_calls: AtomicUsize::new(0),
            signals,
        }
    }

    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    pub fn failing_registration(mut self) -> Self {
        self.fail_register = true;
        self
    }

    pub fn failing_unregister(mut self) -> Self {
        self.fail_unregister = true;
        self
    }

    /// Never answer messages.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn with_controller(self) -> Self {
        self.controller.store(true, Ordering::SeqCst);
        self
    }

    pub fn emit(&self, signal: LifecycleSignal) {
        let _ = self.signals.send(signal);
    }

    pub fn messages(&self) -> Vec<WorkerMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn registrations(&self) -> Vec<(String, String)> {
        self.registrations.lock().unwrap().clone()
    }

    pub fn unregister_calls(&self) -> usize {
        self.unregister_calls.load(Ordering::SeqCst)
    }

    pub fn unregister_all_calls(&self) -> usize {
        self.unregister_all_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerHost for RecordingWorkerHost {
    fn is_supported(&self) -> bool {
        self.supported
    }

    async fn register(&self, script_url: &str, scope: &str) -> Result<(), CheckError> {
        if self.fail_register {
            return Err(CheckError::Worker("registration rejected".to_string()));
        }
        self.registrations
            .lock()
            .unwrap()
            .push((script_url.to_string(), scope.to_string()));
        Ok(())
    }

    async fn unregister(&self) -> Result<bool, CheckError> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unregister {
            return Err(CheckError::Worker("unregister rejected".to_string()));
        }
        Ok(true)
    }

    async fn unregister_all(&self) -> Result<usize, CheckError> {
        self.unregister_all_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unregister {
            return Err(CheckError::Worker("unregister rejected".to_string()));
        }
        Ok(self.registrations.lock().unwrap().len())
    }

    async fn post_message(&self, envelope: WorkerEnvelope) -> Result<WorkerReply, CheckError> {
        self.messages.lock().unwrap().push(envelope.message);
        if self.silent {
            std::future::pending::<()>().await;
        }
        Ok(match envelope.message {
            WorkerMessage::VersionCheck => WorkerReply::VersionCheck { ready: true },
            WorkerMessage::ClearCaches => WorkerReply::CachesCleared {
                deleted: vec!["build-sentinel-static-v1".to_string()],
            },
            WorkerMessage::SkipWaiting => WorkerReply::Ack,
        })
    }

    fn has_controller(&self) -> bool {
        self.controller.load(Ordering::SeqCst)
    }

    fn signals(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.signals.subscribe()
    }
}

/// Cache storage holding bucket names only.
#[derive(Default)]
pub struct MemoryCacheStorage {
    names: Mutex<Vec<String>>,
    fail: bool,
}

impl MemoryCacheStorage {
    pub fn with(names: &[&str]) -> Self {
        Self {
            names: Mutex::new(names.iter().map(|n| n.to_string()).collect()),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            names: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.names.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn keys(&self) -> Result<Vec<String>, CheckError> {
        if self.fail {
            return Err(CheckError::Unsupported("cache storage unavailable".to_string()));
        }
        Ok(self.names())
    }

    async fn delete(&self, name: &str) -> Result<bool, CheckError> {
        let mut names = self.names.lock().unwrap();
        let before = names.len();
        names.retain(|n| n != name);
        Ok(names.len() != before)
    }
}

/// Capability probe with fixed answers.
#[derive(Debug, Clone)]
pub struct FakeProbe {
    pub workers: bool,
    pub cache_storage: bool,
    pub fetch: bool,
    pub install_prompt: bool,
    pub standalone: bool,
    pub online: bool,
}

impl Default for FakeProbe {
    fn default() -> Self {
        Self {
            workers: true,
            cache_storage: true,
            fetch: true,
            install_prompt: true,
            standalone: false,
            online: true,
        }
    }
}

impl RuntimeProbe for FakeProbe {
    fn supports_workers(&self) -> bool {
        self.workers
    }

    fn supports_cache_storage(&self) -> bool {
        self.cache_storage
    }

    fn supports_fetch(&self) -> bool {
        self.fetch
    }

    fn supports_install_prompt(&self) -> bool {
        self.install_prompt
    }

    fn is_standalone(&self) -> bool {
        self.standalone
    }

    fn is_online(&self) -> bool {
        self.online
    }
}
