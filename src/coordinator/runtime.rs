//! Narrow interfaces onto the host runtime: capabilities, cache buckets and user settings.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::{CacheStrategy, ConfigPatch};
use crate::errors::CheckError;

/// Capability and environment probes.
pub trait RuntimeProbe: Send + Sync {
    fn supports_workers(&self) -> bool;

    fn supports_cache_storage(&self) -> bool;

    fn supports_fetch(&self) -> bool;

    /// Whether the runtime can offer to install the application.
    fn supports_install_prompt(&self) -> bool;

    /// Running as an installed app rather than in a browser tab.
    fn is_standalone(&self) -> bool;

    fn is_online(&self) -> bool;
}

/// Named response caches shared with other code on the same origin.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    async fn keys(&self) -> Result<Vec<String>, CheckError>;

    /// Delete a bucket, returning whether it existed.
    async fn delete(&self, name: &str) -> Result<bool, CheckError>;
}

/// User-facing update preferences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSettings {
    pub enabled: bool,
    pub check_interval: Duration,
    pub strategy: CacheStrategy,
    pub force_activate: bool,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Duration::from_secs(5 * 60),
            strategy: CacheStrategy::default(),
            force_activate: false,
        }
    }
}

impl UpdateSettings {
    pub fn patch(&self) -> ConfigPatch {
        ConfigPatch {
            enabled: Some(self.enabled),
            check_interval: Some(self.check_interval),
            strategy: Some(self.strategy),
            force_activate: Some(self.force_activate),
            ..ConfigPatch::default()
        }
    }
}

/// Source of settings; changes are pushed through the watch channel.
pub trait SettingsProvider: Send + Sync {
    fn current(&self) -> UpdateSettings;

    fn watch(&self) -> watch::Receiver<UpdateSettings>;
}

/// In-process settings holder.
pub struct SharedSettings {
    tx: watch::Sender<UpdateSettings>,
}

impl SharedSettings {
    pub fn new(settings: UpdateSettings) -> Self {
        let (tx, _) = watch::channel(settings);
        Self { tx }
    }

    /// Modify the settings and notify every watcher.
    pub fn update(&self, change: impl FnOnce(&mut UpdateSettings)) {
        self.tx.send_modify(change);
    }
}

impl Default for SharedSettings {
    fn default() -> Self {
        Self::new(UpdateSettings::default())
    }
}

impl SettingsProvider for SharedSettings {
    fn current(&self) -> UpdateSettings {
        self.tx.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<UpdateSettings> {
        self.tx.subscribe()
    }
}
