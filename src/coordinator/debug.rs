//! Diagnostic observer for descriptor polling.
//!
//! Runs its own update detection on every response it sees so that disagreements
//! with the checker can be spotted in the logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::checker::lock;
use crate::errors::CheckError;
use crate::fetch::{FetchInterceptor, FetchedDocument};
use crate::models::{is_update, VersionDescriptor};

#[derive(Default)]
pub struct DebugFetchObserver {
    requests: AtomicU64,
    updates: AtomicU64,
    last_seen: Mutex<Option<VersionDescriptor>>,
}

impl DebugFetchObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests_seen(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Builds this observer saw change, independent of the checker.
    pub fn updates_seen(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn last_seen(&self) -> Option<VersionDescriptor> {
        lock(&self.last_seen).clone()
    }
}

impl FetchInterceptor for DebugFetchObserver {
    fn on_request(&self, endpoint: &str, at: DateTime<Utc>) {
        let count = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(request = count, at = %at.to_rfc3339(), "Polling {}", endpoint);
    }

    fn on_response(&self, endpoint: &str, response: &FetchedDocument) {
        if !response.is_success() {
            tracing::debug!("{} answered HTTP {}", endpoint, response.status);
            return;
        }

        let descriptor = match VersionDescriptor::from_json(&response.body) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                tracing::debug!("Unreadable descriptor from {}: {}", endpoint, err);
                return;
            }
        };

        let mut last_seen = lock(&self.last_seen);
        if is_update(last_seen.as_ref(), &descriptor) {
            self.updates.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                "Debug observer saw build change to {} ({})",
                descriptor.version,
                descriptor.build_id
            );
        }
        *last_seen = Some(descriptor);
    }

    fn on_error(&self, endpoint: &str, error: &CheckError) {
        tracing::debug!("Polling {} failed: {}", endpoint, error);
    }
}
