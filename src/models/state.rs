//! Persisted check state and per-check outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::VersionDescriptor;
use crate::errors::CheckError;

/// Mutable state of one checker, persisted after every attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckState {
    /// Build the client is running; `None` until the first successful check
    pub current_descriptor: Option<VersionDescriptor>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub failure_count: u32,
    /// True while `latest_descriptor` differs from `current_descriptor` unacknowledged
    pub update_available: bool,
    pub latest_descriptor: Option<VersionDescriptor>,
}

/// Structured result of a single `check_version` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub success: bool,
    pub update_available: bool,
    pub current: Option<VersionDescriptor>,
    pub latest: Option<VersionDescriptor>,
    pub error: Option<CheckError>,
}

impl CheckOutcome {
    pub fn succeeded(state: &CheckState) -> Self {
        Self {
            success: true,
            update_available: state.update_available,
            current: state.current_descriptor.clone(),
            latest: state.latest_descriptor.clone(),
            error: None,
        }
    }

    pub fn failed(state: &CheckState, error: CheckError) -> Self {
        Self {
            success: false,
            update_available: state.update_available,
            current: state.current_descriptor.clone(),
            latest: state.latest_descriptor.clone(),
            error: Some(error),
        }
    }
}
