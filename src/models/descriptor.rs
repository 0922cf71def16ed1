//! Version descriptor model matching the published `version.json` document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::CheckError;

/// Deployment environment a build was produced for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "development" => Some(Environment::Development),
            "staging" => Some(Environment::Staging),
            "production" => Some(Environment::Production),
            _ => None,
        }
    }
}

/// Server-produced record identifying the currently deployed build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    pub version: String,
    /// Build time in milliseconds since the Unix epoch
    pub timestamp: i64,
    pub build_id: String,
    #[serde(rename = "gitCommit")]
    pub revision_id: String,
    pub environment: Environment,
    #[serde(rename = "dataHash", default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl VersionDescriptor {
    /// Parse and validate a descriptor document.
    ///
    /// Every required field is checked for presence and type so that a partial
    /// deployment surfaces as a [`CheckError::Validation`] naming the offending field.
    pub fn from_json(body: &str) -> Result<Self, CheckError> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| CheckError::Validation(format!("Descriptor is not valid JSON: {}", e)))?;
        let Some(object) = value.as_object() else {
            return Err(CheckError::Validation(
                "Descriptor must be a JSON object".to_string(),
            ));
        };

        let timestamp = match object.get("timestamp").and_then(Value::as_i64) {
            Some(ts) if ts > 0 => ts,
            Some(ts) => {
                return Err(CheckError::Validation(format!(
                    "Field 'timestamp' must be positive, got {}",
                    ts
                )))
            }
            None => return Err(invalid_field("timestamp", "an integer")),
        };

        let environment_raw = required_str(object, "environment")?;
        let environment = Environment::from_str(&environment_raw).ok_or_else(|| {
            CheckError::Validation(format!(
                "Field 'environment' has unknown value '{}'",
                environment_raw
            ))
        })?;

        let content_hash = match object.get("dataHash") {
            None | Some(Value::Null) => None,
            Some(Value::String(hash)) => Some(hash.clone()),
            Some(_) => return Err(invalid_field("dataHash", "a string")),
        };

        Ok(Self {
            version: required_str(object, "version")?,
            timestamp,
            build_id: required_str(object, "buildId")?,
            revision_id: required_str(object, "gitCommit")?,
            environment,
            content_hash,
        })
    }
}

fn required_str(object: &Map<String, Value>, field: &str) -> Result<String, CheckError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid_field(field, "a string"))
}

fn invalid_field(field: &str, expected: &str) -> CheckError {
    CheckError::Validation(format!(
        "Field '{}' is missing or not {}",
        field, expected
    ))
}

/// Decide whether `latest` is a different build from `current`.
///
/// No update is reported before a first descriptor has been recorded. The
/// content hash only participates when both sides carry one.
pub fn is_update(current: Option<&VersionDescriptor>, latest: &VersionDescriptor) -> bool {
    let Some(current) = current else {
        return false;
    };
    let hash_changed = match (&current.content_hash, &latest.content_hash) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    };
    current.version != latest.version
        || current.build_id != latest.build_id
        || current.revision_id != latest.revision_id
        || hash_changed
}
