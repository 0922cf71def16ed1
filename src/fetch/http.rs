//! reqwest-backed descriptor source.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{CACHE_CONTROL, EXPIRES, PRAGMA};

use super::{DescriptorSource, FetchedDocument};
use crate::errors::CheckError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Fetches the descriptor over HTTP, bypassing every cache on the way.
#[derive(Clone)]
pub struct HttpDescriptorSource {
    client: reqwest::Client,
}

impl HttpDescriptorSource {
    pub fn new() -> Result<Self, CheckError> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, CheckError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DescriptorSource for HttpDescriptorSource {
    async fn fetch(&self, endpoint: &str) -> Result<FetchedDocument, CheckError> {
        let response = self
            .client
            .get(endpoint)
            .query(&[("t", Utc::now().timestamp_millis())])
            .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(PRAGMA, "no-cache")
            .header(EXPIRES, "0")
            .send()
            .await?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response.text().await?;

        Ok(FetchedDocument { url, status, body })
    }
}
