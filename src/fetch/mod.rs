//! Network layer for fetching the version descriptor.
//!
//! Sources hand back the raw status and body; interpreting them is the checker's job.
//! Instrumentation is attached by wrapping a source in [`InterceptedSource`] rather
//! than by replacing the transport.

mod http;

pub use http::*;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::CheckError;

/// Raw response for a descriptor request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    /// Final URL, including any cache-busting query
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl FetchedDocument {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Anything that can retrieve the descriptor resource.
#[async_trait]
pub trait DescriptorSource: Send + Sync {
    async fn fetch(&self, endpoint: &str) -> Result<FetchedDocument, CheckError>;
}

/// Observes descriptor traffic without taking part in it.
pub trait FetchInterceptor: Send + Sync {
    fn on_request(&self, endpoint: &str, at: DateTime<Utc>);

    fn on_response(&self, endpoint: &str, response: &FetchedDocument);

    fn on_error(&self, endpoint: &str, error: &CheckError) {
        let _ = (endpoint, error);
    }
}

/// A source decorated with an interceptor.
pub struct InterceptedSource {
    inner: Arc<dyn DescriptorSource>,
    interceptor: Arc<dyn FetchInterceptor>,
}

impl InterceptedSource {
    pub fn new(inner: Arc<dyn DescriptorSource>, interceptor: Arc<dyn FetchInterceptor>) -> Self {
        Self { inner, interceptor }
    }
}

#[async_trait]
impl DescriptorSource for InterceptedSource {
    async fn fetch(&self, endpoint: &str) -> Result<FetchedDocument, CheckError> {
        self.interceptor.on_request(endpoint, Utc::now());
        let result = self.inner.fetch(endpoint).await;
        match &result {
            Ok(response) => self.interceptor.on_response(endpoint, response),
            Err(err) => self.interceptor.on_error(endpoint, err),
        }
        result
    }
}
