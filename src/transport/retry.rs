//! Transport wrapper that retries failed round trips.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Error, Result};

use super::transport::{MethodRequest, MethodResponse, Transport};

pub const DEFAULT_RETRY_COUNT: u32 = 2;
pub const DEFAULT_RETRY_SLEEP: Duration = Duration::from_secs(60);

/// Retries requests that fail with [`Error::Network`].
///
/// Responses carrying a server status are returned as-is; the commit layer
/// decides what to do with those.
pub struct RetryingTransport {
    inner: Arc<dyn Transport>,
    retry_count: u32,
    retry_sleep: Duration,
}

impl RetryingTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self::with_settings(inner, DEFAULT_RETRY_COUNT, DEFAULT_RETRY_SLEEP)
    }

    pub fn with_settings(inner: Arc<dyn Transport>, retry_count: u32, retry_sleep: Duration) -> Self {
        Self {
            inner,
            retry_count,
            retry_sleep,
        }
    }
}

#[async_trait]
impl Transport for RetryingTransport {
    async fn call(&self, request: MethodRequest) -> Result<MethodResponse> {
        let mut retries = 0;
        loop {
            match self.inner.call(request.clone()).await {
                Err(Error::Network(message)) if retries < self.retry_count => {
                    retries += 1;
                    warn!(
                        method = request.method.as_str(),
                        attempt = retries,
                        %message,
                        "network error, retrying"
                    );
                    tokio::time::sleep(self.retry_sleep).await;
                }
                other => return other,
            }
        }
    }
}
