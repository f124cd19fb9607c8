//! HTTP client abstraction for connectivity probes.
//!
//! The offline detector only needs to know whether a HEAD request got any
//! answer at all. Hiding reqwest behind a trait keeps the detector testable
//! without network access.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Trait for sending lightweight HTTP requests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a HEAD request and returns the response status code.
    ///
    /// # Errors
    ///
    /// Returns an error if no response was received (DNS failure, refused
    /// connection, timeout).
    async fn head(&self, url: &str) -> Result<u16>;
}

/// HTTP client implementation using reqwest.
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Creates a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn head(&self, url: &str) -> Result<u16> {
        let response = self.client.head(url).send().await?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Returns canned statuses per URL; unknown URLs fail as unreachable.
    pub struct MockHttpClient {
        statuses: HashMap<String, u16>,
        pub calls: Mutex<Vec<String>>,
    }

    impl MockHttpClient {
        pub fn unreachable() -> Self {
            Self {
                statuses: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_status(mut self, url: &str, status: u16) -> Self {
            self.statuses.insert(url.to_string(), status);
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn head(&self, url: &str) -> Result<u16> {
            self.calls.lock().push(url.to_string());
            self.statuses
                .get(url)
                .copied()
                .ok_or_else(|| anyhow!("connection refused: {url}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockHttpClient;
    use super::*;

    #[tokio::test]
    async fn test_mock_http_client_returns_status() {
        let client = MockHttpClient::unreachable().with_status("https://example.com", 403);
        assert_eq!(client.head("https://example.com").await.unwrap(), 403);
        assert!(client.head("https://other.example").await.is_err());
        assert_eq!(client.call_count(), 2);
    }
}
