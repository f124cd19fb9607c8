//! Network reachability detection.
//!
//! A probe first sends HEAD requests to a few well-known endpoints and, only
//! if none answers, falls back to a DNS lookup. Any HTTP status below 500
//! counts as reachable. Results are reused for `check_interval` so callers
//! can ask freely.

use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::providers::{SystemTimeProvider, TimeProvider, elapsed_since};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct OfflineConfig {
    pub check_interval: Duration,
    pub endpoints: Vec<String>,
    pub dns_host: String,
    pub probe_timeout: Duration,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            endpoints: vec![
                "https://www.google.com".to_string(),
                "https://github.com".to_string(),
                "https://registry.npmjs.org".to_string(),
            ],
            dns_host: "github.com".to_string(),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

/// Trait for hostname resolution, so probes can be tested offline.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the system resolver through tokio.
pub struct TokioDnsResolver {
    timeout: Duration,
}

impl TokioDnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DnsResolver for TokioDnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = tokio::net::lookup_host((host, 443));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| anyhow!("DNS lookup for {host} timed out"))??;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

struct DetectorState {
    offline: bool,
    forced: bool,
    last_check: Option<DateTime<Utc>>,
}

pub struct OfflineDetector {
    config: OfflineConfig,
    http: Arc<dyn HttpClient>,
    dns: Arc<dyn DnsResolver>,
    time: Arc<dyn TimeProvider>,
    state: RwLock<DetectorState>,
}

impl OfflineDetector {
    pub fn new(config: OfflineConfig) -> Self {
        let http = Arc::new(ReqwestHttpClient::new(config.probe_timeout));
        let dns = Arc::new(TokioDnsResolver::new(config.probe_timeout));
        Self::with_probes(config, http, dns, Arc::new(SystemTimeProvider))
    }

    /// Creates a detector with injected probes and clock (for testing).
    pub fn with_probes(
        config: OfflineConfig,
        http: Arc<dyn HttpClient>,
        dns: Arc<dyn DnsResolver>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            http,
            dns,
            time,
            state: RwLock::new(DetectorState {
                offline: false,
                forced: false,
                last_check: None,
            }),
        }
    }

    /// Returns the cached status, re-probing when it is older than the
    /// check interval.
    ///
    /// Two callers may both find the status stale and probe at the same
    /// time; probes are idempotent so the duplicate is harmless.
    pub async fn is_offline(&self) -> bool {
        {
            let state = self.state.read();
            if state.forced {
                return true;
            }
            if let Some(last) = state.last_check {
                if elapsed_since(self.time.now(), last) <= self.config.check_interval {
                    return state.offline;
                }
            }
        }
        self.check().await
    }

    /// Probes connectivity now and records the result. Returns `true` when
    /// offline.
    pub async fn check(&self) -> bool {
        let online = self.probe_http().await || self.probe_dns().await;

        let mut state = self.state.write();
        state.last_check = Some(self.time.now());
        if state.forced {
            return true;
        }
        if state.offline == online {
            info!("Network status changed: {}", if online { "online" } else { "offline" });
        }
        state.offline = !online;
        state.offline
    }

    /// Pins the status to offline, or releases the pin and probes again.
    pub async fn force_offline(&self, offline: bool) -> bool {
        {
            let mut state = self.state.write();
            state.forced = offline;
            if offline {
                state.offline = true;
                info!("Offline mode forced");
                return true;
            }
        }
        self.check().await
    }

    pub fn is_forced(&self) -> bool {
        self.state.read().forced
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_check
    }

    async fn probe_http(&self) -> bool {
        for endpoint in &self.config.endpoints {
            match self.http.head(endpoint).await {
                Ok(status) if (200..500).contains(&status) => {
                    debug!("Connectivity probe {} answered {}", endpoint, status);
                    return true;
                }
                Ok(status) => debug!("Connectivity probe {} answered {}", endpoint, status),
                Err(e) => debug!("Connectivity probe {} failed: {}", endpoint, e),
            }
        }
        false
    }

    async fn probe_dns(&self) -> bool {
        match self.dns.resolve(&self.config.dns_host).await {
            Ok(addrs) if !addrs.is_empty() => {
                debug!("DNS probe resolved {} to {:?}", self.config.dns_host, addrs);
                true
            }
            Ok(_) => {
                warn!("DNS probe for {} returned no addresses", self.config.dns_host);
                false
            }
            Err(e) => {
                debug!("DNS probe for {} failed: {}", self.config.dns_host, e);
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockResolver;
    use super::*;
    use crate::http_client::testing::MockHttpClient;
    use crate::providers::testing::ManualClock;
    use std::sync::atomic::Ordering;

    fn config() -> OfflineConfig {
        OfflineConfig {
            check_interval: Duration::from_secs(30),
            endpoints: vec!["https://a.test".to_string(), "https://b.test".to_string()],
            dns_host: "dns.test".to_string(),
            probe_timeout: Duration::from_secs(1),
        }
    }

    fn detector(
        http: MockHttpClient,
        dns: MockResolver,
    ) -> (OfflineDetector, Arc<MockHttpClient>, Arc<MockResolver>, Arc<ManualClock>) {
        let http = Arc::new(http);
        let dns = Arc::new(dns);
        let clock = Arc::new(ManualClock::new());
        let detector =
            OfflineDetector::with_probes(config(), http.clone(), dns.clone(), clock.clone());
        (detector, http, dns, clock)
    }

    #[tokio::test]
    async fn test_client_error_status_counts_as_online() {
        let (detector, _, dns, _) = detector(
            MockHttpClient::unreachable().with_status("https://a.test", 404),
            MockResolver::failing(),
        );
        assert!(!detector.check().await);
        assert_eq!(dns.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_error_tries_next_endpoint() {
        let (detector, http, _, _) = detector(
            MockHttpClient::unreachable()
                .with_status("https://a.test", 503)
                .with_status("https://b.test", 200),
            MockResolver::failing(),
        );
        assert!(!detector.check().await);
        assert_eq!(http.call_count(), 2);
    }

    #[tokio::test]
    async fn test_dns_fallback_when_http_fails() {
        let (detector, _, dns, _) = detector(MockHttpClient::unreachable(), MockResolver::resolving());
        assert!(!detector.check().await);
        assert_eq!(dns.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offline_when_everything_fails() {
        let (detector, _, _, _) = detector(MockHttpClient::unreachable(), MockResolver::failing());
        assert!(detector.check().await);
        assert!(detector.last_checked().is_some());
    }

    #[tokio::test]
    async fn test_result_reused_within_interval() {
        let (detector, http, _, clock) = detector(
            MockHttpClient::unreachable().with_status("https://a.test", 200),
            MockResolver::failing(),
        );
        assert!(!detector.is_offline().await);
        assert!(!detector.is_offline().await);
        assert_eq!(http.call_count(), 1);

        clock.advance(Duration::from_secs(31));
        assert!(!detector.is_offline().await);
        assert_eq!(http.call_count(), 2);
    }

    #[tokio::test]
    async fn test_force_offline_overrides_probes() {
        let (detector, http, _, _) = detector(
            MockHttpClient::unreachable().with_status("https://a.test", 200),
            MockResolver::failing(),
        );
        assert!(detector.force_offline(true).await);
        assert!(detector.is_offline().await);
        assert_eq!(http.call_count(), 0);

        assert!(!detector.force_offline(false).await);
        assert!(!detector.is_forced());
        assert_eq!(http.call_count(), 1);
    }
}
