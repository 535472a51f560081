//! Proxy pool management + HTTP fetch client for Elenco.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "elenco-net";

/// Immutable network egress identifier, parsed from one line of a proxy list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyDescriptor {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyDescriptor {
    /// Accepts `host:port` and `host:port:user:pass`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.trim().split(':');
        let host = parts.next()?.trim();
        if host.is_empty() {
            return None;
        }
        let port: u16 = parts.next()?.trim().parse().ok()?;
        let username = parts.next().map(str::to_string);
        let password = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            host: host.to_string(),
            port,
            username,
            password,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Load proxy descriptors from a text file, one per line. A missing file is
/// the documented degraded mode and yields an empty list, not an error.
pub fn load_proxy_list(path: &Path) -> Vec<ProxyDescriptor> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(_) => return Vec::new(),
    };
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let parsed = ProxyDescriptor::parse(line);
            if parsed.is_none() {
                warn!(line, "skipping unparseable proxy entry");
            }
            parsed
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub cold: usize,
    pub hot: usize,
    pub checked_out: usize,
    pub total: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    cold: VecDeque<ProxyDescriptor>,
    hot: HashMap<ProxyDescriptor, Instant>,
    checked_out: HashSet<ProxyDescriptor>,
}

impl PoolState {
    /// Promote every hot proxy whose cooldown deadline has passed. Called
    /// under the pool lock on every access, so recovery is observed without
    /// a background timer.
    fn reclaim(&mut self, now: Instant) {
        let cooled: Vec<ProxyDescriptor> = self
            .hot
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(proxy, _)| proxy.clone())
            .collect();
        for proxy in cooled {
            self.hot.remove(&proxy);
            self.cold.push_back(proxy);
        }
    }
}

/// Shared proxy pool with a cold/hot partition and checkout tracking.
///
/// Every loaded descriptor is in exactly one of cold, hot, or checked-out at
/// all times. All partition transitions happen inside one mutex critical
/// section; fetch I/O never runs under the lock.
#[derive(Debug)]
pub struct ProxyPool {
    cooldown: Duration,
    total: usize,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<ProxyDescriptor>, cooldown: Duration) -> Self {
        let total = proxies.len();
        Self {
            cooldown,
            total,
            state: Mutex::new(PoolState {
                cold: proxies.into_iter().collect(),
                ..Default::default()
            }),
        }
    }

    /// True when the pool was built with at least one descriptor. A pool that
    /// was never provisioned means direct fetching, not exhaustion.
    pub fn is_provisioned(&self) -> bool {
        self.total > 0
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Check out one cold proxy. Returns `None` when nothing is currently
    /// cold, including the zero-proxy degraded mode.
    pub async fn acquire(&self) -> Option<ProxyDescriptor> {
        let mut state = self.state.lock().await;
        state.reclaim(Instant::now());
        let proxy = state.cold.pop_front()?;
        state.checked_out.insert(proxy.clone());
        debug!(proxy = %proxy, "proxy checked out");
        Some(proxy)
    }

    /// Return a checked-out, still-healthy proxy to the cold queue.
    pub async fn release(&self, proxy: &ProxyDescriptor) {
        let mut state = self.state.lock().await;
        if state.checked_out.remove(proxy) {
            state.cold.push_back(proxy.clone());
        }
    }

    /// Move a checked-out proxy to the hot set with a fresh cooldown
    /// deadline. It re-enters cold only via a later reclaim pass.
    pub async fn report_failure(&self, proxy: &ProxyDescriptor) {
        let mut state = self.state.lock().await;
        state.checked_out.remove(proxy);
        state.cold.retain(|cold| cold != proxy);
        state.hot.insert(proxy.clone(), Instant::now() + self.cooldown);
        warn!(proxy = %proxy, cooldown_secs = self.cooldown.as_secs(), "proxy marked hot");
    }

    /// Explicit reclaim pass; `acquire` and `status` already reclaim lazily.
    pub async fn reclaim(&self) {
        let mut state = self.state.lock().await;
        state.reclaim(Instant::now());
    }

    /// Point-in-time snapshot for progress reporting.
    pub async fn status(&self) -> PoolStatus {
        let mut state = self.state.lock().await;
        state.reclaim(Instant::now());
        PoolStatus {
            cold: state.cold.len(),
            hot: state.hot.len(),
            checked_out: state.checked_out.len(),
            total: self.total,
        }
    }
}

/// Fetched page content handed to extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub url: String,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level failure (timeout, refused connection, anti-bot block).
    /// Counts toward the worker's rotation threshold.
    #[error("transient fetch failure for {url}: {reason}")]
    Transient { url: String, reason: String },
    /// Non-retryable failure; the URL is skipped without touching proxy
    /// health.
    #[error("permanent fetch failure for {url}: {reason}")]
    Permanent { url: String, reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn url(&self) -> &str {
        match self {
            FetchError::Transient { url, .. } | FetchError::Permanent { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 403 is included: directory sites answer blocked proxies with it, which is
/// a proxy-health signal rather than a property of the URL.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::FORBIDDEN
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Opaque page-fetch capability. The engine only ever talks to this trait;
/// tests substitute scripted implementations.
#[async_trait]
pub trait FetchClient: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<PageContent, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

/// `reqwest`-backed fetch client. Proxies bind at the client level in
/// reqwest, so one client is built (and cached) per descriptor; the direct
/// client covers proxy-less fetches.
#[derive(Debug)]
pub struct HttpFetchClient {
    config: HttpClientConfig,
    direct: reqwest::Client,
    per_proxy: Mutex<HashMap<ProxyDescriptor, reqwest::Client>>,
}

impl HttpFetchClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let direct = Self::builder(&config)
            .build()
            .context("building direct reqwest client")?;
        Ok(Self {
            config,
            direct,
            per_proxy: Mutex::new(HashMap::new()),
        })
    }

    fn builder(config: &HttpClientConfig) -> reqwest::ClientBuilder {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder
    }

    async fn client_for(
        &self,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<reqwest::Client, FetchError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let mut map = self.per_proxy.lock().await;
        if let Some(client) = map.get(proxy) {
            return Ok(client.clone());
        }

        let mut upstream = reqwest::Proxy::all(proxy.endpoint()).map_err(|err| {
            FetchError::Transient {
                url: proxy.endpoint(),
                reason: format!("invalid proxy endpoint: {err}"),
            }
        })?;
        if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
            upstream = upstream.basic_auth(user, pass);
        }

        let client = Self::builder(&self.config)
            .proxy(upstream)
            .build()
            .map_err(|err| FetchError::Transient {
                url: proxy.endpoint(),
                reason: format!("building proxied client: {err}"),
            })?;
        map.insert(proxy.clone(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl FetchClient for HttpFetchClient {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&ProxyDescriptor>,
    ) -> Result<PageContent, FetchError> {
        let client = self.client_for(proxy).await?;

        let response = client.get(url).send().await.map_err(|err| {
            match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => FetchError::Transient {
                    url: url.to_string(),
                    reason: err.to_string(),
                },
                RetryDisposition::NonRetryable => FetchError::Permanent {
                    url: url.to_string(),
                    reason: err.to_string(),
                },
            }
        })?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let reason = format!("http status {}", status.as_u16());
            return Err(match classify_status(status) {
                RetryDisposition::Retryable => FetchError::Transient {
                    url: url.to_string(),
                    reason,
                },
                RetryDisposition::NonRetryable => FetchError::Permanent {
                    url: url.to_string(),
                    reason,
                },
            });
        }

        let body = response.text().await.map_err(|err| FetchError::Transient {
            url: url.to_string(),
            reason: format!("reading body: {err}"),
        })?;

        Ok(PageContent {
            url: url.to_string(),
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn descriptor_parsing_accepts_both_shapes() {
        let plain = ProxyDescriptor::parse("10.0.0.1:8080").expect("plain");
        assert_eq!(plain.host, "10.0.0.1");
        assert_eq!(plain.port, 8080);
        assert!(plain.username.is_none());

        let with_auth = ProxyDescriptor::parse("proxy.example.net:3128:alice:s3cret").expect("auth");
        assert_eq!(with_auth.username.as_deref(), Some("alice"));
        assert_eq!(with_auth.password.as_deref(), Some("s3cret"));

        assert!(ProxyDescriptor::parse("").is_none());
        assert!(ProxyDescriptor::parse("no-port").is_none());
        assert!(ProxyDescriptor::parse("host:not-a-port").is_none());
        assert!(ProxyDescriptor::parse("a:1:b:c:d").is_none());
    }

    #[test]
    fn proxy_list_loading_skips_junk_and_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proxylist.txt");
        std::fs::write(&path, "10.0.0.1:8080\n\n# comment\nbroken line\n10.0.0.2:8081\n")
            .expect("write");

        let proxies = load_proxy_list(&path);
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[1].port, 8081);

        assert!(load_proxy_list(&dir.path().join("absent.txt")).is_empty());
    }

    fn descriptors(n: u16) -> Vec<ProxyDescriptor> {
        (0..n)
            .map(|i| ProxyDescriptor {
                host: format!("10.0.0.{i}"),
                port: 8000 + i,
                username: None,
                password: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn acquire_release_cycles_through_cold_queue() {
        let pool = ProxyPool::new(descriptors(2), Duration::from_secs(300));
        let first = pool.acquire().await.expect("first");
        let second = pool.acquire().await.expect("second");
        assert_ne!(first, second);
        assert!(pool.acquire().await.is_none());

        pool.release(&first).await;
        let third = pool.acquire().await.expect("third");
        assert_eq!(third, first);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_double_checkout() {
        let pool = Arc::new(ProxyPool::new(descriptors(3), Duration::from_secs(300)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire().await }));
        }

        let mut held = Vec::new();
        for handle in handles {
            if let Some(proxy) = handle.await.expect("join") {
                held.push(proxy);
            }
        }
        assert_eq!(held.len(), 3);
        let unique: HashSet<_> = held.iter().collect();
        assert_eq!(unique.len(), held.len());
    }

    #[tokio::test]
    async fn partition_counts_always_sum_to_total() {
        let pool = ProxyPool::new(descriptors(3), Duration::from_secs(300));
        let check = |status: PoolStatus| {
            assert_eq!(status.cold + status.hot + status.checked_out, status.total);
        };

        check(pool.status().await);
        let held = pool.acquire().await.expect("acquire");
        check(pool.status().await);
        pool.report_failure(&held).await;
        let status = pool.status().await;
        check(status);
        assert_eq!(status.hot, 1);
        assert_eq!(status.checked_out, 0);
    }

    #[tokio::test]
    async fn failed_proxy_returns_to_cold_after_cooldown() {
        let pool = ProxyPool::new(descriptors(1), Duration::from_millis(50));
        let held = pool.acquire().await.expect("acquire");
        pool.report_failure(&held).await;

        assert!(pool.acquire().await.is_none());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let reclaimed = pool.acquire().await.expect("reclaimed");
        assert_eq!(reclaimed, held);
    }

    #[tokio::test]
    async fn release_of_unknown_proxy_is_a_noop() {
        let pool = ProxyPool::new(descriptors(1), Duration::from_secs(300));
        let stranger = ProxyDescriptor {
            host: "192.0.2.1".into(),
            port: 9999,
            username: None,
            password: None,
        };
        pool.release(&stranger).await;
        let status = pool.status().await;
        assert_eq!(status.cold, 1);
        assert_eq!(status.total, 1);
    }

    #[tokio::test]
    async fn empty_pool_operates_without_error() {
        let pool = ProxyPool::new(Vec::new(), Duration::from_secs(300));
        assert!(!pool.is_provisioned());
        assert!(pool.acquire().await.is_none());
        let status = pool.status().await;
        assert_eq!(status.total, 0);
        assert_eq!(status.cold, 0);
    }

    #[test]
    fn status_classification_matches_block_semantics() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::GONE),
            RetryDisposition::NonRetryable
        );
    }
}
