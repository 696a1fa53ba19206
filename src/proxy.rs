//! Outbound HTTP gate with one adaptive token bucket per remote host.
//!
//! Every request to a host first waits for that host's limiter. Limits start
//! from a conservative default and are tuned from the host's own
//! `ratelimit-*` response headers:
//!
//! - `ratelimit-policy: N;w=W` sets the steady rate to `N / W` requests per second.
//! - `ratelimit-remaining: 0` together with `ratelimit-reset: T` (unix seconds)
//!   registers a hard pause: no request to that host is issued before `T`.

use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use iroh_metrics::inc;
use parking_lot::{Mutex, RwLock};
use reqwest::{header::HeaderMap, Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::metrics::Metrics;

/// Rates closer than this are considered equal.
const RATE_EPSILON: f64 = 1e-7;
const MIN_RATE: f64 = 1e-3;
const MAX_RATE: f64 = 1e6;

const POLICY_HEADER: &str = "ratelimit-policy";
const REMAINING_HEADER: &str = "ratelimit-remaining";
const RESET_HEADER: &str = "ratelimit-reset";

/// Steady rate (requests per second) and burst of a token bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    pub rate: f64,
    pub burst: u32,
}

impl RateLimit {
    /// Limit applied to a host before it has told us its own.
    pub const DEFAULT: RateLimit = RateLimit {
        rate: 10.0,
        burst: 30,
    };

    pub fn new(rate: f64, burst: u32) -> Self {
        Self { rate, burst }
    }

    fn quota(&self) -> Quota {
        let rate = self.rate.clamp(MIN_RATE, MAX_RATE);
        let period = Duration::from_secs_f64(1.0 / rate);
        let burst = NonZeroU32::new(self.burst).unwrap_or(NonZeroU32::MIN);
        Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX))
            .allow_burst(burst)
    }

    fn bucket(&self) -> DefaultDirectRateLimiter {
        RateLimiter::direct(self.quota())
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A rate-limit policy advertised by a host: `requests` per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub requests: u32,
    pub window: Duration,
}

impl RatePolicy {
    /// Parses the `N;w=W` header format. Unknown parameters are ignored.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(';').map(str::trim);
        let requests: u32 = parts.next()?.parse().ok()?;
        let window = parts
            .find_map(|p| p.strip_prefix("w="))
            .and_then(|w| w.parse::<u64>().ok())?;
        if requests == 0 || window == 0 {
            return None;
        }
        Some(Self {
            requests,
            window: Duration::from_secs(window),
        })
    }

    /// Requests per second.
    pub fn rate(&self) -> f64 {
        self.requests as f64 / self.window.as_secs_f64()
    }
}

#[derive(Debug, Clone, Copy)]
struct LimiterState {
    limit: RateLimit,
    pause_until: Option<SystemTime>,
}

/// Token bucket plus hard-pause deadline for a single host.
///
/// Shared by all concurrent callers to that host.
#[derive(derive_more::Debug)]
pub struct HostLimiter {
    #[debug("DefaultDirectRateLimiter")]
    bucket: RwLock<Arc<DefaultDirectRateLimiter>>,
    state: Mutex<LimiterState>,
}

impl HostLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            bucket: RwLock::new(Arc::new(limit.bucket())),
            state: Mutex::new(LimiterState {
                limit,
                pause_until: None,
            }),
        }
    }

    /// The current steady rate and burst.
    pub fn limit(&self) -> RateLimit {
        self.state.lock().limit
    }

    /// The registered hard-pause deadline, if it lies in the future.
    pub fn paused_until(&self) -> Option<SystemTime> {
        let until = self.state.lock().pause_until?;
        (until > SystemTime::now()).then_some(until)
    }

    /// Waits until a call may be issued.
    ///
    /// Returns once the bucket admits the call and no hard pause is in
    /// effect. A pause registered while waiting on the bucket is honored too.
    pub async fn acquire(&self) {
        loop {
            if let Some(wait) = self.pause_remaining() {
                tokio::time::sleep(wait).await;
                continue;
            }
            let bucket = self.bucket.read().clone();
            bucket.until_ready().await;
            if self.pause_remaining().is_none() {
                return;
            }
        }
    }

    fn pause_remaining(&self) -> Option<Duration> {
        let until = self.paused_until()?;
        until
            .duration_since(SystemTime::now())
            .ok()
            .filter(|wait| !wait.is_zero())
    }

    /// Sets the steady rate, keeping the burst. Returns `false` if the rate
    /// was already (materially) the same.
    pub fn set_rate(&self, rate: f64) -> bool {
        let mut state = self.state.lock();
        let limit = RateLimit::new(rate, state.limit.burst);
        self.replace(&mut state, limit)
    }

    /// Applies a host-advertised policy. The burst never grows beyond what
    /// the policy allows per window.
    pub fn apply_policy(&self, policy: RatePolicy) -> bool {
        let mut state = self.state.lock();
        let limit = RateLimit::new(policy.rate(), state.limit.burst.min(policy.requests));
        self.replace(&mut state, limit)
    }

    /// Blocks all calls until `deadline`. An earlier deadline never shortens
    /// an existing pause.
    pub fn pause_until(&self, deadline: SystemTime) {
        let mut state = self.state.lock();
        state.pause_until = Some(match state.pause_until {
            Some(existing) if existing > deadline => existing,
            _ => deadline,
        });
    }

    /// Updates the limiter from the rate-limit headers of a response.
    pub fn observe(&self, headers: &HeaderMap) {
        if let Some(policy) = header_str(headers, POLICY_HEADER).and_then(RatePolicy::parse) {
            if self.apply_policy(policy) {
                debug!(rate = policy.rate(), "adopted advertised rate limit policy");
                inc!(Metrics, proxy_policy_updates);
            }
        }
        let exhausted = header_str(headers, REMAINING_HEADER)
            .and_then(|v| v.trim().parse::<u64>().ok())
            == Some(0);
        if exhausted {
            match header_str(headers, RESET_HEADER).and_then(|v| v.trim().parse::<u64>().ok()) {
                Some(reset) => {
                    let deadline = UNIX_EPOCH + Duration::from_secs(reset);
                    debug!(reset, "rate limit exhausted, pausing host");
                    self.pause_until(deadline);
                    inc!(Metrics, proxy_hard_pauses);
                }
                None => warn!("rate limit exhausted without a reset timestamp"),
            }
        }
    }

    fn replace(&self, state: &mut LimiterState, limit: RateLimit) -> bool {
        if (state.limit.rate - limit.rate).abs() < RATE_EPSILON && state.limit.burst == limit.burst
        {
            return false;
        }
        *self.bucket.write() = Arc::new(limit.bucket());
        state.limit = limit;
        true
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Get-or-create access to per-host limiters.
pub trait HostLimiters: std::fmt::Debug + Send + Sync + 'static {
    /// Returns the limiter for `host`, creating it on first use.
    ///
    /// Concurrent callers asking for the same host get the same limiter.
    fn get_or_create(&self, host: &str) -> Arc<HostLimiter>;
}

/// In-process [`HostLimiters`] registry. Limiters live as long as the registry.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    defaults: RateLimit,
    limiters: Mutex<HashMap<String, Arc<HostLimiter>>>,
}

impl LimiterRegistry {
    pub fn new(defaults: RateLimit) -> Self {
        Self {
            defaults,
            limiters: Default::default(),
        }
    }

    /// Number of hosts seen so far.
    pub fn len(&self) -> usize {
        self.limiters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HostLimiters for LimiterRegistry {
    fn get_or_create(&self, host: &str) -> Arc<HostLimiter> {
        let mut limiters = self.limiters.lock();
        limiters
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostLimiter::new(self.defaults)))
            .clone()
    }
}

/// Errors from [`Proxy`] calls.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("request url has no host: {0}")]
    MissingHost(Url),
    #[error("request cancelled")]
    Cancelled,
    #[error("request to {host} failed: {source}")]
    Transport {
        host: String,
        #[source]
        source: reqwest::Error,
    },
}

/// A fully read response.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Rate-limited HTTP client.
///
/// Cheap to clone. All clones share the client, the limiters and the
/// cancellation token.
#[derive(Debug, Clone)]
pub struct Proxy {
    client: reqwest::Client,
    limiters: Arc<dyn HostLimiters>,
    cancel: CancellationToken,
}

impl Proxy {
    pub fn new(
        client: reqwest::Client,
        limiters: Arc<dyn HostLimiters>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            limiters,
            cancel,
        }
    }

    /// Issues a GET request for `url`.
    pub async fn get(&self, url: Url) -> Result<ProxyResponse, ProxyError> {
        let host = url.host_str().unwrap_or_default().to_string();
        let request = self
            .client
            .get(url)
            .build()
            .map_err(|source| ProxyError::Transport { host, source })?;
        self.execute(request).await
    }

    /// Issues `request` once the limiter of its host admits it, and reads the
    /// full body.
    ///
    /// Non-success statuses are returned as responses, not errors.
    pub async fn execute(&self, request: Request) -> Result<ProxyResponse, ProxyError> {
        let Some(host) = request.url().host_str().map(str::to_string) else {
            return Err(ProxyError::MissingHost(request.url().clone()));
        };
        let limiter = self.limiters.get_or_create(&host);
        let client = &self.client;
        let call = async move {
            limiter.acquire().await;
            inc!(Metrics, proxy_requests);
            let response = client
                .execute(request)
                .await
                .map_err(|source| ProxyError::Transport {
                    host: host.clone(),
                    source,
                })?;
            limiter.observe(response.headers());
            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|source| ProxyError::Transport { host, source })?;
            Ok(ProxyResponse {
                status,
                headers,
                body,
            })
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ProxyError::Cancelled),
            res = call => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use axum::{routing::get, Router};
    use reqwest::header::HeaderValue;
    use testresult::TestResult;

    use super::*;
    use crate::test_utils::spawn_server;

    fn headers(pairs: &[(&'static str, String)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn parse_policy() {
        let p = RatePolicy::parse("3000;w=300").unwrap();
        assert_eq!(p.requests, 3000);
        assert_eq!(p.window, Duration::from_secs(300));
        assert!((p.rate() - 10.0).abs() < RATE_EPSILON);

        let p = RatePolicy::parse("100; w=60; comment=\"burst\"").unwrap();
        assert_eq!(p.requests, 100);
        assert_eq!(p.window, Duration::from_secs(60));

        assert_eq!(RatePolicy::parse("100"), None);
        assert_eq!(RatePolicy::parse("x;w=60"), None);
        assert_eq!(RatePolicy::parse("0;w=60"), None);
        assert_eq!(RatePolicy::parse("10;w=0"), None);
    }

    #[tokio::test]
    async fn registry_is_get_or_create() {
        let registry = Arc::new(LimiterRegistry::default());
        let first = registry.get_or_create("pds.example.com");

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.spawn(async move { registry.get_or_create("pds.example.com") });
        }
        while let Some(limiter) = tasks.join_next().await {
            assert!(Arc::ptr_eq(&first, &limiter.unwrap()));
        }

        let other = registry.get_or_create("other.example.com");
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
        assert_eq!(first.limit(), RateLimit::DEFAULT);
    }

    #[tokio::test]
    async fn advertised_policy_spaces_calls() {
        let limiter = HostLimiter::new(RateLimit::DEFAULT);
        limiter.observe(&headers(&[(POLICY_HEADER, "5;w=1".to_string())]));
        assert_eq!(limiter.limit(), RateLimit::new(5.0, 5));

        // the same policy again does not reset the bucket
        assert!(!limiter.apply_policy(RatePolicy::parse("5;w=1").unwrap()));

        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        // the burst is spent, the next call waits a full period
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn pause_registered_while_waiting_holds() {
        let limiter = Arc::new(HostLimiter::new(RateLimit::new(2.0, 1)));
        limiter.acquire().await;

        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.acquire().await;
                SystemTime::now()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let deadline = SystemTime::now() + Duration::from_secs(1);
        limiter.pause_until(deadline);

        let admitted = waiter.await.unwrap();
        assert!(admitted >= deadline);
    }

    #[tokio::test]
    async fn exhausted_budget_pauses_until_reset() {
        let limiter = HostLimiter::new(RateLimit::DEFAULT);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let reset = now + 2;
        limiter.observe(&headers(&[
            (REMAINING_HEADER, "0".to_string()),
            (RESET_HEADER, reset.to_string()),
        ]));
        assert!(limiter.paused_until().is_some());

        limiter.acquire().await;
        assert!(SystemTime::now() >= UNIX_EPOCH + Duration::from_secs(reset));
        assert!(limiter.paused_until().is_none());
    }

    #[test]
    fn remaining_budget_does_not_pause() {
        let limiter = HostLimiter::new(RateLimit::DEFAULT);
        limiter.observe(&headers(&[
            (REMAINING_HEADER, "12".to_string()),
            (RESET_HEADER, "99999999999".to_string()),
        ]));
        assert!(limiter.paused_until().is_none());
    }

    #[tokio::test]
    async fn proxy_tunes_limiter_from_responses() -> TestResult {
        let app = Router::new().route(
            "/xrpc/ping",
            get(|| async { ([(POLICY_HEADER, "20;w=2")], "pong") }),
        );
        let (base, _server) = spawn_server(app).await?;

        let registry = Arc::new(LimiterRegistry::default());
        let proxy = Proxy::new(
            reqwest::Client::new(),
            registry.clone(),
            CancellationToken::new(),
        );
        let response = proxy.get(base.join("xrpc/ping")?).await?;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"pong");

        let limiter = registry.get_or_create(base.host_str().unwrap());
        assert_eq!(limiter.limit(), RateLimit::new(10.0, 20));
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_proxy_refuses_calls() -> TestResult {
        let cancel = CancellationToken::new();
        let proxy = Proxy::new(
            reqwest::Client::new(),
            Arc::new(LimiterRegistry::default()),
            cancel.clone(),
        );
        cancel.cancel();
        let res = proxy.get("http://127.0.0.1:9/".parse()?).await;
        assert!(matches!(res, Err(ProxyError::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn missing_host_is_an_error() -> TestResult {
        let proxy = Proxy::new(
            reqwest::Client::new(),
            Arc::new(LimiterRegistry::default()),
            CancellationToken::new(),
        );
        let request = reqwest::Request::new(reqwest::Method::GET, "data:text/plain,hi".parse()?);
        assert!(matches!(
            proxy.execute(request).await,
            Err(ProxyError::MissingHost(_))
        ));
        Ok(())
    }
}
