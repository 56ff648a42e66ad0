//! Resilient image fetcher with multiple bypass strategies.
//!
//! Forum image hosts with anti-bot defenses reject plain programmatic
//! downloads, so the fetcher tries every (strategy × URL variant)
//! combination in a fixed order before giving up. Ordinary per-attempt
//! failures never escape [`fetch`](iris_core::traits::ImageFetcher::fetch);
//! the caller sees either bytes plus the method that worked, or a single
//! `DownloadFailed` after exhaustion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use iris_core::error::AppError;
use iris_core::models::{FetchAttempt, FetchMethod, FetchedImage};
use iris_core::retry::random_jitter_ms;
use iris_core::traits::ImageFetcher;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use url::Url;

/// Browser user agents rotated across attempts.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0",
];

/// Configuration for the bypass fetcher.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Host suffixes known to run anti-bot defenses; these get the full
    /// strategy set, everything else gets plain HTTP only.
    pub defended_hosts: Vec<String>,

    /// Known CDN/mirror host rewrites, applied as (from, to) swaps.
    pub mirror_swaps: Vec<(String, String)>,

    /// Bearer token for hosts that accept an OAuth session. When absent
    /// the oauth strategy is skipped entirely.
    pub oauth_token: Option<String>,

    /// Bodies below this size are treated as corrupt/placeholder images.
    pub min_bytes: usize,

    /// Bodies above this size are rejected without buffering fully.
    pub max_bytes: usize,

    /// Base courtesy delay before each attempt.
    pub courtesy_delay: Duration,

    /// Maximum random jitter added on top of the courtesy delay.
    pub courtesy_jitter: Duration,

    /// Per-request read timeout.
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            defended_hosts: Vec::new(),
            mirror_swaps: Vec::new(),
            oauth_token: None,
            min_bytes: 1000,
            max_bytes: 10 * 1024 * 1024,
            courtesy_delay: Duration::from_millis(100),
            courtesy_jitter: Duration::from_millis(250),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Cumulative download counters for observability.
#[derive(Debug, Clone, Default)]
pub struct FetchStats {
    pub total_attempts: u64,
    pub successful_downloads: u64,
    pub method_successes: HashMap<FetchMethod, u64>,
}

impl FetchStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        self.successful_downloads as f64 / self.total_attempts as f64
    }
}

/// HTTP fetcher that rotates bypass strategies and URL variants.
#[derive(Clone)]
pub struct BypassFetcher {
    client: Client,
    config: FetchConfig,
    ua_cursor: Arc<AtomicUsize>,
    stats: Arc<Mutex<FetchStats>>,
}

impl BypassFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;
        Ok(Self {
            client,
            config,
            ua_cursor: Arc::new(AtomicUsize::new(0)),
            stats: Arc::new(Mutex::new(FetchStats::default())),
        })
    }

    pub fn stats(&self) -> FetchStats {
        self.lock_stats().clone()
    }

    pub fn success_rate(&self) -> f64 {
        self.lock_stats().success_rate()
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, FetchStats> {
        self.stats.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned fetch stats mutex");
            poisoned.into_inner()
        })
    }

    /// Fold one attempt into the cumulative counters.
    fn record_attempt(&self, attempt: &FetchAttempt) {
        let mut stats = self.lock_stats();
        stats.total_attempts += 1;
        if attempt.success {
            stats.successful_downloads += 1;
            *stats.method_successes.entry(attempt.method).or_insert(0) += 1;
        }
    }

    /// Strategies to try for this locator, cheapest first.
    ///
    /// Defended hosts get the full bypass set; everything else is not
    /// worth the extra requests and gets plain HTTP only.
    fn strategies_for(&self, locator: &str) -> Vec<FetchMethod> {
        let host = Url::parse(locator)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();
        let defended = self
            .config
            .defended_hosts
            .iter()
            .any(|suffix| host == *suffix || host.ends_with(&format!(".{suffix}")));
        if !defended {
            return vec![FetchMethod::BasicHttp];
        }

        let mut methods = vec![FetchMethod::BasicHttp];
        if self.config.oauth_token.is_some() {
            methods.push(FetchMethod::OauthHttp);
        }
        methods.push(FetchMethod::SessionSpoofing);
        methods.push(FetchMethod::ProxySimulation);
        methods
    }

    /// Alternative URL forms, in the order they are attempted:
    ///
    /// 1. the original URL
    /// 2. https → http protocol downgrade
    /// 3. configured CDN/mirror host swaps
    /// 4. the URL with its query string stripped (drops quality/size
    ///    parameters that some hosts gate behind auth)
    fn url_variants(&self, locator: &str) -> Vec<String> {
        let mut variants = vec![locator.to_string()];

        if let Some(rest) = locator.strip_prefix("https://") {
            variants.push(format!("http://{rest}"));
        }

        for (from, to) in &self.config.mirror_swaps {
            if locator.contains(from.as_str()) {
                variants.push(locator.replacen(from.as_str(), to, 1));
            }
        }

        if let Some((base, _query)) = locator.split_once('?') {
            variants.push(base.to_string());
        }

        let mut seen = Vec::with_capacity(variants.len());
        for v in variants {
            if !seen.contains(&v) {
                seen.push(v);
            }
        }
        seen
    }

    fn next_user_agent(&self) -> &'static str {
        let i = self.ua_cursor.fetch_add(1, Ordering::Relaxed);
        USER_AGENTS[i % USER_AGENTS.len()]
    }

    /// Strategy-specific request headers.
    fn headers_for(&self, method: FetchMethod, locator: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(self.next_user_agent()),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/png,image/*;q=0.8,*/*;q=0.5"),
        );

        match method {
            FetchMethod::BasicHttp => {}
            FetchMethod::OauthHttp => {
                if let Some(token) = &self.config.oauth_token
                    && let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}"))
                {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
            FetchMethod::SessionSpoofing => {
                let cookie = format!(
                    "sessionid={:016x}; csrftoken={:016x}; logged_in=yes",
                    random_jitter_ms(u64::MAX),
                    random_jitter_ms(u64::MAX),
                );
                if let Ok(value) = HeaderValue::from_str(&cookie) {
                    headers.insert(reqwest::header::COOKIE, value);
                }
                if let Some(origin) = origin_of(locator)
                    && let Ok(value) = HeaderValue::from_str(&origin)
                {
                    headers.insert(reqwest::header::REFERER, value);
                }
            }
            FetchMethod::ProxySimulation => {
                let ip = forged_client_ip();
                if let Ok(value) = HeaderValue::from_str(&ip) {
                    headers.insert("X-Forwarded-For", value.clone());
                    headers.insert("X-Real-IP", value);
                }
            }
        }
        headers
    }

    async fn courtesy_pause(&self) {
        let jitter = random_jitter_ms(self.config.courtesy_jitter.as_millis() as u64);
        tokio::time::sleep(self.config.courtesy_delay + Duration::from_millis(jitter)).await;
    }

    /// One (strategy, URL) attempt. Accepts only 2xx bodies within the
    /// [min_bytes, max_bytes] band.
    async fn attempt(&self, method: FetchMethod, url: &str) -> Result<Vec<u8>, AppError> {
        let headers = self.headers_for(method, url);
        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(self.config.timeout.as_secs())
                } else if e.is_connect() {
                    AppError::NetworkError(format!("Connection failed: {e}"))
                } else {
                    AppError::HttpError(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimitExceeded);
        }
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(AppError::HttpError(format!(
                "Body of {len} bytes exceeds the {} byte ceiling",
                self.config.max_bytes
            )));
        }

        // Stream the body so an unbounded response cannot be buffered
        // past the ceiling.
        let mut body = Vec::new();
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))?
        {
            body.extend_from_slice(&chunk);
            if body.len() > self.config.max_bytes {
                return Err(AppError::HttpError(format!(
                    "Body exceeded the {} byte ceiling",
                    self.config.max_bytes
                )));
            }
        }

        if body.len() < self.config.min_bytes {
            return Err(AppError::CorruptImage {
                size: body.len(),
                min: self.config.min_bytes,
            });
        }
        Ok(body)
    }
}

impl ImageFetcher for BypassFetcher {
    async fn fetch(&self, locator: &str) -> Result<FetchedImage, AppError> {
        let methods = self.strategies_for(locator);
        let variants = self.url_variants(locator);
        let mut attempts = 0u64;

        for method in &methods {
            for url in &variants {
                attempts += 1;
                self.courtesy_pause().await;

                let started = Instant::now();
                match self.attempt(*method, url).await {
                    Ok(bytes) => {
                        let attempt = FetchAttempt {
                            method: *method,
                            url: url.clone(),
                            success: true,
                            byte_size: bytes.len(),
                            latency_ms: started.elapsed().as_millis() as u64,
                        };
                        self.record_attempt(&attempt);
                        tracing::info!(
                            method = %attempt.method,
                            url = %attempt.url,
                            bytes = attempt.byte_size,
                            latency_ms = attempt.latency_ms,
                            "Image downloaded"
                        );
                        return Ok(FetchedImage {
                            bytes,
                            method: *method,
                        });
                    }
                    Err(e) => {
                        let attempt = FetchAttempt {
                            method: *method,
                            url: url.clone(),
                            success: false,
                            byte_size: 0,
                            latency_ms: started.elapsed().as_millis() as u64,
                        };
                        self.record_attempt(&attempt);
                        tracing::debug!(
                            method = %attempt.method,
                            url = %attempt.url,
                            latency_ms = attempt.latency_ms,
                            error = %e,
                            "Attempt failed"
                        );
                    }
                }
            }
        }

        tracing::warn!(locator = %locator, attempts, "All fetch strategies exhausted");
        Err(AppError::DownloadFailed {
            locator: locator.to_string(),
            attempts,
        })
    }
}

fn origin_of(locator: &str) -> Option<String> {
    let url = Url::parse(locator).ok()?;
    Some(format!("{}://{}/", url.scheme(), url.host_str()?))
}

/// A plausible public client address for the forwarding headers.
fn forged_client_ip() -> String {
    format!(
        "{}.{}.{}.{}",
        20 + random_jitter_ms(180),
        1 + random_jitter_ms(254),
        1 + random_jitter_ms(254),
        1 + random_jitter_ms(254),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(config: FetchConfig) -> BypassFetcher {
        BypassFetcher::new(config).unwrap()
    }

    fn defended_config() -> FetchConfig {
        FetchConfig {
            defended_hosts: vec!["hostile.example".into()],
            oauth_token: Some("tok-123".into()),
            ..Default::default()
        }
    }

    #[test]
    fn undefended_hosts_get_plain_http_only() {
        let f = fetcher(defended_config());
        assert_eq!(
            f.strategies_for("https://images.friendly.example/a.png"),
            vec![FetchMethod::BasicHttp]
        );
    }

    #[test]
    fn defended_hosts_get_the_full_strategy_set() {
        let f = fetcher(defended_config());
        assert_eq!(
            f.strategies_for("https://cdn.hostile.example/a.png"),
            vec![
                FetchMethod::BasicHttp,
                FetchMethod::OauthHttp,
                FetchMethod::SessionSpoofing,
                FetchMethod::ProxySimulation,
            ]
        );
    }

    #[test]
    fn oauth_strategy_is_skipped_without_a_token() {
        let f = fetcher(FetchConfig {
            defended_hosts: vec!["hostile.example".into()],
            oauth_token: None,
            ..Default::default()
        });
        let methods = f.strategies_for("https://hostile.example/a.png");
        assert!(!methods.contains(&FetchMethod::OauthHttp));
        assert_eq!(methods.len(), 3);
    }

    #[test]
    fn url_variants_follow_the_documented_order() {
        let f = fetcher(FetchConfig {
            mirror_swaps: vec![("cdn.hostile.example".into(), "mirror.example".into())],
            ..Default::default()
        });
        let variants = f.url_variants("https://cdn.hostile.example/img/a.png?quality=85&w=640");
        assert_eq!(
            variants,
            vec![
                "https://cdn.hostile.example/img/a.png?quality=85&w=640",
                "http://cdn.hostile.example/img/a.png?quality=85&w=640",
                "https://mirror.example/img/a.png?quality=85&w=640",
                "https://cdn.hostile.example/img/a.png",
            ]
        );
    }

    #[test]
    fn url_variants_dedup_and_skip_inapplicable_forms() {
        let f = fetcher(FetchConfig::default());
        let variants = f.url_variants("http://plain.example/a.png");
        // Already http, no mirrors configured, no query string.
        assert_eq!(variants, vec!["http://plain.example/a.png"]);
    }

    #[test]
    fn session_spoofing_headers_carry_cookie_and_referer() {
        let f = fetcher(FetchConfig::default());
        let headers = f.headers_for(
            FetchMethod::SessionSpoofing,
            "https://hostile.example/img/a.png",
        );
        let cookie = headers.get(reqwest::header::COOKIE).unwrap();
        assert!(cookie.to_str().unwrap().contains("sessionid="));
        assert!(cookie.to_str().unwrap().contains("logged_in=yes"));
        assert_eq!(
            headers.get(reqwest::header::REFERER).unwrap(),
            "https://hostile.example/"
        );
    }

    #[test]
    fn proxy_simulation_headers_forge_forwarding_chain() {
        let f = fetcher(FetchConfig::default());
        let headers = f.headers_for(FetchMethod::ProxySimulation, "https://x.example/a.png");
        let xff = headers.get("X-Forwarded-For").unwrap().to_str().unwrap();
        assert!(xff.parse::<std::net::Ipv4Addr>().is_ok(), "bad ip: {xff}");
        assert_eq!(headers.get("X-Real-IP").unwrap().to_str().unwrap(), xff);
    }

    #[test]
    fn oauth_headers_carry_the_bearer_token() {
        let f = fetcher(defended_config());
        let headers = f.headers_for(FetchMethod::OauthHttp, "https://hostile.example/a.png");
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer tok-123"
        );
    }

    #[test]
    fn user_agents_rotate_across_attempts() {
        let f = fetcher(FetchConfig::default());
        let first = f.next_user_agent();
        let second = f.next_user_agent();
        assert_ne!(first, second);
    }

    #[test]
    fn recorded_attempts_drive_the_stats_counters() {
        let f = fetcher(FetchConfig::default());
        f.record_attempt(&FetchAttempt {
            method: FetchMethod::SessionSpoofing,
            url: "https://hostile.example/a.png".into(),
            success: true,
            byte_size: 2048,
            latency_ms: 12,
        });
        f.record_attempt(&FetchAttempt {
            method: FetchMethod::BasicHttp,
            url: "https://hostile.example/a.png".into(),
            success: false,
            byte_size: 0,
            latency_ms: 40,
        });

        let stats = f.stats();
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.successful_downloads, 1);
        assert_eq!(
            stats.method_successes.get(&FetchMethod::SessionSpoofing),
            Some(&1)
        );
        assert_eq!(stats.method_successes.get(&FetchMethod::BasicHttp), None);
        assert!((f.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn success_rate_reflects_the_counters() {
        let stats = FetchStats {
            total_attempts: 8,
            successful_downloads: 2,
            method_successes: HashMap::new(),
        };
        assert!((stats.success_rate() - 0.25).abs() < 1e-9);
        assert_eq!(FetchStats::default().success_rate(), 0.0);
    }

    #[tokio::test]
    async fn fetch_reports_exhaustion_for_unresolvable_host() {
        // .invalid is reserved and never resolves, so every attempt fails
        // locally and quickly.
        let f = fetcher(FetchConfig {
            courtesy_delay: Duration::ZERO,
            courtesy_jitter: Duration::ZERO,
            timeout: Duration::from_secs(2),
            ..Default::default()
        });
        let err = f.fetch("https://img.test.invalid/a.png?x=1").await.unwrap_err();
        match err {
            AppError::DownloadFailed { attempts, .. } => {
                // 1 method × 3 variants (original, downgrade, query-stripped).
                assert_eq!(attempts, 3);
            }
            other => panic!("expected DownloadFailed, got {other}"),
        }
        assert_eq!(f.stats().total_attempts, 3);
        assert_eq!(f.stats().successful_downloads, 0);
    }
}
