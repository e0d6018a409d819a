use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT},
    Error, HttpMessage,
};
use chrono::{SecondsFormat, Utc};
use futures::future::LocalBoxFuture;
use std::collections::HashMap;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{AppError, Result as AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::middleware::fail_open;

const USER_AGENT_PREFIX_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: Instant,
}

/// Process-local fixed-window counters.
///
/// Counters are not shared between processes; every instance of a horizontally
/// scaled deployment enforces its own limit.
#[derive(Default)]
pub struct RateLimitStore {
    entries: RwLock<HashMap<String, RateLimitEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one hit for `key`, opening a new window if none is running.
    pub async fn increment(&self, key: &str, window: Duration) -> RateLimitEntry {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let entry = entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if now >= entry.reset_time {
                    *entry = RateLimitEntry { count: 1, reset_time: now + window };
                } else {
                    entry.count = entry.count.saturating_add(1);
                }
            })
            .or_insert(RateLimitEntry { count: 1, reset_time: now + window });

        *entry
    }

    /// Give back one hit, e.g. when a successful response should not count.
    /// Only applies to the window that counted it, identified by `reset_time`.
    pub async fn decrement(&self, key: &str, reset_time: Instant) -> Option<RateLimitEntry> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(key).filter(|entry| entry.reset_time == reset_time)?;
        entry.count = entry.count.saturating_sub(1);
        Some(*entry)
    }

    pub async fn get(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.read().await.get(key).copied()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop every entry whose window has elapsed. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.reset_time > now);
        before - entries.len()
    }

    /// Start the background sweep. A running sweeper is replaced.
    pub fn start_sweeper(self: &Arc<Self>, period: Duration) {
        let store: Weak<Self> = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                interval.tick().await;

                let Some(live) = store.upgrade() else { break };
                let removed = live.sweep().await;
                if removed > 0 {
                    log::debug!("Rate limiter swept {} expired entries", removed);
                }
            }
        });

        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(previous) = sweeper.replace(handle) {
                previous.abort();
            }
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .map(|sweeper| sweeper.as_ref().map_or(false, |h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// Stop the sweeper and forget all counters.
    pub async fn shutdown(&self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
        self.entries.write().await.clear();
        log::info!("Rate limiter store shut down");
    }
}

impl Drop for RateLimitStore {
    fn drop(&mut self) {
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

pub type KeyGenerator = Arc<dyn Fn(&ServiceRequest) -> AppResult<String> + Send + Sync>;

/// Default key: client IP plus the first characters of the User-Agent.
///
/// The IP is the socket peer. `Forwarded` / `X-Forwarded-For` are client
/// controlled and only consulted when the deployment sits behind a trusted proxy.
pub fn client_fingerprint(req: &ServiceRequest, trust_proxy_headers: bool) -> String {
    let ip = if trust_proxy_headers {
        req.connection_info().realip_remote_addr().map(str::to_string)
    } else {
        req.peer_addr().map(|addr| addr.ip().to_string())
    }
    .unwrap_or_else(|| "unknown".to_string());

    let user_agent: String = req
        .headers()
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .chars()
        .take(USER_AGENT_PREFIX_LEN)
        .collect();

    format!("{}:{}", ip, user_agent)
}

/// Key by authenticated user id, falling back to the client fingerprint.
/// Must sit inside the authentication middleware to see the user.
pub fn user_key(trust_proxy_headers: bool) -> impl Fn(&ServiceRequest) -> AppResult<String> + Send + Sync + 'static {
    move |req: &ServiceRequest| {
        let user_id = req.extensions().get::<AuthenticatedUser>().map(|user| user.id);
        Ok(match user_id {
            Some(id) => format!("user:{}", id),
            None => client_fingerprint(req, trust_proxy_headers),
        })
    }
}

#[derive(Clone)]
pub struct RateLimitOptions {
    pub window: Duration,
    pub max_requests: u32,
    /// Only responses with status >= 400 count against the limit.
    pub skip_successful_requests: bool,
    /// Take the client IP from proxy headers for the default key.
    pub trust_proxy_headers: bool,
    pub key_generator: Option<KeyGenerator>,
}

impl RateLimitOptions {
    pub fn new(max_requests: u32, window_ms: u64) -> Self {
        Self {
            window: Duration::from_millis(window_ms),
            max_requests,
            skip_successful_requests: false,
            trust_proxy_headers: false,
            key_generator: None,
        }
    }

    pub fn skip_successful_requests(mut self) -> Self {
        self.skip_successful_requests = true;
        self
    }

    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    pub fn key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&ServiceRequest) -> AppResult<String> + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    fn key_for(&self, req: &ServiceRequest) -> AppResult<String> {
        match &self.key_generator {
            Some(generator) => generator(req),
            None => Ok(client_fingerprint(req, self.trust_proxy_headers)),
        }
    }
}

struct RateLimitHeaders {
    limit: u32,
    remaining: u32,
    reset: String,
}

impl RateLimitHeaders {
    fn new(limit: u32, entry: &RateLimitEntry) -> Self {
        let until_reset = entry.reset_time.saturating_duration_since(Instant::now());
        let reset_at = Utc::now() + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero());

        Self {
            limit,
            remaining: limit.saturating_sub(entry.count),
            reset: reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    fn apply(&self, headers: &mut HeaderMap) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), HeaderValue::from(self.limit));
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), HeaderValue::from(self.remaining));
        if let Ok(reset) = HeaderValue::from_str(&self.reset) {
            headers.insert(HeaderName::from_static("x-ratelimit-reset"), reset);
        }
    }
}

/// Fixed-window rate limiting middleware over a shared [`RateLimitStore`].
pub struct RateLimit {
    store: Arc<RateLimitStore>,
    options: Rc<RateLimitOptions>,
}

impl RateLimit {
    pub fn new(store: Arc<RateLimitStore>, options: RateLimitOptions) -> Self {
        Self { store, options: Rc::new(options) }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddleware {
            service: Rc::new(service),
            store: Arc::clone(&self.store),
            options: Rc::clone(&self.options),
        }))
    }
}

pub struct RateLimitMiddleware<S> {
    service: Rc<S>,
    store: Arc<RateLimitStore>,
    options: Rc<RateLimitOptions>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let store = Arc::clone(&self.store);
        let options = Rc::clone(&self.options);

        Box::pin(async move {
            let Some(key) = fail_open::guard("Rate limit key generator", || options.key_for(&req)) else {
                return service.call(req).await.map(ServiceResponse::map_into_left_body);
            };

            let entry = store.increment(&key, options.window).await;

            if entry.count > options.max_requests {
                log::warn!("Rate limit exceeded for {} on {}", key, req.path());
                let mut response = req.error_response(AppError::RateLimited);
                RateLimitHeaders::new(options.max_requests, &entry).apply(response.headers_mut());
                return Ok(response.map_into_right_body());
            }

            let mut res = service.call(req).await?;

            let entry = if options.skip_successful_requests && !res.status().is_client_error() && !res.status().is_server_error() {
                store.decrement(&key, entry.reset_time).await.unwrap_or(entry)
            } else {
                entry
            };

            // A nested, more specific limiter has already reported its state.
            if !res.headers().contains_key("x-ratelimit-limit") {
                RateLimitHeaders::new(options.max_requests, &entry).apply(res.headers_mut());
            }
            Ok(res.map_into_left_body())
        })
    }
}
