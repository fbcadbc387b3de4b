//! Request rate limiting.
//!
//! In-memory sliding window keyed by client IP, one limiter per request
//! class. Read and write routes share a router and are split by method;
//! secret routes and login have their own, stricter classes.
//!
//! The client IP is the peer address unless `trust_proxy` is set, in which
//! case `X-Forwarded-For` and `X-Real-IP` take precedence.
//!
//! Every limited response carries `X-RateLimit-Limit`,
//! `X-RateLimit-Remaining` and `X-RateLimit-Reset`. Rejections are `429`
//! with `Retry-After`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

/// Request classes with separate budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitClass {
    /// Safe methods.
    Read,
    /// Mutating methods.
    Write,
    /// Secret reads and writes.
    Secrets,
    /// Login.
    Auth,
}

impl RateLimitClass {
    fn as_str(&self) -> &'static str {
        match self {
            RateLimitClass::Read => "read",
            RateLimitClass::Write => "write",
            RateLimitClass::Secrets => "secrets",
            RateLimitClass::Auth => "auth",
        }
    }
}

/// How a router picks the class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// `GET`/`HEAD`/`OPTIONS` are reads, everything else writes.
    ByMethod,
    /// Always this class.
    Fixed(RateLimitClass),
}

impl RateLimitPolicy {
    fn class_for(&self, method: &Method) -> RateLimitClass {
        match self {
            RateLimitPolicy::Fixed(class) => *class,
            RateLimitPolicy::ByMethod => {
                if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
                    RateLimitClass::Read
                } else {
                    RateLimitClass::Write
                }
            },
        }
    }
}

/// Budget of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window.
    pub max_requests: usize,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateLimitConfig {
    fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Budgets of every class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Read requests.
    pub read: RateLimitConfig,
    /// Write requests.
    pub write: RateLimitConfig,
    /// Secret operations.
    pub secrets: RateLimitConfig,
    /// Login attempts.
    pub auth: RateLimitConfig,
    /// Read the client IP from forwarding headers. Only safe behind a
    /// reverse proxy that overwrites them.
    pub trust_proxy: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let per_minute = |max_requests| RateLimitConfig {
            max_requests,
            window_secs: 60,
        };
        Self {
            read: per_minute(600),
            write: per_minute(200),
            secrets: per_minute(100),
            auth: per_minute(60),
            trust_proxy: false,
        }
    }
}

#[derive(Debug)]
struct Window {
    hits: Vec<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        self.hits.retain(|&t| now.duration_since(t) < window);
    }

    fn reset_in(&self, now: Instant, window: Duration) -> Duration {
        self.hits
            .first()
            .map(|&first| window.saturating_sub(now.duration_since(first)))
            .unwrap_or(window)
    }
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Budget of the window.
    pub limit: usize,
    /// Requests left in the window after this one.
    pub remaining: usize,
    /// Time until the oldest counted request leaves the window.
    pub reset_in: Duration,
}

/// Sliding-window limiter for one class.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Creates a limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts a request from `key` and decides whether it is allowed.
    /// Rejected requests are not counted.
    pub fn check(&self, key: &str) -> Decision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Decision {
        let window = self.config.window();
        let mut windows = self.windows.lock();
        let entry = windows
            .entry(key.to_string())
            .or_insert_with(|| Window { hits: Vec::new() });
        entry.prune(now, window);

        let allowed = entry.hits.len() < self.config.max_requests;
        if allowed {
            entry.hits.push(now);
        }
        Decision {
            allowed,
            limit: self.config.max_requests,
            remaining: self.config.max_requests.saturating_sub(entry.hits.len()),
            reset_in: entry.reset_in(now, window),
        }
    }

    /// Drops keys with no request in the current window.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    fn cleanup_at(&self, now: Instant) -> usize {
        let window = self.config.window();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.prune(now, window);
            !w.hits.is_empty()
        });
        before - windows.len()
    }
}

/// One limiter per class.
#[derive(Debug)]
pub struct RateLimiters {
    limiters: HashMap<RateLimitClass, RateLimiter>,
    trust_proxy: bool,
}

impl RateLimiters {
    /// Creates the limiters from settings.
    pub fn new(settings: RateLimitSettings) -> Self {
        let limiters = [
            (RateLimitClass::Read, settings.read),
            (RateLimitClass::Write, settings.write),
            (RateLimitClass::Secrets, settings.secrets),
            (RateLimitClass::Auth, settings.auth),
        ]
        .into_iter()
        .map(|(class, config)| (class, RateLimiter::new(config)))
        .collect();
        Self {
            limiters,
            trust_proxy: settings.trust_proxy,
        }
    }

    /// Whether forwarding headers identify the client.
    pub fn trust_proxy(&self) -> bool {
        self.trust_proxy
    }

    /// Checks a request of `class` from `key`.
    pub fn check(&self, class: RateLimitClass, key: &str) -> Option<Decision> {
        self.limiters.get(&class).map(|l| l.check(key))
    }

    /// Drops idle keys from every limiter.
    pub fn cleanup(&self) -> usize {
        self.limiters.values().map(RateLimiter::cleanup).sum()
    }
}

/// State of the rate-limit middleware on one router.
#[derive(Clone)]
pub struct RateLimitGate {
    pub(crate) limiters: Arc<RateLimiters>,
    pub(crate) policy: RateLimitPolicy,
}

/// Client IP of a request.
///
/// With `trust_proxy`, `X-Forwarded-For` then `X-Real-IP` are used before
/// the peer address; otherwise only the peer address counts.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_proxy: bool,
) -> Option<String> {
    let peer = peer.map(|addr| addr.ip().to_string());
    if !trust_proxy {
        return peer;
    }

    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded.or(real_ip).map(str::to_string).or(peer)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn add_headers(headers: &mut HeaderMap, decision: &Decision) {
    let reset = unix_now() + decision.reset_in.as_secs();
    for (name, value) in [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", reset.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

fn too_many_requests(decision: &Decision) -> Response {
    let retry_after = decision.reset_in.as_secs().max(1);
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "RateLimitExceeded",
            "message": format!("Rate limit exceeded. Please try again in {} seconds", retry_after),
        })),
    )
        .into_response();

    add_headers(response.headers_mut(), decision);
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

/// Middleware applying the gate's policy to each request.
pub async fn rate_limit(
    State(gate): State<RateLimitGate>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let class = gate.policy.class_for(request.method());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let Some(ip) = client_ip(request.headers(), peer, gate.limiters.trust_proxy()) else {
        warn!("Cannot determine client IP for rate limiting, allowing request");
        return next.run(request).await;
    };

    let Some(decision) = gate.limiters.check(class, &ip) else {
        return next.run(request).await;
    };
    if !decision.allowed {
        debug!(class = class.as_str(), ip = %ip, "Rate limit exceeded");
        return too_many_requests(&decision);
    }

    let mut response = next.run(request).await;
    add_headers(response.headers_mut(), &decision);
    response
}
