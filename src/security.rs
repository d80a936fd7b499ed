use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    collections::hash_map::DefaultHasher,
    convert::Infallible,
    env,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Instant,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AuthState {
    limiter: Arc<TokenBuckets>,
}

/// The caller's backend access token, forwarded verbatim on every backend
/// call. `caller` is a stable digest used for session ownership and rate
/// limiting so the raw token never lands in logs or map keys.
#[derive(Clone)]
pub struct CallerContext {
    pub access_token: Arc<str>,
    pub caller: u64,
}

impl std::fmt::Debug for CallerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerContext")
            .field("caller", &format_args!("{:016x}", self.caller))
            .finish_non_exhaustive()
    }
}

impl CallerContext {
    pub fn new(access_token: &str) -> Self {
        Self {
            access_token: Arc::from(access_token),
            caller: caller_digest(access_token),
        }
    }
}

pub fn caller_digest(token: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    hasher.finish()
}

impl AuthState {
    pub fn from_env() -> Self {
        Self {
            limiter: Arc::new(TokenBuckets::from_env()),
        }
    }

    pub fn with_limits(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            limiter: Arc::new(TokenBuckets::new(rate_per_sec, capacity)),
        }
    }

    async fn consume(&self, caller: u64) -> Result<RatePermit, RateExceeded> {
        self.limiter.consume(caller).await
    }
}

pub async fn require_bearer(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(token) = extract_bearer(request.headers()) else {
        return Ok(unauthorized_response(
            "missing_token",
            "Provide an Authorization: Bearer <access token> header",
        ));
    };

    let context = CallerContext::new(&token);
    match state.consume(context.caller).await {
        Ok(permit) => {
            debug!(target: "rehoming.api", caller = ?context, "caller_authenticated");
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(exceeded) => {
            warn!(target: "rehoming.api", caller = ?context, "rate_limited");
            let mut response = too_many_requests("rate_limited", "Too many requests");
            exceeded.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_bearer(headers: &http::HeaderMap) -> Option<String> {
    let raw = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = raw[6..].trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
        fields: None,
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn too_many_requests(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
        fields: None,
    };
    (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response()
}

#[derive(Clone)]
struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    prune_above: usize,
    buckets: Arc<Mutex<HashMap<u64, BucketState>>>,
}

impl TokenBuckets {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            prune_above: 4096,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(20.0);
        Self::new(rate_per_sec, capacity)
    }

    async fn consume(&self, key: u64) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        if guard.len() >= self.prune_above {
            // A bucket that has refilled is indistinguishable from a new one.
            let (rate, capacity) = (self.rate_per_sec, self.capacity);
            guard.retain(|_, bucket| {
                let idle = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens + idle * rate < capacity
            });
        }
        let state = guard.entry(key).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug, Clone)]
struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

fn header_number(value: u64, fallback: &'static str) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static(fallback))
}

impl RatePermit {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert("X-RateLimit-Limit", header_number(self.capacity as u64, "0"));
        headers.insert("X-RateLimit-Remaining", header_number(remaining, "0"));
        headers.insert("X-RateLimit-Reset", header_number(reset, "0"));
    }
}

#[derive(Debug, Clone)]
struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let retry = self.retry_after.ceil().max(0.0) as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert(http::header::RETRY_AFTER, header_number(retry, "1"));
        headers.insert("X-RateLimit-Limit", header_number(self.capacity as u64, "0"));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        headers.insert("X-RateLimit-Reset", header_number(reset, "0"));
    }
}
