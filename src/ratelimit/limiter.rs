//! Core rate limiter implementation.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::{HeaderMap, Request, Response, StatusCode};
use parking_lot::RwLock;
use tracing::{debug, error, trace};

use super::backend::WindowCounterStore;
use super::counter::LocalWindowCounter;
use super::headers::{set_header, HeaderNames, ResponseHeaders};
use super::key::KeyDeriver;
use super::window::Window;
use crate::error::{Result, SlidegateError};
use crate::proxy::{text_response, Handler, ReqBody, RespBody};

/// Counter increment charged for every admitted request.
const REQUEST_COST: u64 = 1;

/// Produces the response for a request over its limit.
pub type RateLimitedHandler = Arc<dyn Fn(&Request<ReqBody>) -> Response<RespBody> + Send + Sync>;

/// Produces the response for a request whose limit could not be checked.
pub type ErrorHandler =
    Arc<dyn Fn(&Request<ReqBody>, &SlidegateError) -> Response<RespBody> + Send + Sync>;

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request admitted and counted.
    Allowed {
        /// Maximum requests per window
        limit: u64,
        /// Requests left after this one
        remaining: u64,
        /// Time until the current window ends
        reset_after: Duration,
    },
    /// Request rejected; nothing was counted.
    Limited {
        /// Maximum requests per window
        limit: u64,
        /// Requests left, normally zero
        remaining: u64,
        /// Time until the current window ends
        reset_after: Duration,
    },
}

impl Decision {
    /// Returns true if the request is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Get the limit value.
    pub fn limit(&self) -> u64 {
        match self {
            Decision::Allowed { limit, .. } | Decision::Limited { limit, .. } => *limit,
        }
    }

    /// Get the remaining count.
    pub fn remaining(&self) -> u64 {
        match self {
            Decision::Allowed { remaining, .. } | Decision::Limited { remaining, .. } => *remaining,
        }
    }

    /// Get the time until the current window ends.
    pub fn reset_after(&self) -> Duration {
        match self {
            Decision::Allowed { reset_after, .. } | Decision::Limited { reset_after, .. } => {
                *reset_after
            }
        }
    }
}

/// Approximate the number of requests in the sliding window ending now.
///
/// The previous window's count is weighted by the part of it that still
/// overlaps a window-length span ending now, so it fades out linearly as the
/// current window fills up. The result is rounded to the nearest integer.
pub fn estimate_count(current: u64, previous: u64, elapsed: Duration, window_length: Duration) -> u64 {
    let length = window_length.as_secs_f64();
    if length <= 0.0 {
        return current;
    }
    let elapsed_fraction = (elapsed.as_secs_f64() / length).clamp(0.0, 1.0);
    let estimate = previous as f64 * (1.0 - elapsed_fraction) + current as f64;
    estimate.round() as u64
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    request_limit: u64,
    window_length: Duration,
}

/// A sliding-window rate limiter over a `WindowCounterStore`.
///
/// Shared by every request passing through its middleware.
pub struct RateLimiter {
    limits: RwLock<Limits>,
    key_deriver: KeyDeriver,
    headers: HeaderNames,
    on_rate_limited: RateLimitedHandler,
    on_error: ErrorHandler,
    counter: Arc<dyn WindowCounterStore>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let limits = *self.limits.read();
        f.debug_struct("RateLimiter")
            .field("request_limit", &limits.request_limit)
            .field("window_length", &limits.window_length)
            .field("key_deriver", &self.key_deriver)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Start building a limiter allowing `request_limit` requests per `window_length`.
    pub fn builder(request_limit: u64, window_length: Duration) -> RateLimiterBuilder {
        RateLimiterBuilder::new(request_limit, window_length)
    }

    /// A limiter shared by all clients.
    pub fn limit_all(request_limit: u64, window_length: Duration) -> Result<Self> {
        Self::builder(request_limit, window_length).build()
    }

    /// A limiter keyed by connection peer address.
    pub fn limit_by_ip(request_limit: u64, window_length: Duration) -> Result<Self> {
        Self::builder(request_limit, window_length)
            .key_by(vec![KeyDeriver::by_ip()])
            .build()
    }

    /// A limiter keyed by the client address declared by upstream proxies.
    pub fn limit_by_real_ip(request_limit: u64, window_length: Duration) -> Result<Self> {
        Self::builder(request_limit, window_length)
            .key_by(vec![KeyDeriver::by_real_ip()])
            .build()
    }

    /// Configured maximum requests per window.
    pub fn request_limit(&self) -> u64 {
        self.limits.read().request_limit
    }

    /// Configured window length.
    pub fn window_length(&self) -> Duration {
        self.limits.read().window_length
    }

    /// Change the limit and window length, re-tuning the counter store.
    pub fn reconfigure(&self, request_limit: u64, window_length: Duration) -> Result<()> {
        validate_window(window_length)?;
        let mut limits = self.limits.write();
        *limits = Limits {
            request_limit,
            window_length,
        };
        self.counter.configure(request_limit, window_length);
        debug!(limit = request_limit, window = ?window_length, "Rate limiter reconfigured");
        Ok(())
    }

    /// Derive the rate limit key for a request.
    pub fn derive_key<B>(&self, req: &Request<B>) -> Result<String> {
        self.key_deriver.derive(req)
    }

    /// Check `key` at instant `now`, counting the request if it is admitted.
    pub async fn check(&self, key: &str, now: SystemTime) -> Result<Decision> {
        let Limits {
            request_limit,
            window_length,
        } = *self.limits.read();

        let current_window = Window::containing(now, window_length);
        let previous_window = current_window.previous(window_length);

        let elapsed = current_window.elapsed(now);
        let reset_after = current_window.remaining(window_length, now);

        let admit = move |current: u64, previous: u64| {
            estimate_count(current, previous, elapsed, window_length).saturating_add(REQUEST_COST)
                <= request_limit
        };
        let ((current, previous), admitted) = self
            .counter
            .get_and_increment_if(key, current_window, previous_window, REQUEST_COST, &admit)
            .await?;
        let estimate = estimate_count(current, previous, elapsed, window_length);

        trace!(
            key = %key,
            current = current,
            previous = previous,
            estimate = estimate,
            "Checked rate limit"
        );

        if !admitted {
            debug!(
                key = %key,
                estimate = estimate,
                limit = request_limit,
                "Rate limit exceeded"
            );
            return Ok(Decision::Limited {
                limit: request_limit,
                remaining: request_limit.saturating_sub(estimate),
                reset_after,
            });
        }

        Ok(Decision::Allowed {
            limit: request_limit,
            remaining: request_limit.saturating_sub(estimate.saturating_add(REQUEST_COST)),
            reset_after,
        })
    }

    /// Wrap `next` so that it only sees admitted requests.
    pub fn layer(self: Arc<Self>, next: Arc<dyn Handler>) -> RateLimited {
        RateLimited {
            limiter: self,
            next,
        }
    }

    fn write_headers(&self, headers: &mut HeaderMap, decision: &Decision) {
        let reset_secs = decision.reset_after().as_secs();
        set_header(headers, &self.headers.limit, decision.limit());
        set_header(headers, &self.headers.remaining, decision.remaining());
        set_header(headers, &self.headers.increment, REQUEST_COST);
        set_header(headers, &self.headers.reset, reset_secs);
        if !decision.is_allowed() {
            set_header(headers, &self.headers.retry_after, reset_secs);
        }
    }
}

fn validate_window(window_length: Duration) -> Result<()> {
    if window_length.is_zero() {
        return Err(SlidegateError::Config(
            "window length must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn default_rate_limited(_req: &Request<ReqBody>) -> Response<RespBody> {
    text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
}

fn default_error(req: &Request<ReqBody>, err: &SlidegateError) -> Response<RespBody> {
    error!(
        error = %err,
        method = %req.method(),
        path = %req.uri().path(),
        "Rate limit check failed"
    );
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}

/// Builder for `RateLimiter`.
pub struct RateLimiterBuilder {
    request_limit: u64,
    window_length: Duration,
    key_derivers: Vec<KeyDeriver>,
    headers: ResponseHeaders,
    on_rate_limited: Option<RateLimitedHandler>,
    on_error: Option<ErrorHandler>,
    counter: Option<Arc<dyn WindowCounterStore>>,
}

impl RateLimiterBuilder {
    fn new(request_limit: u64, window_length: Duration) -> Self {
        Self {
            request_limit,
            window_length,
            key_derivers: Vec::new(),
            headers: ResponseHeaders::default(),
            on_rate_limited: None,
            on_error: None,
            counter: None,
        }
    }

    /// Key requests by the given derivers, composed in order.
    ///
    /// An empty list keeps the default global key.
    pub fn key_by(mut self, derivers: Vec<KeyDeriver>) -> Self {
        self.key_derivers = derivers;
        self
    }

    /// Override the rate limit header names.
    pub fn response_headers(mut self, headers: ResponseHeaders) -> Self {
        self.headers = headers;
        self
    }

    /// Set the handler producing rejection responses.
    pub fn on_rate_limited<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request<ReqBody>) -> Response<RespBody> + Send + Sync + 'static,
    {
        self.on_rate_limited = Some(Arc::new(handler));
        self
    }

    /// Set the handler for key derivation and counter store failures.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request<ReqBody>, &SlidegateError) -> Response<RespBody> + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Use `counter` instead of a fresh `LocalWindowCounter`.
    pub fn counter(mut self, counter: Arc<dyn WindowCounterStore>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Build the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        validate_window(self.window_length)?;
        let headers = self.headers.compile()?;

        let key_deriver = if self.key_derivers.is_empty() {
            KeyDeriver::default()
        } else {
            KeyDeriver::composed(self.key_derivers)
        };

        let counter = match self.counter {
            Some(counter) => {
                counter.configure(self.request_limit, self.window_length);
                counter
            }
            None => Arc::new(LocalWindowCounter::new(self.window_length)),
        };

        Ok(RateLimiter {
            limits: RwLock::new(Limits {
                request_limit: self.request_limit,
                window_length: self.window_length,
            }),
            key_deriver,
            headers,
            on_rate_limited: self
                .on_rate_limited
                .unwrap_or_else(|| Arc::new(default_rate_limited) as RateLimitedHandler),
            on_error: self
                .on_error
                .unwrap_or_else(|| Arc::new(default_error) as ErrorHandler),
            counter,
        })
    }
}

/// Middleware handler enforcing a `RateLimiter` in front of `next`.
pub struct RateLimited {
    limiter: Arc<RateLimiter>,
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for RateLimited {
    async fn handle(&self, req: Request<ReqBody>) -> Response<RespBody> {
        let limiter = &self.limiter;

        let key = match limiter.derive_key(&req) {
            Ok(key) => key,
            Err(err) => return (limiter.on_error)(&req, &err),
        };

        match limiter.check(&key, SystemTime::now()).await {
            Ok(decision) if decision.is_allowed() => {
                let mut resp = self.next.handle(req).await;
                limiter.write_headers(resp.headers_mut(), &decision);
                resp
            }
            Ok(decision) => {
                let mut resp = (limiter.on_rate_limited)(&req);
                limiter.write_headers(resp.headers_mut(), &decision);
                resp
            }
            Err(err) => (limiter.on_error)(&req, &err),
        }
    }
}
