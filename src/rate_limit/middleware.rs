use crate::error::LimiterError;
use crate::rate_limit::{RateLimitDecision, RateLimiter, RequestIdentity};
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Rejection produced by [`RateLimitService`].
///
/// A denial and an unavailable limiter are kept apart so the HTTP adapter can answer
/// "slow down" (429) and "backend degraded" (503) distinguishably.
#[derive(Debug)]
pub enum RateLimitError<E> {
    /// The request exceeded its limit.
    RateLimited(RateLimitDecision),
    /// No decision could be made because bucket storage is unavailable.
    Degraded(LimiterError),
    /// The wrapped service failed.
    Inner(E),
}

impl<E> RateLimitError<E> {
    /// HTTP status the rejection maps to; `None` for inner service errors.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::RateLimited(_) => Some(429),
            Self::Degraded(_) => Some(503),
            Self::Inner(_) => None,
        }
    }

    /// Response headers for the rejection: rate limit headers plus `Retry-After` on 429, and
    /// `Retry-After` on 503 when the breaker knows when it will probe again.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::RateLimited(decision) => decision.headers(),
            Self::Degraded(err) => err
                .breaker_error()
                .retry_in()
                .map(|d| vec![("Retry-After", d.as_secs().max(1).to_string())])
                .unwrap_or_default(),
            Self::Inner(_) => Vec::new(),
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded(_))
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RateLimitError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited(d) => write!(
                f,
                "rate limited by `{}` ({} scope); retry after {}s",
                d.rule,
                d.scope,
                d.retry_after_secs(d.decided_at)
            ),
            Self::Degraded(e) => write!(f, "backend degraded: {}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RateLimitError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::Degraded(e) => Some(e),
            Self::RateLimited(_) => None,
        }
    }
}

/// A layer that checks every request against a [`RateLimiter`].
///
/// `identify` extracts the path, client IP, and optional user id from a request.
#[derive(Clone)]
pub struct RateLimitLayer<F> {
    limiter: Arc<RateLimiter>,
    identify: F,
}

impl<F> RateLimitLayer<F> {
    pub fn new(limiter: Arc<RateLimiter>, identify: F) -> Self {
        Self { limiter, identify }
    }
}

impl<F> fmt::Debug for RateLimitLayer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitLayer").field("limiter", &self.limiter).finish_non_exhaustive()
    }
}

impl<S, F: Clone> Layer<S> for RateLimitLayer<F> {
    type Service = RateLimitService<S, F>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            identify: self.identify.clone(),
        }
    }
}

/// Middleware service that enforces rate limits.
#[derive(Clone)]
pub struct RateLimitService<S, F> {
    inner: S,
    limiter: Arc<RateLimiter>,
    identify: F,
}

impl<S: fmt::Debug, F> fmt::Debug for RateLimitService<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitService")
            .field("inner", &self.inner)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl<S, F, Req> Service<Req> for RateLimitService<S, F>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    F: Fn(&Req) -> RequestIdentity,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = RateLimitError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(RateLimitError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let identity = (self.identify)(&req);
        let limiter = self.limiter.clone();
        // The clone may not be ready; hand the driven service to the future.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let decision = limiter
                .check(&identity.path, &identity.client_ip, identity.user_id.as_deref())
                .await
                .map_err(RateLimitError::Degraded)?;
            if decision.allowed {
                inner.call(req).await.map_err(RateLimitError::Inner)
            } else {
                Err(RateLimitError::RateLimited(decision))
            }
        })
    }
}
