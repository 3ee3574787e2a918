//! Rate limiting middleware.

use actix_web::{
    Error,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use std::fmt;
use std::future::{Future, Ready, ready};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use tollgate_core::domain::FailureMode;
use tollgate_core::ports::RateLimiter;

use super::error::AppError;
use super::identity::CallerId;

/// How the limiter key is derived from a request.
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// `ip:<client address>`.
    #[default]
    PeerAddr,
    /// `user:<id>` for identified callers, `ip:<client address>` otherwise.
    UserOrPeerAddr,
    /// Caller-supplied key function.
    Custom(Arc<dyn Fn(&ServiceRequest) -> String + Send + Sync>),
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::PeerAddr => write!(f, "PeerAddr"),
            KeyStrategy::UserOrPeerAddr => write!(f, "UserOrPeerAddr"),
            KeyStrategy::Custom(_) => write!(f, "Custom"),
        }
    }
}

impl KeyStrategy {
    pub fn key_for(&self, req: &ServiceRequest) -> String {
        match self {
            KeyStrategy::PeerAddr => peer_key(req),
            KeyStrategy::UserOrPeerAddr => match CallerId::from_request(req) {
                Some(caller) => format!("user:{}", caller.as_str()),
                None => peer_key(req),
            },
            KeyStrategy::Custom(derive) => derive(req),
        }
    }
}

fn peer_key(req: &ServiceRequest) -> String {
    format!(
        "ip:{}",
        req.connection_info().realip_remote_addr().unwrap_or("unknown")
    )
}

/// Admission options.
#[derive(Debug, Clone)]
pub struct RateLimitOptions {
    pub key_strategy: KeyStrategy,
    /// Fixed `Retry-After` value; computed from the bucket when unset.
    pub retry_after_override: Option<u64>,
    /// What to do when the limiter itself fails.
    pub on_error: FailureMode,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            key_strategy: KeyStrategy::default(),
            retry_after_override: None,
            on_error: FailureMode::FailOpen,
        }
    }
}

impl RateLimitOptions {
    pub fn from_env() -> Self {
        Self {
            key_strategy: match std::env::var("RATE_LIMIT_KEY_STRATEGY").as_deref() {
                Ok("user") => KeyStrategy::UserOrPeerAddr,
                _ => KeyStrategy::PeerAddr,
            },
            retry_after_override: std::env::var("RATE_LIMIT_RETRY_AFTER_SECS")
                .ok()
                .and_then(|s| s.parse().ok()),
            on_error: FailureMode::from_fail_closed(
                std::env::var("RATE_LIMIT_FAIL_CLOSED")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(false),
            ),
        }
    }
}

/// Rate limiting middleware factory.
pub struct RateLimitMiddleware {
    limiter: Arc<dyn RateLimiter>,
    options: Rc<RateLimitOptions>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self::with_options(limiter, RateLimitOptions::default())
    }

    pub fn with_options(limiter: Arc<dyn RateLimiter>, options: RateLimitOptions) -> Self {
        Self {
            limiter,
            options: Rc::new(options),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            options: self.options.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
    limiter: Arc<dyn RateLimiter>,
    options: Rc<RateLimitOptions>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let limiter = self.limiter.clone();
        let options = self.options.clone();

        Box::pin(async move {
            let key = options.key_strategy.key_for(&req);

            match limiter.allow(&key).await {
                Ok(true) => {}
                Ok(false) => {
                    let retry_after = match options.retry_after_override {
                        Some(secs) => secs,
                        None => limiter.retry_after(&key).await,
                    };
                    tracing::warn!(key = %key, retry_after, "Rate limit exceeded");
                    return Ok(reject(req, AppError::RateLimited { retry_after }));
                }
                Err(e) => match options.on_error {
                    FailureMode::FailOpen => {
                        tracing::error!(key = %key, error = %e, "Rate limiter error, failing open");
                    }
                    FailureMode::FailClosed => {
                        tracing::error!(key = %key, error = %e, "Rate limiter error, rejecting request");
                        return Ok(reject(req, AppError::RateLimitUnavailable));
                    }
                },
            }

            let res = service.call(req).await?;
            Ok(res.map_into_left_body())
        })
    }
}

fn reject<B>(req: ServiceRequest, error: AppError) -> ServiceResponse<EitherBody<B>> {
    let (http_req, _payload) = req.into_parts();
    let response = error.response_for(&http_req);
    ServiceResponse::new(http_req, response).map_into_right_body()
}
