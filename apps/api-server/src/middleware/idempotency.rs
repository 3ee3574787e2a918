//! Idempotency middleware - replays stored responses for repeated keys.
//!
//! Only `POST`, `PUT`, `PATCH` and `DELETE` requests carrying an
//! `Idempotency-Key` header are coordinated. The request body is buffered,
//! fingerprinted and put back so the downstream handler still sees it.
//!
//! Buffering happens before routing, so keyed bodies are bound by the
//! app-level `PayloadConfig` (256 KiB unless one is registered on the `App`);
//! per-route payload limits do not apply to them.

use actix_web::{
    Error, HttpMessage, HttpRequest, HttpResponse, ResponseError,
    body::{BoxBody, EitherBody, MessageBody, to_bytes},
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    error::InternalError,
    http::{Method, StatusCode},
    web,
};
use std::cell::Cell;
use std::future::{Future, Ready, ready};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use tollgate_core::domain::{CapturedResponse, RequestFingerprint};
use tollgate_core::services::{IdempotencyCoordinator, Outcome};

use super::error::AppError;
use crate::observability::RequestId;

/// Header carrying the client-chosen key.
pub static IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Header telling the client whether the response was stored or replayed.
pub static IDEMPOTENCY_STATUS_HEADER: &str = "X-Idempotency-Status";

/// Idempotency middleware factory.
pub struct IdempotencyMiddleware {
    coordinator: Arc<IdempotencyCoordinator>,
}

impl IdempotencyMiddleware {
    pub fn new(coordinator: Arc<IdempotencyCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl<S, B> Transform<S, ServiceRequest> for IdempotencyMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = IdempotencyMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(IdempotencyMiddlewareService {
            service: Rc::new(service),
            coordinator: self.coordinator.clone(),
        }))
    }
}

pub struct IdempotencyMiddlewareService<S> {
    service: Rc<S>,
    coordinator: Arc<IdempotencyCoordinator>,
}

fn is_unsafe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

impl<S, B> Service<ServiceRequest> for IdempotencyMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let key = req
            .headers()
            .get(IDEMPOTENCY_KEY_HEADER)
            .map(|value| value.to_str().map(String::from));

        let key = match key {
            Some(key) if is_unsafe_method(req.method()) => key,
            _ => {
                let fut = self.service.call(req);
                return Box::pin(async move {
                    let res = fut.await?;
                    Ok(res.map_into_left_body())
                });
            }
        };

        let service = self.service.clone();
        let coordinator = self.coordinator.clone();

        Box::pin(async move {
            let mut req = req;
            let Ok(key) = key else {
                let error = AppError::InvalidIdempotencyKey(
                    "key must contain only visible ASCII characters".to_string(),
                );
                return Ok(reject(req, error));
            };

            let body = match req.extract::<web::Bytes>().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not read request body");
                    return Ok(reject(req, AppError::BadRequest(e.to_string())));
                }
            };
            req.set_payload(Payload::from(body.clone()));

            let path_and_query = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| req.path().to_string());
            let fingerprint =
                RequestFingerprint::compute(req.method().as_str(), &path_and_query, &body);

            let request_id = req.extensions().get::<RequestId>().cloned();

            // The router needs sole ownership of the request, so no clone may
            // be held while the handler runs. The request comes back through
            // `served` once the downstream response exists.
            let unserved = Cell::new(Some(req));
            let served: Cell<Option<HttpRequest>> = Cell::new(None);
            let (unserved_ref, served_ref) = (&unserved, &served);
            let outcome = coordinator
                .execute(&key, &fingerprint, move || async move {
                    match unserved_ref.take() {
                        Some(req) => capture(service, req, served_ref).await,
                        None => snapshot_error(AppError::Internal(
                            "request already consumed".to_string(),
                        )),
                    }
                })
                .await;

            let response = match outcome {
                Ok(Outcome::Stored(captured)) => rebuild(&captured, Some("stored")),
                Ok(Outcome::Replayed(captured)) => rebuild(&captured, Some("replayed")),
                Ok(Outcome::Unprotected(captured)) => rebuild(&captured, None),
                Err(err) => AppError::from(err)
                    .to_response(request_id.as_ref().map(RequestId::as_str)),
            };

            let http_req = served
                .take()
                .or_else(|| unserved.take().map(|req| req.into_parts().0));
            match http_req {
                Some(http_req) => {
                    Ok(ServiceResponse::new(http_req, response).map_into_right_body())
                }
                // The downstream service errored and kept the request.
                None => Err(
                    InternalError::from_response("idempotent request failed downstream", response)
                        .into(),
                ),
            }
        })
    }
}

fn reject<B>(req: ServiceRequest, error: AppError) -> ServiceResponse<EitherBody<B>> {
    let (http_req, _payload) = req.into_parts();
    let response = error.response_for(&http_req);
    ServiceResponse::new(http_req, response).map_into_right_body()
}

/// Run the downstream service and snapshot its response, handing the
/// request back through `served`.
async fn capture<S, B>(
    service: Rc<S>,
    req: ServiceRequest,
    served: &Cell<Option<HttpRequest>>,
) -> CapturedResponse
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    B: MessageBody,
{
    match service.call(req).await {
        Ok(res) => {
            let (http_req, response) = res.into_parts();
            served.set(Some(http_req));
            snapshot(response).await
        }
        Err(e) => snapshot(e.error_response()).await,
    }
}

async fn snapshot<B: MessageBody>(response: HttpResponse<B>) -> CapturedResponse {
    let mut captured = CapturedResponse::new(response.status().as_u16());
    for (name, value) in response.headers() {
        match value.to_str() {
            Ok(value) => captured = captured.with_header(name.as_str(), value),
            Err(_) => tracing::debug!(header = %name, "Skipping non-text response header"),
        }
    }

    match to_bytes(response.into_body()).await {
        Ok(body) => captured.with_body(body.to_vec()),
        Err(e) => {
            let e: Box<dyn std::error::Error> = e.into();
            snapshot_error(AppError::Internal(format!("Failed to read response body: {e}")))
        }
    }
}

fn snapshot_error(error: AppError) -> CapturedResponse {
    let body = serde_json::to_vec(&error.to_body(None)).unwrap_or_default();
    CapturedResponse::new(error.status_code().as_u16())
        .with_header("content-type", "application/json")
        .with_body(body)
}

fn rebuild(captured: &CapturedResponse, marker: Option<&str>) -> HttpResponse<BoxBody> {
    let status = StatusCode::from_u16(captured.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    for (name, value) in &captured.headers {
        builder.append_header((name.as_str(), value.as_str()));
    }
    if let Some(marker) = marker {
        builder.insert_header((IDEMPOTENCY_STATUS_HEADER, marker));
    }
    builder.body(captured.body.clone())
}
