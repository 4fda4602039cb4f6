//! Fallback handler: everything not matched by an admin route lands here and
//! is resolved to an upstream service, then proxied.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::Request,
    response::{IntoResponse, Response},
};

use crate::{error::GatewayError, state::AppState};

/// Cap on buffered request bodies — the gateway has no streaming path, so an
/// unbounded body would be an easy way to exhaust memory.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Attached to the response so the wrapping pipeline middleware can label its
/// metric with the upstream service name without re-resolving the route.
#[derive(Clone, Default)]
pub struct ProxiedService(pub String);

/// Attached to the response on any error path so the pipeline middleware can
/// record `RequestMetric::error` without re-deriving it from the status code.
#[derive(Clone)]
pub struct ProxyError(pub String);

pub async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let path = request.uri().path().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let service_name = match state.router.resolve_service(&path) {
        Some(name) => name.to_string(),
        None => {
            let err = GatewayError::NoRouteFound(path);
            let message = err.to_string();
            let mut response = err.into_response();
            response.extensions_mut().insert(ProxyError(message));
            return response;
        }
    };

    let method = request.method().clone();
    let headers = request.headers().clone();
    let body = match to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let err = GatewayError::Other(e.into());
            let message = err.to_string();
            let mut response = err.into_response();
            response.extensions_mut().insert(ProxyError(message));
            return response;
        }
    };

    let result = state.router.proxy(&service_name, method, &path_and_query, &headers, body).await;

    let mut response = match result {
        Ok(proxied) => {
            let mut builder = Response::builder().status(proxied.status);
            *builder.headers_mut().unwrap() = proxied.headers;
            builder.body(Body::from(proxied.body)).unwrap()
        }
        Err(e) => {
            let message = e.to_string();
            let mut response = e.into_response();
            response.extensions_mut().insert(ProxyError(message));
            response
        }
    };
    response.extensions_mut().insert(ProxiedService(service_name));
    response
}
