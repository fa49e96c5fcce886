//! Server endpoint that proxies the server information request to the backend.
//!
//! Agents query the backend version on startup. This endpoint issues the same request to the
//! backend with the extension's own credentials, and passes status, headers and body back.

use apm_lambda_log::LogError;
use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::constants::{MAX_RESPONSE_SIZE, USER_AGENT};
use crate::http::{HttpError, Response as UpstreamResponse};
use crate::service::ServiceState;

/// Headers that this endpoint must handle and cannot forward.
static HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Headers ignored in addition to the headers defined in `HOP_BY_HOP_HEADERS`.
static IGNORED_REQUEST_HEADERS: &[HeaderName] = &[
    header::HOST,
    header::CONTENT_LENGTH,
    header::USER_AGENT,
    header::AUTHORIZATION,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

fn is_forwarded(name: &HeaderName) -> bool {
    !HOP_BY_HOP_HEADERS.contains(name)
        && !IGNORED_REQUEST_HEADERS.contains(name)
        && name != X_FORWARDED_FOR
}

async fn forward(state: &ServiceState, headers: HeaderMap) -> Result<Response, HttpError> {
    let mut request = state
        .client()
        .request(Method::GET, state.backend().as_url().clone())
        .header(header::USER_AGENT, USER_AGENT);

    for (name, value) in &headers {
        if is_forwarded(name) {
            request = request.header(name, value);
        }
    }

    if let Some(host) = headers.get(header::HOST) {
        request = request.header(X_FORWARDED_HOST, host);
    }

    if let Some(authorization) = state.config().authorization() {
        request = request.header(header::AUTHORIZATION, authorization);
    }

    let upstream = UpstreamResponse(request.send().await?);
    let status = upstream.status();

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream.0.headers() {
        if !HOP_BY_HOP_HEADERS.contains(name) && name != header::CONTENT_LENGTH {
            response_headers.append(name.clone(), value.clone());
        }
    }

    let body = upstream.bytes(MAX_RESPONSE_SIZE).await?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}

/// Passes the server information request through to the backend.
pub async fn handle(state: ServiceState, headers: HeaderMap) -> Response {
    match forward(&state, headers).await {
        Ok(response) => response,
        Err(error) => {
            apm_lambda_log::warn!("failed to forward info request: {}", LogError(&error));
            (
                StatusCode::BAD_GATEWAY,
                [(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
                "failed to reach the backend",
            )
                .into_response()
        }
    }
}
