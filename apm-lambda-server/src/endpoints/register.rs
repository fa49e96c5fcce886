use apm_lambda_config::Config;
use apm_lambda_log::LogError;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{MethodRouter, post};
use bytes::Bytes;

use crate::accumulator::decode;
use crate::constants::{REQUEST_ID_HEADER, TRANSACTION_CONTENT_TYPE};
use crate::endpoints::intake::content_encoding;
use crate::service::ServiceState;

fn is_transaction_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(TRANSACTION_CONTENT_TYPE))
}

/// Registers the transaction the agent started for the current invocation.
async fn handle(state: ServiceState, headers: HeaderMap, body: Bytes) -> StatusCode {
    if !is_transaction_content_type(&headers) {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE;
    }

    let Some(request_id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    else {
        return StatusCode::BAD_REQUEST;
    };

    let payload = match decode(&body, content_encoding(&headers)) {
        Ok(payload) => payload,
        Err(error) => {
            apm_lambda_log::warn!("failed to decode transaction registration: {}", LogError(&error));
            return StatusCode::UNPROCESSABLE_ENTITY;
        }
    };

    match state
        .batch()
        .record_transaction_intent(request_id, &payload)
    {
        Ok(transaction_id) => {
            apm_lambda_log::debug!(request_id, transaction_id, "registered transaction");
            StatusCode::OK
        }
        Err(error) => {
            apm_lambda_log::warn!(request_id, "failed to register transaction: {}", LogError(&error));
            StatusCode::UNPROCESSABLE_ENTITY
        }
    }
}

pub fn route(config: &Config) -> MethodRouter<ServiceState> {
    post(handle).route_layer(DefaultBodyLimit::max(config.max_body_size()))
}
