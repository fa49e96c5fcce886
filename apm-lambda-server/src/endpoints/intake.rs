use apm_lambda_config::Config;
use axum::extract::{DefaultBodyLimit, Query};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{MethodRouter, post};
use bytes::Bytes;
use serde::Deserialize;

use crate::accumulator::{ContentEncoding, TelemetryUnit};
use crate::service::ServiceState;

#[derive(Debug, Default, Deserialize)]
struct IntakeQuery {
    #[serde(default)]
    flushed: Option<String>,
}

impl IntakeQuery {
    fn is_flushed(&self) -> bool {
        self.flushed.as_deref() == Some("true")
    }
}

/// Returns the content encoding of a request from its headers.
pub fn content_encoding(headers: &HeaderMap) -> ContentEncoding {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(ContentEncoding::parse)
        .unwrap_or_default()
}

async fn handle(
    state: ServiceState,
    Query(query): Query<IntakeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !body.is_empty() {
        let agent_info = headers
            .get(header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let unit = TelemetryUnit::agent(body, content_encoding(&headers), agent_info);
        state.transport().enqueue(unit);
    }

    if query.is_flushed() {
        apm_lambda_log::debug!("agent flushed its data");
        state.flush_latch().signal();
    }

    (StatusCode::ACCEPTED, "ok")
}

pub fn route(config: &Config) -> MethodRouter<ServiceState> {
    post(handle).route_layer(DefaultBodyLimit::max(config.max_body_size()))
}
