use apm_lambda_aws_extension::LogEvent;
use apm_lambda_config::Config;
use axum::Json;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{MethodRouter, post};

use crate::service::ServiceState;

/// Receives a batch of events from the Logs API.
async fn handle(state: ServiceState, Json(events): Json<Vec<LogEvent>>) -> StatusCode {
    apm_lambda_log::trace!("received {} log events", events.len());

    for event in events {
        if state.log_events().send(event).await.is_err() {
            apm_lambda_log::warn!("log correlation stopped, dropping log events");
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }

    StatusCode::OK
}

pub fn route(config: &Config) -> MethodRouter<ServiceState> {
    post(handle).route_layer(DefaultBodyLimit::max(config.max_body_size()))
}
