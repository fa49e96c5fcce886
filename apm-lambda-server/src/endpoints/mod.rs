//! Web server endpoints.
//!
//! The public listener serves the agent: the event intake, transaction registration, and a
//! passthrough of the backend's server information. The log listener receives events pushed by
//! the Lambda Logs API.

use apm_lambda_config::Config;
use axum::Router;
use axum::routing::get;

use crate::service::ServiceState;

mod forward;
mod intake;
mod logs;
mod register;

/// Routes of the listener the agent talks to.
pub fn public_routes(config: &Config) -> Router<ServiceState> {
    Router::new()
        .route("/", get(forward::handle))
        .route("/intake/v2/events", intake::route(config))
        .route("/register/transaction", register::route(config))
}

/// Routes of the listener the Logs API pushes to.
pub fn logs_routes(config: &Config) -> Router<ServiceState> {
    Router::new().route("/", logs::route(config))
}
