//! The APM Lambda extension server.
//!
//! The extension runs next to a Lambda function and forwards the telemetry of its APM agent to
//! the backend. Agent payloads arrive on a local intake, platform events arrive on the log
//! listener, and both are assembled into per-invocation batches.
//!
//! # Architecture
//!
//! - The [`Batch`](accumulator::Batch) accumulates the lines of the current and recently finished
//!   invocations, synthesizes proxy transactions for invocations that ended without one, and
//!   produces the NDJSON body of the next request.
//! - The [`Transport`](services::transport::Transport) queues agent and platform data, moves it
//!   into the batch and delivers mature batches. Backend responses drive a health state machine
//!   that pauses delivery with a growing grace period after failures.
//! - The [`Correlator`](services::lifecycle::Correlator) consumes platform log events, finalizes
//!   invocations at `platform.runtimeDone` and turns `platform.report` into a metricset.
//! - The [`ExtensionService`](services::ExtensionService) drives the lifecycle: it registers with
//!   the Extensions API, polls for events and closes the telemetry window of every invocation.
//!
//! # Endpoints
//!
//! | Path                    | Listener | Purpose                                        |
//! |-------------------------|----------|------------------------------------------------|
//! | `GET /`                 | intake   | Server information, passed through to backend  |
//! | `POST /intake/v2/events`| intake   | Agent telemetry                                |
//! | `POST /register/transaction` | intake | Transaction started by the agent           |
//! | `POST /`                | logs     | Platform log events pushed by the Logs API     |
#![warn(missing_docs)]

pub mod accumulator;
mod constants;
mod endpoints;
mod http;
mod middlewares;
mod service;
pub mod services;

use std::sync::Arc;

use apm_lambda_config::Config;
use apm_lambda_system::Controller;

pub use self::http::HttpError;
pub use self::service::*;
use self::services::ExtensionService;

/// Runs the extension until the runtime shuts the environment down.
///
/// This boots the async runtime, the HTTP listeners and the control loop. It blocks the current
/// thread until a `SHUTDOWN` event or a termination signal has been handled.
pub fn run(config: Config) -> Result<(), RunError> {
    let runtime = create_runtime("apm-lambda").map_err(RunError::Runtime)?;

    runtime.block_on(async {
        let controller = Controller::start();
        let state = ServiceState::start(Arc::new(config))?;
        ExtensionService::new(state, controller.token())?.run().await?;
        Ok::<_, RunError>(())
    })
}
