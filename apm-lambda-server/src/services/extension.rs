use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apm_lambda_aws_extension::{
    Buffering, Destination, ExtensionClient, ExtensionError, InvokeResponse, LOGS_SCHEMA_VERSION,
    LogsApiClient, LogsApiError, NextEventResponse, ShutdownResponse, SubscribeRequest,
    SubscriptionType,
};
use apm_lambda_config::{SANDBOX_HOSTNAME, SendStrategy};
use apm_lambda_log::LogError;
use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::service::ServiceState;
use crate::services::lifecycle::{LifecycleEntry, ProcessMode};
use crate::services::server::{HttpServer, ServerError};

/// Error type reported to the runtime when registration or startup fails.
const INIT_ERROR_TYPE: &str = "Extension.InitFailed";

/// Error type reported to the runtime when the event loop cannot continue.
const EXIT_ERROR_TYPE: &str = "Extension.NextEventFailed";

/// Indicates the type of failure of the extension service.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionServiceError {
    /// The address of the runtime API is not configured.
    #[error("runtime API address is not configured")]
    NoRuntimeApi,

    /// The Extensions API client could not be created.
    #[error("could not create extensions API client")]
    Client(#[source] ExtensionError),

    /// The Logs API client could not be created.
    #[error("could not create logs API client")]
    LogsClient(#[from] LogsApiError),

    /// Registration with the Extensions API failed.
    #[error("failed to register the extension")]
    Register(#[source] ExtensionError),

    /// The HTTP listeners could not be started.
    #[error("failed to start the http server")]
    Server(#[from] ServerError),

    /// Polling the next lifecycle event failed.
    #[error("failed to receive the next event")]
    NextEvent(#[source] ExtensionError),
}

/// Returns the time left until `deadline_ms` minus `margin`.
fn remaining_window(deadline_ms: i64, margin: Duration) -> Duration {
    let margin_ms = i64::try_from(margin.as_millis()).unwrap_or(i64::MAX);
    let remaining = deadline_ms
        .saturating_sub(Utc::now().timestamp_millis())
        .saturating_sub(margin_ms);

    Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
}

/// The invocation control loop of the extension.
///
/// Registers with the Extensions API, starts the HTTP listeners and then handles lifecycle events
/// until the runtime shuts the environment down or `token` is cancelled.
#[derive(Debug)]
pub struct ExtensionService {
    state: ServiceState,
    client: ExtensionClient,
    logs_client: LogsApiClient,
    token: CancellationToken,
}

impl ExtensionService {
    /// Creates the service from the shared state.
    ///
    /// Cancelling `token` stops the event loop after a final flush.
    pub fn new(state: ServiceState, token: CancellationToken) -> Result<Self, ExtensionServiceError> {
        let runtime_api = state
            .config()
            .runtime_api()
            .ok_or(ExtensionServiceError::NoRuntimeApi)?;

        let client = ExtensionClient::new(runtime_api).map_err(ExtensionServiceError::Client)?;
        let logs_client = LogsApiClient::new(runtime_api)?;

        Ok(Self {
            state,
            client,
            logs_client,
            token,
        })
    }

    /// Runs the control loop to completion.
    pub async fn run(mut self) -> Result<(), ExtensionServiceError> {
        let name = self.state.config().extension_name().to_owned();
        let registration = match self.client.register(&name).await {
            Ok(registration) => registration,
            Err(error) => {
                self.report_init_error().await;
                return Err(ExtensionServiceError::Register(error));
            }
        };

        apm_lambda_log::info!(
            function_name = registration.function_name,
            function_version = registration.function_version,
            "registered extension {name}"
        );

        let server = match HttpServer::bind(self.state.clone()) {
            Ok(server) => server,
            Err(error) => {
                self.report_init_error().await;
                return Err(error.into());
            }
        };

        let logs_addr = server.logs_addr().map_err(ServerError::from)?;
        let mut running = server.start(self.token.clone())?;

        let logs_active = match logs_addr {
            Some(addr) => self.subscribe(addr).await,
            None => false,
        };

        if !logs_active {
            running.shutdown_logs().await;
        }

        let result = self.event_loop(logs_active).await;

        self.token.cancel();
        running.join().await;
        result
    }

    async fn event_loop(&self, logs_active: bool) -> Result<(), ExtensionServiceError> {
        loop {
            let event = tokio::select! {
                biased;

                _ = self.token.cancelled() => {
                    apm_lambda_log::info!("shutdown requested, flushing remaining data");
                    self.final_flush("shutdown").await;
                    return Ok(());
                }
                event = self.client.next_event() => event,
            };

            match event {
                Ok(NextEventResponse::Invoke(invoke)) => {
                    self.handle_invoke(invoke, logs_active).await;
                }
                Ok(NextEventResponse::Shutdown(shutdown)) => {
                    self.handle_shutdown(shutdown, logs_active).await;
                    return Ok(());
                }
                Err(error) => {
                    apm_lambda_log::error!("failed to receive next event: {}", LogError(&error));
                    if let Err(error) = self.client.exit_error(EXIT_ERROR_TYPE).await {
                        apm_lambda_log::warn!("failed to report exit error: {}", LogError(&error));
                    }
                    self.final_flush("failure").await;
                    return Err(ExtensionServiceError::NextEvent(error));
                }
            }
        }
    }

    async fn report_init_error(&self) {
        if let Err(error) = self.client.init_error(INIT_ERROR_TYPE).await {
            apm_lambda_log::warn!("failed to report init error: {}", LogError(&error));
        }
    }

    /// Subscribes the log listener bound at `addr` to the Logs API.
    ///
    /// Returns `true` if log events will be delivered.
    async fn subscribe(&self, addr: SocketAddr) -> bool {
        let Some(extension_id) = self.client.extension_id() else {
            return false;
        };

        let config = self.state.config();
        let mut types = vec![SubscriptionType::Platform];
        if config.collect_function_logs() {
            types.push(SubscriptionType::Function);
        }

        let buffering = config.logs_buffering();
        let request = SubscribeRequest {
            schema_version: LOGS_SCHEMA_VERSION,
            types,
            buffering: Buffering {
                max_items: buffering.max_items,
                max_bytes: buffering.max_bytes,
                timeout_ms: buffering.timeout_ms,
            },
            destination: Destination::http(format!(
                "http://{SANDBOX_HOSTNAME}:{}",
                addr.port()
            )),
        };

        match self.logs_client.subscribe(extension_id, &request).await {
            Ok(()) => {
                apm_lambda_log::info!("subscribed to platform logs");
                true
            }
            Err(error) => {
                apm_lambda_log::warn!(
                    "logs subscription failed, log correlation disabled: {}",
                    LogError(&error)
                );
                false
            }
        }
    }

    async fn handle_invoke(&self, invoke: InvokeResponse, logs_active: bool) {
        let InvokeResponse {
            deadline_ms,
            request_id,
            invoked_function_arn,
            ..
        } = invoke;

        apm_lambda_log::debug!(request_id, "received invocation");

        let timestamp = Utc::now();
        let batch = self.state.batch();
        let transport = self.state.transport();
        let correlator = self.state.correlator();
        let latch = self.state.flush_latch();

        if logs_active {
            correlator.register(LifecycleEntry {
                request_id: request_id.clone(),
                function_arn: invoked_function_arn.clone(),
                deadline_ms,
                timestamp,
            });
        }
        batch.register_invocation(&request_id, &invoked_function_arn, deadline_ms, timestamp);

        let token = self.token.child_token();
        let forwarder = tokio::spawn({
            let transport = Arc::clone(transport);
            let token = token.clone();
            async move { transport.forward_loop(token).await }
        });

        let logs_done = async {
            match logs_active {
                true => {
                    correlator
                        .process_logs(token.clone(), &request_id, ProcessMode::Invocation)
                        .await
                }
                false => std::future::pending().await,
            }
        };
        tokio::pin!(logs_done);

        let window = remaining_window(deadline_ms, self.state.config().flush_margin());
        let window_end = Instant::now() + window;
        let flushed = tokio::select! {
            _ = latch.wait() => {
                apm_lambda_log::debug!(request_id, "agent flushed invocation data");
                true
            }
            done = &mut logs_done => {
                apm_lambda_log::debug!(request_id, done, "log processing finished");
                false
            }
            _ = tokio::time::sleep_until(window_end) => {
                apm_lambda_log::warn!(request_id, "invocation window elapsed before data was flushed");
                false
            }
            _ = token.cancelled() => false,
        };

        // Agent data is only shippable once runtimeDone finalized the invocation.
        if flushed && logs_active {
            tokio::select! {
                done = &mut logs_done => {
                    apm_lambda_log::debug!(request_id, done, "log processing finished");
                }
                _ = tokio::time::sleep_until(window_end) => {
                    apm_lambda_log::warn!(request_id, "runtime did not report the end of the invocation");
                }
            }
        }

        token.cancel();
        match forwarder.await {
            Ok(Ok(())) => (),
            Ok(Err(error)) => {
                apm_lambda_log::warn!(request_id, "failed to forward data: {}", LogError(&error));
            }
            Err(error) => {
                apm_lambda_log::error!(request_id, "forwarder task failed: {}", LogError(&error));
            }
        }

        if !logs_active {
            let status = if flushed { "success" } else { "timeout" };
            if let Err(error) = batch.finalize_invocation(&request_id, status, Utc::now(), None) {
                if !error.is_not_found() {
                    apm_lambda_log::warn!(
                        request_id,
                        "failed to finalize invocation: {}",
                        LogError(&error)
                    );
                }
            }
        }

        latch.reset();

        if self.state.config().send_strategy() == SendStrategy::SyncFlush {
            let token = self.token.child_token();
            transport.flush_now(&token).await;
        }
    }

    async fn handle_shutdown(&self, shutdown: ShutdownResponse, logs_active: bool) {
        let ShutdownResponse {
            shutdown_reason,
            deadline_ms,
        } = shutdown;

        apm_lambda_log::info!(reason = shutdown_reason, "received shutdown event");

        let correlator = self.state.correlator();
        if logs_active && correlator.size() > 0 {
            let window = remaining_window(deadline_ms, self.state.config().flush_margin());
            let token = self.token.child_token();

            let drained = tokio::select! {
                done = correlator.process_logs(token.clone(), "", ProcessMode::ShutdownDrain) => done,
                _ = tokio::time::sleep(window) => false,
            };
            token.cancel();

            if !drained {
                apm_lambda_log::warn!(
                    pending = correlator.size(),
                    "platform reports missing at shutdown"
                );
            }
        }

        self.final_flush(&shutdown_reason).await;
    }

    /// Sends everything left, finalizing open invocations with `reason`.
    ///
    /// Runs with its own token so that it is not affected by a cancelled root token.
    async fn final_flush(&self, reason: &str) {
        let transport = self.state.transport();
        let token = CancellationToken::new();

        let flush = async {
            transport.flush_now(&token).await;

            match self.state.batch().drain_all(reason, Utc::now()) {
                Ok(count) => apm_lambda_log::debug!("finalized {count} open invocations"),
                Err(error) => {
                    apm_lambda_log::warn!("failed to finalize invocations: {}", LogError(&error));
                }
            }

            transport.flush_now(&token).await;
        };

        let timeout = self.state.config().shutdown_flush_timeout();
        if tokio::time::timeout(timeout, flush).await.is_err() {
            apm_lambda_log::warn!("final flush did not complete within {timeout:?}");
        }

        token.cancel();
    }
}
