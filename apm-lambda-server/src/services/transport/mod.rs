//! Delivery of accumulated telemetry to the backend.
//!
//! The [`Transport`] owns the bounded queues between the intake and the [`Batch`], tracks the
//! health of the backend connection in a [`TransportStatus`], and sends batches. After a failed
//! send, further sends are refused until a grace period elapsed.

use std::sync::Arc;
use std::time::Duration;

use apm_lambda_config::Config;
use apm_lambda_log::LogError;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header;
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::accumulator::{Batch, ContentEncoding, Origin, TelemetryUnit};
use crate::constants::{INTAKE_PATH, MAX_RESPONSE_SIZE, NDJSON_CONTENT_TYPE, USER_AGENT};
use crate::http::{HttpError, Response, StatusCode};

mod pool;
mod status;

pub use self::pool::*;
pub use self::status::*;

/// Maximum length of a raw error body that is logged.
const MAX_LOGGED_BODY: usize = 1024;

/// An error sending data to the backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The backend is failing and the grace period has not elapsed.
    #[error("backend is unhealthy, refusing to send")]
    Unhealthy,
    /// The backend rejected the credentials.
    #[error("backend rejected the credentials")]
    Unauthorized,
    /// The backend answered with an error status.
    #[error("backend responded with status {0}")]
    Status(StatusCode),
    /// The request failed.
    #[error("could not send data to the backend")]
    Http(#[from] HttpError),
}

impl TransportError {
    /// Returns `true` if the backend cannot currently accept data.
    ///
    /// Rejections of individual batches, including rate limiting and bad credentials, are not
    /// fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unhealthy | Self::Http(_) => true,
            Self::Status(status) => status.is_server_error(),
            Self::Unauthorized => false,
        }
    }
}

/// Error documents returned by the backend.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorResponse {
    errors: Vec<ErrorItem>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorItem {
    message: String,
    document: Option<String>,
}

fn log_error_body(status: StatusCode, body: &[u8]) {
    match serde_json::from_slice::<ErrorResponse>(body) {
        Ok(response) => {
            if let Some(error) = response.error {
                apm_lambda_log::warn!(status = status.as_u16(), "backend error: {error}");
            }

            for item in response.errors {
                apm_lambda_log::warn!(
                    status = status.as_u16(),
                    document = item.document.as_deref().unwrap_or_default(),
                    "backend rejected document: {}",
                    item.message
                );
            }
        }
        Err(_) => {
            let body = String::from_utf8_lossy(&body[..body.len().min(MAX_LOGGED_BODY)]);
            apm_lambda_log::warn!(status = status.as_u16(), "backend error: {body}");
        }
    }
}

#[derive(Debug)]
struct Health {
    status: TransportStatus,
    reconnection_count: i32,
}

/// Sends telemetry to the backend and tracks its health.
#[derive(Debug)]
pub struct Transport {
    client: reqwest::Client,
    intake_url: Url,
    authorization: Option<String>,
    health: Arc<Mutex<Health>>,
    pool: BufferPool,
    batch: Arc<Batch>,
    agent_info: Mutex<Option<String>>,
    agent_tx: mpsc::Sender<TelemetryUnit>,
    platform_tx: mpsc::Sender<TelemetryUnit>,
    agent_rx: AsyncMutex<mpsc::Receiver<TelemetryUnit>>,
    platform_rx: AsyncMutex<mpsc::Receiver<TelemetryUnit>>,
}

impl Transport {
    /// Creates a transport for the backend at `backend`.
    pub fn new(
        config: &Config,
        backend: Url,
        client: reqwest::Client,
        batch: Arc<Batch>,
    ) -> Result<Self, url::ParseError> {
        let intake_url = backend.join(INTAKE_PATH)?;
        let (agent_tx, agent_rx) = mpsc::channel(config.agent_buffer_size());
        let (platform_tx, platform_rx) = mpsc::channel(config.platform_buffer_size());

        Ok(Self {
            client,
            intake_url,
            authorization: config.authorization(),
            health: Arc::new(Mutex::new(Health {
                status: TransportStatus::Started,
                reconnection_count: -1,
            })),
            pool: BufferPool::new(),
            batch,
            agent_info: Mutex::new(None),
            agent_tx,
            platform_tx,
            agent_rx: AsyncMutex::new(agent_rx),
            platform_rx: AsyncMutex::new(platform_rx),
        })
    }

    /// Returns the current health status.
    pub fn status(&self) -> TransportStatus {
        self.health.lock().status
    }

    /// Returns the number of failures since the backend was last healthy, `-1` if it is healthy.
    pub fn reconnection_count(&self) -> i32 {
        self.health.lock().reconnection_count
    }

    /// Returns `true` while sends are refused.
    pub fn is_unhealthy(&self) -> bool {
        self.status() == TransportStatus::Failing
    }

    /// Returns the user agent of the tracing agent, once known.
    pub fn agent_info(&self) -> Option<String> {
        self.agent_info.lock().clone()
    }

    /// Returns the batch this transport ships.
    pub fn batch(&self) -> &Arc<Batch> {
        &self.batch
    }

    /// Transitions to `status`.
    ///
    /// A transition to [`Healthy`](TransportStatus::Healthy) resets the reconnection count. A
    /// transition to [`Failing`](TransportStatus::Failing) increments it and holds the status
    /// until the grace period elapsed or `token` is cancelled, after which the status returns to
    /// [`Started`](TransportStatus::Started).
    pub fn update_status(&self, token: &CancellationToken, status: TransportStatus) {
        let mut health = self.health.lock();
        if health.status == status {
            return;
        }

        match status {
            TransportStatus::Healthy => {
                health.reconnection_count = -1;
            }
            TransportStatus::Failing => {
                health.reconnection_count += 1;
                let grace = compute_grace_period(health.reconnection_count);
                apm_lambda_log::info!(
                    reconnection_count = health.reconnection_count,
                    "backend is failing, retrying in {grace:?}"
                );
                tokio::spawn(wait_grace_period(
                    Arc::clone(&self.health),
                    token.clone(),
                    grace,
                ));
            }
            TransportStatus::Started
            | TransportStatus::RateLimited
            | TransportStatus::ClientFailing => (),
        }

        apm_lambda_log::debug!("transport status changed from {} to {status}", health.status);
        health.status = status;
    }

    /// Queues a unit for delivery without waiting.
    ///
    /// If the queue is full, the unit is dropped. Returns `true` if the unit was queued.
    pub fn enqueue(&self, unit: TelemetryUnit) -> bool {
        let origin = unit.origin;
        let sender = match origin {
            Origin::Agent => &self.agent_tx,
            Origin::Platform => &self.platform_tx,
        };

        match sender.try_send(unit) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                apm_lambda_log::warn!(?origin, "data queue is full, dropping data");
                false
            }
            Err(TrySendError::Closed(_)) => {
                apm_lambda_log::warn!(?origin, "data queue is closed, dropping data");
                false
            }
        }
    }

    /// Sends a batch to the backend.
    ///
    /// Identity-encoded data is compressed with gzip first. The outcome of the request determines
    /// the new [`TransportStatus`].
    pub async fn send(
        &self,
        token: &CancellationToken,
        data: Bytes,
        encoding: ContentEncoding,
    ) -> Result<(), TransportError> {
        if self.is_unhealthy() {
            return Err(TransportError::Unhealthy);
        }

        let (body, encoding, pooled) = match encoding {
            ContentEncoding::Identity => {
                let compressed = self.pool.gzip(&data).map_err(HttpError::Io)?;
                (compressed.clone(), ContentEncoding::Gzip, Some(compressed))
            }
            encoding => (data, encoding, None),
        };

        let user_agent = match self.agent_info() {
            Some(agent) => format!("{USER_AGENT} {agent}"),
            None => USER_AGENT.to_owned(),
        };

        let mut request = self
            .client
            .post(self.intake_url.clone())
            .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
            .header(header::USER_AGENT, user_agent)
            .body(body);

        if let Some(name) = encoding.name() {
            request = request.header(header::CONTENT_ENCODING, name);
        }

        if let Some(authorization) = &self.authorization {
            request = request.header(header::AUTHORIZATION, authorization);
        }

        let result = match request.send().await {
            Ok(response) => self.handle_response(token, Response(response)).await,
            Err(error) => {
                self.update_status(token, TransportStatus::Failing);
                Err(HttpError::Reqwest(error).into())
            }
        };

        if let Some(buffer) = pooled {
            self.pool.recycle(buffer);
        }

        result
    }

    async fn handle_response(
        &self,
        token: &CancellationToken,
        mut response: Response,
    ) -> Result<(), TransportError> {
        let status = response.status();

        if status.is_success() {
            if let Err(error) = response.consume().await {
                apm_lambda_log::debug!("failed to read response: {}", LogError(&error));
            }
            self.update_status(token, TransportStatus::Healthy);
            return Ok(());
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response.get_header(header::RETRY_AFTER).map(str::to_owned);
            apm_lambda_log::warn!(
                retry_after = retry_after.as_deref().unwrap_or_default(),
                "backend is rate limiting"
            );
            if let Err(error) = response.consume().await {
                apm_lambda_log::debug!("failed to read response: {}", LogError(&error));
            }
            self.update_status(token, TransportStatus::RateLimited);
            return Err(TransportError::Status(status));
        }

        match response.bytes(MAX_RESPONSE_SIZE).await {
            Ok(body) => log_error_body(status, &body),
            Err(error) => {
                apm_lambda_log::debug!("failed to read error response: {}", LogError(&error))
            }
        }

        if status == StatusCode::UNAUTHORIZED {
            apm_lambda_log::warn!(
                "backend rejected the credentials, check the api key or secret token"
            );
            Err(TransportError::Unauthorized)
        } else if status.is_server_error() {
            self.update_status(token, TransportStatus::Failing);
            Err(TransportError::Status(status))
        } else {
            self.update_status(token, TransportStatus::ClientFailing);
            Err(TransportError::Status(status))
        }
    }

    fn forward_agent(&self, unit: TelemetryUnit) {
        if let Some(agent) = &unit.agent_info {
            let mut agent_info = self.agent_info.lock();
            if agent_info.is_none() {
                *agent_info = Some(agent.clone());
            }
        }

        if let Err(error) = self.batch.ingest_agent_payload(&unit) {
            apm_lambda_log::warn!("dropping agent data: {}", LogError(&error));
        }
    }

    fn forward_platform(&self, unit: TelemetryUnit) {
        if let Err(error) = self.batch.add_platform_line(&unit.data) {
            apm_lambda_log::warn!("dropping platform data: {}", LogError(&error));
        }
    }

    async fn ship_if_mature(&self, token: &CancellationToken) -> Result<(), TransportError> {
        match self.batch.take_if_mature() {
            Some(data) => self.send(token, data, ContentEncoding::Identity).await,
            None => Ok(()),
        }
    }

    /// Moves queued data into the batch and sends it whenever it matures, until `token` is
    /// cancelled.
    ///
    /// Platform data is only consumed once an agent payload supplied the metadata. Rejected
    /// batches are logged and dropped. Returns an error if the backend fails or is unreachable.
    pub async fn forward_loop(&self, token: CancellationToken) -> Result<(), TransportError> {
        if self.is_unhealthy() {
            apm_lambda_log::debug!("backend is unhealthy, not forwarding data");
            return Ok(());
        }

        let mut agent_rx = self.agent_rx.lock().await;
        let mut platform_rx = self.platform_rx.lock().await;

        loop {
            let has_metadata = self.batch.has_metadata();

            tokio::select! {
                biased;

                _ = token.cancelled() => return Ok(()),
                Some(unit) = agent_rx.recv() => self.forward_agent(unit),
                Some(unit) = platform_rx.recv(), if has_metadata => self.forward_platform(unit),
                else => return Ok(()),
            }

            match self.ship_if_mature(&token).await {
                Ok(()) => (),
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => {
                    apm_lambda_log::warn!("failed to forward data: {}", LogError(&error));
                }
            }
        }
    }

    /// Sends everything that is queued or accumulated.
    ///
    /// Failures are logged and never returned. Stops draining platform data once `token` is
    /// cancelled, but still sends what was accumulated.
    pub async fn flush_now(&self, token: &CancellationToken) {
        if self.is_unhealthy() {
            apm_lambda_log::debug!("backend is unhealthy, skipping flush");
            return;
        }

        let mut agent_rx = self.agent_rx.lock().await;
        let mut platform_rx = self.platform_rx.lock().await;

        while let Ok(unit) = agent_rx.try_recv() {
            self.forward_agent(unit);
        }

        if !self.batch.has_metadata() {
            apm_lambda_log::debug!("metadata not yet available, skipping flush");
            return;
        }

        while !token.is_cancelled() {
            let Ok(unit) = platform_rx.try_recv() else {
                break;
            };

            self.forward_platform(unit);
            if let Err(error) = self.ship_if_mature(token).await {
                apm_lambda_log::warn!("failed to flush data: {}", LogError(&error));
            }
        }

        if let Some(data) = self.batch.take() {
            if let Err(error) = self.send(token, data, ContentEncoding::Identity).await {
                apm_lambda_log::warn!("failed to flush data: {}", LogError(&error));
            }
        }
    }
}

async fn wait_grace_period(health: Arc<Mutex<Health>>, token: CancellationToken, grace: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(grace) => (),
        _ = token.cancelled() => (),
    }

    let mut health = health.lock();
    if health.status == TransportStatus::Failing {
        apm_lambda_log::debug!("grace period elapsed, ready to retry");
        health.status = TransportStatus::Started;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(buffer: usize) -> Transport {
        let config = Config::from_json_value(serde_json::json!({
            "transport": {"agent_buffer": buffer, "platform_buffer": buffer},
        }))
        .unwrap();

        let batch = Arc::new(Batch::new(10, Duration::from_secs(60)));
        let backend = Url::parse("http://127.0.0.1:1/").unwrap();
        Transport::new(&config, backend, reqwest::Client::new(), batch).unwrap()
    }

    async fn wait_for_status(transport: &Transport, status: TransportStatus) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.status() != status {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_full() {
        let transport = transport(1);

        assert!(transport.enqueue(TelemetryUnit::platform("{}")));
        assert!(!transport.enqueue(TelemetryUnit::platform("{}")));
        assert!(transport.enqueue(TelemetryUnit::agent(
            Bytes::from_static(b"{}"),
            ContentEncoding::Identity,
            None
        )));
    }

    #[tokio::test]
    async fn test_refuses_while_failing() {
        let transport = transport(1);
        let token = CancellationToken::new();

        transport.update_status(&token, TransportStatus::Failing);
        assert_eq!(transport.reconnection_count(), 0);

        let result = transport
            .send(&token, Bytes::from_static(b"{}"), ContentEncoding::Identity)
            .await;
        assert!(matches!(result, Err(TransportError::Unhealthy)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_ends_on_cancel() {
        let transport = transport(1);
        let token = CancellationToken::new();

        transport.update_status(&token, TransportStatus::Healthy);
        transport.update_status(&token, TransportStatus::Failing);
        transport.update_status(&token, TransportStatus::Failing);
        assert_eq!(transport.reconnection_count(), 0);

        token.cancel();
        wait_for_status(&transport, TransportStatus::Started).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_grows() {
        let transport = transport(1);
        let token = CancellationToken::new();

        for expected in 0..3 {
            transport.update_status(&token, TransportStatus::Failing);
            assert_eq!(transport.reconnection_count(), expected);

            tokio::time::sleep(Duration::from_secs(40)).await;
            assert_eq!(transport.status(), TransportStatus::Started);
        }

        transport.update_status(&token, TransportStatus::Healthy);
        assert_eq!(transport.reconnection_count(), -1);
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TransportError::Unhealthy.is_fatal());
        assert!(TransportError::Status(StatusCode::SERVICE_UNAVAILABLE).is_fatal());
        assert!(!TransportError::Status(StatusCode::TOO_MANY_REQUESTS).is_fatal());
        assert!(!TransportError::Status(StatusCode::PAYLOAD_TOO_LARGE).is_fatal());
        assert!(!TransportError::Unauthorized.is_fatal());
    }

    #[test]
    fn test_log_error_body() {
        apm_lambda_log::init_test!();

        log_error_body(
            StatusCode::BAD_REQUEST,
            br#"{"accepted":0,"errors":[{"message":"decode error","document":"{}"}]}"#,
        );
        log_error_body(StatusCode::BAD_REQUEST, b"<html>bad gateway</html>");
    }
}
