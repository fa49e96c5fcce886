use std::convert::Infallible;
use std::sync::Arc;

use apm_lambda_aws_extension::LogEvent;
use apm_lambda_config::{BackendUrl, Config};
use apm_lambda_system::Latch;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tokio::sync::mpsc;

use crate::accumulator::Batch;
use crate::services::ExtensionServiceError;
use crate::services::lifecycle::Correlator;
use crate::services::transport::Transport;

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// No backend URL is configured.
    #[error("no backend url configured")]
    NoBackend,

    /// The backend URL cannot be used for the intake.
    #[error("invalid backend url")]
    InvalidBackend(#[from] url::ParseError),

    /// Building the HTTP client failed.
    #[error("could not create http client")]
    Client(#[from] reqwest::Error),
}

/// Indicates the type of failure when running the extension.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The async runtime could not be created.
    #[error("could not start the runtime")]
    Runtime(#[source] std::io::Error),

    /// The shared state could not be created.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The control loop failed.
    #[error(transparent)]
    Extension(#[from] ExtensionServiceError),
}

#[derive(Debug)]
struct StateInner {
    config: Arc<Config>,
    backend: BackendUrl,
    client: reqwest::Client,
    batch: Arc<Batch>,
    transport: Arc<Transport>,
    correlator: Arc<Correlator>,
    flush_latch: Latch,
    log_events: mpsc::Sender<LogEvent>,
}

/// Creates the multi-threaded runtime the extension runs on.
pub fn create_runtime(name: &str) -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name(name)
        .enable_all()
        .build()
}

/// Server state.
///
/// Shared by the HTTP endpoints and the extension control loop.
#[derive(Clone, Debug)]
pub struct ServiceState {
    inner: Arc<StateInner>,
}

impl ServiceState {
    /// Creates the batch, transport and correlator from the configuration.
    pub fn start(config: Arc<Config>) -> Result<Self, ServiceError> {
        let backend = config.server_url().ok_or(ServiceError::NoBackend)?.clone();

        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout())
            .build()?;

        let batch = Arc::new(Batch::new(config.batch_max_size(), config.batch_max_age()));
        let transport = Arc::new(Transport::new(
            &config,
            backend.as_url().clone(),
            client.clone(),
            Arc::clone(&batch),
        )?);

        let (log_events, log_rx) = mpsc::channel(config.logs_buffer_size());
        let correlator = Arc::new(Correlator::new(
            log_rx,
            Arc::clone(&transport),
            config.collect_function_logs(),
        ));

        Ok(Self {
            inner: Arc::new(StateInner {
                config,
                backend,
                client,
                batch,
                transport,
                correlator,
                flush_latch: Latch::new(),
                log_events,
            }),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the backend base URL.
    pub fn backend(&self) -> &BackendUrl {
        &self.inner.backend
    }

    /// Returns the HTTP client for backend requests.
    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    /// Returns the shared batch.
    pub fn batch(&self) -> &Arc<Batch> {
        &self.inner.batch
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<Transport> {
        &self.inner.transport
    }

    /// Returns the log correlator.
    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.inner.correlator
    }

    /// Returns the latch raised when the agent flushed the data of an invocation.
    pub fn flush_latch(&self) -> &Latch {
        &self.inner.flush_latch
    }

    /// Returns the sender feeding the correlator with log events.
    pub fn log_events(&self) -> &mpsc::Sender<LogEvent> {
        &self.inner.log_events
    }
}

impl FromRequestParts<ServiceState> for ServiceState {
    type Rejection = Infallible;

    async fn from_request_parts(
        _parts: &mut Parts,
        state: &ServiceState,
    ) -> Result<Self, Self::Rejection> {
        Ok(state.clone())
    }
}
