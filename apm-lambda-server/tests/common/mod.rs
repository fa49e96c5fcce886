//! Test harness shared by the integration tests.
//!
//! [`MockBackend`] stands in for the telemetry backend and records every request it receives.
//! [`TestServer`] runs the HTTP listeners of the extension against it.
#![allow(dead_code)]

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apm_lambda_config::Config;
use apm_lambda_server::ServiceState;
use apm_lambda_server::services::{HttpServer, RunningServer};
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use flate2::read::GzDecoder;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A request received by the [`MockBackend`].
#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// The body, gunzipped if the request was compressed.
    pub body: Bytes,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn lines(&self) -> Vec<serde_json::Value> {
        self.body
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect()
    }
}

#[derive(Debug)]
struct BackendState {
    requests: Mutex<Vec<CapturedRequest>>,
    status: Mutex<StatusCode>,
}

async fn capture(
    State(state): State<Arc<BackendState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|v| v.as_bytes() == b"gzip");

    let body = if gzipped {
        let mut decoded = Vec::new();
        GzDecoder::new(&body[..]).read_to_end(&mut decoded).unwrap();
        Bytes::from(decoded)
    } else {
        body
    };

    state.requests.lock().push(CapturedRequest {
        method: method.clone(),
        path: uri.path().to_owned(),
        headers,
        body,
    });

    if method == Method::GET {
        return (
            StatusCode::OK,
            [("x-backend", "mock")],
            axum::Json(json!({"version": "8.12.0"})),
        )
            .into_response();
    }

    let status = *state.status.lock();
    match status {
        StatusCode::TOO_MANY_REQUESTS => (status, [(header::RETRY_AFTER, "30")]).into_response(),
        status if status.is_success() => (status, "{}").into_response(),
        status => (
            status,
            axum::Json(json!({"errors": [{"message": "rejected", "document": "{}"}]})),
        )
            .into_response(),
    }
}

/// A telemetry backend on a local port.
#[derive(Debug)]
pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = Arc::new(BackendState {
            requests: Mutex::new(Vec::new()),
            status: Mutex::new(StatusCode::ACCEPTED),
        });

        let app = Router::new().fallback(capture).with_state(Arc::clone(&state));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown.cancelled_owned())
                    .await
                    .unwrap()
            }
        });

        Self {
            addr,
            state,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Closes all connections and stops listening.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.unwrap();
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Sets the status of all following `POST` responses.
    pub fn respond_with(&self, status: StatusCode) {
        *self.state.status.lock() = status;
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().clone()
    }

    /// Waits until at least `count` requests were received.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<CapturedRequest> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let requests = self.requests();
                if requests.len() >= count {
                    return requests;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("backend did not receive the expected requests")
    }
}

/// Returns a URL on which nothing listens.
pub fn unreachable_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/")
}

/// A config pointing at `backend_url` with listeners on free local ports.
pub fn config(backend_url: &str, overrides: serde_json::Value) -> Config {
    let mut value = json!({
        "server": {"url": backend_url, "secret_token": "s3cr3t", "timeout": 2},
        "receiver": {"host": "127.0.0.1", "port": 0},
        "logs": {"host": "127.0.0.1", "port": 0},
        "batch": {"max_size": 50, "max_age_ms": 60000},
    });

    merge(&mut value, overrides);
    Config::from_json_value(value).unwrap()
}

fn merge(target: &mut serde_json::Value, source: serde_json::Value) {
    match (target, source) {
        (serde_json::Value::Object(target), serde_json::Value::Object(source)) => {
            for (key, value) in source {
                merge(target.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, source) => *target = source,
    }
}

/// The HTTP listeners of the extension.
pub struct TestServer {
    pub state: ServiceState,
    pub addr: SocketAddr,
    pub logs_addr: Option<SocketAddr>,
    pub running: RunningServer,
    token: CancellationToken,
}

impl TestServer {
    pub async fn start(config: Config) -> Self {
        apm_lambda_log::init_test!();

        let state = ServiceState::start(Arc::new(config)).unwrap();
        let server = HttpServer::bind(state.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let logs_addr = server.logs_addr().unwrap();

        let token = CancellationToken::new();
        let running = server.start(token.clone()).unwrap();

        Self {
            state,
            addr,
            logs_addr,
            running,
            token,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn logs_url(&self) -> String {
        format!("http://{}/", self.logs_addr.unwrap())
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
