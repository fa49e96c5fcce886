use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use apm_lambda_config::OverridableConfig;
use apm_lambda_server::ServiceState;
use apm_lambda_server::services::{ExtensionService, ExtensionServiceError};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

mod common;

use common::{MockBackend, config};

#[derive(Debug)]
struct RuntimeState {
    register_status: StatusCode,
    events: AsyncMutex<mpsc::UnboundedReceiver<serde_json::Value>>,
    served: Mutex<Vec<serde_json::Value>>,
    subscription: Mutex<Option<serde_json::Value>>,
    errors: Mutex<Vec<String>>,
}

/// The Lambda runtime API as seen by an extension.
struct MockRuntime {
    addr: SocketAddr,
    state: Arc<RuntimeState>,
    events: mpsc::UnboundedSender<serde_json::Value>,
}

async fn register(State(state): State<Arc<RuntimeState>>) -> Response {
    if !state.register_status.is_success() {
        return state.register_status.into_response();
    }

    (
        [("lambda-extension-identifier", "ext-1")],
        axum::Json(json!({
            "functionName": "hello",
            "functionVersion": "$LATEST",
            "handler": "app.handler",
        })),
    )
        .into_response()
}

async fn next_event(State(state): State<Arc<RuntimeState>>) -> Response {
    let event = state.events.lock().await.recv().await;
    match event {
        Some(event) => {
            state.served.lock().push(event.clone());
            axum::Json(event).into_response()
        }
        None => std::future::pending().await,
    }
}

async fn report_error(State(state): State<Arc<RuntimeState>>, headers: HeaderMap) -> Response {
    let error_type = headers
        .get("lambda-extension-function-error-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    state.errors.lock().push(error_type.to_owned());
    (StatusCode::ACCEPTED, axum::Json(json!({"status": "OK"}))).into_response()
}

async fn subscribe(
    State(state): State<Arc<RuntimeState>>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> StatusCode {
    *state.subscription.lock() = Some(body);
    StatusCode::OK
}

impl MockRuntime {
    async fn start(register_status: StatusCode) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, rx) = mpsc::unbounded_channel();

        let state = Arc::new(RuntimeState {
            register_status,
            events: AsyncMutex::new(rx),
            served: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            errors: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/2020-01-01/extension/register", post(register))
            .route("/2020-01-01/extension/event/next", get(next_event))
            .route("/2020-01-01/extension/init/error", post(report_error))
            .route("/2020-01-01/extension/exit/error", post(report_error))
            .route("/2020-08-15/logs", put(subscribe))
            .with_state(Arc::clone(&state));

        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self {
            addr,
            state,
            events,
        }
    }

    fn invoke(&self, request_id: &str, timeout: Duration) {
        let deadline = Utc::now().timestamp_millis() + timeout.as_millis() as i64;
        let event = json!({
            "eventType": "INVOKE",
            "deadlineMs": deadline,
            "requestId": request_id,
            "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:hello",
        });
        self.events.send(event).unwrap();
    }

    fn shutdown(&self, reason: &str, timeout: Duration) {
        let deadline = Utc::now().timestamp_millis() + timeout.as_millis() as i64;
        let event = json!({
            "eventType": "SHUTDOWN",
            "shutdownReason": reason,
            "deadlineMs": deadline,
        });
        self.events.send(event).unwrap();
    }

    async fn wait_served(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.served.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn wait_subscription(&self) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(subscription) = self.state.subscription.lock().clone() {
                    return subscription;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn service(
    backend: &MockBackend,
    runtime: &MockRuntime,
    overrides: serde_json::Value,
) -> (ExtensionService, CancellationToken) {
    apm_lambda_log::init_test!();

    let mut config = config(&backend.url(), overrides);
    let overridable = OverridableConfig {
        runtime_api: Some(runtime.addr.to_string()),
        ..Default::default()
    };
    config.apply_override(overridable).unwrap();

    let state = ServiceState::start(Arc::new(config)).unwrap();
    let token = CancellationToken::new();
    let service = ExtensionService::new(state, token.clone()).unwrap();
    (service, token)
}

/// A full invocation: agent data, platform events, and a shutdown that drains the reports.
#[tokio::test(flavor = "multi_thread")]
async fn test_invocation_lifecycle() {
    let backend = MockBackend::start().await;
    let runtime = MockRuntime::start(StatusCode::OK).await;
    let port = free_port();

    let (service, _token) = service(&backend, &runtime, json!({"receiver": {"port": port}}));
    let task = tokio::spawn(service.run());

    let subscription = runtime.wait_subscription().await;
    assert_eq!(subscription["types"], json!(["platform"]));
    let uri = subscription["destination"]["URI"].as_str().unwrap();
    let logs_port = uri.rsplit(':').next().unwrap();
    assert!(uri.starts_with("http://sandbox.localdomain:"));

    runtime.invoke("req-1", Duration::from_secs(3));
    runtime.wait_served(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let body = format!(
        "{}\n{}\n",
        json!({"metadata": {"service": {"name": "hello"}}}),
        json!({"transaction": {"id": "t1", "trace_id": "tr1", "name": "handler", "duration": 12.5}}),
    );
    let response = client
        .post(format!("http://127.0.0.1:{port}/intake/v2/events?flushed=true"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let events = json!([
        {"time": "2024-01-01T00:00:00.100Z", "type": "platform.runtimeDone", "record": {"requestId": "req-1", "status": "success"}},
        {"time": "2024-01-01T00:00:00.120Z", "type": "platform.report", "record": {
            "requestId": "req-1",
            "metrics": {"durationMs": 101.5, "billedDurationMs": 102, "memorySizeMB": 512, "maxMemoryUsedMB": 33}
        }},
    ]);
    let response = client
        .post(format!("http://127.0.0.1:{logs_port}/"))
        .json(&events)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    runtime.shutdown("spindown", Duration::from_secs(2));
    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    let lines: Vec<serde_json::Value> = backend
        .wait_for_requests(1)
        .await
        .iter()
        .flat_map(|request| request.lines())
        .collect();

    assert_eq!(lines[0], json!({"metadata": {"service": {"name": "hello"}}}));
    assert!(
        lines
            .iter()
            .any(|line| line["transaction"]["id"] == json!("t1"))
    );
    assert!(
        lines
            .iter()
            .any(|line| line["metricset"]["faas"]["execution"] == json!("req-1"))
    );
    assert!(runtime.state.errors.lock().is_empty());
}

/// With sync flush, an invocation's data is delivered once the runtime reports its end, without
/// waiting for the next event.
#[tokio::test(flavor = "multi_thread")]
async fn test_sync_flush_delivers_before_next_event() {
    let backend = MockBackend::start().await;
    let runtime = MockRuntime::start(StatusCode::OK).await;
    let port = free_port();

    let (service, _token) = service(&backend, &runtime, json!({"receiver": {"port": port}}));
    let task = tokio::spawn(service.run());

    let subscription = runtime.wait_subscription().await;
    let uri = subscription["destination"]["URI"].as_str().unwrap();
    let logs_port = uri.rsplit(':').next().unwrap().to_owned();

    runtime.invoke("req-1", Duration::from_secs(3));
    runtime.wait_served(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let body = format!(
        "{}\n{}\n",
        json!({"metadata": {"service": {"name": "hello"}}}),
        json!({"transaction": {"id": "t1", "trace_id": "tr1", "name": "handler"}}),
    );
    let response = client
        .post(format!("http://127.0.0.1:{port}/intake/v2/events?flushed=true"))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let events = json!([
        {"time": "2024-01-01T00:00:00.100Z", "type": "platform.runtimeDone", "record": {"requestId": "req-1", "status": "success"}},
    ]);
    let response = client
        .post(format!("http://127.0.0.1:{logs_port}/"))
        .json(&events)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let requests = backend.wait_for_requests(1).await;
    let lines = requests[0].lines();
    assert_eq!(lines[0], json!({"metadata": {"service": {"name": "hello"}}}));
    assert_eq!(lines[1]["transaction"]["id"], json!("t1"));
    assert_eq!(runtime.state.served.lock().len(), 1);

    runtime.shutdown("spindown", Duration::from_secs(1));
    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}

/// Without log correlation, an invocation without a flush is finalized as timed out.
#[tokio::test(flavor = "multi_thread")]
async fn test_invocation_without_logs() {
    let backend = MockBackend::start().await;
    let runtime = MockRuntime::start(StatusCode::OK).await;
    let port = free_port();

    let (service, _token) = service(
        &backend,
        &runtime,
        json!({"receiver": {"port": port}, "logs": {"enabled": false}}),
    );
    let task = tokio::spawn(service.run());

    runtime.invoke("req-1", Duration::from_millis(1500));
    runtime.wait_served(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let body = format!(
        "{}\n{}\n",
        json!({"metadata": {"service": {"name": "hello"}}}),
        json!({"span": {"id": "s1"}}),
    );
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/intake/v2/events"))
        .body(body)
        .send()
        .await
        .unwrap();

    runtime.shutdown("spindown", Duration::from_secs(2));
    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    let requests = backend.wait_for_requests(1).await;
    let lines = requests[0].lines();
    assert_eq!(lines[1], json!({"span": {"id": "s1"}}));
    assert!(runtime.state.subscription.lock().is_none());
}

#[tokio::test]
async fn test_register_failure() {
    let backend = MockBackend::start().await;
    let runtime = MockRuntime::start(StatusCode::FORBIDDEN).await;

    let (service, _token) = service(&backend, &runtime, json!({"receiver": {"port": 0}}));
    let result = service.run().await;

    assert!(matches!(result, Err(ExtensionServiceError::Register(_))));
    assert_eq!(
        runtime.state.errors.lock().as_slice(),
        ["Extension.InitFailed"]
    );
}

/// Cancelling the root token stops the control loop while it waits for the next event.
#[tokio::test]
async fn test_shutdown_signal() {
    let backend = MockBackend::start().await;
    let runtime = MockRuntime::start(StatusCode::OK).await;

    let (service, token) = service(
        &backend,
        &runtime,
        json!({"receiver": {"port": 0}, "logs": {"enabled": false}}),
    );
    let task = tokio::spawn(service.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(backend.requests().is_empty());
}
