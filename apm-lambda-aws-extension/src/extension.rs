use std::collections::HashMap;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";
const EXTENSION_ERROR_TYPE_HEADER: &str = "Lambda-Extension-Function-Error-Type";

/// Errors talking to the Extensions API.
#[derive(Debug, thiserror::Error)]
pub enum ExtensionError {
    /// The runtime API address does not form a valid URL.
    #[error("invalid runtime API address '{0}'")]
    InvalidAddress(String),
    /// The request could not be sent or the response not read.
    #[error("extensions API request failed")]
    Request(#[from] reqwest::Error),
    /// The API answered with an unexpected status code.
    #[error("extensions API responded with status {0}")]
    Status(StatusCode),
    /// The register response did not carry an extension identifier.
    #[error("register response is missing the extension identifier")]
    MissingIdentifier,
    /// An event was requested before registering.
    #[error("extension is not registered")]
    NotRegistered,
}

/// Response received from the register API.
///
/// # Example
///
/// ```json
/// {
///    "functionName": "helloWorld",
///    "functionVersion": "$LATEST",
///    "handler": "lambda_function.lambda_handler"
/// }
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterResponse {
    /// The name of the lambda function.
    pub function_name: String,
    /// The version of the lambda function.
    pub function_version: String,
    /// The handler that the lambda function invokes.
    pub handler: String,
}

/// Tracing headers from an [`InvokeResponse`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tracing {
    /// Type of tracing header.
    #[serde(rename = "type")]
    pub ty: String,
    /// Tracing header value.
    pub value: String,
}

/// Response received from the next event API on an `INVOKE` event.
///
/// # Example
///
/// ```json
/// {
///     "eventType": "INVOKE",
///     "deadlineMs": 676051,
///     "requestId": "3da1f2dc-3222-475e-9205-e2e6c6318895",
///     "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:ExtensionTest",
///     "tracing": {
///         "type": "X-Amzn-Trace-Id",
///         "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2;Parent=2be948a625588e32;Sampled=1"
///     }
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeResponse {
    /// The time when the function times out, in Unix milliseconds.
    pub deadline_ms: i64,
    /// Unique request identifier.
    pub request_id: String,
    /// The ARN of the invoked function.
    pub invoked_function_arn: String,
    /// Tracing headers.
    #[serde(default)]
    pub tracing: Option<Tracing>,
}

/// Response received from the next event API on a `SHUTDOWN` event.
///
/// # Example
///
/// ```json
/// {
///   "eventType": "SHUTDOWN",
///   "shutdownReason": "timeout",
///   "deadlineMs": 42069
/// }
/// ```
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownResponse {
    /// The reason for the shutdown, for example `spindown`, `timeout` or `failure`.
    pub shutdown_reason: String,
    /// The time until which the extension may run, in Unix milliseconds.
    pub deadline_ms: i64,
}

/// All possible next event responses.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE", tag = "eventType")]
pub enum NextEventResponse {
    /// `INVOKE` response.
    Invoke(InvokeResponse),
    /// `SHUTDOWN` response.
    Shutdown(ShutdownResponse),
}

impl NextEventResponse {
    /// Returns the deadline of the event in Unix milliseconds.
    pub fn deadline_ms(&self) -> i64 {
        match self {
            Self::Invoke(invoke) => invoke.deadline_ms,
            Self::Shutdown(shutdown) => shutdown.deadline_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    status: String,
}

/// Client for the Lambda [Extensions API].
///
/// Requests are sent without a timeout: Lambda freezes the execution environment between
/// invocations, and the pending `next` request is answered after it thaws.
///
/// [Extensions API]: https://docs.aws.amazon.com/lambda/latest/dg/runtimes-extensions-api.html
#[derive(Debug)]
pub struct ExtensionClient {
    base_url: Url,
    client: Client,
    extension_id: Option<String>,
}

impl ExtensionClient {
    /// Creates a client for the runtime API at `runtime_api`, given as `host:port`.
    pub fn new(runtime_api: &str) -> Result<Self, ExtensionError> {
        let base_url = format!("http://{runtime_api}/2020-01-01/extension/")
            .parse()
            .map_err(|_| ExtensionError::InvalidAddress(runtime_api.to_owned()))?;

        let client = Client::builder().pool_idle_timeout(None).build()?;

        Ok(Self {
            base_url,
            client,
            extension_id: None,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ExtensionError> {
        self.base_url
            .join(path)
            .map_err(|_| ExtensionError::InvalidAddress(self.base_url.to_string()))
    }

    /// Returns the identifier assigned at registration.
    pub fn extension_id(&self) -> Option<&str> {
        self.extension_id.as_deref()
    }

    /// Registers the extension for `INVOKE` and `SHUTDOWN` events.
    pub async fn register(&mut self, name: &str) -> Result<RegisterResponse, ExtensionError> {
        let url = self.url("register")?;
        apm_lambda_log::debug!("registering extension {name} on {url}");

        let body = HashMap::from([("events", ["INVOKE", "SHUTDOWN"])]);
        let response = self
            .client
            .post(url)
            .header(EXTENSION_NAME_HEADER, name)
            .json(&body)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ExtensionError::Status(response.status()));
        }

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .filter(|h| !h.is_empty())
            .map(str::to_owned)
            .ok_or(ExtensionError::MissingIdentifier)?;

        let register = response.json().await?;
        self.extension_id = Some(extension_id);

        Ok(register)
    }

    /// Blocks until the next lifecycle event arrives.
    pub async fn next_event(&self) -> Result<NextEventResponse, ExtensionError> {
        let extension_id = self.extension_id().ok_or(ExtensionError::NotRegistered)?;

        let response = self
            .client
            .get(self.url("event/next")?)
            .header(EXTENSION_ID_HEADER, extension_id)
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(ExtensionError::Status(response.status()));
        }

        Ok(response.json().await?)
    }

    /// Reports a failed initialization to the runtime, which then restarts the environment.
    pub async fn init_error(&self, error_type: &str) -> Result<String, ExtensionError> {
        self.report_error("init/error", error_type).await
    }

    /// Reports an error before exiting the extension.
    pub async fn exit_error(&self, error_type: &str) -> Result<String, ExtensionError> {
        self.report_error("exit/error", error_type).await
    }

    async fn report_error(&self, path: &str, error_type: &str) -> Result<String, ExtensionError> {
        let mut request = self
            .client
            .post(self.url(path)?)
            .header(EXTENSION_ERROR_TYPE_HEADER, error_type);

        if let Some(extension_id) = self.extension_id() {
            request = request.header(EXTENSION_ID_HEADER, extension_id);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ExtensionError::Status(response.status()));
        }

        let status: StatusResponse = response.json().await?;
        Ok(status.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invoke() {
        let json = r#"{
            "eventType": "INVOKE",
            "deadlineMs": 676051,
            "requestId": "3da1f2dc-3222-475e-9205-e2e6c6318895",
            "invokedFunctionArn": "arn:aws:lambda:us-east-1:123456789012:function:ExtensionTest",
            "tracing": {
                "type": "X-Amzn-Trace-Id",
                "value": "Root=1-5f35ae12-0c0fec141ab77a00bc047aa2;Parent=2be948a625588e32;Sampled=1"
            }
        }"#;

        let NextEventResponse::Invoke(invoke) = serde_json::from_str(json).unwrap() else {
            panic!("expected invoke");
        };

        assert_eq!(invoke.deadline_ms, 676051);
        assert_eq!(invoke.request_id, "3da1f2dc-3222-475e-9205-e2e6c6318895");
        assert_eq!(invoke.tracing.unwrap().ty, "X-Amzn-Trace-Id");
    }

    #[test]
    fn test_parse_shutdown() {
        let json = r#"{"eventType": "SHUTDOWN", "shutdownReason": "timeout", "deadlineMs": 42069}"#;
        let event: NextEventResponse = serde_json::from_str(json).unwrap();

        assert_eq!(event.deadline_ms(), 42069);
        let NextEventResponse::Shutdown(shutdown) = event else {
            panic!("expected shutdown");
        };
        assert_eq!(shutdown.shutdown_reason, "timeout");
    }

    #[test]
    fn test_invalid_address() {
        assert!(matches!(
            ExtensionClient::new("not a host"),
            Err(ExtensionError::InvalidAddress(_))
        ));
    }
}
