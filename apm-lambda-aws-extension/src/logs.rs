use reqwest::{Client, StatusCode};
use serde::Serialize;
use url::Url;

const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

/// The schema version requested in subscriptions.
pub const LOGS_SCHEMA_VERSION: &str = "2021-03-18";

/// Errors subscribing to the Logs API.
#[derive(Debug, thiserror::Error)]
pub enum LogsApiError {
    /// The runtime API address does not form a valid URL.
    #[error("invalid runtime API address '{0}'")]
    InvalidAddress(String),
    /// The request could not be sent.
    #[error("logs API request failed")]
    Request(#[from] reqwest::Error),
    /// The runtime accepted the request but does not support the Logs API.
    #[error("logs API is not supported in this environment")]
    Unsupported,
    /// The API answered with an error status.
    #[error("logs API subscription failed with status {status}: {body}")]
    Status {
        /// The response status.
        status: StatusCode,
        /// The response body, for diagnostics.
        body: String,
    },
}

/// A stream of logs the extension can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionType {
    /// Platform lifecycle and report events.
    Platform,
    /// Lines written by the function.
    Function,
    /// Lines written by extensions.
    Extension,
}

/// How the runtime buffers events before pushing them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Buffering {
    /// Maximum number of events buffered in memory.
    pub max_items: u32,
    /// Maximum size of buffered events in bytes.
    pub max_bytes: u32,
    /// Maximum time a batch is buffered in milliseconds.
    pub timeout_ms: u32,
}

/// Where the runtime pushes events to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Destination {
    /// Always `HTTP`.
    pub protocol: &'static str,
    /// The listener URI.
    #[serde(rename = "URI")]
    pub uri: String,
    /// Always `POST`.
    pub method: &'static str,
    /// Always `JSON`.
    pub encoding: &'static str,
}

impl Destination {
    /// Creates an HTTP destination posting JSON to `uri`.
    pub fn http(uri: impl Into<String>) -> Self {
        Self {
            protocol: "HTTP",
            uri: uri.into(),
            method: "POST",
            encoding: "JSON",
        }
    }
}

/// Body of the subscribe request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// The requested schema version.
    pub schema_version: &'static str,
    /// The subscribed streams.
    pub types: Vec<SubscriptionType>,
    /// Buffering of the runtime.
    pub buffering: Buffering,
    /// The push destination.
    pub destination: Destination,
}

/// Client for the Lambda [Logs API].
///
/// [Logs API]: https://docs.aws.amazon.com/lambda/latest/dg/runtimes-logs-api.html
#[derive(Debug)]
pub struct LogsApiClient {
    url: Url,
    client: Client,
}

impl LogsApiClient {
    /// Creates a client for the runtime API at `runtime_api`, given as `host:port`.
    pub fn new(runtime_api: &str) -> Result<Self, LogsApiError> {
        let url = format!("http://{runtime_api}/2020-08-15/logs")
            .parse()
            .map_err(|_| LogsApiError::InvalidAddress(runtime_api.to_owned()))?;

        Ok(Self {
            url,
            client: Client::builder().build()?,
        })
    }

    /// Subscribes the listener described by `request`.
    ///
    /// A `202 Accepted` response means the runtime does not support the Logs API and is reported
    /// as [`LogsApiError::Unsupported`].
    pub async fn subscribe(
        &self,
        extension_id: &str,
        request: &SubscribeRequest,
    ) -> Result<(), LogsApiError> {
        apm_lambda_log::debug!(
            "subscribing {} to logs API at {}",
            request.destination.uri,
            self.url
        );

        let response = self
            .client
            .put(self.url.clone())
            .header(EXTENSION_ID_HEADER, extension_id)
            .json(request)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::ACCEPTED => Err(LogsApiError::Unsupported),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(LogsApiError::Status { status, body })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_subscribe_request() {
        let request = SubscribeRequest {
            schema_version: LOGS_SCHEMA_VERSION,
            types: vec![SubscriptionType::Platform, SubscriptionType::Function],
            buffering: Buffering {
                max_items: 10000,
                max_bytes: 262144,
                timeout_ms: 25,
            },
            destination: Destination::http("http://sandbox.localdomain:8201"),
        };

        insta::assert_json_snapshot!(request, @r#"
        {
          "schemaVersion": "2021-03-18",
          "types": [
            "platform",
            "function"
          ],
          "buffering": {
            "maxItems": 10000,
            "maxBytes": 262144,
            "timeoutMs": 25
          },
          "destination": {
            "protocol": "HTTP",
            "URI": "http://sandbox.localdomain:8201",
            "method": "POST",
            "encoding": "JSON"
          }
        }
        "#);
    }
}
