use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use apm_lambda_log::{LogConfig, LogFormat, LogLevel};
use serde::{Deserialize, Serialize};

use crate::upstream::BackendUrl;

/// The host name under which the Lambda sandbox reaches the log listener.
pub const SANDBOX_HOSTNAME: &str = "sandbox.localdomain";

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(cause)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// Controls when accumulated data is sent to the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendStrategy {
    /// Data is sent in the background while the function runs and flushed at the start of the
    /// next invocation. Lower latency for the function, but data of the last invocation can be
    /// lost if the environment is frozen.
    Background,
    /// Accumulated data is flushed synchronously at the end of every invocation.
    #[default]
    SyncFlush,
}

impl std::str::FromStr for SendStrategy {
    type Err = ParseSendStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(Self::Background),
            "syncflush" => Ok(Self::SyncFlush),
            _ => Err(ParseSendStrategyError(s.to_owned())),
        }
    }
}

impl fmt::Display for SendStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Background => f.write_str("background"),
            Self::SyncFlush => f.write_str("syncflush"),
        }
    }
}

/// Error returned for unknown send strategies.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown send strategy '{0}', expected 'background' or 'syncflush'")]
pub struct ParseSendStrategyError(String);

/// Error returned for a batch size of zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("batch size must be at least 1")]
pub struct ZeroBatchSize;

/// Error returned for unparsable boolean overrides.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("expected a boolean, got '{0}'")]
pub struct ParseBoolError(String);

fn parse_bool(value: &str) -> Result<bool, ParseBoolError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ParseBoolError(value.to_owned())),
    }
}

/// Structure used to hold information about configuration overrides via CLI parameters or
/// environment variables.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The base URL of the telemetry backend.
    pub server_url: Option<String>,
    /// API key for the backend.
    pub api_key: Option<String>,
    /// Secret token for the backend.
    pub secret_token: Option<String>,
    /// `background` or `syncflush`.
    pub send_strategy: Option<String>,
    /// The port the agent intake listens on.
    pub receiver_port: Option<String>,
    /// Read timeout of the agent intake in seconds.
    pub receiver_timeout: Option<String>,
    /// Timeout of backend requests in seconds.
    pub forwarder_timeout: Option<String>,
    /// Whether platform and function logs are collected.
    pub logs_enabled: Option<String>,
    /// Whether function log lines are forwarded as log documents.
    pub function_logs: Option<String>,
    /// The log level of the extension.
    pub log_level: Option<String>,
    /// The log format of the extension.
    pub log_format: Option<String>,
    /// Maximum number of lines in a batch.
    pub batch_max_size: Option<String>,
    /// Maximum age of a batch in milliseconds.
    pub batch_max_age_ms: Option<String>,
    /// Host and port of the Lambda runtime API.
    pub runtime_api: Option<String>,
    /// The name under which the extension registers.
    pub extension_name: Option<String>,
}

/// Connection to the telemetry backend.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Server {
    /// The base URL of the backend.
    url: Option<BackendUrl>,
    /// API key, preferred over the secret token if both are set.
    api_key: Option<String>,
    /// Secret token.
    secret_token: Option<String>,
    /// Timeout of a single backend request in seconds.
    timeout: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            secret_token: None,
            timeout: 3,
        }
    }
}

/// The local intake that agents send data to.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Receiver {
    host: IpAddr,
    port: u16,
    /// Read timeout for agent requests in seconds.
    timeout: u64,
    /// Maximum accepted request body size in bytes.
    max_body_size: usize,
}

impl Default for Receiver {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8200,
            timeout: 15,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

/// Buffering settings sent with the Logs API subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LogsBuffering {
    /// Maximum number of events buffered by the runtime.
    pub max_items: u32,
    /// Maximum size of buffered events in bytes.
    pub max_bytes: u32,
    /// Maximum time events are buffered in milliseconds.
    pub timeout_ms: u32,
}

impl Default for LogsBuffering {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            max_bytes: 262_144,
            timeout_ms: 25,
        }
    }
}

/// Collection of platform and function logs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Logs {
    enabled: bool,
    host: IpAddr,
    /// Port of the log listener. `0` picks a free port.
    port: u16,
    collect_function_logs: bool,
    buffer_size: usize,
    subscription: LogsBuffering,
}

impl Default for Logs {
    fn default() -> Self {
        Self {
            enabled: true,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            collect_function_logs: false,
            buffer_size: 100,
            subscription: LogsBuffering::default(),
        }
    }
}

/// Batching of lines shipped to the backend.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Batch {
    max_size: usize,
    max_age_ms: u64,
}

impl Default for Batch {
    fn default() -> Self {
        Self {
            max_size: 50,
            max_age_ms: 2000,
        }
    }
}

/// Queues between the intake, the log correlator and the transport.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Transport {
    agent_buffer: usize,
    platform_buffer: usize,
    send_strategy: SendStrategy,
}

impl Default for Transport {
    fn default() -> Self {
        Self {
            agent_buffer: 100,
            platform_buffer: 100,
            send_strategy: SendStrategy::default(),
        }
    }
}

/// Registration with the Lambda runtime.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Extension {
    name: String,
    runtime_api: Option<String>,
    /// Time reserved before the invocation deadline to flush data, in milliseconds.
    flush_margin_ms: u64,
    /// Upper bound for the final flush at shutdown, in seconds.
    shutdown_flush_timeout: u64,
}

impl Default for Extension {
    fn default() -> Self {
        Self {
            name: "apm-lambda-extension".to_owned(),
            runtime_api: None,
            flush_margin_ms: 100,
            shutdown_flush_timeout: 5,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct ConfigValues {
    #[serde(default)]
    server: Server,
    #[serde(default)]
    receiver: Receiver,
    #[serde(default)]
    logs: Logs,
    #[serde(default)]
    batch: Batch,
    #[serde(default)]
    transport: Transport,
    #[serde(default)]
    extension: Extension,
    #[serde(default)]
    logging: LogConfig,
}

/// Config struct.
#[derive(Clone, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("server_url", &self.values.server.url)
            .field("receiver", &self.values.receiver)
            .field("logs", &self.values.logs)
            .field("batch", &self.values.batch)
            .field("transport", &self.values.transport)
            .field("extension", &self.values.extension)
            .field("logging", &self.values.logging)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Loads a config from a YAML file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;

        let values = serde_yaml::from_reader(io::BufReader::new(file))
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path))?;

        Ok(Config {
            values,
            path: path.to_path_buf(),
        })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let server = &mut self.values.server;

        if let Some(url) = overrides.server_url.filter(|s| !s.is_empty()) {
            server.url = Some(
                url.parse::<BackendUrl>()
                    .map_err(|err| ConfigError::for_field(err, "server_url"))?,
            );
        }

        if let Some(api_key) = overrides.api_key.filter(|s| !s.is_empty()) {
            server.api_key = Some(api_key);
        }

        if let Some(secret_token) = overrides.secret_token.filter(|s| !s.is_empty()) {
            server.secret_token = Some(secret_token);
        }

        if let Some(timeout) = overrides.forwarder_timeout {
            server.timeout = timeout
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "forwarder_timeout"))?;
        }

        let receiver = &mut self.values.receiver;

        if let Some(port) = overrides.receiver_port {
            receiver.port = port
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "receiver_port"))?;
        }

        if let Some(timeout) = overrides.receiver_timeout {
            receiver.timeout = timeout
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "receiver_timeout"))?;
        }

        let logs = &mut self.values.logs;

        if let Some(enabled) = overrides.logs_enabled {
            logs.enabled =
                parse_bool(&enabled).map_err(|err| ConfigError::for_field(err, "logs_enabled"))?;
        }

        if let Some(enabled) = overrides.function_logs {
            logs.collect_function_logs = parse_bool(&enabled)
                .map_err(|err| ConfigError::for_field(err, "function_logs"))?;
        }

        let batch = &mut self.values.batch;

        if let Some(max_size) = overrides.batch_max_size {
            let max_size: usize = max_size
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "batch_max_size"))?;
            if max_size == 0 {
                return Err(ConfigError::for_field(ZeroBatchSize, "batch_max_size"));
            }
            batch.max_size = max_size;
        }

        if let Some(max_age) = overrides.batch_max_age_ms {
            batch.max_age_ms = max_age
                .trim()
                .parse()
                .map_err(|err| ConfigError::for_field(err, "batch_max_age_ms"))?;
        }

        if let Some(strategy) = overrides.send_strategy {
            self.values.transport.send_strategy = strategy
                .parse()
                .map_err(|err| ConfigError::for_field(err, "send_strategy"))?;
        }

        let extension = &mut self.values.extension;

        if let Some(runtime_api) = overrides.runtime_api.filter(|s| !s.is_empty()) {
            extension.runtime_api = Some(runtime_api);
        }

        if let Some(name) = overrides.extension_name.filter(|s| !s.is_empty()) {
            extension.name = name;
        }

        let logging = &mut self.values.logging;

        if let Some(level) = overrides.log_level {
            logging.level = level
                .parse::<LogLevel>()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        if let Some(format) = overrides.log_format {
            logging.format = format
                .parse::<LogFormat>()
                .map_err(|err| ConfigError::for_field(err, "log_format"))?;
        }

        Ok(self)
    }

    /// Returns the path of the loaded config file, empty if none was loaded.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the base URL of the telemetry backend.
    pub fn server_url(&self) -> Option<&BackendUrl> {
        self.values.server.url.as_ref()
    }

    /// Returns the API key for the backend.
    pub fn api_key(&self) -> Option<&str> {
        self.values.server.api_key.as_deref()
    }

    /// Returns the secret token for the backend.
    pub fn secret_token(&self) -> Option<&str> {
        self.values.server.secret_token.as_deref()
    }

    /// Returns the `Authorization` header value for backend requests.
    ///
    /// The API key takes precedence over the secret token.
    pub fn authorization(&self) -> Option<String> {
        if let Some(api_key) = self.api_key() {
            Some(format!("ApiKey {api_key}"))
        } else {
            self.secret_token().map(|token| format!("Bearer {token}"))
        }
    }

    /// Returns the timeout of a single backend request.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.values.server.timeout)
    }

    /// Returns the socket address of the agent intake.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.values.receiver.host, self.values.receiver.port)
    }

    /// Returns the read timeout for agent requests.
    pub fn receiver_timeout(&self) -> Duration {
        Duration::from_secs(self.values.receiver.timeout)
    }

    /// Returns the maximum accepted request body size on the intake.
    pub fn max_body_size(&self) -> usize {
        self.values.receiver.max_body_size
    }

    /// Returns `true` if platform logs are collected.
    pub fn logs_enabled(&self) -> bool {
        self.values.logs.enabled
    }

    /// Returns the socket address of the log listener.
    pub fn logs_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.values.logs.host, self.values.logs.port)
    }

    /// Returns `true` if function log lines are forwarded.
    pub fn collect_function_logs(&self) -> bool {
        self.values.logs.collect_function_logs
    }

    /// Returns the capacity of the log event channel.
    pub fn logs_buffer_size(&self) -> usize {
        self.values.logs.buffer_size.max(1)
    }

    /// Returns the buffering requested in the Logs API subscription.
    pub fn logs_buffering(&self) -> LogsBuffering {
        self.values.logs.subscription
    }

    /// Returns the maximum number of lines in a batch.
    pub fn batch_max_size(&self) -> usize {
        self.values.batch.max_size
    }

    /// Returns the age after which a batch is shipped regardless of its size.
    pub fn batch_max_age(&self) -> Duration {
        Duration::from_millis(self.values.batch.max_age_ms)
    }

    /// Returns the capacity of the agent data queue.
    pub fn agent_buffer_size(&self) -> usize {
        self.values.transport.agent_buffer.max(1)
    }

    /// Returns the capacity of the platform data queue.
    pub fn platform_buffer_size(&self) -> usize {
        self.values.transport.platform_buffer.max(1)
    }

    /// Returns the configured send strategy.
    pub fn send_strategy(&self) -> SendStrategy {
        self.values.transport.send_strategy
    }

    /// Returns the name under which the extension registers.
    pub fn extension_name(&self) -> &str {
        &self.values.extension.name
    }

    /// Returns the address of the Lambda runtime API.
    pub fn runtime_api(&self) -> Option<&str> {
        self.values.extension.runtime_api.as_deref()
    }

    /// Returns the time reserved before an invocation's deadline.
    pub fn flush_margin(&self) -> Duration {
        Duration::from_millis(self.values.extension.flush_margin_ms)
    }

    /// Returns the upper bound of the final flush at shutdown.
    pub fn shutdown_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.values.extension.shutdown_flush_timeout)
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.listen_addr().port(), 8200);
        assert_eq!(config.batch_max_size(), 50);
        assert_eq!(config.batch_max_age(), Duration::from_secs(2));
        assert_eq!(config.upstream_timeout(), Duration::from_secs(3));
        assert_eq!(config.receiver_timeout(), Duration::from_secs(15));
        assert_eq!(config.send_strategy(), SendStrategy::SyncFlush);
        assert_eq!(config.flush_margin(), Duration::from_millis(100));
        assert_eq!(config.logs_buffering().max_items, 10_000);
        assert!(config.logs_enabled());
        assert!(config.server_url().is_none());
        assert!(config.authorization().is_none());
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "server:\n  url: http://localhost:8200\n  secret_token: abc\nbatch:\n  max_size: 10\ntransport:\n  send_strategy: background"
        )
        .unwrap();

        let config = Config::from_path(file.path()).unwrap();

        similar_asserts::assert_eq!(
            config.server_url().map(|u| u.to_string()),
            Some("http://localhost:8200/".to_owned())
        );
        assert_eq!(config.batch_max_size(), 10);
        assert_eq!(config.send_strategy(), SendStrategy::Background);
        assert_eq!(config.authorization().as_deref(), Some("Bearer abc"));
        assert_eq!(config.path(), file.path());
    }

    #[test]
    fn test_bad_yaml_reports_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "batch: [").unwrap();

        let error = Config::from_path(file.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.to_string().contains("(file "));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_missing_file() {
        let error = Config::from_path("/does/not/exist.yml").unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::CouldNotOpenFile);
    }

    #[test]
    fn test_apply_override() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                server_url: Some("https://apm.example.com".to_owned()),
                api_key: Some("key".to_owned()),
                secret_token: Some("token".to_owned()),
                send_strategy: Some("Background".to_owned()),
                batch_max_size: Some("5".to_owned()),
                logs_enabled: Some("false".to_owned()),
                log_level: Some("warning".to_owned()),
                runtime_api: Some("127.0.0.1:9001".to_owned()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.authorization().as_deref(), Some("ApiKey key"));
        assert_eq!(config.send_strategy(), SendStrategy::Background);
        assert_eq!(config.batch_max_size(), 5);
        assert!(!config.logs_enabled());
        assert_eq!(config.logging().level, LogLevel::Warn);
        assert_eq!(config.runtime_api(), Some("127.0.0.1:9001"));
    }

    #[test]
    fn test_empty_overrides_are_ignored() {
        let mut config = Config::from_json_value(serde_json::json!({
            "server": {"url": "http://localhost:8200", "api_key": "key"}
        }))
        .unwrap();

        config
            .apply_override(OverridableConfig {
                server_url: Some(String::new()),
                api_key: Some(String::new()),
                ..Default::default()
            })
            .unwrap();

        assert!(config.server_url().is_some());
        assert_eq!(config.api_key(), Some("key"));
    }

    #[test]
    fn test_invalid_override_names_field() {
        let mut config = Config::default();
        let error = config
            .apply_override(OverridableConfig {
                batch_max_size: Some("0".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        insta::assert_snapshot!(error.to_string(), @"invalid config value (field batch_max_size)");

        let error = config
            .apply_override(OverridableConfig {
                send_strategy: Some("eventually".to_owned()),
                ..Default::default()
            })
            .unwrap_err();
        insta::assert_snapshot!(error.to_string(), @"invalid config value (field send_strategy)");
    }
}
