use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// The type of a [`LogEvent`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum LogEventType {
    /// `platform.start`: the runtime started an invocation.
    PlatformStart,
    /// `platform.runtimeDone`: the runtime finished an invocation.
    PlatformRuntimeDone,
    /// `platform.report`: resource usage of a finished invocation.
    PlatformReport,
    /// `platform.logsDropped`: the Logs API dropped events.
    PlatformLogsDropped,
    /// `platform.fault`: the runtime or environment failed.
    PlatformFault,
    /// `platform.extension`: an extension registered.
    PlatformExtension,
    /// `platform.initStart`: the environment initialization started.
    PlatformInitStart,
    /// `function`: a line written by the function.
    Function,
    /// `extension`: a line written by an extension.
    Extension,
    /// Any type not known to this version.
    Other(String),
}

impl LogEventType {
    /// Returns the wire name of this type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::PlatformStart => "platform.start",
            Self::PlatformRuntimeDone => "platform.runtimeDone",
            Self::PlatformReport => "platform.report",
            Self::PlatformLogsDropped => "platform.logsDropped",
            Self::PlatformFault => "platform.fault",
            Self::PlatformExtension => "platform.extension",
            Self::PlatformInitStart => "platform.initStart",
            Self::Function => "function",
            Self::Extension => "extension",
            Self::Other(other) => other,
        }
    }
}

impl From<&str> for LogEventType {
    fn from(value: &str) -> Self {
        match value {
            "platform.start" => Self::PlatformStart,
            "platform.runtimeDone" => Self::PlatformRuntimeDone,
            "platform.report" => Self::PlatformReport,
            "platform.logsDropped" => Self::PlatformLogsDropped,
            "platform.fault" => Self::PlatformFault,
            "platform.extension" => Self::PlatformExtension,
            "platform.initStart" => Self::PlatformInitStart,
            "function" => Self::Function,
            "extension" => Self::Extension,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl<'de> Deserialize<'de> for LogEventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Ok(Self::from(value.as_ref()))
    }
}

impl Serialize for LogEventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Resource usage reported in `platform.report`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformMetrics {
    /// Wall time of the invocation in milliseconds.
    pub duration_ms: f64,
    /// Billed duration in milliseconds.
    pub billed_duration_ms: i64,
    /// Configured memory in MiB.
    #[serde(rename = "memorySizeMB")]
    pub memory_size_mb: i64,
    /// Peak memory usage in MiB.
    #[serde(rename = "maxMemoryUsedMB")]
    pub max_memory_used_mb: i64,
    /// Cold start initialization time in milliseconds, `0` on warm starts.
    pub init_duration_ms: f64,
}

/// The structured record of a platform event.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformRecord {
    /// The invocation the record belongs to.
    pub request_id: String,
    /// Completion status of `platform.runtimeDone`, for example `success` or `timeout`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Resource usage of `platform.report`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PlatformMetrics>,
}

/// The record of a [`LogEvent`].
///
/// Platform events carry a JSON object while function and extension lines carry a string. The
/// variant is decided once from the leading byte of the raw record.
#[derive(Clone, Debug, PartialEq)]
pub enum LogRecord {
    /// A JSON object record.
    Structured(PlatformRecord),
    /// A plain string record, or the raw JSON of a record that is neither object nor string.
    Raw(String),
}

impl LogRecord {
    /// Returns the structured record, if any.
    pub fn as_platform(&self) -> Option<&PlatformRecord> {
        match self {
            Self::Structured(record) => Some(record),
            Self::Raw(_) => None,
        }
    }

    fn from_raw(raw: &RawValue) -> Result<Self, serde_json::Error> {
        let text = raw.get();
        match text.trim_start().as_bytes().first() {
            Some(b'{') => serde_json::from_str(text).map(Self::Structured),
            Some(b'"') => serde_json::from_str(text).map(Self::Raw),
            _ => Ok(Self::Raw(text.to_owned())),
        }
    }
}

impl Default for LogRecord {
    fn default() -> Self {
        Self::Raw(String::new())
    }
}

impl<'de> Deserialize<'de> for LogRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <Box<RawValue>>::deserialize(deserializer)?;
        Self::from_raw(&raw).map_err(de::Error::custom)
    }
}

impl Serialize for LogRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Structured(record) => record.serialize(serializer),
            Self::Raw(line) => serializer.serialize_str(line),
        }
    }
}

/// An event pushed by the Logs API.
///
/// # Example
///
/// ```json
/// {
///     "time": "2020-08-20T12:31:32.123Z",
///     "type": "platform.runtimeDone",
///     "record": {"requestId": "6f7f0961f83442118a7af6fe80b88d56", "status": "success"}
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct LogEvent {
    /// When the event was emitted.
    pub time: DateTime<Utc>,
    /// The type of the event.
    #[serde(rename = "type")]
    pub ty: LogEventType,
    /// The payload of the event.
    #[serde(default)]
    pub record: LogRecord,
}

impl LogEvent {
    /// Returns the request id of a platform event.
    pub fn request_id(&self) -> Option<&str> {
        self.record.as_platform().map(|r| r.request_id.as_str())
    }
}
