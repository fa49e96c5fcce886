use apm_lambda_aws_extension::PlatformMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::accumulator::function_timeout_ms;
use crate::services::lifecycle::LifecycleEntry;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Serialize)]
struct Faas<'a> {
    execution: &'a str,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    coldstart: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Sample {
    value: f64,
}

#[derive(Debug, Serialize)]
struct Samples {
    #[serde(rename = "faas.coldstart_duration")]
    coldstart_duration: Sample,
    #[serde(rename = "faas.timeout")]
    timeout: Sample,
    #[serde(rename = "system.memory.total")]
    memory_total: Sample,
    #[serde(rename = "system.memory.actual.free")]
    memory_free: Sample,
    #[serde(rename = "faas.duration")]
    duration: Sample,
    #[serde(rename = "faas.billed_duration")]
    billed_duration: Sample,
}

#[derive(Debug, Serialize)]
struct Metricset<'a> {
    timestamp: i64,
    faas: Faas<'a>,
    samples: Samples,
}

#[derive(Debug, Serialize)]
struct MetricsetDocument<'a> {
    metricset: Metricset<'a>,
}

#[derive(Debug, Serialize)]
struct Log<'a> {
    message: &'a str,
    #[serde(rename = "@timestamp")]
    timestamp: i64,
    faas: Faas<'a>,
}

#[derive(Debug, Serialize)]
struct LogDocument<'a> {
    log: Log<'a>,
}

/// Builds the metricset of a `platform.report` event.
///
/// `time` is the time of the report event and becomes the timestamp in microseconds.
pub fn metricset(
    entry: &LifecycleEntry,
    metrics: &PlatformMetrics,
    time: DateTime<Utc>,
) -> Result<Vec<u8>, serde_json::Error> {
    let document = MetricsetDocument {
        metricset: Metricset {
            timestamp: time.timestamp_micros(),
            faas: Faas {
                execution: &entry.request_id,
                id: &entry.function_arn,
                coldstart: Some(metrics.init_duration_ms > 0.0),
            },
            samples: Samples {
                coldstart_duration: Sample {
                    value: metrics.init_duration_ms,
                },
                timeout: Sample {
                    value: function_timeout_ms(entry.deadline_ms, entry.timestamp),
                },
                memory_total: Sample {
                    value: metrics.memory_size_mb as f64 * BYTES_PER_MB,
                },
                memory_free: Sample {
                    value: (metrics.memory_size_mb - metrics.max_memory_used_mb) as f64
                        * BYTES_PER_MB,
                },
                duration: Sample {
                    value: metrics.duration_ms,
                },
                billed_duration: Sample {
                    value: metrics.billed_duration_ms as f64,
                },
            },
        },
    };

    serde_json::to_vec(&document)
}

/// Wraps a line written by the function into a log document.
pub fn log_document(
    message: &str,
    time: DateTime<Utc>,
    request_id: &str,
    function_arn: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let document = LogDocument {
        log: Log {
            message,
            timestamp: time.timestamp_micros(),
            faas: Faas {
                execution: request_id,
                id: function_arn,
                coldstart: None,
            },
        },
    };

    serde_json::to_vec(&document)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_metricset() {
        let timestamp = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let entry = LifecycleEntry {
            request_id: "req-1".to_owned(),
            function_arn: "arn:aws:lambda:us-east-1:1:function:hello".to_owned(),
            deadline_ms: 1_700_000_002_001,
            timestamp,
        };
        let metrics = PlatformMetrics {
            duration_ms: 101.51,
            billed_duration_ms: 102,
            memory_size_mb: 512,
            max_memory_used_mb: 33,
            init_duration_ms: 0.0,
        };

        let report_time = timestamp + chrono::Duration::milliseconds(120);
        let data = metricset(&entry, &metrics, report_time).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();

        insta::assert_json_snapshot!(value, @r#"
        {
          "metricset": {
            "faas": {
              "coldstart": false,
              "execution": "req-1",
              "id": "arn:aws:lambda:us-east-1:1:function:hello"
            },
            "samples": {
              "faas.billed_duration": {
                "value": 102.0
              },
              "faas.coldstart_duration": {
                "value": 0.0
              },
              "faas.duration": {
                "value": 101.51
              },
              "faas.timeout": {
                "value": 3000.0
              },
              "system.memory.actual.free": {
                "value": 502267904.0
              },
              "system.memory.total": {
                "value": 536870912.0
              }
            },
            "timestamp": 1700000000120000
          }
        }
        "#);
    }

    #[test]
    fn test_log_document() {
        let time = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let data = log_document("hello world\n", time, "req-1", "arn:fn").unwrap();

        similar_asserts::assert_eq!(
            String::from_utf8(data).unwrap(),
            r#"{"log":{"message":"hello world\n","@timestamp":1700000000123000,"faas":{"execution":"req-1","id":"arn:fn"}}}"#
        );
    }
}
