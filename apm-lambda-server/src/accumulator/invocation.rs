use apm_lambda_aws_extension::PlatformMetrics;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Returns `true` if the first key of an intake line is `transaction`.
///
/// Intake lines are single-key objects such as `{"transaction":{...}}`, so the event type can be
/// read without parsing the line.
pub fn is_transaction_event(line: &[u8]) -> bool {
    event_type(line) == Some(b"transaction".as_slice())
}

fn event_type(line: &[u8]) -> Option<&[u8]> {
    let start = line.iter().position(|&b| b == b'"' || b == b'\'')?;
    let quote = line[start];
    let key = &line[start + 1..];
    let end = key.iter().position(|&b| b == quote)?;
    Some(&key[..end])
}

/// Reads `transaction.id` from an intake line.
fn transaction_id(line: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(line).ok()?;
    value
        .get("transaction")?
        .get("id")?
        .as_str()
        .map(str::to_owned)
}

/// Returns the transaction timeout derived from the deadline.
///
/// Lambda timeouts are configured in whole seconds, so the remaining time at invocation start is
/// rounded up to the next second.
pub fn function_timeout_ms(deadline_ms: i64, timestamp: DateTime<Utc>) -> f64 {
    let remaining = (deadline_ms - timestamp.timestamp_millis()) as f64;
    (remaining / 1000.0).ceil() * 1000.0
}

/// Telemetry of a single function execution.
#[derive(Clone, Debug)]
pub struct Invocation {
    /// The host-assigned request id.
    pub request_id: String,
    /// The ARN of the invoked function.
    pub function_arn: String,
    /// The deadline of the execution in Unix milliseconds.
    pub deadline_ms: i64,
    /// When the extension received the invocation.
    pub timestamp: DateTime<Utc>,
    /// The id of the transaction the agent announced, empty if none.
    pub transaction_id: String,
    /// The trace id of the announced transaction.
    pub trace_id: String,
    /// Set once the agent reported the announced transaction.
    pub transaction_observed: bool,
    /// The completion status reported by the runtime.
    pub status: Option<String>,
    /// The announced transaction document, without the `transaction` wrapper.
    transaction: Option<Map<String, Value>>,
    /// Agent lines that are shipped when the invocation is finalized.
    pending: Vec<Vec<u8>>,
}

impl Invocation {
    /// Creates an invocation without any telemetry.
    pub fn new(
        request_id: String,
        function_arn: String,
        deadline_ms: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            function_arn,
            deadline_ms,
            timestamp,
            transaction_id: String::new(),
            trace_id: String::new(),
            transaction_observed: false,
            status: None,
            transaction: None,
            pending: Vec::new(),
        }
    }

    /// Attaches the transaction announced by the agent.
    pub(super) fn set_transaction(&mut self, transaction: Map<String, Value>) {
        let field = |name: &str| {
            transaction
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };

        self.transaction_id = field("id");
        self.trace_id = field("trace_id");
        self.transaction_observed = false;
        self.transaction = Some(transaction);
    }

    /// Returns `true` if finalization has to synthesize the announced transaction.
    pub fn needs_proxy_transaction(&self) -> bool {
        !self.transaction_id.is_empty() && !self.transaction_observed
    }

    /// Queues an agent line and records whether it is the announced transaction.
    pub(super) fn push_line(&mut self, line: &[u8]) {
        if self.needs_proxy_transaction()
            && is_transaction_event(line)
            && transaction_id(line).is_some_and(|id| id == self.transaction_id)
        {
            self.transaction_observed = true;
        }

        self.pending.push(line.to_vec());
    }

    /// Builds the transaction document for an announced but unreported transaction.
    ///
    /// The document keeps all fields the agent registered and sets the outcome from the runtime
    /// status. If the agent registered a start timestamp, the duration runs until `end`.
    pub fn proxy_transaction(
        &self,
        status: &str,
        end: DateTime<Utc>,
    ) -> Result<Vec<u8>, serde_json::Error> {
        let mut transaction = self.transaction.clone().unwrap_or_default();

        transaction.insert("id".to_owned(), json!(self.transaction_id));
        transaction.insert("trace_id".to_owned(), json!(self.trace_id));
        transaction.insert("result".to_owned(), json!(status));

        let outcome = if status == "success" {
            "success"
        } else {
            "failure"
        };
        transaction.insert("outcome".to_owned(), json!(outcome));

        if let Some(start_us) = transaction.get("timestamp").and_then(Value::as_i64) {
            let duration_ms = (end.timestamp_micros() - start_us).max(0) as f64 / 1000.0;
            transaction.insert("duration".to_owned(), json!(duration_ms));
        }

        serde_json::to_vec(&json!({ "transaction": transaction }))
    }

    /// Consumes the invocation and returns the lines to ship.
    ///
    /// Synthesizes the proxy transaction if required, and enriches the root transaction with
    /// platform metrics if given.
    pub(super) fn finalize(
        mut self,
        status: &str,
        end: DateTime<Utc>,
        metrics: Option<&PlatformMetrics>,
    ) -> Result<Vec<Vec<u8>>, serde_json::Error> {
        if self.needs_proxy_transaction() {
            let proxy = self.proxy_transaction(status, end)?;
            self.pending.push(proxy);
        }

        if let Some(metrics) = metrics {
            self.enrich(metrics)?;
        }

        Ok(self.pending)
    }

    fn enrich(&mut self, metrics: &PlatformMetrics) -> Result<(), serde_json::Error> {
        if self.transaction_id.is_empty() {
            return Ok(());
        }

        let Some(index) = self.pending.iter().position(|line| {
            is_transaction_event(line)
                && transaction_id(line).is_some_and(|id| id == self.transaction_id)
        }) else {
            return Ok(());
        };

        let mut document: Value = serde_json::from_slice(&self.pending[index])?;
        let Some(transaction) = document.get_mut("transaction").and_then(Value::as_object_mut)
        else {
            return Ok(());
        };

        transaction.insert(
            "faas".to_owned(),
            json!({
                "execution": self.request_id,
                "id": self.function_arn,
                "timeout": function_timeout_ms(self.deadline_ms, self.timestamp),
                "coldstart": metrics.init_duration_ms > 0.0,
                "duration": metrics.duration_ms,
                "billed_duration": metrics.billed_duration_ms,
                "coldstart_duration": metrics.init_duration_ms,
            }),
        );
        transaction.insert(
            "system".to_owned(),
            json!({
                "memory": {
                    "total": metrics.memory_size_mb as f64 * BYTES_PER_MB,
                    "actual": {
                        "free": (metrics.memory_size_mb - metrics.max_memory_used_mb) as f64 * BYTES_PER_MB,
                    },
                },
            }),
        );

        self.pending[index] = serde_json::to_vec(&document)?;
        Ok(())
    }
}
