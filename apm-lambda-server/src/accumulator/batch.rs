use std::collections::HashMap;
use std::time::Duration;

use apm_lambda_aws_extension::PlatformMetrics;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::accumulator::{DecodeError, Invocation, TelemetryUnit, is_transaction_event};

/// Errors raised by [`Batch`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// No invocation is tracked under this request id.
    #[error("invocation {0} does not exist")]
    NotFound(String),
    /// No invocation has been registered yet.
    #[error("no invocation is currently active")]
    NoCurrentInvocation,
    /// The batch reached its maximum size.
    #[error("batch is full")]
    Full,
    /// No agent payload has been received yet, so lines cannot be shipped.
    #[error("metadata is not yet available")]
    MetadataUnavailable,
    /// An agent payload could not be decompressed.
    #[error("failed to decode agent payload")]
    Decode(#[from] DecodeError),
    /// A payload does not contain the expected document.
    #[error("invalid payload")]
    InvalidPayload(#[source] serde_json::Error),
    /// A transaction registration does not contain a transaction.
    #[error("payload does not contain a transaction")]
    MissingTransaction,
}

impl BatchError {
    /// Returns `true` if the error refers to an unknown invocation.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NoCurrentInvocation)
    }
}

#[derive(Debug, Default)]
struct BatchInner {
    /// Length of the metadata line at the start of `buffer`, `None` until the first agent payload.
    metadata_len: Option<usize>,
    buffer: Vec<u8>,
    invocations: HashMap<String, Invocation>,
    current: Option<String>,
    count: usize,
    age: Option<Instant>,
}

impl BatchInner {
    fn current_mut(&mut self) -> Result<&mut Invocation, BatchError> {
        let id = self.current.as_ref().ok_or(BatchError::NoCurrentInvocation)?;
        self.invocations
            .get_mut(id)
            .ok_or_else(|| BatchError::NotFound(id.clone()))
    }

    fn set_metadata(&mut self, line: &[u8]) {
        if self.metadata_len.is_none() {
            self.buffer.extend_from_slice(line);
            self.metadata_len = Some(line.len());
        }
    }

    fn push_line(&mut self, line: &[u8]) {
        if self.count == 0 {
            self.age = Some(Instant::now());
        }

        self.buffer.push(b'\n');
        self.buffer.extend_from_slice(line);
        self.count += 1;
    }

    fn reset(&mut self) {
        self.buffer.truncate(self.metadata_len.unwrap_or(0));
        self.count = 0;
        self.age = None;
    }

    fn finalize(
        &mut self,
        request_id: &str,
        status_hint: &str,
        end: DateTime<Utc>,
        metrics: Option<&PlatformMetrics>,
    ) -> Result<(), BatchError> {
        let invocation = self
            .invocations
            .remove(request_id)
            .ok_or_else(|| BatchError::NotFound(request_id.to_owned()))?;

        let status = invocation.status.clone();
        let status = status.as_deref().unwrap_or(status_hint);
        let lines = invocation
            .finalize(status, end, metrics)
            .map_err(BatchError::InvalidPayload)?;

        if lines.is_empty() {
            return Ok(());
        }

        if self.metadata_len.is_none() {
            return Err(BatchError::MetadataUnavailable);
        }

        for line in &lines {
            self.push_line(line);
        }

        Ok(())
    }
}

/// Accumulates telemetry of all tracked invocations into one shippable NDJSON buffer.
///
/// The buffer always starts with the metadata line of the first agent payload. Agent lines are
/// held on their invocation until it is finalized. Platform lines are appended directly. All
/// operations lock the batch as a whole.
#[derive(Debug)]
pub struct Batch {
    inner: Mutex<BatchInner>,
    max_size: usize,
    max_age: Duration,
}

impl Batch {
    /// Creates an empty batch.
    ///
    /// `max_size` is clamped to at least one line.
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(BatchInner::default()),
            max_size: max_size.max(1),
            max_age,
        }
    }

    /// Tracks a new invocation and makes it the current one.
    ///
    /// An invocation with the same request id is replaced.
    pub fn register_invocation(
        &self,
        request_id: &str,
        function_arn: &str,
        deadline_ms: i64,
        timestamp: DateTime<Utc>,
    ) {
        let invocation = Invocation::new(
            request_id.to_owned(),
            function_arn.to_owned(),
            deadline_ms,
            timestamp,
        );

        let mut inner = self.inner.lock();
        inner.invocations.insert(request_id.to_owned(), invocation);
        inner.current = Some(request_id.to_owned());
    }

    /// Attaches the transaction registered by the agent to the current invocation.
    ///
    /// The payload is NDJSON as sent by the agent. The first `transaction` line is used. Fails
    /// with [`BatchError::NotFound`] if `request_id` is not the current invocation. Returns the
    /// transaction id.
    pub fn record_transaction_intent(
        &self,
        request_id: &str,
        payload: &[u8],
    ) -> Result<String, BatchError> {
        let line = payload
            .split(|&b| b == b'\n')
            .find(|line| is_transaction_event(line))
            .ok_or(BatchError::MissingTransaction)?;

        let mut document: Map<String, Value> =
            serde_json::from_slice(line).map_err(BatchError::InvalidPayload)?;
        let Some(Value::Object(transaction)) = document.remove("transaction") else {
            return Err(BatchError::MissingTransaction);
        };

        let mut inner = self.inner.lock();
        if inner.current.as_deref() != Some(request_id) {
            return Err(match inner.current {
                Some(_) => BatchError::NotFound(request_id.to_owned()),
                None => BatchError::NoCurrentInvocation,
            });
        }

        let invocation = inner.current_mut()?;
        invocation.set_transaction(transaction);
        Ok(invocation.transaction_id.clone())
    }

    /// Records the completion status the runtime reported for an invocation.
    pub fn record_runtime_status(&self, request_id: &str, status: &str) -> Result<(), BatchError> {
        let mut inner = self.inner.lock();
        let invocation = inner
            .invocations
            .get_mut(request_id)
            .ok_or_else(|| BatchError::NotFound(request_id.to_owned()))?;

        invocation.status = Some(status.to_owned());
        Ok(())
    }

    /// Adds an agent payload to the current invocation.
    ///
    /// Every agent payload starts with a metadata line. The first one received becomes the
    /// metadata of the batch, later ones are skipped. All other non-empty lines are held on the
    /// current invocation until it is finalized.
    pub fn ingest_agent_payload(&self, unit: &TelemetryUnit) -> Result<(), BatchError> {
        let decoded = unit.decode()?;
        let mut lines = decoded
            .split(|&b| b == b'\n')
            .filter(|line| !line.trim_ascii().is_empty());

        let Some(metadata) = lines.next() else {
            return Ok(());
        };

        let mut inner = self.inner.lock();
        inner.set_metadata(metadata);

        let invocation = inner.current_mut()?;
        for line in lines {
            invocation.push_line(line);
        }

        Ok(())
    }

    /// Appends a line synthesized from platform data to the shippable buffer.
    pub fn add_platform_line(&self, line: &[u8]) -> Result<(), BatchError> {
        let mut inner = self.inner.lock();

        if inner.count >= self.max_size {
            return Err(BatchError::Full);
        }

        if inner.metadata_len.is_none() {
            return Err(BatchError::MetadataUnavailable);
        }

        inner.push_line(line);
        Ok(())
    }

    /// Moves all lines of an invocation into the shippable buffer and stops tracking it.
    ///
    /// If the agent announced a transaction that it never reported, a proxy transaction is added.
    /// Its result is the status recorded with [`record_runtime_status`](Self::record_runtime_status),
    /// or `status` if none was recorded. With `metrics`, the root transaction is enriched with
    /// platform metrics. Finalizing an unknown or already finalized invocation fails with
    /// [`BatchError::NotFound`].
    pub fn finalize_invocation(
        &self,
        request_id: &str,
        status: &str,
        end: DateTime<Utc>,
        metrics: Option<&PlatformMetrics>,
    ) -> Result<(), BatchError> {
        self.inner.lock().finalize(request_id, status, end, metrics)
    }

    /// Finalizes every tracked invocation without platform metrics.
    ///
    /// Returns the number of finalized invocations. The first error is returned after all
    /// invocations have been processed.
    pub fn drain_all(&self, status: &str, end: DateTime<Utc>) -> Result<usize, BatchError> {
        let mut inner = self.inner.lock();
        let ids: Vec<String> = inner.invocations.keys().cloned().collect();

        let mut result = Ok(ids.len());
        for id in ids {
            if let Err(error) = inner.finalize(&id, status, end, None) {
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }

        inner.current = None;
        result
    }

    /// Returns the number of lines in the shippable buffer, excluding metadata.
    pub fn line_count(&self) -> usize {
        self.inner.lock().count
    }

    /// Returns the number of tracked invocations.
    pub fn invocation_count(&self) -> usize {
        self.inner.lock().invocations.len()
    }

    /// Returns `true` once an agent payload supplied the metadata line.
    pub fn has_metadata(&self) -> bool {
        self.inner.lock().metadata_len.is_some()
    }

    /// Returns the request id of the current invocation.
    pub fn current_request_id(&self) -> Option<String> {
        self.inner.lock().current.clone()
    }

    /// Returns `true` if the batch should be sent.
    ///
    /// A batch is mature once it holds at least 90% of its capacity, or once its oldest line
    /// exceeds the maximum age.
    pub fn should_ship(&self) -> bool {
        let inner = self.inner.lock();
        self.is_mature(&inner)
    }

    fn is_mature(&self, inner: &BatchInner) -> bool {
        let threshold = (self.max_size * 9).div_ceil(10);
        inner.count >= threshold || inner.age.is_some_and(|age| age.elapsed() > self.max_age)
    }

    /// Drops all lines except the metadata.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    /// Returns a copy of the buffer including metadata.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().buffer)
    }

    /// Returns the buffer and resets the batch, or `None` if there are no lines.
    pub fn take(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            return None;
        }

        let data = Bytes::copy_from_slice(&inner.buffer);
        inner.reset();
        Some(data)
    }

    /// Like [`take`](Self::take), but only if the batch is mature.
    pub fn take_if_mature(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.count == 0 || !self.is_mature(&inner) {
            return None;
        }

        let data = Bytes::copy_from_slice(&inner.buffer);
        inner.reset();
        Some(data)
    }
}
