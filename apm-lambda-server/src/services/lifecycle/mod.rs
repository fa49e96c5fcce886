//! Correlation of platform log events with invocations.
//!
//! The runtime pushes log events to the log listener, which forwards them to the [`Correlator`].
//! For every invocation, the correlator finalizes the accumulated data once the runtime reports
//! completion, turns the platform report into a metricset, and wraps function output into log
//! documents.

use std::collections::HashMap;
use std::sync::Arc;

use apm_lambda_aws_extension::{LogEvent, LogEventType, LogRecord, PlatformMetrics};
use apm_lambda_log::LogError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::accumulator::{Batch, TelemetryUnit};
use crate::services::transport::Transport;

mod documents;

pub use self::documents::*;

/// An error correlating a log event.
#[derive(Debug, thiserror::Error)]
pub enum CorrelatorError {
    /// No invocation is tracked under the request id.
    #[error("no lifecycle entry for invocation {0}")]
    NotFound(String),
}

/// What the correlator remembers about an invocation until its platform report arrives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEntry {
    /// The host-assigned request id.
    pub request_id: String,
    /// The ARN of the invoked function.
    pub function_arn: String,
    /// The deadline of the execution in Unix milliseconds.
    pub deadline_ms: i64,
    /// When the extension received the invocation.
    pub timestamp: DateTime<Utc>,
}

/// How [`Correlator::process_logs`] decides to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessMode {
    /// Stop at the `platform.runtimeDone` of the current invocation.
    Invocation,
    /// Stop once the platform reports of all tracked invocations were processed.
    ShutdownDrain,
}

/// Associates platform log events with tracked invocations.
#[derive(Debug)]
pub struct Correlator {
    entries: Mutex<HashMap<String, LifecycleEntry>>,
    active: Mutex<Option<String>>,
    events: AsyncMutex<mpsc::Receiver<LogEvent>>,
    batch: Arc<Batch>,
    transport: Arc<Transport>,
    collect_function_logs: bool,
}

impl Correlator {
    /// Creates a correlator that consumes `events`.
    pub fn new(
        events: mpsc::Receiver<LogEvent>,
        transport: Arc<Transport>,
        collect_function_logs: bool,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            events: AsyncMutex::new(events),
            batch: Arc::clone(transport.batch()),
            transport,
            collect_function_logs,
        }
    }

    /// Starts tracking an invocation announced by the Extensions API.
    pub fn register(&self, entry: LifecycleEntry) {
        self.entries.lock().insert(entry.request_id.clone(), entry);
    }

    /// Handles `platform.start` and marks the invocation as the origin of function output.
    pub fn on_platform_start(&self, request_id: &str, time: DateTime<Utc>) {
        self.entries
            .lock()
            .entry(request_id.to_owned())
            .or_insert_with(|| LifecycleEntry {
                request_id: request_id.to_owned(),
                function_arn: String::new(),
                deadline_ms: 0,
                timestamp: time,
            });

        *self.active.lock() = Some(request_id.to_owned());
    }

    /// Handles `platform.runtimeDone` by recording the status and finalizing the invocation.
    ///
    /// Finalization errors of the batch are logged. Fails if the invocation is not tracked.
    pub fn on_runtime_done(
        &self,
        request_id: &str,
        status: &str,
        time: DateTime<Utc>,
    ) -> Result<(), CorrelatorError> {
        if !self.entries.lock().contains_key(request_id) {
            return Err(CorrelatorError::NotFound(request_id.to_owned()));
        }

        let result = self
            .batch
            .record_runtime_status(request_id, status)
            .and_then(|()| {
                self.batch
                    .finalize_invocation(request_id, status, time, None)
            });

        if let Err(error) = result {
            apm_lambda_log::warn!(
                request_id,
                "failed to finalize invocation: {}",
                LogError(&error)
            );
        }

        Ok(())
    }

    /// Handles `platform.report` and stops tracking the invocation.
    ///
    /// Returns the entry the metricset is derived from.
    pub fn on_platform_report(&self, request_id: &str) -> Result<LifecycleEntry, CorrelatorError> {
        let entry = self
            .entries
            .lock()
            .remove(request_id)
            .ok_or_else(|| CorrelatorError::NotFound(request_id.to_owned()))?;

        let mut active = self.active.lock();
        if active.as_deref() == Some(request_id) {
            *active = None;
        }

        Ok(entry)
    }

    /// Returns the number of tracked invocations.
    pub fn size(&self) -> usize {
        self.entries.lock().len()
    }

    fn handle_report(
        &self,
        request_id: &str,
        metrics: Option<&PlatformMetrics>,
        time: DateTime<Utc>,
    ) {
        let entry = match self.on_platform_report(request_id) {
            Ok(entry) => entry,
            Err(error) => {
                apm_lambda_log::warn!("ignoring platform report: {}", LogError(&error));
                return;
            }
        };

        let Some(metrics) = metrics else {
            apm_lambda_log::debug!(request_id, "platform report without metrics");
            return;
        };

        // Still tracked if the runtime did not report completion.
        match self
            .batch
            .finalize_invocation(request_id, "success", time, Some(metrics))
        {
            Ok(()) => apm_lambda_log::debug!(request_id, "finalized invocation on report"),
            Err(error) if error.is_not_found() => (),
            Err(error) => {
                apm_lambda_log::warn!("failed to finalize invocation: {}", LogError(&error))
            }
        }

        match metricset(&entry, metrics, time) {
            Ok(data) => {
                self.transport.enqueue(TelemetryUnit::platform(data));
            }
            Err(error) => {
                apm_lambda_log::warn!("failed to serialize metricset: {}", LogError(&error))
            }
        }
    }

    fn handle_function_log(&self, message: &str, time: DateTime<Utc>, fallback_id: &str) {
        let request_id = self
            .active
            .lock()
            .clone()
            .unwrap_or_else(|| fallback_id.to_owned());

        let function_arn = self
            .entries
            .lock()
            .get(&request_id)
            .map(|entry| entry.function_arn.clone())
            .unwrap_or_default();

        match log_document(message, time, &request_id, &function_arn) {
            Ok(data) => {
                self.transport.enqueue(TelemetryUnit::platform(data));
            }
            Err(error) => {
                apm_lambda_log::warn!("failed to serialize log document: {}", LogError(&error))
            }
        }
    }

    /// Handles a single event. Returns `true` if processing should stop.
    fn handle_event(&self, event: LogEvent, request_id: &str, mode: ProcessMode) -> bool {
        match event.ty {
            LogEventType::PlatformStart => {
                if let Some(id) = event.request_id() {
                    self.on_platform_start(id, event.time);
                }
            }
            LogEventType::PlatformRuntimeDone => {
                let Some(record) = event.record.as_platform() else {
                    return false;
                };

                let status = record.status.as_deref().unwrap_or("success");
                apm_lambda_log::debug!(request_id = record.request_id, status, "runtime done");

                if let Err(error) = self.on_runtime_done(&record.request_id, status, event.time) {
                    apm_lambda_log::warn!("{}", LogError(&error));
                }

                if mode == ProcessMode::Invocation && record.request_id == request_id {
                    return true;
                }
            }
            LogEventType::PlatformReport => {
                let Some(record) = event.record.as_platform() else {
                    return false;
                };

                self.handle_report(&record.request_id, record.metrics.as_ref(), event.time);

                if mode == ProcessMode::ShutdownDrain && self.size() == 0 {
                    return true;
                }
            }
            LogEventType::PlatformLogsDropped => {
                apm_lambda_log::warn!(
                    "logs were dropped by the runtime: {:?}",
                    event.record
                );
            }
            LogEventType::Function if self.collect_function_logs => {
                if let LogRecord::Raw(message) = &event.record {
                    self.handle_function_log(message, event.time, request_id);
                }
            }
            _ => (),
        }

        false
    }

    /// Consumes log events until the invocation `request_id` is complete or `token` is cancelled.
    ///
    /// In [`ProcessMode::Invocation`], processing stops at the `platform.runtimeDone` event of
    /// `request_id`. In [`ProcessMode::ShutdownDrain`], it stops once all tracked invocations
    /// received their platform report. Returns `true` if the stop condition was reached.
    pub async fn process_logs(
        &self,
        token: CancellationToken,
        request_id: &str,
        mode: ProcessMode,
    ) -> bool {
        if mode == ProcessMode::ShutdownDrain && self.size() == 0 {
            return true;
        }

        let mut events = self.events.lock().await;

        loop {
            let event = tokio::select! {
                biased;

                _ = token.cancelled() => return false,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => return false,
                },
            };

            if self.handle_event(event, request_id, mode) {
                return true;
            }
        }
    }
}
