//! Event protocol – the only channel from a running task to its host.
//!
//! Every event is a `{"key": ..., "value": {...}}` JSON object. Events are
//! pushed by the worker in order and drained by the host; once the queue
//! is closed the consumer-facing wrapper answers with [`TERMINATED`].

use crate::settings::{LogLevel, Settings};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use tokio::sync::mpsc::UnboundedSender;

/// Returned by `wait_for_next_event` once the queue is closed or the handle is unknown.
pub const TERMINATED: &str = r#"{"key":"status.terminated","value":{}}"#;

/// Stands in for any event whose payload could not be serialized.
pub const BUG_JSON_DUMP: &str = r#"{"key":"bug.json_dump","value":{"failure":"internal_error"}}"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "key", content = "value")]
pub enum Event {
    #[serde(rename = "status.queued")]
    Queued {},
    #[serde(rename = "status.started")]
    Started {},
    #[serde(rename = "status.progress")]
    Progress { message: String, percentage: f64 },
    #[serde(rename = "status.geoip_lookup")]
    GeoipLookup {
        probe_ip: String,
        probe_asn: String,
        probe_cc: String,
        probe_network_name: String,
    },
    #[serde(rename = "status.report_create")]
    ReportCreate { report_id: String },
    #[serde(rename = "status.report_close")]
    ReportClose { report_id: String },
    #[serde(rename = "status.measurement_start")]
    MeasurementStart { idx: usize, input: String },
    #[serde(rename = "measurement")]
    Measurement {
        idx: usize,
        input: String,
        json_str: String,
    },
    #[serde(rename = "status.measurement_submission")]
    MeasurementSubmission { idx: usize, input: String },
    #[serde(rename = "status.measurement_done")]
    MeasurementDone { idx: usize, input: String },
    #[serde(rename = "failure.measurement")]
    FailureMeasurement {
        failure: String,
        idx: usize,
        input: String,
    },
    #[serde(rename = "failure.measurement_submission")]
    FailureMeasurementSubmission {
        failure: String,
        idx: usize,
        input: String,
        json_str: String,
    },
    #[serde(rename = "failure.startup")]
    FailureStartup { failure: String },
    #[serde(rename = "failure.report_create")]
    FailureReportCreate { failure: String },
    #[serde(rename = "failure.report_close")]
    FailureReportClose { failure: String },
    #[serde(rename = "log")]
    Log { log_level: LogLevel, message: String },
    #[serde(rename = "bug.json_dump")]
    BugJsonDump { failure: String },
    #[serde(rename = "status.end")]
    End {
        downloaded_kb: f64,
        failure: String,
        uploaded_kb: f64,
    },
}

impl Event {
    pub fn key(&self) -> &'static str {
        match self {
            Event::Queued {} => "status.queued",
            Event::Started {} => "status.started",
            Event::Progress { .. } => "status.progress",
            Event::GeoipLookup { .. } => "status.geoip_lookup",
            Event::ReportCreate { .. } => "status.report_create",
            Event::ReportClose { .. } => "status.report_close",
            Event::MeasurementStart { .. } => "status.measurement_start",
            Event::Measurement { .. } => "measurement",
            Event::MeasurementSubmission { .. } => "status.measurement_submission",
            Event::MeasurementDone { .. } => "status.measurement_done",
            Event::FailureMeasurement { .. } => "failure.measurement",
            Event::FailureMeasurementSubmission { .. } => "failure.measurement_submission",
            Event::FailureStartup { .. } => "failure.startup",
            Event::FailureReportCreate { .. } => "failure.report_create",
            Event::FailureReportClose { .. } => "failure.report_close",
            Event::Log { .. } => "log",
            Event::BugJsonDump { .. } => "bug.json_dump",
            Event::End { .. } => "status.end",
        }
    }

    pub fn progress(percentage: f64, message: impl Into<String>) -> Self {
        Event::Progress {
            message: message.into(),
            percentage,
        }
    }

    pub fn log(log_level: LogLevel, message: impl Into<String>) -> Self {
        Event::Log {
            log_level,
            message: message.into(),
        }
    }

    pub fn startup_failure(failure: impl ToString) -> Self {
        Event::FailureStartup {
            failure: failure.to_string(),
        }
    }
}

/// Serialize an event payload, falling back to [`BUG_JSON_DUMP`] so the
/// stream stays well-formed.
pub fn encode<T: Serialize>(event: &T) -> String {
    match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "cannot serialize event");
            BUG_JSON_DUMP.to_string()
        }
    }
}

/// Producer side of a task's event queue. Owned by the worker; dropping it
/// closes the queue.
pub struct Emitter {
    tx: UnboundedSender<String>,
    disabled: HashSet<String>,
    log_level: LogLevel,
    log_file: Option<File>,
}

impl Emitter {
    pub fn new(tx: UnboundedSender<String>) -> Self {
        Self {
            tx,
            disabled: HashSet::new(),
            log_level: LogLevel::default(),
            log_file: None,
        }
    }

    /// Apply the event-related settings once they have been parsed.
    pub fn configure(&mut self, settings: &Settings) {
        self.disabled = settings.disabled_event_set();
        self.log_level = settings.log_level;
        if !settings.log_filepath.is_empty() {
            match File::create(&settings.log_filepath) {
                Ok(f) => self.log_file = Some(f),
                Err(e) => {
                    tracing::warn!(path = %settings.log_filepath, error = %e, "cannot open task log file");
                }
            }
        }
    }

    fn enabled(&self, event: &Event) -> bool {
        if let Event::Log { log_level, .. } = event {
            if *log_level > self.log_level {
                return false;
            }
        }
        // status.end always terminates the stream
        matches!(event, Event::End { .. }) || !self.disabled.contains(event.key())
    }

    pub fn emit(&self, event: Event) {
        if !self.enabled(&event) {
            return;
        }
        if let (Event::Log { log_level, message }, Some(file)) = (&event, &self.log_file) {
            let mut out: &File = file;
            // log file errors never affect the task
            let _ = writeln!(out, "[{}] {}", log_level, message);
        }
        tracing::debug!(key = event.key(), "emit");
        self.send(encode(&event));
    }

    fn send(&self, text: String) {
        // the receiver is gone only when the task itself has been dropped
        let _ = self.tx.send(text);
    }

    #[cfg(test)]
    pub(crate) fn emit_raw<T: Serialize>(&self, payload: &T) {
        self.send(encode(payload));
    }
}
