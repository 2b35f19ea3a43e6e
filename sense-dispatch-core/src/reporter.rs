// Copyright 2025 Sense Dispatch Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Error reporting.
//!
//! Every component failure goes through an [`ErrorReporter`]. Each capture:
//!
//! 1. logs one `error`-level event through `tracing`, and
//! 2. forwards one [`Report`] to every configured [`ErrorSink`].
//!
//! Sinks are the seam to an external error-tracking service. They are called
//! synchronously from wherever the failure happened (including inside
//! `Stream::poll_next`), so a sink that talks to the network must hand the
//! work off to a task instead of blocking.
//!
//! # Example
//!
//! ```rust
//! use sense_dispatch_core::reporter::{ErrorReporter, MemorySink};
//! use serde_json::json;
//!
//! let sink = MemorySink::new();
//! let reporter = ErrorReporter::new().with_sink(sink.clone());
//!
//! reporter.capture_message("a changes feed terminated", json!({ "label": "_view" }));
//!
//! assert_eq!(sink.len(), 1);
//! assert_eq!(sink.reports()[0].message, "a changes feed terminated");
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

/// Severity of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportLevel {
    /// A failure the process survives
    Error,

    /// A failure that terminates the process
    Fatal,
}

/// A single error report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Severity
    pub level: ReportLevel,

    /// Short description of what failed
    pub message: String,

    /// Arbitrary diagnostic payload
    pub extra: Value,

    /// When the failure was captured
    pub timestamp: DateTime<Utc>,
}

/// Destination for error reports.
pub trait ErrorSink: Send + Sync {
    /// Receives one report. Must not block.
    fn capture(&self, report: &Report);

    /// Blocks until reports captured so far have left the process, or
    /// `timeout` passes. Returns `false` on timeout.
    fn flush(&self, _timeout: Duration) -> bool {
        true
    }
}

/// The single funnel through which failures become observable.
///
/// Cheap to clone; clones share the same sinks.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    sinks: Vec<Arc<dyn ErrorSink>>,
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl ErrorReporter {
    /// Creates a reporter that only logs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink that receives every report.
    #[must_use]
    pub fn with_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Reports a failure described by `text`, with a diagnostic payload.
    pub fn capture_message(&self, text: impl Into<String>, extra: Value) {
        self.capture(ReportLevel::Error, text.into(), extra);
    }

    /// Reports an error value, including its source chain.
    pub fn capture_error(&self, err: &(dyn std::error::Error + 'static)) {
        self.capture(ReportLevel::Error, err.to_string(), error_chain(err));
    }

    /// Reports a failure that is about to terminate the process.
    pub fn capture_fatal(&self, text: impl Into<String>, extra: Value) {
        self.capture(ReportLevel::Fatal, text.into(), extra);
    }

    /// Flushes every sink. Only meant for the moments before the process exits.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.sinks.iter().all(|sink| sink.flush(timeout))
    }

    fn capture(&self, level: ReportLevel, message: String, extra: Value) {
        error!(level = ?level, extra = %extra, "{}", message);

        let report = Report {
            level,
            message,
            extra,
            timestamp: Utc::now(),
        };

        for sink in &self.sinks {
            sink.capture(&report);
        }
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> Value {
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    json!({ "causes": causes })
}

/// Sink that keeps reports in memory.
///
/// Useful in tests and for inspecting failures in-process.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    reports: Arc<Mutex<Vec<Report>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every captured report, oldest first.
    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Returns the captured messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.reports().into_iter().map(|r| r.message).collect()
    }

    /// Number of captured reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.reports.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Returns true if nothing has been captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards all captured reports.
    pub fn clear(&self) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.clear();
        }
    }
}

impl ErrorSink for MemorySink {
    fn capture(&self, report: &Report) {
        match self.reports.lock() {
            Ok(mut reports) => reports.push(report.clone()),
            Err(_) => warn!("Memory sink lock poisoned, dropping report"),
        }
    }
}
