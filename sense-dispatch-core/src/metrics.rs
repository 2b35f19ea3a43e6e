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

//! Metrics instrumentation for the dispatch pipeline.
//!
//! Uses the `metrics` crate facade; install an exporter (the binary ships
//! `metrics-exporter-prometheus`) to collect them. Without a recorder every
//! call is a no-op.
//!
//! # Naming
//!
//! All metrics are prefixed with `sense_dispatch_`, counters end in `_total`
//! and durations in `_seconds`.
//!
//! # Labels
//!
//! - **feed**: which subscription, `domain` or `configuration`
//! - **error_type**: a [`StoreError`](crate::store::StoreError) category or
//!   one of the fixed strings below
//!
//! Never label with document ids, recipients or message text.
//!
//! # Examples
//!
//! ```rust
//! use sense_dispatch_core::metrics::{self, FeedKind};
//!
//! metrics::increment_changes_received(FeedKind::Domain);
//! metrics::record_fan_out(3);
//! metrics::increment_delivery_failures();
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric name prefix for all pipeline metrics.
#[doc(hidden)]
pub const METRIC_PREFIX: &str = "sense_dispatch";

// ============================================================================
// Metric Name Constants
// ============================================================================

/// Changes delivered by a feed.
///
/// Type: Counter
/// Labels: feed
#[doc(hidden)]
pub const CHANGES_RECEIVED_TOTAL: &str = "sense_dispatch_changes_received_total";

/// Outbound messages produced by the dispatcher.
///
/// Type: Counter
#[doc(hidden)]
pub const MESSAGES_DISPATCHED_TOTAL: &str = "sense_dispatch_messages_dispatched_total";

/// Messages the gateway accepted without a transport error.
///
/// Type: Counter
const MESSAGES_SENT_TOTAL: &str = "sense_dispatch_messages_sent_total";

/// Messages that failed at the transport level.
///
/// Type: Counter
const DELIVERY_FAILURES_TOTAL: &str = "sense_dispatch_delivery_failures_total";

/// Inline fetches that fell back to the original change.
///
/// Type: Counter
/// Labels: error_type
const INLINE_FAILURES_TOTAL: &str = "sense_dispatch_inline_failures_total";

/// Changes abandoned because the template failed to render.
///
/// Type: Counter
const RENDER_FAILURES_TOTAL: &str = "sense_dispatch_render_failures_total";

/// Transient feed errors.
///
/// Type: Counter
/// Labels: feed
const FEED_ERRORS_TOTAL: &str = "sense_dispatch_feed_errors_total";

/// Feeds that stopped.
///
/// Type: Counter
/// Labels: feed
const FEED_TERMINATIONS_TOTAL: &str = "sense_dispatch_feed_terminations_total";

/// Configuration documents applied.
///
/// Type: Counter
const CONFIGURATION_UPDATES_TOTAL: &str = "sense_dispatch_configuration_updates_total";

/// Messages produced per change.
///
/// Type: Histogram
/// Unit: messages
const FAN_OUT: &str = "sense_dispatch_fan_out";

/// Gateway round trip.
///
/// Type: Histogram
/// Unit: seconds
#[doc(hidden)]
pub const DELIVERY_DURATION_SECONDS: &str = "sense_dispatch_delivery_duration_seconds";

/// Feeds currently open.
///
/// Type: Gauge
const ACTIVE_FEEDS: &str = "sense_dispatch_active_feeds";

/// Current pipeline status (0=stopped, 1=running, 2=error).
///
/// Type: Gauge
const PIPELINE_STATUS: &str = "sense_dispatch_pipeline_status";

// ============================================================================
// Initialization
// ============================================================================

/// Registers metric descriptions with the installed recorder.
///
/// Call once at startup, after installing an exporter.
pub fn init_metrics() {
    describe_counter!(
        CHANGES_RECEIVED_TOTAL,
        "Total number of changes delivered by change feeds"
    );
    describe_counter!(
        MESSAGES_DISPATCHED_TOTAL,
        "Total number of outbound messages produced by the dispatcher"
    );
    describe_counter!(
        MESSAGES_SENT_TOTAL,
        "Total number of messages accepted by the gateway transport"
    );
    describe_counter!(
        DELIVERY_FAILURES_TOTAL,
        "Total number of messages that failed at the transport level"
    );
    describe_counter!(
        INLINE_FAILURES_TOTAL,
        "Total number of inline fetches that fell back to the original change"
    );
    describe_counter!(
        RENDER_FAILURES_TOTAL,
        "Total number of changes abandoned because the template failed to render"
    );
    describe_counter!(FEED_ERRORS_TOTAL, "Total number of transient change feed errors");
    describe_counter!(
        FEED_TERMINATIONS_TOTAL,
        "Total number of change feeds that stopped"
    );
    describe_counter!(
        CONFIGURATION_UPDATES_TOTAL,
        "Total number of configuration documents applied"
    );

    describe_histogram!(
        FAN_OUT,
        metrics::Unit::Count,
        "Number of outbound messages produced per change"
    );
    describe_histogram!(
        DELIVERY_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Time taken for one gateway request"
    );

    describe_gauge!(
        ACTIVE_FEEDS,
        metrics::Unit::Count,
        "Number of change feeds currently open"
    );
    describe_gauge!(
        PIPELINE_STATUS,
        "Current pipeline status: 0=stopped, 1=running, 2=error"
    );
}

// ============================================================================
// Counters
// ============================================================================

/// Counts one change delivered by a feed.
pub fn increment_changes_received(feed: FeedKind) {
    counter!(CHANGES_RECEIVED_TOTAL, "feed" => feed.as_str()).increment(1);
}

/// Counts messages produced by one dispatch.
pub fn increment_messages_dispatched(count: usize) {
    counter!(MESSAGES_DISPATCHED_TOTAL).increment(count as u64);
}

/// Counts one message accepted by the gateway.
pub fn increment_messages_sent() {
    counter!(MESSAGES_SENT_TOTAL).increment(1);
}

/// Counts one transport-level delivery failure.
pub fn increment_delivery_failures() {
    counter!(DELIVERY_FAILURES_TOTAL).increment(1);
}

/// Counts one inline fallback.
///
/// # Arguments
///
/// * `error_type` - store error category, or `invalid_reference` when the
///   change did not hold a usable id
pub fn increment_inline_failures(error_type: &'static str) {
    counter!(INLINE_FAILURES_TOTAL, "error_type" => error_type).increment(1);
}

/// Counts one abandoned dispatch.
pub fn increment_render_failures() {
    counter!(RENDER_FAILURES_TOTAL).increment(1);
}

/// Counts one transient feed error.
pub fn increment_feed_errors(feed: FeedKind) {
    counter!(FEED_ERRORS_TOTAL, "feed" => feed.as_str()).increment(1);
}

/// Counts one stopped feed.
pub fn increment_feed_terminations(feed: FeedKind) {
    counter!(FEED_TERMINATIONS_TOTAL, "feed" => feed.as_str()).increment(1);
}

/// Counts one applied configuration document.
pub fn increment_configuration_updates() {
    counter!(CONFIGURATION_UPDATES_TOTAL).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Records how many messages one change produced.
pub fn record_fan_out(count: usize) {
    histogram!(FAN_OUT).record(count as f64);
}

/// Records the duration of one gateway request.
pub fn record_delivery_duration(duration: Duration) {
    histogram!(DELIVERY_DURATION_SECONDS).record(duration.as_secs_f64());
}

// ============================================================================
// Gauges
// ============================================================================

/// Marks a feed as opened.
pub fn increment_active_feeds() {
    gauge!(ACTIVE_FEEDS).increment(1.0);
}

/// Marks a feed as closed or stopped.
pub fn decrement_active_feeds() {
    gauge!(ACTIVE_FEEDS).decrement(1.0);
}

/// Sets the pipeline status gauge.
///
/// ```rust
/// use sense_dispatch_core::metrics::{self, PipelineStatus};
///
/// metrics::set_pipeline_status(PipelineStatus::Running);
/// ```
pub fn set_pipeline_status(status: PipelineStatus) {
    gauge!(PIPELINE_STATUS).set(f64::from(status as u8));
}

/// Which subscription a feed metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedKind {
    /// The feed of domain changes that produce messages
    Domain,
    /// The feed watching the configuration document
    Configuration,
}

impl FeedKind {
    /// Returns the kind as a static string for metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::Configuration => "configuration",
        }
    }
}

/// Pipeline status for the `pipeline_status` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineStatus {
    /// Pipeline is stopped.
    Stopped = 0,
    /// Pipeline is running normally.
    Running = 1,
    /// A feed terminated and the pipeline is degraded.
    Error = 2,
}

/// Records elapsed time when dropped.
///
/// ```rust
/// use sense_dispatch_core::metrics::{self, Timer};
///
/// {
///     let _timer = Timer::new(metrics::record_delivery_duration);
///     // ... gateway request ...
/// }
/// ```
pub struct Timer<F>
where
    F: FnOnce(Duration),
{
    start: std::time::Instant,
    record_fn: Option<F>,
}

impl<F> Timer<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing.
    pub fn new(record_fn: F) -> Self {
        Self {
            start: std::time::Instant::now(),
            record_fn: Some(record_fn),
        }
    }
}

impl<F> Drop for Timer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        if let Some(record_fn) = self.record_fn.take() {
            record_fn(duration);
        }
    }
}
