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

//! Document store contract.
//!
//! The [`DocumentStore`] trait is everything the dispatch pipeline needs from
//! the underlying database:
//!
//! - fetching a document by id ([`DocumentStore::get`])
//! - opening a filtered change feed ([`DocumentStore::changes`])
//!
//! A change feed is a stream of [`FeedEvent`] values. Besides the changes
//! themselves it carries the transport's lifecycle notifications (errors,
//! retries, confirmation, catch-up, idle waits, timeouts and the terminal
//! stop). Reconnection is the store's business; the listener in
//! [`crate::feed`] only observes and reports.
//!
//! Implementations live in the `sense-dispatch-stores` crate.

use crate::event::ChangeEvent;
use async_trait::async_trait;
use bson::Document;
use futures::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Boxed stream of lifecycle and change notifications for one feed.
pub type FeedStream = Pin<Box<dyn Stream<Item = FeedEvent> + Send>>;

/// Errors returned by a [`DocumentStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No document exists with the requested id
    #[error("Document not found: {0}")]
    NotFound(String),

    /// The store could not be reached
    #[error("Connection error: {0}")]
    Connection(String),

    /// A feed referenced a view the store does not know
    #[error("Unknown view: {0}")]
    UnknownView(String),

    /// A document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other store failure
    #[error("Store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Returns the error category for metrics/logging.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Connection(_) => "connection",
            Self::UnknownView(_) => "unknown_view",
            Self::Serialization(_) => "serialization",
            Self::Other(_) => "other",
        }
    }

    /// Diagnostic payload attached to error reports.
    #[must_use]
    pub fn to_extra(&self) -> Value {
        json!({
            "category": self.category(),
            "message": self.to_string(),
        })
    }
}

/// Filter selecting which changes a feed delivers.
///
/// Serializes to the `{filter, query_params}` shape used to label feeds in
/// logs, e.g. `{"filter":"_doc_ids","query_params":{"doc_ids":["cfg"]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "filter", content = "query_params")]
pub enum FeedFilter {
    /// Only changes to the listed document ids
    #[serde(rename = "_doc_ids")]
    DocIds {
        /// Watched document ids
        doc_ids: Vec<String>,
    },

    /// Only changes matched by a named view
    #[serde(rename = "_view")]
    View {
        /// View name, e.g. `dashboard/symptomatic-followups-by-dateofvisit`
        view: String,
    },
}

impl FeedFilter {
    /// Creates a filter for a fixed list of document ids.
    pub fn doc_ids<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::DocIds {
            doc_ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Creates a filter for a named view.
    pub fn view(name: impl Into<String>) -> Self {
        Self::View { view: name.into() }
    }

    /// Wire name of the filter type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DocIds { .. } => "_doc_ids",
            Self::View { .. } => "_view",
        }
    }
}

/// Where a feed starts reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Since {
    /// Only changes made after the feed is opened
    #[default]
    Now,

    /// Changes after the given sequence token
    Sequence(String),
}

impl fmt::Display for Since {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Now => f.write_str("now"),
            Self::Sequence(seq) => f.write_str(seq),
        }
    }
}

/// Complete description of a change feed subscription.
///
/// Only the [`FeedFilter`] identifies a feed in logs; the remaining fields are
/// defaults applied to every feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedRequest {
    /// Caller-supplied filter
    pub filter: FeedFilter,

    /// Whether changes carry the document body (default: true)
    pub include_docs: bool,

    /// Starting point (default: now)
    pub since: Since,

    /// Database to watch
    pub database: String,
}

impl FeedRequest {
    /// Creates a request with the default `include_docs` and `since` settings.
    pub fn new(filter: FeedFilter, database: impl Into<String>) -> Self {
        Self {
            filter,
            include_docs: true,
            since: Since::Now,
            database: database.into(),
        }
    }

    /// Overrides the starting point.
    #[must_use]
    pub fn since(mut self, since: Since) -> Self {
        self.since = since;
        self
    }

    /// Overrides whether document bodies are included.
    #[must_use]
    pub fn include_docs(mut self, include_docs: bool) -> Self {
        self.include_docs = include_docs;
        self
    }

    /// Diagnostic label identifying this feed.
    ///
    /// Never used for dispatch decisions.
    #[must_use]
    pub fn label(&self) -> String {
        serde_json::to_string(&self.filter).unwrap_or_else(|_| self.filter.kind().to_string())
    }
}

/// Error payload carried by feed `error` and `stop` notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedFailure {
    /// Human-readable message
    pub message: String,

    /// Store-specific error code, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,

    /// Store-specific error labels
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
}

impl FeedFailure {
    /// Creates a failure with just a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            labels: Vec::new(),
        }
    }

    /// Attaches an error code.
    #[must_use]
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Attaches error labels.
    #[must_use]
    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }
}

impl fmt::Display for FeedFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {})", self.message, code),
            None => f.write_str(&self.message),
        }
    }
}

/// A notification emitted by a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A document changed
    Change(ChangeEvent),

    /// A transient transport error; the feed keeps going
    Error(FeedFailure),

    /// The transport will reconnect from `since` after waiting `after`
    Retry {
        /// Sequence the feed resumes from
        since: String,
        /// Delay before the reconnect attempt
        after: Duration,
    },

    /// The feed terminated and will not deliver anything else
    Stop(Option<FeedFailure>),

    /// The store confirmed the subscription
    Confirm,

    /// The feed caught up with the store at `seq`
    Catchup {
        /// Sequence at which the feed caught up
        seq: String,
    },

    /// The feed is idle, waiting for changes
    Wait,

    /// A request to the store timed out and is being reissued
    Timeout,
}

impl FeedEvent {
    /// Name of the notification, as used in diagnostics.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Change(_) => "change",
            Self::Error(_) => "error",
            Self::Retry { .. } => "retry",
            Self::Stop(_) => "stop",
            Self::Confirm => "confirm",
            Self::Catchup { .. } => "catchup",
            Self::Wait => "wait",
            Self::Timeout => "timeout",
        }
    }
}

/// Trait for document store backends.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetches a document by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the document does not exist, or
    /// another variant if the store cannot be queried.
    async fn get(&self, id: &str) -> Result<Document, StoreError>;

    /// Opens a change feed.
    ///
    /// Dropping the returned stream cancels the subscription.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be set up.
    async fn changes(&self, request: &FeedRequest) -> Result<FeedStream, StoreError>;
}
