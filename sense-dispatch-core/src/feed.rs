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

//! Change Feed Listener
//!
//! Wraps a store's raw [`FeedEvent`] stream into a [`FeedSubscription`]: a
//! stream of [`ChangeEvent`]s that reports every transport failure through
//! the [`ErrorReporter`] and ends with a distinct terminal signal.
//!
//! # State Machine
//!
//! ```text
//! subscribing ──confirm/change──▶ active ◀──change/catchup──┐
//!                                   │                        │
//!                                   └──────retry──────▶ retrying
//!
//! any state ──stop / transport end / close()──▶ stopped
//! ```
//!
//! | Event | Effect |
//! |---|---|
//! | `change` | yields `Ok(ChangeEvent)` |
//! | `error` | reported, subscription continues |
//! | `retry` | debug log, state `Retrying` |
//! | `stop` | reported once, yields one `Err(FeedTerminated)`, then `None` |
//! | `confirm`, `catchup`, `wait`, `timeout` | debug log |
//!
//! A stopped subscription is never restarted here. Whoever owns it decides
//! whether to call [`ChangeFeedListener::listen`] again.
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use sense_dispatch_core::feed::ChangeFeedListener;
//! use sense_dispatch_core::reporter::ErrorReporter;
//! use sense_dispatch_core::store::{DocumentStore, FeedFilter};
//! use std::sync::Arc;
//!
//! async fn follow<S: DocumentStore>(store: Arc<S>) {
//!     let listener = ChangeFeedListener::new(store, "sense", ErrorReporter::new());
//!     let mut feed = listener
//!         .listen(FeedFilter::view("dashboard/followups"))
//!         .await
//!         .unwrap();
//!
//!     while let Some(item) = feed.next().await {
//!         match item {
//!             Ok(change) => println!("{} changed at {}", change.id, change.seq),
//!             Err(terminated) => eprintln!("{terminated}"),
//!         }
//!     }
//! }
//! ```

use crate::event::ChangeEvent;
use crate::metrics::{self, FeedKind};
use crate::reporter::ErrorReporter;
use crate::store::{
    DocumentStore, FeedEvent, FeedFailure, FeedFilter, FeedRequest, FeedStream, StoreError,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tracing::{debug, info};

/// Lifecycle of a [`FeedSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Opened, nothing received yet
    Subscribing,
    /// Receiving changes
    Active,
    /// The transport announced a reconnect
    Retrying,
    /// Terminated; no further changes will be yielded
    Stopped,
}

/// Terminal signal of a subscription.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("change feed {label} terminated{}", cause_suffix(.cause))]
pub struct FeedTerminated {
    /// Label of the subscription that stopped
    pub label: String,

    /// Failure carried by the stop notification, if any
    pub cause: Option<FeedFailure>,
}

fn cause_suffix(cause: &Option<FeedFailure>) -> String {
    cause.as_ref().map(|c| format!(": {c}")).unwrap_or_default()
}

/// Opens change feed subscriptions against one database.
pub struct ChangeFeedListener<S: DocumentStore> {
    store: Arc<S>,
    database: String,
    reporter: ErrorReporter,
    kind: FeedKind,
}

impl<S: DocumentStore> Clone for ChangeFeedListener<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            database: self.database.clone(),
            reporter: self.reporter.clone(),
            kind: self.kind,
        }
    }
}

impl<S: DocumentStore> ChangeFeedListener<S> {
    /// Creates a listener for domain changes.
    pub fn new(store: Arc<S>, database: impl Into<String>, reporter: ErrorReporter) -> Self {
        Self {
            store,
            database: database.into(),
            reporter,
            kind: FeedKind::Domain,
        }
    }

    /// Sets which subscription metrics are attributed to.
    #[must_use]
    pub fn kind(mut self, kind: FeedKind) -> Self {
        self.kind = kind;
        self
    }

    /// Subscribes with the default request settings (`include_docs`, since now).
    ///
    /// # Errors
    ///
    /// Returns the store error if the subscription cannot be set up. The
    /// failure has already been reported.
    pub async fn listen(&self, filter: FeedFilter) -> Result<FeedSubscription, StoreError> {
        self.listen_with(FeedRequest::new(filter, self.database.as_str()))
            .await
    }

    /// Subscribes with a fully specified request.
    ///
    /// # Errors
    ///
    /// See [`listen`](Self::listen).
    pub async fn listen_with(&self, request: FeedRequest) -> Result<FeedSubscription, StoreError> {
        let label = request.label();

        match self.store.changes(&request).await {
            Ok(inner) => {
                info!(label = %label, since = %request.since, "Listening for changes");
                metrics::increment_active_feeds();
                Ok(FeedSubscription {
                    inner,
                    state: FeedState::Subscribing,
                    label,
                    reporter: self.reporter.clone(),
                    kind: self.kind,
                })
            }
            Err(e) => {
                self.reporter.capture_message(
                    format!("could not listen to changes with options {label}"),
                    e.to_extra(),
                );
                Err(e)
            }
        }
    }
}

/// One open change feed.
///
/// Yields `Ok(ChangeEvent)` per change, in transport order, then exactly one
/// `Err(FeedTerminated)` if the transport stops, then `None` forever.
/// Dropping the subscription cancels it.
pub struct FeedSubscription {
    inner: FeedStream,
    state: FeedState,
    label: String,
    reporter: ErrorReporter,
    kind: FeedKind,
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("state", &self.state)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl FeedSubscription {
    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FeedState {
        self.state
    }

    /// Diagnostic label (the caller's filter parameters as JSON).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns true once the subscription has terminated or been closed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state == FeedState::Stopped
    }

    /// Cancels the subscription.
    ///
    /// Owner-initiated shutdown is logged but not reported as a failure.
    pub fn close(&mut self) {
        if self.is_stopped() {
            return;
        }
        info!(label = %self.label, "Closing change feed");
        self.shut();
    }

    fn shut(&mut self) {
        self.state = FeedState::Stopped;
        self.inner = stream::empty().boxed();
        metrics::decrement_active_feeds();
    }

    fn terminate(&mut self, cause: Option<FeedFailure>) -> FeedTerminated {
        self.reporter.capture_message(
            "a changes feed terminated",
            json!({ "label": self.label, "error": cause }),
        );
        metrics::increment_feed_terminations(self.kind);
        self.shut();

        FeedTerminated {
            label: self.label.clone(),
            cause,
        }
    }
}

impl Stream for FeedSubscription {
    type Item = Result<ChangeEvent, FeedTerminated>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.is_stopped() {
                return Poll::Ready(None);
            }

            let event = match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(event)) => event,
                Poll::Ready(None) => {
                    let cause = FeedFailure::new("change feed ended unexpectedly");
                    return Poll::Ready(Some(Err(this.terminate(Some(cause)))));
                }
                Poll::Pending => return Poll::Pending,
            };

            match event {
                FeedEvent::Change(change) => {
                    this.state = FeedState::Active;
                    metrics::increment_changes_received(this.kind);
                    debug!(label = %this.label, id = %change.id, seq = %change.seq, "Received change");
                    return Poll::Ready(Some(Ok(change)));
                }
                FeedEvent::Error(failure) => {
                    metrics::increment_feed_errors(this.kind);
                    this.reporter.capture_message(
                        format!("change with options {} found an error", this.label),
                        json!(failure),
                    );
                }
                FeedEvent::Retry { since, after } => {
                    this.state = FeedState::Retrying;
                    debug!(
                        "feed {} will retry since {}, after {} seconds",
                        this.label,
                        since,
                        after.as_secs_f64()
                    );
                }
                FeedEvent::Stop(cause) => {
                    return Poll::Ready(Some(Err(this.terminate(cause))));
                }
                other @ (FeedEvent::Confirm | FeedEvent::Catchup { .. }) => {
                    this.state = FeedState::Active;
                    debug!("feed {} got {} event", this.label, other.name());
                }
                other @ (FeedEvent::Wait | FeedEvent::Timeout) => {
                    debug!("feed {} got {} event", this.label, other.name());
                }
            }
        }
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if !self.is_stopped() {
            metrics::decrement_active_feeds();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::MemorySink;
    use async_trait::async_trait;
    use bson::{doc, Document};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Store whose next feed replays a fixed script.
    struct ScriptedStore {
        script: Mutex<Option<Vec<FeedEvent>>>,
        keep_open: bool,
    }

    impl ScriptedStore {
        fn new(script: Vec<FeedEvent>) -> Self {
            Self {
                script: Mutex::new(Some(script)),
                keep_open: true,
            }
        }
    }

    #[async_trait]
    impl DocumentStore for ScriptedStore {
        async fn get(&self, id: &str) -> Result<Document, StoreError> {
            Err(StoreError::NotFound(id.to_string()))
        }

        async fn changes(&self, _request: &FeedRequest) -> Result<FeedStream, StoreError> {
            let script = self
                .script
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| StoreError::Connection("refused".into()))?;
            let events = stream::iter(script);
            if self.keep_open {
                Ok(events.chain(stream::pending()).boxed())
            } else {
                Ok(events.boxed())
            }
        }
    }

    fn change(id: &str, seq: &str) -> FeedEvent {
        FeedEvent::Change(ChangeEvent::new(id, seq, Some(doc! { "name": id })))
    }

    async fn subscribe(store: ScriptedStore) -> (FeedSubscription, MemorySink) {
        let sink = MemorySink::new();
        let reporter = ErrorReporter::new().with_sink(sink.clone());
        let listener = ChangeFeedListener::new(Arc::new(store), "sense", reporter);
        let feed = listener
            .listen(FeedFilter::view("dashboard/followups"))
            .await
            .unwrap();
        (feed, sink)
    }

    #[tokio::test]
    async fn test_changes_are_yielded_in_order() {
        let (mut feed, sink) = subscribe(ScriptedStore::new(vec![
            FeedEvent::Confirm,
            change("a", "1"),
            change("b", "2"),
        ]))
        .await;

        assert_eq!(feed.state(), FeedState::Subscribing);
        assert_eq!(feed.next().await.unwrap().unwrap().id, "a");
        assert_eq!(feed.state(), FeedState::Active);
        assert_eq!(feed.next().await.unwrap().unwrap().id, "b");
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_error_is_reported_and_feed_continues() {
        let (mut feed, sink) = subscribe(ScriptedStore::new(vec![
            change("a", "1"),
            FeedEvent::Error(FeedFailure::new("socket hang up")),
            change("b", "2"),
        ]))
        .await;

        assert_eq!(feed.next().await.unwrap().unwrap().id, "a");
        assert_eq!(feed.next().await.unwrap().unwrap().id, "b");

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(
            reports[0].message,
            format!("change with options {} found an error", feed.label())
        );
        assert_eq!(reports[0].extra, json!({ "message": "socket hang up" }));
    }

    #[tokio::test]
    async fn test_retry_is_diagnostic_only() {
        let (mut feed, sink) = subscribe(ScriptedStore::new(vec![
            change("a", "1"),
            FeedEvent::Retry {
                since: "1".into(),
                after: Duration::from_millis(100),
            },
            FeedEvent::Wait,
            FeedEvent::Timeout,
        ]))
        .await;

        assert!(feed.next().await.unwrap().is_ok());
        let pending = tokio::time::timeout(Duration::from_millis(20), feed.next()).await;
        assert!(pending.is_err());
        assert_eq!(feed.state(), FeedState::Retrying);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_catchup_after_retry_reactivates() {
        let (mut feed, sink) = subscribe(ScriptedStore::new(vec![
            change("a", "1"),
            FeedEvent::Retry {
                since: "1".into(),
                after: Duration::from_millis(100),
            },
            FeedEvent::Wait,
            FeedEvent::Catchup { seq: "1".into() },
        ]))
        .await;

        assert!(feed.next().await.unwrap().is_ok());
        let pending = tokio::time::timeout(Duration::from_millis(20), feed.next()).await;
        assert!(pending.is_err());
        assert_eq!(feed.state(), FeedState::Active);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_stop_reports_once_and_ends() {
        let (mut feed, sink) = subscribe(ScriptedStore::new(vec![
            change("a", "1"),
            FeedEvent::Stop(Some(FeedFailure::new("invalidated"))),
            change("never", "3"),
        ]))
        .await;

        assert!(feed.next().await.unwrap().is_ok());

        let terminated = feed.next().await.unwrap().unwrap_err();
        assert_eq!(terminated.label, feed.label());
        assert_eq!(terminated.cause, Some(FeedFailure::new("invalidated")));

        assert!(feed.next().await.is_none());
        assert!(feed.next().await.is_none());
        assert!(feed.is_stopped());

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, "a changes feed terminated");
        assert_eq!(reports[0].extra["label"], json!(feed.label()));
        assert_eq!(reports[0].extra["error"]["message"], "invalidated");
    }

    #[tokio::test]
    async fn test_transport_end_is_terminal() {
        let mut store = ScriptedStore::new(vec![change("a", "1")]);
        store.keep_open = false;
        let (mut feed, sink) = subscribe(store).await;

        assert!(feed.next().await.unwrap().is_ok());
        assert!(feed.next().await.unwrap().is_err());
        assert!(feed.next().await.is_none());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_not_reported() {
        let (mut feed, sink) = subscribe(ScriptedStore::new(vec![change("a", "1")])).await;

        feed.close();

        assert!(feed.next().await.is_none());
        assert_eq!(feed.state(), FeedState::Stopped);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported() {
        let store = ScriptedStore::new(vec![]);
        store.script.lock().unwrap().take();
        let sink = MemorySink::new();
        let reporter = ErrorReporter::new().with_sink(sink.clone());
        let listener = ChangeFeedListener::new(Arc::new(store), "sense", reporter);

        let err = listener.listen(FeedFilter::doc_ids(["cfg"])).await.unwrap_err();

        assert_eq!(err, StoreError::Connection("refused".into()));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_terminated_display() {
        let terminated = FeedTerminated {
            label: "x".into(),
            cause: Some(FeedFailure::new("boom")),
        };
        assert_eq!(terminated.to_string(), "change feed x terminated: boom");

        let terminated = FeedTerminated {
            label: "x".into(),
            cause: None,
        };
        assert_eq!(terminated.to_string(), "change feed x terminated");
    }
}
