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

//! In-memory document store.
//!
//! Keeps documents in a `HashMap` and every write in a numbered change log.
//! Feeds replay the log from their `since` point and then follow live
//! writes. Nothing is persisted.
//!
//! Besides `put`/`get` the store can inject transport lifecycle events into
//! open feeds ([`MemoryStore::emit`]) and simulate an unreachable backend
//! ([`MemoryStore::fail_gets`], [`MemoryStore::fail_changes`]), which makes it
//! the fake of choice for pipeline tests.
//!
//! # Example
//!
//! ```rust
//! use sense_dispatch_stores::memory::MemoryStore;
//! use sense_dispatch_core::store::DocumentStore;
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! store.register_view("followups", |doc| doc.get_bool("symptomatic").unwrap_or(false));
//!
//! store.put("visit-1", doc! { "name": "Ann", "symptomatic": true }).await;
//! assert_eq!(store.get("visit-1").await?.get_str("name")?, "Ann");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::Document;
use futures::stream::{self, StreamExt};
use sense_dispatch_core::event::ChangeEvent;
use sense_dispatch_core::store::{
    DocumentStore, FeedEvent, FeedFailure, FeedFilter, FeedRequest, FeedStream, Since, StoreError,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

/// Capacity of the live notification channel shared by all feeds.
const NOTICE_CAPACITY: usize = 1024;

/// Predicate deciding whether a document belongs to a view.
pub type ViewPredicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    id: String,
    doc: Document,
}

#[derive(Debug, Clone)]
enum Notice {
    Change(LogEntry),
    Lifecycle {
        target: Option<FeedFilter>,
        event: FeedEvent,
    },
}

#[derive(Default)]
struct State {
    docs: HashMap<String, Document>,
    log: Vec<LogEntry>,
    last_seq: u64,
}

struct Inner {
    state: RwLock<State>,
    views: std::sync::RwLock<HashMap<String, ViewPredicate>>,
    notices: broadcast::Sender<Notice>,
    fail_gets: AtomicBool,
    fail_changes: AtomicBool,
}

/// In-memory [`DocumentStore`].
///
/// Cheap to clone; clones share the same documents and feeds.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("open_feeds", &self.inner.notices.receiver_count())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        debug!("Creating new in-memory document store");
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                views: std::sync::RwLock::new(HashMap::new()),
                notices,
                fail_gets: AtomicBool::new(false),
                fail_changes: AtomicBool::new(false),
            }),
        }
    }

    /// Registers a named view.
    pub fn register_view<F>(&self, name: impl Into<String>, predicate: F)
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        match self.inner.views.write() {
            Ok(mut views) => {
                debug!(view = %name, "Registered view");
                views.insert(name, Arc::new(predicate));
            }
            Err(_) => warn!(view = %name, "View registry lock poisoned, view not registered"),
        }
    }

    /// Writes a document and publishes the change to open feeds.
    ///
    /// Returns the sequence number of the change.
    pub async fn put(&self, id: impl Into<String>, doc: Document) -> u64 {
        let id = id.into();
        let mut state = self.inner.state.write().await;

        state.last_seq += 1;
        let entry = LogEntry {
            seq: state.last_seq,
            id: id.clone(),
            doc: doc.clone(),
        };
        state.docs.insert(id, doc);
        state.log.push(entry.clone());

        trace!(id = %entry.id, seq = entry.seq, "Stored document");
        // No receivers is fine: nobody is listening yet.
        let _ = self.inner.notices.send(Notice::Change(entry));

        state.last_seq
    }

    /// Pushes a lifecycle event to every open feed.
    pub fn emit(&self, event: FeedEvent) {
        let _ = self.inner.notices.send(Notice::Lifecycle {
            target: None,
            event,
        });
    }

    /// Pushes a lifecycle event to open feeds with exactly this filter.
    pub fn emit_to(&self, filter: &FeedFilter, event: FeedEvent) {
        let _ = self.inner.notices.send(Notice::Lifecycle {
            target: Some(filter.clone()),
            event,
        });
    }

    /// Makes `get` fail with a connection error (or work again).
    pub fn fail_gets(&self, fail: bool) {
        self.inner.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Makes `changes` fail with a connection error (or work again).
    pub fn fail_changes(&self, fail: bool) {
        self.inner.fail_changes.store(fail, Ordering::SeqCst);
    }

    /// Number of feeds currently open.
    #[must_use]
    pub fn open_feeds(&self) -> usize {
        self.inner.notices.receiver_count()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.inner.state.read().await.docs.len()
    }

    /// Returns `true` if the store holds no documents.
    pub async fn is_empty(&self) -> bool {
        self.inner.state.read().await.docs.is_empty()
    }

    fn view(&self, name: &str) -> Result<ViewPredicate, StoreError> {
        self.inner
            .views
            .read()
            .map_err(|_| StoreError::Other("view registry lock poisoned".to_string()))?
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownView(name.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides which log entries and lifecycle events a feed sees.
struct FeedMatcher {
    filter: FeedFilter,
    view: Option<ViewPredicate>,
    include_docs: bool,
}

impl FeedMatcher {
    fn matches(&self, entry: &LogEntry) -> bool {
        match (&self.filter, &self.view) {
            (FeedFilter::DocIds { doc_ids }, _) => doc_ids.iter().any(|id| *id == entry.id),
            (FeedFilter::View { .. }, Some(predicate)) => predicate(&entry.doc),
            (FeedFilter::View { .. }, None) => false,
        }
    }

    fn to_event(&self, entry: LogEntry) -> FeedEvent {
        let doc = self.include_docs.then_some(entry.doc);
        FeedEvent::Change(ChangeEvent::new(entry.id, entry.seq.to_string(), doc))
    }

    fn accept(&self, notice: Notice) -> Option<FeedEvent> {
        match notice {
            Notice::Change(entry) if self.matches(&entry) => Some(self.to_event(entry)),
            Notice::Change(_) => None,
            Notice::Lifecycle { target, event } => match target {
                Some(target) if target != self.filter => None,
                _ => Some(event),
            },
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        if self.inner.fail_gets.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store set to fail".to_string()));
        }

        self.inner
            .state
            .read()
            .await
            .docs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn changes(&self, request: &FeedRequest) -> Result<FeedStream, StoreError> {
        if self.inner.fail_changes.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("memory store set to fail".to_string()));
        }

        let view = match &request.filter {
            FeedFilter::View { view } => Some(self.view(view)?),
            FeedFilter::DocIds { .. } => None,
        };
        let after = match &request.since {
            Since::Now => None,
            Since::Sequence(seq) => Some(seq.parse::<u64>().map_err(|_| {
                StoreError::Other(format!("invalid sequence token: {seq}"))
            })?),
        };

        let matcher = Arc::new(FeedMatcher {
            filter: request.filter.clone(),
            view,
            include_docs: request.include_docs,
        });

        // Subscribe under the read lock so no write falls between replay and live.
        let state = self.inner.state.read().await;
        let receiver = self.inner.notices.subscribe();
        let replay: Vec<FeedEvent> = match after {
            None => Vec::new(),
            Some(after) => state
                .log
                .iter()
                .filter(|entry| entry.seq > after && matcher.matches(entry))
                .cloned()
                .map(|entry| matcher.to_event(entry))
                .collect(),
        };
        drop(state);

        debug!(label = %request.label(), replayed = replay.len(), "Opened memory feed");

        let live = stream::unfold((receiver, matcher), |(mut receiver, matcher)| async move {
            loop {
                match receiver.recv().await {
                    Ok(notice) => {
                        if let Some(event) = matcher.accept(notice) {
                            return Some((event, (receiver, matcher)));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let failure = FeedFailure::new(format!(
                            "feed lagged behind by {skipped} notifications"
                        ));
                        return Some((FeedEvent::Error(failure), (receiver, matcher)));
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream::iter(std::iter::once(FeedEvent::Confirm).chain(replay))
            .chain(live)
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::time::Duration;

    async fn next(feed: &mut FeedStream) -> FeedEvent {
        tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .expect("feed produced nothing")
            .expect("feed ended")
    }

    fn change_id(event: &FeedEvent) -> &str {
        match event {
            FeedEvent::Change(change) => &change.id,
            other => panic!("expected a change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_and_not_found() {
        let store = MemoryStore::new();
        store.put("doc42", doc! { "name": "Bob" }).await;

        assert_eq!(store.get("doc42").await.unwrap(), doc! { "name": "Bob" });
        assert_eq!(
            store.get("missing").await.unwrap_err(),
            StoreError::NotFound("missing".into())
        );
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_fail_gets() {
        let store = MemoryStore::new();
        store.put("doc42", doc! {}).await;
        store.fail_gets(true);

        assert!(matches!(
            store.get("doc42").await,
            Err(StoreError::Connection(_))
        ));

        store.fail_gets(false);
        assert!(store.get("doc42").await.is_ok());
    }

    #[tokio::test]
    async fn test_doc_ids_feed_follows_live_writes() {
        let store = MemoryStore::new();
        let request = FeedRequest::new(FeedFilter::doc_ids(["cfg"]), "sense");
        let mut feed = store.changes(&request).await.unwrap();

        assert_eq!(next(&mut feed).await, FeedEvent::Confirm);

        store.put("other", doc! { "x": 1 }).await;
        store.put("cfg", doc! { "template": "t" }).await;

        let event = next(&mut feed).await;
        assert_eq!(change_id(&event), "cfg");
        if let FeedEvent::Change(change) = event {
            assert_eq!(change.seq, "2");
            assert_eq!(change.doc, Some(doc! { "template": "t" }));
        }
    }

    #[tokio::test]
    async fn test_view_feed_uses_predicate() {
        let store = MemoryStore::new();
        store.register_view("followups", |doc| doc.get_bool("symptomatic").unwrap_or(false));
        let request = FeedRequest::new(FeedFilter::view("followups"), "sense");
        let mut feed = store.changes(&request).await.unwrap();
        next(&mut feed).await;

        store.put("a", doc! { "symptomatic": false }).await;
        store.put("b", doc! { "symptomatic": true }).await;

        assert_eq!(change_id(&next(&mut feed).await), "b");
    }

    #[tokio::test]
    async fn test_unknown_view() {
        let store = MemoryStore::new();
        let request = FeedRequest::new(FeedFilter::view("nope"), "sense");

        assert!(matches!(
            store.changes(&request).await,
            Err(StoreError::UnknownView(name)) if name == "nope"
        ));
    }

    #[tokio::test]
    async fn test_since_sequence_replays_then_follows() {
        let store = MemoryStore::new();
        store.put("cfg", doc! { "v": 1 }).await;
        store.put("cfg", doc! { "v": 2 }).await;

        let request = FeedRequest::new(FeedFilter::doc_ids(["cfg"]), "sense")
            .since(Since::Sequence("1".into()));
        let mut feed = store.changes(&request).await.unwrap();
        store.put("cfg", doc! { "v": 3 }).await;

        assert_eq!(next(&mut feed).await, FeedEvent::Confirm);
        for expected in [2, 3] {
            match next(&mut feed).await {
                FeedEvent::Change(change) => {
                    assert_eq!(change.doc.unwrap().get_i32("v").unwrap(), expected);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_without_include_docs() {
        let store = MemoryStore::new();
        let request = FeedRequest::new(FeedFilter::doc_ids(["a"]), "sense").include_docs(false);
        let mut feed = store.changes(&request).await.unwrap();
        next(&mut feed).await;

        store.put("a", doc! { "x": 1 }).await;

        match next(&mut feed).await {
            FeedEvent::Change(change) => assert!(!change.has_document()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emit_targets_feeds() {
        let store = MemoryStore::new();
        let cfg = FeedFilter::doc_ids(["cfg"]);
        let mut cfg_feed = store
            .changes(&FeedRequest::new(cfg.clone(), "sense"))
            .await
            .unwrap();
        let mut other_feed = store
            .changes(&FeedRequest::new(FeedFilter::doc_ids(["x"]), "sense"))
            .await
            .unwrap();
        next(&mut cfg_feed).await;
        next(&mut other_feed).await;

        store.emit_to(&cfg, FeedEvent::Stop(None));
        store.emit(FeedEvent::Wait);

        assert_eq!(next(&mut cfg_feed).await, FeedEvent::Stop(None));
        assert_eq!(next(&mut other_feed).await, FeedEvent::Wait);
        assert_eq!(store.open_feeds(), 2);

        drop(cfg_feed);
        assert_eq!(store.open_feeds(), 1);
    }

    #[tokio::test]
    async fn test_fail_changes() {
        let store = MemoryStore::new();
        store.fail_changes(true);
        let request = FeedRequest::new(FeedFilter::doc_ids(["a"]), "sense");

        assert!(matches!(
            store.changes(&request).await,
            Err(StoreError::Connection(_))
        ));
    }
}
