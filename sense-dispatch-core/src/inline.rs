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

//! Document inlining.
//!
//! When the configuration names an `inlinePath`, the value found at that path
//! in the change is treated as a document id. The referenced document is
//! fetched and substituted in place, so templates can reach into it
//! (`{{patientRef.name}}`).
//!
//! Inlining never aborts a dispatch. Any failure is reported once and the
//! change is passed on exactly as it arrived.

use crate::config::ConfigurationDocument;
use crate::event::{set_path, ChangeEvent};
use crate::metrics;
use crate::reporter::ErrorReporter;
use crate::store::DocumentStore;
use bson::Bson;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Resolves document references inside changes.
pub struct Inliner<S: DocumentStore> {
    store: Arc<S>,
    reporter: ErrorReporter,
}

impl<S: DocumentStore> Inliner<S> {
    /// Creates an inliner reading from `store`.
    pub fn new(store: Arc<S>, reporter: ErrorReporter) -> Self {
        Self { store, reporter }
    }

    /// Returns `change` with the configured reference replaced by the
    /// referenced document.
    ///
    /// Without an inline path the change is returned untouched. If the
    /// reference is missing, is not an id, or cannot be fetched, one report
    /// is captured and the original change is returned.
    pub async fn inline(
        &self,
        change: ChangeEvent,
        configuration: &ConfigurationDocument,
    ) -> ChangeEvent {
        let Some(path) = configuration.inline_path() else {
            return change;
        };

        let Some(id) = reference_id(change.lookup(path)) else {
            metrics::increment_inline_failures("invalid_reference");
            self.reporter.capture_message(
                format!("error inlining document for change {}", change.id),
                json!({ "path": path, "reason": "no document id at path" }),
            );
            return change;
        };

        match self.store.get(&id).await {
            Ok(referenced) => {
                let mut inlined = change.clone();
                let replaced = inlined
                    .doc
                    .as_mut()
                    .is_some_and(|doc| set_path(doc, path, Bson::Document(referenced)));
                if replaced {
                    debug!(id = %change.id, reference = %id, path, "inlined document");
                    inlined
                } else {
                    change
                }
            }
            Err(e) => {
                metrics::increment_inline_failures(e.category());
                self.reporter
                    .capture_message(format!("error inlining document {id}"), e.to_extra());
                change
            }
        }
    }
}

fn reference_id(value: Option<&Bson>) -> Option<String> {
    match value? {
        Bson::String(id) if !id.is_empty() => Some(id.clone()),
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::MemorySink;
    use crate::store::{FeedRequest, FeedStream, StoreError};
    use async_trait::async_trait;
    use bson::{doc, Document};
    use std::collections::HashMap;

    struct FixedStore {
        docs: HashMap<String, Document>,
        unreachable: bool,
    }

    impl FixedStore {
        fn with(id: &str, doc: Document) -> Self {
            Self {
                docs: HashMap::from([(id.to_string(), doc)]),
                unreachable: false,
            }
        }
    }

    #[async_trait]
    impl DocumentStore for FixedStore {
        async fn get(&self, id: &str) -> Result<Document, StoreError> {
            if self.unreachable {
                return Err(StoreError::Connection("store unreachable".into()));
            }
            self.docs
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        }

        async fn changes(&self, _request: &FeedRequest) -> Result<FeedStream, StoreError> {
            Err(StoreError::Other("feeds not supported".into()))
        }
    }

    fn inliner(store: FixedStore) -> (Inliner<FixedStore>, MemorySink) {
        let sink = MemorySink::new();
        let reporter = ErrorReporter::new().with_sink(sink.clone());
        (Inliner::new(Arc::new(store), reporter), sink)
    }

    #[tokio::test]
    async fn test_inline_without_path_is_identity() {
        let (inliner, sink) = inliner(FixedStore::with("doc42", doc! { "name": "Bob" }));
        let change = ChangeEvent::new("visit-1", "1", Some(doc! { "patientRef": "doc42" }));
        let config = ConfigurationDocument::new("t", ["+1"]);

        assert_eq!(inliner.inline(change.clone(), &config).await, change);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_inline_replaces_reference() {
        let (inliner, sink) = inliner(FixedStore::with("doc42", doc! { "name": "Bob" }));
        let change = ChangeEvent::new("visit-1", "1", Some(doc! { "patientRef": "doc42" }));
        let config = ConfigurationDocument::new("t", ["+1"]).with_inline_path("patientRef");

        let inlined = inliner.inline(change, &config).await;

        assert_eq!(inlined.doc, Some(doc! { "patientRef": { "name": "Bob" } }));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_inline_nested_path() {
        let (inliner, _sink) = inliner(FixedStore::with("doc42", doc! { "name": "Bob" }));
        let change = ChangeEvent::new(
            "visit-1",
            "1",
            Some(doc! { "visit": { "patient": "doc42", "date": "2016-03-01" } }),
        );
        let config = ConfigurationDocument::new("t", ["+1"]).with_inline_path("visit.patient");

        let inlined = inliner.inline(change, &config).await;

        assert_eq!(
            inlined.lookup("visit.patient.name"),
            Some(&Bson::String("Bob".into()))
        );
        assert_eq!(
            inlined.lookup("visit.date"),
            Some(&Bson::String("2016-03-01".into()))
        );
    }

    #[tokio::test]
    async fn test_inline_fetch_failure_returns_original() {
        let (inliner, sink) = inliner(FixedStore::with("other", doc! {}));
        let change = ChangeEvent::new("visit-1", "1", Some(doc! { "patientRef": "doc42" }));
        let config = ConfigurationDocument::new("t", ["+1"]).with_inline_path("patientRef");

        let result = inliner.inline(change.clone(), &config).await;

        assert_eq!(result, change);
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].message, "error inlining document doc42");
        assert_eq!(reports[0].extra["category"], "not_found");
    }

    #[tokio::test]
    async fn test_inline_store_unreachable() {
        let mut store = FixedStore::with("doc42", doc! { "name": "Bob" });
        store.unreachable = true;
        let (inliner, sink) = inliner(store);
        let change = ChangeEvent::new("visit-1", "1", Some(doc! { "patientRef": "doc42" }));
        let config = ConfigurationDocument::new("t", ["+1"]).with_inline_path("patientRef");

        assert_eq!(inliner.inline(change.clone(), &config).await, change);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_inline_missing_reference_reports_once() {
        let (inliner, sink) = inliner(FixedStore::with("doc42", doc! { "name": "Bob" }));
        let change = ChangeEvent::new("visit-1", "1", Some(doc! { "other": 1 }));
        let config = ConfigurationDocument::new("t", ["+1"]).with_inline_path("patientRef");

        assert_eq!(inliner.inline(change.clone(), &config).await, change);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_inline_object_id_reference() {
        let oid = bson::oid::ObjectId::new();
        let (inliner, _sink) = inliner(FixedStore::with(&oid.to_hex(), doc! { "name": "Bob" }));
        let change = ChangeEvent::new("visit-1", "1", Some(doc! { "patientRef": oid }));
        let config = ConfigurationDocument::new("t", ["+1"]).with_inline_path("patientRef");

        let inlined = inliner.inline(change, &config).await;
        assert_eq!(
            inlined.lookup("patientRef.name"),
            Some(&Bson::String("Bob".into()))
        );
    }
}
