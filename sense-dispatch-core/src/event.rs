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

//! Change Event Representation
//!
//! A [`ChangeEvent`] is one detected mutation in a watched change feed. Events
//! are created by the change feed listener, handed to the dispatch pipeline and
//! dropped once the pipeline is done with them. Durability of the feed cursor
//! (`seq`) belongs to the store, not to this crate.
//!
//! # Field Paths
//!
//! Documents are addressed with dotted field paths (`"patient.name"`,
//! `"visits.0.date"`). Numeric segments index into arrays. [`lookup`] and
//! [`set_path`] are shared by the inliner and the template renderer.
//!
//! # Examples
//!
//! ```rust
//! use sense_dispatch_core::event::ChangeEvent;
//! use bson::doc;
//!
//! let event = ChangeEvent::new("visit-1", "42", Some(doc! {
//!     "patient": { "name": "Ann" },
//! }));
//!
//! assert_eq!(event.lookup("patient.name").and_then(|v| v.as_str()), Some("Ann"));
//! assert!(event.lookup("patient.age").is_none());
//! ```

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

/// A single change detected on a change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Id of the document that changed
    pub id: String,

    /// Sequence token of this change; feeds can be resumed from it
    pub seq: String,

    /// Document body, present when the feed was opened with `include_docs`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

impl ChangeEvent {
    /// Creates a new change event.
    pub fn new(id: impl Into<String>, seq: impl Into<String>, doc: Option<Document>) -> Self {
        Self {
            id: id.into(),
            seq: seq.into(),
            doc,
        }
    }

    /// Returns true if the change carries a document body.
    #[inline]
    pub fn has_document(&self) -> bool {
        self.doc.is_some()
    }

    /// Reads the value at `path` within the document body.
    ///
    /// Returns `None` if there is no body or the path does not resolve.
    pub fn lookup(&self, path: &str) -> Option<&Bson> {
        lookup(self.doc.as_ref()?, path)
    }
}

/// Resolves a dotted field path within a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Replaces the value at an existing dotted field path.
///
/// Intermediate documents and arrays must already exist. Returns `false`
/// (leaving `doc` untouched) when the path does not resolve to a slot.
pub fn set_path(doc: &mut Document, path: &str, value: Bson) -> bool {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
            true
        }
        Some((head, rest)) => match doc.get_mut(head) {
            Some(next) => set_in_value(next, rest, value),
            None => false,
        },
    }
}

fn set_in_value(target: &mut Bson, path: &str, value: Bson) -> bool {
    match target {
        Bson::Document(inner) => set_path(inner, path, value),
        Bson::Array(items) => {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path, None),
            };
            let Some(slot) = head.parse::<usize>().ok().and_then(|i| items.get_mut(i)) else {
                return false;
            };
            match rest {
                None => {
                    *slot = value;
                    true
                }
                Some(rest) => set_in_value(slot, rest, value),
            }
        }
        _ => false,
    }
}
