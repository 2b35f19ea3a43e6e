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

//! Dispatch configuration.
//!
//! The live rule set is a [`ConfigurationDocument`] stored in the database
//! under a well-known id. It is read once at startup and then kept current
//! by the configuration watcher, which swaps the whole document into a
//! [`SharedConfiguration`] on every update.
//!
//! Readers take an `Arc` snapshot and never observe a half-applied update.
//! A dispatch that started before an update finishes with the configuration
//! it started with.

use crate::event::ChangeEvent;
use crate::store::StoreError;
use bson::Document;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// The dispatch rule set.
///
/// Stored as `{template, recipients, inlinePath?}`; any other fields on the
/// stored document (`_id`, revision markers) are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationDocument {
    /// Message template with `{{field.path}}` placeholders
    pub template: String,

    /// Recipient identifiers, in send order
    pub recipients: Vec<String>,

    /// Field path naming a document id to inline before rendering
    #[serde(
        rename = "inlinePath",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub inline_path: Option<String>,
}

impl ConfigurationDocument {
    /// Creates a configuration without an inline path.
    pub fn new<I, T>(template: impl Into<String>, recipients: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            template: template.into(),
            recipients: recipients.into_iter().map(Into::into).collect(),
            inline_path: None,
        }
    }

    /// Sets the inline path.
    #[must_use]
    pub fn with_inline_path(mut self, path: impl Into<String>) -> Self {
        self.inline_path = Some(path.into());
        self
    }

    /// Returns the inline path, treating an empty string as unset.
    #[must_use]
    pub fn inline_path(&self) -> Option<&str> {
        self.inline_path.as_deref().filter(|p| !p.is_empty())
    }

    /// Decodes a configuration from a stored document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Invalid`] if required fields are missing
    /// or have the wrong type.
    pub fn from_document(doc: Document) -> Result<Self, ConfigurationError> {
        bson::from_document(doc).map_err(|e| ConfigurationError::Invalid(e.to_string()))
    }

    /// Decodes a configuration from a configuration-feed change.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingBody`] if the change carries no
    /// document, or [`ConfigurationError::Invalid`] if it cannot be decoded.
    pub fn from_change(change: &ChangeEvent) -> Result<Self, ConfigurationError> {
        let doc = change
            .doc
            .clone()
            .ok_or_else(|| ConfigurationError::MissingBody(change.id.clone()))?;
        Self::from_document(doc)
    }
}

/// Errors loading or decoding the configuration document.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// The store could not provide the document
    #[error("Could not load configuration: {0}")]
    Store(#[from] StoreError),

    /// The stored document is not a valid configuration
    #[error("Invalid configuration document: {0}")]
    Invalid(String),

    /// A configuration change arrived without a document body
    #[error("Configuration change for {0} carried no document")]
    MissingBody(String),
}

/// Process-wide holder of the current configuration.
///
/// Backed by a `tokio::sync::watch` channel: exactly one value is current,
/// replacement is a single atomic swap, and any number of readers can take
/// snapshots without coordinating with the writer.
#[derive(Debug, Clone)]
pub struct SharedConfiguration {
    tx: Arc<watch::Sender<Arc<ConfigurationDocument>>>,
}

impl SharedConfiguration {
    /// Creates the holder with an initial configuration.
    #[must_use]
    pub fn new(initial: ConfigurationDocument) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Returns a snapshot of the current configuration.
    #[must_use]
    pub fn current(&self) -> Arc<ConfigurationDocument> {
        Arc::clone(&self.tx.borrow())
    }

    /// Replaces the current configuration wholesale.
    pub fn replace(&self, configuration: ConfigurationDocument) {
        self.tx.send_replace(Arc::new(configuration));
    }

    /// Subscribes to configuration replacements.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConfigurationDocument>> {
        self.tx.subscribe()
    }
}
