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

//! Configuration watcher: a change feed scoped to the configuration document.

use crate::config::{ConfigurationDocument, ConfigurationError};
use crate::feed::{ChangeFeedListener, FeedSubscription};
use crate::metrics::FeedKind;
use crate::reporter::ErrorReporter;
use crate::store::{DocumentStore, FeedFilter, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Reads and follows the configuration document with a well-known id.
pub struct ConfigurationWatcher<S: DocumentStore> {
    store: Arc<S>,
    listener: ChangeFeedListener<S>,
    configuration_id: String,
}

impl<S: DocumentStore> ConfigurationWatcher<S> {
    /// Creates a watcher for `configuration_id` in `database`.
    pub fn new(
        store: Arc<S>,
        database: impl Into<String>,
        configuration_id: impl Into<String>,
        reporter: ErrorReporter,
    ) -> Self {
        let listener = ChangeFeedListener::new(Arc::clone(&store), database, reporter)
            .kind(FeedKind::Configuration);
        Self {
            store,
            listener,
            configuration_id: configuration_id.into(),
        }
    }

    /// Id of the watched document.
    #[must_use]
    pub fn configuration_id(&self) -> &str {
        &self.configuration_id
    }

    /// Fetches the configuration once.
    ///
    /// # Errors
    ///
    /// [`ConfigurationError::Store`] if the document is absent or the store is
    /// unreachable, [`ConfigurationError::Invalid`] if it does not decode.
    pub async fn get_initial(&self) -> Result<ConfigurationDocument, ConfigurationError> {
        let doc = self.store.get(&self.configuration_id).await?;
        let configuration = ConfigurationDocument::from_document(doc)?;
        debug!(
            id = %self.configuration_id,
            recipients = configuration.recipients.len(),
            "Loaded configuration"
        );
        Ok(configuration)
    }

    /// Subscribes to updates of the configuration document.
    ///
    /// Each change carries the full updated document; decode it with
    /// [`ConfigurationDocument::from_change`].
    ///
    /// # Errors
    ///
    /// Returns the store error if the subscription cannot be set up.
    pub async fn get_changes(&self) -> Result<FeedSubscription, StoreError> {
        self.listener
            .listen(FeedFilter::doc_ids([self.configuration_id.as_str()]))
            .await
    }
}
