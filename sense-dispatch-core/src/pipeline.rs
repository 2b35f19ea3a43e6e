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

//! Pipeline orchestration.
//!
//! The pipeline runs two independent workers:
//!
//! - the **configuration worker** follows the configuration document and
//!   swaps each new version into the [`SharedConfiguration`]
//! - the **domain worker** follows domain changes and, for each one, runs
//!   inline → dispatch → one detached send per message
//!
//! The two feeds race freely. A change is rendered with whatever
//! configuration is current when dispatch runs, which may be newer than the
//! one current when the change arrived.
//!
//! A feed that stops is reported by the listener, ends its worker and is not
//! restarted. The owner learns about it through
//! [`Pipeline::next_termination`].
//!
//! # Example
//!
//! ```rust,no_run
//! use sense_dispatch_core::pipeline::{Pipeline, PipelineConfig};
//! use sense_dispatch_core::reporter::ErrorReporter;
//! use sense_dispatch_core::sender::RecordingSender;
//! # use sense_dispatch_core::store::DocumentStore;
//!
//! # async fn example<S: DocumentStore + 'static>(store: S) -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::builder()
//!     .database("sense")
//!     .view("dashboard/symptomatic-followups-by-dateofvisit")
//!     .build()?;
//!
//! let mut pipeline = Pipeline::new(config, store, RecordingSender::new(), ErrorReporter::new());
//! pipeline.start().await?;
//!
//! // ... until shutdown ...
//! pipeline.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigurationDocument, ConfigurationError, SharedConfiguration};
use crate::dispatch::dispatch;
use crate::event::ChangeEvent;
use crate::feed::{ChangeFeedListener, FeedSubscription, FeedTerminated};
use crate::inline::Inliner;
use crate::metrics::{self, FeedKind, PipelineStatus};
use crate::reporter::ErrorReporter;
use crate::sender::{deliver, MessageSender};
use crate::store::{DocumentStore, FeedFilter, StoreError};
use crate::watcher::ConfigurationWatcher;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Default id of the configuration document.
pub const DEFAULT_CONFIGURATION_ID: &str = "sense-dispatch-configuration";

/// Default view selecting the domain changes to dispatch.
pub const DEFAULT_VIEW: &str = "dashboard/symptomatic-followups-by-dateofvisit";

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Database to watch
    pub database: String,

    /// Id of the configuration document
    pub configuration_id: String,

    /// Filter selecting domain changes
    pub domain_filter: FeedFilter,
}

impl PipelineConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    database: Option<String>,
    configuration_id: Option<String>,
    domain_filter: Option<FeedFilter>,
}

impl PipelineConfigBuilder {
    /// Sets the database name (required).
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the configuration document id.
    #[must_use]
    pub fn configuration_id(mut self, id: impl Into<String>) -> Self {
        self.configuration_id = Some(id.into());
        self
    }

    /// Sets the domain filter.
    #[must_use]
    pub fn domain_filter(mut self, filter: FeedFilter) -> Self {
        self.domain_filter = Some(filter);
        self
    }

    /// Selects domain changes with a named view.
    #[must_use]
    pub fn view(self, name: impl Into<String>) -> Self {
        self.domain_filter(FeedFilter::view(name))
    }

    /// Builds the `PipelineConfig`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the database is missing or any value is empty.
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let database = self
            .database
            .ok_or(ConfigError::MissingRequired { field: "database" })?;
        if database.is_empty() {
            return Err(ConfigError::invalid("database", "must not be empty"));
        }

        let configuration_id = self
            .configuration_id
            .unwrap_or_else(|| DEFAULT_CONFIGURATION_ID.to_string());
        if configuration_id.is_empty() {
            return Err(ConfigError::invalid("configuration_id", "must not be empty"));
        }

        let domain_filter = self
            .domain_filter
            .unwrap_or_else(|| FeedFilter::view(DEFAULT_VIEW));
        match &domain_filter {
            FeedFilter::DocIds { doc_ids } if doc_ids.is_empty() => {
                return Err(ConfigError::invalid(
                    "domain_filter",
                    "document id list must not be empty",
                ));
            }
            FeedFilter::View { view } if view.is_empty() => {
                return Err(ConfigError::invalid("domain_filter", "view name must not be empty"));
            }
            _ => {}
        }

        Ok(PipelineConfig {
            database,
            configuration_id,
            domain_filter,
        })
    }
}

/// Errors building a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required value was not provided
    #[error("Missing required configuration: {field}")]
    MissingRequired {
        /// Name of the missing value
        field: &'static str,
    },

    /// A value was provided but is not usable
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidValue {
        /// Name of the offending value
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

impl ConfigError {
    /// Creates an [`ConfigError::InvalidValue`].
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Pipeline statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Domain changes received
    pub changes_received: u64,

    /// Outbound messages handed to the sender
    pub messages_dispatched: u64,

    /// Changes abandoned because the template did not render
    pub render_failures: u64,

    /// Configuration documents applied
    pub configuration_updates: u64,
}

/// A feed that stopped while the pipeline was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoppedFeed {
    /// Which feed stopped
    pub feed: FeedKind,

    /// The terminal signal it delivered
    pub termination: FeedTerminated,
}

type WorkerHandle = JoinHandle<()>;

/// Pipeline orchestrator connecting change feeds to the message sender.
pub struct Pipeline<S: DocumentStore, M: MessageSender> {
    config: PipelineConfig,
    store: Arc<S>,
    sender: Arc<M>,
    reporter: ErrorReporter,

    /// Shutdown sender (set while running)
    shutdown_tx: Option<broadcast::Sender<()>>,

    workers: Arc<RwLock<Vec<WorkerHandle>>>,
    stats: Arc<RwLock<PipelineStats>>,
    running: Arc<RwLock<bool>>,

    /// Current configuration (set once started)
    configuration: Option<SharedConfiguration>,

    terminations: Option<mpsc::UnboundedReceiver<StoppedFeed>>,
}

impl<S, M> Pipeline<S, M>
where
    S: DocumentStore + 'static,
    M: MessageSender + 'static,
{
    /// Creates a new pipeline instance.
    pub fn new(config: PipelineConfig, store: S, sender: M, reporter: ErrorReporter) -> Self {
        info!(
            database = %config.database,
            configuration_id = %config.configuration_id,
            filter = ?config.domain_filter,
            "Creating pipeline"
        );

        Self {
            config,
            store: Arc::new(store),
            sender: Arc::new(sender),
            reporter,
            shutdown_tx: None,
            workers: Arc::new(RwLock::new(Vec::new())),
            stats: Arc::new(RwLock::new(PipelineStats::default())),
            running: Arc::new(RwLock::new(false)),
            configuration: None,
            terminations: None,
        }
    }

    /// Loads the configuration and starts both workers.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The pipeline is already running
    /// - The configuration document cannot be loaded
    /// - Either feed cannot be subscribed (already reported)
    #[instrument(skip(self), fields(database = %self.config.database))]
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        let mut running = self.running.write().await;
        if *running {
            return Err(PipelineError::AlreadyRunning);
        }

        info!("Starting pipeline");

        let watcher = ConfigurationWatcher::new(
            Arc::clone(&self.store),
            self.config.database.as_str(),
            self.config.configuration_id.as_str(),
            self.reporter.clone(),
        );

        let initial = watcher
            .get_initial()
            .await
            .map_err(PipelineError::InitialConfiguration)?;
        let shared = SharedConfiguration::new(initial);

        let configuration_feed = watcher.get_changes().await.map_err(PipelineError::Subscribe)?;
        let domain_feed = ChangeFeedListener::new(
            Arc::clone(&self.store),
            self.config.database.as_str(),
            self.reporter.clone(),
        )
        .listen(self.config.domain_filter.clone())
        .await
        .map_err(PipelineError::Subscribe)?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let (termination_tx, termination_rx) = mpsc::unbounded_channel();

        let configuration_worker = tokio::spawn(Self::configuration_worker(
            configuration_feed,
            shared.clone(),
            Arc::clone(&self.stats),
            self.reporter.clone(),
            shutdown_tx.subscribe(),
            termination_tx.clone(),
        ));

        let domain_worker = tokio::spawn(Self::domain_worker(
            domain_feed,
            shared.clone(),
            Inliner::new(Arc::clone(&self.store), self.reporter.clone()),
            Arc::clone(&self.sender),
            Arc::clone(&self.stats),
            self.reporter.clone(),
            shutdown_tx.subscribe(),
            termination_tx,
        ));

        let mut workers = self.workers.write().await;
        workers.push(configuration_worker);
        workers.push(domain_worker);

        self.shutdown_tx = Some(shutdown_tx);
        self.configuration = Some(shared);
        self.terminations = Some(termination_rx);
        *running = true;

        metrics::set_pipeline_status(PipelineStatus::Running);
        info!(workers = workers.len(), "Pipeline started");

        Ok(())
    }

    /// Follows the configuration document until shutdown or termination.
    async fn configuration_worker(
        mut feed: FeedSubscription,
        shared: SharedConfiguration,
        stats: Arc<RwLock<PipelineStats>>,
        reporter: ErrorReporter,
        mut shutdown_rx: broadcast::Receiver<()>,
        terminations: mpsc::UnboundedSender<StoppedFeed>,
    ) {
        info!(label = %feed.label(), "Configuration worker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Configuration worker received shutdown signal");
                    break;
                }
                item = feed.next() => match item {
                    Some(Ok(change)) => match ConfigurationDocument::from_change(&change) {
                        Ok(configuration) => {
                            info!(
                                seq = %change.seq,
                                recipients = configuration.recipients.len(),
                                "Configuration updated"
                            );
                            shared.replace(configuration);
                            stats.write().await.configuration_updates += 1;
                            metrics::increment_configuration_updates();
                        }
                        Err(e) => reporter.capture_error(&e),
                    },
                    Some(Err(termination)) => {
                        let _ = terminations.send(StoppedFeed {
                            feed: FeedKind::Configuration,
                            termination,
                        });
                        break;
                    }
                    None => break,
                }
            }
        }

        feed.close();
        info!("Configuration worker stopped");
    }

    /// Follows domain changes until shutdown or termination.
    #[allow(clippy::too_many_arguments)]
    async fn domain_worker(
        mut feed: FeedSubscription,
        shared: SharedConfiguration,
        inliner: Inliner<S>,
        sender: Arc<M>,
        stats: Arc<RwLock<PipelineStats>>,
        reporter: ErrorReporter,
        mut shutdown_rx: broadcast::Receiver<()>,
        terminations: mpsc::UnboundedSender<StoppedFeed>,
    ) {
        info!(label = %feed.label(), "Domain worker started");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!("Domain worker received shutdown signal");
                    break;
                }
                item = feed.next() => match item {
                    Some(Ok(change)) => {
                        Self::handle_change(change, &shared, &inliner, &sender, &stats, &reporter)
                            .await;
                    }
                    Some(Err(termination)) => {
                        metrics::set_pipeline_status(PipelineStatus::Error);
                        let _ = terminations.send(StoppedFeed {
                            feed: FeedKind::Domain,
                            termination,
                        });
                        break;
                    }
                    None => break,
                }
            }
        }

        feed.close();
        info!("Domain worker stopped");
    }

    /// Inlines, renders and fans out one change.
    async fn handle_change(
        change: ChangeEvent,
        shared: &SharedConfiguration,
        inliner: &Inliner<S>,
        sender: &Arc<M>,
        stats: &Arc<RwLock<PipelineStats>>,
        reporter: &ErrorReporter,
    ) {
        stats.write().await.changes_received += 1;

        let change = inliner.inline(change, &shared.current()).await;

        // Re-read: dispatch uses whatever is current now.
        let configuration = shared.current();

        let messages = match dispatch(&configuration, &change) {
            Ok(messages) => messages,
            Err(e) => {
                stats.write().await.render_failures += 1;
                metrics::increment_render_failures();
                reporter.capture_message(
                    format!("error rendering template for change {}", change.id),
                    json!({ "id": change.id, "seq": change.seq, "error": e.to_string() }),
                );
                return;
            }
        };

        stats.write().await.messages_dispatched += messages.len() as u64;
        metrics::increment_messages_dispatched(messages.len());
        metrics::record_fan_out(messages.len());

        for message in messages {
            let sender = Arc::clone(sender);
            let reporter = reporter.clone();
            tokio::spawn(async move {
                deliver(sender.as_ref(), &reporter, &message).await;
            });
        }
    }

    /// Stops both workers and closes their feeds.
    ///
    /// In-flight sends are detached and are not awaited.
    ///
    /// # Errors
    ///
    /// Currently infallible; worker panics are logged.
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> Result<(), PipelineError> {
        info!("Stopping pipeline");

        let mut running = self.running.write().await;
        if !*running {
            warn!("Pipeline is not running");
            return Ok(());
        }

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        let mut workers = self.workers.write().await;
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                error!(?e, "Worker panicked");
            }
        }

        *running = false;
        metrics::set_pipeline_status(PipelineStatus::Stopped);

        let stats = self.stats.read().await;
        info!(
            changes_received = stats.changes_received,
            messages_dispatched = stats.messages_dispatched,
            render_failures = stats.render_failures,
            configuration_updates = stats.configuration_updates,
            "Pipeline stopped"
        );

        Ok(())
    }

    /// Waits for the next feed that stops on its own.
    ///
    /// Returns `None` before [`start`](Self::start) and once both workers
    /// have ended.
    pub async fn next_termination(&mut self) -> Option<StoppedFeed> {
        self.terminations.as_mut()?.recv().await
    }

    /// Snapshot of the configuration currently used for dispatch.
    #[must_use]
    pub fn configuration(&self) -> Option<Arc<ConfigurationDocument>> {
        self.configuration.as_ref().map(SharedConfiguration::current)
    }

    /// Returns the current pipeline statistics.
    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Checks if the pipeline is currently running.
    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Pipeline is already running
    #[error("Pipeline is already running")]
    AlreadyRunning,

    /// The configuration document could not be loaded at startup
    #[error("Could not load initial configuration")]
    InitialConfiguration(#[source] ConfigurationError),

    /// A change feed could not be opened
    #[error("Could not subscribe to changes")]
    Subscribe(#[source] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = PipelineConfig::builder().database("sense").build().unwrap();

        assert_eq!(config.database, "sense");
        assert_eq!(config.configuration_id, DEFAULT_CONFIGURATION_ID);
        assert_eq!(config.domain_filter, FeedFilter::view(DEFAULT_VIEW));
    }

    #[test]
    fn test_builder_requires_database() {
        assert_eq!(
            PipelineConfig::builder().build().unwrap_err(),
            ConfigError::MissingRequired { field: "database" }
        );
    }

    #[test]
    fn test_builder_rejects_empty_values() {
        let err = PipelineConfig::builder().database("").build().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "database", .. }));

        let err = PipelineConfig::builder()
            .database("sense")
            .configuration_id("")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "configuration_id", .. }));

        let err = PipelineConfig::builder()
            .database("sense")
            .domain_filter(FeedFilter::doc_ids(Vec::<String>::new()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field: "domain_filter", .. }));
    }

    #[test]
    fn test_builder_overrides() {
        let config = PipelineConfig::builder()
            .database("sense")
            .configuration_id("cfg")
            .view("dashboard/other")
            .build()
            .unwrap();

        assert_eq!(config.configuration_id, "cfg");
        assert_eq!(config.domain_filter, FeedFilter::view("dashboard/other"));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            ConfigError::invalid("url", "must use http or https").to_string(),
            "Invalid configuration for url: must use http or https"
        );
        assert_eq!(
            PipelineError::AlreadyRunning.to_string(),
            "Pipeline is already running"
        );
    }
}
