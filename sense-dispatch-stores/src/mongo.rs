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

//! `MongoDB` document store.
//!
//! Documents live in one collection; feeds are `MongoDB` change streams on
//! that collection.
//!
//! # Filters
//!
//! - `_doc_ids` becomes `{"$match": {"documentKey._id": {"$in": ids}}}`
//! - `_view` looks the view name up in [`MongoStoreConfig::views`], a
//!   registry of named aggregation pipelines
//!
//! # Reconnection
//!
//! Each feed runs in its own task. When the change stream fails with a
//! retryable error the task emits `error`, then `retry`, waits with
//! exponential backoff and jitter (100ms, 200ms, 400ms, ... capped at
//! `max_backoff_ms`) and reopens the stream after the last seen resume
//! token, emitting `catchup` once it is back. The feed emits `stop` when:
//!
//! - `max_reconnect_attempts` consecutive reopen attempts fail
//! - the error is not retryable (authentication, invalid resume token, ...)
//! - the stream is invalidated (collection dropped or renamed)
//! - the cursor ends
//!
//! Dropping the feed stream ends the task.
//!
//! # Example
//!
//! ```rust,no_run
//! use sense_dispatch_stores::mongo::{MongoStore, MongoStoreConfig};
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MongoStoreConfig::builder()
//!     .uri("mongodb://localhost:27017/?replicaSet=rs0")
//!     .database("sense")
//!     .view(
//!         "dashboard/symptomatic-followups-by-dateofvisit",
//!         vec![doc! { "$match": { "fullDocument.symptomatic": true } }],
//!     )
//!     .build()?;
//!
//! let store = MongoStore::connect(config).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::{self, StreamExt};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::error::{Error as MongoError, ErrorKind as MongoErrorKind};
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{Client, Collection};
use sense_dispatch_core::event::ChangeEvent;
use sense_dispatch_core::pipeline::ConfigError;
use sense_dispatch_core::store::{
    DocumentStore, FeedEvent, FeedFailure, FeedFilter, FeedRequest, FeedStream, Since, StoreError,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type MongoChangeStream = ChangeStream<ChangeStreamEvent<Document>>;

/// Server error code for a resume token that can no longer be used.
const CHANGE_STREAM_FATAL_ERROR: i32 = 286;

/// Configuration for [`MongoStore`].
#[derive(Debug, Clone)]
pub struct MongoStoreConfig {
    /// Connection string
    pub uri: String,

    /// Database used for document reads
    pub database: String,

    /// Collection holding the documents
    pub collection: String,

    /// Named change stream pipelines
    pub views: HashMap<String, Vec<Document>>,

    /// Initial backoff delay in milliseconds
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    pub max_backoff_ms: u64,

    /// Consecutive reopen attempts before a feed stops (0 = unlimited)
    pub max_reconnect_attempts: u32,

    /// Random spread applied to each backoff (0.0 to 1.0)
    pub backoff_jitter: f64,

    /// Notifications buffered per feed
    pub feed_buffer: usize,
}

impl MongoStoreConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> MongoStoreConfigBuilder {
        MongoStoreConfigBuilder::default()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::invalid(
                "initial_backoff_ms",
                "must be greater than 0",
            ));
        }

        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::invalid(
                "initial_backoff_ms",
                format!(
                    "({}) must be <= max_backoff_ms ({})",
                    self.initial_backoff_ms, self.max_backoff_ms
                ),
            ));
        }

        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::invalid(
                "backoff_jitter",
                format!("({}) must be between 0.0 and 1.0", self.backoff_jitter),
            ));
        }

        if self.feed_buffer == 0 {
            return Err(ConfigError::invalid("feed_buffer", "must be greater than 0"));
        }

        Ok(())
    }

    /// Backoff before reopen attempt `attempt` (1-based).
    ///
    /// `initial * 2^(attempt-1)`, capped at `max_backoff_ms`, spread by
    /// ±`base * jitter / 2`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self
            .initial_backoff_ms
            .saturating_mul(1_u64 << attempt.saturating_sub(1).min(63))
            .min(self.max_backoff_ms);

        if self.backoff_jitter > 0.0 {
            let jitter_range = (base_ms as f64) * self.backoff_jitter;
            let jitter = (rand::random::<f64>() * jitter_range) - (jitter_range / 2.0);
            Duration::from_millis(((base_ms as f64) + jitter).max(0.0) as u64)
        } else {
            Duration::from_millis(base_ms)
        }
    }
}

/// Builder for [`MongoStoreConfig`].
#[derive(Debug, Default)]
pub struct MongoStoreConfigBuilder {
    uri: Option<String>,
    database: Option<String>,
    collection: Option<String>,
    views: HashMap<String, Vec<Document>>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    backoff_jitter: Option<f64>,
    feed_buffer: Option<usize>,
}

impl MongoStoreConfigBuilder {
    /// Sets the connection string (required).
    #[must_use]
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Sets the database (required).
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Sets the document collection.
    ///
    /// Default: `documents`
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Registers a named view as a change stream pipeline.
    #[must_use]
    pub fn view(mut self, name: impl Into<String>, pipeline: Vec<Document>) -> Self {
        self.views.insert(name.into(), pipeline);
        self
    }

    /// Sets the initial backoff duration in milliseconds.
    ///
    /// Default: 100ms
    #[must_use]
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = Some(ms);
        self
    }

    /// Sets the maximum backoff duration in milliseconds.
    ///
    /// Default: 30,000ms (30 seconds)
    #[must_use]
    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = Some(ms);
        self
    }

    /// Sets the maximum number of consecutive reopen attempts.
    ///
    /// Set to 0 for infinite retries (use with caution).
    /// Default: 5
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    /// Sets the backoff jitter factor (0.0 to 1.0).
    ///
    /// Default: 0.1
    #[must_use]
    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.backoff_jitter = Some(jitter);
        self
    }

    /// Sets how many notifications each feed buffers.
    ///
    /// Default: 256
    #[must_use]
    pub fn feed_buffer(mut self, size: usize) -> Self {
        self.feed_buffer = Some(size);
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `uri` or `database` is missing, or if:
    /// - `initial_backoff_ms` is 0 or greater than `max_backoff_ms`
    /// - `backoff_jitter` is outside 0.0 to 1.0
    pub fn build(self) -> Result<MongoStoreConfig, ConfigError> {
        let config = MongoStoreConfig {
            uri: self.uri.ok_or(ConfigError::MissingRequired { field: "uri" })?,
            database: self
                .database
                .ok_or(ConfigError::MissingRequired { field: "database" })?,
            collection: self.collection.unwrap_or_else(|| "documents".to_string()),
            views: self.views,
            initial_backoff_ms: self.initial_backoff_ms.unwrap_or(100),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(30_000),
            max_reconnect_attempts: self.max_reconnect_attempts.unwrap_or(5),
            backoff_jitter: self.backoff_jitter.unwrap_or(0.1),
            feed_buffer: self.feed_buffer.unwrap_or(256),
        };

        config.validate()?;
        Ok(config)
    }
}

/// [`DocumentStore`] backed by `MongoDB`.
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    config: MongoStoreConfig,
}

impl MongoStore {
    /// Connects to the server.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the connection string is invalid
    /// or the client cannot be created.
    pub async fn connect(config: MongoStoreConfig) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&config.uri)
            .await
            .map_err(|e| store_error(&e))?;

        info!(
            database = %config.database,
            collection = %config.collection,
            views = config.views.len(),
            "Connected to MongoDB"
        );

        Ok(Self { client, config })
    }

    /// Returns the store configuration.
    #[must_use]
    pub fn config(&self) -> &MongoStoreConfig {
        &self.config
    }

    fn collection(&self, database: &str) -> Collection<Document> {
        self.client
            .database(database)
            .collection(&self.config.collection)
    }

    fn feed_pipeline(&self, filter: &FeedFilter) -> Result<Vec<Document>, StoreError> {
        match filter {
            FeedFilter::DocIds { doc_ids } => Ok(vec![doc! {
                "$match": { "documentKey._id": { "$in": doc_ids.clone() } }
            }]),
            FeedFilter::View { view } => self
                .config
                .views
                .get(view)
                .cloned()
                .ok_or_else(|| StoreError::UnknownView(view.clone())),
        }
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn get(&self, id: &str) -> Result<Document, StoreError> {
        let collection = self.collection(&self.config.database);

        if let Some(doc) = collection
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| store_error(&e))?
        {
            return Ok(doc);
        }

        // Ids referenced from other documents may be hex object ids.
        if let Ok(oid) = bson::oid::ObjectId::parse_str(id) {
            if let Some(doc) = collection
                .find_one(doc! { "_id": oid })
                .await
                .map_err(|e| store_error(&e))?
            {
                return Ok(doc);
            }
        }

        Err(StoreError::NotFound(id.to_string()))
    }

    async fn changes(&self, request: &FeedRequest) -> Result<FeedStream, StoreError> {
        let pipeline = self.feed_pipeline(&request.filter)?;
        let resume_after = match &request.since {
            Since::Now => None,
            Since::Sequence(token) => Some(parse_token(token)?),
        };

        let feed = FeedTask {
            collection: self.collection(&request.database),
            pipeline,
            include_docs: request.include_docs,
            config: self.config.clone(),
            label: request.label(),
        };

        let stream = feed
            .open(resume_after.clone())
            .await
            .map_err(|e| store_error(&e))?;

        let (tx, rx) = mpsc::channel(self.config.feed_buffer);
        tokio::spawn(feed.run(stream, resume_after, tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }
}

/// Background task driving one change stream.
struct FeedTask {
    collection: Collection<Document>,
    pipeline: Vec<Document>,
    include_docs: bool,
    config: MongoStoreConfig,
    label: String,
}

/// Opens a change stream, resuming after the given token.
#[async_trait]
trait StreamOpener: Sync {
    type Stream: Send;

    async fn open(&self, resume_after: Option<ResumeToken>) -> Result<Self::Stream, MongoError>;
}

#[async_trait]
impl StreamOpener for FeedTask {
    type Stream = MongoChangeStream;

    async fn open(&self, resume_after: Option<ResumeToken>) -> Result<MongoChangeStream, MongoError> {
        let mut options = ChangeStreamOptions::default();
        if self.include_docs {
            options.full_document = Some(FullDocumentType::UpdateLookup);
        }
        options.resume_after = resume_after;

        self.collection
            .watch()
            .pipeline(self.pipeline.clone())
            .with_options(options)
            .await
    }
}

impl FeedTask {
    async fn run(
        self,
        mut stream: MongoChangeStream,
        mut last_token: Option<ResumeToken>,
        tx: mpsc::Sender<FeedEvent>,
    ) {
        if tx.send(FeedEvent::Confirm).await.is_err() {
            return;
        }

        loop {
            let next = tokio::select! {
                () = tx.closed() => {
                    debug!(label = %self.label, "Feed dropped, closing change stream");
                    return;
                }
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    let recovered =
                        recover(&self, &self.config, &self.label, e, last_token.clone(), &tx).await;
                    match recovered {
                        Some(reopened) => {
                            stream = reopened;
                            continue;
                        }
                        None => return,
                    }
                }
                None => {
                    warn!(label = %self.label, "Change stream ended unexpectedly");
                    let failure = FeedFailure::new("change stream cursor ended");
                    let _ = tx.send(FeedEvent::Stop(Some(failure))).await;
                    return;
                }
            };

            last_token = Some(event.id.clone());

            if matches!(event.operation_type, OperationType::Invalidate) {
                error!(label = %self.label, "Change stream invalidated");
                let failure = FeedFailure::new(format!(
                    "collection {} was dropped or renamed",
                    self.config.collection
                ));
                let _ = tx.send(FeedEvent::Stop(Some(failure))).await;
                return;
            }

            let Some(change) = to_change(event, self.include_docs) else {
                continue;
            };
            if tx.send(FeedEvent::Change(change)).await.is_err() {
                return;
            }
        }
    }
}

/// Reopens the stream after `err`, or emits `stop` and returns `None`.
///
/// Emits `error` for every retryable failure, then `retry` before each
/// reopen attempt and `catchup` once a reopen succeeds. Returns `None`
/// without `stop` if the receiver goes away.
async fn recover<O: StreamOpener>(
    opener: &O,
    config: &MongoStoreConfig,
    label: &str,
    mut err: MongoError,
    last_token: Option<ResumeToken>,
    tx: &mpsc::Sender<FeedEvent>,
) -> Option<O::Stream> {
    let mut attempt: u32 = 0;

    loop {
        let failure = feed_failure(&err);
        if !is_retryable(&err) {
            error!(label = %label, error = %err, "Fatal change stream error");
            let _ = tx.send(FeedEvent::Stop(Some(failure))).await;
            return None;
        }

        warn!(label = %label, error = %err, "Retryable change stream error");
        tx.send(FeedEvent::Error(failure)).await.ok()?;

        attempt += 1;
        let max = config.max_reconnect_attempts;
        if max > 0 && attempt > max {
            error!(label = %label, attempts = attempt - 1, "Max reconnection attempts exceeded");
            let failure = FeedFailure::new(format!("gave up after {max} reconnection attempts"));
            let _ = tx.send(FeedEvent::Stop(Some(failure))).await;
            return None;
        }

        let backoff = config.backoff(attempt);
        let since = last_token
            .as_ref()
            .map_or_else(|| Since::Now.to_string(), token_string);
        tx.send(FeedEvent::Retry {
            since: since.clone(),
            after: backoff,
        })
        .await
        .ok()?;

        tokio::select! {
            () = tx.closed() => return None,
            () = tokio::time::sleep(backoff) => {}
        }

        match opener.open(last_token.clone()).await {
            Ok(stream) => {
                info!(label = %label, attempt, "Reconnected to change stream");
                tx.send(FeedEvent::Catchup { seq: since }).await.ok()?;
                return Some(stream);
            }
            Err(e) => err = e,
        }
    }
}

/// Converts a driver event into a change, skipping namespace-level events.
fn to_change(event: ChangeStreamEvent<Document>, include_docs: bool) -> Option<ChangeEvent> {
    let kind = event.operation_type.clone();
    if !matches!(
        kind,
        OperationType::Insert | OperationType::Update | OperationType::Replace | OperationType::Delete
    ) {
        debug!(operation = ?kind, "Skipping change stream event");
        return None;
    }

    let id = event
        .document_key
        .as_ref()
        .and_then(|key| key.get("_id"))
        .map(id_string)?;
    let seq = token_string(&event.id);
    let doc = if include_docs { event.full_document } else { None };

    Some(ChangeEvent::new(id, seq, doc))
}

fn id_string(id: &Bson) -> String {
    match id {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.clone().into_relaxed_extjson().to_string(),
    }
}

/// Renders a resume token as the opaque sequence string used by feeds.
fn token_string(token: &ResumeToken) -> String {
    match bson::to_document(token) {
        Ok(doc) => match doc.get_str("_data") {
            Ok(data) => data.to_string(),
            Err(_) => Bson::Document(doc).into_relaxed_extjson().to_string(),
        },
        Err(_) => String::new(),
    }
}

fn parse_token(token: &str) -> Result<ResumeToken, StoreError> {
    let invalid = |e: &dyn std::fmt::Display| {
        StoreError::Serialization(format!("invalid resume token {token}: {e}"))
    };
    let bytes = bson::to_vec(&doc! { "_data": token }).map_err(|e| invalid(&e))?;
    bson::from_slice::<ResumeToken>(&bytes).map_err(|e| invalid(&e))
}

fn error_code(err: &MongoError) -> Option<i32> {
    match err.kind.as_ref() {
        MongoErrorKind::Command(cmd_err) => Some(cmd_err.code),
        _ => None,
    }
}

/// Whether a change stream can be reopened after `err`.
///
/// Uses error labels first, then transient server codes. An unusable resume
/// token (286) is never retryable.
fn is_retryable(err: &MongoError) -> bool {
    let code = error_code(err);
    if code == Some(CHANGE_STREAM_FATAL_ERROR) {
        return false;
    }

    if err.labels().iter().any(|l| {
        l == "ResumableChangeStreamError"
            || l == "RetryableWriteError"
            || l == "TransientTransactionError"
            || l == "NetworkError"
    }) {
        return true;
    }

    if matches!(
        err.kind.as_ref(),
        MongoErrorKind::Io(_) | MongoErrorKind::ConnectionPoolCleared { .. }
    ) {
        return true;
    }

    matches!(
        code,
        Some(
            6 |     // HostUnreachable
            7 |     // HostNotFound
            43 |    // CursorNotFound
            89 |    // NetworkTimeout
            91 |    // ShutdownInProgress
            10107 | // NotPrimary
            11600 | // InterruptedAtShutdown
            11602 | // InterruptedDueToReplStateChange
            13435 | // NotPrimaryNoSecondaryOk
            13436   // NotPrimaryOrSecondary
        )
    )
}

fn feed_failure(err: &MongoError) -> FeedFailure {
    let mut failure =
        FeedFailure::new(err.to_string()).with_labels(err.labels().iter().cloned().collect());
    if let Some(code) = error_code(err) {
        failure = failure.with_code(code);
    }
    failure
}

fn store_error(err: &MongoError) -> StoreError {
    match err.kind.as_ref() {
        MongoErrorKind::Io(_)
        | MongoErrorKind::ServerSelection { .. }
        | MongoErrorKind::ConnectionPoolCleared { .. }
        | MongoErrorKind::DnsResolve { .. }
        | MongoErrorKind::InvalidArgument { .. } => StoreError::Connection(err.to_string()),
        MongoErrorKind::BsonDeserialization(_) | MongoErrorKind::BsonSerialization(_) => {
            StoreError::Serialization(err.to_string())
        }
        _ => StoreError::Other(err.to_string()),
    }
}
