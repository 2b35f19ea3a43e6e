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

//! Integration tests for Pipeline orchestration.
//!
//! These run the full pipeline against the in-memory store and cover:
//! - Rendering and fan-out
//! - Inlining and its failure path
//! - Live configuration updates
//! - Feed termination
//! - Start-up failures

use bson::doc;
use sense_dispatch_core::metrics::FeedKind;
use sense_dispatch_core::pipeline::{
    Pipeline, PipelineConfig, PipelineError, DEFAULT_CONFIGURATION_ID, DEFAULT_VIEW,
};
use sense_dispatch_core::reporter::{ErrorReporter, MemorySink};
use sense_dispatch_core::dispatch::OutboundMessage;
use sense_dispatch_core::sender::RecordingSender;
use sense_dispatch_core::store::{FeedEvent, FeedFilter};
use sense_dispatch_stores::memory::MemoryStore;
use std::time::Duration;

struct Harness {
    store: MemoryStore,
    sender: RecordingSender,
    sink: MemorySink,
    pipeline: Pipeline<MemoryStore, RecordingSender>,
}

/// Builds a pipeline whose domain view selects documents of type "followup".
fn create_harness() -> Harness {
    let store = MemoryStore::new();
    store.register_view(DEFAULT_VIEW, |doc| doc.get_str("type").is_ok_and(|t| t == "followup"));

    let sender = RecordingSender::new();
    let sink = MemorySink::new();
    let config = PipelineConfig::builder().database("sense").build().unwrap();
    let pipeline = Pipeline::new(
        config,
        store.clone(),
        sender.clone(),
        ErrorReporter::new().with_sink(sink.clone()),
    );

    Harness {
        store,
        sender,
        sink,
        pipeline,
    }
}

/// Polls `condition` until it holds or two seconds pass.
async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn put_configuration(store: &MemoryStore, template: &str, recipients: &[&str]) {
    store
        .put(
            DEFAULT_CONFIGURATION_ID,
            doc! { "template": template, "recipients": recipients.to_vec() },
        )
        .await;
}

#[tokio::test]
async fn test_pipeline_renders_and_fans_out() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello {{name}}", &["+1", "+2"]).await;
    h.pipeline.start().await.unwrap();

    h.store
        .put("visit-1", doc! { "type": "followup", "name": "Ann" })
        .await;

    assert!(wait_until(|| h.sender.len() == 2).await);
    let mut sent = h.sender.sent();
    sent.sort_by(|a, b| a.to.cmp(&b.to));
    assert_eq!(
        sent,
        vec![
            OutboundMessage::new("+1", "Hello Ann"),
            OutboundMessage::new("+2", "Hello Ann"),
        ]
    );
    assert!(h.sink.is_empty());

    let stats = h.pipeline.stats().await;
    assert_eq!(stats.changes_received, 1);
    assert_eq!(stats.messages_dispatched, 2);

    h.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_ignores_changes_outside_view() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello {{name}}", &["+1"]).await;
    h.pipeline.start().await.unwrap();

    h.store
        .put("visit-0", doc! { "type": "visit", "name": "Nobody" })
        .await;
    h.store
        .put("visit-1", doc! { "type": "followup", "name": "Ann" })
        .await;

    assert!(wait_until(|| h.sender.len() == 1).await);
    assert_eq!(h.sender.sent()[0].content, "Hello Ann");

    h.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_inlines_referenced_document() {
    let mut h = create_harness();
    h.store
        .put(
            DEFAULT_CONFIGURATION_ID,
            doc! {
                "template": "Patient {{patient.name}}",
                "recipients": ["+1"],
                "inlinePath": "patient",
            },
        )
        .await;
    h.store.put("doc42", doc! { "name": "Bob" }).await;
    h.pipeline.start().await.unwrap();

    h.store
        .put("visit-1", doc! { "type": "followup", "patient": "doc42" })
        .await;

    assert!(wait_until(|| h.sender.len() == 1).await);
    assert_eq!(h.sender.sent()[0].content, "Patient Bob");
    assert!(h.sink.is_empty());

    h.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_inline_failure_dispatches_original() {
    let mut h = create_harness();
    h.store
        .put(
            DEFAULT_CONFIGURATION_ID,
            doc! {
                "template": "Visit {{type}}",
                "recipients": ["+1"],
                "inlinePath": "patient",
            },
        )
        .await;
    h.pipeline.start().await.unwrap();

    h.store.fail_gets(true);
    h.store
        .put("visit-1", doc! { "type": "followup", "patient": "doc42" })
        .await;

    assert!(wait_until(|| h.sender.len() == 1).await);
    assert_eq!(h.sender.sent()[0].content, "Visit followup");
    assert_eq!(h.sink.len(), 1);
    assert_eq!(h.sink.messages()[0], "error inlining document doc42");

    h.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_picks_up_configuration_changes() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello {{name}}", &["+1"]).await;
    h.pipeline.start().await.unwrap();

    put_configuration(&h.store, "Bye {{name}}", &["+9"]).await;
    let pipeline = &h.pipeline;
    assert!(
        wait_until(|| pipeline
            .configuration()
            .is_some_and(|c| c.template == "Bye {{name}}"))
        .await
    );

    h.store
        .put("visit-1", doc! { "type": "followup", "name": "Ann" })
        .await;

    assert!(wait_until(|| h.sender.len() == 1).await);
    assert_eq!(h.sender.sent(), vec![OutboundMessage::new("+9", "Bye Ann")]);
    assert_eq!(h.pipeline.stats().await.configuration_updates, 1);

    h.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_render_failure_is_reported() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello {{name", &["+1"]).await;
    h.pipeline.start().await.unwrap();

    h.store
        .put("visit-1", doc! { "type": "followup", "name": "Ann" })
        .await;

    assert!(wait_until(|| h.sink.len() == 1).await);
    assert_eq!(h.sink.messages()[0], "error rendering template for change visit-1");
    assert!(h.sender.is_empty());
    assert_eq!(h.pipeline.stats().await.render_failures, 1);

    h.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_delivery_failure_is_reported() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello {{name}}", &["+1"]).await;
    h.pipeline.start().await.unwrap();

    h.sender.set_failing(true);
    h.store
        .put("visit-1", doc! { "type": "followup", "name": "Ann" })
        .await;

    assert!(wait_until(|| h.sink.len() == 1).await);
    assert!(h.sink.messages()[0].starts_with("error sending message"));
    assert!(h.sender.is_empty());

    h.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_domain_feed_stop_is_reported_once() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello {{name}}", &["+1"]).await;
    h.pipeline.start().await.unwrap();

    h.store
        .emit_to(&FeedFilter::view(DEFAULT_VIEW), FeedEvent::Stop(None));

    let stopped = tokio::time::timeout(Duration::from_secs(2), h.pipeline.next_termination())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stopped.feed, FeedKind::Domain);
    assert_eq!(h.sink.messages(), vec!["a changes feed terminated".to_string()]);

    // The configuration feed keeps running.
    put_configuration(&h.store, "Bye {{name}}", &["+1"]).await;
    let pipeline = &h.pipeline;
    assert!(
        wait_until(|| pipeline
            .configuration()
            .is_some_and(|c| c.template == "Bye {{name}}"))
        .await
    );
    assert_eq!(h.sink.len(), 1);

    h.pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_pipeline_start_twice_fails() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello", &["+1"]).await;
    h.pipeline.start().await.unwrap();

    assert!(matches!(
        h.pipeline.start().await,
        Err(PipelineError::AlreadyRunning)
    ));

    h.pipeline.stop().await.unwrap();
    assert!(!h.pipeline.is_running().await);
}

#[tokio::test]
async fn test_pipeline_start_without_configuration_fails() {
    let mut h = create_harness();

    assert!(matches!(
        h.pipeline.start().await,
        Err(PipelineError::InitialConfiguration(_))
    ));
    assert!(!h.pipeline.is_running().await);
    assert!(h.pipeline.configuration().is_none());
}

#[tokio::test]
async fn test_pipeline_subscribe_failure_is_reported() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello", &["+1"]).await;
    h.store.fail_changes(true);

    assert!(matches!(
        h.pipeline.start().await,
        Err(PipelineError::Subscribe(_))
    ));
    assert_eq!(h.sink.len(), 1);
    assert!(h.sink.messages()[0].starts_with("could not listen to changes with options"));
}

#[tokio::test]
async fn test_pipeline_stop_closes_feeds() {
    let mut h = create_harness();
    put_configuration(&h.store, "Hello", &["+1"]).await;
    h.pipeline.start().await.unwrap();
    assert_eq!(h.store.open_feeds(), 2);

    h.pipeline.stop().await.unwrap();

    assert_eq!(h.store.open_feeds(), 0);
    assert!(h.sink.is_empty());
}
