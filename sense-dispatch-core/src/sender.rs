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

//! Outbound message delivery.
//!
//! A [`MessageSender`] makes exactly one delivery attempt per message. There
//! is no retry and no dead-letter queue: [`deliver`] reports a failure and
//! moves on.

use crate::dispatch::OutboundMessage;
use crate::metrics;
use crate::reporter::ErrorReporter;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// A transport-level delivery failure.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeliveryError {
    /// Short description
    pub message: String,

    /// Serialized response, if one was received
    pub response: Option<String>,

    /// Response body, if one was received
    pub body: Option<String>,

    /// Underlying transport error
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DeliveryError {
    /// Creates an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            response: None,
            body: None,
            source: None,
        }
    }

    /// Attaches the serialized response.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Attaches the response body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attaches the transport error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Diagnostic payload: `{response, body}`.
    #[must_use]
    pub fn extra(&self) -> Value {
        json!({
            "response": self.response,
            "body": self.body,
        })
    }
}

/// Sends one message to the notification gateway.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Makes a single delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError`] on transport failure. What the gateway
    /// answers is not interpreted.
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

/// Sends a message and reports the outcome.
///
/// Never returns an error: a failure is logged, reported once and counted.
pub async fn deliver<M>(sender: &M, reporter: &ErrorReporter, message: &OutboundMessage)
where
    M: MessageSender + ?Sized,
{
    let result = {
        let _timer = metrics::Timer::new(metrics::record_delivery_duration);
        sender.send(message).await
    };

    match result {
        Ok(()) => {
            metrics::increment_messages_sent();
            debug!(to = %message.to, "sent message");
        }
        Err(e) => {
            metrics::increment_delivery_failures();
            reporter.capture_message(format!("error sending message: {e}"), e.extra());
        }
    }
}

/// Sender that records messages instead of delivering them.
///
/// Useful for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingSender {
    /// Creates a sender that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent send fail (or succeed again).
    pub fn set_failing(&self, fail: bool) {
        if let Ok(mut flag) = self.fail.lock() {
            *flag = fail;
        }
    }

    /// Messages accepted so far, in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Number of messages accepted so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Returns true if nothing was accepted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let failing = self.fail.lock().map(|f| *f).unwrap_or(false);
        if failing {
            return Err(
                DeliveryError::new("recording sender set to fail").with_response("no response")
            );
        }

        match self.sent.lock() {
            Ok(mut sent) => sent.push(message.clone()),
            Err(_) => warn!("Recording sender lock poisoned, dropping message"),
        }
        Ok(())
    }
}
