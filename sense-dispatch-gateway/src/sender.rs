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

//! HTTP notification gateway sender.
//!
//! Each message becomes one `POST` with the JSON body
//! `{"content": ..., "to_number": ...}`. Only transport failures count as
//! delivery failures; whatever status the gateway answers with is logged and
//! otherwise ignored. There is no retry.

use crate::config::GatewayConfig;
use async_trait::async_trait;
use sense_dispatch_core::dispatch::OutboundMessage;
use sense_dispatch_core::sender::{DeliveryError, MessageSender};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Wire format of one gateway request.
#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    content: &'a str,
    to_number: &'a str,
}

impl<'a> From<&'a OutboundMessage> for GatewayRequest<'a> {
    fn from(message: &'a OutboundMessage) -> Self {
        Self {
            content: &message.content,
            to_number: &message.to,
        }
    }
}

/// Errors creating a [`GatewaySender`].
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The HTTP client could not be built
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// [`MessageSender`] posting to an HTTP notification gateway.
#[derive(Debug, Clone)]
pub struct GatewaySender {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl GatewaySender {
    /// Creates a sender for the configured gateway.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Client`] if the HTTP client cannot be built.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        debug!(url = %config.url, "Created gateway sender");
        Ok(Self { client, config })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

#[async_trait]
impl MessageSender for GatewaySender {
    #[instrument(skip(self, message), fields(to = %message.to))]
    async fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        let request = GatewayRequest::from(message);

        match self
            .client
            .post(self.config.url.clone())
            .json(&request)
            .send()
            .await
        {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!(%status, "Gateway accepted message");
                } else {
                    warn!(%status, "Gateway answered with a non-success status");
                }
                Ok(())
            }
            Err(e) => {
                // Transport failures carry no response body.
                let response = match e.status() {
                    Some(status) => status.to_string(),
                    None => "no response".to_string(),
                };
                Err(DeliveryError::new(e.to_string())
                    .with_response(response)
                    .with_source(e))
            }
        }
    }
}
