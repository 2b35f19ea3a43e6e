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

//! Turning a change into outbound messages.

use crate::config::ConfigurationDocument;
use crate::event::ChangeEvent;
use crate::template::{RenderError, Template};
use bson::Document;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Recipient identifier (a phone number for SMS gateways)
    pub to: String,

    /// Rendered text
    pub content: String,
}

impl OutboundMessage {
    /// Creates a message.
    pub fn new(to: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            content: content.into(),
        }
    }
}

/// Renders the configured template against a change and fans it out.
///
/// Produces exactly one message per recipient, in recipient order, all with
/// the same content. The change document is the only binding context; a
/// change without a body renders against an empty document.
///
/// # Errors
///
/// Returns the [`RenderError`] if the template is malformed or references a
/// field the document lacks. No messages are produced in that case.
pub fn dispatch(
    configuration: &ConfigurationDocument,
    change: &ChangeEvent,
) -> Result<Vec<OutboundMessage>, RenderError> {
    let template = Template::parse(&configuration.template)?;

    let empty = Document::new();
    let content = template.render(change.doc.as_ref().unwrap_or(&empty))?;

    let outgoing: Vec<OutboundMessage> = configuration
        .recipients
        .iter()
        .map(|recipient| OutboundMessage::new(recipient.as_str(), content.as_str()))
        .collect();

    debug!(id = %change.id, "dispatching {} messages", outgoing.len());
    Ok(outgoing)
}
