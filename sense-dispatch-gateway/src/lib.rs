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

//! Sense Dispatch Gateway - outbound HTTP
//!
//! This crate holds everything that leaves the process over HTTP:
//!
//! - [`GatewaySender`]: the [`MessageSender`](sense_dispatch_core::sender::MessageSender)
//!   posting each rendered message to the notification gateway
//! - [`WebhookSink`]: an [`ErrorSink`](sense_dispatch_core::reporter::ErrorSink)
//!   posting error reports to an error-tracking endpoint
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sense_dispatch_gateway::{GatewayConfig, GatewaySender};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = GatewayConfig::builder()
//!     .url("http://localhost:8080/send")
//!     .timeout(Duration::from_secs(10))
//!     .build()?;
//!
//! let sender = GatewaySender::new(config)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod sender;
pub mod webhook;

pub use config::GatewayConfig;
pub use sender::{GatewayError, GatewaySender};
pub use webhook::WebhookSink;
