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

//! Document store implementations for Sense Dispatch.
//!
//! This crate provides backend implementations of the
//! [`DocumentStore`](sense_dispatch_core::store::DocumentStore) trait.
//!
//! # Available Stores
//!
//! - **Memory** (always available): in-process store with scripted feed
//!   lifecycle events, for tests and local runs
//! - **MongoDB** (`mongodb-store` feature): documents in a collection, feeds
//!   as change streams with reconnect and backoff
//!
//! # Feature Flags
//!
//! - `mongodb-store` (default): enables [`mongo::MongoStore`]
//!
//! # Example: Memory Store
//!
//! ```rust
//! use sense_dispatch_stores::memory::MemoryStore;
//! use sense_dispatch_core::store::DocumentStore;
//! use bson::doc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! store.put("sense-dispatch-configuration", doc! {
//!     "template": "Hello {{name}}",
//!     "recipients": ["+1555"],
//! }).await;
//!
//! let config = store.get("sense-dispatch-configuration").await?;
//! assert_eq!(config.get_str("template")?, "Hello {{name}}");
//! # Ok(())
//! # }
//! ```

pub mod memory;

#[cfg(feature = "mongodb-store")]
pub mod mongo;
