//! Sense Dispatch Core - change feed to notification pipeline
//!
//! This crate watches a document store's change feeds, enriches each change
//! with a referenced document, renders a message template and hands one
//! message per recipient to a sender. The dispatch rules live in a
//! configuration document that is itself watched, so they can change without
//! a restart.
//!
//! # Key Components
//!
//! - **Events**: [`event`] defines [`ChangeEvent`](event::ChangeEvent) and field paths
//! - **Store**: [`store`] is the contract with the document store
//! - **Feeds**: [`feed`] turns raw feed notifications into a reported, terminating stream
//! - **Configuration**: [`config`] and [`watcher`] hold and follow the rule set
//! - **Inlining**: [`inline`] resolves a document reference in place
//! - **Templates**: [`template`] and [`dispatch`] render and fan out messages
//! - **Delivery**: [`sender`] is the contract with the notification gateway
//! - **Errors**: [`reporter`] is the single funnel for every failure
//! - **Pipeline**: [`pipeline`] wires it all together
//!
//! # Example
//!
//! ```rust
//! use sense_dispatch_core::config::ConfigurationDocument;
//! use sense_dispatch_core::dispatch::dispatch;
//! use sense_dispatch_core::event::ChangeEvent;
//! use bson::doc;
//!
//! let config = ConfigurationDocument::new("Hello {{name}}", ["+1555"]);
//! let change = ChangeEvent::new("visit-1", "7", Some(doc! { "name": "Ann" }));
//!
//! let messages = dispatch(&config, &change).unwrap();
//! assert_eq!(messages[0].to, "+1555");
//! assert_eq!(messages[0].content, "Hello Ann");
//! ```

pub mod config;
pub mod dispatch;
pub mod event;
pub mod feed;
pub mod inline;
pub mod metrics;
pub mod pipeline;
pub mod reporter;
pub mod sender;
pub mod store;
pub mod template;
pub mod watcher;
