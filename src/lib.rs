//! Durable Topic Publish Pipeline
//!
//! The write side of a durable pub/sub topic: accepts produced messages,
//! decides whether each one is a duplicate, appends survivors to an
//! append-only log through an external storage engine, and periodically
//! snapshots its recovery state into a named cursor.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use durable_topic::{
//!     DedupOptions, MemoryLog, MessageMetadata, PublishContext, TopicPublisher,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let log = Arc::new(MemoryLog::new());
//!     let publisher = TopicPublisher::new(
//!         "orders",
//!         log,
//!         DedupOptions::new().with_enabled(true),
//!     );
//!     // Recover dedup state (replays the log on first enable).
//!     publisher.check_status().await;
//!
//!     let ctx = PublishContext::new("producer-1", 0);
//!     let meta = MessageMetadata::new("producer-1", 0);
//!     let outcome = publisher
//!         .publish(ctx, meta, Bytes::from_static(b"hello"))
//!         .await
//!         .unwrap();
//!     println!("published: {outcome:?}");
//! }
//! ```

mod config;
mod dedup;
mod error;
mod log;
mod metadata;
mod pipeline;
mod registry;
mod retry;
mod types;

pub use config::DedupOptions;
pub use dedup::{Deduplicator, RECOVERY_CURSOR};
pub use error::{LogError, MetadataError, PublishError};
pub use log::{AppendLog, Cursor, MemoryLog, PendingAppend};
pub use metadata::{
    is_replication_marker, parse_source_position, MessageMetadata, PublishContext,
    MARKER_TYPE_REPLICATION_MAX, MARKER_TYPE_REPLICATION_MIN, PROP_REPL_SOURCE_POSITION,
};
pub use pipeline::TopicPublisher;
pub use registry::{ProducerRegistry, ProducerSession};
pub use retry::{JitterMode, RetryConfig};
pub use types::{DedupDecision, Position, PublishOutcome, Status};
