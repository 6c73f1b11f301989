//! The per-topic publish pipeline: annotate, classify, append, record,
//! acknowledge.
//!
//! Per-producer FIFO is enforced by an order mutex held across
//! classification and append *initiation*; it is released before awaiting
//! durability, so appends from different publishes pipeline through the log
//! while classification still observes sequence ids in arrival order.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::DedupOptions;
use crate::dedup::Deduplicator;
use crate::error::PublishError;
use crate::log::AppendLog;
use crate::metadata::{
    parse_source_position, MessageMetadata, PublishContext, PROP_REPL_SOURCE_POSITION,
};
use crate::registry::ProducerRegistry;
use crate::types::{DedupDecision, PublishOutcome, Status};

/// Accepts produced messages for one topic and drives them through
/// deduplication into the append log.
pub struct TopicPublisher<L: AppendLog> {
    topic: String,
    log: Arc<L>,
    dedup: Arc<Deduplicator<L>>,
    registry: ProducerRegistry,
    /// Serializes classification + append initiation for the topic.
    order: tokio::sync::Mutex<()>,
}

impl<L: AppendLog> TopicPublisher<L> {
    /// Create the publisher and its dedup engine. Call
    /// [`check_status`](Self::check_status) afterwards to run recovery;
    /// until then the topic publishes without classification.
    pub fn new(topic: impl Into<String>, log: Arc<L>, options: DedupOptions) -> Arc<Self> {
        let topic = topic.into();
        let dedup = Deduplicator::new(topic.clone(), log.clone(), options);
        Arc::new(TopicPublisher {
            topic,
            log,
            dedup,
            registry: ProducerRegistry::new(),
            order: tokio::sync::Mutex::new(()),
        })
    }

    /// Reconcile the dedup engine with its configured intent (recovery on
    /// first enable, tear-down on disable).
    pub async fn check_status(&self) {
        self.dedup.check_status().await;
    }

    /// Swap the dedup configuration and reconcile.
    pub async fn update_options(&self, options: DedupOptions) {
        self.dedup.set_options(options);
        self.dedup.check_status().await;
    }

    /// The engine behind this topic, for maintenance scheduling (purge) and
    /// state inspection.
    pub fn dedup(&self) -> &Arc<Deduplicator<L>> {
        &self.dedup
    }

    pub fn producer_connected(&self, name: &str, supports_repl_dedup_v2: bool) {
        self.registry.connect(name, supports_repl_dedup_v2);
        self.dedup.producer_connected(name);
    }

    pub fn producer_disconnected(&self, name: &str) {
        self.registry.disconnect(name);
        self.dedup.producer_disconnected(name);
    }

    /// Publish one message.
    ///
    /// Callers must submit a producer's messages in wire order; outcomes
    /// for distinct producers are independent.
    pub async fn publish(
        &self,
        mut ctx: PublishContext,
        meta: MessageMetadata,
        payload: Bytes,
    ) -> Result<PublishOutcome, PublishError> {
        match self.dedup.status() {
            Status::Recovering | Status::Removing | Status::Failed => {
                return Err(PublishError::NotReady(self.dedup.status()));
            }
            _ => {}
        }

        if !ctx.supports_repl_dedup_v2 {
            ctx.supports_repl_dedup_v2 = self.registry.supports_repl_dedup_v2(&ctx.producer);
        }
        self.parse_chunking(&mut ctx, &meta)?;
        self.annotate(&mut ctx, &meta);

        let entry = meta.encode(&payload)?;

        // Markers are broker control traffic: always published, never
        // classified or recorded.
        if ctx.repl_marker {
            let position = self.log.append(entry).wait().await?;
            return Ok(PublishOutcome::Accepted {
                position,
                sequence_id: ctx.sequence_id,
            });
        }

        let pending = {
            let _order = self.order.lock().await;
            match self.dedup.classify(&ctx) {
                DedupDecision::Accept => {}
                DedupDecision::Duplicate => {
                    let last_sequence_id = self
                        .dedup
                        .persisted_sequence(ctx.dedup_producer())
                        .unwrap_or_else(|| ctx.dedup_sequence_id());
                    debug!(
                        topic = %self.topic,
                        producer = %ctx.producer,
                        sequence_id = ctx.sequence_id,
                        "rejecting duplicate publish"
                    );
                    return Ok(PublishOutcome::Duplicate {
                        sequence_id: ctx.sequence_id,
                        last_sequence_id,
                    });
                }
                DedupDecision::Indeterminate => {
                    return Ok(PublishOutcome::Indeterminate {
                        sequence_id: ctx.sequence_id,
                    });
                }
            }
            // `pushed` is now advanced; initiate the append before releasing
            // the order lock so log order matches classification order.
            self.log.append(entry)
        };

        let position = pending.wait().await.map_err(|err| {
            warn!(
                topic = %self.topic,
                producer = %ctx.producer,
                sequence_id = ctx.sequence_id,
                ?err,
                "append failed, acceptance state retained"
            );
            PublishError::Append(err)
        })?;

        self.dedup.record_persisted(&ctx, position);
        Ok(PublishOutcome::Accepted {
            position,
            sequence_id: ctx.sequence_id,
        })
    }

    /// Recognize replication traffic before classification: markers
    /// short-circuit, remote producers get their source position parsed and
    /// (failing the v2 path) their original identity recovered from the
    /// header the replicator rewrote.
    fn annotate(&self, ctx: &mut PublishContext, meta: &MessageMetadata) {
        if meta.is_replication_marker() {
            ctx.repl_marker = true;
            return;
        }
        if !self.dedup.is_remote_producer(&ctx.producer) {
            return;
        }
        ctx.remote = true;

        if let Some(value) = meta.property(PROP_REPL_SOURCE_POSITION) {
            match parse_source_position(value) {
                Ok(pair) => ctx.repl_source_position = Some(pair),
                Err(err) => {
                    // Not fatal: the publish continues on the v1 path.
                    warn!(
                        topic = %self.topic,
                        producer = %ctx.producer,
                        ?err,
                        "ignoring malformed replicated source position"
                    );
                }
            }
        }

        if !(ctx.supports_repl_dedup_v2 && ctx.repl_source_position.is_some()) {
            ctx.original_producer = Some(meta.producer_name.clone());
            ctx.original_sequence_id = Some(meta.sequence_id);
            ctx.original_highest_sequence_id = Some(meta.effective_highest_sequence_id());
        }
    }

    fn parse_chunking(
        &self,
        ctx: &mut PublishContext,
        meta: &MessageMetadata,
    ) -> Result<(), PublishError> {
        let Some(num_chunks) = meta.num_chunks else {
            return Ok(());
        };
        // A single-chunk group behaves as a plain message.
        if num_chunks <= 1 {
            return Ok(());
        }
        let chunk_id = meta
            .chunk_id
            .ok_or_else(|| PublishError::InvalidChunk("chunk id missing".to_string()))?;
        if chunk_id >= num_chunks {
            return Err(PublishError::InvalidChunk(format!(
                "chunk id {chunk_id} out of range for {num_chunks} chunks"
            )));
        }
        ctx.chunked = true;
        ctx.last_chunk = chunk_id == num_chunks - 1;
        Ok(())
    }
}
