//! One extraction pass over an entity type's outbox.

use crate::config::{ProducerConfig, SyncConfig};
use crate::error::{Result, SyncError};
use crate::fabric::{Addressing, Broker, BusMessage};
use crate::outbox::OutboxStore;
use crate::retry::{with_fixed_delay, RetryPolicy};
use crate::shutdown::Shutdown;
use crate::types::{Action, MessageKind, OutboxRow, PayloadEncoding, Priority, ProducerMask, RowId};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Payload field of an operation row naming the consumer class it is for.
const OPERATION_TARGET: &str = "target";

/// Sends outbox rows to the bus on behalf of one consumer class.
pub struct BatchProducer {
    producer: ProducerConfig,
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    topic: String,
    batch_size: usize,
    threshold_percent: u8,
    full_mask: ProducerMask,
    retry_delay: Duration,
    shutdown: Shutdown,
}

/// What a page of rows turned into.
#[derive(Default)]
struct PageOutcome {
    sent: Vec<RowId>,
    skipped: Vec<RowId>,
    failed: usize,
}

impl BatchProducer {
    pub fn new(
        config: &SyncConfig,
        producer: ProducerConfig,
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            producer,
            outbox,
            broker,
            topic: Addressing::from_config(config).topic(),
            batch_size: config.batch_size,
            threshold_percent: config.storage_threshold_percent,
            full_mask: config.full_producer_mask(),
            retry_delay: config.retry_delay(),
            shutdown,
        }
    }

    /// Consumer class this producer sends for.
    pub fn target(&self) -> &str {
        &self.producer.target
    }

    pub fn name(&self) -> &str {
        &self.producer.name
    }

    /// Drain `entity_type`'s pending rows page by page.
    ///
    /// Stops at the first short page, after a page with a send failure, or as
    /// soon as broker storage usage reaches the threshold. Returns the number
    /// of rows sent (and marked) in this cycle.
    pub fn run_cycle(&self, entity_type: &str) -> Result<usize> {
        let job_id = Uuid::new_v4().to_string();
        let bit = self.producer.producer_bit();
        let started = Instant::now();
        let mut processed = 0;

        loop {
            let usage = self.retrying("broker storage usage", || self.broker.storage_usage_percent())?;
            if usage >= self.threshold_percent {
                info!(
                    producer = %self.producer.name,
                    entity_type,
                    usage,
                    threshold = self.threshold_percent,
                    "Broker storage above threshold, yielding"
                );
                break;
            }

            let rows = self.retrying("select pending rows", || {
                self.outbox.select_pending(entity_type, bit, self.batch_size)
            })?;
            if rows.is_empty() {
                break;
            }
            let page_len = rows.len();

            let outcome = self.send_page(&rows, &job_id);

            let mut done = outcome.sent.clone();
            done.extend_from_slice(&outcome.skipped);
            if !done.is_empty() {
                self.retrying("mark rows processed", || {
                    self.outbox.mark_processed(entity_type, &done, bit)
                })?;
            }
            let deleted = self.retrying("delete completed rows", || {
                self.outbox.delete_completed(entity_type, self.full_mask)
            })?;
            processed += outcome.sent.len();

            debug!(
                producer = %self.producer.name,
                entity_type,
                job_id = %job_id,
                page = page_len,
                sent = outcome.sent.len(),
                failed = outcome.failed,
                deleted,
                "Outbox page done"
            );

            if outcome.failed > 0 || page_len < self.batch_size || self.shutdown.is_cancelled() {
                break;
            }
        }

        if processed > 0 {
            info!(
                producer = %self.producer.name,
                entity_type,
                job_id = %job_id,
                processed,
                latency_ms = started.elapsed().as_millis() as u64,
                "Producer cycle finished"
            );
        }
        Ok(processed)
    }

    fn send_page(&self, rows: &[OutboxRow], job_id: &str) -> PageOutcome {
        let mut outcome = PageOutcome::default();
        for row in rows {
            let message = match self.build_message(row, job_id) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    outcome.skipped.push(row.row_id);
                    continue;
                }
                Err(e) => {
                    warn!(producer = %self.producer.name, entity_id = %row.entity_id, error = %e, "Cannot build message from outbox row");
                    outcome.failed += 1;
                    continue;
                }
            };

            match message
                .to_wire()
                .and_then(|wire| self.broker.publish(&self.topic, wire))
            {
                Ok(()) => outcome.sent.push(row.row_id),
                Err(e) => {
                    warn!(
                        producer = %self.producer.name,
                        entity_type = %row.entity_type,
                        entity_id = %row.entity_id,
                        error = %e,
                        "Send failed, row left for the next cycle"
                    );
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    /// Turn a row into a bus message. `None` means the row is an operation
    /// addressed to another consumer class; it is marked without sending.
    fn build_message(&self, row: &OutboxRow, job_id: &str) -> Result<Option<BusMessage>> {
        let payload = decode_payload(row)?;

        if row.kind == MessageKind::Operation {
            let target = payload.get(OPERATION_TARGET).and_then(Value::as_str);
            if target.is_some_and(|target| target != self.producer.target) {
                return Ok(None);
            }
        }

        let initial_load =
            row.action == Action::InitialLoad || row.priority == Priority::InitialLoad.jms();

        Ok(Some(BusMessage {
            id: Uuid::new_v4().to_string(),
            entity_id: row.entity_id.clone(),
            entity_type: row.entity_type.clone(),
            kind: row.kind,
            action: row.action,
            job_id: job_id.to_string(),
            insertion_time: row.insertion_time,
            priority: row.priority,
            initial_load,
            correlation_id: self.producer.target.clone(),
            payload,
        }))
    }

    fn retrying<T>(&self, what: &str, op: impl FnMut() -> Result<T>) -> Result<T> {
        with_fixed_delay(&self.shutdown, self.retry_delay, RetryPolicy::Unbounded, what, op)
    }
}

/// Decode a stored payload into the JSON body carried on the bus.
pub fn decode_payload(row: &OutboxRow) -> Result<Value> {
    if row.payload.is_empty() {
        return Ok(Value::Null);
    }
    match row.encoding {
        PayloadEncoding::Json => Ok(serde_json::from_slice(&row.payload)?),
        PayloadEncoding::MessagePack => rmp_serde::from_slice(&row.payload).map_err(|e| {
            SyncError::Deserialization(format!("row {}: {e}", row.row_id))
        }),
    }
}
