use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use anyhow::Context as AnyhowContext;
use chrono::DateTime;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::consumer::CommitMode;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ProcessingMode};
use crate::types::AuditLogEvent;

const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

type PartitionKey = (String, i32);
type EndOffsets = Arc<Mutex<HashMap<PartitionKey, i64>>>;

/// Consumer for the Confluent Cloud audit log topic.
///
/// Startup positioning depends on the processing mode: STREAM seeks to the
/// end of assigned partitions, BACKFILL to the beginning (optionally
/// snapshotting end offsets to stop at), TIMESTAMP to the offsets matching
/// the configured start time, and RESUME stays on committed positions.
/// Offsets are committed manually after each processed batch.
///
/// Not safe for concurrent use. Poll, commit and close must all happen from
/// a single owner.
pub struct AuditLogConsumer {
    consumer: Arc<StreamConsumer<AuditConsumerContext>>,
    config: Arc<Config>,
    running: Arc<AtomicBool>,
    tracker: EndOffsetTracker,
    end_timestamp_ms: Option<i64>,
}

impl AuditLogConsumer {
    pub fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let start_timestamp_ms = config
            .start_timestamp
            .as_deref()
            .map(parse_iso_millis)
            .transpose()?;
        let end_timestamp_ms = config
            .end_timestamp
            .as_deref()
            .map(parse_iso_millis)
            .transpose()?;

        let end_offsets: EndOffsets = Arc::new(Mutex::new(HashMap::new()));
        let context = AuditConsumerContext {
            mode: config.processing_mode,
            stop_at_current: config.stop_at_current,
            start_timestamp_ms,
            snapshot_for_end_timestamp: end_timestamp_ms.is_some(),
            end_offsets: end_offsets.clone(),
            consumer_handle: OnceLock::new(),
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set(
                "bootstrap.servers",
                config.audit_log_bootstrap_servers.clone().unwrap_or_default(),
            )
            .set("group.id", &config.consumer_group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set(
                "auto.offset.reset",
                config.processing_mode.auto_offset_reset(),
            )
            .set("security.protocol", &config.security_protocol);

        if config.security_protocol.contains("SASL") {
            client_config
                .set("sasl.mechanism", &config.sasl_mechanism)
                .set(
                    "sasl.username",
                    config.audit_log_api_key.clone().unwrap_or_default(),
                )
                .set(
                    "sasl.password",
                    config.audit_log_api_secret.clone().unwrap_or_default(),
                );
        }

        let consumer: Arc<StreamConsumer<AuditConsumerContext>> = Arc::new(
            client_config
                .create_with_context(context)
                .context("Failed to create audit log consumer")?,
        );
        consumer
            .context()
            .consumer_handle
            .set(Arc::downgrade(&consumer))
            .ok();

        consumer
            .subscribe(&[config.audit_log_topic.as_str()])
            .with_context(|| {
                format!("Failed to subscribe to audit topic '{}'", config.audit_log_topic)
            })?;

        Ok(Self {
            consumer,
            config,
            running: Arc::new(AtomicBool::new(true)),
            tracker: EndOffsetTracker::new(end_offsets),
            end_timestamp_ms,
        })
    }

    /// Collects up to `batch.size` parsed audit events, waiting at most the
    /// poll timeout. Malformed records are logged and skipped.
    pub async fn poll(&mut self) -> Vec<AuditLogEvent> {
        if !self.running.load(Ordering::SeqCst) {
            return Vec::new();
        }

        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.poll_timeout_ms);
        let mut events = Vec::new();
        let mut seen = 0usize;

        while seen < self.config.batch_size {
            let message = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    warn!("Kafka error while polling audit log: {e}");
                    // keep the poll cadence instead of spinning on errors
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
                Ok(Ok(message)) => message,
            };
            seen += 1;

            // reaching the snapshotted end only flips the flag, the record
            // itself is still processed
            if self.config.stop_at_current
                && self
                    .tracker
                    .observe(message.topic(), message.partition(), message.offset())
                && self.running.swap(false, Ordering::SeqCst)
            {
                info!("Reached end of all partitions, stopping...");
            }
            if self.past_end_timestamp(&message) {
                continue;
            }

            let Some(payload) = message.payload() else {
                debug!("Skipping empty record at offset {}", message.offset());
                continue;
            };
            match serde_json::from_slice::<AuditLogEvent>(payload) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    "Failed to parse audit log event at offset {}: {e}",
                    message.offset()
                ),
            }
        }

        events
    }

    /// Records past the end timestamp stop the consumer and are skipped.
    fn past_end_timestamp(&self, message: &BorrowedMessage<'_>) -> bool {
        let Some(end_ms) = self.end_timestamp_ms else {
            return false;
        };
        let Some(timestamp) = message.timestamp().to_millis() else {
            return false;
        };
        if timestamp > end_ms {
            if self.running.swap(false, Ordering::SeqCst) {
                info!("Reached end timestamp, stopping...");
            }
            true
        } else {
            false
        }
    }

    /// Commits the consumer group offsets synchronously. Failures are
    /// logged, not fatal.
    pub fn commit_sync(&self) {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => debug!("Committed offsets"),
            Err(e) if e.rdkafka_error_code() == Some(RDKafkaErrorCode::NoOffset) => {
                debug!("No offsets to commit yet")
            }
            Err(e) => error!("Failed to commit offsets: {e}"),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn close(self) {
        self.running.store(false, Ordering::SeqCst);
        drop(self.consumer);
        info!("Audit log consumer closed");
    }
}

/// Rebalance hook applying the mode-specific seek when partitions are
/// assigned, and snapshotting end offsets when a stop predicate needs them.
struct AuditConsumerContext {
    mode: ProcessingMode,
    stop_at_current: bool,
    start_timestamp_ms: Option<i64>,
    snapshot_for_end_timestamp: bool,
    end_offsets: EndOffsets,
    consumer_handle: OnceLock<Weak<StreamConsumer<AuditConsumerContext>>>,
}

impl ClientContext for AuditConsumerContext {}

impl ConsumerContext for AuditConsumerContext {
    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        let Some(consumer) = self.consumer_handle.get().and_then(Weak::upgrade) else {
            return;
        };
        let consumer = consumer.as_ref();
        let partitions = match rebalance {
            Rebalance::Assign(partitions) => partitions,
            Rebalance::Revoke(_) => return,
            Rebalance::Error(e) => {
                error!("Rebalance error: {e}");
                return;
            }
        };
        if partitions.count() == 0 {
            return;
        }

        match self.mode {
            ProcessingMode::Stream => {
                self.seek_all(consumer, partitions, Offset::End);
                info!("Setup complete, listening for schema changes in audit logs...");
            }
            ProcessingMode::Backfill => {
                self.seek_all(consumer, partitions, Offset::Beginning);
                if self.stop_at_current {
                    self.snapshot_end_offsets(consumer, partitions);
                }
                info!("Setup complete, processing historical schema changes...");
            }
            ProcessingMode::Timestamp => {
                self.seek_to_timestamp(consumer, partitions);
                if self.snapshot_for_end_timestamp {
                    self.snapshot_end_offsets(consumer, partitions);
                }
                info!("Setup complete, processing historical schema changes from timestamp...");
            }
            ProcessingMode::Resume => {
                info!("Setup complete, resuming from last position...");
            }
        }
    }
}

impl AuditConsumerContext {
    fn seek_all(
        &self,
        consumer: &StreamConsumer<Self>,
        partitions: &TopicPartitionList,
        offset: Offset,
    ) {
        for elem in partitions.elements() {
            if let Err(e) = consumer.seek(elem.topic(), elem.partition(), offset, SEEK_TIMEOUT) {
                warn!(
                    "Failed to seek {}-{} to {offset:?}: {e}",
                    elem.topic(),
                    elem.partition()
                );
            }
        }
    }

    /// Seeks every partition to the first offset at or after the start
    /// timestamp, or to the end where no such offset exists.
    fn seek_to_timestamp(&self, consumer: &StreamConsumer<Self>, partitions: &TopicPartitionList) {
        let Some(start_ms) = self.start_timestamp_ms else {
            return;
        };

        let mut timestamps = TopicPartitionList::new();
        for elem in partitions.elements() {
            if let Err(e) =
                timestamps.add_partition_offset(elem.topic(), elem.partition(), Offset::Offset(start_ms))
            {
                warn!("Failed to build timestamp lookup list: {e}");
                return;
            }
        }

        let resolved = match consumer.offsets_for_times(timestamps, SEEK_TIMEOUT) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("Failed to resolve offsets for start timestamp: {e}");
                return;
            }
        };

        for elem in resolved.elements() {
            let target = seek_target(elem.offset());
            if let Err(e) = consumer.seek(elem.topic(), elem.partition(), target, SEEK_TIMEOUT) {
                warn!(
                    "Failed to seek {}-{} to {target:?}: {e}",
                    elem.topic(),
                    elem.partition()
                );
            }
        }
    }

    /// Snapshots the current log-end offset of every assigned partition.
    fn snapshot_end_offsets(&self, consumer: &StreamConsumer<Self>, partitions: &TopicPartitionList) {
        let mut snapshot = self
            .end_offsets
            .lock()
            .expect("end offsets lock poisoned");
        for elem in partitions.elements() {
            match consumer.fetch_watermarks(elem.topic(), elem.partition(), SEEK_TIMEOUT) {
                Ok((_low, high)) => {
                    snapshot.insert((elem.topic().to_string(), elem.partition()), high);
                }
                Err(e) => error!(
                    "Failed to fetch end offset for {}-{}: {e}",
                    elem.topic(),
                    elem.partition()
                ),
            }
        }
        info!("Snapshotted end offsets for {} partition(s)", snapshot.len());
    }
}

/// The offset to seek to for a timestamp lookup result. Partitions with no
/// record at or after the timestamp go to the end.
fn seek_target(resolved: Offset) -> Offset {
    match resolved {
        Offset::Offset(offset) => Offset::Offset(offset),
        _ => Offset::End,
    }
}

fn parse_iso_millis(value: &str) -> anyhow::Result<i64> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid ISO-8601 timestamp: {value}"))?;
    Ok(parsed.timestamp_millis())
}

/// Tracks which partitions have caught up to their snapshotted end offset.
/// The last record of a partition sits at `end offset - 1`, so a partition
/// counts as reached from that offset on.
struct EndOffsetTracker {
    end_offsets: EndOffsets,
    reached: HashSet<PartitionKey>,
}

impl EndOffsetTracker {
    fn new(end_offsets: EndOffsets) -> Self {
        Self {
            end_offsets,
            reached: HashSet::new(),
        }
    }

    /// Records an observed offset. Returns true once every snapshotted
    /// partition has been reached.
    fn observe(&mut self, topic: &str, partition: i32, offset: i64) -> bool {
        let ends = self.end_offsets.lock().expect("end offsets lock poisoned");
        if ends.is_empty() {
            return false;
        }
        let key = (topic.to_string(), partition);
        if let Some(&end) = ends.get(&key) {
            if offset >= end - 1 {
                self.reached.insert(key);
            }
        }
        self.reached.len() == ends.len()
    }
}
