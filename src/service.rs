use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::consumer::AuditLogConsumer;
use crate::health::Counters;
use crate::processor::SchemaChangeProcessor;
use crate::producer::NotificationProducer;
use crate::registry::{SchemaRegistry, SchemaRegistryService};
use crate::state::DeduplicationStore;
use crate::types::AuditLogEvent;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);
const BATCH_JOIN_TIMEOUT: Duration = Duration::from_secs(60);

/// The pipeline runner: polls the audit consumer, routes each event through
/// dedup, classification and publishing, and commits offsets after every
/// batch. Owns the collaborators and closes them on the way out.
pub struct SchemaChangeNotifier {
    config: Arc<Config>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl SchemaChangeNotifier {
    /// Validates the configuration and prepares the runner. Invalid
    /// configuration refuses to start.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(true)),
            counters: Arc::new(Counters::default()),
        })
    }

    /// The liveness flag sampled by the main loop. Shared with the signal
    /// handler and the health endpoints.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs the pipeline until the running flag drops or the consumer's
    /// stop predicate fires.
    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            "Starting schema change notifier in {} mode...",
            self.config.processing_mode
        );
        if self.config.dry_run {
            info!("Dry run mode - notifications will be logged but not produced");
        }

        let registry = Arc::new(
            SchemaRegistryService::new(&self.config)
                .context("Failed to initialize schema registry service")?,
        );
        let mut consumer = AuditLogConsumer::new(self.config.clone())
            .context("Failed to initialize audit log consumer")?;
        let producer = Arc::new(
            NotificationProducer::new(&self.config)
                .await
                .context("Failed to initialize notification producer")?,
        );
        let store = Arc::new(DeduplicationStore::new(&self.config.state_file_path));

        let registry_capability: Arc<dyn SchemaRegistry> = registry.clone();
        let processor = Arc::new(SchemaChangeProcessor::new(
            self.config.clone(),
            registry_capability,
        ));

        let workers = self.config.processing_threads.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        if workers > 1 {
            info!("Parallel processing enabled with {workers} workers");
        }

        let mut last_status = Instant::now();

        while self.running.load(Ordering::SeqCst) && consumer.is_running() {
            let events = consumer.poll().await;
            if events.is_empty() {
                continue;
            }
            self.counters
                .events_consumed
                .fetch_add(events.len() as u64, Ordering::Relaxed);

            if workers > 1 && events.len() > 1 {
                let mut handles = Vec::with_capacity(events.len());
                for event in events {
                    let semaphore = semaphore.clone();
                    let processor = processor.clone();
                    let producer = producer.clone();
                    let store = store.clone();
                    let counters = self.counters.clone();
                    let dedup_enabled = self.config.enable_deduplication;
                    handles.push(tokio::spawn(async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            return;
                        };
                        process_event(
                            &event,
                            &processor,
                            &producer,
                            &store,
                            &counters,
                            dedup_enabled,
                        )
                        .await;
                    }));
                }
                if tokio::time::timeout(BATCH_JOIN_TIMEOUT, futures::future::join_all(handles))
                    .await
                    .is_err()
                {
                    error!("Timed out waiting for batch processing to finish");
                }
            } else {
                for event in &events {
                    process_event(
                        event,
                        &processor,
                        &producer,
                        &store,
                        &self.counters,
                        self.config.enable_deduplication,
                    )
                    .await;
                }
            }

            consumer.commit_sync();

            if last_status.elapsed() >= STATUS_LOG_INTERVAL {
                self.log_status();
                last_status = Instant::now();
            }
        }

        self.running.store(false, Ordering::SeqCst);

        store.close();
        producer.close();
        registry.close();
        consumer.close();

        self.log_final_status();
        Ok(())
    }

    fn log_status(&self) {
        let snapshot = self.counters.snapshot();
        info!(
            "Status - Consumed: {}, Processed: {}, Produced: {}, Duplicates: {}",
            snapshot.events_consumed,
            snapshot.events_processed,
            snapshot.notifications_produced,
            snapshot.duplicates_skipped
        );
    }

    fn log_final_status(&self) {
        let snapshot = self.counters.snapshot();
        info!("Total events consumed: {}", snapshot.events_consumed);
        info!("Total events processed: {}", snapshot.events_processed);
        info!(
            "Total notifications produced: {}",
            snapshot.notifications_produced
        );
        info!("Total duplicates skipped: {}", snapshot.duplicates_skipped);
        info!("Schema change notifier stopped");
    }
}

/// One event through the pipeline: dedup check, classify and enrich,
/// publish, and only then record the dedup key. A failed publish leaves the
/// key unmarked so a replay can retry it.
async fn process_event(
    event: &AuditLogEvent,
    processor: &SchemaChangeProcessor,
    producer: &NotificationProducer,
    store: &DeduplicationStore,
    counters: &Counters,
    dedup_enabled: bool,
) {
    let dedup_key = processor.deduplication_key(event);
    if dedup_enabled && store.is_duplicate(&dedup_key) {
        counters.duplicates_skipped.fetch_add(1, Ordering::Relaxed);
        debug!("Skipping duplicate event: {:?}", event.id);
        return;
    }

    let Some(notification) = processor.process(event).await else {
        return;
    };
    counters.events_processed.fetch_add(1, Ordering::Relaxed);

    if producer.send(&notification).await {
        counters
            .notifications_produced
            .fetch_add(1, Ordering::Relaxed);
        if dedup_enabled {
            store.mark_processed(&dedup_key);
        }
    } else {
        warn!("Failed to produce notification for event: {:?}", event.id);
    }
}
