//! Consumer runtime: one broker session loop per consumption unit

use std::fmt;
use std::sync::Arc;

use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::types::RDKafkaErrorCode;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::GroupSettings;
use crate::error::Result;
use crate::metrics::ConnectorMetrics;
use crate::router::EventRouter;
use crate::schema::CdcRecord;

enum RebalanceEvent {
    Assigned(usize),
    Revoked,
}

/// Forwards librdkafka rebalance callbacks into the session loop
struct RebalanceListener {
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for RebalanceListener {}

impl ConsumerContext for RebalanceListener {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            debug!(partitions = partitions.count(), "Partitions being revoked");
            let _ = self.events.send(RebalanceEvent::Revoked);
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                debug!(partitions = partitions.count(), "Partitions assigned");
                let _ = self
                    .events
                    .send(RebalanceEvent::Assigned(partitions.count()));
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => error!(error = %e, "Rebalance error"),
        }
    }
}

/// Where a consumption unit stands inside the rebalance cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Waiting for the coordinator to hand out partitions
    Joining,
    /// Assignment held, messages flowing
    Running,
}

/// One consumption unit: a subscribed consumer plus the router it feeds
///
/// The runtime drives broker sessions until told to stop. A rebalance ends
/// the current session and re-enters the join phase inside
/// [`ConsumerRuntime::run`]; only the shutdown watch (or a closed client)
/// leaves it. Several runtimes under one group id consume partitions in
/// parallel; distribution between them is the coordinator's job.
pub struct ConsumerRuntime<T: CdcRecord> {
    consumer: StreamConsumer<RebalanceListener>,
    router: EventRouter<T>,
    rebalances: mpsc::UnboundedReceiver<RebalanceEvent>,
    ready_tx: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    topic: String,
    group_id: String,
    metrics: Option<Arc<ConnectorMetrics>>,
}

impl<T: CdcRecord> ConsumerRuntime<T> {
    /// Create and subscribe the consumer; no messages flow until
    /// [`run`](ConsumerRuntime::run)
    ///
    /// Configuration problems (no brokers, blank topic, unparseable
    /// protocol version) and client creation failures surface here, before
    /// any consumption starts.
    pub fn new(
        settings: &GroupSettings,
        router: EventRouter<T>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        Self::build(settings, router, shutdown, None)
    }

    /// Same as [`ConsumerRuntime::new`], with Prometheus counters attached
    pub fn new_with_metrics(
        settings: &GroupSettings,
        router: EventRouter<T>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<ConnectorMetrics>,
    ) -> Result<Self> {
        Self::build(settings, router, shutdown, Some(metrics))
    }

    fn build(
        settings: &GroupSettings,
        router: EventRouter<T>,
        shutdown: watch::Receiver<bool>,
        metrics: Option<Arc<ConnectorMetrics>>,
    ) -> Result<Self> {
        settings.validate()?;

        let (events_tx, rebalances) = mpsc::unbounded_channel();
        let consumer: StreamConsumer<RebalanceListener> = ClientConfig::new()
            .set("bootstrap.servers", settings.brokers.join(","))
            .set("group.id", settings.effective_group_id())
            .set("broker.version.fallback", settings.protocol_version.as_str())
            .set(
                "partition.assignment.strategy",
                settings.assignor.strategy_name(),
            )
            .set("auto.offset.reset", settings.start_offset.auto_offset_reset())
            // Offsets are stored by hand after the handler chain and
            // committed by the interval timer.
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "5000")
            .set("enable.auto.offset.store", "false")
            .set("session.timeout.ms", "30000")
            .set("enable.partition.eof", "false")
            .create_with_context(RebalanceListener { events: events_tx })?;

        consumer.subscribe(&[settings.topic.as_str()])?;

        info!(
            topic = %settings.topic,
            group_id = %settings.effective_group_id(),
            "Consumer runtime initialized"
        );

        let (ready_tx, _) = watch::channel(false);
        Ok(Self {
            consumer,
            router,
            rebalances,
            ready_tx,
            shutdown,
            state: SessionState::Joining,
            topic: settings.topic.clone(),
            group_id: settings.effective_group_id().to_string(),
            metrics,
        })
    }

    /// Watch that reads true while the current session holds an assignment
    ///
    /// Drops to false for the gap between a revocation and the next
    /// assignment, and closes when the runtime stops.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Drive broker sessions until the shutdown watch flips
    ///
    /// Cancellation is cooperative: it is observed between messages, so an
    /// in-flight handler chain always completes. Stored offsets are
    /// committed one final time before the connection closes.
    pub async fn run(mut self) -> Result<()> {
        info!(topic = %self.topic, group_id = %self.group_id, "Consumer runtime started");
        loop {
            // Biased polling: shutdown and queued rebalance events are
            // observed before the next message, so an assignment always
            // opens the ready gate ahead of the messages behind it.
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(topic = %self.topic, group_id = %self.group_id, "Shutdown signal received, stopping consumer");
                        break;
                    }
                }
                event = self.rebalances.recv() => match event {
                    Some(event) => self.observe_rebalance(event),
                    None => {
                        warn!(topic = %self.topic, "Rebalance channel closed, stopping consumer");
                        break;
                    }
                },
                received = self.consumer.recv() => match received {
                    Ok(message) => self.handle_message(&message).await,
                    Err(e) => {
                        // Broker hiccups are retried by the client; keep
                        // consuming.
                        error!(topic = %self.topic, error = %e, "Kafka consumer error");
                    }
                },
            }
        }
        self.ready_tx.send_replace(false);
        self.finish()
    }

    fn observe_rebalance(&mut self, event: RebalanceEvent) {
        match event {
            RebalanceEvent::Assigned(partitions) => {
                if self.state == SessionState::Joining {
                    self.state = SessionState::Running;
                    self.ready_tx.send_replace(true);
                    info!(
                        topic = %self.topic,
                        group_id = %self.group_id,
                        partitions,
                        "Consumer session ready"
                    );
                } else {
                    debug!(topic = %self.topic, partitions, "Additional partitions assigned");
                }
            }
            RebalanceEvent::Revoked => {
                if let Some(metrics) = &self.metrics {
                    metrics.rebalances.inc();
                }
                self.state = SessionState::Joining;
                self.ready_tx.send_replace(false);
                info!(
                    topic = %self.topic,
                    group_id = %self.group_id,
                    "Partitions revoked, rejoining group"
                );
            }
        }
    }

    async fn handle_message(&self, message: &BorrowedMessage<'_>) {
        let payload = match message.payload() {
            Some(payload) => payload,
            None => {
                // Tombstones are skipped without storing the offset.
                debug!(
                    topic = %self.topic,
                    offset = message.offset(),
                    "Empty message payload, skipping"
                );
                return;
            }
        };

        self.router.process(payload).await;
        if let Some(metrics) = &self.metrics {
            metrics.messages_consumed.inc();
        }

        // Acknowledged regardless of handler outcome: delivery to the
        // chain is at most once.
        if let Err(e) = self.consumer.store_offset_from_message(message) {
            warn!(
                topic = %self.topic,
                partition = message.partition(),
                offset = message.offset(),
                error = %e,
                "Failed to store offset"
            );
        }
    }

    fn finish(self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => {
                error!(
                    topic = %self.topic,
                    group_id = %self.group_id,
                    error = %e,
                    "Final offset commit failed"
                );
                return Err(e.into());
            }
        }
        self.consumer.unsubscribe();
        info!(topic = %self.topic, group_id = %self.group_id, "Consumer runtime stopped");
        Ok(())
    }
}

impl<T: CdcRecord> fmt::Debug for ConsumerRuntime<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerRuntime")
            .field("topic", &self.topic)
            .field("group_id", &self.group_id)
            .field("state", &self.state)
            .finish()
    }
}
