//! Partition consumer
//!
//! One driver task per `(topic, partition)` subscription. The driver waits
//! on its trigger queue for per-partition fetch blocks, filters and orders
//! the records, advances the next fetch offset, and feeds the caller's
//! message queue. Leader loss sends it through a re-route loop against the
//! master; offset-out-of-range mid-stream retires it.

use crate::consumer::broker::{BrokerHandle, BrokerInput};
use crate::consumer::master::MasterInner;
use crate::consumer::{wait_flag, ConsumerError, ConsumerMessage, Feed, Subscription};
use crate::error::{KafkaErrorCode, Result, TapError};
use crate::wire::Record;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A live subscription to one partition.
///
/// Messages arrive through [`recv`](PartitionConsumer::recv) in strictly
/// increasing offset order; recoverable errors arrive through
/// [`recv_error`](PartitionConsumer::recv_error) when the configuration
/// enables them. Both streams end (`None`) once the subscription stops,
/// whether through [`close`](PartitionConsumer::close) or an unrecoverable
/// broker condition.
pub struct PartitionConsumer {
    sub: Arc<Subscription>,
    messages: mpsc::Receiver<ConsumerMessage>,
    errors: mpsc::Receiver<ConsumerError>,
}

impl PartitionConsumer {
    pub(crate) fn new(
        sub: Arc<Subscription>,
        messages: mpsc::Receiver<ConsumerMessage>,
        errors: mpsc::Receiver<ConsumerError>,
    ) -> Self {
        Self {
            sub,
            messages,
            errors,
        }
    }

    pub fn topic(&self) -> &str {
        &self.sub.topic
    }

    pub fn partition(&self) -> i32 {
        self.sub.partition
    }

    /// Next message, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ConsumerMessage> {
        self.messages.recv().await
    }

    /// Next recoverable error, or `None` once the stream has ended.
    pub async fn recv_error(&mut self) -> Option<ConsumerError> {
        self.errors.recv().await
    }

    /// Direct access to the message queue, for callers that want to
    /// `select!` over it.
    pub fn messages(&mut self) -> &mut mpsc::Receiver<ConsumerMessage> {
        &mut self.messages
    }

    /// Direct access to the error queue.
    pub fn errors(&mut self) -> &mut mpsc::Receiver<ConsumerError> {
        &mut self.errors
    }

    /// The most recent high-water mark the broker reported for this
    /// partition; 0 if none was reported yet.
    pub fn high_water_mark_offset(&self) -> i64 {
        self.sub.high_water_mark()
    }

    /// Stop the subscription and wait for its resources to be released.
    /// Buffered messages stay readable afterwards; the queue then reports
    /// end-of-stream. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        self.sub.begin_close();
        self.sub.wait_done().await;
        Ok(())
    }
}

/// What a handled fetch block means for the driver loop
enum Flow {
    Continue,
    Reroute(TapError),
    Stop,
}

/// Result of announcing the subscription to a broker consumer
enum SubscribeOutcome {
    Subscribed,
    Dead(TapError),
    Shutdown,
}

pub(crate) struct PartitionDriver {
    master: Arc<MasterInner>,
    sub: Arc<Subscription>,
    trigger_rx: mpsc::Receiver<Feed>,
    messages_tx: mpsc::Sender<ConsumerMessage>,
    errors_tx: mpsc::Sender<ConsumerError>,
    /// Current route; `None` while re-routing
    broker: Option<Arc<BrokerHandle>>,
    /// Generation of the broker consumer whose feeds we accept
    source: u64,
    sub_shutdown: watch::Receiver<bool>,
    master_shutdown: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
}

impl PartitionDriver {
    pub(crate) fn new(
        master: Arc<MasterInner>,
        sub: Arc<Subscription>,
        trigger_rx: mpsc::Receiver<Feed>,
        messages_tx: mpsc::Sender<ConsumerMessage>,
        errors_tx: mpsc::Sender<ConsumerError>,
        broker: Arc<BrokerHandle>,
        done_tx: watch::Sender<bool>,
    ) -> Self {
        let sub_shutdown = sub.shutdown_signal();
        let master_shutdown = master.shutdown_signal();
        Self {
            master,
            sub,
            trigger_rx,
            messages_tx,
            errors_tx,
            broker: Some(broker),
            source: 0,
            sub_shutdown,
            master_shutdown,
            done_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        // Announce ourselves to the initial broker consumer. If it died
        // between routing and now, fall straight into the re-route loop.
        let mut pending: Option<TapError> = None;
        if let Some(handle) = self.broker.clone() {
            match self.subscribe_to(&handle).await {
                SubscribeOutcome::Subscribed => {}
                SubscribeOutcome::Dead(cause) => {
                    self.broker = None;
                    pending = Some(cause);
                }
                SubscribeOutcome::Shutdown => {
                    self.finish().await;
                    return;
                }
            }
        }

        loop {
            if let Some(cause) = pending.take() {
                if !self.reroute(cause).await {
                    break;
                }
                continue;
            }
            let feed = tokio::select! {
                _ = wait_flag(&mut self.sub_shutdown) => break,
                _ = wait_flag(&mut self.master_shutdown) => break,
                feed = self.trigger_rx.recv() => feed,
            };
            let Some(feed) = feed else { break };
            match feed {
                Feed::Response { source, data } if source == self.source => {
                    match self.handle_response(data).await {
                        Flow::Continue => {}
                        Flow::Reroute(cause) => pending = Some(cause),
                        Flow::Stop => break,
                    }
                }
                Feed::Abort { source, cause } if source == self.source => {
                    // The broker consumer already ejected us.
                    self.broker = None;
                    pending = Some(cause);
                }
                // A feed from a broker we already left; the offset filter
                // would defuse it anyway, but there is no point processing.
                _ => {}
            }
        }
        self.finish().await;
    }

    async fn handle_response(&mut self, data: crate::wire::PartitionData) -> Flow {
        self.sub.update_high_water_mark(data.high_water_mark);

        match data.error {
            KafkaErrorCode::None => {}
            KafkaErrorCode::OffsetOutOfRange => {
                // Unrecoverable at this layer: retire the subscription and
                // let the closed message queue tell the caller.
                warn!(
                    topic = %self.sub.topic,
                    partition = self.sub.partition,
                    offset = self.sub.next_offset.load(Ordering::SeqCst),
                    "requested offset is out of range; stopping"
                );
                return Flow::Stop;
            }
            KafkaErrorCode::NotLeaderOrFollower
            | KafkaErrorCode::LeaderNotAvailable
            | KafkaErrorCode::UnknownTopicOrPartition => {
                return Flow::Reroute(TapError::from_kafka_code(data.error));
            }
            other => {
                // Not a routing problem; report it and keep fetching.
                if !self.send_error(TapError::from_kafka_code(other)).await {
                    return Flow::Stop;
                }
                return Flow::Continue;
            }
        }

        if data.records.is_empty() && data.partial {
            // The next record did not fit in our byte budget. Grow and
            // retry next cycle; only a budget already at its ceiling is
            // worth the caller's attention.
            let current = self.sub.fetch_size.load(Ordering::SeqCst);
            match grow_fetch_size(current, self.master.config.fetch_max_bytes) {
                Some(grown) => {
                    debug!(
                        topic = %self.sub.topic,
                        partition = self.sub.partition,
                        from = current,
                        to = grown,
                        "growing fetch size"
                    );
                    self.sub.fetch_size.store(grown, Ordering::SeqCst);
                }
                None => {
                    if !self.send_error(TapError::MessageTooLarge).await {
                        return Flow::Stop;
                    }
                }
            }
            return Flow::Continue;
        }

        // If everything filters away the offset stays put and the next
        // cycle refetches the same position.
        let next_offset = self.sub.next_offset.load(Ordering::SeqCst);
        for record in retained_records(next_offset, data.records) {
            let message = ConsumerMessage {
                topic: self.sub.topic.clone(),
                partition: self.sub.partition,
                offset: record.offset,
                key: record.key,
                value: record.value,
                timestamp: record.timestamp,
                high_water_mark: self.sub.high_water_mark(),
            };
            let offset = record.offset;
            let delivered = tokio::select! {
                _ = wait_flag(&mut self.sub_shutdown) => return Flow::Stop,
                _ = wait_flag(&mut self.master_shutdown) => return Flow::Stop,
                sent = self.messages_tx.send(message) => sent.is_ok(),
            };
            if !delivered {
                // The caller dropped the handle; nothing left to serve.
                return Flow::Stop;
            }
            self.sub.next_offset.store(offset + 1, Ordering::SeqCst);
        }
        Flow::Continue
    }

    /// Leave the current broker and keep asking the master for the new
    /// leader until routed, closed, or the master shuts down. Returns
    /// false when the driver should stop.
    async fn reroute(&mut self, cause: TapError) -> bool {
        warn!(
            topic = %self.sub.topic,
            partition = self.sub.partition,
            error = %cause,
            "lost broker; re-routing"
        );
        if !self.send_error(cause).await {
            return false;
        }
        let failed_source = self.source;
        if let Some(old) = self.broker.take() {
            let input = old.input.clone();
            let unsubscribe = BrokerInput::Unsubscribe {
                topic: self.sub.topic.clone(),
                partition: self.sub.partition,
            };
            tokio::select! {
                _ = wait_flag(&mut self.sub_shutdown) => return false,
                _ = wait_flag(&mut self.master_shutdown) => return false,
                _ = input.send(unsubscribe) => {}
            }
        }
        let mut confirmed_stale = false;
        loop {
            match self
                .master
                .refresh_leader(&self.sub.topic, self.sub.partition)
                .await
            {
                Ok(handle) => {
                    if handle.generation == failed_source && !confirmed_stale {
                        // Metadata still names the broker that just turned
                        // us away; it is usually lagging the leader change.
                        // Wait out the backoff and resolve again before
                        // trusting it. A second identical answer means the
                        // leadership really did flap back.
                        confirmed_stale = true;
                        let paced = tokio::select! {
                            _ = wait_flag(&mut self.sub_shutdown) => false,
                            _ = wait_flag(&mut self.master_shutdown) => false,
                            _ = tokio::time::sleep(self.master.config.retry_backoff()) => true,
                        };
                        if !paced {
                            return false;
                        }
                        continue;
                    }
                    // Discard whatever the old broker pushed while we were
                    // deciding to leave; the new broker starts clean.
                    while self.trigger_rx.try_recv().is_ok() {}
                    match self.subscribe_to(&handle).await {
                        SubscribeOutcome::Subscribed => {
                            info!(
                                topic = %self.sub.topic,
                                partition = self.sub.partition,
                                broker_id = handle.broker_id,
                                "re-routed"
                            );
                            return true;
                        }
                        SubscribeOutcome::Dead(cause) => {
                            if !self.backoff_after(cause).await {
                                return false;
                            }
                        }
                        SubscribeOutcome::Shutdown => return false,
                    }
                }
                Err(TapError::ShuttingDown) => return false,
                Err(cause) => {
                    if !self.backoff_after(cause).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Report a refresh failure and sleep out the retry backoff. Returns
    /// false when interrupted by shutdown.
    async fn backoff_after(&mut self, cause: TapError) -> bool {
        warn!(
            topic = %self.sub.topic,
            partition = self.sub.partition,
            error = %cause,
            "leader refresh failed; backing off"
        );
        if !self.send_error(cause).await {
            return false;
        }
        tokio::select! {
            _ = wait_flag(&mut self.sub_shutdown) => false,
            _ = wait_flag(&mut self.master_shutdown) => false,
            _ = tokio::time::sleep(self.master.config.retry_backoff()) => true,
        }
    }

    async fn subscribe_to(&mut self, handle: &Arc<BrokerHandle>) -> SubscribeOutcome {
        self.source = handle.generation;
        let input = handle.input.clone();
        let subscribe = BrokerInput::Subscribe(self.sub.clone());
        let sent = tokio::select! {
            _ = wait_flag(&mut self.sub_shutdown) => return SubscribeOutcome::Shutdown,
            _ = wait_flag(&mut self.master_shutdown) => return SubscribeOutcome::Shutdown,
            sent = input.send(subscribe) => sent,
        };
        match sent {
            Ok(()) => {
                self.broker = Some(handle.clone());
                SubscribeOutcome::Subscribed
            }
            Err(_) => SubscribeOutcome::Dead(TapError::transport(
                "broker consumer is no longer accepting subscriptions",
            )),
        }
    }

    /// Emit an error on the caller-facing queue, respecting the
    /// `return_errors` switch. Returns false when shutdown (or a dropped
    /// handle) interrupted the send.
    async fn send_error(&mut self, cause: TapError) -> bool {
        if !self.master.config.return_errors {
            debug!(
                topic = %self.sub.topic,
                partition = self.sub.partition,
                error = %cause,
                "dropping error (return_errors disabled)"
            );
            return true;
        }
        let error = ConsumerError {
            topic: self.sub.topic.clone(),
            partition: self.sub.partition,
            cause,
        };
        tokio::select! {
            _ = wait_flag(&mut self.sub_shutdown) => false,
            _ = wait_flag(&mut self.master_shutdown) => false,
            sent = self.errors_tx.send(error) => sent.is_ok(),
        }
    }

    async fn finish(mut self) {
        self.sub.mark_closed();
        if let Some(old) = self.broker.take() {
            let _ = old.input.try_send(BrokerInput::Unsubscribe {
                topic: self.sub.topic.clone(),
                partition: self.sub.partition,
            });
        }
        self.trigger_rx.close();
        while self.trigger_rx.try_recv().is_ok() {}
        self.master
            .release_partition(&self.sub.topic, self.sub.partition);
        info!(
            topic = %self.sub.topic,
            partition = self.sub.partition,
            "partition consumer stopped"
        );
        let _ = self.done_tx.send(true);
        // Dropping self closes the message and error queues.
    }
}

/// Keep only records at or past the next fetch offset, in strictly
/// increasing offset order. Offsets need not be contiguous.
fn retained_records(next_offset: i64, records: Vec<Record>) -> Vec<Record> {
    let mut last = next_offset - 1;
    records
        .into_iter()
        .filter(|record| {
            if record.offset <= last {
                false
            } else {
                last = record.offset;
                true
            }
        })
        .collect()
}

/// Next fetch size after a too-small budget; doubles, saturating at the
/// configured ceiling. `None` means the budget is already at its ceiling.
fn grow_fetch_size(current: i32, max: i32) -> Option<i32> {
    if max > 0 && current >= max {
        return None;
    }
    let grown = current.saturating_mul(2);
    if max > 0 {
        Some(grown.min(max))
    } else {
        Some(grown)
    }
}
