//! Broker consumer
//!
//! One driver task per live leader. Each cycle it drains newly assigned
//! subscriptions into its active set, issues a single batched fetch
//! covering all of them, and hands each per-partition block to the owning
//! subscription's trigger queue. Delivery to a trigger queue never blocks:
//! a full slot just means that partition is refetched next cycle, so one
//! slow reader cannot stall its siblings on the same connection.

use crate::consumer::master::MasterInner;
use crate::consumer::{wait_flag, Feed, Subscription};
use crate::error::TapError;
use crate::wire::{BrokerLink, FetchPartition, FetchRequest, FetchResponse, PartitionData};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long to pause refetching when every subscriber's trigger slot is
/// occupied; keeps the cycle from spinning against a fast broker.
const BUSY_BACKOFF: Duration = Duration::from_millis(5);

/// What the master (and partition drivers) may ask of a broker consumer
#[derive(Debug)]
pub(crate) enum BrokerInput {
    /// Add a subscription to the active set at the next cycle
    Subscribe(Arc<Subscription>),
    /// Remove a subscription that re-routed or closed
    Unsubscribe { topic: String, partition: i32 },
}

/// Shared handle to a running broker consumer
pub(crate) struct BrokerHandle {
    pub(crate) broker_id: i32,
    /// Monotonic id distinguishing successive broker consumers for the
    /// same broker id
    pub(crate) generation: u64,
    pub(crate) input: mpsc::Sender<BrokerInput>,
    shutdown_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl BrokerHandle {
    pub(crate) fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }
}

pub(crate) struct BrokerConsumer {
    master: Arc<MasterInner>,
    broker_id: i32,
    generation: u64,
    link: Arc<dyn BrokerLink>,
    input_rx: mpsc::Receiver<BrokerInput>,
    shutdown_rx: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
    active: HashMap<(String, i32), Arc<Subscription>>,
}

impl BrokerConsumer {
    pub(crate) fn spawn(
        master: Arc<MasterInner>,
        broker_id: i32,
        generation: u64,
        link: Arc<dyn BrokerLink>,
    ) -> Arc<BrokerHandle> {
        let buffer = master.config.channel_buffer_size;
        let (input_tx, input_rx) = mpsc::channel(buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let handle = Arc::new(BrokerHandle {
            broker_id,
            generation,
            input: input_tx,
            shutdown_tx,
            done_rx,
        });
        let consumer = BrokerConsumer {
            master,
            broker_id,
            generation,
            link,
            input_rx,
            shutdown_rx,
            done_tx,
            active: HashMap::new(),
        };
        info!(broker_id, generation, "broker consumer started");
        tokio::spawn(consumer.run());
        handle
    }

    async fn run(mut self) {
        loop {
            self.drain_input();
            // Subscriptions that closed without managing to deregister.
            self.active.retain(|_, sub| sub.is_live());
            if *self.shutdown_rx.borrow() {
                break;
            }
            if self.active.is_empty() {
                tokio::select! {
                    _ = wait_flag(&mut self.shutdown_rx) => break,
                    maybe = self.input_rx.recv() => match maybe {
                        Some(input) => self.apply(input),
                        None => break,
                    }
                }
                continue;
            }

            let request = self.build_fetch_request();
            debug!(
                broker_id = self.broker_id,
                partitions = request.partitions.len(),
                "issuing fetch"
            );
            let read_timeout = self.master.config.read_timeout();
            let outcome = tokio::select! {
                _ = wait_flag(&mut self.shutdown_rx) => break,
                fetched = tokio::time::timeout(read_timeout, self.link.fetch(request)) => {
                    match fetched {
                        Ok(result) => result,
                        Err(_) => Err(TapError::transport("fetch timed out waiting for the broker")),
                    }
                }
            };
            match outcome {
                Ok(response) => {
                    if !self.dispatch(response).await {
                        break;
                    }
                }
                Err(cause) => {
                    self.fail_all(cause).await;
                    break;
                }
            }
        }
        self.finish();
    }

    fn drain_input(&mut self) {
        while let Ok(input) = self.input_rx.try_recv() {
            self.apply(input);
        }
    }

    fn apply(&mut self, input: BrokerInput) {
        match input {
            BrokerInput::Subscribe(sub) => {
                debug!(
                    broker_id = self.broker_id,
                    topic = %sub.topic,
                    partition = sub.partition,
                    "subscription added"
                );
                self.active.insert(sub.key(), sub);
            }
            BrokerInput::Unsubscribe { topic, partition } => {
                if self.active.remove(&(topic.clone(), partition)).is_some() {
                    debug!(broker_id = self.broker_id, topic = %topic, partition, "subscription removed");
                }
            }
        }
    }

    fn build_fetch_request(&self) -> FetchRequest {
        let config = &self.master.config;
        let partitions = self
            .active
            .values()
            .map(|sub| FetchPartition {
                topic: sub.topic.clone(),
                partition: sub.partition,
                fetch_offset: sub.next_offset.load(Ordering::SeqCst),
                max_bytes: sub.fetch_size.load(Ordering::SeqCst),
            })
            .collect();
        FetchRequest {
            max_wait_ms: config.max_wait_ms as i32,
            min_bytes: config.fetch_min_bytes,
            partitions,
        }
    }

    /// Route each per-partition block to its subscription. Returns false
    /// when shutdown interrupted the dispatch.
    async fn dispatch(&mut self, response: FetchResponse) -> bool {
        let mut blocks: HashMap<(String, i32), PartitionData> = response
            .partitions
            .into_iter()
            .map(|data| ((data.topic.clone(), data.partition), data))
            .collect();

        let keys: Vec<(String, i32)> = self.active.keys().cloned().collect();
        let mut delivered = 0usize;
        let mut throttled = 0usize;
        for key in keys {
            if !self.active.contains_key(&key) {
                continue;
            }
            match blocks.remove(&key) {
                Some(data) => {
                    let Some(sub) = self.active.get(&key) else {
                        continue;
                    };
                    let feed = Feed::Response {
                        source: self.generation,
                        data,
                    };
                    match sub.trigger_tx.try_send(feed) {
                        Ok(()) => delivered += 1,
                        // Slow reader: keep the subscription and include it
                        // again next cycle.
                        Err(TrySendError::Full(_)) => throttled += 1,
                        Err(TrySendError::Closed(_)) => {
                            self.active.remove(&key);
                        }
                    }
                }
                None => {
                    // The broker answered without this partition. That is a
                    // per-partition defect; tell just this subscription to
                    // re-route and leave its siblings untouched.
                    warn!(
                        broker_id = self.broker_id,
                        topic = %key.0,
                        partition = key.1,
                        "fetch response missing a requested partition"
                    );
                    let Some(sub) = self.active.get(&key) else {
                        continue;
                    };
                    let feed = Feed::Abort {
                        source: self.generation,
                        cause: TapError::IncompleteResponse,
                    };
                    match sub.trigger_tx.try_send(feed) {
                        Ok(()) | Err(TrySendError::Closed(_)) => {
                            self.active.remove(&key);
                        }
                        // The slot still holds an unprocessed response;
                        // retain the subscription so the abort is retried
                        // next cycle.
                        Err(TrySendError::Full(_)) => throttled += 1,
                    }
                }
            }
        }
        if delivered == 0 && throttled > 0 {
            // Every subscriber is busy; give them a moment before refetching
            // the same offsets.
            tokio::select! {
                _ = wait_flag(&mut self.shutdown_rx) => return false,
                _ = tokio::time::sleep(BUSY_BACKOFF) => {}
            }
        }
        true
    }

    /// A transport-level failure poisons the whole connection: every
    /// subscription is told to re-route and this broker consumer retires.
    async fn fail_all(&mut self, cause: TapError) {
        warn!(
            broker_id = self.broker_id,
            error = %cause,
            subscriptions = self.active.len(),
            "fetch failed; expelling all subscriptions"
        );
        // Deregister first so re-routing partitions get a fresh connection
        // instead of this dying one.
        self.master.abandon_broker(self.broker_id, self.generation);
        let mut pending: Vec<Arc<Subscription>> =
            self.active.drain().map(|(_, sub)| sub).collect();
        // A trigger slot may hold an unprocessed response. Try-send only,
        // so one slow subscription never delays its siblings' aborts, and
        // retry the leftovers until every slot has drained.
        while !pending.is_empty() {
            let generation = self.generation;
            pending.retain(|sub| {
                let feed = Feed::Abort {
                    source: generation,
                    cause: cause.clone(),
                };
                matches!(sub.trigger_tx.try_send(feed), Err(TrySendError::Full(_)))
            });
            if pending.is_empty() {
                break;
            }
            tokio::select! {
                _ = wait_flag(&mut self.shutdown_rx) => return,
                _ = tokio::time::sleep(BUSY_BACKOFF) => {}
            }
        }
    }

    fn finish(mut self) {
        // Refuse late subscribers so they re-route instead of waiting on a
        // dead driver. Their trigger slots are empty until we feed them, so
        // a try-send cannot miss.
        self.input_rx.close();
        while let Ok(input) = self.input_rx.try_recv() {
            if let BrokerInput::Subscribe(sub) = input {
                let _ = sub.trigger_tx.try_send(Feed::Abort {
                    source: self.generation,
                    cause: TapError::transport("broker consumer shut down"),
                });
            }
        }
        info!(broker_id = self.broker_id, generation = self.generation, "broker consumer stopped");
        let _ = self.done_tx.send(true);
    }
}
