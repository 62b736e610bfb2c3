//! Master consumer
//!
//! Owns the cluster-wide registries and routes partition consumers to the
//! broker consumer serving their current leader. The registries are only
//! ever touched under a short lock; nothing awaits while holding it.

use crate::config::ConsumerConfig;
use crate::consumer::broker::{BrokerConsumer, BrokerHandle};
use crate::consumer::partition::{PartitionConsumer, PartitionDriver};
use crate::consumer::Subscription;
use crate::error::{Result, TapError};
use crate::wire::{WireClient, OFFSET_NEWEST, OFFSET_OLDEST};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Top-level consumer for one Kafka cluster.
///
/// Create one per cluster connection, then ask it for per-partition
/// consumers with [`consume_partition`](Consumer::consume_partition).
/// Dropping a `Consumer` without calling [`close`](Consumer::close) leaves
/// background tasks running until their next delivery attempt; call
/// `close` for a deterministic shutdown.
pub struct Consumer {
    inner: Arc<MasterInner>,
}

pub(crate) struct MasterInner {
    pub(crate) client: Arc<dyn WireClient>,
    pub(crate) config: ConsumerConfig,
    state: Mutex<MasterState>,
    shutdown_tx: watch::Sender<bool>,
}

struct MasterState {
    closed: bool,
    /// One broker consumer per live leader, keyed by broker id
    brokers: HashMap<i32, Arc<BrokerHandle>>,
    /// Reservation set: each (topic, partition) may have one live consumer
    owned: HashSet<(String, i32)>,
    /// Live subscriptions, for the close cascade
    subscriptions: HashMap<(String, i32), Arc<Subscription>>,
    next_generation: u64,
}

impl Consumer {
    /// Create a consumer on top of an already-constructed wire client.
    ///
    /// Performs one metadata round trip so a wire client that cannot reach
    /// the cluster fails here rather than on first use.
    pub async fn new(client: Arc<dyn WireClient>, config: ConsumerConfig) -> Result<Self> {
        config.validate()?;
        client.metadata().await?;
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(MasterInner {
            client,
            config,
            state: Mutex::new(MasterState {
                closed: false,
                brokers: HashMap::new(),
                owned: HashSet::new(),
                subscriptions: HashMap::new(),
                next_generation: 1,
            }),
            shutdown_tx,
        });
        info!("consumer created");
        Ok(Consumer { inner })
    }

    /// All topic names the cluster currently knows about
    pub async fn topics(&self) -> Result<Vec<String>> {
        Ok(self.inner.client.metadata().await?.topics())
    }

    /// Partition ids of a topic
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.inner
            .client
            .metadata()
            .await?
            .partitions(topic)
            .ok_or(TapError::UnknownTopicOrPartition)
    }

    /// Start consuming one partition from the given offset.
    ///
    /// `offset` is a concrete offset within the partition's current range,
    /// or one of the sentinels [`OFFSET_OLDEST`] / [`OFFSET_NEWEST`].
    /// Returns the partition consumer together with the concrete offset the
    /// request resolved to.
    pub async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(PartitionConsumer, i64)> {
        if partition < 0 {
            return Err(TapError::config("partition must not be negative"));
        }
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TapError::ShuttingDown);
            }
            if !state.owned.insert((topic.to_string(), partition)) {
                return Err(TapError::config(
                    "That topic/partition is already being consumed",
                ));
            }
        }
        match self.start_partition(topic, partition, offset).await {
            Ok(started) => Ok(started),
            Err(e) => {
                self.inner.release_partition(topic, partition);
                Err(e)
            }
        }
    }

    async fn start_partition(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<(PartitionConsumer, i64)> {
        let inner = &self.inner;
        let leader = self.lookup_leader(topic, partition).await?;

        let oldest = inner.client.get_offset(topic, partition, OFFSET_OLDEST).await?;
        let newest = inner.client.get_offset(topic, partition, OFFSET_NEWEST).await?;
        let concrete = resolve_offset(offset, oldest, newest)?;

        let buffer = inner.config.channel_buffer_size;
        let (sub, trigger_rx, done_tx) =
            Subscription::new(topic, partition, concrete, inner.config.fetch_default_bytes);
        let (messages_tx, messages_rx) = mpsc::channel(buffer);
        let (errors_tx, errors_rx) = mpsc::channel(buffer);

        let broker = inner.find_or_create_broker(leader).await?;
        {
            let mut state = inner.state.lock();
            if state.closed {
                return Err(TapError::ShuttingDown);
            }
            state.subscriptions.insert(sub.key(), sub.clone());
        }

        let driver = PartitionDriver::new(
            inner.clone(),
            sub.clone(),
            trigger_rx,
            messages_tx,
            errors_tx,
            broker,
            done_tx,
        );
        tokio::spawn(driver.run());
        info!(topic, partition, offset = concrete, leader, "partition consumer started");
        Ok((PartitionConsumer::new(sub, messages_rx, errors_rx), concrete))
    }

    async fn lookup_leader(&self, topic: &str, partition: i32) -> Result<i32> {
        let md = self.inner.client.metadata().await?;
        if let Some(leader) = md.leader_for(topic, partition) {
            return Ok(leader);
        }
        // The cached view may simply be stale; give the cluster one forced
        // refresh before giving up.
        debug!(topic, partition, "leader unknown; refreshing metadata");
        let md = self.inner.client.refresh_metadata().await?;
        match md.leader_for(topic, partition) {
            Some(leader) => Ok(leader),
            None if md.has_partition(topic, partition) => Err(TapError::LeaderNotAvailable),
            None => Err(TapError::UnknownTopicOrPartition),
        }
    }

    /// Shut the whole consumer down: every broker consumer, then every
    /// partition consumer, each waited on in turn. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let (brokers, subscriptions) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let brokers: Vec<_> = state.brokers.drain().map(|(_, h)| h).collect();
            let subscriptions: Vec<_> = state.subscriptions.values().cloned().collect();
            (brokers, subscriptions)
        };
        let _ = self.inner.shutdown_tx.send(true);
        for broker in &brokers {
            broker.begin_shutdown();
        }
        for broker in &brokers {
            broker.wait_done().await;
        }
        for sub in &subscriptions {
            sub.begin_close();
        }
        for sub in &subscriptions {
            sub.wait_done().await;
        }
        info!("consumer closed");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(state) = self.inner.state.try_lock() {
            if !state.closed && !state.subscriptions.is_empty() {
                warn!(
                    subscriptions = state.subscriptions.len(),
                    "consumer dropped without close(); partition drivers will stop lazily"
                );
            }
        }
    }
}

impl MasterInner {
    /// Return the broker consumer for `broker_id`, creating one with a
    /// fresh connection if none is registered.
    pub(crate) async fn find_or_create_broker(
        self: &Arc<Self>,
        broker_id: i32,
    ) -> Result<Arc<BrokerHandle>> {
        {
            let state = self.state.lock();
            if state.closed {
                return Err(TapError::ShuttingDown);
            }
            if let Some(handle) = state.brokers.get(&broker_id) {
                return Ok(handle.clone());
            }
        }
        let link = self.client.connect(broker_id).await?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(TapError::ShuttingDown);
        }
        // Someone else may have won the race while we were connecting.
        if let Some(handle) = state.brokers.get(&broker_id) {
            return Ok(handle.clone());
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        let handle = BrokerConsumer::spawn(self.clone(), broker_id, generation, link);
        state.brokers.insert(broker_id, handle.clone());
        Ok(handle)
    }

    /// Drop a broker consumer from the registry so the next route request
    /// for the same broker id builds a fresh connection. `generation`
    /// guards against evicting a successor that already replaced it.
    pub(crate) fn abandon_broker(&self, broker_id: i32, generation: u64) {
        let mut state = self.state.lock();
        if let Some(handle) = state.brokers.get(&broker_id) {
            if handle.generation == generation {
                state.brokers.remove(&broker_id);
                debug!(broker_id, generation, "broker consumer abandoned");
            }
        }
    }

    /// Re-resolve the leader of a partition and return its broker consumer.
    pub(crate) async fn refresh_leader(
        self: &Arc<Self>,
        topic: &str,
        partition: i32,
    ) -> Result<Arc<BrokerHandle>> {
        if self.state.lock().closed {
            return Err(TapError::ShuttingDown);
        }
        let md = self.client.refresh_metadata().await?;
        let leader = match md.leader_for(topic, partition) {
            Some(leader) => leader,
            None if md.has_partition(topic, partition) => return Err(TapError::LeaderNotAvailable),
            None => return Err(TapError::UnknownTopicOrPartition),
        };
        self.find_or_create_broker(leader).await
    }

    /// Give up ownership of a partition; called by its driver on exit.
    pub(crate) fn release_partition(&self, topic: &str, partition: i32) {
        let key = (topic.to_string(), partition);
        let mut state = self.state.lock();
        state.owned.remove(&key);
        state.subscriptions.remove(&key);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// Resolve a requested offset against the partition's current extremes.
///
/// A request exactly equal to `newest` is valid and yields a consumer that
/// starts out empty but live.
fn resolve_offset(requested: i64, oldest: i64, newest: i64) -> Result<i64> {
    match requested {
        OFFSET_NEWEST => Ok(newest),
        OFFSET_OLDEST => Ok(oldest),
        o if o >= 0 && o >= oldest && o <= newest => Ok(o),
        _ => Err(TapError::OffsetOutOfRange),
    }
}
