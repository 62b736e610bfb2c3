//! Testing utilities for StreamTap
//!
//! [`MockCluster`] is an in-process, scriptable implementation of the wire
//! client contract. Tests stand up a cluster, script per-broker records,
//! leadership and failures, and drive a real [`Consumer`](crate::Consumer)
//! against it with no network involved.
//!
//! Fetches are served from a per-broker offset-indexed record store, so
//! the engine may ask for the same offset twice (it does, around
//! backpressure) and always gets a coherent answer. One-shot scripted
//! responses layer on top for shapes a store cannot express, such as a
//! broker returning records from before the requested offset.
//!
//! # Example
//!
//! ```ignore
//! let cluster = MockCluster::new();
//! cluster.add_broker(0);
//! cluster.set_leader("my_topic", 0, 0);
//! cluster.set_offsets("my_topic", 0, 0, 2345);
//! for offset in 1234..1244 {
//!     cluster.add_record(0, "my_topic", 0, offset, b"Foo");
//! }
//! let consumer = Consumer::new(cluster.client(), ConsumerConfig::default()).await?;
//! ```

use crate::error::{KafkaErrorCode, Result, TapError};
use crate::wire::{
    BrokerInfo, BrokerLink, ClusterMetadata, FetchRequest, FetchResponse, PartitionData, Record,
    WireClient,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Duration, Instant};

/// Fixed base for broker-assigned record timestamps
const BASE_TIMESTAMP_MS: i64 = 1_700_000_000_000;

/// Upper bound on records served per partition per fetch
const DEFAULT_BATCH_MAX: usize = 256;

/// An in-process scriptable cluster implementing the wire-client contract
#[derive(Clone)]
pub struct MockCluster {
    inner: Arc<MockInner>,
}

struct MockInner {
    state: Mutex<MockState>,
    /// Woken whenever the scripted state changes, so long-polling fetches
    /// notice new records without busy waiting
    changed: Notify,
}

struct MockState {
    metadata: ClusterMetadata,
    /// (topic, partition) -> (oldest, newest)
    offsets: HashMap<(String, i32), (i64, i64)>,
    brokers: HashMap<i32, MockBroker>,
    /// How many upcoming metadata refreshes should fail
    metadata_failures: u32,
    batch_max: usize,
}

struct MockBroker {
    online: bool,
    /// A stalled broker accepts fetches and never answers them
    stalled: bool,
    partitions: HashMap<(String, i32), MockPartition>,
}

impl MockBroker {
    fn new() -> Self {
        Self {
            online: true,
            stalled: false,
            partitions: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct MockPartition {
    records: BTreeMap<i64, Record>,
    /// One-shot responses served before the record store
    scripted: VecDeque<PartitionData>,
    /// Fetches at or past this offset fail with the given code
    fail_from: Option<(i64, KafkaErrorCode)>,
    high_water_mark: Option<i64>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                state: Mutex::new(MockState {
                    metadata: ClusterMetadata::default(),
                    offsets: HashMap::new(),
                    brokers: HashMap::new(),
                    metadata_failures: 0,
                    batch_max: DEFAULT_BATCH_MAX,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// The wire client the consumer under test should be built on
    pub fn client(&self) -> Arc<dyn WireClient> {
        Arc::new(self.clone())
    }

    pub fn add_broker(&self, broker_id: i32) {
        let mut state = self.inner.state.lock();
        state.brokers.entry(broker_id).or_insert_with(MockBroker::new);
        let addr = format!("broker-{broker_id}.mock:9092");
        if state.metadata.broker(broker_id).is_none() {
            state.metadata.brokers.push(BrokerInfo {
                id: broker_id,
                addr,
            });
        }
        self.touch();
    }

    pub fn set_leader(&self, topic: &str, partition: i32, broker_id: i32) {
        let mut state = self.inner.state.lock();
        state
            .metadata
            .leaders
            .entry(topic.to_string())
            .or_default()
            .insert(partition, broker_id);
        self.touch();
    }

    pub fn set_offsets(&self, topic: &str, partition: i32, oldest: i64, newest: i64) {
        let mut state = self.inner.state.lock();
        state
            .offsets
            .insert((topic.to_string(), partition), (oldest, newest));
        self.touch();
    }

    /// Append a record to a broker's copy of the partition
    pub fn add_record(&self, broker_id: i32, topic: &str, partition: i32, offset: i64, value: &[u8]) {
        let mut state = self.inner.state.lock();
        let part = state.partition_mut(broker_id, topic, partition);
        part.records.insert(
            offset,
            Record {
                offset,
                timestamp: BASE_TIMESTAMP_MS + offset,
                key: None,
                value: Bytes::copy_from_slice(value),
            },
        );
        self.touch();
    }

    /// Pin the high-water mark a broker reports for the partition;
    /// otherwise it is derived from the stored records
    pub fn set_high_water_mark(&self, broker_id: i32, topic: &str, partition: i32, hwm: i64) {
        let mut state = self.inner.state.lock();
        state.partition_mut(broker_id, topic, partition).high_water_mark = Some(hwm);
        self.touch();
    }

    /// Queue a one-shot fetch response carrying exactly these offsets,
    /// regardless of the offset the fetch asks for
    pub fn push_fetch(
        &self,
        broker_id: i32,
        topic: &str,
        partition: i32,
        offsets: &[i64],
        hwm: i64,
    ) {
        let records = offsets
            .iter()
            .map(|&offset| Record {
                offset,
                timestamp: BASE_TIMESTAMP_MS + offset,
                key: None,
                value: Bytes::from_static(b"Foo"),
            })
            .collect();
        let data = PartitionData {
            topic: topic.to_string(),
            partition,
            error: KafkaErrorCode::None,
            high_water_mark: hwm,
            records,
            partial: false,
        };
        let mut state = self.inner.state.lock();
        state
            .partition_mut(broker_id, topic, partition)
            .scripted
            .push_back(data);
        self.touch();
    }

    /// Queue a one-shot response with an empty record set flagged as
    /// truncated, the broker's way of saying the byte budget was too small
    pub fn push_partial_fetch(&self, broker_id: i32, topic: &str, partition: i32) {
        let data = PartitionData {
            topic: topic.to_string(),
            partition,
            error: KafkaErrorCode::None,
            high_water_mark: -1,
            records: Vec::new(),
            partial: true,
        };
        let mut state = self.inner.state.lock();
        state
            .partition_mut(broker_id, topic, partition)
            .scripted
            .push_back(data);
        self.touch();
    }

    /// Make the broker answer any fetch at or past `from_offset` for this
    /// partition with the given error code
    pub fn fail_fetch_from(
        &self,
        broker_id: i32,
        topic: &str,
        partition: i32,
        from_offset: i64,
        code: KafkaErrorCode,
    ) {
        let mut state = self.inner.state.lock();
        state.partition_mut(broker_id, topic, partition).fail_from = Some((from_offset, code));
        self.touch();
    }

    /// Fail the next `times` metadata refreshes
    pub fn fail_metadata(&self, times: u32) {
        self.inner.state.lock().metadata_failures = times;
        self.touch();
    }

    /// Take the broker off the network: connects are refused and fetches
    /// over existing links fail
    pub fn kill_broker(&self, broker_id: i32) {
        if let Some(broker) = self.inner.state.lock().brokers.get_mut(&broker_id) {
            broker.online = false;
        }
        self.touch();
    }

    pub fn restore_broker(&self, broker_id: i32) {
        if let Some(broker) = self.inner.state.lock().brokers.get_mut(&broker_id) {
            broker.online = true;
        }
        self.touch();
    }

    /// Make the broker accept fetches and never answer them
    pub fn stall_broker(&self, broker_id: i32) {
        if let Some(broker) = self.inner.state.lock().brokers.get_mut(&broker_id) {
            broker.stalled = true;
        }
        self.touch();
    }

    fn touch(&self) {
        self.inner.changed.notify_waiters();
    }
}

impl MockState {
    fn partition_mut(&mut self, broker_id: i32, topic: &str, partition: i32) -> &mut MockPartition {
        self.brokers
            .entry(broker_id)
            .or_insert_with(MockBroker::new)
            .partitions
            .entry((topic.to_string(), partition))
            .or_default()
    }
}

#[async_trait]
impl WireClient for MockCluster {
    async fn metadata(&self) -> Result<ClusterMetadata> {
        Ok(self.inner.state.lock().metadata.clone())
    }

    async fn refresh_metadata(&self) -> Result<ClusterMetadata> {
        let mut state = self.inner.state.lock();
        if state.metadata_failures > 0 {
            state.metadata_failures -= 1;
            return Err(TapError::metadata("metadata refresh timed out"));
        }
        Ok(state.metadata.clone())
    }

    async fn get_offset(&self, topic: &str, partition: i32, time: i64) -> Result<i64> {
        let state = self.inner.state.lock();
        let (oldest, newest) = state
            .offsets
            .get(&(topic.to_string(), partition))
            .copied()
            .ok_or(TapError::UnknownTopicOrPartition)?;
        if time == crate::wire::OFFSET_OLDEST {
            Ok(oldest)
        } else {
            Ok(newest)
        }
    }

    async fn connect(&self, broker_id: i32) -> Result<Arc<dyn BrokerLink>> {
        let state = self.inner.state.lock();
        match state.brokers.get(&broker_id) {
            Some(broker) if broker.online => Ok(Arc::new(MockLink {
                inner: self.inner.clone(),
                broker_id,
            })),
            _ => Err(TapError::transport(format!(
                "connect: broker {broker_id} unreachable"
            ))),
        }
    }
}

struct MockLink {
    inner: Arc<MockInner>,
    broker_id: i32,
}

enum Evaluation {
    Respond(FetchResponse),
    Offline,
    Stalled,
    /// Nothing to serve yet; the response to return once the long poll
    /// expires
    Empty(FetchResponse),
}

#[async_trait]
impl BrokerLink for MockLink {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let deadline = Instant::now() + Duration::from_millis(request.max_wait_ms.max(0) as u64);
        loop {
            let evaluation = self.evaluate(&request);
            match evaluation {
                Evaluation::Respond(response) => return Ok(response),
                Evaluation::Offline => {
                    return Err(TapError::transport(format!(
                        "broker {}: connection reset",
                        self.broker_id
                    )))
                }
                Evaluation::Stalled => {
                    // Never answers; the engine's read timeout is the only
                    // way out.
                    self.inner.changed.notified().await;
                }
                Evaluation::Empty(response) => {
                    if Instant::now() >= deadline {
                        return Ok(response);
                    }
                    tokio::select! {
                        _ = self.inner.changed.notified() => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
            }
        }
    }
}

impl MockLink {
    fn evaluate(&self, request: &FetchRequest) -> Evaluation {
        let mut state = self.inner.state.lock();
        let batch_max = state.batch_max;
        let Some(broker) = state.brokers.get_mut(&self.broker_id) else {
            return Evaluation::Offline;
        };
        if !broker.online {
            return Evaluation::Offline;
        }
        if broker.stalled {
            return Evaluation::Stalled;
        }

        let mut blocks = Vec::with_capacity(request.partitions.len());
        let mut has_content = false;
        for wanted in &request.partitions {
            let key = (wanted.topic.clone(), wanted.partition);
            let Some(part) = broker.partitions.get_mut(&key) else {
                // Unseeded partition on this broker: treat as empty rather
                // than erroring, so staged tests can seed it later.
                blocks.push(PartitionData {
                    topic: wanted.topic.clone(),
                    partition: wanted.partition,
                    error: KafkaErrorCode::None,
                    high_water_mark: wanted.fetch_offset,
                    records: Vec::new(),
                    partial: false,
                });
                continue;
            };
            if let Some((from, code)) = part.fail_from {
                if wanted.fetch_offset >= from {
                    blocks.push(PartitionData::error(&wanted.topic, wanted.partition, code));
                    has_content = true;
                    continue;
                }
            }
            if let Some(scripted) = part.scripted.pop_front() {
                blocks.push(scripted);
                has_content = true;
                continue;
            }
            let records: Vec<Record> = part
                .records
                .range(wanted.fetch_offset..)
                .take(batch_max)
                .map(|(_, record)| record.clone())
                .collect();
            let derived_hwm = part
                .records
                .keys()
                .next_back()
                .map(|last| last + 1)
                .unwrap_or(wanted.fetch_offset);
            let high_water_mark = part.high_water_mark.unwrap_or(derived_hwm);
            if !records.is_empty() {
                has_content = true;
            }
            blocks.push(PartitionData {
                topic: wanted.topic.clone(),
                partition: wanted.partition,
                error: KafkaErrorCode::None,
                high_water_mark,
                records,
                partial: false,
            });
        }

        let response = FetchResponse { partitions: blocks };
        if has_content {
            Evaluation::Respond(response)
        } else {
            Evaluation::Empty(response)
        }
    }
}
