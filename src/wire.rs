//! Wire-client contract
//!
//! StreamTap sits on top of a lower-level Kafka wire client that owns TCP
//! framing, protocol encoding and the connection pool. The engine only
//! needs the small surface captured here: cluster metadata, offset lookup,
//! and a per-broker fetch channel. Any implementation of [`WireClient`] and
//! [`BrokerLink`] plugs in, including the in-process mock in
//! [`testing`](crate::testing).

use crate::error::{KafkaErrorCode, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

/// Sentinel offset requesting the next offset that will be produced
/// (the high-water mark). Wire convention.
pub const OFFSET_NEWEST: i64 = -1;

/// Sentinel offset requesting the oldest offset still on the broker.
/// Wire convention.
pub const OFFSET_OLDEST: i64 = -2;

/// Identity of a single broker in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    /// Node id assigned by the cluster controller
    pub id: i32,
    /// Advertised host:port
    pub addr: String,
}

/// A point-in-time view of the cluster: live brokers and the current leader
/// of every known partition.
#[derive(Debug, Clone, Default)]
pub struct ClusterMetadata {
    /// Live brokers
    pub brokers: Vec<BrokerInfo>,
    /// topic -> partition -> leader broker id; a negative leader id means
    /// the partition currently has no elected leader
    pub leaders: HashMap<String, HashMap<i32, i32>>,
}

impl ClusterMetadata {
    /// All known topic names, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.leaders.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Partition ids of a topic, sorted; `None` if the topic is unknown
    pub fn partitions(&self, topic: &str) -> Option<Vec<i32>> {
        self.leaders.get(topic).map(|parts| {
            let mut ids: Vec<i32> = parts.keys().copied().collect();
            ids.sort_unstable();
            ids
        })
    }

    /// Leader broker id for a partition, if the partition is known and has
    /// an elected leader
    pub fn leader_for(&self, topic: &str, partition: i32) -> Option<i32> {
        self.leaders
            .get(topic)
            .and_then(|parts| parts.get(&partition))
            .copied()
            .filter(|id| *id >= 0)
    }

    /// Whether the partition exists at all, leaderless or not
    pub fn has_partition(&self, topic: &str, partition: i32) -> bool {
        self.leaders
            .get(topic)
            .map(|parts| parts.contains_key(&partition))
            .unwrap_or(false)
    }

    /// Broker info by id
    pub fn broker(&self, id: i32) -> Option<&BrokerInfo> {
        self.brokers.iter().find(|b| b.id == id)
    }
}

/// One partition's slot in a batched fetch
#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub topic: String,
    pub partition: i32,
    /// First offset the broker should return
    pub fetch_offset: i64,
    /// Per-partition byte budget
    pub max_bytes: i32,
}

/// A batched fetch covering every ready partition on one broker
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// How long the broker may hold the request open waiting for `min_bytes`
    pub max_wait_ms: i32,
    /// Minimum bytes to accumulate before answering
    pub min_bytes: i32,
    pub partitions: Vec<FetchPartition>,
}

/// A single record as it comes off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub offset: i64,
    /// Broker-assigned timestamp, milliseconds since the epoch
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

/// Per-partition block of a [`FetchResponse`]
#[derive(Debug, Clone)]
pub struct PartitionData {
    pub topic: String,
    pub partition: i32,
    /// Broker-reported error for this partition
    pub error: KafkaErrorCode,
    /// Broker's log end offset; negative when the broker did not report one
    pub high_water_mark: i64,
    /// Complete records decoded from the message set, offsets ascending
    pub records: Vec<Record>,
    /// True when the broker truncated the message set mid-record because
    /// the requested byte budget was too small to hold the next record
    pub partial: bool,
}

impl PartitionData {
    /// A block carrying only an error code
    pub fn error(topic: impl Into<String>, partition: i32, error: KafkaErrorCode) -> Self {
        Self {
            topic: topic.into(),
            partition,
            error,
            high_water_mark: -1,
            records: Vec::new(),
            partial: false,
        }
    }
}

/// Response to one [`FetchRequest`]
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub partitions: Vec<PartitionData>,
}

/// Cluster-wide operations of the wire client.
///
/// `refresh_metadata` is expected to retry internally up to the configured
/// metadata retry limit before giving up; the consumer engine treats a
/// returned error as a hard refresh failure and backs off.
#[async_trait]
pub trait WireClient: Send + Sync + 'static {
    /// Current, possibly cached, view of the cluster
    async fn metadata(&self) -> Result<ClusterMetadata>;

    /// Force a metadata refresh and return the updated view
    async fn refresh_metadata(&self) -> Result<ClusterMetadata>;

    /// Look up a partition's offset extreme; `time` is [`OFFSET_OLDEST`] or
    /// [`OFFSET_NEWEST`]
    async fn get_offset(&self, topic: &str, partition: i32, time: i64) -> Result<i64>;

    /// Open (or reuse) a connection to the given broker
    async fn connect(&self, broker_id: i32) -> Result<Arc<dyn BrokerLink>>;
}

/// A live connection to one broker, able to serve batched fetches.
///
/// Implementations honour the configured read timeout; the engine
/// additionally guards every call with its own timeout so a wedged
/// connection cannot stall shutdown.
#[async_trait]
pub trait BrokerLink: Send + Sync + 'static {
    /// Issue one batched fetch and wait for the broker's response
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}
