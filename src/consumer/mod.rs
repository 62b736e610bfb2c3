//! Partition consumption engine
//!
//! Three cooperating drivers, communicating over bounded queues:
//!
//! - [`Consumer`] (the master) owns the cluster-wide registries: which
//!   `(topic, partition)` pairs are being consumed and which broker
//!   consumer serves each leader.
//! - A broker consumer per live leader multiplexes every subscribed
//!   partition into one batched fetch per cycle over a single connection.
//! - A partition consumer per subscription tracks the next offset, filters
//!   and orders fetched records, and feeds the caller-facing message and
//!   error queues.
//!
//! A subscription moves between broker consumers when leadership moves;
//! the caller-visible stream continues from the same offset with no gap
//! and no duplicate.

mod broker;
mod master;
mod partition;

pub use master::Consumer;
pub use partition::PartitionConsumer;

use crate::error::TapError;
use crate::wire::PartitionData;
use bytes::Bytes;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A single message delivered to the caller
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    /// Offset of this message within the partition
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Broker-assigned timestamp, milliseconds since the epoch
    pub timestamp: i64,
    /// Broker's log end offset as of the fetch that returned this message
    pub high_water_mark: i64,
}

/// A recoverable error observed while consuming one partition
#[derive(Debug, Clone)]
pub struct ConsumerError {
    pub topic: String,
    pub partition: i32,
    pub cause: TapError,
}

impl std::fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}: {}", self.topic, self.partition, self.cause)
    }
}

impl std::error::Error for ConsumerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

const LIFECYCLE_RUNNING: u8 = 0;
const LIFECYCLE_CLOSING: u8 = 1;
const LIFECYCLE_CLOSED: u8 = 2;

/// What a broker consumer hands a subscription through its trigger queue.
///
/// `source` is the generation of the broker consumer that produced the
/// feed; the partition driver ignores feeds from a broker it has already
/// left, which defuses races around re-routing.
#[derive(Debug)]
pub(crate) enum Feed {
    /// One per-partition block of a successful fetch
    Response { source: u64, data: PartitionData },
    /// The broker consumer cannot serve this subscription any more; the
    /// subscription must ask the master for a new route
    Abort { source: u64, cause: TapError },
}

/// State shared between a partition consumer's driver, its broker
/// consumer, and the caller-facing handle.
///
/// `next_offset` and `fetch_size` are written by the partition driver and
/// read by the broker driver when it assembles a fetch; everything else
/// crossing task boundaries travels through the trigger queue.
#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) next_offset: AtomicI64,
    pub(crate) fetch_size: AtomicI32,
    high_water_mark: AtomicI64,
    lifecycle: AtomicU8,
    pub(crate) trigger_tx: mpsc::Sender<Feed>,
    shutdown_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Subscription {
    /// Returns the shared state, the trigger receiver for the partition
    /// driver, and the completion signal the driver raises on exit.
    pub(crate) fn new(
        topic: &str,
        partition: i32,
        initial_offset: i64,
        fetch_size: i32,
    ) -> (Arc<Self>, mpsc::Receiver<Feed>, watch::Sender<bool>) {
        // Trigger capacity of exactly 1 is what keeps a slow partition from
        // stalling its siblings: the broker consumer try-sends and moves on.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, _) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);
        let sub = Arc::new(Subscription {
            topic: topic.to_string(),
            partition,
            next_offset: AtomicI64::new(initial_offset),
            fetch_size: AtomicI32::new(fetch_size),
            high_water_mark: AtomicI64::new(0),
            lifecycle: AtomicU8::new(LIFECYCLE_RUNNING),
            trigger_tx,
            shutdown_tx,
            done_rx,
        });
        (sub, trigger_rx, done_tx)
    }

    pub(crate) fn key(&self) -> (String, i32) {
        (self.topic.clone(), self.partition)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.lifecycle.load(Ordering::SeqCst) == LIFECYCLE_RUNNING
    }

    /// Ask the driver to stop; idempotent.
    pub(crate) fn begin_close(&self) {
        let _ = self.lifecycle.compare_exchange(
            LIFECYCLE_RUNNING,
            LIFECYCLE_CLOSING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.shutdown_tx.send(true);
    }

    pub(crate) fn mark_closed(&self) {
        self.lifecycle.store(LIFECYCLE_CLOSED, Ordering::SeqCst);
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Wait until the driver has released all resources and closed the
    /// output queues.
    pub(crate) async fn wait_done(&self) {
        let mut rx = self.done_rx.clone();
        // An error means the sender is gone, which also counts as done.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Record a broker-reported high-water mark; regressions are ignored.
    pub(crate) fn update_high_water_mark(&self, hwm: i64) {
        if hwm > self.high_water_mark.load(Ordering::SeqCst) {
            self.high_water_mark.store(hwm, Ordering::SeqCst);
        }
    }

    pub(crate) fn high_water_mark(&self) -> i64 {
        self.high_water_mark.load(Ordering::SeqCst)
    }
}

/// Resolve when `rx`'s flag is raised. A dropped sender counts as raised
/// so a lost signal can never wedge a driver.
pub(crate) async fn wait_flag(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|raised| *raised).await;
}
