#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # StreamTap
//!
//! StreamTap is a Kafka partition-consumer engine: give it a
//! `(topic, partition, starting offset)` and it hands back a strictly
//! ordered stream of messages from that partition, recovering
//! transparently from leader changes, broker bounces and partial fetch
//! responses.
//!
//! ## What it does
//!
//! - **Ordered delivery**: per partition, message offsets are strictly
//!   increasing, never below the resolved starting offset, with no gaps
//!   introduced by failover.
//! - **Batched fetching**: all partitions led by the same broker share one
//!   connection and one `FetchRequest` per cycle.
//! - **Leader failover**: when leadership moves, the affected partition
//!   re-resolves the leader through metadata and resumes from the same
//!   offset; siblings on the old broker are unaffected beyond their own
//!   re-route.
//! - **Backpressure without starvation**: a slow reader throttles only its
//!   own partition, never the other partitions sharing the broker.
//!
//! It does **not** persist offsets, coordinate consumer groups, or decide
//! rewind policy when an offset falls out of range; callers own all three.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use streamtap::{Consumer, ConsumerConfig, OFFSET_OLDEST};
//! use streamtap::wire::WireClient;
//!
//! async fn tail(client: Arc<dyn WireClient>) -> streamtap::Result<()> {
//!     let consumer = Consumer::new(client, ConsumerConfig::default()).await?;
//!     let (mut partition, start) = consumer
//!         .consume_partition("events", 0, OFFSET_OLDEST)
//!         .await?;
//!     println!("consuming from offset {start}");
//!     while let Some(message) = partition.recv().await {
//!         println!("{} @ {}", String::from_utf8_lossy(&message.value), message.offset);
//!     }
//!     partition.close().await?;
//!     consumer.close().await
//! }
//! ```
//!
//! The `client` is any implementation of the wire-client contract in
//! [`wire`]; the engine never opens sockets itself. [`testing::MockCluster`]
//! provides an in-process implementation for tests.
//!
//! ## Architecture
//!
//! - [`consumer`]: the three-driver engine (master, broker consumers,
//!   partition consumers)
//! - [`wire`]: the contract StreamTap consumes from a lower-level Kafka
//!   wire client
//! - [`config`]: tuning knobs
//! - [`error`]: error types and the Kafka error-code mapping
//! - [`testing`]: scriptable in-process cluster for tests

pub mod config;
pub mod consumer;
pub mod error;
pub mod testing;
pub mod wire;

pub use config::ConsumerConfig;
pub use consumer::{Consumer, ConsumerError, ConsumerMessage, PartitionConsumer};
pub use error::{KafkaErrorCode, Result, TapError};
pub use wire::{OFFSET_NEWEST, OFFSET_OLDEST};
