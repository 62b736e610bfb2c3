//! Shared fixtures for StreamTap integration tests

#![allow(dead_code)]

use std::time::Duration;
use streamtap::{ConsumerConfig, ConsumerError, ConsumerMessage, PartitionConsumer};

/// How long a test is willing to wait for something that should happen
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a test watches for something that should NOT happen
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Install a test subscriber; `RUST_LOG=streamtap=debug` shows engine flow
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with timings tightened for tests
pub fn fast_config() -> ConsumerConfig {
    ConsumerConfig {
        max_wait_ms: 50,
        retry_backoff_ms: 50,
        read_timeout_ms: 1_000,
        metadata_retry_backoff_ms: 10,
        ..Default::default()
    }
}

/// Receive the next message and assert its offset
pub async fn expect_message(pc: &mut PartitionConsumer, expected_offset: i64) -> ConsumerMessage {
    let message = tokio::time::timeout(RECV_TIMEOUT, pc.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for message at offset {expected_offset}"))
        .unwrap_or_else(|| panic!("stream ended while expecting offset {expected_offset}"));
    assert_eq!(
        message.offset, expected_offset,
        "incorrect message offset: expected={expected_offset}, actual={}",
        message.offset
    );
    message
}

/// Receive the next error off the error queue
pub async fn expect_error(pc: &mut PartitionConsumer) -> ConsumerError {
    tokio::time::timeout(RECV_TIMEOUT, pc.recv_error())
        .await
        .expect("timed out waiting for a consumer error")
        .expect("error stream ended while expecting an error")
}

/// Assert the message stream reports end-of-stream
pub async fn expect_end_of_stream(pc: &mut PartitionConsumer) {
    let next = tokio::time::timeout(RECV_TIMEOUT, pc.recv())
        .await
        .expect("timed out waiting for the stream to end");
    assert!(
        next.is_none(),
        "expected end of stream, got message at offset {:?}",
        next.map(|m| m.offset)
    );
}

/// Assert no message shows up within the quiet period
pub async fn expect_no_message(pc: &mut PartitionConsumer) {
    if let Ok(message) = tokio::time::timeout(QUIET_PERIOD, pc.recv()).await {
        panic!(
            "expected silence, got message at offset {:?}",
            message.map(|m| m.offset)
        );
    }
}
