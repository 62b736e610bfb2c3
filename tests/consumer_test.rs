//! End-to-end tests for the partition consumption engine, driven against
//! the in-process mock cluster.

mod common;

use common::*;
use streamtap::testing::MockCluster;
use streamtap::{Consumer, ConsumerConfig, KafkaErrorCode, TapError, OFFSET_NEWEST, OFFSET_OLDEST};

/// When a concrete offset is provided, consumption starts exactly there.
#[tokio::test]
async fn consume_from_manual_offset() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 0, 2345);
    for offset in 1234..1244 {
        cluster.add_record(0, "my_topic", 0, offset, b"Foo");
    }

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let (mut pc, concrete) = consumer.consume_partition("my_topic", 0, 1234).await.unwrap();
    assert_eq!(concrete, 1234);

    for offset in 1234..1244 {
        expect_message(&mut pc, offset).await;
    }

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// The newest sentinel resolves to the broker-advertised newest offset;
/// records from before it in the same batch are dropped, and the high-water
/// mark is surfaced.
#[tokio::test]
async fn consume_from_newest_sentinel() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 7, 10);
    cluster.push_fetch(0, "my_topic", 0, &[9, 10, 11], 14);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let (mut pc, concrete) = consumer
        .consume_partition("my_topic", 0, OFFSET_NEWEST)
        .await
        .unwrap();
    assert_eq!(concrete, 10);

    let message = expect_message(&mut pc, 10).await;
    assert_eq!(message.high_water_mark, 14);
    assert!(message.offset < message.high_water_mark);
    assert_eq!(pc.high_water_mark_offset(), 14);
    expect_message(&mut pc, 11).await;

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// A consumer that starts exactly at the newest offset is empty but live,
/// and wakes up as soon as new records land.
#[tokio::test]
async fn consume_at_newest_is_empty_but_live() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 7, 10);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let (mut pc, concrete) = consumer
        .consume_partition("my_topic", 0, OFFSET_NEWEST)
        .await
        .unwrap();
    assert_eq!(concrete, 10);

    expect_no_message(&mut pc).await;
    cluster.add_record(0, "my_topic", 0, 10, b"Foo");
    expect_message(&mut pc, 10).await;

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// A closed partition consumer can be created anew on the same partition.
#[tokio::test]
async fn recreate_after_close() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 0, 1000);
    cluster.add_record(0, "my_topic", 0, 10, b"Foo");

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();

    let (mut pc, _) = consumer.consume_partition("my_topic", 0, 10).await.unwrap();
    expect_message(&mut pc, 10).await;
    pc.close().await.unwrap();

    let (mut pc, _) = consumer.consume_partition("my_topic", 0, 10).await.unwrap();
    expect_message(&mut pc, 10).await;
    pc.close().await.unwrap();

    consumer.close().await.unwrap();
}

/// Consuming the same partition twice at once is rejected.
#[tokio::test]
async fn duplicate_subscription_rejected() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 0, 1000);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let (mut pc, _) = consumer.consume_partition("my_topic", 0, 0).await.unwrap();

    match consumer.consume_partition("my_topic", 0, 0).await {
        Ok(_) => panic!("a partition must not be consumed twice at the same time"),
        Err(TapError::Configuration(reason)) => {
            assert_eq!(reason, "That topic/partition is already being consumed");
        }
        Err(other) => panic!("expected a configuration error, got {other:?}"),
    }

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// Offsets outside the partition's advertised range are rejected up front.
#[tokio::test]
async fn initial_offset_out_of_range() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    // Extremes as a confused broker reports them: no valid offset exists.
    cluster.set_offsets("my_topic", 0, 2345, 1234);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    for requested in [0, 3456, -3] {
        let result = consumer.consume_partition("my_topic", 0, requested).await;
        assert!(
            matches!(result, Err(TapError::OffsetOutOfRange)),
            "offset {requested} should have been rejected as out of range"
        );
    }

    consumer.close().await.unwrap();
}

/// A topic the cluster has never heard of fails synchronously.
#[tokio::test]
async fn unknown_topic_rejected() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let result = consumer.consume_partition("my_topic", 0, OFFSET_OLDEST).await;
    assert!(matches!(result, Err(TapError::UnknownTopicOrPartition)));

    consumer.close().await.unwrap();
}

/// Metadata queries pass straight through to the wire client.
#[tokio::test]
async fn topics_and_partitions_passthrough() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("orders", 0, 0);
    cluster.set_leader("orders", 1, 0);
    cluster.set_leader("audit", 0, 0);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    assert_eq!(consumer.topics().await.unwrap(), vec!["audit", "orders"]);
    assert_eq!(consumer.partitions("orders").await.unwrap(), vec![0, 1]);
    assert!(matches!(
        consumer.partitions("missing").await,
        Err(TapError::UnknownTopicOrPartition)
    ));

    consumer.close().await.unwrap();
}

/// When the leader turns the partition away, the consumer reports exactly
/// one error, rides out a metadata refresh that still names the stale
/// leader, and resumes seamlessly on the new one.
#[tokio::test]
async fn leader_reassignment_resumes_in_order() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.add_broker(1);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 123, 1000);
    cluster.add_record(0, "my_topic", 0, 123, b"Foo");
    cluster.fail_fetch_from(0, "my_topic", 0, 124, KafkaErrorCode::NotLeaderOrFollower);

    let config = ConsumerConfig {
        return_errors: true,
        // Wide enough that the re-election below lands inside the pacing
        // window after the first, still-stale, metadata refresh.
        retry_backoff_ms: 200,
        ..fast_config()
    };
    let consumer = Consumer::new(cluster.client(), config).await.unwrap();
    let (mut pc, concrete) = consumer
        .consume_partition("my_topic", 0, OFFSET_OLDEST)
        .await
        .unwrap();
    assert_eq!(concrete, 123);

    expect_message(&mut pc, 123).await;

    let error = expect_error(&mut pc).await;
    assert!(
        matches!(error.cause, TapError::NotLeaderForPartition),
        "unexpected error: {error}"
    );

    // The first refresh has already come back still naming broker 0; while
    // the consumer waits out the backoff, the cluster elects broker 1,
    // which has the next record.
    cluster.set_leader("my_topic", 0, 1);
    cluster.add_record(1, "my_topic", 0, 124, b"Foo");

    expect_message(&mut pc, 124).await;

    // Exactly one error: any second one would have been queued before the
    // resumed delivery above.
    assert!(
        pc.errors().try_recv().is_err(),
        "expected exactly one error on the error queue"
    );

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// Fetched offsets may be non-contiguous (compacted topics); all of them
/// at or past the requested offset are delivered in order.
#[tokio::test]
async fn non_contiguous_offsets_delivered() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 0, 1234);
    cluster.push_fetch(0, "my_topic", 0, &[5, 7, 11], 12);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let (mut pc, _) = consumer.consume_partition("my_topic", 0, 3).await.unwrap();

    expect_message(&mut pc, 5).await;
    expect_message(&mut pc, 7).await;
    expect_message(&mut pc, 11).await;

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// Records from before the requested offset, returned as part of the
/// enclosing batch, are silently dropped.
#[tokio::test]
async fn earlier_offsets_dropped() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 0, 1234);
    cluster.push_fetch(0, "my_topic", 0, &[1, 2, 3, 4], 5);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let (mut pc, _) = consumer.consume_partition("my_topic", 0, 3).await.unwrap();

    expect_message(&mut pc, 3).await;
    expect_message(&mut pc, 4).await;
    expect_no_message(&mut pc).await;

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// A partition nobody reads cannot stop a sibling on the same broker from
/// making progress.
#[tokio::test]
async fn slow_sibling_does_not_starve_partition() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_leader("my_topic", 1, 0);
    cluster.set_offsets("my_topic", 0, 1000, 1100);
    cluster.set_offsets("my_topic", 1, 2000, 2100);
    for offset in 1000..1003 {
        cluster.add_record(0, "my_topic", 0, offset, b"Foo");
    }
    for offset in 2000..2003 {
        cluster.add_record(0, "my_topic", 1, offset, b"Foo");
    }

    let config = ConsumerConfig {
        channel_buffer_size: 1,
        ..fast_config()
    };
    let consumer = Consumer::new(cluster.client(), config).await.unwrap();
    let (mut read_side, _) = consumer.consume_partition("my_topic", 0, 1000).await.unwrap();
    let (mut idle_side, _) = consumer.consume_partition("my_topic", 1, 2000).await.unwrap();

    // Nobody reads idle_side; read_side must still flow.
    expect_message(&mut read_side, 1000).await;
    expect_message(&mut read_side, 1001).await;
    expect_message(&mut read_side, 1002).await;

    idle_side.close().await.unwrap();
    read_side.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// Killing a broker leaves its partitions retrying while partitions on
/// other brokers flow on; once it returns, consumption resumes with no gap
/// and no duplicate.
#[tokio::test]
async fn broker_bounce_resumes_without_gap() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.add_broker(1);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_leader("my_topic", 1, 1);
    cluster.set_offsets("my_topic", 0, 1000, 1100);
    cluster.set_offsets("my_topic", 1, 2000, 2100);
    for offset in 1000..1005 {
        cluster.add_record(0, "my_topic", 0, offset, b"Foo");
    }
    for offset in 2000..2010 {
        cluster.add_record(1, "my_topic", 1, offset, b"Foo");
    }

    let config = ConsumerConfig {
        return_errors: true,
        ..fast_config()
    };
    let consumer = Consumer::new(cluster.client(), config).await.unwrap();
    let (mut bounced, _) = consumer.consume_partition("my_topic", 0, 1000).await.unwrap();
    let (mut steady, _) = consumer.consume_partition("my_topic", 1, 2000).await.unwrap();

    expect_message(&mut bounced, 1000).await;
    expect_message(&mut steady, 2000).await;

    cluster.kill_broker(0);

    // The healthy broker keeps serving.
    for offset in 2001..2008 {
        expect_message(&mut steady, offset).await;
    }

    // The bounced partition reports the outage.
    let error = expect_error(&mut bounced).await;
    assert!(
        matches!(error.cause, TapError::Transport(_)),
        "expected a transport error, got {error}"
    );

    // Seed what the broker will serve after it comes back, then revive it.
    for offset in 1005..1010 {
        cluster.add_record(0, "my_topic", 0, offset, b"Foo");
    }
    cluster.restore_broker(0);

    for offset in 1001..1010 {
        expect_message(&mut bounced, offset).await;
    }

    steady.close().await.unwrap();
    bounced.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// Offset-out-of-range mid-stream is unrecoverable: the message queue
/// closes and the caller observes end-of-stream.
#[tokio::test]
async fn mid_stream_out_of_range_closes_stream() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 100, 2000);
    for offset in 100..105 {
        cluster.add_record(0, "my_topic", 0, offset, b"Foo");
    }
    cluster.fail_fetch_from(0, "my_topic", 0, 105, KafkaErrorCode::OffsetOutOfRange);

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let (mut pc, _) = consumer.consume_partition("my_topic", 0, 100).await.unwrap();

    for offset in 100..105 {
        expect_message(&mut pc, offset).await;
    }
    expect_end_of_stream(&mut pc).await;

    // Closing an already-stopped consumer is fine.
    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// A partition stuck re-routing (its broker gone, metadata refreshes
/// failing) can still be closed cleanly.
#[tokio::test]
async fn close_while_awaiting_leader() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 123, 1000);
    cluster.add_record(0, "my_topic", 0, 123, b"Foo");
    cluster.fail_fetch_from(0, "my_topic", 0, 124, KafkaErrorCode::NotLeaderOrFollower);
    cluster.fail_metadata(1_000_000);

    let config = ConsumerConfig {
        return_errors: true,
        ..fast_config()
    };
    let consumer = Consumer::new(cluster.client(), config).await.unwrap();
    let (mut pc, _) = consumer
        .consume_partition("my_topic", 0, OFFSET_OLDEST)
        .await
        .unwrap();

    expect_message(&mut pc, 123).await;
    let error = expect_error(&mut pc).await;
    assert!(matches!(error.cause, TapError::NotLeaderForPartition));

    tokio::time::timeout(RECV_TIMEOUT, pc.close())
        .await
        .expect("close should not hang while re-routing")
        .unwrap();
    consumer.close().await.unwrap();
}

/// Closing the master while a broker consumer sits in a fetch the broker
/// never answers completes within the read timeout.
#[tokio::test]
async fn master_close_with_unresponsive_broker() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 1, 100);
    cluster.stall_broker(0);

    let config = ConsumerConfig {
        read_timeout_ms: 500,
        ..fast_config()
    };
    let consumer = Consumer::new(cluster.client(), config).await.unwrap();
    let (_pc, _) = consumer
        .consume_partition("my_topic", 0, OFFSET_NEWEST)
        .await
        .unwrap();

    tokio::time::timeout(RECV_TIMEOUT, consumer.close())
        .await
        .expect("close should complete despite the unresponsive broker")
        .unwrap();
}

/// Closing the master cascades: every partition stream terminates.
#[tokio::test]
async fn master_close_cascades_to_partitions() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_leader("my_topic", 1, 0);
    cluster.set_offsets("my_topic", 0, 0, 100);
    cluster.set_offsets("my_topic", 1, 0, 100);
    cluster.add_record(0, "my_topic", 0, 0, b"Foo");
    cluster.add_record(0, "my_topic", 1, 0, b"Foo");

    let consumer = Consumer::new(cluster.client(), fast_config()).await.unwrap();
    let (mut first, _) = consumer.consume_partition("my_topic", 0, 0).await.unwrap();
    let (mut second, _) = consumer.consume_partition("my_topic", 1, 0).await.unwrap();

    expect_message(&mut first, 0).await;
    expect_message(&mut second, 0).await;

    tokio::time::timeout(RECV_TIMEOUT, consumer.close())
        .await
        .expect("master close should not deadlock")
        .unwrap();

    // Both streams drain whatever was buffered, then end.
    while tokio::time::timeout(RECV_TIMEOUT, first.recv())
        .await
        .expect("stream should end after master close")
        .is_some()
    {}
    while tokio::time::timeout(RECV_TIMEOUT, second.recv())
        .await
        .expect("stream should end after master close")
        .is_some()
    {}
}

/// A too-small fetch budget grows until the record fits; no error escapes.
#[tokio::test]
async fn fetch_size_grows_after_partial_response() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 0, 100);
    cluster.push_partial_fetch(0, "my_topic", 0);
    cluster.add_record(0, "my_topic", 0, 5, b"wide load");

    let config = ConsumerConfig {
        fetch_default_bytes: 1024,
        ..fast_config()
    };
    let consumer = Consumer::new(cluster.client(), config).await.unwrap();
    let (mut pc, _) = consumer.consume_partition("my_topic", 0, 5).await.unwrap();

    expect_message(&mut pc, 5).await;

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}

/// With the fetch budget already at its ceiling, a partial response is
/// reported as MessageTooLarge and the subscription stays alive.
#[tokio::test]
async fn fetch_at_ceiling_reports_message_too_large() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.add_broker(0);
    cluster.set_leader("my_topic", 0, 0);
    cluster.set_offsets("my_topic", 0, 0, 100);
    cluster.push_partial_fetch(0, "my_topic", 0);

    let config = ConsumerConfig {
        fetch_default_bytes: 1024,
        fetch_max_bytes: 1024,
        return_errors: true,
        ..fast_config()
    };
    let consumer = Consumer::new(cluster.client(), config).await.unwrap();
    let (mut pc, _) = consumer.consume_partition("my_topic", 0, 5).await.unwrap();

    let error = expect_error(&mut pc).await;
    assert!(matches!(error.cause, TapError::MessageTooLarge));

    // Still alive: once the oversized record is compacted away, flow resumes.
    cluster.add_record(0, "my_topic", 0, 6, b"Foo");
    expect_message(&mut pc, 6).await;

    pc.close().await.unwrap();
    consumer.close().await.unwrap();
}
