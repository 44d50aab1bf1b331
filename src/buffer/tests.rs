//! Tests for buffering, acknowledgement eviction, backpressure, and resend.

use super::MessageBuffer;
use crate::config::Config;
use crate::error::Error;
use crate::message::{LengthPrefixedCodec, Message};
use crate::testing::{decode_frames, MockSink};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

fn make_buffer(limit: usize) -> (Arc<MessageBuffer>, Arc<MockSink>) {
    let sink = Arc::new(MockSink::new());
    let config = Config {
        buffer_limit_bytes: limit,
        ..Config::default()
    };
    let buffer = Arc::new(MessageBuffer::new(
        sink.clone(),
        Arc::new(LengthPrefixedCodec),
        &config,
    ));
    (buffer, sink)
}

fn app(payload: &'static str) -> Message {
    Message::Application(Bytes::from_static(payload.as_bytes()))
}

/// Drains `sink` into `all` until `handle` completes, then once more.
async fn drain_until<T>(
    handle: &mut JoinHandle<T>,
    sink: &MockSink,
    all: &mut Vec<Bytes>,
) -> T {
    loop {
        tokio::select! {
            result = &mut *handle => {
                all.extend(sink.drain());
                return result.unwrap();
            }
            _ = sleep(Duration::from_millis(10)) => {
                all.extend(sink.drain());
            }
        }
    }
}

#[tokio::test]
async fn test_writes_are_sequenced_and_transmitted_in_order() {
    let (buffer, sink) = make_buffer(100_000);

    for payload in ["one", "two", "three"] {
        buffer.write(&app(payload)).await.unwrap();
    }

    assert_eq!(buffer.sent_sequence_id(), 3);
    assert_eq!(buffer.buffered_len(), 3);

    let messages = sink.decoded().unwrap();
    assert_eq!(
        messages,
        vec![app("one"), app("two"), app("three")],
        "wire order must match write order"
    );
}

#[tokio::test]
async fn test_ack_prunes_exactly_the_covered_prefix() {
    let (buffer, _sink) = make_buffer(100_000);
    for payload in ["a", "b", "c", "d"] {
        buffer.write(&app(payload)).await.unwrap();
    }

    buffer.ack(2);
    assert_eq!(buffer.buffered_len(), 2);

    // Re-acking the same or a lower value is a no-op.
    buffer.ack(2);
    buffer.ack(0);
    assert_eq!(buffer.buffered_len(), 2);

    buffer.ack(4);
    assert_eq!(buffer.buffered_len(), 0);
    assert_eq!(buffer.buffered_bytes(), 0);
}

#[tokio::test]
async fn test_ack_beyond_anything_sent_is_not_an_error() {
    let (buffer, _sink) = make_buffer(100_000);
    buffer.write(&app("only")).await.unwrap();

    buffer.ack(999);
    assert_eq!(buffer.buffered_len(), 0);
    // Sequencing continues where it left off.
    buffer.write(&app("next")).await.unwrap();
    assert_eq!(buffer.sent_sequence_id(), 2);
}

#[tokio::test]
async fn test_backpressure_blocks_until_ack_not_wire_drain() {
    let (buffer, sink) = make_buffer(1);

    // A is admitted immediately: the buffer was empty.
    buffer.write(&app("aaaaa")).await.unwrap();

    // B must suspend: buffered bytes are at the limit.
    let buffer_b = buffer.clone();
    let mut b = tokio::spawn(async move { buffer_b.write(&app("bbbbb")).await });
    sleep(Duration::from_millis(50)).await;
    assert!(!b.is_finished(), "B should be suspended on the gate");

    // Reading A off the wire does not release the gate.
    let drained = sink.drain();
    assert_eq!(decode_frames(&drained).unwrap(), vec![app("aaaaa")]);
    sleep(Duration::from_millis(50)).await;
    assert!(!b.is_finished(), "wire drain must not release the writer");

    // Only the acknowledgement does.
    buffer.ack(1);
    timeout(Duration::from_secs(1), &mut b)
        .await
        .expect("B should unblock after the ack")
        .unwrap()
        .unwrap();
    assert_eq!(decode_frames(&sink.drain()).unwrap(), vec![app("bbbbb")]);
}

#[tokio::test]
async fn test_blocked_writers_release_in_fifo_order() {
    let (buffer, sink) = make_buffer(1);
    buffer.write(&app("first")).await.unwrap();

    let buffer_b = buffer.clone();
    let b = tokio::spawn(async move { buffer_b.write(&app("second")).await });
    sleep(Duration::from_millis(20)).await;
    let buffer_c = buffer.clone();
    let c = tokio::spawn(async move { buffer_c.write(&app("third")).await });
    sleep(Duration::from_millis(20)).await;

    // Each ack admits exactly the oldest waiter.
    buffer.ack(1);
    timeout(Duration::from_secs(1), b).await.unwrap().unwrap().unwrap();
    assert!(!c.is_finished(), "C must stay queued behind B's admission");

    buffer.ack(2);
    timeout(Duration::from_secs(1), c).await.unwrap().unwrap().unwrap();

    let messages = decode_frames(&sink.drain()).unwrap();
    assert_eq!(messages, vec![app("first"), app("second"), app("third")]);
}

#[tokio::test]
async fn test_cancelled_waiter_does_not_block_the_queue() {
    let (buffer, _sink) = make_buffer(1);
    buffer.write(&app("first")).await.unwrap();

    let buffer_b = buffer.clone();
    let b = tokio::spawn(async move { buffer_b.write(&app("second")).await });
    sleep(Duration::from_millis(20)).await;
    let buffer_c = buffer.clone();
    let c = tokio::spawn(async move { buffer_c.write(&app("third")).await });
    sleep(Duration::from_millis(20)).await;

    // B gives up waiting; its queued grant must be reclaimed.
    b.abort();
    let _ = b.await;

    buffer.ack(1);
    timeout(Duration::from_secs(1), c)
        .await
        .expect("C should be admitted past the cancelled waiter")
        .unwrap()
        .unwrap();
    assert_eq!(buffer.sent_sequence_id(), 2, "B never sequenced a message");
}

#[tokio::test]
async fn test_writer_cancelled_after_receiving_its_grant_returns_capacity() {
    let (buffer, _sink) = make_buffer(1);
    buffer.write(&app("first")).await.unwrap();

    let buffer_b = buffer.clone();
    let b = tokio::spawn(async move { buffer_b.write(&app("second")).await });
    sleep(Duration::from_millis(20)).await;

    // The ack hands B the freed capacity, but B is cancelled before it
    // ever runs again. Its grant must come back to the gate.
    buffer.ack(1);
    b.abort();
    let _ = b.await;

    assert_eq!(buffer.buffered_len(), 0);
    let buffer_c = buffer.clone();
    let c = tokio::spawn(async move { buffer_c.write(&app("third")).await });
    timeout(Duration::from_secs(1), c)
        .await
        .expect("the buffer is empty; the writer must be admitted")
        .unwrap()
        .unwrap();
    assert_eq!(buffer.sent_sequence_id(), 2, "B never sequenced a message");
}

#[tokio::test]
async fn test_resend_replays_unacked_suffix_after_sequence_announcement() {
    let (buffer, _old_sink) = make_buffer(100_000);
    for payload in ["a", "b", "c", "d", "e"] {
        buffer.write(&app(payload)).await.unwrap();
    }
    buffer.ack(2);

    let new_sink = Arc::new(MockSink::new());
    buffer.resend(new_sink.clone()).await.unwrap();

    let messages = new_sink.decoded().unwrap();
    assert_eq!(
        messages,
        vec![
            Message::Sequence { sequence_id: 3 },
            app("c"),
            app("d"),
            app("e"),
        ]
    );
}

#[tokio::test]
async fn test_resend_with_empty_buffer_announces_next_fresh_id() {
    let (buffer, _old_sink) = make_buffer(100_000);
    for payload in ["a", "b"] {
        buffer.write(&app(payload)).await.unwrap();
    }
    buffer.ack(2);

    let new_sink = Arc::new(MockSink::new());
    buffer.resend(new_sink.clone()).await.unwrap();
    assert_eq!(
        new_sink.decoded().unwrap(),
        vec![Message::Sequence { sequence_id: 3 }]
    );

    // The next write continues the sequence on the new sink.
    buffer.write(&app("c")).await.unwrap();
    assert_eq!(buffer.sent_sequence_id(), 3);
}

#[tokio::test]
async fn test_ack_during_replay_skips_unsent_entries() {
    let (buffer, _old_sink) = make_buffer(100_000);
    // Three 5-byte payloads: each frame is 10 bytes on the wire.
    for payload in ["aaaaa", "bbbbb", "ccccc"] {
        buffer.write(&app(payload)).await.unwrap();
    }

    // Capacity fits the 13-byte Sequence frame plus one replayed frame,
    // so the replay suspends while writing the second entry.
    let new_sink = Arc::new(MockSink::with_capacity(23));
    let buffer_r = buffer.clone();
    let sink_r = new_sink.clone();
    let mut resend = tokio::spawn(async move { buffer_r.resend(sink_r).await });

    sleep(Duration::from_millis(50)).await;
    assert_eq!(new_sink.frame_count(), 2, "replay should be suspended mid-way");

    // Everything gets acked while the replay is stalled.
    buffer.ack(3);

    let mut all = new_sink.drain();
    drain_until(&mut resend, &new_sink, &mut all).await.unwrap();

    let messages = decode_frames(&all).unwrap();
    // The entry in flight when the ack landed still goes out (at-least-once),
    // but the never-written third entry is skipped.
    assert_eq!(
        messages,
        vec![
            Message::Sequence { sequence_id: 1 },
            app("aaaaa"),
            app("bbbbb"),
        ]
    );
}

#[tokio::test]
async fn test_write_during_replay_is_queued_after_it() {
    let (buffer, _old_sink) = make_buffer(100_000);
    for payload in ["aaaaa", "bbbbb"] {
        buffer.write(&app(payload)).await.unwrap();
    }

    // Capacity fits only the Sequence frame; the replay stalls immediately.
    let new_sink = Arc::new(MockSink::with_capacity(13));
    let buffer_r = buffer.clone();
    let sink_r = new_sink.clone();
    let mut resend = tokio::spawn(async move { buffer_r.resend(sink_r).await });
    sleep(Duration::from_millis(50)).await;

    let buffer_w = buffer.clone();
    let mut write = tokio::spawn(async move { buffer_w.write(&app("ccccc")).await });
    sleep(Duration::from_millis(50)).await;
    assert!(!write.is_finished(), "the write must queue behind the replay");

    let mut all = Vec::new();
    drain_until(&mut resend, &new_sink, &mut all).await.unwrap();
    drain_until(&mut write, &new_sink, &mut all).await.unwrap();

    let messages = decode_frames(&all).unwrap();
    assert_eq!(
        messages,
        vec![
            Message::Sequence { sequence_id: 1 },
            app("aaaaa"),
            app("bbbbb"),
            app("ccccc"),
        ]
    );
}

#[tokio::test]
async fn test_sink_failure_keeps_messages_buffered_for_replay() {
    let (buffer, sink) = make_buffer(100_000);
    buffer.write(&app("before")).await.unwrap();
    sink.drain();
    sink.close();

    // The transport is gone; the writer must not observe the failure.
    buffer.write(&app("lost-on-wire")).await.unwrap();
    buffer.write(&app("never-sent")).await.unwrap();
    assert_eq!(buffer.buffered_len(), 3);

    let new_sink = Arc::new(MockSink::new());
    buffer.resend(new_sink.clone()).await.unwrap();
    assert_eq!(
        new_sink.decoded().unwrap(),
        vec![
            Message::Sequence { sequence_id: 1 },
            app("before"),
            app("lost-on-wire"),
            app("never-sent"),
        ]
    );
}

#[tokio::test]
async fn test_receive_side_counts_only_application_messages() {
    let (buffer, _sink) = make_buffer(100_000);

    assert!(buffer.should_process_message(&app("m1")).unwrap());
    assert!(buffer.should_process_message(&Message::Ping).unwrap());
    assert!(buffer
        .should_process_message(&Message::Ack { sequence_id: 1 })
        .unwrap());
    assert!(buffer.should_process_message(&app("m2")).unwrap());

    assert_eq!(buffer.latest_received_sequence_id(), 2);
}

#[tokio::test]
async fn test_duplicates_after_peer_resend_are_skipped() {
    let (buffer, _sink) = make_buffer(100_000);
    for payload in ["m1", "m2", "m3"] {
        assert!(buffer.should_process_message(&app(payload)).unwrap());
    }

    // Peer reconnects and replays from the start.
    assert!(buffer
        .should_process_message(&Message::Sequence { sequence_id: 1 })
        .unwrap());
    assert!(!buffer.should_process_message(&app("m1")).unwrap());
    assert!(!buffer.should_process_message(&app("m2")).unwrap());
    assert!(!buffer.should_process_message(&app("m3")).unwrap());
    // The first genuinely new message is processed.
    assert!(buffer.should_process_message(&app("m4")).unwrap());
    assert_eq!(buffer.latest_received_sequence_id(), 4);
}

#[tokio::test]
async fn test_sequence_gap_is_a_protocol_violation() {
    let (buffer, _sink) = make_buffer(100_000);
    assert!(buffer.should_process_message(&app("m1")).unwrap());
    assert!(buffer.should_process_message(&app("m2")).unwrap());

    let result = buffer.should_process_message(&Message::Sequence { sequence_id: 5 });
    assert!(matches!(
        result,
        Err(Error::SequenceGap {
            expected: 3,
            received: 5
        })
    ));
}

#[tokio::test]
async fn test_incoming_is_ignored_until_sequence_after_our_resend() {
    let (buffer, _sink) = make_buffer(100_000);
    assert!(buffer.should_process_message(&app("m1")).unwrap());

    let new_sink = Arc::new(MockSink::new());
    buffer.resend(new_sink).await.unwrap();

    // Leftovers from the broken connection are dropped.
    assert!(!buffer.should_process_message(&app("stale")).unwrap());
    // The peer's announcement re-synchronizes the stream.
    assert!(buffer
        .should_process_message(&Message::Sequence { sequence_id: 2 })
        .unwrap());
    assert!(buffer.should_process_message(&app("m2")).unwrap());
    assert_eq!(buffer.latest_received_sequence_id(), 2);
}

#[tokio::test]
async fn test_pending_ack_reports_progress_once() {
    let (buffer, sink) = make_buffer(100_000);

    // No progress, nothing to report.
    buffer.send_pending_ack().await.unwrap();
    assert_eq!(sink.frame_count(), 0);

    buffer.should_process_message(&app("m1")).unwrap();
    buffer.should_process_message(&app("m2")).unwrap();
    buffer.send_pending_ack().await.unwrap();
    assert_eq!(
        sink.decoded().unwrap(),
        vec![Message::Ack { sequence_id: 2 }]
    );

    // Already reported; the next tick writes nothing.
    sink.drain();
    buffer.send_pending_ack().await.unwrap();
    assert_eq!(sink.frame_count(), 0);
}

#[tokio::test]
async fn test_deferred_ack_is_merged_onto_replay_tail() {
    let (buffer, _sink) = make_buffer(100_000);
    buffer.write(&app("m1")).await.unwrap();
    buffer.should_process_message(&app("peer-1")).unwrap();
    buffer.should_process_message(&app("peer-2")).unwrap();

    let new_sink = Arc::new(MockSink::new());
    buffer.resend(new_sink.clone()).await.unwrap();

    assert_eq!(
        new_sink.decoded().unwrap(),
        vec![
            Message::Sequence { sequence_id: 1 },
            app("m1"),
            Message::Ack { sequence_id: 2 },
        ]
    );

    // The merged ack satisfied the scheduler's next tick.
    new_sink.drain();
    buffer.send_pending_ack().await.unwrap();
    assert_eq!(new_sink.frame_count(), 0);
}

#[tokio::test]
async fn test_scheduler_ack_defers_behind_an_in_progress_replay() {
    let (buffer, _old_sink) = make_buffer(100_000);
    buffer.write(&app("aaaaa")).await.unwrap();
    buffer.should_process_message(&app("peer-1")).unwrap();
    buffer.should_process_message(&app("peer-2")).unwrap();

    // The Sequence frame saturates the sink, so the replay stays open.
    let new_sink = Arc::new(MockSink::with_capacity(13));
    let buffer_r = buffer.clone();
    let sink_r = new_sink.clone();
    let mut resend = tokio::spawn(async move { buffer_r.resend(sink_r).await });
    sleep(Duration::from_millis(50)).await;

    // A scheduler tick lands mid-replay; it must queue behind it instead
    // of interleaving an Ack into the replayed stream.
    let buffer_a = buffer.clone();
    let mut tick = tokio::spawn(async move { buffer_a.send_pending_ack().await });
    sleep(Duration::from_millis(50)).await;
    assert!(!tick.is_finished());

    let mut all = Vec::new();
    drain_until(&mut resend, &new_sink, &mut all).await.unwrap();
    drain_until(&mut tick, &new_sink, &mut all).await.unwrap();

    let messages = decode_frames(&all).unwrap();
    assert_eq!(
        messages,
        vec![
            Message::Sequence { sequence_id: 1 },
            app("aaaaa"),
            Message::Ack { sequence_id: 2 },
        ],
        "exactly one ack, after the replay; the deferred tick wrote nothing new"
    );
}

#[tokio::test]
async fn test_ping_bypasses_buffer_and_sequencing() {
    let (buffer, sink) = make_buffer(100_000);
    buffer.write(&Message::Ping).await.unwrap();
    buffer.write(&app("m1")).await.unwrap();
    buffer.write(&Message::Ping).await.unwrap();

    assert_eq!(buffer.sent_sequence_id(), 1);
    assert_eq!(buffer.buffered_len(), 1);
    assert_eq!(
        sink.decoded().unwrap(),
        vec![Message::Ping, app("m1"), Message::Ping]
    );

    // Pings are never replayed.
    let new_sink = Arc::new(MockSink::new());
    buffer.resend(new_sink.clone()).await.unwrap();
    assert_eq!(
        new_sink.decoded().unwrap(),
        vec![Message::Sequence { sequence_id: 1 }, app("m1")]
    );
}

#[tokio::test]
async fn test_dispose_releases_suspended_writers() {
    let (buffer, _sink) = make_buffer(1);
    buffer.write(&app("filler")).await.unwrap();

    let buffer_b = buffer.clone();
    let b = tokio::spawn(async move { buffer_b.write(&app("blocked")).await });
    sleep(Duration::from_millis(50)).await;

    buffer.dispose();
    let result = timeout(Duration::from_secs(1), b)
        .await
        .expect("the writer must not hang after dispose")
        .unwrap();
    assert!(matches!(result, Err(Error::Disposed)));
}

#[tokio::test]
async fn test_operations_after_dispose_fail_cleanly() {
    let (buffer, _sink) = make_buffer(100_000);
    buffer.write(&app("m1")).await.unwrap();
    buffer.dispose();
    buffer.dispose(); // idempotent

    assert!(matches!(
        buffer.write(&app("m2")).await,
        Err(Error::Disposed)
    ));
    assert!(matches!(
        buffer.should_process_message(&app("in")),
        Err(Error::Disposed)
    ));
    assert!(matches!(
        buffer.send_pending_ack().await,
        Err(Error::Disposed)
    ));
    let new_sink = Arc::new(MockSink::new());
    assert!(matches!(buffer.resend(new_sink).await, Err(Error::Disposed)));
    // Acks are ignored, never a panic.
    buffer.ack(1);
}

mod gate {
    use crate::buffer::gate::CapacityGate;
    use crate::error::Error;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_acquire_is_immediate_under_the_limit() {
        let gate = CapacityGate::new(100);
        gate.acquire(60).await.unwrap();
        gate.acquire(60).await.unwrap(); // 60 < 100, still admitted
        assert_eq!(gate.in_use(), 120);
    }

    #[tokio::test]
    async fn test_release_hands_capacity_to_the_oldest_waiter() {
        let gate = Arc::new(CapacityGate::new(10));
        gate.acquire(10).await.unwrap();

        let gate_b = gate.clone();
        let b = tokio::spawn(async move { gate_b.acquire(5).await });
        sleep(Duration::from_millis(20)).await;
        assert!(!b.is_finished());

        gate.release(10);
        timeout(Duration::from_secs(1), b).await.unwrap().unwrap().unwrap();
        assert_eq!(gate.in_use(), 5);
    }

    #[tokio::test]
    async fn test_grant_dropped_unconsumed_returns_to_the_gate() {
        let gate = Arc::new(CapacityGate::new(1));
        gate.acquire(1).await.unwrap();

        let gate_b = gate.clone();
        let b = tokio::spawn(async move { gate_b.acquire(1).await });
        sleep(Duration::from_millis(20)).await;

        // The release delivers B's grant, but B is cancelled while the
        // grant still sits in its channel.
        gate.release(1);
        b.abort();
        let _ = b.await;
        assert_eq!(gate.in_use(), 0);

        // The next acquire sees the reclaimed capacity immediately.
        timeout(Duration::from_secs(1), gate.acquire(1))
            .await
            .expect("the gate is idle; admission must be immediate")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_pending_waiters() {
        let gate = Arc::new(CapacityGate::new(1));
        gate.acquire(1).await.unwrap();

        let gate_b = gate.clone();
        let b = tokio::spawn(async move { gate_b.acquire(1).await });
        sleep(Duration::from_millis(20)).await;

        gate.close();
        let result = timeout(Duration::from_secs(1), b).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Disposed)));
        assert!(matches!(gate.acquire(1).await, Err(Error::Disposed)));
    }
}
