//! The ordered store of sent-but-unacknowledged messages.
//!
//! 已发送但未确认消息的有序存储。

use bytes::Bytes;
use std::collections::VecDeque;

/// An immutable pairing of an encoded frame with its assigned sequence id.
///
/// Created at write time, evicted when an acknowledgement covering it
/// arrives.
///
/// 编码帧与其分配的序列号的不可变配对。写入时创建，当覆盖它的确认到达时被逐出。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedMessage {
    /// Monotonically increasing, starting at 1 for a connection's lifetime.
    pub sequence_id: u64,
    /// The complete encoded frame as it goes on the wire.
    pub payload: Bytes,
}

/// Holds the contiguous suffix of all sent messages that the peer has not
/// yet acknowledged, sorted by ascending sequence id.
///
/// 保存对端尚未确认的所有已发送消息的连续后缀，按序列号升序排列。
#[derive(Debug, Default)]
pub(crate) struct MessageStore {
    entries: VecDeque<SequencedMessage>,
    buffered_bytes: usize,
}

impl MessageStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a newly sequenced message. The caller guarantees ascending
    /// sequence ids.
    pub(crate) fn push(&mut self, message: SequencedMessage) {
        debug_assert!(
            self.entries
                .back()
                .is_none_or(|last| last.sequence_id < message.sequence_id)
        );
        self.buffered_bytes += message.payload.len();
        self.entries.push_back(message);
    }

    /// Evicts every entry with `sequence_id <= acked_id`. Returns the number
    /// of payload bytes freed. Idempotent: re-acking an already covered id
    /// frees nothing.
    ///
    /// 逐出所有 `sequence_id <= acked_id` 的条目。返回释放的载荷字节数。
    /// 幂等：重复确认已覆盖的序列号不会释放任何内容。
    pub(crate) fn ack(&mut self, acked_id: u64) -> usize {
        let mut freed = 0;
        while let Some(front) = self.entries.front() {
            if front.sequence_id > acked_id {
                break;
            }
            freed += front.payload.len();
            self.entries.pop_front();
        }
        self.buffered_bytes -= freed;
        freed
    }

    /// Returns a copy of the first entry with `sequence_id > cursor`, if
    /// any. Used to walk the untransmitted tail without holding a borrow
    /// across sink I/O.
    ///
    /// 返回第一个 `sequence_id > cursor` 的条目的副本（如果存在）。
    /// 用于在不跨越接收器I/O持有借用的情况下遍历未传输的尾部。
    pub(crate) fn next_after(&self, cursor: u64) -> Option<SequencedMessage> {
        let start = self.entries.partition_point(|m| m.sequence_id <= cursor);
        self.entries.get(start).cloned()
    }

    /// The sequence id of the oldest buffered entry.
    pub(crate) fn first_sequence_id(&self) -> Option<u64> {
        self.entries.front().map(|m| m.sequence_id)
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
