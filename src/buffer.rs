//! The message buffer: the state machine at the heart of resumable delivery.
//!
//! Buffers every sequenced message until the peer acknowledges it, replays
//! the unacknowledged suffix onto a fresh sink after a reconnect, and
//! suspends writers through a backpressure gate while the buffer is full.
//!
//! 消息缓冲区：可恢复投递的核心状态机。
//!
//! 缓冲每条有序消息直到对端确认，在重连后将未确认的后缀重放到新的接收器上，
//! 并在缓冲区满时通过背压闸门挂起写入者。

use crate::config::Config;
use crate::error::{Error, Result};
use crate::message::{Message, MessageCodec};
use crate::sink::MessageSink;
use bytes::BytesMut;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub mod data;
mod gate;

#[cfg(test)]
mod tests;

pub use data::SequencedMessage;

use data::MessageStore;
use gate::CapacityGate;

/// Metadata shared between writers, the ack path, and the resend path.
///
/// Guarded by a plain mutex that is only ever held around field mutation,
/// never across sink I/O, so acknowledgement processing can always make
/// progress while a writer is suspended on the transport.
///
/// 在写入者、确认路径和重发路径之间共享的元数据。
///
/// 由一个普通互斥锁保护，该锁只在字段变更期间持有，绝不跨越接收器I/O，
/// 因此当写入者挂起在传输上时，确认处理始终可以推进。
#[derive(Debug)]
struct Shared {
    store: MessageStore,
    /// Last sequence id assigned to an outgoing message.
    sent_sequence_id: u64,
    /// Highest sequence id written to the current sink. Rewound on resend.
    transmitted_up_to: u64,
    /// Position of the incoming sequenced stream, including duplicates.
    current_receiving_id: u64,
    /// Highest sequence id ever processed from the peer.
    latest_received_id: u64,
    /// Receive progress already reported to the peer via an Ack.
    last_acked_receive_id: u64,
    /// Set after our own resend: ignore incoming messages until the peer's
    /// Sequence announcement re-synchronizes the stream.
    waiting_for_sequence: bool,
    disposed: bool,
}

/// The replaceable output slot. Its async mutex is fair, so writers, the
/// ack scheduler, and a resend queue on the wire in arrival order and a
/// multi-message replay is never interleaved with other frames.
///
/// 可替换的输出槽。其异步互斥锁是公平的，因此写入者、确认调度器和重发
/// 按到达顺序排队上线，多消息重放绝不会与其他帧交错。
struct OutputSlot {
    sink: Option<Arc<dyn MessageSink>>,
}

/// A reliable, resumable delivery buffer for one connection.
///
/// 单个连接的可靠、可恢复投递缓冲区。
pub struct MessageBuffer {
    codec: Arc<dyn MessageCodec>,
    gate: CapacityGate,
    shared: Mutex<Shared>,
    output: tokio::sync::Mutex<OutputSlot>,
}

impl MessageBuffer {
    /// Creates a buffer attached to `sink`, encoding through `codec`.
    pub fn new(sink: Arc<dyn MessageSink>, codec: Arc<dyn MessageCodec>, config: &Config) -> Self {
        Self {
            codec,
            gate: CapacityGate::new(config.buffer_limit_bytes),
            shared: Mutex::new(Shared {
                store: MessageStore::new(),
                sent_sequence_id: 0,
                transmitted_up_to: 0,
                current_receiving_id: 0,
                latest_received_id: 0,
                last_acked_receive_id: 0,
                waiting_for_sequence: false,
                disposed: false,
            }),
            output: tokio::sync::Mutex::new(OutputSlot { sink: Some(sink) }),
        }
    }

    fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes a message to the peer.
    ///
    /// A sequenced message is encoded, assigned the next sequence id,
    /// buffered until acknowledged, and transmitted on the current sink.
    /// The call suspends while the buffer is at its byte limit and resumes
    /// once acknowledgements free enough space (FIFO among writers). A sink
    /// failure is not surfaced: the message stays buffered for replay after
    /// the next reconnect.
    ///
    /// Control messages (ping) bypass sequencing and the buffer entirely.
    ///
    /// 向对端写入一条消息。
    ///
    /// 有序消息会被编码、分配下一个序列号、缓冲至被确认为止，并在当前接收器
    /// 上传输。当缓冲区达到字节上限时调用被挂起，待确认释放足够空间后恢复
    /// （写入者间FIFO）。接收器故障不会上抛：消息保持缓冲，等待下次重连后重放。
    ///
    /// 控制消息（ping）完全绕过序列号与缓冲。
    pub async fn write(&self, message: &Message) -> Result<()> {
        if !message.is_sequenced() {
            return self.write_unbuffered(message).await;
        }

        let mut frame = BytesMut::new();
        self.codec.write_message(message, &mut frame)?;
        let frame = frame.freeze();

        self.gate.acquire(frame.len()).await?;
        {
            // No await point between id assignment and append: a cancelled
            // caller either never sequenced its message or left it durably
            // buffered.
            let mut shared = self.lock_shared();
            if shared.disposed {
                return Err(Error::Disposed);
            }
            shared.sent_sequence_id += 1;
            let sequence_id = shared.sent_sequence_id;
            shared.store.push(SequencedMessage {
                sequence_id,
                payload: frame,
            });
        }
        self.flush_transmit().await;
        Ok(())
    }

    /// Writes every buffered-but-untransmitted entry to the current sink,
    /// in ascending sequence order. Entries acked while waiting are skipped.
    async fn flush_transmit(&self) {
        let mut output = self.output.lock().await;
        loop {
            let next = {
                let shared = self.lock_shared();
                if shared.disposed {
                    return;
                }
                shared.store.next_after(shared.transmitted_up_to)
            };
            let Some(entry) = next else {
                return;
            };
            let Some(sink) = output.sink.clone() else {
                // No live sink; the entry stays buffered for replay.
                return;
            };
            match sink.send(entry.payload.clone()).await {
                Ok(()) => {
                    let mut shared = self.lock_shared();
                    if shared.transmitted_up_to < entry.sequence_id {
                        shared.transmitted_up_to = entry.sequence_id;
                    }
                }
                Err(e) => {
                    debug!(
                        sequence_id = entry.sequence_id,
                        "Output sink failed, keeping messages buffered for replay: {}", e
                    );
                    output.sink = None;
                    return;
                }
            }
        }
    }

    async fn write_unbuffered(&self, message: &Message) -> Result<()> {
        if self.lock_shared().disposed {
            return Err(Error::Disposed);
        }
        let mut frame = BytesMut::new();
        self.codec.write_message(message, &mut frame)?;

        let mut output = self.output.lock().await;
        let Some(sink) = output.sink.clone() else {
            // Between connections; unsequenced messages are not replayed.
            return Ok(());
        };
        if let Err(e) = sink.send(frame.freeze()).await {
            debug!(kind = %message.kind(), "Dropping unsequenced message, sink failed: {}", e);
            output.sink = None;
        }
        Ok(())
    }

    /// Processes an acknowledgement from the peer: evicts every buffered
    /// entry with `sequence_id <= acked`, then releases suspended writers
    /// in FIFO order if the buffer fell under its limit.
    ///
    /// Idempotent; an ack beyond anything we ever sent is logged and
    /// treated as acknowledging everything. Safe to call concurrently with
    /// [`MessageBuffer::write`] and [`MessageBuffer::resend`].
    ///
    /// 处理来自对端的确认：逐出所有 `sequence_id <= acked` 的缓冲条目，
    /// 若缓冲区降到限制以下则按FIFO顺序释放被挂起的写入者。
    ///
    /// 幂等；超出我们已发送范围的确认会被记录并视为确认全部。
    /// 可与 [`MessageBuffer::write`] 和 [`MessageBuffer::resend`] 并发调用。
    pub fn ack(&self, sequence_id: u64) {
        let freed = {
            let mut shared = self.lock_shared();
            if shared.disposed {
                return;
            }
            if sequence_id > shared.sent_sequence_id {
                warn!(
                    acked = sequence_id,
                    sent = shared.sent_sequence_id,
                    "Peer acked beyond anything sent, treating as full acknowledgement"
                );
            }
            shared.store.ack(sequence_id)
        };
        if freed > 0 {
            self.gate.release(freed);
        }
    }

    /// Receive-side validation and deduplication.
    ///
    /// Returns `Ok(true)` when the incoming message should be handed to the
    /// application layer, `Ok(false)` when it is a duplicate of an already
    /// processed sequence id (idempotence under redelivery). A `Sequence`
    /// announcement that leaves a gap beyond what we have received is a
    /// protocol violation and fails with [`Error::SequenceGap`]; the caller
    /// is expected to tear the connection down.
    ///
    /// Pings and acks always pass and never count against sequencing.
    ///
    /// 接收侧的校验与去重。
    ///
    /// 当消息应交给应用层时返回 `Ok(true)`；当它是已处理序列号的重复时返回
    /// `Ok(false)`（重投递下的幂等性）。若 `Sequence` 宣告在我们已接收的范围
    /// 之外留下间隙，则属协议违规，以 [`Error::SequenceGap`] 失败；
    /// 调用者应随即关闭连接。
    ///
    /// Ping和Ack总是通过，且从不计入序列号。
    pub fn should_process_message(&self, message: &Message) -> Result<bool> {
        let mut shared = self.lock_shared();
        if shared.disposed {
            return Err(Error::Disposed);
        }

        if shared.waiting_for_sequence {
            return match message {
                Message::Sequence { sequence_id } => {
                    Self::reset_sequence(&mut shared, *sequence_id)?;
                    shared.waiting_for_sequence = false;
                    Ok(true)
                }
                // Keepalives and acks are never sequenced and stay valid
                // across the reconnect.
                Message::Ack { .. } | Message::Ping => Ok(true),
                // Sequenced leftovers from the broken connection.
                _ => Ok(false),
            };
        }

        match message {
            Message::Sequence { sequence_id } => {
                Self::reset_sequence(&mut shared, *sequence_id)?;
                Ok(true)
            }
            Message::Ack { .. } | Message::Ping => Ok(true),
            Message::Application(_) => {
                shared.current_receiving_id += 1;
                if shared.current_receiving_id <= shared.latest_received_id {
                    debug!(
                        sequence_id = shared.current_receiving_id,
                        "Skipping duplicate of an already processed message"
                    );
                    return Ok(false);
                }
                shared.latest_received_id = shared.current_receiving_id;
                Ok(true)
            }
        }
    }

    /// Rewinds the receive cursor to the peer's announced resend start.
    fn reset_sequence(shared: &mut Shared, announced: u64) -> Result<()> {
        let expected = shared.current_receiving_id + 1;
        if announced > expected {
            return Err(Error::SequenceGap {
                expected,
                received: announced,
            });
        }
        shared.current_receiving_id = announced.saturating_sub(1);
        Ok(())
    }

    /// Replays the unacknowledged suffix onto a freshly attached sink.
    ///
    /// Emits one `Sequence` message announcing the id of the first entry
    /// about to be replayed, then every buffered entry in ascending order.
    /// Entries acked while the replay suspends on transport flow control
    /// are skipped if not yet written; entries already written are not
    /// retracted (at-least-once). Messages written concurrently are queued
    /// strictly after the replay. A receive-side ack that became due during
    /// the replay is merged onto its tail.
    ///
    /// 将未确认的后缀重放到新挂接的接收器上。
    ///
    /// 先发出一条 `Sequence` 消息，宣告即将重放的第一个条目的序列号，
    /// 随后按升序重放每个缓冲条目。在重放因传输流控挂起期间被确认且尚未写出
    /// 的条目会被跳过；已写出的条目不会被撤回（至少一次）。并发写入的消息
    /// 严格排在重放之后。重放期间到期的接收侧确认会被并入其尾部。
    pub async fn resend(&self, new_sink: Arc<dyn MessageSink>) -> Result<()> {
        // Holding the output lock for the whole replay keeps concurrent
        // writers and the ack scheduler queued behind it.
        let mut output = self.output.lock().await;

        let announce = {
            let mut shared = self.lock_shared();
            if shared.disposed {
                return Err(Error::Disposed);
            }
            shared.waiting_for_sequence = true;
            shared.transmitted_up_to = shared
                .store
                .first_sequence_id()
                .map_or(shared.sent_sequence_id, |first| first - 1);
            info!(
                announce = shared.transmitted_up_to + 1,
                buffered = shared.store.len(),
                "Replaying buffered messages onto a new sink"
            );
            shared.transmitted_up_to + 1
        };
        output.sink = Some(new_sink.clone());

        let mut frame = BytesMut::new();
        self.codec
            .write_message(&Message::Sequence { sequence_id: announce }, &mut frame)?;
        if let Err(e) = new_sink.send(frame.freeze()).await {
            output.sink = None;
            return Err(e);
        }

        loop {
            let next = {
                let shared = self.lock_shared();
                if shared.disposed {
                    return Err(Error::Disposed);
                }
                shared.store.next_after(shared.transmitted_up_to)
            };
            let Some(entry) = next else {
                break;
            };
            if let Err(e) = new_sink.send(entry.payload.clone()).await {
                output.sink = None;
                return Err(e);
            }
            let mut shared = self.lock_shared();
            if shared.transmitted_up_to < entry.sequence_id {
                shared.transmitted_up_to = entry.sequence_id;
            }
        }

        // An ack deferred by this replay goes out before the lock is
        // released, so the peer learns our receive progress immediately.
        self.send_due_ack(&mut output).await?;
        Ok(())
    }

    /// Emits an `Ack` reporting receive progress, if any progress is
    /// unreported. Called by the ack scheduler; queues behind an
    /// in-progress resend on the output lock.
    ///
    /// 若存在未报告的接收进度则发出一条 `Ack`。由确认调度器调用；
    /// 在输出锁上排队于进行中的重发之后。
    pub async fn send_pending_ack(&self) -> Result<()> {
        {
            let shared = self.lock_shared();
            if shared.disposed {
                return Err(Error::Disposed);
            }
            if shared.latest_received_id == shared.last_acked_receive_id {
                return Ok(());
            }
        }
        let mut output = self.output.lock().await;
        self.send_due_ack(&mut output).await
    }

    /// Writes the due ack, if still due once the output lock is held. A
    /// resend may already have merged it.
    async fn send_due_ack(&self, output: &mut OutputSlot) -> Result<()> {
        let due = {
            let shared = self.lock_shared();
            (shared.latest_received_id > shared.last_acked_receive_id)
                .then_some(shared.latest_received_id)
        };
        let Some(sequence_id) = due else {
            return Ok(());
        };
        let Some(sink) = output.sink.clone() else {
            return Ok(());
        };
        let mut frame = BytesMut::new();
        self.codec
            .write_message(&Message::Ack { sequence_id }, &mut frame)?;
        match sink.send(frame.freeze()).await {
            Ok(()) => {
                let mut shared = self.lock_shared();
                if shared.last_acked_receive_id < sequence_id {
                    shared.last_acked_receive_id = sequence_id;
                }
            }
            Err(e) => {
                debug!("Output sink failed while sending ack: {}", e);
                output.sink = None;
            }
        }
        Ok(())
    }

    /// Disposes the buffer. Idempotent. Every writer suspended on the
    /// backpressure gate, and every future operation, observes
    /// [`Error::Disposed`].
    ///
    /// 释放缓冲区。幂等。所有挂起在背压闸门上的写入者以及后续操作都会
    /// 观察到 [`Error::Disposed`]。
    pub fn dispose(&self) {
        {
            let mut shared = self.lock_shared();
            if shared.disposed {
                return;
            }
            shared.disposed = true;
        }
        self.gate.close();
        debug!("Message buffer disposed");
    }

    /// Total payload bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.lock_shared().store.buffered_bytes()
    }

    /// Number of buffered (unacknowledged) messages.
    pub fn buffered_len(&self) -> usize {
        self.lock_shared().store.len()
    }

    /// Last sequence id assigned to an outgoing message.
    pub fn sent_sequence_id(&self) -> u64 {
        self.lock_shared().sent_sequence_id
    }

    /// Highest sequence id processed from the peer.
    pub fn latest_received_sequence_id(&self) -> u64 {
        self.lock_shared().latest_received_id
    }

    /// Whether [`MessageBuffer::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.lock_shared().disposed
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.lock_shared();
        f.debug_struct("MessageBuffer")
            .field("buffered", &shared.store.len())
            .field("buffered_bytes", &shared.store.buffered_bytes())
            .field("sent_sequence_id", &shared.sent_sequence_id)
            .field("latest_received_id", &shared.latest_received_id)
            .field("disposed", &shared.disposed)
            .finish()
    }
}
