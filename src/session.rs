//! The connection-facing session surface.
//!
//! Ties the message buffer, the ack scheduler, and the wire codec together
//! into the object a connection driver holds: application writes go down
//! through it, transport bytes come up through it, and a reconnect swaps
//! the sink underneath it.
//!
//! 面向连接的会话外层。
//!
//! 将消息缓冲区、确认调度器和线上编解码器组合成连接驱动所持有的对象：
//! 应用写入经由它下行，传输字节经由它上行，重连则在其下方替换接收器。

use crate::ack::AckScheduler;
use crate::buffer::MessageBuffer;
use crate::config::Config;
use crate::error::Result;
use crate::message::{Message, MessageCodec};
use crate::sink::MessageSink;
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// A resumable session over one logical connection.
///
/// 单个逻辑连接上的可恢复会话。
pub struct Session {
    buffer: Arc<MessageBuffer>,
    scheduler: AckScheduler,
    codec: Arc<dyn MessageCodec>,
    recv_buf: Mutex<BytesMut>,
    session_id: u32,
}

impl Session {
    /// Establishes a session writing to `sink` through `codec`, and spawns
    /// its ack scheduler.
    ///
    /// 建立一个经 `codec` 写入 `sink` 的会话，并派生其确认调度器。
    pub fn new(
        sink: Arc<dyn MessageSink>,
        codec: Arc<dyn MessageCodec>,
        config: Config,
    ) -> Self {
        let session_id = rand::random::<u32>();
        let buffer = Arc::new(MessageBuffer::new(sink, codec.clone(), &config));
        let scheduler = AckScheduler::spawn(buffer.clone(), config.ack_rate);
        info!(session_id, "Session established");
        Self {
            buffer,
            scheduler,
            codec,
            recv_buf: Mutex::new(BytesMut::new()),
            session_id,
        }
    }

    fn lock_recv(&self) -> MutexGuard<'_, BytesMut> {
        self.recv_buf.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Writes one application payload to the peer. Suspends under
    /// backpressure; see [`MessageBuffer::write`].
    pub async fn write(&self, payload: Bytes) -> Result<()> {
        self.buffer.write(&Message::Application(payload)).await
    }

    /// Sends an unsequenced keepalive probe.
    pub async fn ping(&self) -> Result<()> {
        self.buffer.write(&Message::Ping).await
    }

    /// Feeds bytes read from the transport into the session.
    ///
    /// Parses every complete frame, routes acknowledgements into buffer
    /// pruning and sequence announcements into receive-side bookkeeping,
    /// drops duplicates, and returns the application payloads that should
    /// be processed, in arrival order. A sequence gap is fatal and must
    /// tear the connection down.
    ///
    /// 将从传输层读到的字节喂入会话。
    ///
    /// 解析每个完整的帧，将确认路由到缓冲区修剪、将序列宣告路由到接收侧
    /// 簿记，丢弃重复消息，并按到达顺序返回应被处理的应用载荷。
    /// 序列间隙是致命的，必须随即关闭连接。
    pub fn receive(&self, data: &[u8]) -> Result<Vec<Bytes>> {
        let mut recv = self.lock_recv();
        recv.extend_from_slice(data);

        let mut delivered = Vec::new();
        while let Some(message) = self.codec.try_parse_message(&mut recv)? {
            if !self.buffer.should_process_message(&message)? {
                continue;
            }
            match message {
                Message::Ack { sequence_id } => self.buffer.ack(sequence_id),
                Message::Sequence { .. } => {
                    // Bookkeeping already applied by should_process_message.
                }
                Message::Ping => {
                    debug!(session_id = self.session_id, "Keepalive received");
                }
                Message::Application(payload) => delivered.push(payload),
            }
        }
        Ok(delivered)
    }

    /// Re-attaches the session to a freshly established transport and
    /// replays everything the peer has not acknowledged.
    ///
    /// 将会话重新挂接到新建立的传输上，并重放对端尚未确认的全部内容。
    pub async fn reconnect(&self, new_sink: Arc<dyn MessageSink>) -> Result<()> {
        info!(
            session_id = self.session_id,
            buffered = self.buffer.buffered_len(),
            "Reconnecting session"
        );
        self.buffer.resend(new_sink).await
    }

    /// Tears the session down permanently: stops the ack scheduler and
    /// disposes the buffer, releasing every suspended writer. Idempotent.
    ///
    /// 永久关闭会话：停止确认调度器并释放缓冲区，释放所有被挂起的写入者。
    /// 幂等。
    pub fn close(&self) {
        self.scheduler.stop();
        self.buffer.dispose();
        info!(session_id = self.session_id, "Session closed");
    }

    /// The underlying message buffer.
    pub fn buffer(&self) -> &Arc<MessageBuffer> {
        &self.buffer
    }

    /// Random identifier used to correlate this session's log records.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
