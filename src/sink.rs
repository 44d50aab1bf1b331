//! Traits for abstracting over the transport output sink.
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// An asynchronous, flow-controlled output sink.
///
/// This is the buffer's only view of the transport: a write that may
/// suspend while the transport is saturated, and that fails once the
/// transport is gone. The active sink is swapped wholesale on reconnect.
///
/// 异步的、受流控的输出接收器。
///
/// 这是缓冲区对传输层的唯一视图：当传输饱和时写入可能被挂起，传输消失后写入失败。
/// 重连时活动的接收器会被整体替换。
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Writes one encoded frame to the transport. Suspends under transport
    /// flow control and returns `Error::SinkClosed` (or `Error::Io`) once
    /// the transport is permanently gone.
    async fn send(&self, frame: Bytes) -> Result<()>;
}

/// Adapts any duplex byte stream's write half into a [`MessageSink`].
///
/// 将任意双工字节流的写端适配为 [`MessageSink`]。
#[derive(Debug)]
pub struct StreamSink<W> {
    writer: tokio::sync::Mutex<W>,
}

impl<W> StreamSink<W> {
    /// Creates a new `StreamSink` over the given writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W> MessageSink for StreamSink<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&self, frame: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }
}
