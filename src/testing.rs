//! Test support utilities: an in-memory mock transport sink.
//!
//! 测试辅助工具：内存中的模拟传输接收器。

use crate::error::{Error, Result};
use crate::message::{LengthPrefixedCodec, Message, MessageCodec};
use crate::sink::MessageSink;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct SinkState {
    frames: Vec<Bytes>,
    pending_bytes: usize,
    capacity: Option<usize>,
    closed: bool,
}

/// A mock transport sink that records every frame written to it.
///
/// An optional byte capacity simulates transport flow control: once the
/// undrained bytes reach the capacity, `send` suspends until [`MockSink::drain`]
/// is called, exactly like a saturated duplex pipe. [`MockSink::close`]
/// simulates the transport going away.
///
/// 记录所有写入帧的模拟传输接收器。
///
/// 可选的字节容量模拟传输流控：一旦未排空的字节达到容量，`send` 会挂起，
/// 直到调用 [`MockSink::drain`]，就像一个饱和的双工管道。
/// [`MockSink::close`] 模拟传输消失。
#[derive(Debug, Default)]
pub struct MockSink {
    state: Mutex<SinkState>,
    drained: Notify,
}

impl MockSink {
    /// A sink with unlimited capacity: writes never suspend.
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink that applies flow control after `capacity` undrained bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SinkState {
                capacity: Some(capacity),
                ..SinkState::default()
            }),
            drained: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes every recorded frame off the "wire", freeing flow-control
    /// capacity and waking suspended writers.
    ///
    /// 从“线路”上取走所有已记录的帧，释放流控容量并唤醒被挂起的写入者。
    pub fn drain(&self) -> Vec<Bytes> {
        let frames = {
            let mut state = self.lock();
            state.pending_bytes = 0;
            std::mem::take(&mut state.frames)
        };
        self.drained.notify_waiters();
        frames
    }

    /// Simulates the transport breaking: every pending and future `send`
    /// fails with [`Error::SinkClosed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.drained.notify_waiters();
    }

    /// A copy of the recorded frames, without draining.
    pub fn frames(&self) -> Vec<Bytes> {
        self.lock().frames.clone()
    }

    /// Number of frames recorded and not yet drained.
    pub fn frame_count(&self) -> usize {
        self.lock().frames.len()
    }

    /// Decodes the recorded (undrained) frames with the default codec.
    pub fn decoded(&self) -> Result<Vec<Message>> {
        decode_frames(&self.frames())
    }
}

#[async_trait]
impl MessageSink for MockSink {
    async fn send(&self, frame: Bytes) -> Result<()> {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(Error::SinkClosed);
                }
                let fits = state
                    .capacity
                    .is_none_or(|cap| state.pending_bytes + frame.len() <= cap)
                    || state.pending_bytes == 0;
                if fits {
                    state.pending_bytes += frame.len();
                    state.frames.push(frame);
                    return Ok(());
                }
            }
            drained.await;
        }
    }
}

/// Decodes a slice of recorded frames with the default codec.
/// 使用默认编解码器解码一组已记录的帧。
pub fn decode_frames(frames: &[Bytes]) -> Result<Vec<Message>> {
    let codec = LengthPrefixedCodec;
    let mut buf = BytesMut::new();
    for frame in frames {
        buf.extend_from_slice(frame);
    }
    let mut messages = Vec::new();
    while let Some(message) = codec.try_parse_message(&mut buf)? {
        messages.push(message);
    }
    if !buf.is_empty() {
        return Err(Error::MalformedMessage);
    }
    Ok(messages)
}
