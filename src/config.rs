//! 定义了会话和缓冲区的可配置参数。
//! Defines configurable parameters for sessions and buffers.

use std::time::Duration;

/// A structure containing all configurable parameters for a session.
///
/// 包含所有会话可配置参数的结构体。
#[derive(Debug, Clone)]
pub struct Config {
    /// The maximum number of payload bytes the buffer may hold for
    /// unacknowledged messages. Writers suspend while the buffer is at or
    /// above this limit; data is never dropped to stay under it.
    ///
    /// 缓冲区可为未确认消息保留的最大载荷字节数。当缓冲区达到或超过此限制时，
    /// 写入者会被挂起；绝不会为了保持在限制以下而丢弃数据。
    pub buffer_limit_bytes: usize,

    /// The interval at which the ack scheduler reports receive progress to
    /// the peer.
    /// ack调度器向对端报告接收进度的间隔。
    pub ack_rate: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_limit_bytes: 100_000,
            ack_rate: Duration::from_secs(1),
        }
    }
}
