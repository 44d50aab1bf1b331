//! 定义了库中所有可能的错误类型。
//! Defines all possible error types in the library.

use thiserror::Error;

/// The primary error type for the resumable session library.
/// 可恢复会话库的主要错误类型。
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying I/O error occurred.
    /// 发生了底层的I/O错误。
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer announced a resend starting point beyond what we have
    /// received. The gap cannot be bridged and the connection must be
    /// torn down.
    ///
    /// 对端宣告的重发起点超出了我们已接收的范围。该间隙无法弥合，连接必须被关闭。
    #[error("sequence message ID {received} is greater than the expected ID {expected}")]
    SequenceGap {
        /// The highest id the buffer would have accepted.
        expected: u64,
        /// The id the peer announced.
        received: u64,
    },

    /// The buffer has been disposed; pending and future operations fail.
    /// 缓冲区已被释放；挂起的和后续的操作都会失败。
    #[error("Message buffer has been disposed")]
    Disposed,

    /// The current output sink is closed or broken.
    /// 当前输出接收器已关闭或损坏。
    #[error("Output sink is closed")]
    SinkClosed,

    /// A received byte sequence could not be decoded into a message.
    /// 接收到的字节序列无法解码为消息。
    #[error("Malformed message received")]
    MalformedMessage,

    /// A message is too large to encode into a single frame.
    /// 消息过大，无法编码为单个帧。
    #[error("Message is too large to encode into a frame")]
    MessageTooLarge,
}

/// A specialized `Result` type for this library.
/// 本库专用的 `Result` 类型。
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        use std::io::ErrorKind;
        match err {
            Error::Io(e) => e,
            Error::SequenceGap { .. } => ErrorKind::InvalidData.into(),
            Error::Disposed => ErrorKind::BrokenPipe.into(),
            Error::SinkClosed => ErrorKind::ConnectionAborted.into(),
            Error::MalformedMessage => ErrorKind::InvalidData.into(),
            Error::MessageTooLarge => ErrorKind::InvalidInput.into(),
        }
    }
}
