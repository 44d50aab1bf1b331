//! 定义了协议消息及其线上编解码。
//! Defines the protocol messages and their wire codec.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;


/// The kind of a message. The first byte of every frame body.
/// 消息类型，每个帧体的第一个字节。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    /// An opaque application payload (invocation, stream item, completion...).
    /// 不透明的应用载荷（调用、流元素、完成……）。
    Application = 0x01,
    /// Acknowledgment of all sequence ids up to a given value.
    /// 对直到某个值的所有序列号的确认。
    Ack = 0x02,
    /// Announces the sequence id of the next message the sender will emit.
    /// 宣告发送方将要发出的下一条消息的序列号。
    Sequence = 0x03,
    /// Keep-alive probe. Bypasses sequencing entirely.
    /// 保活探测。完全绕过序列化计数。
    Ping = 0x04,
}

impl Kind {
    /// 从一个字节尝试转换成 `Kind`。
    /// Tries to convert a byte into a `Kind`.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Kind::Application),
            0x02 => Some(Kind::Ack),
            0x03 => Some(Kind::Sequence),
            0x04 => Some(Kind::Ping),
            _ => None,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Application => "APPLICATION",
            Kind::Ack => "ACK",
            Kind::Sequence => "SEQUENCE",
            Kind::Ping => "PING",
        };
        write!(f, "{}", s)
    }
}

/// A complete protocol message that can be sent or received.
/// 一个可以被发送或接收的完整协议消息。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// An application message. The payload is opaque to this layer.
    /// 应用消息。载荷对本层不透明。
    Application(Bytes),
    /// The peer has durably received every message with id ≤ `sequence_id`.
    /// 对端已持久地接收了所有序列号 ≤ `sequence_id` 的消息。
    Ack {
        sequence_id: u64,
    },
    /// The next sequenced message on this connection carries `sequence_id`.
    /// Sent at the start of a resend so the receiver can discard duplicates.
    ///
    /// 此连接上的下一条有序消息携带 `sequence_id`。
    /// 在重发开始时发送，以便接收方丢弃重复消息。
    Sequence {
        sequence_id: u64,
    },
    /// Keep-alive probe.
    /// 保活探测。
    Ping,
}

impl Message {
    /// Returns the wire kind of this message.
    pub fn kind(&self) -> Kind {
        match self {
            Message::Application(_) => Kind::Application,
            Message::Ack { .. } => Kind::Ack,
            Message::Sequence { .. } => Kind::Sequence,
            Message::Ping => Kind::Ping,
        }
    }

    /// Whether this message consumes a sequence id. Only application
    /// messages are sequenced; control messages never count.
    ///
    /// 此消息是否占用一个序列号。只有应用消息是有序的；控制消息从不计数。
    pub fn is_sequenced(&self) -> bool {
        matches!(self, Message::Application(_))
    }
}

/// The wire codec boundary. The buffer core depends only on this trait; the
/// concrete frame layout is replaceable.
///
/// 线上编解码边界。缓冲核心只依赖此trait；具体的帧布局是可替换的。
pub trait MessageCodec: Send + Sync + 'static {
    /// Serializes `message` and appends the complete frame to `dst`. Fails
    /// with [`Error::MessageTooLarge`] when the message cannot be encoded
    /// into a single frame; `dst` is left untouched in that case.
    ///
    /// 序列化 `message` 并将完整的帧追加到 `dst`。当消息无法编码为单个帧时
    /// 以 [`Error::MessageTooLarge`] 失败；此时 `dst` 保持不变。
    fn write_message(&self, message: &Message, dst: &mut BytesMut) -> Result<()>;

    /// Tries to parse one complete message from the front of `src`,
    /// consuming its bytes. Returns `Ok(None)` when `src` does not yet hold
    /// a complete frame.
    ///
    /// 尝试从 `src` 的前端解析出一条完整的消息并消耗其字节。
    /// 当 `src` 尚不包含完整的帧时返回 `Ok(None)`。
    fn try_parse_message(&self, src: &mut BytesMut) -> Result<Option<Message>>;
}

/// The size of the length prefix on the wire.
/// 长度前缀在网络传输中的大小。
const LENGTH_PREFIX_SIZE: usize = 4;

/// The length prefix covers the kind byte and the body, and must fit a u32.
/// 长度前缀覆盖类型字节和消息体，且必须能放入u32。
fn frame_length(body_len: usize) -> Result<u32> {
    u32::try_from(body_len).map_err(|_| Error::MessageTooLarge)
}

/// The default codec: `[u32 length][kind byte][body]`, big-endian. The
/// length covers the kind byte and the body.
///
/// 默认编解码器：`[u32 长度][类型字节][消息体]`，大端序。长度覆盖类型字节和消息体。
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixedCodec;

impl MessageCodec for LengthPrefixedCodec {
    fn write_message(&self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        match message {
            Message::Application(payload) => {
                dst.put_u32(frame_length(1 + payload.len())?);
                dst.put_u8(Kind::Application as u8);
                dst.put_slice(payload);
            }
            Message::Ack { sequence_id } => {
                dst.put_u32(1 + 8);
                dst.put_u8(Kind::Ack as u8);
                dst.put_u64(*sequence_id);
            }
            Message::Sequence { sequence_id } => {
                dst.put_u32(1 + 8);
                dst.put_u8(Kind::Sequence as u8);
                dst.put_u64(*sequence_id);
            }
            Message::Ping => {
                dst.put_u32(1);
                dst.put_u8(Kind::Ping as u8);
            }
        }
        Ok(())
    }

    fn try_parse_message(&self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len == 0 {
            return Err(Error::MalformedMessage);
        }
        if src.len() < LENGTH_PREFIX_SIZE + frame_len {
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_SIZE);
        let mut body = src.split_to(frame_len);
        let kind = Kind::from_u8(body.get_u8()).ok_or(Error::MalformedMessage)?;
        let message = match kind {
            Kind::Application => Message::Application(body.freeze()),
            Kind::Ack => {
                if body.len() != 8 {
                    return Err(Error::MalformedMessage);
                }
                Message::Ack {
                    sequence_id: body.get_u64(),
                }
            }
            Kind::Sequence => {
                if body.len() != 8 {
                    return Err(Error::MalformedMessage);
                }
                Message::Sequence {
                    sequence_id: body.get_u64(),
                }
            }
            Kind::Ping => {
                if !body.is_empty() {
                    return Err(Error::MalformedMessage);
                }
                Message::Ping
            }
        };
        Ok(Some(message))
    }
}
