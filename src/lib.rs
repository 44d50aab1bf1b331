#![deny(clippy::expect_used, clippy::unwrap_used)]

//! The root of the resumable session protocol library.
//! 可恢复会话协议库的根。

pub mod config;
pub mod error;
pub mod message;
pub mod sink;

pub mod ack;
pub mod buffer;
pub mod session;

pub mod testing;
