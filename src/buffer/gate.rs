//! The backpressure gate that suspends writers while the buffer is full.
//!
//! Implemented as an explicit FIFO waiter queue: capacity freed by an
//! acknowledgement is handed directly to the oldest waiter, so a newly
//! arriving writer can never barge past one that is already suspended.
//! The handoff travels as a [`Grant`] guard; a waiter that is cancelled
//! after the handoff drops its grant unconsumed and the bytes come back.
//!
//! 当缓冲区满时挂起写入者的背压闸门。
//!
//! 实现为显式的FIFO等待队列：由确认释放的容量被直接交给最老的等待者，
//! 因此新到达的写入者永远无法插队到已被挂起的写入者之前。
//! 移交以 [`Grant`] 守卫的形式传递；在移交之后被取消的等待者会在未消费的
//! 情况下丢弃其授予，字节随之归还。

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

#[derive(Debug)]
struct Waiter {
    bytes: usize,
    tx: oneshot::Sender<Grant>,
}

#[derive(Debug, Default)]
struct GateState {
    in_use: usize,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

#[derive(Debug)]
struct Inner {
    limit: usize,
    state: Mutex<GateState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Capacity handed off to a queued waiter. Already accounted in `in_use`
/// when it is sent; dropping it unconsumed (the waiter cancelled, or the
/// grant never left the channel) returns the bytes to the gate.
///
/// 移交给排队等待者的容量。发送时已计入 `in_use`；在未消费的情况下被丢弃
/// （等待者已取消，或授予从未离开通道）会将字节归还给闸门。
#[derive(Debug)]
struct Grant {
    bytes: usize,
    inner: Arc<Inner>,
}

impl Grant {
    /// The admitted writer takes ownership of the bytes; a later `release`
    /// returns them.
    fn consume(mut self) {
        self.bytes = 0;
    }
}

impl Drop for Grant {
    fn drop(&mut self) {
        if self.bytes > 0 {
            release(&self.inner, self.bytes);
        }
    }
}

/// Returns `bytes` of capacity and wakes as many queued waiters as now
/// fit, oldest first.
fn release(inner: &Arc<Inner>, bytes: usize) {
    let mut state = inner.lock();
    state.in_use = state.in_use.saturating_sub(bytes);
    while state.in_use < inner.limit {
        let Some(waiter) = state.waiters.pop_front() else {
            break;
        };
        state.in_use += waiter.bytes;
        let grant = Grant {
            bytes: waiter.bytes,
            inner: inner.clone(),
        };
        if let Err(mut unclaimed) = waiter.tx.send(grant) {
            // The waiter is already gone. Reclaim here instead of through
            // the grant's drop, which would take this lock again.
            unclaimed.bytes = 0;
            state.in_use -= waiter.bytes;
        }
    }
}

/// A byte-counted admission gate with FIFO handoff.
/// 以字节计数、FIFO移交的准入闸门。
#[derive(Debug)]
pub(crate) struct CapacityGate {
    inner: Arc<Inner>,
}

impl CapacityGate {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                limit,
                state: Mutex::new(GateState::default()),
            }),
        }
    }

    /// Reserves `bytes` of buffer capacity, suspending while usage is at or
    /// above the limit. A single oversized reservation is admitted as long
    /// as the buffer is under the limit when its turn comes; the limit
    /// bounds admission, it never truncates.
    ///
    /// 预留 `bytes` 的缓冲容量，当使用量达到或超过限制时挂起。
    /// 只要轮到它时缓冲区低于限制，单个超大的预留也会被准入；
    /// 限制约束准入，绝不截断。
    pub(crate) async fn acquire(&self, bytes: usize) -> Result<()> {
        let rx = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(Error::Disposed);
            }
            if state.in_use < self.inner.limit && state.waiters.is_empty() {
                state.in_use += bytes;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { bytes, tx });
            rx
        };
        // Dropping this future while the grant sits in the channel drops
        // the grant, which returns the bytes to the gate.
        let grant = rx.await.map_err(|_| Error::Disposed)?;
        grant.consume();
        Ok(())
    }

    /// Returns `bytes` of capacity and wakes queued waiters, oldest first.
    /// A waiter that cancelled its wait has its grant reclaimed, whether it
    /// was still queued or already handed its grant.
    ///
    /// 归还 `bytes` 的容量，并按先来后到唤醒排队的等待者。
    /// 已取消等待的等待者的授予会被回收，无论它仍在排队还是已获得授予。
    pub(crate) fn release(&self, bytes: usize) {
        release(&self.inner, bytes);
    }

    /// Fails every pending and future `acquire` with `Error::Disposed`.
    /// 使所有挂起的和后续的 `acquire` 以 `Error::Disposed` 失败。
    pub(crate) fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        // Dropping the senders wakes the receivers with a channel error.
        state.waiters.clear();
    }

    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }
}
