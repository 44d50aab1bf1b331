//! The periodic acknowledgement scheduler.
//!
//! A background task that reports receive progress to the peer at a bounded
//! rate. Driven by `tokio::time`, so tests advance it with the paused clock
//! instead of wall-clock delays.
//!
//! 周期性确认调度器。
//!
//! 一个以受限速率向对端报告接收进度的后台任务。由 `tokio::time` 驱动，
//! 因此测试可以用暂停的时钟推进它，而无需真实的时间延迟。

use crate::buffer::MessageBuffer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Handle to the spawned ack timer task.
///
/// 已派生的确认计时任务的句柄。
#[derive(Debug)]
pub struct AckScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AckScheduler {
    /// Spawns the scheduler over `buffer`, emitting at most one ack per
    /// `rate`. Ticks with no receive progress write nothing; a tick that
    /// lands during a resend is deferred behind it on the output sink.
    ///
    /// 在 `buffer` 上派生调度器，每个 `rate` 周期最多发出一条确认。
    /// 没有接收进度的周期不写任何内容；落在重发期间的周期会在输出接收器
    /// 上被推迟到重发之后。
    pub fn spawn(buffer: Arc<MessageBuffer>, rate: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(rate);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of an interval fires immediately; with no
            // receive progress yet it writes nothing.
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = buffer.send_pending_ack().await {
                            debug!("Ack scheduler stopping: {}", e);
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        Self { shutdown, handle }
    }

    /// Stops the timer task. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for AckScheduler {
    fn drop(&mut self) {
        self.stop();
        self.handle.abort();
    }
}
