//! SinkHandle - one outbound sink with its own bounded queue, worker task,
//! connection state and reconnect loop.
//!
//! The receive loop only ever calls [`SinkHandle::try_send`], which never
//! blocks: when the queue is full the newest item is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::sink::{ConnectionState, Outbound, Sink};
use crate::backoff::Backoff;
use crate::error::SinkError;

/// Per-sink counters
#[derive(Debug, Default)]
pub struct SinkStats {
    written: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`SinkStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStatsSnapshot {
    pub written: u64,
    pub dropped: u64,
    pub failed: u64,
    pub reconnects: u64,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running sink worker
pub struct SinkHandle {
    name: &'static str,
    tx: mpsc::Sender<Outbound>,
    state: watch::Receiver<ConnectionState>,
    stats: Arc<SinkStats>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl SinkHandle {
    /// Connect the sink and spawn its worker
    ///
    /// The initial connect happens here, before the worker exists, so a sink
    /// that cannot be reached at startup is reported to the caller instead of
    /// entering the reconnect loop.
    ///
    /// The worker runs under a child of `cancel`: cancelling `cancel` stops
    /// it, but a drain timeout in [`SinkHandle::shutdown`] only stops this
    /// sink.
    ///
    /// # Errors
    ///
    /// Returns the sink's connect error
    pub async fn connect(
        mut sink: Box<dyn Sink>,
        queue_capacity: usize,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Result<Self, SinkError> {
        let name = sink.name();
        let cancel = cancel.child_token();

        if let Err(e) = sink.connect().await {
            sink.close().await;
            return Err(e);
        }
        info!(sink = name, "Sink connected");

        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let stats = Arc::new(SinkStats::default());

        let worker = tokio::spawn(sink_worker(
            sink,
            rx,
            state_tx,
            Arc::clone(&stats),
            backoff,
            cancel.clone(),
        ));

        Ok(Self {
            name,
            tx,
            state: state_rx,
            stats,
            cancel,
            worker,
        })
    }

    /// Sink name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Current counters
    pub fn stats(&self) -> SinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue an item without waiting
    ///
    /// Returns true if queued, false if dropped.
    pub fn try_send(&self, item: Outbound) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(item)) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                // One line per 100 drops keeps an overloaded sink from flooding the log
                if dropped % 100 == 1 {
                    warn!(sink = self.name, kind = item.kind(), dropped, "Queue full, item dropped");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                error!(sink = self.name, "Sink worker closed unexpectedly");
                false
            }
        }
    }

    /// Stop accepting items, drain what is queued and close the sink
    ///
    /// A worker still busy after `drain_timeout` (typically waiting out a
    /// reconnect backoff) is cancelled and its remaining items are discarded.
    ///
    /// Returns the final counters.
    pub async fn shutdown(self, drain_timeout: Duration) -> SinkStatsSnapshot {
        let SinkHandle {
            name,
            tx,
            stats,
            cancel,
            mut worker,
            ..
        } = self;

        drop(tx);

        let result = match tokio::time::timeout(drain_timeout, &mut worker).await {
            Ok(result) => result,
            Err(_) => {
                warn!(sink = name, "Sink did not drain in time, cancelling");
                cancel.cancel();
                worker.await
            }
        };

        if let Err(e) = result {
            error!(sink = name, error = ?e, "Sink worker panicked");
        }
        debug!(sink = name, "SinkHandle shutdown complete");
        stats.snapshot()
    }
}

/// Worker task that drains the queue into the sink
async fn sink_worker(
    mut sink: Box<dyn Sink>,
    mut rx: mpsc::Receiver<Outbound>,
    state: watch::Sender<ConnectionState>,
    stats: Arc<SinkStats>,
    backoff: Backoff,
    cancel: CancellationToken,
) {
    let name = sink.name();
    debug!(sink = name, "Sink worker started");

    while let Some(item) = rx.recv().await {
        let connected = *state.borrow() == ConnectionState::Connected;
        if !connected {
            if !reconnect(sink.as_mut(), &state, &stats, backoff, &cancel).await {
                break;
            }
        }

        match sink.write(&item).await {
            Ok(()) => {
                stats.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(sink = name, kind = item.kind(), error = %e, "Write failed, item dropped");

                if e.is_connection() {
                    state.send_replace(ConnectionState::Disconnected);
                    if !reconnect(sink.as_mut(), &state, &stats, backoff, &cancel).await {
                        break;
                    }
                }
            }
        }
    }

    sink.close().await;
    state.send_replace(ConnectionState::Disconnected);
    debug!(sink = name, "Sink worker stopped");
}

/// Retry `connect` with backoff until it succeeds or `cancel` fires
///
/// Returns false if cancelled.
async fn reconnect(
    sink: &mut dyn Sink,
    state: &watch::Sender<ConnectionState>,
    stats: &SinkStats,
    backoff: Backoff,
    cancel: &CancellationToken,
) -> bool {
    let name = sink.name();
    let mut attempt: u32 = 0;

    loop {
        if !backoff.wait(attempt, cancel).await {
            debug!(sink = name, "Reconnect abandoned, shutting down");
            return false;
        }

        state.send_replace(ConnectionState::Connecting);
        stats.reconnects.fetch_add(1, Ordering::Relaxed);

        match sink.connect().await {
            Ok(()) => {
                state.send_replace(ConnectionState::Connected);
                info!(sink = name, attempts = attempt + 1, "Sink reconnected");
                return true;
            }
            Err(e) => {
                state.send_replace(ConnectionState::Disconnected);
                attempt = attempt.saturating_add(1);
                warn!(
                    sink = name,
                    error = %e,
                    next_retry_ms = backoff.delay(attempt).as_millis() as u64,
                    "Reconnect failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::sink::mocks::RecordingSink;
    use crate::publish::sink::MockSink;
    use bytes::Bytes;
    use tokio::time::{sleep, timeout};

    const DRAIN: Duration = Duration::from_secs(2);

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(5), Duration::from_millis(20))
    }

    fn raw(i: usize) -> Outbound {
        Outbound::Raw {
            topic: format!("thing/product/SN{}/osd", i),
            payload: Bytes::from(format!("{{\"n\":{}}}", i)),
        }
    }

    async fn wait_for_written(sink: &RecordingSink, count: usize) {
        timeout(Duration::from_secs(2), async {
            while sink.get_written().len() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("items were not written in time");
    }

    #[tokio::test]
    async fn test_items_written_in_order() {
        let sink = RecordingSink::new("raw");
        let handle = SinkHandle::connect(
            Box::new(sink.clone()),
            16,
            fast_backoff(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        for i in 0..5 {
            assert!(handle.try_send(raw(i)));
        }
        wait_for_written(&sink, 5).await;

        let written = sink.get_written();
        for (i, item) in written.iter().enumerate() {
            assert_eq!(item, &raw(i));
        }
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(handle.stats().written, 5);

        handle.shutdown(DRAIN).await;
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_initial_connect_failure_is_returned() {
        let sink = RecordingSink::new("raw");
        sink.fail_next_connect(SinkError::Connect {
            sink: "raw",
            message: "refused".to_string(),
        });

        let result = SinkHandle::connect(
            Box::new(sink.clone()),
            16,
            fast_backoff(),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(SinkError::Connect { .. })));
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn test_initial_connect_failure_with_mock() {
        let mut sink = MockSink::new();
        sink.expect_name().return_const("normalized");
        sink.expect_connect().times(1).returning(|| {
            Err(SinkError::Connect {
                sink: "normalized",
                message: "no route".to_string(),
            })
        });
        sink.expect_close().times(1).returning(|| ());
        sink.expect_write().never();

        let result =
            SinkHandle::connect(Box::new(sink), 4, fast_backoff(), CancellationToken::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let sink = RecordingSink::new("slow").with_write_delay(Duration::from_millis(200));
        let handle = SinkHandle::connect(
            Box::new(sink.clone()),
            2,
            fast_backoff(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let accepted = (0..20).filter(|&i| handle.try_send(raw(i))).count();

        // Worker holds at most one item in flight plus two queued
        assert!(accepted <= 3, "accepted {}", accepted);
        assert!(handle.stats().dropped >= 17);

        handle.shutdown(DRAIN).await;
        let written = sink.get_written();
        assert_eq!(written.len(), accepted);
        assert_eq!(written[0], raw(0));
    }

    #[tokio::test]
    async fn test_write_error_does_not_stop_worker() {
        let sink = RecordingSink::new("raw");
        sink.fail_next_write(SinkError::Write {
            sink: "raw",
            message: "payload rejected".to_string(),
        });

        let handle = SinkHandle::connect(
            Box::new(sink.clone()),
            16,
            fast_backoff(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        handle.try_send(raw(0));
        handle.try_send(raw(1));
        wait_for_written(&sink, 1).await;

        assert_eq!(sink.get_written(), vec![raw(1)]);
        let stats = handle.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.reconnects, 0);
        assert_eq!(handle.state(), ConnectionState::Connected);

        handle.shutdown(DRAIN).await;
    }

    #[tokio::test]
    async fn test_lost_connection_triggers_reconnect() {
        let sink = RecordingSink::new("raw");
        sink.fail_next_write(SinkError::Disconnected { sink: "raw" });

        let handle = SinkHandle::connect(
            Box::new(sink.clone()),
            16,
            fast_backoff(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        // First reconnect attempt fails, second succeeds
        sink.fail_next_connect(SinkError::Connect {
            sink: "raw",
            message: "still down".to_string(),
        });

        handle.try_send(raw(0));
        handle.try_send(raw(1));
        wait_for_written(&sink, 1).await;

        // raw(0) was lost with the connection, raw(1) went out after reconnect
        assert_eq!(sink.get_written(), vec![raw(1)]);
        let stats = handle.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.reconnects, 2);
        assert_eq!(handle.state(), ConnectionState::Connected);

        handle.shutdown(DRAIN).await;
    }

    #[tokio::test]
    async fn test_shutdown_aborts_reconnect() {
        let sink = RecordingSink::new("raw");
        let handle = SinkHandle::connect(
            Box::new(sink.clone()),
            16,
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        sink.fail_next_write(SinkError::Disconnected { sink: "raw" });
        handle.try_send(raw(0));

        let mut state = handle.subscribe_state();
        timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        timeout(Duration::from_secs(2), handle.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown must not wait for the backoff");
        assert!(sink.is_closed());
    }

    async fn disconnected_handle(sink: &RecordingSink, cancel: CancellationToken) -> SinkHandle {
        let handle = SinkHandle::connect(
            Box::new(sink.clone()),
            16,
            Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
            cancel,
        )
        .await
        .unwrap();

        sink.fail_next_write(SinkError::Disconnected { sink: "raw" });
        handle.try_send(raw(0));

        let mut state = handle.subscribe_state();
        timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        handle
    }

    #[tokio::test]
    async fn test_drain_timeout_leaves_caller_token_alone() {
        let sink = RecordingSink::new("raw");
        let bridge_cancel = CancellationToken::new();
        let handle = disconnected_handle(&sink, bridge_cancel.clone()).await;

        timeout(Duration::from_secs(2), handle.shutdown(Duration::from_millis(50)))
            .await
            .expect("shutdown must not wait for the backoff");

        assert!(sink.is_closed());
        assert!(!bridge_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_caller_cancel_stops_reconnect() {
        let sink = RecordingSink::new("raw");
        let bridge_cancel = CancellationToken::new();
        let handle = disconnected_handle(&sink, bridge_cancel.clone()).await;

        bridge_cancel.cancel();
        timeout(Duration::from_secs(2), handle.shutdown(Duration::from_secs(30)))
            .await
            .expect("cancelled worker must exit without the drain timeout");
        assert!(sink.is_closed());
    }
}
