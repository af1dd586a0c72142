use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

/// Owner side of a cancellation token shared by background tasks.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Wakes every task waiting on a signal. Repeated calls are no-ops.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Cloneable, awaitable view of a [`Shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is triggered or its owner is dropped.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Fixed-period ticker that stops on shutdown.
///
/// Missed ticks are delayed rather than bursted, so a slow sweep never triggers a
/// backlog of immediate follow-ups.
pub struct Ticker {
    interval: Interval,
    signal: ShutdownSignal,
}

impl Ticker {
    pub fn new(period: Duration, signal: ShutdownSignal) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, signal }
    }

    /// Waits for the next tick. Returns `false` once shutdown was triggered.
    pub async fn tick(&mut self) -> bool {
        if self.signal.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = self.interval.tick() => !self.signal.is_cancelled(),
            _ = self.signal.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });
        shutdown.trigger();
        shutdown.trigger();
        waiter.await.unwrap();
        assert!(shutdown.is_triggered());
        assert!(shutdown.signal().is_cancelled());
    }

    #[tokio::test]
    async fn test_ticker_stops_after_shutdown() {
        tokio::time::pause();
        let shutdown = Shutdown::new();
        let mut ticker = Ticker::new(Duration::from_secs(1), shutdown.signal());

        // First tick completes immediately, then once per period
        assert!(ticker.tick().await);
        assert!(ticker.tick().await);

        shutdown.trigger();
        assert!(!ticker.tick().await);
    }

    #[tokio::test]
    async fn test_dropped_owner_cancels() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
    }
}
