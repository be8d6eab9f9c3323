use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Duration;

/// Delayed-ack interval (RFC 4960 Sec 6.2 recommends 200 ms).
pub(crate) const ACK_INTERVAL: Duration = Duration::from_millis(200);

/// Receives the delayed-ack expiry from an [`AckTimer`].
#[async_trait]
pub(crate) trait AckTimerObserver {
    async fn on_ack_timeout(&mut self);
}

/// One-shot timer driving delayed SACK emission.
#[derive(Default, Debug)]
pub(crate) struct AckTimer<T: 'static + AckTimerObserver + Send> {
    pub(crate) timeout_observer: Weak<Mutex<T>>,
    pub(crate) interval: Duration,
    pub(crate) close_tx: Option<mpsc::Sender<()>>,
}

impl<T: 'static + AckTimerObserver + Send> AckTimer<T> {
    pub(crate) fn new(timeout_observer: Weak<Mutex<T>>, interval: Duration) -> Self {
        AckTimer {
            timeout_observer,
            interval,
            close_tx: None,
        }
    }

    /// Starts the timer; a running timer ignores the call. A timer that
    /// already fired re-arms.
    pub(crate) fn start(&mut self) -> bool {
        if let Some(tx) = &self.close_tx {
            if !tx.is_closed() {
                return false;
            }
        }

        let (close_tx, mut close_rx) = mpsc::channel(1);
        let interval = self.interval;
        let timeout_observer = self.timeout_observer.clone();

        tokio::spawn(async move {
            let timer = tokio::time::sleep(interval);
            tokio::pin!(timer);

            tokio::select! {
                _ = timer.as_mut() => {
                    if let Some(observer) = timeout_observer.upgrade() {
                        let mut observer = observer.lock().await;
                        observer.on_ack_timeout().await;
                    }
                }
                _ = close_rx.recv() => {}
            }
        });

        self.close_tx = Some(close_tx);
        true
    }

    /// Stops the timer; a later `start` arms it again.
    pub(crate) fn stop(&mut self) {
        self.close_tx.take();
    }

    /// Tests if the timer is running. Debug purpose only.
    pub(crate) fn is_running(&self) -> bool {
        self.close_tx
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}
