use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

use crate::association::RtxTimerId;

/// RFC 6298-style RTO bounds and smoothing factors, in milliseconds.
pub(crate) const RTO_INITIAL: u64 = 3000;
pub(crate) const RTO_MIN: u64 = 1000;
pub(crate) const RTO_MAX: u64 = 60000;
pub(crate) const RTO_ALPHA: f64 = 1.0 / 8.0;
pub(crate) const RTO_BETA: f64 = 1.0 / 4.0;

/// Max.Init.Retransmits (RFC 4960 Sec 15).
pub(crate) const MAX_INIT_RETRANS: usize = 8;
/// Path.Max.Retrans (RFC 4960 Sec 15).
pub(crate) const PATH_MAX_RETRANS: usize = 5;
/// Retransmit forever.
pub(crate) const NO_MAX_RETRANS: usize = 0;

/// rtoManager manages Rtx timeout values.
///
/// This is an implementation of RFC 4960 sec 6.3.1.
#[derive(Default, Debug)]
pub(crate) struct RtoManager {
    pub(crate) srtt: u64,
    pub(crate) rttvar: f64,
    pub(crate) rto: u64,
    pub(crate) no_update: bool,
}

impl RtoManager {
    pub(crate) fn new() -> Self {
        RtoManager {
            rto: RTO_INITIAL,
            ..Default::default()
        }
    }

    /// Folds a fresh RTT measurement into SRTT/RTTVAR and recomputes the
    /// RTO. Returns the resulting SRTT.
    pub(crate) fn set_new_rtt(&mut self, rtt: u64) -> u64 {
        if self.no_update {
            return self.srtt;
        }

        if self.srtt == 0 {
            // First measurement: SRTT <- R, RTTVAR <- R/2
            self.srtt = rtt;
            self.rttvar = rtt as f64 / 2.0;
        } else {
            // RTTVAR <- (1 - beta) * RTTVAR + beta * |SRTT - R'|
            // SRTT <- (1 - alpha) * SRTT + alpha * R'
            self.rttvar =
                (1.0 - RTO_BETA) * self.rttvar + RTO_BETA * (self.srtt as f64 - rtt as f64).abs();
            self.srtt = ((1.0 - RTO_ALPHA) * self.srtt as f64 + RTO_ALPHA * rtt as f64) as u64;
        }

        // RTO <- SRTT + 4 * RTTVAR, clamped to [RTO.Min, RTO.Max]
        self.rto = ((self.srtt as f64 + 4.0 * self.rttvar) as u64).clamp(RTO_MIN, RTO_MAX);

        self.srtt
    }

    pub(crate) fn get_rto(&self) -> u64 {
        self.rto
    }

    pub(crate) fn reset(&mut self) {
        if self.no_update {
            return;
        }
        self.srtt = 0;
        self.rttvar = 0.0;
        self.rto = RTO_INITIAL;
    }
}

/// The RTO doubles with each expiry, capped at RTO.Max.
pub(crate) fn calculate_next_timeout(rto: u64, n_rtos: usize) -> u64 {
    if n_rtos < 31 {
        std::cmp::min(rto << n_rtos, RTO_MAX)
    } else {
        RTO_MAX
    }
}

/// Receives retransmission events from an [`RtxTimer`]. Implemented by the
/// association engine; the timer re-enters the association lock through
/// the shared mutex.
#[async_trait]
pub(crate) trait RtxTimerObserver {
    async fn on_retransmission_timeout(&mut self, timer_id: RtxTimerId, n_rtos: usize);
    async fn on_retransmission_failure(&mut self, timer_id: RtxTimerId);
}

/// rtxTimer provides the retransmission timer described in
/// RFC 4960 sec 6.3.1.
///
/// A started timer fires `on_retransmission_timeout` after `rto`, doubling
/// the interval every expiry; once `max_retrans` expiries have fired (and
/// `max_retrans` is non-zero), a single `on_retransmission_failure`
/// follows and the timer stops itself.
#[derive(Debug)]
pub(crate) struct RtxTimer<T: 'static + RtxTimerObserver + Send> {
    pub(crate) timeout_observer: Weak<Mutex<T>>,
    pub(crate) id: RtxTimerId,
    pub(crate) max_retrans: usize,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl<T: 'static + RtxTimerObserver + Send> RtxTimer<T> {
    pub(crate) fn new(timeout_observer: Weak<Mutex<T>>, id: RtxTimerId, max_retrans: usize) -> Self {
        RtxTimer {
            timeout_observer,
            id,
            max_retrans,
            close_tx: Mutex::new(None),
        }
    }

    /// Starts the timer with the given RTO. A timer that is already
    /// running ignores the call and reports `false`.
    pub(crate) async fn start(&self, rto: u64) -> bool {
        let mut close_tx = self.close_tx.lock().await;
        if close_tx.is_some() {
            return false;
        }

        let (tx, mut close_rx) = mpsc::channel(1);
        let observer = self.timeout_observer.clone();
        let id = self.id;
        let max_retrans = self.max_retrans;

        tokio::spawn(async move {
            let mut n_rtos = 0;

            loop {
                let interval = calculate_next_timeout(rto, n_rtos);
                let timer = sleep(Duration::from_millis(interval));
                tokio::pin!(timer);

                tokio::select! {
                    _ = timer.as_mut() => {
                        n_rtos += 1;

                        let failure = max_retrans > 0 && n_rtos > max_retrans;
                        if let Some(observer) = observer.upgrade() {
                            let mut observer = observer.lock().await;
                            if failure {
                                observer.on_retransmission_failure(id).await;
                            } else {
                                observer.on_retransmission_timeout(id, n_rtos).await;
                            }
                        } else {
                            break;
                        }
                        if failure {
                            // Consume the stop signal so is_running turns
                            // false without racing a later start.
                            close_rx.close();
                            break;
                        }
                    }
                    _ = close_rx.recv() => break,
                }
            }
        });

        *close_tx = Some(tx);
        true
    }

    /// Stops the timer. Safe to call on a timer that is not running.
    pub(crate) async fn stop(&self) {
        self.close_tx.lock().await.take();
    }

    /// Tests if the timer is running. Debug purpose only.
    pub(crate) async fn is_running(&self) -> bool {
        let close_tx = self.close_tx.lock().await;
        match &*close_tx {
            Some(tx) => !tx.is_closed(),
            None => false,
        }
    }
}
