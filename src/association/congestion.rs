//! Congestion and flow control state (RFC 4960 Sec 6.2.1 and Sec 7),
//! factored out of the association engine so the window arithmetic can be
//! exercised on its own.

/// Tracks the sender-side windows: congestion window, slow-start
/// threshold, the peer's receive window, and the fast-recovery marker.
///
/// The controller only does arithmetic; deciding *when* an event happened
/// (cumulative ack advanced, third miss indication, T3-rtx expiry) is the
/// engine's job.
#[derive(Default, Debug)]
pub(crate) struct CongestionController {
    pub(crate) mtu: u32,
    pub(crate) cwnd: u32,
    pub(crate) ssthresh: u32,
    /// The peer's receive window, minus what is already in flight.
    pub(crate) rwnd: u32,
    pub(crate) partial_bytes_acked: u32,
    /// While `Some`, the sender is in fast recovery until an ack covers
    /// this TSN.
    pub(crate) fast_recovery_exit: Option<u32>,
}

impl CongestionController {
    /// RFC 4960 Sec 7.2.1: the initial cwnd is min(4*MTU, max(2*MTU, 4380)).
    pub(crate) fn new(mtu: u32) -> Self {
        CongestionController {
            mtu,
            cwnd: (4 * mtu).min((2 * mtu).max(4380)),
            ..Default::default()
        }
    }

    /// Transmission allowance: the smaller of the two windows.
    pub(crate) fn awnd(&self) -> u32 {
        self.cwnd.min(self.rwnd)
    }

    pub(crate) fn in_fast_recovery(&self) -> bool {
        self.fast_recovery_exit.is_some()
    }

    /// Adopts the window the peer advertised in INIT/INIT ACK. The initial
    /// ssthresh may be arbitrarily high; the advertised window serves
    /// (RFC 4960 Sec 7.2.1).
    pub(crate) fn seed_peer_window(&mut self, a_rwnd: u32) {
        self.rwnd = a_rwnd;
        self.ssthresh = a_rwnd;
    }

    /// Charges bytes handed to the transmission path against rwnd.
    pub(crate) fn reserve(&mut self, bytes: u32) {
        self.rwnd = self.rwnd.saturating_sub(bytes);
    }

    /// RFC 4960 Sec 6.2.1 D ii): rwnd becomes the freshly advertised
    /// credit minus what is still outstanding.
    pub(crate) fn refresh_peer_window(&mut self, a_rwnd: u32, outstanding: u32) {
        self.rwnd = a_rwnd.saturating_sub(outstanding);
    }

    /// Grows cwnd after the cumulative ack point advanced.
    pub(crate) fn on_cumulative_ack(&mut self, bytes_acked: u32, has_pending: bool, name: &str) {
        if self.cwnd > self.ssthresh {
            // RFC 4960 Sec 7.2.2 (congestion avoidance): accumulate acked
            // bytes; once a full cwnd has been acked while the window was
            // in use, grow by one MTU.
            self.partial_bytes_acked += bytes_acked;
            if self.partial_bytes_acked >= self.cwnd && has_pending {
                self.partial_bytes_acked -= self.cwnd;
                self.cwnd += self.mtu;
                log::trace!(
                    "[{name}] congestion avoidance: cwnd={} ssthresh={}",
                    self.cwnd,
                    self.ssthresh
                );
            }
            return;
        }

        // RFC 4960 Sec 7.2.1 (slow start): grow by at most the bytes
        // acked, only while the window is in use and the sender is not
        // recovering.
        if has_pending && !self.in_fast_recovery() {
            self.cwnd += bytes_acked.min(self.cwnd);
            log::trace!(
                "[{name}] slow start: cwnd={} ssthresh={} acked={bytes_acked}",
                self.cwnd,
                self.ssthresh
            );
        }
    }

    /// A chunk hit three miss indications (RFC 4960 Sec 7.2.3/7.2.4).
    pub(crate) fn enter_fast_recovery(&mut self, exit_point: u32, name: &str) {
        self.fast_recovery_exit = Some(exit_point);
        self.ssthresh = (self.cwnd / 2).max(4 * self.mtu);
        self.cwnd = self.ssthresh;
        self.partial_bytes_acked = 0;
        log::trace!(
            "[{name}] fast recovery until tsn={exit_point}: cwnd={} ssthresh={}",
            self.cwnd,
            self.ssthresh
        );
    }

    /// Leaves fast recovery once the retiring TSN reaches the exit point.
    /// Returns whether recovery ended.
    pub(crate) fn covers_recovery_exit(&mut self, tsn: u32) -> bool {
        if self.fast_recovery_exit == Some(tsn) {
            self.fast_recovery_exit = None;
            true
        } else {
            false
        }
    }

    /// RFC 4960 Sec 6.3.3 E1 / Sec 7.2.3: on T3-rtx expiry,
    /// ssthresh = max(cwnd/2, 4*MTU) and cwnd restarts at one MTU.
    pub(crate) fn on_rtx_timeout(&mut self, name: &str) {
        self.ssthresh = (self.cwnd / 2).max(4 * self.mtu);
        self.cwnd = self.mtu;
        log::trace!(
            "[{name}] rtx timeout: cwnd={} ssthresh={}",
            self.cwnd,
            self.ssthresh
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_initial_window() {
        // small MTU: the 4380-byte floor wins
        assert_eq!(CongestionController::new(1228).cwnd, 4380);
        // large MTU: 4*MTU caps at twice the MTU pair rule
        assert_eq!(CongestionController::new(3000).cwnd, 6000);
    }

    #[test]
    fn test_slow_start_growth_is_capped() {
        let mut cc = CongestionController::new(1228);
        cc.seed_peer_window(1024 * 1024);

        let before = cc.cwnd;
        cc.on_cumulative_ack(100_000, true, "t");
        assert_eq!(cc.cwnd, before * 2, "growth caps at doubling per ack");

        let before = cc.cwnd;
        cc.on_cumulative_ack(100, false, "t");
        assert_eq!(cc.cwnd, before, "no growth while nothing is pending");
    }

    #[test]
    fn test_congestion_avoidance_grows_by_mtu() {
        let mut cc = CongestionController::new(1228);
        cc.seed_peer_window(1000);
        cc.cwnd = 2000; // above ssthresh

        cc.on_cumulative_ack(1500, true, "t");
        assert_eq!(cc.cwnd, 2000, "not yet a full cwnd of acked bytes");
        cc.on_cumulative_ack(700, true, "t");
        assert_eq!(cc.cwnd, 2000 + 1228, "a full cwnd acked grows by one MTU");
        assert_eq!(cc.partial_bytes_acked, 200);
    }

    #[test]
    fn test_fast_recovery_cycle() {
        let mut cc = CongestionController::new(1228);
        let cwnd = cc.cwnd;

        cc.enter_fast_recovery(42, "t");
        assert!(cc.in_fast_recovery());
        assert_eq!(cc.ssthresh, (cwnd / 2).max(4 * 1228));
        assert_eq!(cc.cwnd, cc.ssthresh);

        assert!(!cc.covers_recovery_exit(41));
        assert!(cc.in_fast_recovery());
        assert!(cc.covers_recovery_exit(42));
        assert!(!cc.in_fast_recovery());
    }

    #[test]
    fn test_rtx_timeout_collapses_cwnd() {
        let mut cc = CongestionController::new(1228);
        let cwnd = cc.cwnd;

        cc.on_rtx_timeout("t");
        assert_eq!(cc.cwnd, 1228);
        assert_eq!(cc.ssthresh, (cwnd / 2).max(4 * 1228));
    }
}
