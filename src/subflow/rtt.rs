use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Smoothed RTT and adaptive retransmission timeout for a single subflow, along the lines of
///  RFC 6298:
///
/// ```ascii
/// first sample R:   SRTT = R, RTTVAR = R/2
/// subsequent R:     RTTVAR = 3/4 * RTTVAR + 1/4 * |SRTT - R|
///                   SRTT   = 7/8 * SRTT   + 1/8 * R
/// RTO = SRTT + 4 * RTTVAR, clamped to [min_rto, max_rto]
/// ```
///
/// Values are kept in atomics so that the subflow selection can read them without blocking.
///  There is a single writer (the subflow's receive loop), so updates need no synchronization
///  beyond that.
pub struct RttEstimator {
    srtt_nanos: AtomicU64,
    rttvar_nanos: AtomicU64,
    has_sample: AtomicBool,
    min_rto: Duration,
    max_rto: Duration,
}

impl RttEstimator {
    /// `initial_rtt` is treated as a first sample, e.g. the time a probe took during subflow
    ///  setup
    pub fn new(initial_rtt: Duration, min_rto: Duration, max_rto: Duration) -> RttEstimator {
        let initial_nanos = Self::to_nanos(initial_rtt);
        RttEstimator {
            srtt_nanos: AtomicU64::new(initial_nanos),
            rttvar_nanos: AtomicU64::new(initial_nanos / 2),
            has_sample: AtomicBool::new(false),
            min_rto,
            max_rto,
        }
    }

    fn to_nanos(d: Duration) -> u64 {
        d.as_nanos().try_into().unwrap_or(u64::MAX)
    }

    pub fn on_sample(&self, rtt: Duration) {
        let sample = Self::to_nanos(rtt);

        if !self.has_sample.swap(true, Ordering::AcqRel) {
            // the seed value is replaced rather than averaged with the first real measurement
            self.srtt_nanos.store(sample, Ordering::Release);
            self.rttvar_nanos.store(sample / 2, Ordering::Release);
        }
        else {
            let srtt = self.srtt_nanos.load(Ordering::Acquire);
            let rttvar = self.rttvar_nanos.load(Ordering::Acquire);

            let new_rttvar = (rttvar / 4).saturating_mul(3).saturating_add(srtt.abs_diff(sample) / 4);
            let new_srtt = (srtt / 8).saturating_mul(7).saturating_add(sample / 8);

            self.rttvar_nanos.store(new_rttvar, Ordering::Release);
            self.srtt_nanos.store(new_srtt, Ordering::Release);
        }
        trace!("RTT sample {:?} -> srtt {:?}, rto {:?}", rtt, self.rtt(), self.retransmission_timeout());
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_nanos(self.srtt_nanos.load(Ordering::Acquire))
    }

    pub fn retransmission_timeout(&self) -> Duration {
        let srtt = self.srtt_nanos.load(Ordering::Acquire);
        let rttvar = self.rttvar_nanos.load(Ordering::Acquire);
        let raw = Duration::from_nanos(srtt.saturating_add(rttvar.saturating_mul(4)));
        raw.clamp(self.min_rto, self.max_rto)
    }
}
