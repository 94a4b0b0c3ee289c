use std::time::Duration;
use anyhow::bail;

#[derive(Debug, Clone)]
pub struct MultipathConfig {
    /// Interval at which pending acknowledgements are scanned for frames that are overdue and
    ///  need to be retransmitted.
    pub retransmit_check_interval: Duration,

    /// A retransmission that finds no subflow with free capacity waits for a signal that
    ///  conditions may have changed (a queue drained, a subflow was added). This is the upper
    ///  bound for a single wait, after which the subflows are re-checked regardless.
    pub retransmit_retry_interval: Duration,

    /// This is the number of *frames* (not bytes) that fit into a subflow's outbound queue
    pub send_queue_capacity: usize,

    /// This is the number of frames the receive side buffers ahead of the next frame it expects.
    ///  Frames beyond this window are not acknowledged, so the peer retransmits them later.
    pub receive_queue_capacity: usize,

    /// RTT estimate for a new subflow if there is no probe measurement to start from
    pub initial_rtt: Duration,
    pub min_retransmission_timeout: Duration,
    pub max_retransmission_timeout: Duration,

    /// upper bound for a single frame's payload, enforced on the receiving side
    pub max_frame_payload: usize,

    /// number of frame buffers kept around for reuse - buffers in excess of this number are
    ///  discarded when they are released
    pub buffer_pool_size: usize,
}

impl Default for MultipathConfig {
    fn default() -> Self {
        MultipathConfig {
            retransmit_check_interval: Duration::from_millis(100),
            retransmit_retry_interval: Duration::from_millis(100),
            send_queue_capacity: 4096,
            receive_queue_capacity: 8192,
            initial_rtt: Duration::from_millis(100),
            min_retransmission_timeout: Duration::from_millis(200),
            max_retransmission_timeout: Duration::from_secs(60),
            max_frame_payload: 64*1024,
            buffer_pool_size: 1024,
        }
    }
}

impl MultipathConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_check_interval.is_zero() {
            bail!("retransmit check interval must be positive");
        }
        if self.retransmit_retry_interval.is_zero() {
            bail!("retransmit retry interval must be positive");
        }
        if self.send_queue_capacity == 0 {
            bail!("send queue capacity must be positive");
        }
        if self.receive_queue_capacity == 0 {
            bail!("receive queue capacity must be positive");
        }
        if self.min_retransmission_timeout > self.max_retransmission_timeout {
            bail!("min retransmission timeout {:?} exceeds max retransmission timeout {:?}", self.min_retransmission_timeout, self.max_retransmission_timeout);
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > u32::MAX as usize {
            bail!("max frame payload must be in the range of 1..=u32::MAX");
        }
        Ok(())
    }
}
