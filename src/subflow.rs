//! A subflow is one underlying network connection carrying a share of a multipath connection's
//!  traffic. The connection orchestrator only sees subflows through the [Subflow] trait, and a
//!  subflow reaches back to its connection only through [SubflowHost].

mod rtt;
mod stream_subflow;

pub use rtt::RttEstimator;
pub use stream_subflow::StreamSubflow;

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;
use crate::connection_id::ConnectionId;
use crate::error::EnqueueError;
use crate::frame::{FrameNumber, SendFrame};
use crate::pending_ack::PendingAck;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SubflowId(pub u64);

impl Debug for SubflowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sf-{}", self.0)
    }
}
impl Display for SubflowId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "sf-{}", self.0)
    }
}

/// Which side of the underlying connection this end of the subflow is
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SubflowRole {
    Client,
    Server,
}


/// The orchestrator's view of a subflow.
///
/// A subflow owns a bounded outbound queue that the connection puts frames on, and is
///  responsible for transmitting them, registering a pending acknowledgement with its host at
///  actual transmit time, and clearing it when the acknowledgement arrives.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Subflow: Send + Sync + 'static {
    fn id(&self) -> SubflowId;

    /// the peer address this subflow was dialed to or accepted from, for logging
    fn peer(&self) -> String;

    /// Puts a frame on the outbound queue if there is room, without waiting
    fn try_enqueue(&self, frame: Arc<SendFrame>) -> Result<(), EnqueueError>;

    /// Puts a frame on the outbound queue, waiting for room if necessary. Dropping the returned
    ///  future before it completes must leave the frame off the queue.
    async fn enqueue(&self, frame: Arc<SendFrame>) -> Result<(), EnqueueError>;

    /// This is the 'closed signal': once a subflow is closed, it stays closed
    fn is_closed(&self) -> bool;

    fn rtt(&self) -> Duration;

    /// adaptive timeout after which a frame sent on this subflow without being acknowledged is
    ///  considered lost
    fn retransmission_timeout(&self) -> Duration;

    fn set_write_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()>;

    fn stats(&self) -> Arc<dyn StatsTracker>;

    fn close(&self);
}


/// This is the connection as seen from a subflow. It is implemented by the connection
///  orchestrator and held by subflows as a weak reference.
#[cfg_attr(test, automock)]
pub trait SubflowHost: Send + Sync + 'static {
    fn connection_id(&self) -> ConnectionId;

    /// Passes an inbound data frame on for reassembly. Returns `true` if the frame was accepted
    ///  (or is a duplicate of an accepted frame) and should be acknowledged.
    fn on_data_frame(&self, frame_number: FrameNumber, payload: Bytes) -> bool;

    /// Clears the pending acknowledgement for a frame and releases the frame, returning the
    ///  pending entry if there was one
    fn on_ack(&self, frame_number: FrameNumber) -> Option<PendingAck>;

    /// called when a subflow starts writing a frame to its underlying connection, so that an
    ///  acknowledgement arriving while the write is still in progress finds the frame pending
    fn register_pending_ack(&self, frame: Arc<SendFrame>, subflow: Arc<dyn Subflow>);

    /// called when a frame was completely written to the subflow's underlying connection
    fn on_transmitted(&self, frame_number: FrameNumber, subflow: Arc<dyn Subflow>);

    /// hands back a frame that was queued on a subflow but never transmitted because the
    ///  subflow closed
    fn requeue(&self, frame: Arc<SendFrame>);

    /// raises the signal that retransmissions waiting for outbound capacity wait on
    fn signal_retransmit(&self);

    fn remove_subflow(&self, id: SubflowId);
}


/// Reporting sink for per-subflow statistics. The orchestrator passes it through to the
///  subflows it creates without interpreting it.
#[cfg_attr(test, automock)]
pub trait StatsTracker: Send + Sync + 'static {
    fn on_rtt_sample(&self, _peer: &str, _rtt: Duration) {}
    fn on_bytes_sent(&self, _peer: &str, _num_bytes: usize) {}
    fn on_bytes_received(&self, _peer: &str, _num_bytes: usize) {}
    fn on_retransmission(&self, _peer: &str, _frame_number: FrameNumber) {}
}

pub struct NullStatsTracker;
impl StatsTracker for NullStatsTracker {}
