use std::fmt::{Debug, Formatter};
use std::sync::{Arc, RwLock};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use crate::frame::{FrameNumber, SendFrame};
use crate::subflow::Subflow;

/// Bookkeeping for a frame that was written to a subflow's connection, but not acknowledged yet
#[derive(Clone)]
pub struct PendingAck {
    pub frame_number: FrameNumber,
    pub sent_at: Instant,
    pub outbound_subflow: Arc<dyn Subflow>,
    pub frame: Arc<SendFrame>,
}

impl Debug for PendingAck {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAck")
            .field("frame_number", &self.frame_number)
            .field("sent_at", &self.sent_at)
            .field("outbound_subflow", &self.outbound_subflow.id())
            .finish()
    }
}

impl PendingAck {
    /// A frame is overdue once it was not acknowledged within the retransmission timeout of the
    ///  subflow it was sent on - so a slow subflow gets a longer grace period than a fast one
    pub fn is_overdue(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.sent_at) > self.outbound_subflow.retransmission_timeout()
    }
}


/// The authoritative storage of pending acknowledgements for a connection. Entries are added by
///  subflows when they transmit a frame, and removed when an acknowledgement arrives or the
///  connection closes.
///
/// NB: The lock is held only for the duration of a lookup or modification, never across I/O
#[derive(Default)]
pub struct PendingAckMap {
    map: RwLock<FxHashMap<FrameNumber, PendingAck>>,
}

impl PendingAckMap {
    /// registers a pending entry, replacing (and returning) an earlier entry for the same frame
    pub fn insert(&self, entry: PendingAck) -> Option<PendingAck> {
        self.map.write().unwrap()
            .insert(entry.frame_number, entry)
    }

    pub fn remove(&self, frame_number: FrameNumber) -> Option<PendingAck> {
        self.map.write().unwrap()
            .remove(&frame_number)
    }

    pub fn is_pending(&self, frame_number: FrameNumber) -> bool {
        if !frame_number.is_data() {
            return false;
        }
        self.map.read().unwrap()
            .contains_key(&frame_number)
    }

    /// Restarts the retransmission clock for a frame that was just handed to another subflow,
    ///  so it does not count as overdue again before that subflow had a chance to send it
    pub fn touch(&self, frame_number: FrameNumber, now: Instant, outbound_subflow: Arc<dyn Subflow>) {
        if let Some(entry) = self.map.write().unwrap().get_mut(&frame_number) {
            entry.sent_at = now;
            entry.outbound_subflow = outbound_subflow;
        }
    }

    /// All entries that are overdue at `now`, oldest frame first
    pub fn overdue(&self, now: Instant) -> Vec<PendingAck> {
        let mut result = self.map.read().unwrap()
            .values()
            .filter(|entry| entry.is_overdue(now))
            .cloned()
            .collect::<Vec<_>>();

        result.sort_by_key(|entry| entry.frame_number);
        result
    }

    pub fn drain(&self) -> Vec<PendingAck> {
        self.map.write().unwrap()
            .drain()
            .map(|(_, entry)| entry)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
