use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use crate::error::{EnqueueError, MultipathError};
use crate::frame::{FrameNumber, SendFrame};
use crate::subflow::{NullStatsTracker, StatsTracker, Subflow, SubflowId};

/// A [Subflow] that does not transmit anything. Frames stay in its bounded outbound queue until
///  test code takes them out, and its RTT and retransmission timeout are whatever test code sets
///  them to.
pub struct TestSubflow {
    id: SubflowId,
    capacity: usize,
    rtt: Mutex<Duration>,
    retransmission_timeout: Mutex<Duration>,
    queue: Mutex<VecDeque<Arc<SendFrame>>>,
    /// raised when the queue gains room or the subflow is closed
    changed: Notify,
    closed: AtomicBool,
    write_deadline: Mutex<Option<Instant>>,
    stats: Arc<dyn StatsTracker>,
}

impl TestSubflow {
    pub fn new(id: u64, rtt: Duration, capacity: usize) -> Arc<TestSubflow> {
        Arc::new(TestSubflow {
            id: SubflowId(id),
            capacity,
            rtt: Mutex::new(rtt),
            retransmission_timeout: Mutex::new(3 * rtt),
            queue: Default::default(),
            changed: Notify::new(),
            closed: AtomicBool::new(false),
            write_deadline: Mutex::new(None),
            stats: Arc::new(NullStatsTracker),
        })
    }

    pub fn set_rtt(&self, rtt: Duration) {
        *self.rtt.lock().unwrap() = rtt;
    }

    pub fn set_retransmission_timeout(&self, retransmission_timeout: Duration) {
        *self.retransmission_timeout.lock().unwrap() = retransmission_timeout;
    }

    pub fn num_queued(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    /// frame numbers of the queued frames in queue order, leaving the queue unchanged
    pub fn queued_frame_numbers(&self) -> Vec<FrameNumber> {
        self.queue.lock().unwrap()
            .iter()
            .map(|frame| frame.frame_number())
            .collect()
    }

    /// returns queued frames, clearing the queue - which is as close as this subflow gets to
    ///  transmitting them
    pub fn take_queued(&self) -> Vec<Arc<SendFrame>> {
        let frames = std::mem::take(&mut *self.queue.lock().unwrap());
        self.changed.notify_waiters();
        frames.into_iter().collect()
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        *self.write_deadline.lock().unwrap()
    }
}

#[async_trait]
impl Subflow for TestSubflow {
    fn id(&self) -> SubflowId {
        self.id
    }

    fn peer(&self) -> String {
        format!("test-peer-{}", self.id.0)
    }

    fn try_enqueue(&self, frame: Arc<SendFrame>) -> Result<(), EnqueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EnqueueError::Closed);
        }

        let mut queue = self.queue.lock().unwrap();
        if queue.len() >= self.capacity {
            return Err(EnqueueError::Full);
        }
        queue.push_back(frame);
        Ok(())
    }

    async fn enqueue(&self, frame: Arc<SendFrame>) -> Result<(), EnqueueError> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.try_enqueue(frame.clone()) {
                Err(EnqueueError::Full) => changed.await,
                result => return result,
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn rtt(&self) -> Duration {
        *self.rtt.lock().unwrap()
    }

    fn retransmission_timeout(&self) -> Duration {
        *self.retransmission_timeout.lock().unwrap()
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()> {
        if self.is_closed() {
            return Err(MultipathError::SubflowClosed.into());
        }
        *self.write_deadline.lock().unwrap() = deadline;
        Ok(())
    }

    fn stats(&self) -> Arc<dyn StatsTracker> {
        self.stats.clone()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }
}
