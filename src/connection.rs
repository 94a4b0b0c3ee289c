use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace};
use crate::buffer_pool::FrameBufferPool;
use crate::config::MultipathConfig;
use crate::connection_id::ConnectionId;
use crate::error::{EnqueueError, MultipathError};
use crate::frame::{FrameNumber, RetransmissionGuard, SendFrame, MIN_FRAME_NUMBER};
use crate::pending_ack::{PendingAck, PendingAckMap};
use crate::receive_queue::ReceiveQueue;
use crate::subflow::{StatsTracker, StreamSubflow, Subflow, SubflowHost, SubflowId, SubflowRole};

/// The address of a multipath connection. A logical connection spans several network paths and
///  has no single endpoint, so this is a fixed placeholder.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct MultipathAddr;

impl MultipathAddr {
    pub fn network(&self) -> &'static str {
        "multipath"
    }
}

impl Display for MultipathAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "multipath")
    }
}


/// A logical, reliable, ordered byte stream carried over a dynamic set of subflows.
///
/// Outbound data is split into numbered frames, each of which goes to the subflow with the lowest
///  RTT that has room in its outbound queue. Frames that are not acknowledged within the
///  retransmission timeout of the subflow they were sent on are retransmitted, possibly on a
///  different subflow. The receive side restores the original order based on frame numbers.
///
/// Subflows come and go independently of each other; only the loss of the last subflow (or an
///  explicit call to [MultipathConn::close]) closes the connection, which is irrevocable.
///
/// `MultipathConn` is a cheap handle, clones refer to the same connection.
#[derive(Clone)]
pub struct MultipathConn {
    inner: Arc<ConnInner>,
}

impl MultipathConn {
    /// Creates a connection without subflows and spawns its retransmission task, which requires
    ///  a tokio runtime.
    pub fn new(cid: ConnectionId, config: MultipathConfig) -> anyhow::Result<MultipathConn> {
        config.validate()?;

        let config = Arc::new(config);
        let inner = Arc::new_cyclic(|self_ref| ConnInner {
            cid,
            buffer_pool: Arc::new(FrameBufferPool::new(
                config.max_frame_payload.min(16*1024) + crate::wire::DataFrameHeader::SERIALIZED_LEN,
                config.buffer_pool_size,
            )),
            receive_queue: ReceiveQueue::new(config.receive_queue_capacity),
            last_frame_number: AtomicU64::new(MIN_FRAME_NUMBER.to_raw() - 1),
            next_subflow_id: AtomicU64::new(1),
            subflows: Default::default(),
            pending_acks: Default::default(),
            closed: AtomicBool::new(false),
            try_retransmit: Notify::new(),
            write_deadline: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            self_ref: self_ref.clone(),
            config,
        });

        info!("connection {}: created", cid);
        tokio::spawn(retransmit_loop(Arc::downgrade(&inner), inner.config.retransmit_check_interval));

        Ok(MultipathConn { inner })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.cid
    }

    /// Reads data in frame number order, waiting until data is available. Returns `Ok(0)` at the
    ///  end of the stream, i.e. after the connection was closed and all data received before
    ///  was read.
    pub async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        self.inner.receive_queue.read(buf).await
    }

    /// Hands data to the connection's subflows for transmission, returning the number of bytes
    ///  written, which is always the full length of `payload`.
    ///
    /// Payloads longer than the configured maximum frame size are split into several frames.
    ///  This call waits only if all subflows' outbound queues are full. It fails with
    ///  [MultipathError::ConnectionClosed] if there is no subflow to carry the data, and with
    ///  [MultipathError::DeadlineExceeded] if the write deadline elapses while waiting.
    pub async fn write(&self, payload: &[u8]) -> anyhow::Result<usize> {
        self.inner.check_writable()?;
        for chunk in payload.chunks(self.inner.config.max_frame_payload) {
            self.inner.write_frame(chunk).await?;
        }
        Ok(payload.len())
    }

    /// Closes the connection and all its subflows. Pending reads see the end of the stream once
    ///  they consumed all data received so far. Calling this more than once has no effect.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn local_addr(&self) -> MultipathAddr {
        MultipathAddr
    }

    pub fn remote_addr(&self) -> MultipathAddr {
        MultipathAddr
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()> {
        self.inner.receive_queue.set_read_deadline(deadline);
        Ok(())
    }

    /// Sets the write deadline for [MultipathConn::write] and for all current subflows. The
    ///  first subflow that fails to apply the deadline ends propagation, and its error is
    ///  returned.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()> {
        *self.inner.write_deadline.lock().unwrap() = deadline;

        let subflows = self.inner.subflows.read().unwrap().clone();
        for subflow in subflows {
            subflow.set_write_deadline(deadline)?;
        }
        Ok(())
    }

    /// Starts a subflow over an established connection to (or from) `to` and adds it to this
    ///  connection.
    ///
    /// `probe_start` is the point in time when establishing `conn` started, and serves to seed
    ///  the new subflow's RTT estimate. `stats` receives the new subflow's statistics.
    pub fn add<S>(&self, to: impl Into<String>, conn: S, role: SubflowRole, probe_start: Instant, stats: Arc<dyn StatsTracker>) -> SubflowId
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let id = SubflowId(self.inner.next_subflow_id.fetch_add(1, Ordering::Relaxed));

        let host: Arc<dyn SubflowHost> = self.inner.clone();
        let subflow = StreamSubflow::start(id, to.into(), conn, role, probe_start, stats, self.inner.config.clone(), Arc::downgrade(&host));

        self.inner.add_subflow(subflow);
        id
    }

    /// Adds a subflow that was created outside the connection
    pub fn add_subflow(&self, subflow: Arc<dyn Subflow>) {
        self.inner.add_subflow(subflow);
    }

    /// Removes a subflow from the connection and closes it. Frames queued on the subflow are
    ///  retransmitted on the remaining subflows. Removing the last subflow closes the connection.
    pub fn remove(&self, id: SubflowId) {
        if let Some(subflow) = self.inner.remove_subflow_from_set(id) {
            subflow.close();
        }
    }

    pub fn num_subflows(&self) -> usize {
        self.inner.subflows.read().unwrap().len()
    }

    pub fn num_pending_acks(&self) -> usize {
        self.inner.pending_acks.len()
    }
}


struct ConnInner {
    cid: ConnectionId,
    config: Arc<MultipathConfig>,
    buffer_pool: Arc<FrameBufferPool>,
    receive_queue: ReceiveQueue,
    last_frame_number: AtomicU64,
    next_subflow_id: AtomicU64,
    /// NB: This lock is held only to modify or copy the set, never across I/O
    subflows: RwLock<Vec<Arc<dyn Subflow>>>,
    pending_acks: PendingAckMap,
    closed: AtomicBool,
    /// raised whenever a subflow may have gained outbound capacity
    try_retransmit: Notify,
    write_deadline: Mutex<Option<Instant>>,
    /// held by a write from taking a frame number until the frame is on a subflow's queue
    write_lock: tokio::sync::Mutex<()>,
    self_ref: Weak<ConnInner>,
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        self.close();
    }
}

impl ConnInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_frame_number(&self) -> FrameNumber {
        FrameNumber::from_raw(self.last_frame_number.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// A point-in-time copy of the subflows, ordered by RTT with the fastest first
    fn sorted_subflows(&self) -> Vec<Arc<dyn Subflow>> {
        let mut result = self.subflows.read().unwrap().clone();
        result.sort_by_cached_key(|subflow| subflow.rtt());
        result
    }

    fn check_writable(&self) -> Result<(), MultipathError> {
        if self.is_closed() || self.subflows.read().unwrap().is_empty() {
            return Err(MultipathError::ConnectionClosed);
        }
        Ok(())
    }

    async fn write_frame(&self, chunk: &[u8]) -> anyhow::Result<()> {
        let deadline = *self.write_deadline.lock().unwrap();

        // frame numbers are handed out under this lock, so a number that did not make it onto a
        //  subflow can be taken back without leaving a gap in the stream
        let _write_guard = match deadline {
            Some(deadline) => timeout_at(deadline, self.write_lock.lock()).await
                .map_err(|_| MultipathError::DeadlineExceeded)?,
            None => self.write_lock.lock().await,
        };

        self.check_writable()?;
        let subflows = self.sorted_subflows();

        let frame = Arc::new(SendFrame::compose(self.next_frame_number(), chunk, self.buffer_pool.clone()));

        for subflow in &subflows {
            if subflow.try_enqueue(frame.clone()).is_ok() {
                trace!("connection {}: frame {} goes to subflow {}", self.cid, frame.frame_number(), subflow.id());
                return Ok(());
            }
        }

        debug!("connection {}: no subflow has room for frame {} - waiting", self.cid, frame.frame_number());
        let result = match deadline {
            Some(deadline) => timeout_at(deadline, self.enqueue_blocking(&frame)).await
                .unwrap_or_else(|_| Err(MultipathError::DeadlineExceeded)),
            None => self.enqueue_blocking(&frame).await,
        };

        if let Err(e) = result {
            debug!("connection {}: frame {} was not accepted by any subflow: {}", self.cid, frame.frame_number(), e);
            self.last_frame_number.fetch_sub(1, Ordering::AcqRel);
            frame.release();
            return Err(e.into());
        }
        Ok(())
    }

    /// Waits for room on the fastest subflow, falling back to the next one if that subflow
    ///  closes while waiting. Relies on [Subflow::enqueue] not enqueueing anything if it is
    ///  cancelled.
    async fn enqueue_blocking(&self, frame: &Arc<SendFrame>) -> Result<(), MultipathError> {
        for subflow in self.sorted_subflows() {
            if subflow.is_closed() {
                continue;
            }
            match subflow.enqueue(frame.clone()).await {
                Ok(()) => {
                    trace!("connection {}: frame {} goes to subflow {} after waiting", self.cid, frame.frame_number(), subflow.id());
                    return Ok(());
                }
                Err(EnqueueError::Full) | Err(EnqueueError::Closed) => {
                    debug!("connection {}: subflow {} closed while waiting to enqueue frame {}", self.cid, subflow.id(), frame.frame_number());
                }
            }
            if self.is_closed() {
                break;
            }
        }
        Err(MultipathError::ConnectionClosed)
    }

    /// Puts a frame on the fastest subflow that accepts it. At most one retransmission per frame
    ///  is in progress at any given time, a call for a frame that is being retransmitted
    ///  returns `false` immediately.
    ///
    /// If no subflow has room, this waits for the retry signal, but no longer than the
    ///  configured retry interval, before checking again. It gives up when the connection is
    ///  closed or the frame is released.
    async fn retransmit(&self, frame: &Arc<SendFrame>) -> bool {
        if !frame.try_start_retransmission() {
            trace!("connection {}: frame {} is being retransmitted already", self.cid, frame.frame_number());
            return false;
        }
        let _guard = RetransmissionGuard(frame);

        loop {
            if self.is_closed() {
                trace!("connection {}: closed - not retransmitting frame {}", self.cid, frame.frame_number());
                return false;
            }
            if frame.is_released() {
                return false;
            }

            // register for the signal before checking the subflows so a signal raised in between
            //  is not lost
            let notified = self.try_retransmit.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            for subflow in self.sorted_subflows() {
                if subflow.is_closed() {
                    continue;
                }
                if subflow.try_enqueue(frame.clone()).is_ok() {
                    let count = frame.increment_retransmissions();
                    debug!("connection {}: retransmitting frame {} on subflow {} (#{})", self.cid, frame.frame_number(), subflow.id(), count);
                    subflow.stats().on_retransmission(&subflow.peer(), frame.frame_number());
                    self.pending_acks.touch(frame.frame_number(), Instant::now(), subflow);
                    return true;
                }
            }

            trace!("connection {}: no subflow has room to retransmit frame {} - waiting", self.cid, frame.frame_number());
            let _ = timeout(self.config.retransmit_retry_interval, notified).await;
        }
    }

    /// Schedules retransmission for all overdue frames, oldest first, returning their frame
    ///  numbers. Frames that were acknowledged in the meantime are released instead.
    fn reconcile(&self) -> Vec<FrameNumber> {
        let mut scheduled = Vec::new();

        for entry in self.pending_acks.overdue(Instant::now()) {
            // the ACK may have arrived after the scan
            if !self.pending_acks.is_pending(entry.frame_number) {
                entry.frame.release();
                continue;
            }
            if entry.frame.is_being_retransmitted() {
                continue;
            }
            let Some(conn) = self.self_ref.upgrade() else {
                break;
            };

            scheduled.push(entry.frame_number);
            let frame = entry.frame;
            tokio::spawn(async move {
                conn.retransmit(&frame).await;
            });
        }
        scheduled
    }

    fn add_subflow(&self, subflow: Arc<dyn Subflow>) {
        {
            let mut subflows = self.subflows.write().unwrap();
            if self.is_closed() {
                drop(subflows);
                debug!("connection {}: closed - rejecting subflow {}", self.cid, subflow.id());
                subflow.close();
                return;
            }
            subflows.push(subflow.clone());
        }

        info!("connection {}: added subflow {} to {}", self.cid, subflow.id(), subflow.peer());

        if let Some(deadline) = *self.write_deadline.lock().unwrap() {
            if let Err(e) = subflow.set_write_deadline(Some(deadline)) {
                debug!("connection {}: failed to set write deadline on new subflow {}: {}", self.cid, subflow.id(), e);
            }
        }

        // the new subflow has room for frames waiting to be retransmitted
        self.try_retransmit.notify_waiters();
    }

    /// Removes a subflow from the set, closing the connection if it was the last one
    fn remove_subflow_from_set(&self, id: SubflowId) -> Option<Arc<dyn Subflow>> {
        let (removed, is_now_empty) = {
            let mut subflows = self.subflows.write().unwrap();
            let idx = subflows.iter().position(|s| s.id() == id)?;
            let removed = subflows.swap_remove(idx);
            (removed, subflows.is_empty())
        };

        info!("connection {}: removed subflow {} to {}", self.cid, id, removed.peer());

        if is_now_empty {
            info!("connection {}: last subflow is gone", self.cid);
            self.close();
        }
        Some(removed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("connection {}: closing", self.cid);

        self.receive_queue.close();

        let subflows = self.subflows.read().unwrap().clone();
        for subflow in subflows {
            subflow.close();
        }

        for entry in self.pending_acks.drain() {
            entry.frame.release();
        }

        // retransmissions waiting for capacity observe the closed flag when they wake up
        self.try_retransmit.notify_waiters();
    }
}

impl SubflowHost for ConnInner {
    fn connection_id(&self) -> ConnectionId {
        self.cid
    }

    fn on_data_frame(&self, frame_number: FrameNumber, payload: Bytes) -> bool {
        self.receive_queue.add(frame_number, payload)
    }

    fn on_ack(&self, frame_number: FrameNumber) -> Option<PendingAck> {
        let entry = self.pending_acks.remove(frame_number)?;
        trace!("connection {}: frame {} was acknowledged", self.cid, frame_number);
        entry.frame.release();
        Some(entry)
    }

    fn register_pending_ack(&self, frame: Arc<SendFrame>, subflow: Arc<dyn Subflow>) {
        if frame.is_released() {
            return;
        }

        let frame_number = frame.frame_number();
        self.pending_acks.insert(PendingAck {
            frame_number,
            sent_at: Instant::now(),
            outbound_subflow: subflow,
            frame,
        });

        // close() may have drained the map before the insert
        if self.is_closed() {
            if let Some(entry) = self.pending_acks.remove(frame_number) {
                entry.frame.release();
            }
        }
    }

    fn on_transmitted(&self, frame_number: FrameNumber, subflow: Arc<dyn Subflow>) {
        self.pending_acks.touch(frame_number, Instant::now(), subflow);
    }

    fn requeue(&self, frame: Arc<SendFrame>) {
        if self.is_closed() {
            frame.release();
            return;
        }
        if frame.is_released() {
            return;
        }
        let Some(conn) = self.self_ref.upgrade() else {
            frame.release();
            return;
        };

        trace!("connection {}: frame {} was handed back by its subflow", self.cid, frame.frame_number());
        tokio::spawn(async move {
            conn.retransmit(&frame).await;
        });
    }

    fn signal_retransmit(&self) {
        self.try_retransmit.notify_one();
    }

    fn remove_subflow(&self, id: SubflowId) {
        self.remove_subflow_from_set(id);
    }
}

/// Periodically retransmits frames that were not acknowledged in time. This terminates when the
///  connection is closed or dropped.
async fn retransmit_loop(conn: Weak<ConnInner>, check_interval: Duration) {
    let mut ticks = tokio::time::interval(check_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks.tick().await;

    loop {
        ticks.tick().await;

        let Some(conn) = conn.upgrade() else {
            trace!("connection was dropped - terminating retransmit loop");
            return;
        };
        if conn.is_closed() {
            debug!("connection {}: closed - terminating retransmit loop", conn.cid);
            return;
        }

        let scheduled = conn.reconcile();
        if !scheduled.is_empty() {
            debug!("connection {}: retransmitting overdue frames {:?}", conn.cid, scheduled);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use rstest::rstest;
    use crate::subflow::{MockStatsTracker, MockSubflow, NullStatsTracker};
    use crate::test_util::subflow::TestSubflow;
    use super::*;

    fn test_config() -> MultipathConfig {
        MultipathConfig {
            // the periodic sweep is triggered explicitly where a test needs it
            retransmit_check_interval: Duration::from_secs(3600),
            ..MultipathConfig::default()
        }
    }

    fn new_conn() -> MultipathConn {
        MultipathConn::new(ConnectionId::random(), test_config()).unwrap()
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn raw(frame_numbers: Vec<FrameNumber>) -> Vec<u64> {
        frame_numbers.into_iter().map(|n| n.to_raw()).collect()
    }

    fn mock_subflow(id: u64) -> MockSubflow {
        let mut subflow = MockSubflow::new();
        subflow.expect_id().return_const(SubflowId(id));
        subflow.expect_peer().returning(move || format!("peer-{}", id));
        subflow.expect_close().return_const(());
        subflow
    }

    #[rstest]
    #[case::non_empty(b"abc")]
    #[case::empty(b"")]
    #[tokio::test]
    async fn test_write_without_subflows(#[case] payload: &'static [u8]) {
        let conn = new_conn();
        let err = conn.write(payload).await.unwrap_err();
        assert!(MultipathError::is(&err, MultipathError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_empty_write() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 10);
        conn.add_subflow(subflow.clone());

        assert_eq!(conn.write(b"").await.unwrap(), 0);
        assert_eq!(subflow.num_queued(), 0);

        conn.close();
        let err = conn.write(b"").await.unwrap_err();
        assert!(MultipathError::is(&err, MultipathError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_frame_numbers_are_monotonic() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 1000);
        conn.add_subflow(subflow.clone());

        for _ in 0..5 {
            assert_eq!(conn.write(b"x").await.unwrap(), 1);
        }
        assert_eq!(raw(subflow.queued_frame_numbers()), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_frame_numbers_are_unique_with_concurrent_writers() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 1000);
        conn.add_subflow(subflow.clone());

        let writers = (0..10)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move {
                    for _ in 0..10 {
                        conn.write(b"x").await.unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();
        for writer in writers {
            writer.await.unwrap();
        }

        let frame_numbers = raw(subflow.queued_frame_numbers());
        let unique = frame_numbers.iter().copied().collect::<BTreeSet<_>>();
        assert_eq!(frame_numbers.len(), 100);
        assert_eq!(unique, (1..=100).collect::<BTreeSet<_>>());
    }

    #[rstest]
    #[case::fastest_first(vec![10, 50, 30], 1)]
    #[case::fastest_last(vec![50, 30, 10], 3)]
    #[case::single(vec![70], 1)]
    #[tokio::test]
    async fn test_write_selects_fastest_subflow(#[case] rtt_millis: Vec<u64>, #[case] expected_id: u64) {
        let conn = new_conn();
        let subflows = rtt_millis.iter().enumerate()
            .map(|(i, &rtt)| TestSubflow::new(i as u64 + 1, ms(rtt), 10))
            .collect::<Vec<_>>();
        for subflow in &subflows {
            conn.add_subflow(subflow.clone());
        }

        conn.write(b"abc").await.unwrap();

        for subflow in &subflows {
            let expected = if subflow.id() == SubflowId(expected_id) { 1 } else { 0 };
            assert_eq!(subflow.num_queued(), expected, "{}", subflow.id());
        }
    }

    #[tokio::test]
    async fn test_write_splits_large_payload() {
        let conn = MultipathConn::new(ConnectionId::random(), MultipathConfig {
            max_frame_payload: 4,
            ..test_config()
        }).unwrap();
        let subflow = TestSubflow::new(1, ms(10), 10);
        conn.add_subflow(subflow.clone());

        assert_eq!(conn.write(b"0123456789").await.unwrap(), 10);

        let frames = subflow.take_queued();
        assert_eq!(frames.iter().map(|f| f.payload_len()).collect::<Vec<_>>(), vec![4, 4, 2]);
    }

    #[tokio::test]
    async fn test_write_scenario_two_subflows() {
        let conn = new_conn();
        let fast = TestSubflow::new(1, ms(10), 1);
        let slow = TestSubflow::new(2, ms(50), 1);
        conn.add_subflow(slow.clone());
        conn.add_subflow(fast.clone());

        conn.write(b"a").await.unwrap();
        assert_eq!(raw(fast.queued_frame_numbers()), vec![1]);

        conn.write(b"b").await.unwrap();
        assert_eq!(raw(slow.queued_frame_numbers()), vec![2]);

        let blocked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(b"c").await })
        };
        tokio::time::sleep(ms(20)).await;
        assert!(!blocked.is_finished());

        assert_eq!(raw(fast.take_queued().into_iter().map(|f| f.frame_number()).collect()), vec![1]);
        assert_eq!(blocked.await.unwrap().unwrap(), 1);
        assert_eq!(raw(fast.queued_frame_numbers()), vec![3]);
    }

    #[tokio::test]
    async fn test_blocked_write_falls_back_to_next_subflow() {
        let conn = new_conn();
        let fast = TestSubflow::new(1, ms(10), 1);
        let slow = TestSubflow::new(2, ms(50), 1);
        conn.add_subflow(fast.clone());
        conn.add_subflow(slow.clone());
        conn.write(b"a").await.unwrap();
        conn.write(b"b").await.unwrap();

        let blocked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(b"c").await })
        };
        tokio::time::sleep(ms(20)).await;

        fast.close();
        tokio::time::sleep(ms(20)).await;
        slow.take_queued();

        assert_eq!(blocked.await.unwrap().unwrap(), 1);
        assert_eq!(raw(slow.queued_frame_numbers()), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_write_honors_write_deadline() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 1);
        conn.add_subflow(subflow.clone());
        conn.write(b"a").await.unwrap();

        conn.set_write_deadline(Some(Instant::now() + ms(100))).unwrap();
        assert!(subflow.write_deadline().is_some());

        let err = conn.write(b"b").await.unwrap_err();
        assert!(MultipathError::is(&err, MultipathError::DeadlineExceeded));
        assert_eq!(subflow.num_queued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_after_missed_deadline_continues_numbering() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 1);
        conn.add_subflow(subflow.clone());
        conn.write(b"a").await.unwrap();

        conn.set_write_deadline(Some(Instant::now() + ms(100))).unwrap();
        let err = conn.write(b"b").await.unwrap_err();
        assert!(MultipathError::is(&err, MultipathError::DeadlineExceeded));

        conn.set_write_deadline(None).unwrap();
        let first = subflow.take_queued();
        conn.write(b"c").await.unwrap();
        let second = subflow.take_queued();

        // the receiving side must be able to deliver everything that was written successfully
        let receiver = ReceiveQueue::new(16);
        for frame in first.iter().chain(second.iter()) {
            let encoded = frame.encoded().unwrap();
            let payload = Bytes::copy_from_slice(&encoded[crate::wire::DataFrameHeader::SERIALIZED_LEN..]);
            assert!(receiver.add(frame.frame_number(), payload));
        }
        assert_eq!(raw(first.iter().chain(second.iter()).map(|f| f.frame_number()).collect()), vec![1, 2]);

        let mut buf = [0u8; 16];
        let n = timeout(ms(10), receiver.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"ac");
    }

    #[tokio::test]
    async fn test_write_after_all_subflows_closed_while_waiting_continues_numbering() {
        let conn = new_conn();
        let first = TestSubflow::new(1, ms(10), 1);
        conn.add_subflow(first.clone());
        conn.write(b"a").await.unwrap();

        let blocked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.write(b"b").await })
        };
        tokio::time::sleep(ms(20)).await;
        first.close();

        let err = blocked.await.unwrap().unwrap_err();
        assert!(MultipathError::is(&err, MultipathError::ConnectionClosed));
        assert!(!conn.is_closed());

        let second = TestSubflow::new(2, ms(20), 1);
        conn.add_subflow(second.clone());
        conn.write(b"c").await.unwrap();
        assert_eq!(raw(second.queued_frame_numbers()), vec![2]);
    }

    #[tokio::test]
    async fn test_write_follows_rtt_changes() {
        let conn = new_conn();
        let first = TestSubflow::new(1, ms(10), 10);
        let second = TestSubflow::new(2, ms(50), 10);
        conn.add_subflow(first.clone());
        conn.add_subflow(second.clone());

        conn.write(b"a").await.unwrap();
        first.set_rtt(ms(100));
        conn.write(b"b").await.unwrap();

        assert_eq!(raw(first.queued_frame_numbers()), vec![1]);
        assert_eq!(raw(second.queued_frame_numbers()), vec![2]);
    }

    #[tokio::test]
    async fn test_removing_last_subflow_closes_connection() {
        let conn = new_conn();
        let first = TestSubflow::new(1, ms(10), 10);
        let second = TestSubflow::new(2, ms(20), 10);
        conn.add_subflow(first.clone());
        conn.add_subflow(second.clone());

        assert!(conn.inner.on_data_frame(FrameNumber::from_raw(1), Bytes::from_static(b"hello")));

        conn.remove(SubflowId(1));
        assert!(first.is_closed());
        assert!(!conn.is_closed());
        assert_eq!(conn.num_subflows(), 1);

        conn.remove(SubflowId(2));
        assert!(conn.is_closed());
        assert_eq!(conn.num_subflows(), 0);

        let err = conn.write(b"x").await.unwrap_err();
        assert!(MultipathError::is(&err, MultipathError::ConnectionClosed));

        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_removing_unknown_subflow() {
        let conn = new_conn();
        conn.add_subflow(TestSubflow::new(1, ms(10), 10));
        conn.remove(SubflowId(99));
        assert_eq!(conn.num_subflows(), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let conn = new_conn();
        conn.add_subflow(TestSubflow::new(1, ms(10), 10));

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                conn.read(&mut buf).await.unwrap()
            })
        };
        tokio::task::yield_now().await;

        conn.close();
        assert_eq!(reader.await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_close_is_idempotent() {
        let conn = new_conn();
        let subflows = (1..=3).map(|id| TestSubflow::new(id, ms(10 * id), 10)).collect::<Vec<_>>();
        for subflow in &subflows {
            conn.add_subflow(subflow.clone());
        }

        conn.write(b"a").await.unwrap();
        let frame = subflows[0].take_queued().pop().unwrap();
        conn.inner.register_pending_ack(frame.clone(), subflows[0].clone());
        assert_eq!(conn.num_pending_acks(), 1);

        let closers = (0..8)
            .map(|_| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.close() })
            })
            .collect::<Vec<_>>();
        for closer in closers {
            closer.await.unwrap();
        }

        assert!(conn.is_closed());
        assert!(subflows.iter().all(|s| s.is_closed()));
        assert_eq!(conn.num_pending_acks(), 0);
        assert!(frame.is_released());
        assert_eq!(conn.inner.buffer_pool.num_pooled(), 1);

        conn.close();
        assert_eq!(conn.inner.buffer_pool.num_pooled(), 1);
    }

    #[tokio::test]
    async fn test_add_subflow_to_closed_connection() {
        let conn = new_conn();
        conn.close();

        let subflow = TestSubflow::new(1, ms(10), 10);
        conn.add_subflow(subflow.clone());
        assert!(subflow.is_closed());
        assert_eq!(conn.num_subflows(), 0);
    }

    #[tokio::test]
    async fn test_ack_clears_pending_entry_and_releases_frame() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 10);
        conn.add_subflow(subflow.clone());

        conn.write(b"abc").await.unwrap();
        let frame = subflow.take_queued().pop().unwrap();
        conn.inner.register_pending_ack(frame.clone(), subflow.clone());
        assert_eq!(conn.num_pending_acks(), 1);

        let entry = conn.inner.on_ack(frame.frame_number()).unwrap();
        assert_eq!(entry.outbound_subflow.id(), SubflowId(1));
        assert!(frame.is_released());
        assert_eq!(conn.num_pending_acks(), 0);

        assert!(conn.inner.on_ack(frame.frame_number()).is_none());
    }

    #[tokio::test]
    async fn test_register_pending_ack_after_close_releases_frame() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 10);
        conn.add_subflow(subflow.clone());
        conn.write(b"abc").await.unwrap();
        let frame = subflow.take_queued().pop().unwrap();

        conn.close();
        conn.inner.register_pending_ack(frame.clone(), subflow.clone());

        assert!(frame.is_released());
        assert_eq!(conn.num_pending_acks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_transmission_restarts_retransmission_clock() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 10);
        subflow.set_retransmission_timeout(ms(100));
        conn.add_subflow(subflow.clone());

        let frame = Arc::new(SendFrame::compose(FrameNumber::from_raw(1), b"x", conn.inner.buffer_pool.clone()));
        conn.inner.register_pending_ack(frame.clone(), subflow.clone());

        // a slow write
        tokio::time::sleep(ms(80)).await;
        conn.inner.on_transmitted(frame.frame_number(), subflow.clone());

        tokio::time::sleep(ms(80)).await;
        assert!(conn.inner.reconcile().is_empty());

        tokio::time::sleep(ms(30)).await;
        assert_eq!(raw(conn.inner.reconcile()), vec![1]);
    }

    #[tokio::test]
    async fn test_transmission_completing_after_ack_is_ignored() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 10);
        conn.add_subflow(subflow.clone());

        let frame = Arc::new(SendFrame::compose(FrameNumber::from_raw(1), b"x", conn.inner.buffer_pool.clone()));
        conn.inner.register_pending_ack(frame.clone(), subflow.clone());
        assert!(conn.inner.on_ack(frame.frame_number()).is_some());

        conn.inner.on_transmitted(frame.frame_number(), subflow.clone());
        assert_eq!(conn.num_pending_acks(), 0);
        assert!(frame.is_released());
    }

    #[tokio::test]
    async fn test_concurrent_retransmit_is_guarded() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 1);
        conn.add_subflow(subflow.clone());

        conn.write(b"a").await.unwrap();
        let frame = Arc::new(SendFrame::compose(FrameNumber::from_raw(42), b"b", conn.inner.buffer_pool.clone()));

        // the subflow's queue is full, so the first retransmission waits
        let first = {
            let inner = conn.inner.clone();
            let frame = frame.clone();
            tokio::spawn(async move { inner.retransmit(&frame).await })
        };
        tokio::time::sleep(ms(10)).await;
        assert!(frame.is_being_retransmitted());

        assert!(!conn.inner.retransmit(&frame).await);

        subflow.take_queued();
        conn.inner.signal_retransmit();
        assert!(first.await.unwrap());

        assert_eq!(frame.retransmissions(), 1);
        assert!(!frame.is_being_retransmitted());
        assert_eq!(raw(subflow.queued_frame_numbers()), vec![42]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_gives_up_when_connection_closes() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 1);
        conn.add_subflow(subflow.clone());
        conn.write(b"a").await.unwrap();

        let frame = Arc::new(SendFrame::compose(FrameNumber::from_raw(42), b"b", conn.inner.buffer_pool.clone()));
        let retransmission = {
            let inner = conn.inner.clone();
            let frame = frame.clone();
            tokio::spawn(async move { inner.retransmit(&frame).await })
        };
        tokio::time::sleep(ms(1000)).await;
        assert!(!retransmission.is_finished());

        conn.close();
        assert!(!retransmission.await.unwrap());
        assert_eq!(frame.retransmissions(), 0);
        assert!(!frame.is_being_retransmitted());
    }

    #[tokio::test]
    async fn test_retransmit_reports_to_stats_of_chosen_subflow() {
        let conn = new_conn();

        let reported = Arc::new(Mutex::new(Vec::new()));
        let mut stats = MockStatsTracker::new();
        {
            let reported = reported.clone();
            stats.expect_on_retransmission()
                .times(1)
                .returning(move |peer, frame_number| reported.lock().unwrap().push((peer.to_string(), frame_number.to_raw())));
        }
        let stats: Arc<dyn StatsTracker> = Arc::new(stats);

        let mut subflow = mock_subflow(1);
        subflow.expect_rtt().return_const(ms(10));
        subflow.expect_is_closed().return_const(false);
        subflow.expect_try_enqueue().times(1).returning(|_| Ok(()));
        subflow.expect_stats().returning(move || stats.clone());
        conn.add_subflow(Arc::new(subflow));

        let frame = Arc::new(SendFrame::compose(FrameNumber::from_raw(42), b"b", conn.inner.buffer_pool.clone()));
        assert!(conn.inner.retransmit(&frame).await);
        assert_eq!(frame.retransmissions(), 1);
        assert_eq!(reported.lock().unwrap().as_slice(), &[("peer-1".to_string(), 42)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_retransmits_overdue_frames_oldest_first() {
        let conn = new_conn();
        let original = TestSubflow::new(1, ms(10), 10);
        original.set_retransmission_timeout(ms(200));
        conn.add_subflow(original.clone());

        let frames = [7, 3, 5]
            .into_iter()
            .map(|n| Arc::new(SendFrame::compose(FrameNumber::from_raw(n), b"x", conn.inner.buffer_pool.clone())))
            .collect::<Vec<_>>();
        for frame in &frames {
            conn.inner.register_pending_ack(frame.clone(), original.clone());
        }

        tokio::time::sleep(ms(150)).await;
        assert!(conn.inner.reconcile().is_empty());

        tokio::time::sleep(ms(100)).await;
        assert_eq!(raw(conn.inner.reconcile()), vec![3, 5, 7]);

        tokio::time::sleep(ms(1)).await;
        assert_eq!(raw(original.queued_frame_numbers()), vec![3, 5, 7]);
        assert!(frames.iter().all(|f| f.retransmissions() == 1));

        // retransmission restarted the clock
        assert!(conn.inner.reconcile().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_skips_frames_being_retransmitted() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 10);
        subflow.set_retransmission_timeout(ms(200));
        conn.add_subflow(subflow.clone());

        let frame = Arc::new(SendFrame::compose(FrameNumber::from_raw(3), b"x", conn.inner.buffer_pool.clone()));
        conn.inner.register_pending_ack(frame.clone(), subflow.clone());
        tokio::time::sleep(ms(300)).await;

        assert!(frame.try_start_retransmission());
        assert!(conn.inner.reconcile().is_empty());
        frame.finish_retransmission();
        assert_eq!(raw(conn.inner.reconcile()), vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retransmit_loop_resends_unacknowledged_frames() {
        let conn = MultipathConn::new(ConnectionId::random(), MultipathConfig {
            retransmit_check_interval: ms(100),
            ..MultipathConfig::default()
        }).unwrap();
        let subflow = TestSubflow::new(1, ms(10), 10);
        subflow.set_retransmission_timeout(ms(200));
        conn.add_subflow(subflow.clone());

        conn.write(b"abc").await.unwrap();
        let frame = subflow.take_queued().pop().unwrap();
        conn.inner.register_pending_ack(frame.clone(), subflow.clone());

        tokio::time::sleep(ms(350)).await;
        assert_eq!(raw(subflow.queued_frame_numbers()), vec![1]);
        assert_eq!(frame.retransmissions(), 1);
    }

    #[tokio::test]
    async fn test_requeue_retransmits_on_other_subflow() {
        let conn = new_conn();
        let failed = TestSubflow::new(1, ms(10), 10);
        let other = TestSubflow::new(2, ms(50), 10);
        conn.add_subflow(failed.clone());
        conn.add_subflow(other.clone());

        conn.write(b"abc").await.unwrap();
        let frame = failed.take_queued().pop().unwrap();
        failed.close();

        conn.inner.requeue(frame.clone());
        tokio::time::sleep(ms(10)).await;

        assert_eq!(raw(other.queued_frame_numbers()), vec![1]);
    }

    #[tokio::test]
    async fn test_requeue_after_close_releases_frame() {
        let conn = new_conn();
        let subflow = TestSubflow::new(1, ms(10), 10);
        conn.add_subflow(subflow.clone());
        conn.write(b"abc").await.unwrap();
        let frame = subflow.take_queued().pop().unwrap();

        conn.close();
        conn.inner.requeue(frame.clone());
        assert!(frame.is_released());
    }

    #[tokio::test]
    async fn test_write_deadline_propagation_stops_at_first_failure() {
        let conn = new_conn();

        let mut first = mock_subflow(1);
        first.expect_set_write_deadline().times(1).returning(|_| Ok(()));
        let mut second = mock_subflow(2);
        second.expect_set_write_deadline().times(1).returning(|_| Err(MultipathError::SubflowClosed.into()));
        let mut third = mock_subflow(3);
        third.expect_set_write_deadline().never();

        conn.add_subflow(Arc::new(first));
        conn.add_subflow(Arc::new(second));
        conn.add_subflow(Arc::new(third));

        let err = conn.set_write_deadline(Some(Instant::now() + ms(100))).unwrap_err();
        assert!(MultipathError::is(&err, MultipathError::SubflowClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_deadline() {
        let conn = new_conn();
        conn.set_read_deadline(Some(Instant::now() + ms(50))).unwrap();

        let mut buf = [0u8; 16];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(MultipathError::is(&err, MultipathError::DeadlineExceeded));

        conn.set_deadline(None).unwrap();
        conn.inner.on_data_frame(FrameNumber::from_raw(1), Bytes::from_static(b"x"));
        assert_eq!(conn.read(&mut buf).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_addresses() {
        let conn = new_conn();
        assert_eq!(conn.local_addr(), MultipathAddr);
        assert_eq!(conn.remote_addr().network(), "multipath");
        assert_eq!(conn.remote_addr().to_string(), "multipath");
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let result = MultipathConn::new(ConnectionId::random(), MultipathConfig {
            send_queue_capacity: 0,
            ..MultipathConfig::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_add_stream_subflow() {
        let conn = new_conn();
        let (local, _remote) = tokio::io::duplex(1024);
        let id = conn.add("10.0.0.1:443", local, SubflowRole::Client, Instant::now(), Arc::new(NullStatsTracker));

        assert_eq!(id, SubflowId(1));
        assert_eq!(conn.num_subflows(), 1);

        conn.remove(id);
        assert!(conn.is_closed());
    }
}
