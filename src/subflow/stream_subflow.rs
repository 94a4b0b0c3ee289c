use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};
use crate::config::MultipathConfig;
use crate::connection_id::ConnectionId;
use crate::error::{EnqueueError, MultipathError};
use crate::frame::{FrameNumber, SendFrame};
use crate::subflow::rtt::RttEstimator;
use crate::subflow::{StatsTracker, Subflow, SubflowHost, SubflowId, SubflowRole};
use crate::wire::WireFrame;

/// A subflow over a reliable byte stream, typically a `TcpStream`.
///
/// It runs two tasks: a send loop that writes frames from the outbound queue (and ACKs for
///  received frames) to the stream, and a receive loop that decodes inbound frames. Either loop
///  terminating for whatever reason closes the subflow; the send loop then hands frames that
///  were queued but never written back to the host, and asks the host to remove the subflow.
pub struct StreamSubflow {
    id: SubflowId,
    cid: ConnectionId,
    peer: String,
    role: SubflowRole,
    config: Arc<MultipathConfig>,
    send_queue: mpsc::Sender<Arc<SendFrame>>,
    /// ACKs bypass the bounded frame queue so they are never stuck behind data
    ack_queue: mpsc::UnboundedSender<FrameNumber>,
    closed: watch::Sender<bool>,
    rtt: RttEstimator,
    write_deadline: Mutex<Option<Instant>>,
    stats: Arc<dyn StatsTracker>,
    host: Weak<dyn SubflowHost>,
}

impl StreamSubflow {
    /// Creates the subflow and spawns its send and receive loops. This requires a tokio runtime.
    ///
    /// `probe_start` is the point in time at which setting up the underlying connection started,
    ///  its distance to now serving as the first RTT estimate.
    #[allow(clippy::too_many_arguments)]
    pub fn start<S>(
        id: SubflowId,
        peer: String,
        conn: S,
        role: SubflowRole,
        probe_start: Instant,
        stats: Arc<dyn StatsTracker>,
        config: Arc<MultipathConfig>,
        host: Weak<dyn SubflowHost>,
    ) -> Arc<StreamSubflow>
    where S: AsyncRead + AsyncWrite + Send + Unpin + 'static
    {
        let cid = host.upgrade()
            .map(|h| h.connection_id())
            .unwrap_or_else(|| ConnectionId::from_bytes([0; ConnectionId::LEN]));

        let initial_rtt = Self::initial_rtt(probe_start, config.as_ref());

        let (send_queue, send_rx) = mpsc::channel(config.send_queue_capacity);
        let (ack_queue, ack_rx) = mpsc::unbounded_channel();

        let subflow = Arc::new(StreamSubflow {
            id,
            cid,
            peer,
            role,
            rtt: RttEstimator::new(initial_rtt, config.min_retransmission_timeout, config.max_retransmission_timeout),
            config,
            send_queue,
            ack_queue,
            closed: watch::Sender::new(false),
            write_deadline: Mutex::new(None),
            stats,
            host,
        });
        debug!("connection {}: starting {:?} subflow {} to {} with initial RTT {:?}", subflow.cid, subflow.role, subflow.id, subflow.peer, initial_rtt);

        let (reader, writer) = tokio::io::split(conn);
        tokio::spawn(subflow.clone().send_loop(writer, send_rx, ack_rx));
        tokio::spawn(subflow.clone().recv_loop(reader));

        subflow
    }

    fn initial_rtt(probe_start: Instant, config: &MultipathConfig) -> Duration {
        let probe_duration = Instant::now().saturating_duration_since(probe_start);
        if probe_duration.is_zero() {
            config.initial_rtt
        }
        else {
            probe_duration
        }
    }

    pub fn role(&self) -> SubflowRole {
        self.role
    }

    async fn send_loop<W: AsyncWrite + Unpin + Send>(
        self: Arc<Self>,
        mut writer: W,
        mut send_rx: mpsc::Receiver<Arc<SendFrame>>,
        mut ack_rx: mpsc::UnboundedReceiver<FrameNumber>,
    ) {
        let mut closed = self.closed.subscribe();
        let mut ack_buf = BytesMut::with_capacity(32);

        let result: anyhow::Result<()> = async {
            loop {
                select! {
                    biased;
                    _ = wait_closed(&mut closed) => return Ok(()),
                    Some(frame_number) = ack_rx.recv() => {
                        ack_buf.clear();
                        WireFrame::Ack { frame_number }.ser(&mut ack_buf);
                        trace!("subflow {}: sending ACK for frame {}", self.id, frame_number);
                        self.write_with_deadline(&mut writer, &ack_buf).await?;
                    }
                    Some(frame) = send_rx.recv() => {
                        // taking a frame off the queue frees capacity for a waiting retransmission
                        if let Some(host) = self.host.upgrade() {
                            host.signal_retransmit();
                        }
                        self.transmit(&mut writer, frame).await?;
                    }
                    else => return Ok(()),
                }
            }
        }.await;

        match result {
            Ok(()) => {}
            Err(e) if MultipathError::is(&e, MultipathError::SubflowClosed) => {}
            Err(e) => warn!("connection {}: subflow {} to {} failed to send: {}", self.cid, self.id, self.peer, e),
        }
        self.close();
        let _ = writer.shutdown().await;

        send_rx.close();
        let host = self.host.upgrade();
        let mut num_requeued = 0;
        while let Ok(frame) = send_rx.try_recv() {
            if let Some(host) = &host {
                host.requeue(frame);
                num_requeued += 1;
            }
        }
        if num_requeued > 0 {
            debug!("connection {}: handed {} untransmitted frames of subflow {} back for retransmission", self.cid, num_requeued, self.id);
        }

        if let Some(host) = host {
            host.remove_subflow(self.id);
        }
    }

    async fn transmit<W: AsyncWrite + Unpin>(self: &Arc<Self>, writer: &mut W, frame: Arc<SendFrame>) -> anyhow::Result<()> {
        let Some(encoded) = frame.encoded() else {
            trace!("subflow {}: frame {} was released while queued - skipping", self.id, frame.frame_number());
            return Ok(());
        };

        trace!("subflow {}: transmitting frame {} to {}", self.id, frame.frame_number(), self.peer);
        let frame_number = frame.frame_number();
        if let Some(host) = self.host.upgrade() {
            host.register_pending_ack(frame.clone(), self.clone());
        }

        if let Err(e) = self.write_with_deadline(writer, &encoded).await {
            // the frame may be partially written, which the peer can not use
            self.close();
            if let Some(host) = self.host.upgrade() {
                host.requeue(frame);
            }
            return Err(e);
        }
        self.stats.on_bytes_sent(&self.peer, encoded.len());

        if let Some(host) = self.host.upgrade() {
            host.on_transmitted(frame_number, self.clone());
        }
        Ok(())
    }

    async fn write_with_deadline<W: AsyncWrite + Unpin>(&self, writer: &mut W, data: &[u8]) -> anyhow::Result<()> {
        let deadline = *self.write_deadline.lock().unwrap();
        let mut closed = self.closed.subscribe();

        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        let write_until_closed = async {
            select! {
                result = write => result.map_err(anyhow::Error::from),
                _ = wait_closed(&mut closed) => Err(anyhow::Error::from(MultipathError::SubflowClosed)),
            }
        };

        match deadline {
            Some(deadline) => match timeout_at(deadline, write_until_closed).await {
                Ok(result) => result,
                Err(_) => Err(MultipathError::DeadlineExceeded.into()),
            },
            None => write_until_closed.await,
        }
    }

    async fn recv_loop<R: AsyncRead + Unpin + Send>(self: Arc<Self>, mut reader: R) {
        let mut closed = self.closed.subscribe();

        let result: anyhow::Result<()> = async {
            loop {
                let frame = select! {
                    _ = wait_closed(&mut closed) => return Ok(()),
                    frame = WireFrame::read_from(&mut reader, self.config.max_frame_payload) => frame?,
                };

                let Some(host) = self.host.upgrade() else {
                    debug!("subflow {}: connection is gone - terminating receive loop", self.id);
                    return Ok(());
                };

                match frame {
                    WireFrame::Data { frame_number, payload } => {
                        trace!("subflow {}: received frame {} with {} bytes", self.id, frame_number, payload.len());
                        self.stats.on_bytes_received(&self.peer, payload.len());
                        if host.on_data_frame(frame_number, payload) {
                            let _ = self.ack_queue.send(frame_number);
                        }
                    }
                    WireFrame::Ack { frame_number } => {
                        self.on_ack(host.as_ref(), frame_number);
                    }
                }
            }
        }.await;

        match result {
            Ok(()) => trace!("subflow {}: receive loop terminated", self.id),
            Err(e) => debug!("connection {}: subflow {} to {} failed to receive: {}", self.cid, self.id, self.peer, e),
        }
        self.close();
    }

    fn on_ack(&self, host: &dyn SubflowHost, frame_number: FrameNumber) {
        let Some(entry) = host.on_ack(frame_number) else {
            trace!("subflow {}: ACK for frame {} which is not pending (anymore)", self.id, frame_number);
            return;
        };

        // Karn's rule: the ACK of a retransmitted frame can not be attributed to a specific
        //  transmission, so it yields no RTT sample
        if entry.outbound_subflow.id() == self.id && entry.frame.retransmissions() == 0 {
            let rtt = Instant::now().saturating_duration_since(entry.sent_at);
            self.rtt.on_sample(rtt);
            self.stats.on_rtt_sample(&self.peer, rtt);
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|&c| c).await;
}

#[async_trait]
impl Subflow for StreamSubflow {
    fn id(&self) -> SubflowId {
        self.id
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }

    fn try_enqueue(&self, frame: Arc<SendFrame>) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.send_queue.try_send(frame)
            .map_err(|e| match e {
                TrySendError::Full(_) => EnqueueError::Full,
                TrySendError::Closed(_) => EnqueueError::Closed,
            })
    }

    async fn enqueue(&self, frame: Arc<SendFrame>) -> Result<(), EnqueueError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(EnqueueError::Closed);
        }

        select! {
            result = self.send_queue.send(frame) => result.map_err(|_| EnqueueError::Closed),
            _ = wait_closed(&mut closed) => Err(EnqueueError::Closed),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn rtt(&self) -> Duration {
        self.rtt.rtt()
    }

    fn retransmission_timeout(&self) -> Duration {
        self.rtt.retransmission_timeout()
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
        if !self.closed.send_replace(true) {
            debug!("connection {}: closing subflow {} to {}", self.cid, self.id, self.peer);
        }
    }
}
