use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use bytes::{Buf, Bytes};
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};
use crate::error::MultipathError;
use crate::frame::{FrameNumber, MIN_FRAME_NUMBER};

struct ReceiveQueueInner {
    /// the frame number the stream continues with, i.e. the lowest frame number that was not
    ///  moved to `ready` yet
    next_frame_number: FrameNumber,
    /// frames that arrived ahead of `next_frame_number`
    out_of_order: BTreeMap<FrameNumber, Bytes>,
    /// contiguous data that can be handed to a reader, the front chunk possibly partially consumed
    ready: VecDeque<Bytes>,
    closed: bool,
    read_deadline: Option<Instant>,
}

impl ReceiveQueueInner {
    fn move_contiguous_to_ready(&mut self) {
        while let Some(payload) = self.out_of_order.remove(&self.next_frame_number) {
            if !payload.is_empty() {
                self.ready.push_back(payload);
            }
            self.next_frame_number = self.next_frame_number.plus(1);
        }
    }

    fn read_ready(&mut self, buf: &mut [u8]) -> usize {
        let mut num_read = 0;
        while num_read < buf.len() {
            let Some(chunk) = self.ready.front_mut() else {
                break;
            };
            let n = chunk.len().min(buf.len() - num_read);
            buf[num_read..num_read+n].copy_from_slice(&chunk[..n]);
            chunk.advance(n);
            num_read += n;
            if chunk.is_empty() {
                self.ready.pop_front();
            }
        }
        num_read
    }
}

/// Reorders frames arriving on any of a connection's subflows into the connection's byte stream.
///
/// Frames are keyed by frame number. The queue holds at most `capacity` frames, counting both
///  frames waiting for a gap to be filled and frames the application has not read yet. Frames
///  beyond that window are rejected so they are not acknowledged, and the peer retransmits them
///  later.
pub struct ReceiveQueue {
    capacity: u64,
    inner: Mutex<ReceiveQueueInner>,
    /// bumped on every change that may unblock a reader
    changes: watch::Sender<u64>,
}

impl ReceiveQueue {
    pub fn new(capacity: usize) -> ReceiveQueue {
        ReceiveQueue {
            capacity: capacity as u64,
            inner: Mutex::new(ReceiveQueueInner {
                next_frame_number: MIN_FRAME_NUMBER,
                out_of_order: BTreeMap::new(),
                ready: VecDeque::new(),
                closed: false,
                read_deadline: None,
            }),
            changes: watch::Sender::new(0),
        }
    }

    fn notify_readers(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Returns `true` if the frame was accepted, i.e. it should be acknowledged to the sender.
    ///  Duplicates of frames that were accepted before count as accepted.
    pub fn add(&self, frame_number: FrameNumber, payload: Bytes) -> bool {
        if !frame_number.is_data() {
            debug!("received frame with invalid frame number {} - dropping", frame_number);
            return false;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            trace!("receive queue is closed - dropping frame {}", frame_number);
            return false;
        }

        if frame_number < inner.next_frame_number || inner.out_of_order.contains_key(&frame_number) {
            trace!("duplicate frame {} - ignoring", frame_number);
            return true;
        }
        let window = self.capacity.saturating_sub(inner.ready.len() as u64);
        if frame_number >= inner.next_frame_number.plus(window) {
            debug!("frame {} is beyond the receive window of {} frames starting at {} - dropping", frame_number, window, inner.next_frame_number);
            return false;
        }

        inner.out_of_order.insert(frame_number, payload);
        let prev_next = inner.next_frame_number;
        inner.move_contiguous_to_ready();
        let progressed = inner.next_frame_number != prev_next;
        drop(inner);

        if progressed {
            self.notify_readers();
        }
        true
    }

    /// Reads contiguous data, waiting until some is available. Returns `Ok(0)` at the end of the
    ///  stream, i.e. when the queue is closed and all buffered data was read.
    pub async fn read(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut changes = self.changes.subscribe();
        loop {
            changes.borrow_and_update();

            let deadline = {
                let mut inner = self.inner.lock().unwrap();
                let num_read = inner.read_ready(buf);
                if num_read > 0 {
                    return Ok(num_read);
                }
                if inner.closed {
                    return Ok(0);
                }
                inner.read_deadline
            };

            match deadline {
                Some(deadline) => {
                    if deadline <= Instant::now() {
                        return Err(MultipathError::DeadlineExceeded.into());
                    }
                    // a timeout is re-checked at the top of the loop: the deadline may have been
                    //  changed in the meantime
                    let _ = timeout_at(deadline, changes.changed()).await;
                }
                None => {
                    let _ = changes.changed().await;
                }
            }
        }
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.lock().unwrap().read_deadline = deadline;
        self.notify_readers();
    }

    pub fn close(&self) {
        let was_closed = std::mem::replace(&mut self.inner.lock().unwrap().closed, true);
        if !was_closed {
            debug!("closing receive queue");
        }
        self.notify_readers();
    }

    pub fn next_frame_number(&self) -> FrameNumber {
        self.inner.lock().unwrap().next_frame_number
    }

    pub fn num_buffered_frames(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.out_of_order.len() + inner.ready.len()
    }
}
