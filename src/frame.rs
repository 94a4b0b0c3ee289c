use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use bytes::{Bytes, BytesMut};
use crate::buffer_pool::FrameBufferPool;
use crate::wire::DataFrameHeader;

/// Frame numbers are assigned per connection, strictly increasing, and never reused. They start
///  at [MIN_FRAME_NUMBER]; the value 0 is reserved for control frames on the wire, so a frame
///  number below [MIN_FRAME_NUMBER] is never pending acknowledgement.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FrameNumber(u64);

pub const MIN_FRAME_NUMBER: FrameNumber = FrameNumber(1);

impl FrameNumber {
    pub const CONTROL: FrameNumber = FrameNumber(0);

    pub const fn from_raw(raw: u64) -> FrameNumber {
        FrameNumber(raw)
    }

    pub fn to_raw(self) -> u64 {
        self.0
    }

    pub fn is_data(self) -> bool {
        self >= MIN_FRAME_NUMBER
    }

    /// returns the frame number `n` steps after this one, saturating rather than wrapping
    pub fn plus(self, n: u64) -> FrameNumber {
        FrameNumber(self.0.saturating_add(n))
    }
}

impl Debug for FrameNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}
impl Display for FrameNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// A data frame on the sending side. It is created by the connection when application data is
///  written, and shared (as `Arc<SendFrame>`) between the outbound queues of the subflows it is
///  (re)sent on and the pending acknowledgement bookkeeping.
///
/// The connection alone decides when the frame's buffer is released: once the frame is
///  acknowledged, or the connection is closed. A subflow never releases a frame.
pub struct SendFrame {
    frame_number: FrameNumber,
    payload_len: usize,
    /// the fully encoded frame, header included; `None` after release
    encoded: Mutex<Option<BytesMut>>,
    pool: Arc<FrameBufferPool>,
    retransmissions: AtomicU32,
    being_retransmitted: AtomicBool,
}

impl Debug for SendFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendFrame")
            .field("frame_number", &self.frame_number)
            .field("payload_len", &self.payload_len)
            .field("retransmissions", &self.retransmissions())
            .field("released", &self.is_released())
            .finish()
    }
}

impl SendFrame {
    pub fn compose(frame_number: FrameNumber, payload: &[u8], pool: Arc<FrameBufferPool>) -> SendFrame {
        debug_assert!(frame_number.is_data());

        let mut buf = pool.take(DataFrameHeader::SERIALIZED_LEN + payload.len());
        DataFrameHeader::ser(frame_number, payload, &mut buf);

        SendFrame {
            frame_number,
            payload_len: payload.len(),
            encoded: Mutex::new(Some(buf)),
            pool,
            retransmissions: AtomicU32::new(0),
            being_retransmitted: AtomicBool::new(false),
        }
    }

    pub fn frame_number(&self) -> FrameNumber {
        self.frame_number
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// A copy of the encoded frame, ready to be written to a subflow's connection - or `None` if
    ///  the frame was released in the meantime, in which case there is no point in sending it.
    pub fn encoded(&self) -> Option<Bytes> {
        self.encoded.lock().unwrap()
            .as_ref()
            .map(|buf| Bytes::copy_from_slice(buf))
    }

    pub fn retransmissions(&self) -> u32 {
        self.retransmissions.load(Ordering::Acquire)
    }

    pub(crate) fn increment_retransmissions(&self) -> u32 {
        self.retransmissions.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_being_retransmitted(&self) -> bool {
        self.being_retransmitted.load(Ordering::Acquire)
    }

    /// Atomically marks the frame as being retransmitted. Returns `false` if it already was,
    ///  i.e. if some other task is currently retransmitting it.
    #[must_use]
    pub(crate) fn try_start_retransmission(&self) -> bool {
        self.being_retransmitted.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    pub(crate) fn finish_retransmission(&self) {
        self.being_retransmitted.store(false, Ordering::Release);
    }

    pub fn is_released(&self) -> bool {
        self.encoded.lock().unwrap().is_none()
    }

    /// Returns the frame's buffer to the pool. This is safe to call several times - only the
    ///  first call has an effect.
    pub fn release(&self) {
        let buf = self.encoded.lock().unwrap().take();
        if let Some(buf) = buf {
            self.pool.give_back(buf);
        }
    }
}

/// Clears a frame's 'being retransmitted' flag when it goes out of scope, so that the flag is
///  reset on every exit path of a retransmission, including cancellation of the task
pub(crate) struct RetransmissionGuard<'a>(pub &'a SendFrame);

impl Drop for RetransmissionGuard<'_> {
    fn drop(&mut self) {
        self.0.finish_retransmission();
    }
}
