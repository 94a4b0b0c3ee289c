use std::sync::Mutex;
use bytes::BytesMut;
use tracing::{debug, trace};

/// Buffers for encoded frames. A frame takes its buffer when it is composed and gives it back
///  when it is released after its last possible (re)transmission.
///
/// The pool keeps at most `max_pooled` idle buffers. Buffers that grew far beyond the default
///  size for an unusually large frame are dropped rather than kept around.
pub struct FrameBufferPool {
    default_capacity: usize,
    max_retained_capacity: usize,
    max_pooled: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl FrameBufferPool {
    pub fn new(default_capacity: usize, max_pooled: usize) -> FrameBufferPool {
        FrameBufferPool {
            default_capacity,
            max_retained_capacity: default_capacity.saturating_mul(4),
            max_pooled,
            free: Mutex::new(Vec::new()),
        }
    }

    /// An empty buffer with room for at least `len` bytes
    pub fn take(&self, len: usize) -> BytesMut {
        let pooled = self.free.lock().unwrap().pop();
        match pooled {
            Some(mut buf) => {
                buf.reserve(len);
                buf
            }
            None => {
                trace!("no idle frame buffer - allocating");
                BytesMut::with_capacity(len.max(self.default_capacity))
            }
        }
    }

    pub fn give_back(&self, mut buf: BytesMut) {
        if buf.capacity() > self.max_retained_capacity {
            trace!("dropping oversized frame buffer of {} bytes", buf.capacity());
            return;
        }
        buf.clear();

        let mut free = self.free.lock().unwrap();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
        else {
            debug!("{} idle frame buffers already - dropping returned buffer", free.len());
        }
    }

    pub fn num_pooled(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
