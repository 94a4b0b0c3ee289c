//! Frames as they are written to a subflow's underlying connection. All numbers are in network
//!  byte order (BE).
//!
//! ```ascii
//! data frame:
//!  0: frame number (u64) - always >= MIN_FRAME_NUMBER
//!  8: payload length (u32)
//! 12: payload
//!
//! control frame:
//!  0: frame number (u64) - always 0, which is what marks a control frame
//!  8: control kind (u8): 1 = ACK
//!  9: acknowledged frame number (u64)
//! ```

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};
use crate::frame::FrameNumber;

pub struct DataFrameHeader {}
impl DataFrameHeader {
    pub const SERIALIZED_LEN: usize = size_of::<u64>() + size_of::<u32>();

    pub fn ser(frame_number: FrameNumber, payload: &[u8], buf: &mut BytesMut) {
        buf.reserve(Self::SERIALIZED_LEN + payload.len());
        buf.put_u64(frame_number.to_raw());
        buf.put_u32(payload.len().try_into().expect("payload length exceeds u32 range"));
        buf.put_slice(payload);
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ControlKind {
    Ack = 1,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum WireFrame {
    Data {
        frame_number: FrameNumber,
        payload: Bytes,
    },
    Ack {
        frame_number: FrameNumber,
    },
}

impl WireFrame {
    pub fn ser(&self, buf: &mut BytesMut) {
        match self {
            WireFrame::Data { frame_number, payload } => {
                DataFrameHeader::ser(*frame_number, payload, buf);
            }
            WireFrame::Ack { frame_number } => {
                buf.put_u64(FrameNumber::CONTROL.to_raw());
                buf.put_u8(ControlKind::Ack.into());
                buf.put_u64(frame_number.to_raw());
            }
        }
    }

    /// Reads a single frame from the stream, waiting until it is complete. A payload length
    ///  beyond `max_payload` is treated as a protocol violation rather than buffered.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R, max_payload: usize) -> anyhow::Result<WireFrame> {
        let frame_number = FrameNumber::from_raw(reader.read_u64().await?);

        if frame_number.is_data() {
            let len = reader.read_u32().await? as usize;
            if len > max_payload {
                bail!("frame {} has a payload of {} bytes, exceeding the maximum of {}", frame_number, len, max_payload);
            }
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;
            return Ok(WireFrame::Data {
                frame_number,
                payload: payload.into(),
            });
        }

        let raw_kind = reader.read_u8().await?;
        match ControlKind::try_from(raw_kind) {
            Ok(ControlKind::Ack) => {
                let acked = FrameNumber::from_raw(reader.read_u64().await?);
                if !acked.is_data() {
                    bail!("ACK for invalid frame number {}", acked);
                }
                Ok(WireFrame::Ack { frame_number: acked })
            }
            Err(_) => Err(anyhow!("unknown control frame kind {}", raw_kind)),
        }
    }
}
