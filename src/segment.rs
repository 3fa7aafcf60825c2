use crate::error::FramingError;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;
use std::fmt::{Display, Formatter};

/// Maximum payload per segment. This is a wire format constant, not a tunable: the configured
///  payload size may be smaller but never bigger.
pub const MAX_PAYLOAD_LEN: usize = 1400;

/// kind tag + sequence number
pub const HEADER_LEN: usize = 5;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum SegmentKind {
    Data = b'D',
    Ack = b'A',
}

/// One unit of framed data on the wire. DATA segments carry a chunk of application data, ACK
///  segments carry the cumulative acknowledgment in their sequence field and an empty payload.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

impl Segment {
    pub fn data(sequence: u32, payload: Vec<u8>) -> Segment {
        Segment {
            kind: SegmentKind::Data,
            sequence,
            payload,
        }
    }

    pub fn ack(sequence: u32) -> Segment {
        Segment {
            kind: SegmentKind::Ack,
            sequence,
            payload: Vec::new(),
        }
    }

    /// NB: callers must ensure the payload fits [`MAX_PAYLOAD_LEN`] - the sender chunks
    ///      application data accordingly, and ACKs have no payload at all
    pub fn ser(&self, buf: &mut BytesMut) {
        assert!(
            self.payload.len() <= MAX_PAYLOAD_LEN,
            "segment payload of {} bytes exceeds the wire format limit of {}",
            self.payload.len(),
            MAX_PAYLOAD_LEN,
        );

        buf.put_u8(self.kind as u8);
        buf.put_u32(self.sequence);
        buf.put_slice(&self.payload);
    }

    pub fn deser(mut buf: &[u8]) -> Result<Segment, FramingError> {
        if buf.len() < HEADER_LEN {
            return Err(FramingError::Truncated {
                len: buf.len(),
                header_len: HEADER_LEN,
            });
        }

        let kind = SegmentKind::try_from_primitive(buf.get_u8())
            .map_err(|e| FramingError::UnknownKind(e.number))?;
        let sequence = buf.get_u32();

        Ok(Segment {
            kind,
            sequence,
            payload: buf.to_vec(),
        })
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} #{} ({} bytes)", self.kind, self.sequence, self.payload.len())
    }
}
