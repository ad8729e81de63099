//! Wire frame encoding.
//!
//! Every frame is one length-delimited unit (the length prefix is handled by
//! `tokio_util::codec::LengthDelimitedCodec`) starting with a one-byte kind
//! tag. Data frames carry the segment header fields, the compressed variable
//! block length, the block itself, then the uncompressed joint bit patterns.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::types::SegmentPayload;
use crate::{Result, StreamError};

const TAG_HANDSHAKE: u8 = 1;
const TAG_COMMAND: u8 = 2;
const TAG_DATA: u8 = 3;
const TAG_PING: u8 = 4;
const TAG_PONG: u8 = 5;
const TAG_CLOSE: u8 = 6;
const TAG_VAR_CHANGE: u8 = 7;

/// Framing overhead of a data frame at zero payload: length prefix (4), kind
/// tag (1), segment header (uid 8 + timestamp 8 + index 4 + count 4 + slot
/// offset 4 + uncompressed length 4 + block length 4).
pub(crate) const DATA_FRAME_OVERHEAD: usize = 4 + 1 + 36;

/// UDP timestamp datagram: magic + timestamp.
pub(crate) const TIMESTAMP_MAGIC: u32 = u32::from_le_bytes(*b"VSTS");
pub(crate) const TIMESTAMP_DATAGRAM_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WireFrame {
    Handshake(Bytes),
    Command(String),
    Data(SegmentPayload),
    Ping,
    Pong,
    Close(Option<u32>),
    VarChange { slot: u32, value: f64 },
}

impl WireFrame {
    pub(crate) fn encode(&self) -> Bytes {
        match self {
            WireFrame::Handshake(blob) => {
                let mut buf = BytesMut::with_capacity(1 + blob.len());
                buf.put_u8(TAG_HANDSHAKE);
                buf.put_slice(blob);
                buf.freeze()
            }
            WireFrame::Command(text) => {
                let mut buf = BytesMut::with_capacity(1 + text.len());
                buf.put_u8(TAG_COMMAND);
                buf.put_slice(text.as_bytes());
                buf.freeze()
            }
            WireFrame::Data(payload) => {
                let mut buf = BytesMut::with_capacity(
                    1 + 36 + payload.variables.len() + payload.joints.len() * 8,
                );
                buf.put_u8(TAG_DATA);
                buf.put_u64_le(payload.uid);
                buf.put_i64_le(payload.timestamp);
                buf.put_u32_le(payload.segment_index);
                buf.put_u32_le(payload.segment_count);
                buf.put_u32_le(payload.slot_offset);
                buf.put_u32_le(payload.uncompressed_length);
                buf.put_u32_le(payload.variables.len() as u32);
                buf.put_slice(&payload.variables);
                for bits in &payload.joints {
                    buf.put_u64_le(*bits);
                }
                buf.freeze()
            }
            WireFrame::Ping => Bytes::from_static(&[TAG_PING]),
            WireFrame::Pong => Bytes::from_static(&[TAG_PONG]),
            WireFrame::Close(reason) => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8(TAG_CLOSE);
                if let Some(code) = reason {
                    buf.put_u32_le(*code);
                }
                buf.freeze()
            }
            WireFrame::VarChange { slot, value } => {
                let mut buf = BytesMut::with_capacity(13);
                buf.put_u8(TAG_VAR_CHANGE);
                buf.put_u32_le(*slot);
                buf.put_f64_le(*value);
                buf.freeze()
            }
        }
    }

    pub(crate) fn decode(mut frame: Bytes) -> Result<WireFrame> {
        if frame.is_empty() {
            return Err(StreamError::decode("empty wire frame"));
        }
        let tag = frame.get_u8();
        match tag {
            TAG_HANDSHAKE => Ok(WireFrame::Handshake(frame)),
            TAG_COMMAND => {
                let text = std::str::from_utf8(&frame)
                    .map_err(|_| StreamError::decode("command frame is not UTF-8"))?;
                Ok(WireFrame::Command(text.to_string()))
            }
            TAG_DATA => {
                if frame.remaining() < 36 {
                    return Err(StreamError::decode("data frame shorter than its header"));
                }
                let uid = frame.get_u64_le();
                let timestamp = frame.get_i64_le();
                let segment_index = frame.get_u32_le();
                let segment_count = frame.get_u32_le();
                let slot_offset = frame.get_u32_le();
                let uncompressed_length = frame.get_u32_le();
                let block_len = frame.get_u32_le() as usize;
                if frame.remaining() < block_len {
                    return Err(StreamError::decode(format!(
                        "data frame declares a {block_len} byte block, {} remain",
                        frame.remaining()
                    )));
                }
                let variables = frame.split_to(block_len);
                if frame.remaining() % 8 != 0 {
                    return Err(StreamError::decode(format!(
                        "joint block of {} bytes is not slot-aligned",
                        frame.remaining()
                    )));
                }
                let mut joints = Vec::with_capacity(frame.remaining() / 8);
                while frame.has_remaining() {
                    joints.push(frame.get_u64_le());
                }
                Ok(WireFrame::Data(SegmentPayload {
                    uid,
                    timestamp,
                    segment_index,
                    segment_count,
                    slot_offset,
                    uncompressed_length,
                    variables,
                    joints,
                }))
            }
            TAG_PING => Ok(WireFrame::Ping),
            TAG_PONG => Ok(WireFrame::Pong),
            TAG_CLOSE => {
                if frame.remaining() >= 4 {
                    Ok(WireFrame::Close(Some(frame.get_u32_le())))
                } else {
                    Ok(WireFrame::Close(None))
                }
            }
            TAG_VAR_CHANGE => {
                if frame.remaining() < 12 {
                    return Err(StreamError::decode("variable change frame too short"));
                }
                let slot = frame.get_u32_le();
                let value = frame.get_f64_le();
                Ok(WireFrame::VarChange { slot, value })
            }
            other => Err(StreamError::decode(format!("unknown wire frame tag {other}"))),
        }
    }
}

/// Encode one timestamp push datagram.
pub(crate) fn encode_timestamp_datagram(timestamp: i64) -> [u8; TIMESTAMP_DATAGRAM_LEN] {
    let mut datagram = [0u8; TIMESTAMP_DATAGRAM_LEN];
    datagram[..4].copy_from_slice(&TIMESTAMP_MAGIC.to_le_bytes());
    datagram[4..].copy_from_slice(&timestamp.to_le_bytes());
    datagram
}

/// Decode a timestamp push datagram, ignoring foreign traffic.
pub(crate) fn decode_timestamp_datagram(datagram: &[u8]) -> Option<i64> {
    if datagram.len() != TIMESTAMP_DATAGRAM_LEN {
        return None;
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&datagram[..4]);
    if u32::from_le_bytes(magic) != TIMESTAMP_MAGIC {
        return None;
    }
    let mut timestamp = [0u8; 8];
    timestamp.copy_from_slice(&datagram[4..]);
    Some(i64::from_le_bytes(timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: WireFrame) {
        let encoded = frame.encode();
        assert_eq!(WireFrame::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn control_frames_round_trip() {
        round_trip(WireFrame::Ping);
        round_trip(WireFrame::Pong);
        round_trip(WireFrame::Close(None));
        round_trip(WireFrame::Close(Some(2)));
        round_trip(WireFrame::Command("SEND_TIMESTAMPS 51000".to_string()));
        round_trip(WireFrame::Handshake(Bytes::from_static(b"blobbytes")));
        round_trip(WireFrame::VarChange { slot: 17, value: -0.75 });
    }

    #[test]
    fn data_frame_round_trips() {
        round_trip(WireFrame::Data(SegmentPayload {
            uid: 901,
            timestamp: -5,
            segment_index: 2,
            segment_count: 5,
            slot_offset: 1000,
            uncompressed_length: 4096,
            variables: Bytes::from(vec![7u8; 300]),
            joints: vec![1, u64::MAX, 0],
        }));
    }

    #[test]
    fn data_frame_overhead_matches_layout() {
        let payload = SegmentPayload {
            uid: 0,
            timestamp: 0,
            segment_index: 0,
            segment_count: 1,
            slot_offset: 0,
            uncompressed_length: 0,
            variables: Bytes::new(),
            joints: Vec::new(),
        };
        let encoded = WireFrame::Data(payload).encode();
        // Plus the codec's 4-byte length prefix on the wire.
        assert_eq!(encoded.len() + 4, DATA_FRAME_OVERHEAD);
    }

    #[test]
    fn truncated_data_frame_is_decode_error() {
        let frame = WireFrame::Data(SegmentPayload {
            uid: 1,
            timestamp: 2,
            segment_index: 0,
            segment_count: 1,
            slot_offset: 0,
            uncompressed_length: 64,
            variables: Bytes::from(vec![0u8; 64]),
            joints: vec![5],
        });
        let encoded = frame.encode();
        for len in 1..36 {
            let err = WireFrame::decode(encoded.slice(..len)).unwrap_err();
            assert!(matches!(err, StreamError::Decode { .. }), "length {len}");
        }
    }

    #[test]
    fn unknown_tag_is_decode_error() {
        let err = WireFrame::decode(Bytes::from_static(&[200, 1, 2])).unwrap_err();
        assert!(matches!(err, StreamError::Decode { .. }));
    }

    #[test]
    fn timestamp_datagram_round_trips() {
        let datagram = encode_timestamp_datagram(-42);
        assert_eq!(decode_timestamp_datagram(&datagram), Some(-42));
        assert_eq!(decode_timestamp_datagram(&datagram[..8]), None);

        let mut foreign = datagram;
        foreign[0] = b'x';
        assert_eq!(decode_timestamp_datagram(&foreign), None);
    }
}
