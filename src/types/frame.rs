//! Frame and segment payload types.

use bytes::Bytes;

/// One full sample of every registry variable and joint at one instant.
///
/// Slots `[0, variable_count)` hold variable bit patterns in schema order,
/// slots `[variable_count, variable_count + joint_scalar_count)` hold joint
/// fields. All slots are uniform 8-byte patterns; see
/// [`Value::to_bits`](crate::Value::to_bits).
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Monotonically increasing sequence number.
    pub uid: u64,
    /// Producer timestamp in nanoseconds.
    pub timestamp: i64,
    /// Flat value buffer, one 8-byte pattern per schema slot.
    pub slots: Vec<u64>,
}

impl Frame {
    /// An all-zero frame with the given slot count.
    pub fn zeroed(slot_count: usize) -> Self {
        Self { uid: 0, timestamp: 0, slots: vec![0; slot_count] }
    }
}

/// One transport-sized, independently compressed slice of a frame.
///
/// The union of all segments of one uid covers the frame's variable slots
/// exactly once; joint fields always ride on segment 0, uncompressed.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPayload {
    pub uid: u64,
    pub timestamp: i64,
    /// Index of this segment within the frame, `0 <= segment_index < segment_count`.
    pub segment_index: u32,
    /// Total segments making up the frame.
    pub segment_count: u32,
    /// First variable slot this segment covers.
    pub slot_offset: u32,
    /// Byte length of the variable block before compression.
    pub uncompressed_length: u32,
    /// Compressed variable slot bytes.
    pub variables: Bytes,
    /// Joint field bit patterns; empty unless `segment_index == 0`.
    pub joints: Vec<u64>,
}
