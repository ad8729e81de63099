//! Segment decoding and frame reassembly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::SLOT_BYTES;
use crate::codec::CompressionCodec;
use crate::schema::Schema;
use crate::types::{Frame, SegmentPayload};
use crate::{Result, StreamError};

/// One decoded segment: the variable slots it carried, plus joints if it was
/// segment 0.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSegment {
    pub uid: u64,
    pub timestamp: i64,
    pub segment_index: u32,
    pub segment_count: u32,
    /// First variable slot covered by `variables`.
    pub slot_offset: u32,
    /// Decompressed variable slot patterns.
    pub variables: Vec<u64>,
    /// Joint slot patterns; non-empty only on segment 0.
    pub joints: Vec<u64>,
}

/// Inverse of [`FrameEncoder`](super::FrameEncoder): decompresses one payload
/// and checks it against the schema.
///
/// The decoder needs only the schema and codec, not the sender's segment
/// plan: every payload names its own slot offset, so a consumer reassembles
/// correctly regardless of how the producer chose to split.
pub struct FrameDecoder<C: CompressionCodec> {
    schema: Arc<Schema>,
    codec: C,
}

impl<C: CompressionCodec> FrameDecoder<C> {
    pub fn new(schema: Arc<Schema>, codec: C) -> Self {
        Self { schema, codec }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Decode one received payload.
    ///
    /// A corrupt or mis-sized payload is a [`StreamError::Decode`]: the caller
    /// drops the segment (marking the frame incomplete) and streaming
    /// continues.
    pub fn decode(&self, payload: &SegmentPayload) -> Result<DecodedSegment> {
        if payload.segment_count == 0 {
            return Err(StreamError::decode("segment count of zero"));
        }
        if payload.segment_index >= payload.segment_count {
            return Err(StreamError::decode(format!(
                "segment index {} out of range for {} segments",
                payload.segment_index, payload.segment_count
            )));
        }

        let expected = payload.uncompressed_length as usize;
        if expected % SLOT_BYTES != 0 {
            return Err(StreamError::decode(format!(
                "uncompressed length {expected} is not slot-aligned"
            )));
        }
        let slot_count = expected / SLOT_BYTES;
        let offset = payload.slot_offset as usize;
        if offset + slot_count > self.schema.variable_count() {
            return Err(StreamError::decode(format!(
                "slots {offset}..{} exceed the schema's {} variables",
                offset + slot_count,
                self.schema.variable_count()
            )));
        }

        let staging = self.codec.decompress(&payload.variables, expected)?;
        if staging.len() != expected {
            return Err(StreamError::decode(format!(
                "decompressed {} bytes, expected {expected}",
                staging.len()
            )));
        }
        let mut variables = Vec::with_capacity(slot_count);
        for chunk in staging.chunks_exact(SLOT_BYTES) {
            let mut bytes = [0u8; SLOT_BYTES];
            bytes.copy_from_slice(chunk);
            variables.push(u64::from_le_bytes(bytes));
        }

        if payload.segment_index == 0 {
            if payload.joints.len() != self.schema.joint_scalar_count() {
                return Err(StreamError::decode(format!(
                    "segment 0 carries {} joint scalars, schema expects {}",
                    payload.joints.len(),
                    self.schema.joint_scalar_count()
                )));
            }
        } else if !payload.joints.is_empty() {
            return Err(StreamError::decode(format!(
                "segment {} must not carry joint data",
                payload.segment_index
            )));
        }

        Ok(DecodedSegment {
            uid: payload.uid,
            timestamp: payload.timestamp,
            segment_index: payload.segment_index,
            segment_count: payload.segment_count,
            slot_offset: payload.slot_offset,
            variables,
            joints: payload.joints.clone(),
        })
    }
}

/// Bound on partial frames held while waiting for their remaining segments.
///
/// Whether an incomplete multi-segment frame may wait forever is a policy
/// choice, not protocol behavior: `max_pending` caps the number of frames
/// under assembly (the oldest is dropped beyond it), `max_age` optionally
/// drops stragglers by wall-clock age. Dropping never blocks newer frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyPolicy {
    /// Maximum frames buffered while incomplete.
    pub max_pending: usize,
    /// Drop incomplete frames older than this, if set.
    pub max_age: Option<Duration>,
}

impl Default for ReassemblyPolicy {
    fn default() -> Self {
        Self { max_pending: 16, max_age: None }
    }
}

struct PendingFrame {
    slots: Vec<u64>,
    received: Vec<bool>,
    received_count: usize,
    timestamp: i64,
    started: Instant,
}

/// Buffers decoded segments keyed by uid and releases exactly one completed
/// frame per uid once every `segment_index` in `[0, segment_count)` has
/// arrived, regardless of arrival order.
pub struct FrameAssembler {
    schema: Arc<Schema>,
    policy: ReassemblyPolicy,
    pending: HashMap<u64, PendingFrame>,
}

impl FrameAssembler {
    pub fn new(schema: Arc<Schema>, policy: ReassemblyPolicy) -> Self {
        Self { schema, policy, pending: HashMap::new() }
    }

    /// Number of frames currently under assembly.
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// Offer one decoded segment; returns the completed frame when this was
    /// the last missing piece. Inconsistent or duplicate segments are dropped
    /// with a warning; they never abort the stream.
    pub fn offer(&mut self, segment: DecodedSegment) -> Option<Frame> {
        self.expire_stale();

        let uid = segment.uid;
        let slot_count = self.schema.slot_count();
        let segment_count = segment.segment_count as usize;

        let entry = self.pending.entry(uid).or_insert_with(|| PendingFrame {
            slots: vec![0; slot_count],
            received: vec![false; segment_count],
            received_count: 0,
            timestamp: segment.timestamp,
            started: Instant::now(),
        });

        if entry.received.len() != segment_count {
            warn!(
                uid,
                declared = segment_count,
                expected = entry.received.len(),
                "segment disagrees about the frame's segment count, dropping"
            );
            return None;
        }
        let index = segment.segment_index as usize;
        if entry.received[index] {
            debug!(uid, segment = index, "duplicate segment ignored");
            return None;
        }

        let offset = segment.slot_offset as usize;
        entry.slots[offset..offset + segment.variables.len()]
            .copy_from_slice(&segment.variables);
        if segment.segment_index == 0 {
            let joint_start = self.schema.variable_count();
            entry.slots[joint_start..].copy_from_slice(&segment.joints);
        }
        entry.received[index] = true;
        entry.received_count += 1;

        if entry.received_count == segment_count {
            if let Some(done) = self.pending.remove(&uid) {
                return Some(Frame { uid, timestamp: done.timestamp, slots: done.slots });
            }
        }

        self.enforce_capacity(uid);
        None
    }

    fn expire_stale(&mut self) {
        let Some(max_age) = self.policy.max_age else { return };
        let now = Instant::now();
        self.pending.retain(|uid, entry| {
            let keep = now.duration_since(entry.started) <= max_age;
            if !keep {
                warn!(uid, "dropping incomplete frame past its reassembly deadline");
            }
            keep
        });
    }

    fn enforce_capacity(&mut self, just_inserted: u64) {
        while self.pending.len() > self.policy.max_pending {
            // Evict the longest-waiting incomplete frame, never the one the
            // current segment belongs to.
            let oldest = self
                .pending
                .iter()
                .filter(|&(&uid, _)| uid != just_inserted)
                .min_by_key(|(_, entry)| entry.started)
                .map(|(&uid, _)| uid);
            match oldest {
                Some(uid) => {
                    self.pending.remove(&uid);
                    warn!(uid, "dropping incomplete frame, reassembly buffer full");
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{IdentityCodec, Lz4Codec};
    use crate::registry::{NodeId, RegistryTree};
    use crate::segment::{FrameEncoder, SEGMENT_HEADER_LEN, SegmentPlan};
    use crate::types::{JointDescriptor, JointKind, JointState, Value, VariableDescriptor, VariableKind};

    fn fixture<C: CompressionCodec + Clone>(
        variables: usize,
        joints: &[JointDescriptor],
        limit: usize,
        codec: C,
    ) -> (FrameEncoder<C>, FrameDecoder<C>, FrameAssembler) {
        let mut tree = RegistryTree::new("root");
        for i in 0..variables {
            let descriptor = match i % 4 {
                0 => VariableDescriptor::new(format!("v{i}"), VariableKind::Double),
                1 => VariableDescriptor::new(format!("v{i}"), VariableKind::Integer),
                2 => VariableDescriptor::new(format!("v{i}"), VariableKind::Boolean),
                _ => VariableDescriptor::new(format!("v{i}"), VariableKind::Long),
            };
            tree.add_variable(NodeId::ROOT, descriptor).unwrap();
        }
        let schema = Schema::from_tree(&tree, joints, 0.001).unwrap();
        let plan = SegmentPlan::for_schema(&schema, SEGMENT_HEADER_LEN, limit, &codec).unwrap();
        let encoder = FrameEncoder::new(schema.clone(), plan, codec.clone());
        let decoder = FrameDecoder::new(schema.clone(), codec);
        let assembler = FrameAssembler::new(schema, ReassemblyPolicy::default());
        (encoder, decoder, assembler)
    }

    fn populated_frame<C: CompressionCodec>(encoder: &FrameEncoder<C>, uid: u64) -> Frame {
        let schema = encoder.schema().clone();
        let mut store = schema.new_store();
        for slot in 0..schema.variable_count() {
            let value = match schema.variables()[slot].descriptor.kind {
                VariableKind::Double => Value::Double(slot as f64 * 0.5 - 3.0),
                VariableKind::Integer => Value::Integer(slot as i32 - 7),
                VariableKind::Boolean => Value::Boolean(slot % 2 == 0),
                VariableKind::Long => Value::Long(-(slot as i64) * 1_000_000),
                VariableKind::Enum => Value::Enum(slot as u32 % 3),
            };
            store.set(slot, value).unwrap();
        }
        let mut joint_states = schema.new_joint_states();
        for (i, joint) in schema.joints().iter().enumerate() {
            let state = match joint.descriptor.kind {
                JointKind::OneDoF => {
                    JointState::OneDoF { position: i as f64, velocity: -(i as f64) }
                }
                JointKind::SixDoF => JointState::SixDoF {
                    rotation: [0.1, 0.2, 0.3, 0.9],
                    translation: [i as f64, 0.0, 1.0],
                    angular_velocity: [0.0, 0.5, 0.0],
                    linear_velocity: [1.0, 2.0, 3.0],
                },
            };
            joint_states.set(i, state).unwrap();
        }
        encoder.pack(uid, uid as i64 * 1000, &store, &joint_states).unwrap()
    }

    #[test]
    fn round_trip_single_segment() {
        let joints = vec![JointDescriptor::new("pelvis", JointKind::SixDoF)];
        let (encoder, decoder, mut assembler) = fixture(10, &joints, 65_000, IdentityCodec);
        let frame = populated_frame(&encoder, 1);

        let payloads = encoder.encode(&frame).unwrap();
        assert_eq!(payloads.len(), 1);
        let restored = assembler.offer(decoder.decode(&payloads[0]).unwrap()).unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn round_trip_one_variable() {
        let (encoder, decoder, mut assembler) = fixture(1, &[], 65_000, IdentityCodec);
        let frame = populated_frame(&encoder, 2);
        let payloads = encoder.encode(&frame).unwrap();
        assert_eq!(payloads.len(), 1);
        let restored = assembler.offer(decoder.decode(&payloads[0]).unwrap()).unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn round_trip_multi_segment_out_of_order() {
        let joints = vec![JointDescriptor::new("knee", JointKind::OneDoF)];
        let (encoder, decoder, mut assembler) = fixture(500, &joints, 600, IdentityCodec);
        let frame = populated_frame(&encoder, 42);

        let mut payloads = encoder.encode(&frame).unwrap();
        assert!(payloads.len() > 2);
        payloads.reverse();

        let mut completed = Vec::new();
        for payload in &payloads {
            if let Some(done) = assembler.offer(decoder.decode(payload).unwrap()) {
                completed.push(done);
            }
        }
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0], frame);
        assert_eq!(assembler.pending_frames(), 0);
    }

    #[test]
    fn round_trip_lz4_many_segments() {
        let (encoder, decoder, mut assembler) = fixture(4000, &[], 1000, Lz4Codec);
        let frame = populated_frame(&encoder, 9);

        let payloads = encoder.encode(&frame).unwrap();
        assert!(payloads.len() > 1);
        let mut restored = None;
        for payload in &payloads {
            if let Some(done) = assembler.offer(decoder.decode(payload).unwrap()) {
                restored = Some(done);
            }
        }
        assert_eq!(restored.unwrap(), frame);
    }

    #[test]
    fn interleaved_uids_complete_independently() {
        let (encoder, decoder, mut assembler) = fixture(300, &[], 600, IdentityCodec);
        let frame_a = populated_frame(&encoder, 1);
        let frame_b = populated_frame(&encoder, 2);
        let payloads_a = encoder.encode(&frame_a).unwrap();
        let payloads_b = encoder.encode(&frame_b).unwrap();

        let mut completed = Vec::new();
        for (a, b) in payloads_a.iter().zip(&payloads_b) {
            if let Some(done) = assembler.offer(decoder.decode(a).unwrap()) {
                completed.push(done);
            }
            if let Some(done) = assembler.offer(decoder.decode(b).unwrap()) {
                completed.push(done);
            }
        }
        assert_eq!(completed.len(), 2);
        assert!(completed.iter().any(|f| f.uid == 1));
        assert!(completed.iter().any(|f| f.uid == 2));
    }

    #[test]
    fn duplicate_segment_is_ignored() {
        let (encoder, decoder, mut assembler) = fixture(300, &[], 600, IdentityCodec);
        let frame = populated_frame(&encoder, 5);
        let payloads = encoder.encode(&frame).unwrap();

        assert!(assembler.offer(decoder.decode(&payloads[0]).unwrap()).is_none());
        assert!(assembler.offer(decoder.decode(&payloads[0]).unwrap()).is_none());
        assert_eq!(assembler.pending_frames(), 1);
    }

    #[test]
    fn corrupt_block_drops_segment_not_stream() {
        let (encoder, decoder, _) = fixture(100, &[], 65_000, Lz4Codec);
        let frame = populated_frame(&encoder, 3);
        let mut payloads = encoder.encode(&frame).unwrap();

        payloads[0].variables = bytes::Bytes::from(vec![0u8; 4]);
        let err = decoder.decode(&payloads[0]).unwrap_err();
        assert!(matches!(err, StreamError::Decode { .. }));

        // The decoder is still usable for the next, intact payload.
        let payloads = encoder.encode(&frame).unwrap();
        assert!(decoder.decode(&payloads[0]).is_ok());
    }

    #[test]
    fn out_of_range_slot_offset_is_rejected() {
        let (encoder, decoder, _) = fixture(100, &[], 65_000, IdentityCodec);
        let frame = populated_frame(&encoder, 3);
        let mut payloads = encoder.encode(&frame).unwrap();
        payloads[0].slot_offset = 50; // 50 + 100 slots > 100 variables
        let err = decoder.decode(&payloads[0]).unwrap_err();
        assert!(matches!(err, StreamError::Decode { .. }));
    }

    #[test]
    fn pending_overflow_drops_oldest() {
        let (encoder, decoder, _) = fixture(300, &[], 600, IdentityCodec);
        let schema = encoder.schema().clone();
        let mut assembler =
            FrameAssembler::new(schema, ReassemblyPolicy { max_pending: 2, max_age: None });

        // Three frames each missing their last segment.
        for uid in 1..=3u64 {
            let frame = populated_frame(&encoder, uid);
            let payloads = encoder.encode(&frame).unwrap();
            for payload in &payloads[..payloads.len() - 1] {
                assert!(assembler.offer(decoder.decode(payload).unwrap()).is_none());
            }
        }
        assert_eq!(assembler.pending_frames(), 2);

        // Completing the evicted frame 1 restarts it from scratch instead of
        // finishing it.
        let frame = populated_frame(&encoder, 1);
        let payloads = encoder.encode(&frame).unwrap();
        let last = payloads.last().unwrap();
        assert!(assembler.offer(decoder.decode(last).unwrap()).is_none());
    }

    #[test]
    fn stale_frames_expire() {
        let (encoder, decoder, _) = fixture(300, &[], 600, IdentityCodec);
        let schema = encoder.schema().clone();
        let mut assembler = FrameAssembler::new(
            schema,
            ReassemblyPolicy { max_pending: 16, max_age: Some(Duration::from_millis(20)) },
        );

        let frame = populated_frame(&encoder, 1);
        let payloads = encoder.encode(&frame).unwrap();
        assert!(assembler.offer(decoder.decode(&payloads[0]).unwrap()).is_none());
        assert_eq!(assembler.pending_frames(), 1);

        std::thread::sleep(Duration::from_millis(40));

        // The next arrival sweeps the deadline before inserting.
        let frame2 = populated_frame(&encoder, 2);
        let payloads2 = encoder.encode(&frame2).unwrap();
        assert!(assembler.offer(decoder.decode(&payloads2[0]).unwrap()).is_none());
        assert_eq!(assembler.pending_frames(), 1);
    }

    #[test]
    fn zero_variable_schema_round_trips() {
        let joints = vec![JointDescriptor::new("pelvis", JointKind::SixDoF)];
        let (encoder, decoder, mut assembler) = fixture(0, &joints, 65_000, IdentityCodec);
        let frame = populated_frame(&encoder, 11);
        let payloads = encoder.encode(&frame).unwrap();
        assert_eq!(payloads.len(), 1);
        let restored = assembler.offer(decoder.decode(&payloads[0]).unwrap()).unwrap();
        assert_eq!(restored, frame);
    }
}
