//! Frame packing and segment encoding.

use std::sync::Arc;

use bytes::Bytes;

use super::{SLOT_BYTES, SegmentPlan};
use crate::codec::CompressionCodec;
use crate::registry::{JointStateSet, VariableStore};
use crate::schema::Schema;
use crate::types::{Frame, SegmentPayload};
use crate::{Result, StreamError};

/// Packs live values into frames and encodes frames into transport-ready
/// segment payloads.
///
/// `pack` is the only step that runs on the producer's sampling thread: it
/// copies slot bit patterns and nothing else. `encode`, compression included,
/// belongs on the transmit worker.
pub struct FrameEncoder<C: CompressionCodec> {
    schema: Arc<Schema>,
    plan: SegmentPlan,
    codec: C,
}

impl<C: CompressionCodec> FrameEncoder<C> {
    pub fn new(schema: Arc<Schema>, plan: SegmentPlan, codec: C) -> Self {
        Self { schema, plan, codec }
    }

    pub fn plan(&self) -> &SegmentPlan {
        &self.plan
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Snapshot the current variable and joint values into a frame.
    ///
    /// Cheap and allocation-bounded: one slot-array copy, no I/O, no
    /// compression. Safe to call from a real-time sampling loop.
    pub fn pack(
        &self,
        uid: u64,
        timestamp: i64,
        store: &VariableStore,
        joints: &JointStateSet,
    ) -> Result<Frame> {
        if store.len() != self.schema.variable_count() {
            return Err(StreamError::schema(format!(
                "store has {} slots, schema expects {}",
                store.len(),
                self.schema.variable_count()
            )));
        }
        if joints.scalar_count() != self.schema.joint_scalar_count() {
            return Err(StreamError::schema(format!(
                "joint set has {} scalars, schema expects {}",
                joints.scalar_count(),
                self.schema.joint_scalar_count()
            )));
        }

        let mut slots = Vec::with_capacity(self.schema.slot_count());
        slots.extend_from_slice(store.slot_bits());
        joints.write_slots(&mut slots);
        Ok(Frame { uid, timestamp, slots })
    }

    /// Encode one frame into its planned segments.
    ///
    /// A compressed payload exceeding the transport limit is a
    /// [`StreamError::Configuration`], a setup fault (the plan's estimate was
    /// too optimistic for this schema), not a per-frame condition.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<SegmentPayload>> {
        if frame.slots.len() != self.schema.slot_count() {
            return Err(StreamError::schema(format!(
                "frame has {} slots, schema expects {}",
                frame.slots.len(),
                self.schema.slot_count()
            )));
        }

        let variable_split = self.schema.variable_count();
        let segment_count = self.plan.segment_count() as u32;
        let mut payloads = Vec::with_capacity(self.plan.segment_count());

        for (index, spec) in self.plan.segments().iter().enumerate() {
            let variable_slots = &frame.slots[spec.variables.clone()];
            let mut staging = Vec::with_capacity(variable_slots.len() * SLOT_BYTES);
            for bits in variable_slots {
                staging.extend_from_slice(&bits.to_le_bytes());
            }
            let compressed = self.codec.compress(&staging);

            let joints =
                if spec.carries_joints { frame.slots[variable_split..].to_vec() } else { Vec::new() };

            let payload_len =
                self.plan.header_len() + compressed.len() + joints.len() * SLOT_BYTES;
            if payload_len > self.plan.transport_limit() {
                return Err(StreamError::configuration(format!(
                    "segment {index} encoded to {payload_len} bytes, over the limit of {}",
                    self.plan.transport_limit()
                )));
            }

            payloads.push(SegmentPayload {
                uid: frame.uid,
                timestamp: frame.timestamp,
                segment_index: index as u32,
                segment_count,
                slot_offset: spec.variables.start as u32,
                uncompressed_length: staging.len() as u32,
                variables: Bytes::from(compressed),
                joints,
            });
        }
        Ok(payloads)
    }
}
