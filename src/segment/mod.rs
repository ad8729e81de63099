//! Frame segmentation.
//!
//! A frame of tens of thousands of variables does not fit one transport
//! payload, so the variable range is split into contiguous segments sized so
//! that each segment's *compressed* variable block plus the fixed header fits
//! the transport limit. Joint fields always travel together, uncompressed, on
//! segment 0.
//!
//! The split is computed once per schema from the codec's sizing bounds, not
//! per frame. Joint fields are deliberately counted as variable-equivalents
//! when estimating density: they are sent uncompressed and are therefore
//! denser than the compressed estimate assumes, which keeps the plan
//! conservative and segments under the limit.

mod decode;
mod encode;

pub use decode::{DecodedSegment, FrameAssembler, FrameDecoder, ReassemblyPolicy};
pub use encode::FrameEncoder;

use std::ops::Range;

use crate::Schema;
use crate::codec::CompressionCodec;
use crate::{Result, StreamError};

/// Bytes of framing metadata per segment at zero payload: uid (8) +
/// timestamp (8) + segment index (4) + segment count (4) + uncompressed
/// length (4).
pub const SEGMENT_HEADER_LEN: usize = 28;

/// Width of one value slot on the wire.
const SLOT_BYTES: usize = 8;

/// One planned segment: which variable slots it carries and whether the joint
/// block rides along.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpec {
    /// Contiguous variable slot range, empty for a joints-only segment.
    pub variables: Range<usize>,
    /// Joint fields always ride on segment 0.
    pub carries_joints: bool,
}

/// The per-schema segmentation plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    segments: Vec<SegmentSpec>,
    variable_count: usize,
    joint_scalar_count: usize,
    header_len: usize,
    transport_limit: usize,
}

impl SegmentPlan {
    /// Plan segmentation for a schema's variable and joint counts.
    ///
    /// Fails with [`StreamError::Configuration`] when no split can satisfy
    /// the transport limit, before streaming begins rather than mid-stream.
    pub fn plan(
        variable_count: usize,
        joint_scalar_count: usize,
        header_len: usize,
        transport_limit: usize,
        codec: &dyn CompressionCodec,
    ) -> Result<Self> {
        let budget = transport_limit.checked_sub(header_len).ok_or_else(|| {
            StreamError::configuration(format!(
                "transport limit {transport_limit} is below the {header_len} byte header"
            ))
        })?;

        let max_size = header_len + codec.max_compressed_len(SLOT_BYTES * variable_count);
        let segments = if max_size <= transport_limit {
            vec![SegmentSpec { variables: 0..variable_count, carries_joints: true }]
        } else {
            Self::split(variable_count, joint_scalar_count, budget, codec)?
        };

        let plan = Self {
            segments,
            variable_count,
            joint_scalar_count,
            header_len,
            transport_limit,
        };
        plan.validate(codec)?;
        Ok(plan)
    }

    /// Convenience wrapper deriving the counts from a schema.
    pub fn for_schema(
        schema: &Schema,
        header_len: usize,
        transport_limit: usize,
        codec: &dyn CompressionCodec,
    ) -> Result<Self> {
        Self::plan(
            schema.variable_count(),
            schema.joint_scalar_count(),
            header_len,
            transport_limit,
            codec,
        )
    }

    /// Split an oversized frame. Joints are counted as variable-equivalents
    /// for the density estimate and assigned wholesale to segment 0.
    fn split(
        variable_count: usize,
        joint_scalar_count: usize,
        budget: usize,
        codec: &dyn CompressionCodec,
    ) -> Result<Vec<SegmentSpec>> {
        let per_segment = codec.min_decompressed_len(budget) / SLOT_BYTES;
        if per_segment == 0 {
            return Err(StreamError::configuration(format!(
                "payload budget of {budget} bytes cannot carry a single variable"
            )));
        }

        let total = variable_count + joint_scalar_count;
        let segment_count = total.div_ceil(per_segment);
        let average = total.div_ceil(segment_count);

        let mut segments = Vec::with_capacity(segment_count);
        let first_variables = if average <= joint_scalar_count {
            // Joints alone exceed one segment's fair share: segment 0 carries
            // them exclusively and the variables split over the rest.
            0
        } else {
            average - joint_scalar_count
        };
        segments.push(SegmentSpec {
            variables: 0..first_variables.min(variable_count),
            carries_joints: true,
        });

        let mut next = first_variables.min(variable_count);
        let remaining_segments = segment_count - 1;
        if remaining_segments > 0 {
            let per = (variable_count - next).div_ceil(remaining_segments);
            for _ in 0..remaining_segments {
                let take = per.min(variable_count - next);
                segments.push(SegmentSpec { variables: next..next + take, carries_joints: false });
                next += take;
            }
        }

        if next != variable_count {
            // Plan must cover every variable exactly once.
            return Err(StreamError::configuration(format!(
                "segment plan covers {next} of {variable_count} variables"
            )));
        }

        // Ceil rounding can leave empty tail segments; nothing rides on them.
        while segments.len() > 1 {
            match segments.last() {
                Some(spec) if spec.variables.is_empty() && !spec.carries_joints => {
                    segments.pop();
                }
                _ => break,
            }
        }
        Ok(segments)
    }

    /// Check the plan's worst case against the transport limit using the
    /// codec's upper bound, per segment. Joint bytes on segment 0 are assumed
    /// to fit (the density estimate already over-counted them); the encoder
    /// still verifies actual payload sizes at runtime.
    fn validate(&self, codec: &dyn CompressionCodec) -> Result<()> {
        for (index, spec) in self.segments.iter().enumerate() {
            let worst = self.header_len
                + codec.max_compressed_len(SLOT_BYTES * spec.variables.len());
            if worst > self.transport_limit {
                return Err(StreamError::configuration(format!(
                    "segment {index} may compress to {worst} bytes, exceeding the limit of {}; \
                     lower the variable count, raise the limit, or pick a denser codec",
                    self.transport_limit
                )));
            }
        }
        Ok(())
    }

    pub fn segments(&self) -> &[SegmentSpec] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn variable_count(&self) -> usize {
        self.variable_count
    }

    pub fn joint_scalar_count(&self) -> usize {
        self.joint_scalar_count
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn transport_limit(&self) -> usize {
        self.transport_limit
    }
}
