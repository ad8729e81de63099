//! Core types for registry stream data.
//!
//! - [`VariableKind`] / [`VariableDescriptor`] / [`Value`] describe and carry
//!   one registry variable; every value is an 8-byte bit pattern on the wire.
//! - [`JointKind`] / [`JointDescriptor`] / [`JointState`] describe and carry
//!   one joint's kinematic state with a fixed field count per kind.
//! - [`Frame`] is one full sample; [`SegmentPayload`] one transport-sized,
//!   independently compressed slice of it.

mod frame;
mod joint;
mod variable;

pub use frame::{Frame, SegmentPayload};
pub use joint::{JointDescriptor, JointKind, JointState};
pub use variable::{Value, VariableDescriptor, VariableKind};
