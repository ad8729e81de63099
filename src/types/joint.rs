//! Joint descriptors and kinematic state.
//!
//! Joints travel next to the registry variables in every frame, but with a
//! fixed shape per kind: a one-degree-of-freedom joint contributes 2 scalar
//! fields, a six-degree-of-freedom joint 13 (unit quaternion, translation,
//! angular velocity, linear velocity). Joint fields are never split across
//! segments and are sent uncompressed.

use serde::{Deserialize, Serialize};

/// Joint kinds with their fixed scalar field counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JointKind {
    /// Pin or slider joint: position, velocity.
    OneDoF,
    /// Floating joint: quaternion (4) + translation (3) + angular velocity (3)
    /// + linear velocity (3).
    SixDoF,
}

impl JointKind {
    /// Number of scalar fields this joint contributes to a frame.
    pub const fn scalar_count(self) -> usize {
        match self {
            JointKind::OneDoF => 2,
            JointKind::SixDoF => 13,
        }
    }

    pub(crate) const fn tag(self) -> u8 {
        match self {
            JointKind::OneDoF => 0,
            JointKind::SixDoF => 1,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(JointKind::OneDoF),
            1 => Some(JointKind::SixDoF),
            _ => None,
        }
    }
}

/// Immutable description of one joint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JointDescriptor {
    pub name: String,
    pub kind: JointKind,
}

impl JointDescriptor {
    pub fn new(name: impl Into<String>, kind: JointKind) -> Self {
        Self { name: name.into(), kind }
    }
}

/// Kinematic state of one joint at one sampling instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JointState {
    OneDoF {
        position: f64,
        velocity: f64,
    },
    SixDoF {
        /// Orientation quaternion (x, y, z, w).
        rotation: [f64; 4],
        translation: [f64; 3],
        angular_velocity: [f64; 3],
        linear_velocity: [f64; 3],
    },
}

impl JointState {
    /// A zeroed state of the given kind (identity quaternion for SixDoF).
    pub fn zero(kind: JointKind) -> Self {
        match kind {
            JointKind::OneDoF => JointState::OneDoF { position: 0.0, velocity: 0.0 },
            JointKind::SixDoF => JointState::SixDoF {
                rotation: [0.0, 0.0, 0.0, 1.0],
                translation: [0.0; 3],
                angular_velocity: [0.0; 3],
                linear_velocity: [0.0; 3],
            },
        }
    }

    pub fn kind(&self) -> JointKind {
        match self {
            JointState::OneDoF { .. } => JointKind::OneDoF,
            JointState::SixDoF { .. } => JointKind::SixDoF,
        }
    }

    /// Append this state's fields, in wire order, as 8-byte slot patterns.
    pub fn write_slots(&self, out: &mut Vec<u64>) {
        match self {
            JointState::OneDoF { position, velocity } => {
                out.push(position.to_bits());
                out.push(velocity.to_bits());
            }
            JointState::SixDoF { rotation, translation, angular_velocity, linear_velocity } => {
                for v in rotation {
                    out.push(v.to_bits());
                }
                for v in translation {
                    out.push(v.to_bits());
                }
                for v in angular_velocity {
                    out.push(v.to_bits());
                }
                for v in linear_velocity {
                    out.push(v.to_bits());
                }
            }
        }
    }

    /// Rebuild this state from its slot patterns. `slots` must hold exactly
    /// `kind().scalar_count()` entries.
    pub fn read_slots(&mut self, slots: &[u64]) {
        debug_assert_eq!(slots.len(), self.kind().scalar_count());
        match self {
            JointState::OneDoF { position, velocity } => {
                *position = f64::from_bits(slots[0]);
                *velocity = f64::from_bits(slots[1]);
            }
            JointState::SixDoF { rotation, translation, angular_velocity, linear_velocity } => {
                for (i, v) in rotation.iter_mut().enumerate() {
                    *v = f64::from_bits(slots[i]);
                }
                for (i, v) in translation.iter_mut().enumerate() {
                    *v = f64::from_bits(slots[4 + i]);
                }
                for (i, v) in angular_velocity.iter_mut().enumerate() {
                    *v = f64::from_bits(slots[7 + i]);
                }
                for (i, v) in linear_velocity.iter_mut().enumerate() {
                    *v = f64::from_bits(slots[10 + i]);
                }
            }
        }
    }
}
