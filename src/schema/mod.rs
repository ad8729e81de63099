//! Negotiated schema: the flattened, slot-addressed view of a registry tree.
//!
//! The schema is built once from a [`RegistryTree`] when a connection or
//! recording starts, serialized as the handshake blob, and reconstructed
//! bit-identically on the consumer side. All frame data after the handshake is
//! positional (slot indices, not names), so producer and consumer must derive
//! the exact same ordering. That ordering is the tree's deterministic
//! pre-order traversal: variables take slots `[0, V)` as encountered, joint
//! scalar fields take `[V, V + J)` in joint registration order.
//!
//! The schema is immutable after the handshake completes; changing the tree
//! requires a new connection.

mod handshake;

pub use handshake::{HandshakeBlob, PROTOCOL_VERSION};

use std::ops::Range;
use std::sync::Arc;

use crate::registry::{JointStateSet, RegistryTree, VariableStore};
use crate::types::{Frame, JointDescriptor, VariableDescriptor};
use crate::{Result, StreamError};

/// One registry node in flattened pre-order.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaNode {
    pub name: String,
    /// Pre-order index of the parent; `None` for the root. Parents always
    /// precede children in the node list.
    pub parent: Option<usize>,
}

/// One variable with its assigned slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotVariable {
    pub descriptor: VariableDescriptor,
    /// Pre-order index of the owning node.
    pub node: usize,
    /// Position in the flat value buffer.
    pub slot: usize,
}

/// One joint with its assigned scalar slot range.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotJoint {
    pub descriptor: JointDescriptor,
    /// Contiguous slot range holding this joint's fields.
    pub slots: Range<usize>,
}

/// The fully negotiated, flattened schema.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    version: u32,
    dt: f64,
    nodes: Vec<SchemaNode>,
    variables: Vec<SlotVariable>,
    joints: Vec<SlotJoint>,
}

impl Schema {
    /// Flatten a registry tree and joint list into slot assignments.
    ///
    /// `dt` is the producer's sample period in seconds, carried through the
    /// handshake so consumers can reconstruct wall-clock spacing.
    pub fn from_tree(
        tree: &RegistryTree,
        joints: &[JointDescriptor],
        dt: f64,
    ) -> Result<Arc<Schema>> {
        if !(dt.is_finite() && dt >= 0.0) {
            return Err(StreamError::schema(format!("invalid sample period {dt}")));
        }

        let mut nodes = Vec::with_capacity(tree.node_count());
        let mut variables = Vec::with_capacity(tree.variable_count());
        // Arena index -> pre-order position, filled as nodes are visited.
        let mut preorder_of = vec![usize::MAX; tree.node_count()];

        tree.visit_preorder(|arena_index, node| {
            let position = nodes.len();
            preorder_of[arena_index] = position;
            nodes.push(SchemaNode {
                name: node.name.clone(),
                parent: node.parent.map(|p| preorder_of[p]),
            });
            for descriptor in &node.variables {
                let slot = variables.len();
                variables.push(SlotVariable { descriptor: descriptor.clone(), node: position, slot });
            }
        });

        let mut joint_list = Vec::with_capacity(joints.len());
        let mut next = variables.len();
        for descriptor in joints {
            let count = descriptor.kind.scalar_count();
            joint_list.push(SlotJoint { descriptor: descriptor.clone(), slots: next..next + count });
            next += count;
        }

        Ok(Arc::new(Schema { version: PROTOCOL_VERSION, dt, nodes, variables, joints: joint_list }))
    }

    /// Protocol version negotiated in the handshake.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Producer sample period in seconds.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Flattened nodes in pre-order.
    pub fn nodes(&self) -> &[SchemaNode] {
        &self.nodes
    }

    /// Variables in slot order.
    pub fn variables(&self) -> &[SlotVariable] {
        &self.variables
    }

    /// Joints in registration order.
    pub fn joints(&self) -> &[SlotJoint] {
        &self.joints
    }

    /// Number of variable slots `V`.
    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// Number of joint scalar slots `J`.
    pub fn joint_scalar_count(&self) -> usize {
        self.joints.iter().map(|j| j.descriptor.kind.scalar_count()).sum()
    }

    /// Total slots per frame, `V + J`.
    pub fn slot_count(&self) -> usize {
        self.variable_count() + self.joint_scalar_count()
    }

    /// Dotted full name of a variable slot, e.g. `root.controller.q_d`.
    pub fn full_name(&self, slot: usize) -> Option<String> {
        let variable = self.variables.get(slot)?;
        let mut path = vec![variable.descriptor.name.as_str()];
        let mut node = Some(variable.node);
        while let Some(index) = node {
            path.push(self.nodes[index].name.as_str());
            node = self.nodes[index].parent;
        }
        path.reverse();
        Some(path.join("."))
    }

    /// Find a variable slot by short name or dotted full name. Short names
    /// return the first match in slot order.
    pub fn find_slot(&self, name: &str) -> Option<usize> {
        if name.contains('.') {
            (0..self.variables.len()).find(|&slot| self.full_name(slot).as_deref() == Some(name))
        } else {
            self.variables.iter().position(|v| v.descriptor.name == name)
        }
    }

    /// A zeroed live-value store shaped for this schema.
    pub fn new_store(&self) -> VariableStore {
        VariableStore::new(self.variables.iter().map(|v| v.descriptor.kind).collect())
    }

    /// A zeroed joint state set shaped for this schema.
    pub fn new_joint_states(&self) -> JointStateSet {
        JointStateSet::new(self.joints.iter().map(|j| j.descriptor.kind))
    }

    /// Scatter a completed frame into a store and joint state set.
    pub fn apply_frame(
        &self,
        frame: &Frame,
        store: &mut VariableStore,
        joints: &mut JointStateSet,
    ) -> Result<()> {
        if frame.slots.len() != self.slot_count() {
            return Err(StreamError::decode(format!(
                "frame has {} slots, schema expects {}",
                frame.slots.len(),
                self.slot_count()
            )));
        }
        let split = self.variable_count();
        store.load_bits(&frame.slots[..split]);
        joints.load_slots(&frame.slots[split..]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeId;
    use crate::types::{JointKind, VariableKind};

    fn sample_tree() -> (RegistryTree, Vec<JointDescriptor>) {
        let mut tree = RegistryTree::new("root");
        let controller = tree.add_child(NodeId::ROOT, "controller").unwrap();
        let estimator = tree.add_child(NodeId::ROOT, "estimator").unwrap();
        tree.add_variable(NodeId::ROOT, VariableDescriptor::new("t", VariableKind::Double))
            .unwrap();
        tree.add_variable(controller, VariableDescriptor::new("q_d", VariableKind::Double))
            .unwrap();
        tree.add_variable(controller, VariableDescriptor::new("enabled", VariableKind::Boolean))
            .unwrap();
        tree.add_variable(estimator, VariableDescriptor::new("ticks", VariableKind::Long))
            .unwrap();
        let joints = vec![
            JointDescriptor::new("pelvis", JointKind::SixDoF),
            JointDescriptor::new("knee", JointKind::OneDoF),
        ];
        (tree, joints)
    }

    #[test]
    fn slots_follow_preorder() {
        let (tree, joints) = sample_tree();
        let schema = Schema::from_tree(&tree, &joints, 0.001).unwrap();

        assert_eq!(schema.variable_count(), 4);
        assert_eq!(schema.joint_scalar_count(), 15);
        assert_eq!(schema.slot_count(), 19);

        assert_eq!(schema.full_name(0).unwrap(), "root.t");
        assert_eq!(schema.full_name(1).unwrap(), "root.controller.q_d");
        assert_eq!(schema.full_name(2).unwrap(), "root.controller.enabled");
        assert_eq!(schema.full_name(3).unwrap(), "root.estimator.ticks");

        assert_eq!(schema.joints()[0].slots, 4..17);
        assert_eq!(schema.joints()[1].slots, 17..19);
    }

    #[test]
    fn find_slot_by_short_and_full_name() {
        let (tree, joints) = sample_tree();
        let schema = Schema::from_tree(&tree, &joints, 0.001).unwrap();

        assert_eq!(schema.find_slot("q_d"), Some(1));
        assert_eq!(schema.find_slot("root.controller.enabled"), Some(2));
        assert_eq!(schema.find_slot("missing"), None);
    }

    #[test]
    fn two_builds_are_identical() {
        let (tree, joints) = sample_tree();
        let a = Schema::from_tree(&tree, &joints, 0.001).unwrap();
        let b = Schema::from_tree(&tree, &joints, 0.001).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn invalid_dt_rejected() {
        let (tree, joints) = sample_tree();
        assert!(Schema::from_tree(&tree, &joints, f64::NAN).is_err());
        assert!(Schema::from_tree(&tree, &joints, -0.5).is_err());
    }

    #[test]
    fn apply_frame_scatters_variables_and_joints() {
        let (tree, joints) = sample_tree();
        let schema = Schema::from_tree(&tree, &joints, 0.001).unwrap();

        let mut frame = Frame::zeroed(schema.slot_count());
        frame.slots[1] = crate::Value::Double(2.5).to_bits();
        frame.slots[3] = crate::Value::Long(-9).to_bits();
        // Knee joint occupies the last two slots.
        frame.slots[17] = 0.75f64.to_bits();
        frame.slots[18] = (-0.25f64).to_bits();

        let mut store = schema.new_store();
        let mut joint_states = schema.new_joint_states();
        schema.apply_frame(&frame, &mut store, &mut joint_states).unwrap();

        assert_eq!(store.get(1), Some(crate::Value::Double(2.5)));
        assert_eq!(store.get(3), Some(crate::Value::Long(-9)));
        assert_eq!(
            joint_states.get(1),
            Some(&crate::JointState::OneDoF { position: 0.75, velocity: -0.25 })
        );
    }

    #[test]
    fn apply_frame_rejects_wrong_slot_count() {
        let (tree, joints) = sample_tree();
        let schema = Schema::from_tree(&tree, &joints, 0.001).unwrap();
        let frame = Frame::zeroed(3);
        let mut store = schema.new_store();
        let mut joint_states = schema.new_joint_states();
        assert!(schema.apply_frame(&frame, &mut store, &mut joint_states).is_err());
    }
}
