//! Hierarchical variable registry.
//!
//! The registry is an arena of nodes addressed by [`NodeId`] index with
//! explicit ordered child lists, not a pointer graph. Slot indices shared
//! across process boundaries are derived from a deterministic pre-order
//! traversal (parent before children, children and variables in insertion
//! order), so two walks of equal trees always agree, independent of memory
//! layout.

use crate::types::{JointKind, JointState, Value, VariableDescriptor, VariableKind};
use crate::{Result, StreamError};

/// Index of a node within a [`RegistryTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// The root node of every tree.
    pub const ROOT: NodeId = NodeId(0);
}

#[derive(Debug, Clone)]
pub(crate) struct RegistryNode {
    pub(crate) name: String,
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) variables: Vec<VariableDescriptor>,
}

/// Arena-allocated registry tree.
///
/// Built once by the producer before streaming starts; the negotiated
/// [`Schema`](crate::Schema) flattens it and is immutable afterwards.
#[derive(Debug, Clone)]
pub struct RegistryTree {
    nodes: Vec<RegistryNode>,
}

impl RegistryTree {
    /// Create a tree with a single root node of the given name.
    pub fn new(root_name: impl Into<String>) -> Self {
        Self {
            nodes: vec![RegistryNode {
                name: root_name.into(),
                parent: None,
                children: Vec::new(),
                variables: Vec::new(),
            }],
        }
    }

    /// Add a child registry under `parent`, keeping insertion order.
    ///
    /// Fails with [`StreamError::Schema`] if a sibling with the same name
    /// already exists; sibling names are the path components of fully
    /// qualified variable names and must be unambiguous.
    pub fn add_child(&mut self, parent: NodeId, name: impl Into<String>) -> Result<NodeId> {
        let name = name.into();
        let parent_node =
            self.nodes.get(parent.0).ok_or_else(|| StreamError::schema("unknown parent node"))?;
        if parent_node.children.iter().any(|&c| self.nodes[c].name == name) {
            return Err(StreamError::schema(format!(
                "duplicate child registry '{}' under '{}'",
                name, parent_node.name
            )));
        }

        let id = self.nodes.len();
        self.nodes.push(RegistryNode {
            name,
            parent: Some(parent.0),
            children: Vec::new(),
            variables: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        Ok(NodeId(id))
    }

    /// Add a variable owned directly by `node`, keeping insertion order.
    ///
    /// Fails with [`StreamError::Schema`] on a duplicate variable name within
    /// the node.
    pub fn add_variable(&mut self, node: NodeId, descriptor: VariableDescriptor) -> Result<()> {
        let owner =
            self.nodes.get_mut(node.0).ok_or_else(|| StreamError::schema("unknown node"))?;
        if owner.variables.iter().any(|v| v.name == descriptor.name) {
            return Err(StreamError::schema(format!(
                "duplicate variable '{}' in registry '{}'",
                descriptor.name, owner.name
            )));
        }
        owner.variables.push(descriptor);
        Ok(())
    }

    /// Name of a node.
    pub fn name(&self, node: NodeId) -> &str {
        &self.nodes[node.0].name
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Total number of variables across all nodes.
    pub fn variable_count(&self) -> usize {
        self.nodes.iter().map(|n| n.variables.len()).sum()
    }

    /// Visit nodes in deterministic pre-order: parent before children,
    /// children in insertion order. The root is visited first.
    pub(crate) fn visit_preorder(&self, mut visit: impl FnMut(usize, &RegistryNode)) {
        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            visit(index, node);
            // Reverse so the leftmost child is popped first.
            for &child in node.children.iter().rev() {
                stack.push(child);
            }
        }
    }

    pub(crate) fn node(&self, index: usize) -> &RegistryNode {
        &self.nodes[index]
    }
}

/// Slot-indexed live values for every variable in a schema.
///
/// The producer mutates the store between `update()` ticks; the consumer's
/// decoder scatters received frames back into its own store. Values are held
/// as their 8-byte bit patterns with the kind list alongside, so packing a
/// frame is a plain memcpy of the slot array.
#[derive(Debug, Clone)]
pub struct VariableStore {
    kinds: Vec<VariableKind>,
    bits: Vec<u64>,
}

impl VariableStore {
    pub(crate) fn new(kinds: Vec<VariableKind>) -> Self {
        let bits = vec![0; kinds.len()];
        Self { kinds, bits }
    }

    /// Number of variable slots.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Set a slot to a value of the matching kind.
    pub fn set(&mut self, slot: usize, value: Value) -> Result<()> {
        let kind = self
            .kinds
            .get(slot)
            .copied()
            .ok_or_else(|| StreamError::schema(format!("slot {slot} out of range")))?;
        if value.kind() != kind {
            return Err(StreamError::schema(format!(
                "slot {slot} holds {kind:?}, not {:?}",
                value.kind()
            )));
        }
        self.bits[slot] = value.to_bits();
        Ok(())
    }

    /// Coerce a double into the slot's kind and set it. Used to apply remote
    /// variable change requests.
    pub fn set_from_double(&mut self, slot: usize, value: f64) -> Result<()> {
        let kind = self
            .kinds
            .get(slot)
            .copied()
            .ok_or_else(|| StreamError::schema(format!("slot {slot} out of range")))?;
        self.bits[slot] = Value::from_double(kind, value)?.to_bits();
        Ok(())
    }

    /// Read a slot back as a typed value.
    pub fn get(&self, slot: usize) -> Option<Value> {
        let kind = *self.kinds.get(slot)?;
        Some(Value::from_bits(kind, self.bits[slot]))
    }

    /// Raw slot bit patterns, in schema order.
    pub fn slot_bits(&self) -> &[u64] {
        &self.bits
    }

    /// Overwrite every slot from a received frame's variable range.
    pub(crate) fn load_bits(&mut self, bits: &[u64]) {
        debug_assert_eq!(bits.len(), self.bits.len());
        self.bits.copy_from_slice(bits);
    }
}

/// Live kinematic states for every joint in a schema, in schema order.
#[derive(Debug, Clone)]
pub struct JointStateSet {
    joints: Vec<JointState>,
}

impl JointStateSet {
    pub(crate) fn new(kinds: impl IntoIterator<Item = JointKind>) -> Self {
        Self { joints: kinds.into_iter().map(JointState::zero).collect() }
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    /// Total scalar fields across all joints.
    pub fn scalar_count(&self) -> usize {
        self.joints.iter().map(|j| j.kind().scalar_count()).sum()
    }

    pub fn get(&self, index: usize) -> Option<&JointState> {
        self.joints.get(index)
    }

    /// Replace one joint's state. The kind must match the schema.
    pub fn set(&mut self, index: usize, state: JointState) -> Result<()> {
        let current = self
            .joints
            .get_mut(index)
            .ok_or_else(|| StreamError::schema(format!("joint {index} out of range")))?;
        if current.kind() != state.kind() {
            return Err(StreamError::schema(format!(
                "joint {index} is {:?}, not {:?}",
                current.kind(),
                state.kind()
            )));
        }
        *current = state;
        Ok(())
    }

    /// Append all joint fields as slot patterns, in schema order.
    pub(crate) fn write_slots(&self, out: &mut Vec<u64>) {
        for joint in &self.joints {
            joint.write_slots(out);
        }
    }

    /// Scatter received joint slots back into the states.
    pub(crate) fn load_slots(&mut self, slots: &[u64]) {
        let mut offset = 0;
        for joint in &mut self.joints {
            let count = joint.kind().scalar_count();
            joint.read_slots(&slots[offset..offset + count]);
            offset += count;
        }
        debug_assert_eq!(offset, slots.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preorder_is_parent_first_insertion_order() {
        let mut tree = RegistryTree::new("root");
        let a = tree.add_child(NodeId::ROOT, "a").unwrap();
        let b = tree.add_child(NodeId::ROOT, "b").unwrap();
        tree.add_child(a, "a1").unwrap();
        tree.add_child(a, "a2").unwrap();
        tree.add_child(b, "b1").unwrap();

        let mut names = Vec::new();
        tree.visit_preorder(|_, node| names.push(node.name.clone()));
        assert_eq!(names, ["root", "a", "a1", "a2", "b", "b1"]);
    }

    #[test]
    fn duplicate_sibling_registry_rejected() {
        let mut tree = RegistryTree::new("root");
        tree.add_child(NodeId::ROOT, "controller").unwrap();
        let err = tree.add_child(NodeId::ROOT, "controller").unwrap_err();
        assert!(matches!(err, StreamError::Schema { .. }));
    }

    #[test]
    fn duplicate_variable_in_node_rejected() {
        let mut tree = RegistryTree::new("root");
        tree.add_variable(
            NodeId::ROOT,
            VariableDescriptor::new("q_d", VariableKind::Double),
        )
        .unwrap();
        let err = tree
            .add_variable(NodeId::ROOT, VariableDescriptor::new("q_d", VariableKind::Integer))
            .unwrap_err();
        assert!(matches!(err, StreamError::Schema { .. }));
    }

    #[test]
    fn same_name_under_different_parents_is_fine() {
        let mut tree = RegistryTree::new("root");
        let a = tree.add_child(NodeId::ROOT, "left").unwrap();
        let b = tree.add_child(NodeId::ROOT, "right").unwrap();
        tree.add_child(a, "state").unwrap();
        tree.add_child(b, "state").unwrap();
        assert_eq!(tree.node_count(), 5);
    }

    #[test]
    fn store_rejects_kind_mismatch() {
        let mut store = VariableStore::new(vec![VariableKind::Double, VariableKind::Boolean]);
        store.set(0, Value::Double(1.5)).unwrap();
        assert!(store.set(0, Value::Boolean(true)).is_err());
        assert!(store.set(7, Value::Double(0.0)).is_err());
        assert_eq!(store.get(0), Some(Value::Double(1.5)));
    }

    #[test]
    fn joint_set_round_trips_slots() {
        let mut set = JointStateSet::new([JointKind::OneDoF, JointKind::SixDoF]);
        set.set(0, JointState::OneDoF { position: 0.25, velocity: -1.0 }).unwrap();
        assert_eq!(set.scalar_count(), 15);

        let mut slots = Vec::new();
        set.write_slots(&mut slots);
        assert_eq!(slots.len(), 15);

        let mut other = JointStateSet::new([JointKind::OneDoF, JointKind::SixDoF]);
        other.load_slots(&slots);
        assert_eq!(other.get(0), set.get(0));
        assert_eq!(other.get(1), set.get(1));
    }

    #[test]
    fn joint_set_rejects_kind_mismatch() {
        let mut set = JointStateSet::new([JointKind::OneDoF]);
        let err = set.set(0, JointState::zero(JointKind::SixDoF)).unwrap_err();
        assert!(matches!(err, StreamError::Schema { .. }));
    }
}
