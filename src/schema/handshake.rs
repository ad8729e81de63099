//! Handshake blob serialization.
//!
//! The handshake is the one-time schema exchange that fixes variable and joint
//! ordering for a connection or log. Layout (all integers little-endian):
//!
//! ```text
//! magic   u32      "VSHK"
//! version u32      protocol version
//! dt      f64      producer sample period, seconds
//! nodes   u32 N    per node (pre-order): parent u32 (root = u32::MAX),
//!                  name (u16 length + UTF-8)
//! vars    u32 V    per variable (slot order): owning node u32, kind u8,
//!                  name, description, lower f64, upper f64,
//!                  enum symbol list (u16 count + strings) when kind = Enum
//! joints  u32 K    per joint: kind u8, name
//! ```
//!
//! Pre-order serialization guarantees a parent always precedes its children,
//! so `parse` can rebuild the tree in one pass and re-derive the identical
//! slot assignment. Malformed structure is a [`StreamError::CorruptHandshake`];
//! an unsupported version is a [`StreamError::ProtocolVersion`]. Both reject
//! the connection before any positional data flows.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Schema, SchemaNode, SlotJoint, SlotVariable};
use crate::registry::RegistryTree;
use crate::types::{JointDescriptor, JointKind, VariableDescriptor, VariableKind};
use crate::{Result, StreamError};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u32 = 1;

const HANDSHAKE_MAGIC: u32 = u32::from_le_bytes(*b"VSHK");

/// Serialized schema exchanged once per connection or written once per log.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeBlob {
    bytes: Bytes,
}

impl HandshakeBlob {
    /// Flatten and serialize a registry tree. Equivalent to
    /// [`Schema::from_tree`] followed by [`HandshakeBlob::from_schema`].
    pub fn build(tree: &RegistryTree, joints: &[JointDescriptor], dt: f64) -> Result<Self> {
        let schema = Schema::from_tree(tree, joints, dt)?;
        Ok(Self::from_schema(&schema))
    }

    /// Serialize an already-flattened schema.
    pub fn from_schema(schema: &Schema) -> Self {
        let mut buf = BytesMut::with_capacity(64 + schema.slot_count() * 16);
        buf.put_u32_le(HANDSHAKE_MAGIC);
        buf.put_u32_le(schema.version());
        buf.put_f64_le(schema.dt());

        buf.put_u32_le(schema.nodes().len() as u32);
        for node in schema.nodes() {
            buf.put_u32_le(node.parent.map_or(u32::MAX, |p| p as u32));
            put_string(&mut buf, &node.name);
        }

        buf.put_u32_le(schema.variables().len() as u32);
        for variable in schema.variables() {
            let descriptor = &variable.descriptor;
            buf.put_u32_le(variable.node as u32);
            buf.put_u8(descriptor.kind.tag());
            put_string(&mut buf, &descriptor.name);
            put_string(&mut buf, &descriptor.description);
            buf.put_f64_le(descriptor.lower_bound);
            buf.put_f64_le(descriptor.upper_bound);
            if descriptor.kind == VariableKind::Enum {
                buf.put_u16_le(descriptor.enum_symbols.len() as u16);
                for symbol in &descriptor.enum_symbols {
                    put_string(&mut buf, symbol);
                }
            }
        }

        buf.put_u32_le(schema.joints().len() as u32);
        for joint in schema.joints() {
            buf.put_u8(joint.descriptor.kind.tag());
            put_string(&mut buf, &joint.descriptor.name);
        }

        Self { bytes: buf.freeze() }
    }

    /// Wrap received bytes without validating; validation happens in `parse`.
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }

    /// Reconstruct the schema with the exact slot ordering of the builder.
    pub fn parse(&self) -> Result<Arc<Schema>> {
        let mut buf = self.bytes.clone();

        let magic = get_u32(&mut buf, "magic")?;
        if magic != HANDSHAKE_MAGIC {
            return Err(StreamError::corrupt_handshake("bad magic"));
        }
        let version = get_u32(&mut buf, "version")?;
        if version != PROTOCOL_VERSION {
            return Err(StreamError::ProtocolVersion { expected: PROTOCOL_VERSION, found: version });
        }
        let dt = get_f64(&mut buf, "dt")?;
        if !(dt.is_finite() && dt >= 0.0) {
            return Err(StreamError::corrupt_handshake(format!("invalid sample period {dt}")));
        }

        let node_count = get_count(&mut buf, "node count")?;
        if node_count == 0 {
            return Err(StreamError::corrupt_handshake("empty node table"));
        }
        let mut nodes = Vec::with_capacity(node_count);
        for index in 0..node_count {
            let parent_raw = get_u32(&mut buf, "node parent")?;
            let name = get_string(&mut buf, "node name")?;
            let parent = if parent_raw == u32::MAX {
                if index != 0 {
                    return Err(StreamError::corrupt_handshake(format!(
                        "node {index} claims to be a root"
                    )));
                }
                None
            } else {
                let parent = parent_raw as usize;
                // Pre-order: a parent must already have been read.
                if parent >= index {
                    return Err(StreamError::corrupt_handshake(format!(
                        "node {index} references parent {parent} out of order"
                    )));
                }
                Some(parent)
            };
            nodes.push(SchemaNode { name, parent });
        }
        check_sibling_names(&nodes)?;

        let variable_count = get_count(&mut buf, "variable count")?;
        let mut variables: Vec<SlotVariable> = Vec::with_capacity(variable_count);
        for slot in 0..variable_count {
            let node = get_u32(&mut buf, "variable node")? as usize;
            if node >= node_count {
                return Err(StreamError::corrupt_handshake(format!(
                    "variable {slot} references unknown node {node}"
                )));
            }
            let kind_tag = get_u8(&mut buf, "variable kind")?;
            let kind = VariableKind::from_tag(kind_tag).ok_or_else(|| {
                StreamError::corrupt_handshake(format!("unknown variable kind tag {kind_tag}"))
            })?;
            let name = get_string(&mut buf, "variable name")?;
            let description = get_string(&mut buf, "variable description")?;
            let lower_bound = get_f64(&mut buf, "variable lower bound")?;
            let upper_bound = get_f64(&mut buf, "variable upper bound")?;
            let enum_symbols = if kind == VariableKind::Enum {
                let count = get_u16(&mut buf, "enum symbol count")? as usize;
                let mut symbols = Vec::with_capacity(count);
                for _ in 0..count {
                    symbols.push(get_string(&mut buf, "enum symbol")?);
                }
                symbols
            } else {
                Vec::new()
            };
            if variables.iter().any(|v| v.node == node && v.descriptor.name == name) {
                return Err(StreamError::corrupt_handshake(format!(
                    "duplicate variable '{name}' in node {node}"
                )));
            }
            variables.push(SlotVariable {
                descriptor: VariableDescriptor {
                    name,
                    kind,
                    enum_symbols,
                    description,
                    lower_bound,
                    upper_bound,
                },
                node,
                slot,
            });
        }

        let joint_count = get_count(&mut buf, "joint count")?;
        let mut joints = Vec::with_capacity(joint_count);
        let mut next_slot = variable_count;
        for _ in 0..joint_count {
            let kind_tag = get_u8(&mut buf, "joint kind")?;
            let kind = JointKind::from_tag(kind_tag).ok_or_else(|| {
                StreamError::corrupt_handshake(format!("unknown joint kind tag {kind_tag}"))
            })?;
            let name = get_string(&mut buf, "joint name")?;
            let fields = kind.scalar_count();
            joints.push(SlotJoint {
                descriptor: JointDescriptor { name, kind },
                slots: next_slot..next_slot + fields,
            });
            next_slot += fields;
        }

        if buf.has_remaining() {
            return Err(StreamError::corrupt_handshake(format!(
                "{} trailing bytes after joint table",
                buf.remaining()
            )));
        }

        Ok(Arc::new(Schema { version, dt, nodes, variables, joints }))
    }
}

fn check_sibling_names(nodes: &[SchemaNode]) -> Result<()> {
    for (index, node) in nodes.iter().enumerate() {
        for other in &nodes[..index] {
            if other.parent == node.parent && other.name == node.name {
                return Err(StreamError::corrupt_handshake(format!(
                    "duplicate sibling registry '{}'",
                    node.name
                )));
            }
        }
    }
    Ok(())
}

fn put_string(buf: &mut BytesMut, value: &str) {
    // Names and descriptions are bounded at the u16 length prefix; anything
    // longer is truncated at a char boundary, matching the handshake cap.
    let mut bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        let mut end = u16::MAX as usize;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        bytes = &bytes[..end];
    }
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_u8(buf: &mut Bytes, field: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated(field));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes, field: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(truncated(field));
    }
    Ok(buf.get_u16_le())
}

fn get_u32(buf: &mut Bytes, field: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(field));
    }
    Ok(buf.get_u32_le())
}

fn get_f64(buf: &mut Bytes, field: &str) -> Result<f64> {
    if buf.remaining() < 8 {
        return Err(truncated(field));
    }
    Ok(buf.get_f64_le())
}

/// Read a table length and reject counts that could not possibly fit in the
/// remaining bytes, so corrupt blobs cannot trigger huge preallocations.
fn get_count(buf: &mut Bytes, field: &str) -> Result<usize> {
    let count = get_u32(&mut *buf, field)? as usize;
    if count > buf.remaining() {
        return Err(StreamError::corrupt_handshake(format!(
            "{field} {count} exceeds blob size"
        )));
    }
    Ok(count)
}

fn get_string(buf: &mut Bytes, field: &str) -> Result<String> {
    let len = get_u16(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(truncated(field));
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StreamError::corrupt_handshake(format!("{field} is not UTF-8")))
}

fn truncated(field: &str) -> StreamError {
    StreamError::corrupt_handshake(format!("truncated blob reading {field}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeId;
    use proptest::prelude::*;

    fn sample_tree() -> (RegistryTree, Vec<JointDescriptor>) {
        let mut tree = RegistryTree::new("root");
        let controller = tree.add_child(NodeId::ROOT, "controller").unwrap();
        tree.add_variable(NodeId::ROOT, VariableDescriptor::new("t", VariableKind::Double))
            .unwrap();
        tree.add_variable(
            controller,
            VariableDescriptor::new_enum(
                "mode",
                vec!["STANDING".into(), "WALKING".into(), "FALLING".into()],
            ),
        )
        .unwrap();
        tree.add_variable(
            controller,
            VariableDescriptor::new("q_d", VariableKind::Double)
                .with_description("desired position")
                .with_bounds(-3.14, 3.14),
        )
        .unwrap();
        let joints = vec![
            JointDescriptor::new("pelvis", JointKind::SixDoF),
            JointDescriptor::new("knee", JointKind::OneDoF),
        ];
        (tree, joints)
    }

    #[test]
    fn parse_reproduces_build_exactly() {
        let (tree, joints) = sample_tree();
        let schema = Schema::from_tree(&tree, &joints, 0.001).unwrap();
        let blob = HandshakeBlob::from_schema(&schema);
        let parsed = blob.parse().unwrap();
        assert_eq!(*parsed, *schema);
    }

    #[test]
    fn build_is_deterministic() {
        let (tree, joints) = sample_tree();
        let a = HandshakeBlob::build(&tree, &joints, 0.001).unwrap();
        let b = HandshakeBlob::build(&tree, &joints, 0.001).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn wrong_version_is_protocol_error() {
        let (tree, joints) = sample_tree();
        let blob = HandshakeBlob::build(&tree, &joints, 0.001).unwrap();
        let mut bytes = blob.as_bytes().to_vec();
        bytes[4] = 99; // version field
        let err = HandshakeBlob::from_bytes(Bytes::from(bytes)).parse().unwrap_err();
        assert!(matches!(err, StreamError::ProtocolVersion { found: 99, .. }));
    }

    #[test]
    fn bad_magic_is_corrupt() {
        let err = HandshakeBlob::from_bytes(Bytes::from_static(b"nope....more"))
            .parse()
            .unwrap_err();
        assert!(matches!(err, StreamError::CorruptHandshake { .. }));
    }

    #[test]
    fn truncation_anywhere_is_corrupt() {
        let (tree, joints) = sample_tree();
        let blob = HandshakeBlob::build(&tree, &joints, 0.001).unwrap();
        let bytes = blob.as_bytes();
        for len in 0..bytes.len() {
            let err = HandshakeBlob::from_bytes(Bytes::copy_from_slice(&bytes[..len]))
                .parse()
                .unwrap_err();
            assert!(
                matches!(err, StreamError::CorruptHandshake { .. }),
                "prefix of {len} bytes gave {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let (tree, joints) = sample_tree();
        let blob = HandshakeBlob::build(&tree, &joints, 0.001).unwrap();
        let mut bytes = blob.as_bytes().to_vec();
        bytes.push(0);
        let err = HandshakeBlob::from_bytes(Bytes::from(bytes)).parse().unwrap_err();
        assert!(matches!(err, StreamError::CorruptHandshake { .. }));
    }

    #[test]
    fn forward_parent_reference_is_corrupt() {
        // Hand-build a blob whose second node points at a later node.
        let mut buf = BytesMut::new();
        buf.put_u32_le(HANDSHAKE_MAGIC);
        buf.put_u32_le(PROTOCOL_VERSION);
        buf.put_f64_le(0.001);
        buf.put_u32_le(2);
        buf.put_u32_le(u32::MAX);
        put_string(&mut buf, "root");
        buf.put_u32_le(5); // dangling parent
        put_string(&mut buf, "child");
        buf.put_u32_le(0);
        buf.put_u32_le(0);
        let err = HandshakeBlob::from_bytes(buf.freeze()).parse().unwrap_err();
        assert!(matches!(err, StreamError::CorruptHandshake { .. }));
    }

    prop_compose! {
        fn arb_kind()(tag in 0u8..5) -> VariableKind {
            VariableKind::from_tag(tag).unwrap()
        }
    }

    /// Random trees: depth <= 5, random branching, random variables per node.
    fn arb_tree() -> impl Strategy<Value = (RegistryTree, Vec<JointDescriptor>)> {
        let nodes = prop::collection::vec(
            (0usize..64, prop::collection::vec(arb_kind(), 0..6)),
            0..24,
        );
        let joints = prop::collection::vec(0u8..2, 0..4);
        (nodes, joints).prop_map(|(node_specs, joint_kinds)| {
            let mut tree = RegistryTree::new("root");
            let mut ids = vec![NodeId::ROOT];
            let mut depths = vec![0usize];
            for (i, (parent_pick, kinds)) in node_specs.into_iter().enumerate() {
                // Only attach below nodes shallower than the depth cap.
                let candidates: Vec<usize> =
                    (0..ids.len()).filter(|&n| depths[n] < 5).collect();
                let parent_index = candidates[parent_pick % candidates.len()];
                let parent = ids[parent_index];
                let id = tree.add_child(parent, format!("node{i}")).unwrap();
                ids.push(id);
                depths.push(depths[parent_index] + 1);
                for (v, kind) in kinds.into_iter().enumerate() {
                    let descriptor = if kind == VariableKind::Enum {
                        VariableDescriptor::new_enum(
                            format!("var{v}"),
                            vec!["A".into(), "B".into()],
                        )
                    } else {
                        VariableDescriptor::new(format!("var{v}"), kind)
                    };
                    tree.add_variable(id, descriptor).unwrap();
                }
            }
            let joints = joint_kinds
                .into_iter()
                .enumerate()
                .map(|(i, k)| {
                    JointDescriptor::new(
                        format!("joint{i}"),
                        JointKind::from_tag(k).unwrap(),
                    )
                })
                .collect();
            (tree, joints)
        })
    }

    proptest! {
        #[test]
        fn prop_handshake_round_trip((tree, joints) in arb_tree()) {
            let schema = Schema::from_tree(&tree, &joints, 0.004).unwrap();
            let blob = HandshakeBlob::from_schema(&schema);
            let parsed = blob.parse().unwrap();
            prop_assert_eq!(&*parsed, &*schema);

            // Slot ordering is the contract: every full name maps back to the
            // same slot on both sides.
            for slot in 0..schema.variable_count() {
                prop_assert_eq!(schema.full_name(slot), parsed.full_name(slot));
            }
        }
    }
}
