//! Registry variable kinds, descriptors and values.

use serde::{Deserialize, Serialize};

use crate::{Result, StreamError};

/// Supported registry variable kinds.
///
/// Every kind travels as a uniform 8-byte bit pattern on the wire and in the
/// log files; the kind recorded in the schema decides how those bits are
/// interpreted on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableKind {
    /// True/false flag, stored as 0 or 1.
    Boolean,
    /// 32-bit signed integer, sign-extended to 64 bits.
    Integer,
    /// 64-bit signed integer.
    Long,
    /// 64-bit IEEE-754 float, stored as its exact bit pattern.
    Double,
    /// Ordinal into an enum symbol list, zero-extended to 64 bits.
    Enum,
}

impl VariableKind {
    /// Wire tag used in the handshake blob.
    pub(crate) const fn tag(self) -> u8 {
        match self {
            VariableKind::Boolean => 0,
            VariableKind::Integer => 1,
            VariableKind::Long => 2,
            VariableKind::Double => 3,
            VariableKind::Enum => 4,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(VariableKind::Boolean),
            1 => Some(VariableKind::Integer),
            2 => Some(VariableKind::Long),
            3 => Some(VariableKind::Double),
            4 => Some(VariableKind::Enum),
            _ => None,
        }
    }
}

/// Immutable description of one registry variable.
///
/// Names are unique within the owning registry node. Bounds are advisory
/// metadata carried through the handshake for consumers that want to scale
/// plots or validate inputs; they are never enforced by the stream itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    /// Variable name, unique among the siblings of its registry node.
    pub name: String,
    /// Value kind.
    pub kind: VariableKind,
    /// Ordered symbol names for `VariableKind::Enum`; empty otherwise.
    pub enum_symbols: Vec<String>,
    /// Optional human-readable description.
    pub description: String,
    /// Advisory lower bound.
    pub lower_bound: f64,
    /// Advisory upper bound.
    pub upper_bound: f64,
}

impl VariableDescriptor {
    /// Create a descriptor for a non-enum variable.
    pub fn new(name: impl Into<String>, kind: VariableKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enum_symbols: Vec::new(),
            description: String::new(),
            lower_bound: 0.0,
            upper_bound: 0.0,
        }
    }

    /// Create a descriptor for an enum variable with its ordered symbol list.
    pub fn new_enum(name: impl Into<String>, symbols: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::Enum,
            enum_symbols: symbols,
            description: String::new(),
            lower_bound: 0.0,
            upper_bound: 0.0,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Attach advisory bounds.
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower_bound = lower;
        self.upper_bound = upper;
        self
    }
}

/// Runtime value of one registry variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    /// Ordinal into the descriptor's symbol list.
    Enum(u32),
}

impl Value {
    /// The kind this value belongs to.
    pub fn kind(&self) -> VariableKind {
        match self {
            Value::Boolean(_) => VariableKind::Boolean,
            Value::Integer(_) => VariableKind::Integer,
            Value::Long(_) => VariableKind::Long,
            Value::Double(_) => VariableKind::Double,
            Value::Enum(_) => VariableKind::Enum,
        }
    }

    /// Encode as the uniform 8-byte slot representation.
    ///
    /// Doubles keep their exact IEEE-754 bit pattern; integers are
    /// sign-extended, enums zero-extended. `from_bits` inverts this exactly.
    pub fn to_bits(self) -> u64 {
        match self {
            Value::Boolean(v) => v as u64,
            Value::Integer(v) => v as i64 as u64,
            Value::Long(v) => v as u64,
            Value::Double(v) => v.to_bits(),
            Value::Enum(v) => v as u64,
        }
    }

    /// Decode a slot bit pattern according to `kind`.
    pub fn from_bits(kind: VariableKind, bits: u64) -> Self {
        match kind {
            VariableKind::Boolean => Value::Boolean(bits != 0),
            VariableKind::Integer => Value::Integer(bits as i64 as i32),
            VariableKind::Long => Value::Long(bits as i64),
            VariableKind::Double => Value::Double(f64::from_bits(bits)),
            VariableKind::Enum => Value::Enum(bits as u32),
        }
    }

    /// Convert a plain double into a value of the given kind.
    ///
    /// This is the conversion applied when a remote peer requests a variable
    /// change: the request carries a double and the producer coerces it to the
    /// variable's kind.
    pub fn from_double(kind: VariableKind, value: f64) -> Result<Self> {
        match kind {
            VariableKind::Boolean => Ok(Value::Boolean(value > 0.5)),
            VariableKind::Integer => Ok(Value::Integer(value as i32)),
            VariableKind::Long => Ok(Value::Long(value as i64)),
            VariableKind::Double => Ok(Value::Double(value)),
            VariableKind::Enum => {
                if value < 0.0 {
                    return Err(StreamError::decode(format!(
                        "negative enum ordinal {value}"
                    )));
                }
                Ok(Value::Enum(value as u32))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn kind_tags_round_trip() {
        for kind in [
            VariableKind::Boolean,
            VariableKind::Integer,
            VariableKind::Long,
            VariableKind::Double,
            VariableKind::Enum,
        ] {
            assert_eq!(VariableKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(VariableKind::from_tag(5), None);
    }

    proptest! {
        #[test]
        fn prop_double_bits_round_trip(value in any::<f64>()) {
            let bits = Value::Double(value).to_bits();
            match Value::from_bits(VariableKind::Double, bits) {
                // Bit-exact, including NaN payloads and signed zero.
                Value::Double(out) => prop_assert_eq!(out.to_bits(), value.to_bits()),
                other => prop_assert!(false, "wrong kind decoded: {:?}", other),
            }
        }

        #[test]
        fn prop_integer_bits_round_trip(value in any::<i32>()) {
            let bits = Value::Integer(value).to_bits();
            prop_assert_eq!(Value::from_bits(VariableKind::Integer, bits), Value::Integer(value));
        }

        #[test]
        fn prop_long_bits_round_trip(value in any::<i64>()) {
            let bits = Value::Long(value).to_bits();
            prop_assert_eq!(Value::from_bits(VariableKind::Long, bits), Value::Long(value));
        }

        #[test]
        fn prop_enum_bits_round_trip(ordinal in any::<u32>()) {
            let bits = Value::Enum(ordinal).to_bits();
            prop_assert_eq!(Value::from_bits(VariableKind::Enum, bits), Value::Enum(ordinal));
        }
    }

    #[test]
    fn boolean_bits() {
        assert_eq!(Value::Boolean(true).to_bits(), 1);
        assert_eq!(Value::Boolean(false).to_bits(), 0);
        assert_eq!(Value::from_bits(VariableKind::Boolean, 2), Value::Boolean(true));
    }

    #[test]
    fn negative_integer_sign_extends() {
        let bits = Value::Integer(-7).to_bits();
        assert_eq!(bits, (-7i64) as u64);
        assert_eq!(Value::from_bits(VariableKind::Integer, bits), Value::Integer(-7));
    }

    #[test]
    fn from_double_coerces_by_kind() {
        assert_eq!(Value::from_double(VariableKind::Boolean, 1.0).unwrap(), Value::Boolean(true));
        assert_eq!(Value::from_double(VariableKind::Boolean, 0.0).unwrap(), Value::Boolean(false));
        assert_eq!(Value::from_double(VariableKind::Integer, -3.9).unwrap(), Value::Integer(-3));
        assert_eq!(Value::from_double(VariableKind::Enum, 2.0).unwrap(), Value::Enum(2));
        assert!(Value::from_double(VariableKind::Enum, -1.0).is_err());
    }
}
