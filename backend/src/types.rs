// types.rs — Element type descriptors and host values
//
// A `TypeDescriptor` names the element type of a Portable Array: a scalar kind
// or a composite record of 1..=11 nested descriptors. `Value` is the host-side
// element that `put`/`get` copy in and out.
//
// Preconditions: none.
// Postconditions: every composite descriptor built through `composite()` or
//                 the grammar parser has arity within `1..=MAX_ARITY`.
// Failure modes: `TypeError::UnsupportedArity` for empty or oversized records.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Largest supported tuple arity.
pub const MAX_ARITY: usize = 11;

// ── Scalar kinds ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScalarKind {
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Boolean,
}

impl ScalarKind {
    pub const ALL: [ScalarKind; 8] = [
        ScalarKind::Byte,
        ScalarKind::Char,
        ScalarKind::Short,
        ScalarKind::Int,
        ScalarKind::Long,
        ScalarKind::Float,
        ScalarKind::Double,
        ScalarKind::Boolean,
    ];

    /// Element width in bytes inside byte-buffer storage and device memory.
    pub fn byte_size(self) -> usize {
        match self {
            ScalarKind::Byte | ScalarKind::Char | ScalarKind::Boolean => 1,
            ScalarKind::Short => 2,
            ScalarKind::Int | ScalarKind::Float => 4,
            ScalarKind::Long | ScalarKind::Double => 8,
        }
    }

    /// OpenCL C spelling of the kind.
    pub fn ocl_name(self) -> &'static str {
        match self {
            ScalarKind::Byte => "char",
            ScalarKind::Char => "uchar",
            ScalarKind::Short => "short",
            ScalarKind::Int => "int",
            ScalarKind::Long => "long",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::Boolean => "bool",
        }
    }

    /// Spelling used by the tuple-type grammar (`Tuple2<Float,Integer>`).
    pub fn grammar_name(self) -> &'static str {
        match self {
            ScalarKind::Byte => "Byte",
            ScalarKind::Char => "Character",
            ScalarKind::Short => "Short",
            ScalarKind::Int => "Integer",
            ScalarKind::Long => "Long",
            ScalarKind::Float => "Float",
            ScalarKind::Double => "Double",
            ScalarKind::Boolean => "Boolean",
        }
    }

    pub fn from_grammar_name(name: &str) -> Option<Self> {
        ScalarKind::ALL
            .into_iter()
            .find(|k| k.grammar_name() == name)
    }

    pub fn is_floating(self) -> bool {
        matches!(self, ScalarKind::Float | ScalarKind::Double)
    }

    /// Kinds whose arithmetic is lowered on integer registers.
    pub fn is_integral(self) -> bool {
        !self.is_floating() && self != ScalarKind::Boolean
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.grammar_name())
    }
}

// ── Type descriptors ────────────────────────────────────────────────────────

/// Element type of a Portable Array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeDescriptor {
    Scalar(ScalarKind),
    Composite(Vec<TypeDescriptor>),
}

impl TypeDescriptor {
    pub fn scalar(kind: ScalarKind) -> Self {
        TypeDescriptor::Scalar(kind)
    }

    /// Build a composite descriptor, rejecting arities outside `1..=11`.
    pub fn composite(fields: Vec<TypeDescriptor>) -> Result<Self, TypeError> {
        if fields.is_empty() || fields.len() > MAX_ARITY {
            return Err(TypeError::UnsupportedArity(fields.len()));
        }
        Ok(TypeDescriptor::Composite(fields))
    }

    /// `TupleN` of one repeated scalar kind.
    pub fn uniform(kind: ScalarKind, arity: usize) -> Result<Self, TypeError> {
        Self::composite(vec![TypeDescriptor::Scalar(kind); arity])
    }

    /// Re-check the arity invariant on descriptors that arrived through serde.
    pub fn validate(&self) -> Result<(), TypeError> {
        match self {
            TypeDescriptor::Scalar(_) => Ok(()),
            TypeDescriptor::Composite(fields) => {
                if fields.is_empty() || fields.len() > MAX_ARITY {
                    return Err(TypeError::UnsupportedArity(fields.len()));
                }
                fields.iter().try_for_each(TypeDescriptor::validate)
            }
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, TypeDescriptor::Composite(_))
    }

    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            TypeDescriptor::Scalar(k) => Some(*k),
            TypeDescriptor::Composite(_) => None,
        }
    }

    /// Number of positional fields; scalars count as one.
    pub fn arity(&self) -> usize {
        match self {
            TypeDescriptor::Scalar(_) => 1,
            TypeDescriptor::Composite(fields) => fields.len(),
        }
    }

    /// Nested descriptors; empty for scalars.
    pub fn fields(&self) -> &[TypeDescriptor] {
        match self {
            TypeDescriptor::Scalar(_) => &[],
            TypeDescriptor::Composite(fields) => fields,
        }
    }

    /// Deterministic OpenCL type name. A one-field record collapses to its
    /// field; otherwise `Tuple_` followed by one token per field, where a
    /// nested record spells its arity (`Tuple2_int_long`) so that distinct
    /// shapes never share a name.
    pub fn struct_name(&self) -> String {
        match self {
            TypeDescriptor::Composite(fields) if fields.len() > 1 => {
                let mut name = String::from("Tuple");
                for field in fields {
                    name.push('_');
                    field.push_name_token(&mut name);
                }
                name
            }
            _ => {
                let mut name = String::new();
                self.push_name_token(&mut name);
                name
            }
        }
    }

    fn push_name_token(&self, out: &mut String) {
        match self {
            TypeDescriptor::Scalar(k) => out.push_str(k.ocl_name()),
            TypeDescriptor::Composite(fields) if fields.len() == 1 => {
                fields[0].push_name_token(out)
            }
            TypeDescriptor::Composite(fields) => {
                out.push_str("Tuple");
                out.push_str(&fields.len().to_string());
                for field in fields {
                    out.push('_');
                    field.push_name_token(out);
                }
            }
        }
    }

    /// Whether this descriptor needs a struct declaration in kernel text.
    pub fn needs_struct(&self) -> bool {
        matches!(self, TypeDescriptor::Composite(fields) if fields.len() > 1)
    }

    /// Infer the descriptor of a sample value.
    pub fn infer_from_value(value: &Value) -> Result<Self, TypeError> {
        match value {
            Value::Tuple(items) => {
                let fields = items
                    .iter()
                    .map(TypeDescriptor::infer_from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Self::composite(fields)
            }
            scalar => Ok(TypeDescriptor::Scalar(scalar.kind().unwrap_or(ScalarKind::Int))),
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeDescriptor::Scalar(k) => write!(f, "{}", k),
            TypeDescriptor::Composite(fields) => {
                write!(f, "Tuple{}<", fields.len())?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", field)?;
                }
                f.write_str(">")
            }
        }
    }
}

impl std::str::FromStr for TypeDescriptor {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::parser::parse_type(s)
    }
}

// ── Host values ─────────────────────────────────────────────────────────────

/// An element as seen by the host: a scalar or a positional tuple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Byte(i8),
    Char(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn kind(&self) -> Option<ScalarKind> {
        Some(match self {
            Value::Byte(_) => ScalarKind::Byte,
            Value::Char(_) => ScalarKind::Char,
            Value::Short(_) => ScalarKind::Short,
            Value::Int(_) => ScalarKind::Int,
            Value::Long(_) => ScalarKind::Long,
            Value::Float(_) => ScalarKind::Float,
            Value::Double(_) => ScalarKind::Double,
            Value::Boolean(_) => ScalarKind::Boolean,
            Value::Tuple(_) => return None,
        })
    }

    /// The default element of a type: zero, `false`, or a tuple of defaults.
    pub fn zero(ty: &TypeDescriptor) -> Value {
        match ty {
            TypeDescriptor::Scalar(k) => Value::Int(0).cast(*k),
            TypeDescriptor::Composite(fields) => {
                Value::Tuple(fields.iter().map(Value::zero).collect())
            }
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Byte(v) => *v as f64,
            Value::Char(v) => *v as f64,
            Value::Short(v) => *v as f64,
            Value::Int(v) => *v as f64,
            Value::Long(v) => *v as f64,
            Value::Float(v) => *v as f64,
            Value::Double(v) => *v,
            Value::Boolean(v) => u8::from(*v) as f64,
            Value::Tuple(_) => 0.0,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Byte(v) => *v as i64,
            Value::Char(v) => *v as i64,
            Value::Short(v) => *v as i64,
            Value::Int(v) => *v as i64,
            Value::Long(v) => *v,
            Value::Float(v) => *v as i64,
            Value::Double(v) => *v as i64,
            Value::Boolean(v) => i64::from(*v),
            Value::Tuple(_) => 0,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Float(_) | Value::Double(_) => self.as_f64() != 0.0,
            Value::Tuple(_) => false,
            _ => self.as_i64() != 0,
        }
    }

    /// Numeric conversion with C cast semantics. Tuples are returned unchanged.
    pub fn cast(&self, kind: ScalarKind) -> Value {
        if let Value::Tuple(_) = self {
            return self.clone();
        }
        if self.kind() == Some(kind) {
            return self.clone();
        }
        let floating = matches!(self, Value::Float(_) | Value::Double(_));
        match kind {
            ScalarKind::Float => Value::Float(self.as_f64() as f32),
            ScalarKind::Double => Value::Double(self.as_f64()),
            ScalarKind::Boolean => Value::Boolean(self.as_bool()),
            integral => {
                let v = if floating {
                    self.as_f64() as i64
                } else {
                    self.as_i64()
                };
                match integral {
                    ScalarKind::Byte => Value::Byte(v as i8),
                    ScalarKind::Char => Value::Char(v as u8),
                    ScalarKind::Short => Value::Short(v as i16),
                    ScalarKind::Int => Value::Int(v as i32),
                    _ => Value::Long(v),
                }
            }
        }
    }

    /// Field `index` of a tuple, or the value itself for `index == 0` on a scalar.
    pub fn field(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Tuple(items) => items.get(index),
            scalar if index == 0 => Some(scalar),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Byte(v) => write!(f, "{}", v),
            Value::Char(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Double(v) => write!(f, "{:?}", v),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(a: ScalarKind, b: ScalarKind) -> TypeDescriptor {
        TypeDescriptor::composite(vec![TypeDescriptor::Scalar(a), TypeDescriptor::Scalar(b)])
            .unwrap()
    }

    #[test]
    fn byte_sizes_match_device_layout() {
        let sizes: Vec<usize> = ScalarKind::ALL.iter().map(|k| k.byte_size()).collect();
        assert_eq!(sizes, vec![1, 1, 2, 4, 8, 4, 8, 1]);
    }

    #[test]
    fn composite_rejects_bad_arity() {
        assert_eq!(
            TypeDescriptor::composite(vec![]),
            Err(TypeError::UnsupportedArity(0))
        );
        assert_eq!(
            TypeDescriptor::uniform(ScalarKind::Int, 12),
            Err(TypeError::UnsupportedArity(12))
        );
        assert!(TypeDescriptor::uniform(ScalarKind::Int, 11).is_ok());
    }

    #[test]
    fn struct_names_are_deterministic() {
        let t = pair(ScalarKind::Float, ScalarKind::Int);
        assert_eq!(t.struct_name(), "Tuple_float_int");
        assert_eq!(t.struct_name(), t.clone().struct_name());
        let single = TypeDescriptor::uniform(ScalarKind::Double, 1).unwrap();
        assert_eq!(single.struct_name(), "double");
        assert!(!single.needs_struct());
        assert!(t.needs_struct());
    }

    #[test]
    fn display_uses_grammar_spelling() {
        let t = pair(ScalarKind::Float, ScalarKind::Int);
        assert_eq!(t.to_string(), "Tuple2<Float,Integer>");
    }

    #[test]
    fn infer_from_nested_value() {
        let v = Value::Tuple(vec![
            Value::Float(1.0),
            Value::Tuple(vec![Value::Int(1), Value::Long(2)]),
        ]);
        let t = TypeDescriptor::infer_from_value(&v).unwrap();
        assert_eq!(t.arity(), 2);
        assert_eq!(t.fields()[1], pair(ScalarKind::Int, ScalarKind::Long));
        assert_eq!(t.struct_name(), "Tuple_float_Tuple2_int_long");
    }

    #[test]
    fn nested_shapes_get_distinct_names() {
        let f = || TypeDescriptor::Scalar(ScalarKind::Float);
        let wide_inner = TypeDescriptor::composite(vec![
            pair(ScalarKind::Float, ScalarKind::Float),
            f(),
            f(),
        ])
        .unwrap();
        let wide_outer = TypeDescriptor::composite(vec![
            TypeDescriptor::composite(vec![f(), f(), f()]).unwrap(),
            f(),
        ])
        .unwrap();
        assert_eq!(wide_inner.struct_name(), "Tuple_Tuple2_float_float_float_float");
        assert_eq!(wide_outer.struct_name(), "Tuple_Tuple3_float_float_float_float");
        assert_ne!(wide_inner.struct_name(), wide_outer.struct_name());
    }

    #[test]
    fn cast_follows_c_semantics() {
        assert_eq!(Value::Double(3.9).cast(ScalarKind::Int), Value::Int(3));
        assert_eq!(Value::Int(300).cast(ScalarKind::Char), Value::Char(44));
        assert_eq!(Value::Int(2).cast(ScalarKind::Double), Value::Double(2.0));
        assert_eq!(Value::Int(0).cast(ScalarKind::Boolean), Value::Boolean(false));
    }

    #[test]
    fn zero_of_composite() {
        let t = pair(ScalarKind::Float, ScalarKind::Boolean);
        assert_eq!(
            Value::zero(&t),
            Value::Tuple(vec![Value::Float(0.0), Value::Boolean(false)])
        );
    }
}
