// ir.rs — Closed SSA graph consumed by the kernel generator
//
// A graph is a flat node table indexed by `NodeId`. Control nodes carry
// their successors; value nodes float and are reached through the operand
// edges of the control nodes that use them. Phi values are ordered by the
// ends of their merge (for a loop: entry value first, then one value per
// `LoopEnd` in node order).
//
// Preconditions: graphs come from a front end or from `GraphBuilder`.
// Postconditions: `Graph::validate` guarantees every referenced id exists
//                 and sits in a control or value position as required.
// Failure modes: dangling ids → `CodegenError::MissingNode`; misplaced
//                nodes → `CodegenError::UnsupportedNode`.
// Side effects: none.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CodegenError;
use crate::id::{IdAllocator, NodeId};
use crate::symbols::ValueKind;
use crate::types::{ScalarKind, TypeDescriptor, Value};

// ── Operators ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    UShr,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr | BinaryOp::UShr => ">>",
        }
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr)
    }

    pub fn is_bitwise(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or | BinaryOp::Xor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// OpenCL math built-ins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathOp {
    Sqrt,
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Fabs,
    Floor,
    Ceil,
    Pow,
    Fmin,
    Fmax,
    Hypot,
}

impl MathOp {
    pub fn name(self) -> &'static str {
        match self {
            MathOp::Sqrt => "sqrt",
            MathOp::Sin => "sin",
            MathOp::Cos => "cos",
            MathOp::Tan => "tan",
            MathOp::Exp => "exp",
            MathOp::Log => "log",
            MathOp::Fabs => "fabs",
            MathOp::Floor => "floor",
            MathOp::Ceil => "ceil",
            MathOp::Pow => "pow",
            MathOp::Fmin => "fmin",
            MathOp::Fmax => "fmax",
            MathOp::Hypot => "hypot",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            MathOp::Pow | MathOp::Fmin | MathOp::Fmax | MathOp::Hypot => 2,
            _ => 1,
        }
    }
}

/// Nodes that only re-label their input (type pins, boxing, proxies).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Passthrough {
    Pi,
    Box,
    Unbox,
    CheckCast,
    ValueProxy,
}

// ── Parameters and call targets ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamType {
    Scalar(ScalarKind),
    /// A tuple passed by value.
    Tuple(TypeDescriptor),
    /// A global array of the given element type.
    Array(TypeDescriptor),
}

impl ParamType {
    pub fn value_kind(&self) -> ValueKind {
        match self {
            ParamType::Scalar(k) => ValueKind::Scalar(*k),
            ParamType::Tuple(ty) => ValueKind::of(ty),
            ParamType::Array(ty) => ValueKind::Array(ty.clone()),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ParamType::Array(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallTarget {
    /// Accessor for component `component` (0-based) of an arity-`arity` tuple.
    TupleField { arity: usize, component: usize },
    /// A lambda graph of the same request, by graph name.
    Lambda(String),
    /// A function available in OpenCL C under this name.
    Builtin(String),
}

// ── Nodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    // Control.
    Start { next: NodeId },
    Begin { next: NodeId },
    End { merge: NodeId },
    Merge { next: NodeId },
    If { condition: NodeId, on_true: NodeId, on_false: NodeId },
    /// `bound` is the trip count known to the front end; reductions use it.
    LoopBegin { next: NodeId, bound: Option<NodeId> },
    LoopEnd { loop_begin: NodeId },
    LoopExit { loop_begin: NodeId, next: NodeId },
    StoreIndexed { array: NodeId, index: NodeId, value: NodeId, next: NodeId },
    StoreField { object: NodeId, field: usize, value: NodeId, next: NodeId },
    FixedGuard { condition: NodeId, negated: bool, next: NodeId },
    Return { value: Option<NodeId> },
    Deoptimize,

    // Values.
    Parameter { index: usize, ty: ParamType },
    Constant(Value),
    Unary { op: UnaryOp, x: NodeId },
    Binary { op: BinaryOp, x: NodeId, y: NodeId },
    Compare { op: CompareOp, x: NodeId, y: NodeId },
    /// -1, 0 or 1 as `x` is less than, equal to or greater than `y`.
    NormalizeCompare { x: NodeId, y: NodeId },
    Conditional { condition: NodeId, on_true: NodeId, on_false: NodeId },
    Convert { to: ScalarKind, value: NodeId },
    Passthrough { op: Passthrough, value: NodeId },
    Math { op: MathOp, args: Vec<NodeId> },
    ArrayLength { array: NodeId },
    LoadIndexed { array: NodeId, index: NodeId },
    LoadField { object: NodeId, field: usize },
    NewInstance { ty: TypeDescriptor, fields: Vec<NodeId> },
    NewArray { element: ScalarKind, length: usize },
    Invoke { target: CallTarget, args: Vec<NodeId>, ret: TypeDescriptor },
    /// Element-wise application of lambda `lambda` over `array`, written
    /// into a local buffer of `capacity` elements of type `element`.
    MapChain { lambda: String, array: NodeId, capacity: usize, element: TypeDescriptor },
    Phi { merge: NodeId, values: Vec<NodeId> },

    /// A node the generator has no lowering for. Allowed in either position;
    /// in control position `next` continues the walk.
    Unsupported { name: String, inputs: Vec<NodeId>, next: Option<NodeId> },
}

impl NodeKind {
    /// Short kind name used in diagnostics and comments.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Start { .. } => "Start",
            NodeKind::Begin { .. } => "Begin",
            NodeKind::End { .. } => "End",
            NodeKind::Merge { .. } => "Merge",
            NodeKind::If { .. } => "If",
            NodeKind::LoopBegin { .. } => "LoopBegin",
            NodeKind::LoopEnd { .. } => "LoopEnd",
            NodeKind::LoopExit { .. } => "LoopExit",
            NodeKind::StoreIndexed { .. } => "StoreIndexed",
            NodeKind::StoreField { .. } => "StoreField",
            NodeKind::FixedGuard { .. } => "FixedGuard",
            NodeKind::Return { .. } => "Return",
            NodeKind::Deoptimize => "Deoptimize",
            NodeKind::Parameter { .. } => "Parameter",
            NodeKind::Constant(_) => "Constant",
            NodeKind::Unary { .. } => "Unary",
            NodeKind::Binary { .. } => "Binary",
            NodeKind::Compare { .. } => "Compare",
            NodeKind::NormalizeCompare { .. } => "NormalizeCompare",
            NodeKind::Conditional { .. } => "Conditional",
            NodeKind::Convert { .. } => "Convert",
            NodeKind::Passthrough { .. } => "Passthrough",
            NodeKind::Math { .. } => "Math",
            NodeKind::ArrayLength { .. } => "ArrayLength",
            NodeKind::LoadIndexed { .. } => "LoadIndexed",
            NodeKind::LoadField { .. } => "LoadField",
            NodeKind::NewInstance { .. } => "NewInstance",
            NodeKind::NewArray { .. } => "NewArray",
            NodeKind::Invoke { .. } => "Invoke",
            NodeKind::MapChain { .. } => "MapChain",
            NodeKind::Phi { .. } => "Phi",
            NodeKind::Unsupported { .. } => "Unsupported",
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self,
            NodeKind::Start { .. }
                | NodeKind::Begin { .. }
                | NodeKind::End { .. }
                | NodeKind::Merge { .. }
                | NodeKind::If { .. }
                | NodeKind::LoopBegin { .. }
                | NodeKind::LoopEnd { .. }
                | NodeKind::LoopExit { .. }
                | NodeKind::StoreIndexed { .. }
                | NodeKind::StoreField { .. }
                | NodeKind::FixedGuard { .. }
                | NodeKind::Return { .. }
                | NodeKind::Deoptimize
        )
    }

    pub fn is_value(&self) -> bool {
        !self.is_control() || matches!(self, NodeKind::Unsupported { .. })
    }

    /// Value operands, in evaluation order.
    pub fn inputs(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Start { .. }
            | NodeKind::Begin { .. }
            | NodeKind::End { .. }
            | NodeKind::Merge { .. }
            | NodeKind::LoopEnd { .. }
            | NodeKind::LoopExit { .. }
            | NodeKind::Deoptimize
            | NodeKind::Parameter { .. }
            | NodeKind::Constant(_)
            | NodeKind::NewArray { .. } => Vec::new(),
            NodeKind::If { condition, .. } | NodeKind::FixedGuard { condition, .. } => {
                vec![*condition]
            }
            NodeKind::LoopBegin { bound, .. } => bound.iter().copied().collect(),
            NodeKind::StoreIndexed { array, index, value, .. } => vec![*array, *index, *value],
            NodeKind::StoreField { object, value, .. } => vec![*object, *value],
            NodeKind::Return { value } => value.iter().copied().collect(),
            NodeKind::Unary { x, .. } => vec![*x],
            NodeKind::Binary { x, y, .. }
            | NodeKind::Compare { x, y, .. }
            | NodeKind::NormalizeCompare { x, y } => vec![*x, *y],
            NodeKind::Conditional { condition, on_true, on_false } => {
                vec![*condition, *on_true, *on_false]
            }
            NodeKind::Convert { value, .. } | NodeKind::Passthrough { value, .. } => vec![*value],
            NodeKind::Math { args, .. } | NodeKind::Invoke { args, .. } => args.clone(),
            NodeKind::ArrayLength { array } => vec![*array],
            NodeKind::LoadIndexed { array, index } => vec![*array, *index],
            NodeKind::LoadField { object, .. } => vec![*object],
            NodeKind::NewInstance { fields, .. } => fields.clone(),
            NodeKind::MapChain { array, .. } => vec![*array],
            NodeKind::Phi { values, .. } => values.clone(),
            NodeKind::Unsupported { inputs, .. } => inputs.clone(),
        }
    }

    /// Control successors.
    pub fn successors(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Start { next }
            | NodeKind::Begin { next }
            | NodeKind::Merge { next }
            | NodeKind::LoopBegin { next, .. }
            | NodeKind::LoopExit { next, .. }
            | NodeKind::StoreIndexed { next, .. }
            | NodeKind::StoreField { next, .. }
            | NodeKind::FixedGuard { next, .. } => vec![*next],
            NodeKind::End { merge } => vec![*merge],
            NodeKind::If { on_true, on_false, .. } => vec![*on_true, *on_false],
            NodeKind::Unsupported { next, .. } => next.iter().copied().collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<Node>,
}

impl Graph {
    pub fn node(&self, id: NodeId) -> Result<&Node, CodegenError> {
        self.nodes
            .get(id.index())
            .filter(|n| n.id == id)
            .ok_or(CodegenError::MissingNode(id))
    }

    pub fn kind(&self, id: NodeId) -> Result<&NodeKind, CodegenError> {
        self.node(id).map(|n| &n.kind)
    }

    pub fn start(&self) -> Result<NodeId, CodegenError> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start { .. }))
            .map(|n| n.id)
            .ok_or_else(|| CodegenError::MissingStart(self.name.clone()))
    }

    /// Parameter nodes sorted by parameter index.
    pub fn parameters(&self) -> Vec<(NodeId, usize, &ParamType)> {
        let mut params: Vec<_> = self
            .nodes
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::Parameter { index, ty } => Some((n.id, *index, ty)),
                _ => None,
            })
            .collect();
        params.sort_by_key(|(_, index, _)| *index);
        params
    }

    /// Phis attached to `merge` (a `Merge` or `LoopBegin`), in node order.
    pub fn phis_of(&self, merge: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| matches!(&n.kind, NodeKind::Phi { merge: m, .. } if *m == merge))
            .map(|n| n.id)
            .collect()
    }

    /// Forward ends of a `Merge`, or back edges of a `LoopBegin`, in node order.
    pub fn ends_of(&self, merge: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| match &n.kind {
                NodeKind::End { merge: m } => *m == merge,
                NodeKind::LoopEnd { loop_begin } => *loop_begin == merge,
                _ => false,
            })
            .map(|n| n.id)
            .collect()
    }

    /// Phis whose merge is a forward `Merge` (not a loop header).
    pub fn merge_phis(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| match &n.kind {
                NodeKind::Phi { merge, .. } => {
                    matches!(self.kind(*merge), Ok(NodeKind::Merge { .. }))
                }
                _ => false,
            })
            .map(|n| n.id)
            .collect()
    }

    /// Value of `phi` along the given end.
    pub fn phi_value_at(&self, phi: NodeId, end: NodeId) -> Result<NodeId, CodegenError> {
        let NodeKind::Phi { merge, values } = self.kind(phi)? else {
            return Err(self.misplaced(phi));
        };
        let slot = match self.kind(*merge)? {
            NodeKind::LoopBegin { .. } => self
                .ends_of(*merge)
                .iter()
                .position(|e| *e == end)
                .map(|p| p + 1),
            _ => self.ends_of(*merge).iter().position(|e| *e == end),
        };
        slot.and_then(|s| values.get(s).copied())
            .ok_or(CodegenError::MissingNode(end))
    }

    /// Kind of the value returned by the graph's `Return` nodes.
    pub fn return_kind(&self) -> ValueKind {
        self.nodes
            .iter()
            .find_map(|n| match &n.kind {
                NodeKind::Return { value: Some(v) } => Some(self.infer_kind(*v)),
                _ => None,
            })
            .unwrap_or(ValueKind::Void)
    }

    /// Static kind of a value node. Control nodes are `Void`; anything that
    /// cannot be typed is `Illegal`.
    pub fn infer_kind(&self, id: NodeId) -> ValueKind {
        let mut visiting = HashSet::new();
        self.infer_inner(id, &mut visiting)
    }

    fn infer_inner(&self, id: NodeId, visiting: &mut HashSet<NodeId>) -> ValueKind {
        if !visiting.insert(id) {
            return ValueKind::Illegal;
        }
        let kind = match self.kind(id) {
            Ok(kind) => self.infer_kind_of(kind, visiting),
            Err(_) => ValueKind::Illegal,
        };
        visiting.remove(&id);
        kind
    }

    fn infer_kind_of(&self, kind: &NodeKind, visiting: &mut HashSet<NodeId>) -> ValueKind {
        let mut infer = |id: NodeId| self.infer_inner(id, visiting);
        match kind {
            NodeKind::Parameter { ty, .. } => ty.value_kind(),
            NodeKind::Constant(value) => match value.kind() {
                Some(k) => ValueKind::Scalar(k),
                None => ValueKind::Illegal,
            },
            NodeKind::Unary { op, x } => match (op, infer(*x)) {
                (UnaryOp::Not, ValueKind::Scalar(ScalarKind::Boolean)) => {
                    ValueKind::Scalar(ScalarKind::Boolean)
                }
                (UnaryOp::Not, ValueKind::Scalar(k)) if k.is_integral() => {
                    ValueKind::Scalar(promote(k, k))
                }
                (UnaryOp::Neg, ValueKind::Scalar(k)) if k != ScalarKind::Boolean => {
                    ValueKind::Scalar(promote(k, k))
                }
                _ => ValueKind::Illegal,
            },
            NodeKind::Binary { op, x, y } => match (infer(*x), infer(*y)) {
                (ValueKind::Scalar(a), ValueKind::Scalar(b)) => binary_kind(*op, a, b),
                _ => ValueKind::Illegal,
            },
            NodeKind::Compare { x, y, .. } => match (infer(*x), infer(*y)) {
                (ValueKind::Scalar(_), ValueKind::Scalar(_)) => {
                    ValueKind::Scalar(ScalarKind::Boolean)
                }
                _ => ValueKind::Illegal,
            },
            NodeKind::NormalizeCompare { x, y } => match (infer(*x), infer(*y)) {
                (ValueKind::Scalar(_), ValueKind::Scalar(_)) => ValueKind::Scalar(ScalarKind::Int),
                _ => ValueKind::Illegal,
            },
            NodeKind::Conditional { on_true, on_false, .. } => {
                let t = infer(*on_true);
                let f = infer(*on_false);
                match (t, f) {
                    (ValueKind::Scalar(a), ValueKind::Scalar(b)) if a != b => {
                        ValueKind::Scalar(promote(a, b))
                    }
                    (t, f) if t == f => t,
                    _ => ValueKind::Illegal,
                }
            }
            NodeKind::Convert { to, value } => match infer(*value) {
                ValueKind::Scalar(_) => ValueKind::Scalar(*to),
                _ => ValueKind::Illegal,
            },
            NodeKind::Passthrough { value, .. } => infer(*value),
            NodeKind::Math { args, .. } => {
                let mut result = ScalarKind::Float;
                for arg in args {
                    match infer(*arg) {
                        ValueKind::Scalar(ScalarKind::Double) => result = ScalarKind::Double,
                        ValueKind::Scalar(ScalarKind::Boolean) => return ValueKind::Illegal,
                        ValueKind::Scalar(k) if k.is_integral() => result = ScalarKind::Double,
                        ValueKind::Scalar(_) => {}
                        _ => return ValueKind::Illegal,
                    }
                }
                ValueKind::Scalar(result)
            }
            NodeKind::ArrayLength { array } => match infer(*array) {
                ValueKind::Array(_) => ValueKind::Scalar(ScalarKind::Int),
                _ => ValueKind::Illegal,
            },
            NodeKind::LoadIndexed { array, .. } => match infer(*array) {
                ValueKind::Array(elem) => ValueKind::of(&elem),
                _ => ValueKind::Illegal,
            },
            NodeKind::LoadField { object, field } => match infer(*object) {
                ValueKind::Struct(ty) => ty
                    .fields()
                    .get(*field)
                    .map(ValueKind::of)
                    .unwrap_or(ValueKind::Illegal),
                _ => ValueKind::Illegal,
            },
            NodeKind::NewInstance { ty, .. } => ValueKind::of(ty),
            NodeKind::NewArray { element, .. } => {
                ValueKind::Array(TypeDescriptor::scalar(*element))
            }
            NodeKind::Invoke { ret, .. } => ValueKind::of(ret),
            NodeKind::MapChain { element, .. } => ValueKind::Array(element.clone()),
            NodeKind::Phi { values, .. } => match values.first() {
                Some(first) => infer(*first),
                None => ValueKind::Illegal,
            },
            NodeKind::Unsupported { .. } => ValueKind::Illegal,
            NodeKind::Start { .. }
            | NodeKind::Begin { .. }
            | NodeKind::End { .. }
            | NodeKind::Merge { .. }
            | NodeKind::If { .. }
            | NodeKind::LoopBegin { .. }
            | NodeKind::LoopEnd { .. }
            | NodeKind::LoopExit { .. }
            | NodeKind::StoreIndexed { .. }
            | NodeKind::StoreField { .. }
            | NodeKind::FixedGuard { .. }
            | NodeKind::Return { .. }
            | NodeKind::Deoptimize => ValueKind::Void,
        }
    }

    /// Check that every edge points at an existing node of the right sort.
    pub fn validate(&self) -> Result<(), CodegenError> {
        for (position, node) in self.nodes.iter().enumerate() {
            if node.id.index() != position {
                return Err(CodegenError::MissingNode(NodeId(position as u32)));
            }
        }
        self.start()?;
        for node in &self.nodes {
            for input in node.kind.inputs() {
                if !self.kind(input)?.is_value() {
                    return Err(self.misplaced(input));
                }
            }
            for succ in node.kind.successors() {
                if !self.kind(succ)?.is_control() && !self.is_control_unsupported(succ) {
                    return Err(self.misplaced(succ));
                }
            }
            match &node.kind {
                NodeKind::End { merge } => {
                    if !matches!(self.kind(*merge)?, NodeKind::Merge { .. }) {
                        return Err(self.misplaced(*merge));
                    }
                }
                NodeKind::LoopEnd { loop_begin } | NodeKind::LoopExit { loop_begin, .. } => {
                    if !matches!(self.kind(*loop_begin)?, NodeKind::LoopBegin { .. }) {
                        return Err(self.misplaced(*loop_begin));
                    }
                }
                NodeKind::Phi { merge, .. } => {
                    if !matches!(
                        self.kind(*merge)?,
                        NodeKind::Merge { .. } | NodeKind::LoopBegin { .. }
                    ) {
                        return Err(self.misplaced(*merge));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn is_control_unsupported(&self, id: NodeId) -> bool {
        matches!(self.kind(id), Ok(NodeKind::Unsupported { .. }))
    }

    pub(crate) fn misplaced(&self, id: NodeId) -> CodegenError {
        let kind = self.kind(id).map(NodeKind::name).unwrap_or("?");
        CodegenError::UnsupportedNode { node: id, kind }
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph {} ({} nodes)", self.name, self.nodes.len())?;
        for node in &self.nodes {
            write!(f, "  {} = {}", node.id, node.kind.name())?;
            let inputs = node.kind.inputs();
            if !inputs.is_empty() {
                let list: Vec<String> = inputs.iter().map(|i| i.to_string()).collect();
                write!(f, "({})", list.join(", "))?;
            }
            let succs = node.kind.successors();
            if !succs.is_empty() {
                let list: Vec<String> = succs.iter().map(|s| s.to_string()).collect();
                write!(f, " -> {}", list.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Typing helpers ──────────────────────────────────────────────────────────

/// C arithmetic promotion of two scalar kinds.
pub fn promote(a: ScalarKind, b: ScalarKind) -> ScalarKind {
    use ScalarKind::*;
    if a == Double || b == Double {
        Double
    } else if a == Float || b == Float {
        Float
    } else if a == Long || b == Long {
        Long
    } else {
        Int
    }
}

fn binary_kind(op: BinaryOp, a: ScalarKind, b: ScalarKind) -> ValueKind {
    let both_bool = a == ScalarKind::Boolean && b == ScalarKind::Boolean;
    if op.is_bitwise() && both_bool {
        return ValueKind::Scalar(ScalarKind::Boolean);
    }
    if a == ScalarKind::Boolean || b == ScalarKind::Boolean {
        return ValueKind::Illegal;
    }
    if op.is_shift() {
        return if a.is_integral() && b.is_integral() {
            ValueKind::Scalar(promote(a, a))
        } else {
            ValueKind::Illegal
        };
    }
    if op.is_bitwise() && !(a.is_integral() && b.is_integral()) {
        return ValueKind::Illegal;
    }
    ValueKind::Scalar(promote(a, b))
}

// ── Builder ─────────────────────────────────────────────────────────────────

/// Incremental graph construction. Control nodes whose successors are not
/// known yet are `reserve`d and filled in later with `set`.
#[derive(Debug)]
pub struct GraphBuilder {
    name: String,
    ids: IdAllocator,
    kinds: Vec<Option<NodeKind>>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        GraphBuilder {
            name: name.into(),
            ids: IdAllocator::new(),
            kinds: Vec::new(),
        }
    }

    pub fn reserve(&mut self) -> NodeId {
        let id = self.ids.alloc_node();
        self.kinds.push(None);
        id
    }

    pub fn set(&mut self, id: NodeId, kind: NodeKind) {
        if let Some(slot) = self.kinds.get_mut(id.index()) {
            *slot = Some(kind);
        }
    }

    pub fn add(&mut self, kind: NodeKind) -> NodeId {
        let id = self.reserve();
        self.set(id, kind);
        id
    }

    pub fn parameter(&mut self, index: usize, ty: ParamType) -> NodeId {
        self.add(NodeKind::Parameter { index, ty })
    }

    pub fn constant(&mut self, value: Value) -> NodeId {
        self.add(NodeKind::Constant(value))
    }

    pub fn binary(&mut self, op: BinaryOp, x: NodeId, y: NodeId) -> NodeId {
        self.add(NodeKind::Binary { op, x, y })
    }

    pub fn compare(&mut self, op: CompareOp, x: NodeId, y: NodeId) -> NodeId {
        self.add(NodeKind::Compare { op, x, y })
    }

    pub fn convert(&mut self, to: ScalarKind, value: NodeId) -> NodeId {
        self.add(NodeKind::Convert { to, value })
    }

    /// Component `component` of an arity-`arity` tuple.
    pub fn tuple_field(
        &mut self,
        tuple: NodeId,
        arity: usize,
        component: usize,
        ret: TypeDescriptor,
    ) -> NodeId {
        self.add(NodeKind::Invoke {
            target: CallTarget::TupleField { arity, component },
            args: vec![tuple],
            ret,
        })
    }

    pub fn finish(self) -> Result<Graph, CodegenError> {
        let mut nodes = Vec::with_capacity(self.kinds.len());
        for (index, kind) in self.kinds.into_iter().enumerate() {
            let id = NodeId(index as u32);
            nodes.push(Node {
                id,
                kind: kind.ok_or(CodegenError::MissingNode(id))?,
            });
        }
        let graph = Graph {
            name: self.name,
            nodes,
        };
        graph.validate()?;
        Ok(graph)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
