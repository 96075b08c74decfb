// interp.rs — Host evaluation of lambda graphs
//
// The non-accelerated path: runs lambda graphs directly over host values and
// Portable Arrays, with the same numeric semantics the generated OpenCL code
// has (C casts, wrapping integer arithmetic, masked shift amounts).
//
// Control flow is walked from `Start`; value nodes are evaluated on demand
// and memoized until the next loop back edge. Arrays live in an arena shared
// by all frames of one evaluation, so stores through a callee are visible
// to the caller.
//
// Preconditions: graphs pass `Graph::validate`.
// Postconditions: `map` and `reduce` return freshly allocated arrays.
// Failure modes: `Error::Eval` for guard failures, deoptimization points,
//                unsupported nodes, out-of-range indices and integer
//                division by zero.
// Side effects: none.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::ir::{BinaryOp, CallTarget, CompareOp, Graph, MathOp, NodeKind, UnaryOp};
use crate::parray::PArray;
use crate::storage::StorageMode;
use crate::types::{ScalarKind, TypeDescriptor, Value};

const MAX_CALL_DEPTH: usize = 64;

/// A value crossing the interpreter boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Value(Value),
    Array(Vec<Value>),
    Void,
}

#[derive(Debug, Clone)]
enum Slot {
    Val(Value),
    Arr(usize),
    Void,
}

struct Frame<'g> {
    graph: &'g Graph,
    args: Vec<Slot>,
    phis: HashMap<NodeId, Slot>,
    /// Cleared on every loop back edge.
    memo: HashMap<NodeId, Slot>,
    /// Arrays allocated by this frame; they outlive the memo.
    allocs: HashMap<NodeId, Slot>,
}

/// Evaluator over a set of named lambda graphs.
pub struct Interpreter<'g> {
    lambdas: HashMap<&'g str, &'g Graph>,
}

impl<'g> Interpreter<'g> {
    pub fn new(graphs: impl IntoIterator<Item = &'g Graph>) -> Self {
        Interpreter {
            lambdas: graphs.into_iter().map(|g| (g.name.as_str(), g)).collect(),
        }
    }

    fn lambda(&self, name: &str) -> Result<&'g Graph> {
        self.lambdas
            .get(name)
            .copied()
            .ok_or_else(|| Error::Eval(format!("lambda `{}` is not available", name)))
    }

    /// Call lambda `name` with `args` in parameter order.
    pub fn call(&self, name: &str, args: &[HostValue]) -> Result<HostValue> {
        let graph = self.lambda(name)?;
        let mut arena = Vec::new();
        let slots = args
            .iter()
            .map(|a| match a {
                HostValue::Value(v) => Slot::Val(v.clone()),
                HostValue::Array(items) => {
                    arena.push(items.clone());
                    Slot::Arr(arena.len() - 1)
                }
                HostValue::Void => Slot::Void,
            })
            .collect();
        let result = self.run(graph, slots, &mut arena, 0)?;
        Ok(match result {
            Slot::Val(v) => HostValue::Value(v),
            Slot::Arr(i) => HostValue::Array(arena.get(i).cloned().unwrap_or_default()),
            Slot::Void => HostValue::Void,
        })
    }

    /// `out[i] = f(scope.., in[i])` for every element.
    pub fn map(
        &self,
        name: &str,
        scope: &[HostValue],
        input: &PArray,
        output: &TypeDescriptor,
    ) -> Result<PArray> {
        debug!(lambda = name, len = input.logical_len(), "host map");
        let values = self.logical_values(input);
        let mut results = Vec::with_capacity(values.len());
        let mut args = scope.to_vec();
        args.push(HostValue::Void);
        for v in values {
            if let Some(last) = args.last_mut() {
                *last = HostValue::Value(v);
            }
            results.push(self.scalar_result(name, &args)?.cast_to(output));
        }
        Ok(PArray::from_values(output.clone(), StorageMode::NativeBuffers, &results)?)
    }

    /// Sequential left fold seeded with `identity`; an empty input yields
    /// `identity`. The result is a one-element array.
    pub fn reduce(
        &self,
        name: &str,
        scope: &[HostValue],
        input: &PArray,
        identity: Value,
    ) -> Result<PArray> {
        debug!(lambda = name, len = input.logical_len(), "host reduce");
        let ty = TypeDescriptor::infer_from_value(&identity)?;
        let mut acc = identity;
        let mut args = scope.to_vec();
        args.push(HostValue::Void);
        args.push(HostValue::Void);
        let n = args.len();
        for v in self.logical_values(input) {
            args[n - 2] = HostValue::Value(acc);
            args[n - 1] = HostValue::Value(v);
            acc = self.scalar_result(name, &args)?.cast_to(&ty);
        }
        let acc = acc.cast_to(&ty);
        Ok(PArray::from_values(ty, StorageMode::NativeBuffers, &[acc])?)
    }

    fn logical_values(&self, input: &PArray) -> Vec<Value> {
        if input.is_sequence() {
            (0..input.logical_len()).map(|i| input.decode_sequence(i)).collect()
        } else {
            input.to_vec()
        }
    }

    fn scalar_result(&self, name: &str, args: &[HostValue]) -> Result<Value> {
        match self.call(name, args)? {
            HostValue::Value(v) => Ok(v),
            other => Err(Error::Eval(format!(
                "lambda `{}` returned {:?}, expected an element value",
                name, other
            ))),
        }
    }

    // ── Graph walk ──

    fn run(&self, graph: &'g Graph, args: Vec<Slot>, arena: &mut Vec<Vec<Value>>, depth: usize) -> Result<Slot> {
        if depth > MAX_CALL_DEPTH {
            return Err(Error::Eval(format!("call depth exceeded in `{}`", graph.name)));
        }
        let mut frame = Frame {
            graph,
            args,
            phis: HashMap::new(),
            memo: HashMap::new(),
            allocs: HashMap::new(),
        };
        let mut cur = graph.start()?;
        let mut from_back_edge = false;
        loop {
            let kind = graph.kind(cur)?;
            match kind {
                NodeKind::Start { next } | NodeKind::Begin { next } | NodeKind::Merge { next } => {
                    cur = *next;
                }
                NodeKind::LoopExit { next, .. } => cur = *next,
                NodeKind::If { condition, on_true, on_false } => {
                    let c = self.scalar(&mut frame, arena, depth, *condition)?;
                    cur = if c.as_bool() { *on_true } else { *on_false };
                }
                NodeKind::End { merge } => {
                    self.assign_phis(&mut frame, arena, depth, *merge, cur)?;
                    cur = *merge;
                }
                NodeKind::LoopBegin { next, .. } => {
                    if !from_back_edge {
                        for phi in graph.phis_of(cur) {
                            let NodeKind::Phi { values, .. } = graph.kind(phi)? else {
                                return Err(graph.misplaced(phi).into());
                            };
                            let first = *values.first().ok_or_else(|| graph.misplaced(phi))?;
                            let v = self.eval(&mut frame, arena, depth, first)?;
                            frame.phis.insert(phi, v);
                        }
                    }
                    from_back_edge = false;
                    cur = *next;
                }
                NodeKind::LoopEnd { loop_begin } => {
                    self.assign_phis(&mut frame, arena, depth, *loop_begin, cur)?;
                    frame.memo.clear();
                    from_back_edge = true;
                    cur = *loop_begin;
                }
                NodeKind::StoreIndexed { array, index, value, next } => {
                    let arr = self.array(&mut frame, arena, depth, *array)?;
                    let idx = self.scalar(&mut frame, arena, depth, *index)?.as_i64();
                    let v = self.scalar(&mut frame, arena, depth, *value)?;
                    let slot = usize::try_from(idx)
                        .ok()
                        .and_then(|i| arena[arr].get_mut(i))
                        .ok_or_else(|| Error::Eval(format!("store index {} out of range at {}", idx, cur)))?;
                    *slot = v;
                    cur = *next;
                }
                NodeKind::StoreField { object, field, value, next } => {
                    let v = self.scalar(&mut frame, arena, depth, *value)?;
                    let obj = self.scalar(&mut frame, arena, depth, *object)?;
                    let Value::Tuple(mut items) = obj else {
                        return Err(Error::Eval(format!("field store on a non-tuple at {}", cur)));
                    };
                    let slot = items
                        .get_mut(*field)
                        .ok_or_else(|| Error::Eval(format!("field {} out of range at {}", field, cur)))?;
                    *slot = v;
                    frame.memo.insert(*object, Slot::Val(Value::Tuple(items)));
                    cur = *next;
                }
                NodeKind::FixedGuard { condition, negated, next } => {
                    let c = self.scalar(&mut frame, arena, depth, *condition)?.as_bool();
                    if c == *negated {
                        return Err(Error::Eval(format!("guard {} failed", cur)));
                    }
                    cur = *next;
                }
                NodeKind::Return { value } => {
                    return match value {
                        Some(v) => self.eval(&mut frame, arena, depth, *v),
                        None => Ok(Slot::Void),
                    };
                }
                NodeKind::Deoptimize => {
                    return Err(Error::Eval(format!("deoptimization point {} reached", cur)));
                }
                NodeKind::Unsupported { name, .. } => {
                    return Err(Error::Eval(format!("no host semantics for `{}` ({})", name, cur)));
                }
                _ => return Err(graph.misplaced(cur).into()),
            }
        }
    }

    fn assign_phis(
        &self,
        frame: &mut Frame<'g>,
        arena: &mut Vec<Vec<Value>>,
        depth: usize,
        merge: NodeId,
        end: NodeId,
    ) -> Result<()> {
        let graph = frame.graph;
        let phis = graph.phis_of(merge);
        let mut values = Vec::with_capacity(phis.len());
        for phi in &phis {
            let value = graph.phi_value_at(*phi, end)?;
            values.push(self.eval(frame, arena, depth, value)?);
        }
        for (phi, v) in phis.into_iter().zip(values) {
            frame.phis.insert(phi, v);
        }
        Ok(())
    }

    fn scalar(&self, frame: &mut Frame<'g>, arena: &mut Vec<Vec<Value>>, depth: usize, id: NodeId) -> Result<Value> {
        match self.eval(frame, arena, depth, id)? {
            Slot::Val(v) => Ok(v),
            _ => Err(Error::Eval(format!("node {} does not produce an element value", id))),
        }
    }

    fn array(&self, frame: &mut Frame<'g>, arena: &mut Vec<Vec<Value>>, depth: usize, id: NodeId) -> Result<usize> {
        match self.eval(frame, arena, depth, id)? {
            Slot::Arr(i) => Ok(i),
            _ => Err(Error::Eval(format!("node {} does not produce an array", id))),
        }
    }

    fn eval(&self, frame: &mut Frame<'g>, arena: &mut Vec<Vec<Value>>, depth: usize, id: NodeId) -> Result<Slot> {
        if let Some(slot) = frame.memo.get(&id).or_else(|| frame.allocs.get(&id)) {
            return Ok(slot.clone());
        }
        let graph = frame.graph;
        let slot = match graph.kind(id)? {
            NodeKind::Parameter { index, .. } => frame
                .args
                .get(*index)
                .cloned()
                .ok_or_else(|| Error::Eval(format!("missing argument {} of `{}`", index, graph.name)))?,
            NodeKind::Phi { .. } => frame
                .phis
                .get(&id)
                .cloned()
                .ok_or_else(|| Error::Eval(format!("phi {} read before assignment", id)))?,
            NodeKind::Constant(v) => Slot::Val(v.clone()),
            NodeKind::Unary { op, x } => {
                let x = self.scalar(frame, arena, depth, *x)?;
                Slot::Val(unary(*op, &x))
            }
            NodeKind::Binary { op, x, y } => {
                let kind = graph.infer_kind(id).scalar().ok_or_else(|| {
                    Error::Eval(format!("binary node {} has no scalar kind", id))
                })?;
                let a = self.scalar(frame, arena, depth, *x)?;
                let b = self.scalar(frame, arena, depth, *y)?;
                Slot::Val(binary(*op, kind, &a, &b).map_err(|e| Error::Eval(format!("{} at {}", e, id)))?)
            }
            NodeKind::Compare { op, x, y } => {
                let a = self.scalar(frame, arena, depth, *x)?;
                let b = self.scalar(frame, arena, depth, *y)?;
                Slot::Val(Value::Boolean(compare(*op, &a, &b)))
            }
            NodeKind::NormalizeCompare { x, y } => {
                let a = self.scalar(frame, arena, depth, *x)?;
                let b = self.scalar(frame, arena, depth, *y)?;
                let r = if compare(CompareOp::Lt, &a, &b) {
                    -1
                } else if compare(CompareOp::Eq, &a, &b) {
                    0
                } else {
                    1
                };
                Slot::Val(Value::Int(r))
            }
            NodeKind::Conditional { condition, on_true, on_false } => {
                let c = self.scalar(frame, arena, depth, *condition)?.as_bool();
                self.eval(frame, arena, depth, if c { *on_true } else { *on_false })?
            }
            NodeKind::Convert { to, value } => {
                Slot::Val(self.scalar(frame, arena, depth, *value)?.cast(*to))
            }
            NodeKind::Passthrough { value, .. } => self.eval(frame, arena, depth, *value)?,
            NodeKind::Math { op, args } => {
                let kind = graph.infer_kind(id).scalar().unwrap_or(ScalarKind::Double);
                let mut xs = Vec::with_capacity(args.len());
                for a in args {
                    xs.push(self.scalar(frame, arena, depth, *a)?.as_f64());
                }
                Slot::Val(Value::Double(math(*op, &xs)).cast(kind))
            }
            NodeKind::ArrayLength { array } => {
                let arr = self.array(frame, arena, depth, *array)?;
                Slot::Val(Value::Int(arena[arr].len() as i32))
            }
            NodeKind::LoadIndexed { array, index } => {
                let arr = self.array(frame, arena, depth, *array)?;
                let idx = self.scalar(frame, arena, depth, *index)?.as_i64();
                let v = usize::try_from(idx)
                    .ok()
                    .and_then(|i| arena[arr].get(i))
                    .cloned()
                    .ok_or_else(|| Error::Eval(format!("load index {} out of range at {}", idx, id)))?;
                Slot::Val(v)
            }
            NodeKind::LoadField { object, field } => {
                let obj = self.scalar(frame, arena, depth, *object)?;
                let v = obj
                    .field(*field)
                    .cloned()
                    .ok_or_else(|| Error::Eval(format!("field {} out of range at {}", field, id)))?;
                Slot::Val(v)
            }
            NodeKind::NewInstance { ty, fields } => {
                let mut items = Vec::with_capacity(fields.len());
                for f in fields {
                    items.push(self.scalar(frame, arena, depth, *f)?);
                }
                match (ty.needs_struct(), items.len()) {
                    (false, 1) => Slot::Val(items.remove(0)),
                    _ => Slot::Val(Value::Tuple(items)),
                }
            }
            NodeKind::NewArray { element, length } => {
                let zero = Value::zero(&TypeDescriptor::scalar(*element));
                arena.push(vec![zero; *length]);
                let slot = Slot::Arr(arena.len() - 1);
                frame.allocs.insert(id, slot.clone());
                return Ok(slot);
            }
            NodeKind::Invoke { target, args, ret } => {
                self.invoke(frame, arena, depth, id, target, args, ret)?
            }
            NodeKind::MapChain { lambda, array, capacity, element } => {
                let callee = self.lambda(lambda)?;
                let arr = self.array(frame, arena, depth, *array)?;
                let len = arena[arr].len().min(*capacity);
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    let v = arena[arr][i].clone();
                    match self.run(callee, vec![Slot::Val(v)], arena, depth + 1)? {
                        Slot::Val(r) => out.push(r.cast_to(element)),
                        _ => {
                            return Err(Error::Eval(format!(
                                "fused lambda `{}` did not return an element",
                                lambda
                            )))
                        }
                    }
                }
                arena.push(out);
                let slot = Slot::Arr(arena.len() - 1);
                frame.allocs.insert(id, slot.clone());
                return Ok(slot);
            }
            NodeKind::Unsupported { name, .. } => {
                return Err(Error::Eval(format!("no host semantics for `{}` ({})", name, id)));
            }
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
            | NodeKind::Deoptimize => return Err(graph.misplaced(id).into()),
        };
        frame.memo.insert(id, slot.clone());
        Ok(slot)
    }

    #[allow(clippy::too_many_arguments)]
    fn invoke(
        &self,
        frame: &mut Frame<'g>,
        arena: &mut Vec<Vec<Value>>,
        depth: usize,
        id: NodeId,
        target: &CallTarget,
        args: &[NodeId],
        ret: &TypeDescriptor,
    ) -> Result<Slot> {
        match target {
            CallTarget::TupleField { component, .. } => {
                let object = *args.first().ok_or_else(|| frame.graph.misplaced(id))?;
                let obj = self.scalar(frame, arena, depth, object)?;
                obj.field(*component)
                    .cloned()
                    .map(Slot::Val)
                    .ok_or_else(|| Error::Eval(format!("component {} out of range at {}", component, id)))
            }
            CallTarget::Lambda(name) => {
                let callee = self.lambda(name)?;
                let mut slots = Vec::with_capacity(args.len());
                for a in args {
                    slots.push(self.eval(frame, arena, depth, *a)?);
                }
                match self.run(callee, slots, arena, depth + 1)? {
                    Slot::Val(v) => Ok(Slot::Val(v.cast_to(ret))),
                    other => Ok(other),
                }
            }
            CallTarget::Builtin(name) => {
                let mut xs = Vec::with_capacity(args.len());
                for a in args {
                    xs.push(self.scalar(frame, arena, depth, *a)?);
                }
                builtin(name, &xs)
                    .map(|v| Slot::Val(v.cast_to(ret)))
                    .ok_or_else(|| Error::Eval(format!("unknown builtin `{}` at {}", name, id)))
            }
        }
    }
}

// ── Operations ──────────────────────────────────────────────────────────────

trait CastTo {
    fn cast_to(&self, ty: &TypeDescriptor) -> Value;
}

impl CastTo for Value {
    /// Cast scalars (or the fields of a tuple) to the kinds of `ty`.
    fn cast_to(&self, ty: &TypeDescriptor) -> Value {
        match (ty, self) {
            (TypeDescriptor::Scalar(k), _) => self.cast(*k),
            (TypeDescriptor::Composite(fields), Value::Tuple(items)) if fields.len() == items.len() => {
                Value::Tuple(items.iter().zip(fields).map(|(v, t)| v.cast_to(t)).collect())
            }
            (TypeDescriptor::Composite(fields), scalar) if fields.len() == 1 => {
                Value::Tuple(vec![scalar.cast_to(&fields[0])])
            }
            _ => self.clone(),
        }
    }
}

fn unary(op: UnaryOp, x: &Value) -> Value {
    match (op, x) {
        (UnaryOp::Neg, Value::Float(v)) => Value::Float(-v),
        (UnaryOp::Neg, Value::Double(v)) => Value::Double(-v),
        (UnaryOp::Neg, v) => Value::Long(v.as_i64().wrapping_neg()).cast(v.kind().unwrap_or(ScalarKind::Long)),
        (UnaryOp::Not, Value::Boolean(b)) => Value::Boolean(!b),
        (UnaryOp::Not, v) => Value::Long(!v.as_i64()).cast(v.kind().unwrap_or(ScalarKind::Long)),
    }
}

fn binary(op: BinaryOp, kind: ScalarKind, a: &Value, b: &Value) -> std::result::Result<Value, String> {
    if kind == ScalarKind::Boolean {
        let (x, y) = (a.as_bool(), b.as_bool());
        return match op {
            BinaryOp::And => Ok(Value::Boolean(x & y)),
            BinaryOp::Or => Ok(Value::Boolean(x | y)),
            BinaryOp::Xor => Ok(Value::Boolean(x ^ y)),
            _ => Err(format!("operator `{}` on booleans", op.symbol())),
        };
    }
    if kind.is_floating() {
        let (x, y) = (a.as_f64(), b.as_f64());
        let r = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Rem => x % y,
            _ => return Err(format!("operator `{}` on floating values", op.symbol())),
        };
        // Single precision rounds each step.
        return Ok(Value::Double(r).cast(kind));
    }
    let (x, y) = (a.as_i64(), b.as_i64());
    let bits = if kind == ScalarKind::Long { 64 } else { 32 };
    let shift = (y & (bits - 1)) as u32;
    let r = match op {
        BinaryOp::Add => x.wrapping_add(y),
        BinaryOp::Sub => x.wrapping_sub(y),
        BinaryOp::Mul => x.wrapping_mul(y),
        BinaryOp::Div | BinaryOp::Rem if y == 0 => return Err("integer division by zero".to_string()),
        BinaryOp::Div => x.wrapping_div(y),
        BinaryOp::Rem => x.wrapping_rem(y),
        BinaryOp::And => x & y,
        BinaryOp::Or => x | y,
        BinaryOp::Xor => x ^ y,
        BinaryOp::Shl => x.wrapping_shl(shift),
        BinaryOp::Shr => x.wrapping_shr(shift),
        BinaryOp::UShr if bits == 32 => ((x as i32 as u32) >> shift) as i64,
        BinaryOp::UShr => ((x as u64) >> shift) as i64,
    };
    // Narrowing through i32 reproduces 32-bit wrap-around.
    let r = if bits == 32 { r as i32 as i64 } else { r };
    Ok(Value::Long(r).cast(kind))
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    let floating = |v: &Value| matches!(v, Value::Float(_) | Value::Double(_));
    let ord = if floating(a) || floating(b) {
        a.as_f64().partial_cmp(&b.as_f64())
    } else {
        Some(a.as_i64().cmp(&b.as_i64()))
    };
    use std::cmp::Ordering::*;
    match (op, ord) {
        (CompareOp::Eq, o) => o == Some(Equal),
        (CompareOp::Ne, o) => o != Some(Equal),
        (CompareOp::Lt, o) => o == Some(Less),
        (CompareOp::Le, o) => matches!(o, Some(Less | Equal)),
        (CompareOp::Gt, o) => o == Some(Greater),
        (CompareOp::Ge, o) => matches!(o, Some(Greater | Equal)),
    }
}

fn math(op: MathOp, xs: &[f64]) -> f64 {
    let x = xs.first().copied().unwrap_or(0.0);
    let y = xs.get(1).copied().unwrap_or(0.0);
    match op {
        MathOp::Sqrt => x.sqrt(),
        MathOp::Sin => x.sin(),
        MathOp::Cos => x.cos(),
        MathOp::Tan => x.tan(),
        MathOp::Exp => x.exp(),
        MathOp::Log => x.ln(),
        MathOp::Fabs => x.abs(),
        MathOp::Floor => x.floor(),
        MathOp::Ceil => x.ceil(),
        MathOp::Pow => x.powf(y),
        MathOp::Fmin => x.min(y),
        MathOp::Fmax => x.max(y),
        MathOp::Hypot => x.hypot(y),
    }
}

fn builtin(name: &str, xs: &[Value]) -> Option<Value> {
    let kind = xs.first().and_then(Value::kind)?;
    let promoted = |v: f64| Value::Double(v).cast(kind);
    match (name, xs) {
        ("min", [a, b]) => Some(if compare(CompareOp::Le, a, b) { a.clone() } else { b.clone() }),
        ("max", [a, b]) => Some(if compare(CompareOp::Ge, a, b) { a.clone() } else { b.clone() }),
        ("abs", [a]) if kind.is_floating() => Some(promoted(a.as_f64().abs())),
        ("abs", [a]) => Some(Value::Long(a.as_i64().wrapping_abs()).cast(kind)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GraphBuilder, ParamType};

    fn double_lambda() -> Graph {
        let mut b = GraphBuilder::new("double");
        let start = b.reserve();
        let x = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
        let two = b.constant(Value::Double(2.0));
        let mul = b.binary(BinaryOp::Mul, x, two);
        let ret = b.add(NodeKind::Return { value: Some(mul) });
        b.set(start, NodeKind::Start { next: ret });
        b.finish().unwrap()
    }

    /// `(a, b) -> a + b` over floats.
    fn sum_lambda() -> Graph {
        let mut b = GraphBuilder::new("sum");
        let start = b.reserve();
        let x = b.parameter(0, ParamType::Scalar(ScalarKind::Float));
        let y = b.parameter(1, ParamType::Scalar(ScalarKind::Float));
        let add = b.binary(BinaryOp::Add, x, y);
        let ret = b.add(NodeKind::Return { value: Some(add) });
        b.set(start, NodeKind::Start { next: ret });
        b.finish().unwrap()
    }

    /// Sum of `0..n` with an explicit loop.
    fn triangle_lambda() -> Graph {
        let mut b = GraphBuilder::new("triangle");
        let start = b.reserve();
        let loop_begin = b.reserve();
        let iff = b.reserve();
        let body = b.reserve();
        let loop_end = b.reserve();
        let exit = b.reserve();
        let n = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
        let zero = b.constant(Value::Int(0));
        let one = b.constant(Value::Int(1));
        let i = b.reserve();
        let acc = b.reserve();
        let next_i = b.binary(BinaryOp::Add, i, one);
        let next_acc = b.binary(BinaryOp::Add, acc, i);
        b.set(i, NodeKind::Phi { merge: loop_begin, values: vec![zero, next_i] });
        b.set(acc, NodeKind::Phi { merge: loop_begin, values: vec![zero, next_acc] });
        let cond = b.compare(CompareOp::Lt, i, n);
        let ret = b.add(NodeKind::Return { value: Some(acc) });
        b.set(start, NodeKind::Start { next: loop_begin });
        b.set(loop_begin, NodeKind::LoopBegin { next: iff, bound: None });
        b.set(iff, NodeKind::If { condition: cond, on_true: body, on_false: exit });
        b.set(body, NodeKind::Begin { next: loop_end });
        b.set(loop_end, NodeKind::LoopEnd { loop_begin });
        b.set(exit, NodeKind::LoopExit { loop_begin, next: ret });
        b.finish().unwrap()
    }

    #[test]
    fn call_scalar_lambda() {
        let g = double_lambda();
        let interp = Interpreter::new([&g]);
        let r = interp.call("double", &[HostValue::Value(Value::Int(21))]).unwrap();
        assert_eq!(r, HostValue::Value(Value::Double(42.0)));
    }

    #[test]
    fn map_over_parray() {
        let g = double_lambda();
        let interp = Interpreter::new([&g]);
        let values: Vec<Value> = (0..10).map(Value::Int).collect();
        let input = PArray::from_values(
            TypeDescriptor::scalar(ScalarKind::Int),
            StorageMode::NativeBuffers,
            &values,
        )
        .unwrap();
        let out = interp
            .map("double", &[], &input, &TypeDescriptor::scalar(ScalarKind::Double))
            .unwrap();
        assert_eq!(out.get(9), Value::Double(18.0));
    }

    fn floats(values: &[f32]) -> PArray {
        let values: Vec<Value> = values.iter().map(|v| Value::Float(*v)).collect();
        PArray::from_values(
            TypeDescriptor::scalar(ScalarKind::Float),
            StorageMode::NativeBuffers,
            &values,
        )
        .unwrap()
    }

    #[test]
    fn reduce_folds_every_element() {
        let g = sum_lambda();
        let interp = Interpreter::new([&g]);
        let out = interp
            .reduce("sum", &[], &floats(&[1.0, 2.0, 3.5]), Value::Float(0.0))
            .unwrap();
        assert_eq!(out.size(), 1);
        assert_eq!(out.get(0), Value::Float(6.5));
    }

    #[test]
    fn reduce_is_seeded_with_identity() {
        let g = sum_lambda();
        let interp = Interpreter::new([&g]);
        let out = interp
            .reduce("sum", &[], &floats(&[1.0, 2.0, 3.0]), Value::Float(10.0))
            .unwrap();
        assert_eq!(out.get(0), Value::Float(16.0));
    }

    #[test]
    fn reduce_of_empty_is_identity() {
        let g = sum_lambda();
        let interp = Interpreter::new([&g]);
        let input = PArray::with_mode(
            0,
            TypeDescriptor::scalar(ScalarKind::Float),
            StorageMode::NativeBuffers,
        )
        .unwrap();
        let out = interp.reduce("sum", &[], &input, Value::Float(0.0)).unwrap();
        assert_eq!(out.get(0), Value::Float(0.0));
    }

    #[test]
    fn loops_recompute_per_iteration() {
        let g = triangle_lambda();
        let interp = Interpreter::new([&g]);
        let r = interp.call("triangle", &[HostValue::Value(Value::Int(5))]).unwrap();
        assert_eq!(r, HostValue::Value(Value::Int(10)));
    }

    #[test]
    fn integer_arithmetic_wraps_like_c() {
        let r = binary(BinaryOp::Add, ScalarKind::Int, &Value::Int(i32::MAX), &Value::Int(1)).unwrap();
        assert_eq!(r, Value::Int(i32::MIN));
        let r = binary(BinaryOp::UShr, ScalarKind::Int, &Value::Int(-1), &Value::Int(28)).unwrap();
        assert_eq!(r, Value::Int(15));
        assert!(binary(BinaryOp::Div, ScalarKind::Int, &Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn unsupported_node_fails_evaluation() {
        let mut b = GraphBuilder::new("odd");
        let start = b.reserve();
        let x = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
        let weird = b.add(NodeKind::Unsupported {
            name: "MonitorEnter".into(),
            inputs: vec![x],
            next: None,
        });
        let ret = b.add(NodeKind::Return { value: Some(weird) });
        b.set(start, NodeKind::Start { next: ret });
        let g = b.finish().unwrap();
        let interp = Interpreter::new([&g]);
        let err = interp.call("odd", &[HostValue::Value(Value::Int(1))]).unwrap_err();
        assert!(err.to_string().contains("MonitorEnter"));
    }
}
