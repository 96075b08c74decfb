// skeleton.rs — Map and reduce driver graphs
//
// The kernel skeleton is the per-work-item harness around a lambda. It is
// expressed in the same closed IR as lambda bodies so that one generator
// lowers both.
//
//   map:    for i in 0..len(in):  out[i] = f(in[i])
//   reduce: for i in 1..len(in):  out[0] = f(in[0], in[i]); in[0] = out[0]
//
// Preconditions: `lambda` names the lambda graph the skeleton invokes.
// Postconditions: parameter 0 is the input array, parameter 1 the output
//                 array; the outermost loop carries the input length as bound.
// Failure modes: none beyond `GraphBuilder::finish` validation.
// Side effects: none.

use serde::{Deserialize, Serialize};

use crate::error::CodegenError;
use crate::ir::{BinaryOp, CallTarget, CompareOp, Graph, GraphBuilder, NodeKind, ParamType};
use crate::types::{TypeDescriptor, Value};

/// Parameter index of the input array in every skeleton.
pub const INPUT_PARAM: usize = 0;
/// Parameter index of the output array in every skeleton.
pub const OUTPUT_PARAM: usize = 1;

/// Shape of the computation a skeleton drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Computation {
    /// One-argument lambda applied element-wise.
    Map,
    /// Two-argument lambda folded sequentially over the input.
    Reduce,
}

impl Computation {
    /// Number of lambda arguments; lambda parameters before them are scope
    /// (closed-over) variables.
    pub fn lambda_arity(self) -> usize {
        match self {
            Computation::Map => 1,
            Computation::Reduce => 2,
        }
    }
}

pub fn build(
    computation: Computation,
    lambda: &str,
    input: &TypeDescriptor,
    output: &TypeDescriptor,
) -> Result<Graph, CodegenError> {
    match computation {
        Computation::Map => map(lambda, input, output),
        Computation::Reduce => reduce(lambda, input, output),
    }
}

/// Kernel entry-point name for a skeleton graph.
pub fn kernel_name(skeleton: &Graph) -> String {
    format!("{}Kernel", skeleton.name)
}

pub fn map(
    lambda: &str,
    input: &TypeDescriptor,
    output: &TypeDescriptor,
) -> Result<Graph, CodegenError> {
    let mut b = GraphBuilder::new("map");
    let start = b.reserve();
    let loop_begin = b.reserve();
    let iff = b.reserve();
    let body = b.reserve();
    let store = b.reserve();
    let loop_end = b.reserve();
    let exit = b.reserve();

    let src = b.parameter(INPUT_PARAM, ParamType::Array(input.clone()));
    let dst = b.parameter(OUTPUT_PARAM, ParamType::Array(output.clone()));
    let len = b.add(NodeKind::ArrayLength { array: src });
    let zero = b.constant(Value::Int(0));
    let one = b.constant(Value::Int(1));
    let phi = b.reserve();
    let next_i = b.binary(BinaryOp::Add, phi, one);
    b.set(phi, NodeKind::Phi { merge: loop_begin, values: vec![zero, next_i] });
    let in_range = b.compare(CompareOp::Lt, phi, len);
    let elem = b.add(NodeKind::LoadIndexed { array: src, index: phi });
    let call = b.add(NodeKind::Invoke {
        target: CallTarget::Lambda(lambda.to_string()),
        args: vec![elem],
        ret: output.clone(),
    });
    let ret = b.add(NodeKind::Return { value: None });

    b.set(start, NodeKind::Start { next: loop_begin });
    b.set(loop_begin, NodeKind::LoopBegin { next: iff, bound: Some(len) });
    b.set(iff, NodeKind::If { condition: in_range, on_true: body, on_false: exit });
    b.set(body, NodeKind::Begin { next: store });
    b.set(
        store,
        NodeKind::StoreIndexed { array: dst, index: phi, value: call, next: loop_end },
    );
    b.set(loop_end, NodeKind::LoopEnd { loop_begin });
    b.set(exit, NodeKind::LoopExit { loop_begin, next: ret });
    b.finish()
}

pub fn reduce(
    lambda: &str,
    input: &TypeDescriptor,
    output: &TypeDescriptor,
) -> Result<Graph, CodegenError> {
    let mut b = GraphBuilder::new("reduce");
    let start = b.reserve();
    let loop_begin = b.reserve();
    let iff = b.reserve();
    let body = b.reserve();
    let store_out = b.reserve();
    let store_in = b.reserve();
    let loop_end = b.reserve();
    let exit = b.reserve();

    let src = b.parameter(INPUT_PARAM, ParamType::Array(input.clone()));
    let dst = b.parameter(OUTPUT_PARAM, ParamType::Array(output.clone()));
    let len = b.add(NodeKind::ArrayLength { array: src });
    let zero = b.constant(Value::Int(0));
    let one = b.constant(Value::Int(1));
    let phi = b.reserve();
    let next_i = b.binary(BinaryOp::Add, phi, one);
    b.set(phi, NodeKind::Phi { merge: loop_begin, values: vec![one, next_i] });
    let in_range = b.compare(CompareOp::Lt, phi, len);
    let acc = b.add(NodeKind::LoadIndexed { array: src, index: zero });
    let elem = b.add(NodeKind::LoadIndexed { array: src, index: phi });
    let call = b.add(NodeKind::Invoke {
        target: CallTarget::Lambda(lambda.to_string()),
        args: vec![acc, elem],
        ret: output.clone(),
    });
    let partial = b.add(NodeKind::LoadIndexed { array: dst, index: zero });
    let ret = b.add(NodeKind::Return { value: None });

    b.set(start, NodeKind::Start { next: loop_begin });
    b.set(loop_begin, NodeKind::LoopBegin { next: iff, bound: Some(len) });
    b.set(iff, NodeKind::If { condition: in_range, on_true: body, on_false: exit });
    b.set(body, NodeKind::Begin { next: store_out });
    b.set(
        store_out,
        NodeKind::StoreIndexed { array: dst, index: zero, value: call, next: store_in },
    );
    b.set(
        store_in,
        NodeKind::StoreIndexed { array: src, index: zero, value: partial, next: loop_end },
    );
    b.set(loop_end, NodeKind::LoopEnd { loop_begin });
    b.set(exit, NodeKind::LoopExit { loop_begin, next: ret });
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarKind;

    fn float() -> TypeDescriptor {
        TypeDescriptor::scalar(ScalarKind::Float)
    }

    #[test]
    fn map_skeleton_shape() {
        let g = map("mul", &float(), &float()).unwrap();
        assert_eq!(kernel_name(&g), "mapKernel");
        let params = g.parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[INPUT_PARAM].2, &ParamType::Array(float()));
        let loops = g
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::LoopBegin { .. }))
            .count();
        assert_eq!(loops, 1);
    }

    #[test]
    fn reduce_invokes_with_two_arguments() {
        let g = reduce("sum", &float(), &float()).unwrap();
        let args = g.nodes.iter().find_map(|n| match &n.kind {
            NodeKind::Invoke { target: CallTarget::Lambda(name), args, .. } if name == "sum" => {
                Some(args.len())
            }
            _ => None,
        });
        assert_eq!(args, Some(Computation::Reduce.lambda_arity()));
    }

    #[test]
    fn reduce_loop_starts_at_one() {
        let g = reduce("sum", &float(), &float()).unwrap();
        let first = g.nodes.iter().find_map(|n| match &n.kind {
            NodeKind::Phi { values, .. } => Some(values[0]),
            _ => None,
        });
        let first = first.expect("loop phi");
        assert_eq!(g.kind(first).unwrap(), &NodeKind::Constant(Value::Int(1)));
    }

    #[test]
    fn computation_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Computation::Reduce).unwrap(), "\"reduce\"");
    }
}
