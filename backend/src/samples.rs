// samples.rs — Reference lambdas and inputs
//
// The three end-to-end computations used by the CLI demo, the integration
// tests and the benches:
//
//   map-mul:    Tuple2<Float,Float> -> Float,  t -> t._1 * t._2
//   map-double: Integer -> Double,             x -> x * 2.0
//   reduce:     (Float, Float) -> Float,       (a, b) -> a + b

use crate::error::{CodegenError, ParrayError};
use crate::ir::{BinaryOp, Graph, GraphBuilder, NodeKind, ParamType};
use crate::parray::PArray;
use crate::request::{KernelRequest, TypeInfo};
use crate::skeleton::Computation;
use crate::storage::StorageMode;
use crate::types::{ScalarKind, TypeDescriptor, Value};

pub fn float() -> TypeDescriptor {
    TypeDescriptor::scalar(ScalarKind::Float)
}

pub fn float_pair() -> TypeDescriptor {
    TypeDescriptor::Composite(vec![float(), float()])
}

/// `t -> t._1 * t._2`
pub fn mul_fields() -> Result<Graph, CodegenError> {
    let mut b = GraphBuilder::new("mul");
    let start = b.reserve();
    let t = b.parameter(0, ParamType::Tuple(float_pair()));
    let a = b.tuple_field(t, 2, 0, float());
    let c = b.tuple_field(t, 2, 1, float());
    let mul = b.binary(BinaryOp::Mul, a, c);
    let ret = b.add(NodeKind::Return { value: Some(mul) });
    b.set(start, NodeKind::Start { next: ret });
    b.finish()
}

/// `x -> x * 2.0`
pub fn double() -> Result<Graph, CodegenError> {
    let mut b = GraphBuilder::new("double");
    let start = b.reserve();
    let x = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
    let two = b.constant(Value::Double(2.0));
    let mul = b.binary(BinaryOp::Mul, x, two);
    let ret = b.add(NodeKind::Return { value: Some(mul) });
    b.set(start, NodeKind::Start { next: ret });
    b.finish()
}

/// `(a, b) -> a + b`
pub fn sum() -> Result<Graph, CodegenError> {
    let mut b = GraphBuilder::new("sum");
    let start = b.reserve();
    let x = b.parameter(0, ParamType::Scalar(ScalarKind::Float));
    let y = b.parameter(1, ParamType::Scalar(ScalarKind::Float));
    let add = b.binary(BinaryOp::Add, x, y);
    let ret = b.add(NodeKind::Return { value: Some(add) });
    b.set(start, NodeKind::Start { next: ret });
    b.finish()
}

pub fn map_mul_request() -> Result<KernelRequest, CodegenError> {
    Ok(KernelRequest::new(
        mul_fields()?,
        TypeInfo {
            input: float_pair(),
            output: float(),
            computation: Computation::Map,
        },
    ))
}

pub fn map_double_request() -> Result<KernelRequest, CodegenError> {
    Ok(KernelRequest::new(
        double()?,
        TypeInfo {
            input: TypeDescriptor::scalar(ScalarKind::Int),
            output: TypeDescriptor::scalar(ScalarKind::Double),
            computation: Computation::Map,
        },
    ))
}

pub fn reduce_sum_request() -> Result<KernelRequest, CodegenError> {
    Ok(KernelRequest::new(
        sum()?,
        TypeInfo {
            input: float(),
            output: float(),
            computation: Computation::Reduce,
        },
    ))
}

/// `n` pairs `(i, i + 2)`.
pub fn pair_input(n: usize) -> Result<PArray, ParrayError> {
    let values: Vec<Value> = (0..n)
        .map(|i| Value::Tuple(vec![Value::Float(i as f32), Value::Float(i as f32 + 2.0)]))
        .collect();
    PArray::from_values(float_pair(), StorageMode::Default, &values)
}

/// Integers `0..n`.
pub fn int_input(n: usize) -> Result<PArray, ParrayError> {
    let values: Vec<Value> = (0..n as i32).map(Value::Int).collect();
    PArray::from_values(TypeDescriptor::scalar(ScalarKind::Int), StorageMode::Default, &values)
}
