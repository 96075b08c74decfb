// End-to-end tests: request → kernel text, and the same lambdas on the host.
//
// Categories:
// 1. Reference computations: map-mul, map-double and map-then-reduce agree
//    with hand-computed results on the host evaluator
// 2. Kernel shape: struct declarations, SoA parameters, scope variables,
//    branch elision and nested map chains
// 3. Sequence inputs: in-kernel decoding and per-device offsets
// 4. Offload facade: caching, request ids and JSON requests

use marawacc::codegen::{self, OFFSET_DEVICE};
use marawacc::interp::{HostValue, Interpreter};
use marawacc::ir::{BinaryOp, Graph, GraphBuilder, NodeKind, ParamType};
use marawacc::options::GeneratorOptions;
use marawacc::request::{self, KernelRequest, Offload, RequestContext, TypeInfo};
use marawacc::samples;
use marawacc::skeleton::Computation;
use marawacc::types::{ScalarKind, TypeDescriptor, Value};

// ── Test helpers ────────────────────────────────────────────────────────────

fn source_of(request: &KernelRequest, options: GeneratorOptions) -> String {
    let mut ctx = RequestContext::new(options);
    request::generate(request, &mut ctx)
        .unwrap_or_else(|e| panic!("generation failed: {}", e))
        .source
}

fn floats(values: &[Value]) -> Vec<f64> {
    values.iter().map(Value::as_f64).collect()
}

/// `t -> (t._2, t._1)`
fn swap() -> Graph {
    let mut b = GraphBuilder::new("swap");
    let start = b.reserve();
    let t = b.parameter(0, ParamType::Tuple(samples::float_pair()));
    let x = b.tuple_field(t, 2, 0, samples::float());
    let y = b.tuple_field(t, 2, 1, samples::float());
    let pair = b.add(NodeKind::NewInstance {
        ty: samples::float_pair(),
        fields: vec![y, x],
    });
    let ret = b.add(NodeKind::Return { value: Some(pair) });
    b.set(start, NodeKind::Start { next: ret });
    b.finish().unwrap()
}

/// `(k, x) -> x * k` with `k` captured from the enclosing scope.
fn scale() -> Graph {
    let mut b = GraphBuilder::new("scale");
    let start = b.reserve();
    let k = b.parameter(0, ParamType::Scalar(ScalarKind::Float));
    let x = b.parameter(1, ParamType::Scalar(ScalarKind::Float));
    let mul = b.binary(BinaryOp::Mul, x, k);
    let ret = b.add(NodeKind::Return { value: Some(mul) });
    b.set(start, NodeKind::Start { next: ret });
    b.finish().unwrap()
}

/// `x -> x + 1.0f`
fn inc() -> Graph {
    let mut b = GraphBuilder::new("inc");
    let start = b.reserve();
    let x = b.parameter(0, ParamType::Scalar(ScalarKind::Float));
    let one = b.constant(Value::Float(1.0));
    let add = b.binary(BinaryOp::Add, x, one);
    let ret = b.add(NodeKind::Return { value: Some(add) });
    b.set(start, NodeKind::Start { next: ret });
    b.finish().unwrap()
}

/// `xs -> map(inc, xs)[0]` through a local buffer of four elements.
fn first_incremented() -> Graph {
    let mut b = GraphBuilder::new("outer");
    let start = b.reserve();
    let xs = b.parameter(0, ParamType::Array(samples::float()));
    let chain = b.add(NodeKind::MapChain {
        lambda: "inc".to_string(),
        array: xs,
        capacity: 4,
        element: samples::float(),
    });
    let zero = b.constant(Value::Int(0));
    let first = b.add(NodeKind::LoadIndexed { array: chain, index: zero });
    let ret = b.add(NodeKind::Return { value: Some(first) });
    b.set(start, NodeKind::Start { next: ret });
    b.finish().unwrap()
}

// ── Reference computations ──────────────────────────────────────────────────

#[test]
fn map_mul_multiplies_pair_fields() {
    let req = samples::map_mul_request().unwrap();
    let input = samples::pair_input(10).unwrap();
    let out = Interpreter::new([&req.lambda])
        .map("mul", &[], &input, &samples::float())
        .unwrap();
    let expected: Vec<f64> = (0..10).map(|i| (i * (i + 2)) as f64).collect();
    assert_eq!(floats(&out.to_vec()), expected);
}

#[test]
fn map_double_widens_to_double() {
    let req = samples::map_double_request().unwrap();
    let input = samples::int_input(10).unwrap();
    let out = Interpreter::new([&req.lambda])
        .map("double", &[], &input, &req.types.output)
        .unwrap();
    let values = out.to_vec();
    assert_eq!(values.len(), 10);
    assert_eq!(values[3], Value::Double(6.0));
    assert_eq!(values[9], Value::Double(18.0));
}

#[test]
fn map_then_reduce_sums_products() {
    let map_req = samples::map_mul_request().unwrap();
    let reduce_req = samples::reduce_sum_request().unwrap();
    let input = samples::pair_input(10).unwrap();
    let products = Interpreter::new([&map_req.lambda])
        .map("mul", &[], &input, &samples::float())
        .unwrap();
    let total = Interpreter::new([&reduce_req.lambda])
        .reduce("sum", &[], &products, Value::Float(0.0))
        .unwrap();
    assert_eq!(total.size(), 1);
    assert_eq!(total.get(0), Value::Float(375.0));
}

#[test]
fn reference_kernels_generate() {
    let mut offload = Offload::new(GeneratorOptions::default());
    for req in [
        samples::map_mul_request().unwrap(),
        samples::map_double_request().unwrap(),
        samples::reduce_sum_request().unwrap(),
    ] {
        let compiled = offload.compile(&req).unwrap();
        assert_eq!(compiled.kernels.len(), 1);
        assert!(!compiled.cached);
        let k = &compiled.kernels[0];
        assert!(
            k.source.contains(&format!("__kernel void {}(", k.kernel_name)),
            "kernel entry missing:\n{}",
            k.source
        );
        assert!(k.source.contains(&codegen::function_name(&req.lambda.name)));
    }
    assert_eq!(offload.cache().len(), 3);
}

// ── Kernel shape ────────────────────────────────────────────────────────────

#[test]
fn map_mul_expands_tuple_input_per_field() {
    let src = source_of(&samples::map_mul_request().unwrap(), GeneratorOptions::default());
    assert!(src.contains(
        "__kernel void mapKernel(__global float *p0, __global float *p1, \
         __constant int *p1_index_data, __global float *p2, \
         __constant int *p2_index_data, __global int *deoptFlag)"
    ));
    assert!(src.contains("float lambda_mul(Tuple_float_float p0, __global int *deoptFlag)"));
    assert!(src.contains("float field_2 = p0[p1_index_data[p1_dim_1 + 1] + loop_0];"));
    assert!(src.contains("float field_3 = p1[p1_index_data[p1_dim_1 + 1] + loop_0];"));
    assert!(src.contains("array_elem_val_4._1 = field_2;"));
    assert!(src.contains("array_elem_val_4._2 = field_3;"));
    assert!(src.contains("float fnresult_5 = lambda_mul(array_elem_val_4, deoptFlag);"));
}

#[test]
fn map_mul_without_soa_passes_struct_buffer() {
    let options = GeneratorOptions {
        soa: false,
        ..GeneratorOptions::default()
    };
    let src = source_of(&samples::map_mul_request().unwrap(), options);
    assert!(src.contains("__global Tuple_float_float *p0, __constant int *p0_index_data"));
    assert!(!src.contains("field_2 = p0["));
}

#[test]
fn struct_declared_once_per_unit() {
    let req = KernelRequest::new(
        swap(),
        TypeInfo {
            input: samples::float_pair(),
            output: samples::float_pair(),
            computation: Computation::Map,
        },
    );
    let src = source_of(&req, GeneratorOptions::default());
    assert_eq!(src.matches("typedef struct").count(), 1, "{}", src);
    assert_eq!(src.matches("#ifndef Tuple_float_float_DEFINED").count(), 1);
    assert!(src.contains("Tuple_float_float lambda_swap(Tuple_float_float p0"));
}

#[test]
fn tuple_output_is_written_per_field() {
    let req = KernelRequest::new(
        swap(),
        TypeInfo {
            input: samples::float_pair(),
            output: samples::float_pair(),
            computation: Computation::Map,
        },
    );
    let mut ctx = RequestContext::new(GeneratorOptions::default());
    let src = request::generate(&req, &mut ctx).unwrap().source;
    let outputs = ctx.extra_arrays.outputs();
    assert_eq!(outputs.len(), 2);
    for out in outputs {
        assert!(
            src.contains(&format!("{}[loop_0] = ", out.name)),
            "no write to {}:\n{}",
            out.name,
            src
        );
    }
}

#[test]
fn map_kernel_has_no_empty_else() {
    let src = source_of(&samples::map_double_request().unwrap(), GeneratorOptions::default());
    assert!(src.contains("if (cond_1) {"));
    assert!(!src.contains("else"), "{}", src);
}

#[test]
fn reduce_kernel_breaks_out_of_loop() {
    let src = source_of(&samples::reduce_sum_request().unwrap(), GeneratorOptions::default());
    assert!(src.contains("__kernel void reduceKernel("));
    assert!(src.contains(
        "for (int reductionIndex = 1 ; reductionIndex < p0_len_dim_1 ; reductionIndex++) {"
    ));
    assert!(src.contains("} else {\n            break;\n        }"));
    assert!(!src.contains("get_global_size"));
}

#[test]
fn guards_off_removes_deopt_buffer() {
    let options = GeneratorOptions {
        deopt_guards: false,
        ..GeneratorOptions::default()
    };
    let src = source_of(&samples::map_double_request().unwrap(), options);
    assert!(!src.contains("deoptFlag"), "{}", src);
    assert!(src.contains("double fnresult_3 = lambda_double(array_elem_val_2);"));
}

#[test]
fn scope_variable_becomes_kernel_parameter() {
    let req = KernelRequest::new(
        scale(),
        TypeInfo {
            input: samples::float(),
            output: samples::float(),
            computation: Computation::Map,
        },
    );
    let src = source_of(&req, GeneratorOptions::default());
    assert!(src.contains(
        "__kernel void mapKernel(__global float *p0, __constant int *p0_index_data, \
         __global float *p1, __constant int *p1_index_data, float p2, \
         __global int *deoptFlag)"
    ));
    assert!(src.contains("lambda_scale(p2, array_elem_val_2, deoptFlag);"));

    let lambda = scale();
    let input = marawacc::parray::PArray::from_values(
        samples::float(),
        marawacc::storage::StorageMode::Default,
        &[Value::Float(1.0), Value::Float(2.5)],
    )
    .unwrap();
    let out = Interpreter::new([&lambda])
        .map("scale", &[HostValue::Value(Value::Float(4.0))], &input, &samples::float())
        .unwrap();
    assert_eq!(out.to_vec(), vec![Value::Float(4.0), Value::Float(10.0)]);
}

#[test]
fn nested_map_chain_lowers_to_local_buffer() {
    let outer = first_incremented();
    let nested = [inc()];
    let unit = codegen::lower_lambda(&outer, &nested, &GeneratorOptions::default()).unwrap();
    let names: Vec<&str> = unit.functions.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, ["lambda_inc", "lambda_outer"]);

    let text = unit.functions[1].text.as_str();
    assert!(text.starts_with(
        "float lambda_outer(__global float *p0, __constant int *p0_index_data, \
         __global int *deoptFlag)"
    ));
    assert!(text.contains("float result_0[4];"));
    assert!(text.contains("int result_0_len = min(p0_index_data[0], 4);"));
    assert!(text.contains("for (int loop_1 = 0; loop_1 < result_0_len; loop_1++) {"));
    assert!(text.contains(
        "result_0[loop_1] = lambda_inc(p0[p0_index_data[p0_dim_1 + 1] + loop_1], deoptFlag);"
    ));
    assert!(text.contains("float array_elem_val_2 = result_0[0];"));
    assert!(text.contains("return array_elem_val_2;"));
}

#[test]
fn nested_map_chain_on_host() {
    let outer = first_incremented();
    let inner = inc();
    let out = Interpreter::new([&outer, &inner])
        .call(
            "outer",
            &[HostValue::Array(vec![Value::Float(2.0), Value::Float(5.0)])],
        )
        .unwrap();
    assert_eq!(out, HostValue::Value(Value::Float(3.0)));
}

// ── Sequence inputs ─────────────────────────────────────────────────────────

fn sequence_request(total: usize) -> (KernelRequest, marawacc::parray::PArray) {
    let mut input = samples::int_input(total).unwrap();
    input.set_flag(true);
    input
        .enable_sequence(&Value::Int(0), &Value::Int(1), &Value::Int(8))
        .unwrap();
    let layout = input.sequence_layout().unwrap();
    let req = samples::map_double_request()
        .unwrap()
        .with_sequence(layout, total);
    (req, input)
}

#[test]
fn sequence_input_is_compact_and_decodes_on_host() {
    let (req, input) = sequence_request(16);
    assert_eq!(input.size(), 3);
    assert_eq!(input.total_size_when_sequence(), Some(16));

    let out = Interpreter::new([&req.lambda])
        .map("double", &[], &input, &req.types.output)
        .unwrap();
    let values = out.to_vec();
    assert_eq!(values.len(), 16);
    assert_eq!(values[7], Value::Double(0.0));
    assert_eq!(values[8], Value::Double(2.0));
}

#[test]
fn sequence_kernel_decodes_with_device_offset() {
    let (req, _) = sequence_request(16);
    let generated = source_of(&req, GeneratorOptions::default());
    assert!(generated.contains(&format!("( loop_0 {} ) >> 3;", OFFSET_DEVICE)));

    let mut offload = Offload::new(GeneratorOptions {
        devices: 2,
        ..GeneratorOptions::default()
    });
    let compiled = offload.compile(&req).unwrap();
    assert_eq!(compiled.kernels.len(), 2);
    assert!(compiled.kernels[0].source.contains("( loop_0  ) >> 3;"));
    assert!(compiled.kernels[1].source.contains("( loop_0  + 8 ) >> 3;"));
    for k in &compiled.kernels {
        assert!(!k.source.contains(OFFSET_DEVICE));
    }
}

// ── Offload facade ──────────────────────────────────────────────────────────

#[test]
fn second_compile_hits_cache() {
    let req = samples::map_double_request().unwrap();
    let mut offload = Offload::new(GeneratorOptions::default());
    let first = offload.compile(&req).unwrap();
    let second = offload.compile(&req).unwrap();
    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.id, second.id);
    assert_eq!(first.kernels, second.kernels);
    assert_eq!(offload.cache().len(), 1);
}

#[test]
fn failed_request_leaves_cache_untouched() {
    let mut req = samples::map_mul_request().unwrap();
    // A one-parameter lambda cannot drive a reduction.
    req.types.input = samples::float();
    req.types.computation = Computation::Reduce;
    let mut offload = Offload::new(GeneratorOptions::default());
    assert!(offload.compile(&req).is_err());
    assert!(offload.cache().is_empty());
}

#[test]
fn json_request_compiles_like_built_one() {
    let req = samples::reduce_sum_request().unwrap();
    let text = req.to_json().unwrap();
    let parsed = KernelRequest::from_json(&text).unwrap();
    assert_eq!(parsed, req);
    assert_eq!(parsed.request_id().unwrap(), req.request_id().unwrap());
    assert_eq!(
        source_of(&parsed, GeneratorOptions::default()),
        source_of(&req, GeneratorOptions::default())
    );
}
