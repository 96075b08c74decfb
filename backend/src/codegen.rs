// codegen.rs — OpenCL C generation from the closed SSA graph
//
// Lowers a kernel skeleton and the lambda graphs it invokes into one OpenCL
// translation unit: pragmas, tuple structs, lambda functions, kernel entry
// point. Lowering is a memoized depth-first walk: control nodes are visited
// in successor order, and every value operand is bound to an identifier in
// the symbol table before the node that uses it is emitted.
//
// Each lambda is lowered by its own generator into an immutable `Fragment`
// together with the structs it needs; the caller merges the structs and
// places the fragment ahead of its own text.
//
// Preconditions: graphs pass `Graph::validate`; the skeleton follows the
//                parameter convention of `skeleton` (0 = input, 1 = output).
// Postconditions: returns the complete translation unit; soft problems are
//                 reported as diagnostics in the request context.
// Failure modes: `CodegenError` for misplaced nodes, missing lambdas or
//                missing type information. Nothing is committed on error.
// Side effects: none.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace, warn};

use crate::code_buffer::{CodeBuffer, Fragment};
use crate::diag::{codes, Diagnostic};
use crate::error::CodegenError;
use crate::id::NodeId;
use crate::ir::{BinaryOp, CallTarget, Graph, NodeKind, ParamType, UnaryOp};
use crate::options::GeneratorOptions;
use crate::parray::{FieldSequence, SequenceDecode, SequenceLayout};
use crate::registry::{ExtraArrayRegistry, StructRegistry};
use crate::request::RequestContext;
use crate::skeleton::{self, Computation, INPUT_PARAM, OUTPUT_PARAM};
use crate::symbols::{Prefix, SymbolTable, ValueKind, ILLEGAL};
use crate::types::{ScalarKind, TypeDescriptor, Value, MAX_ARITY};

/// Placeholder for the per-device index offset, substituted by the facade.
pub const OFFSET_DEVICE: &str = "<offsetDevice>";

const PRAGMAS: &str = "#pragma OPENCL EXTENSION cl_khr_fp64 : enable\n";
const DEOPT_PARAM: &str = "__global int *deoptFlag";
const DEOPT_ARG: &str = "deoptFlag";
const DEOPT_RAISE: &str = "deoptFlag[0] = get_global_id(0);";
const REDUCTION_INDEX: &str = "reductionIndex";

// ── Public types ────────────────────────────────────────────────────────────

/// Everything one kernel generation reads.
#[derive(Debug, Clone, Copy)]
pub struct KernelInput<'a> {
    pub skeleton: &'a Graph,
    pub lambda: &'a Graph,
    pub nested: &'a [Graph],
    pub computation: Computation,
    pub input: &'a TypeDescriptor,
    pub output: &'a TypeDescriptor,
    /// Present when the input array is sequence-encoded.
    pub sequence: Option<&'a SequenceLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKernel {
    pub kernel_name: String,
    /// Full translation unit, still containing `OFFSET_DEVICE` placeholders.
    pub source: String,
}

/// A kernel-local function produced in isolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionText {
    pub name: String,
    pub text: Fragment,
}

/// Output of lowering one graph: its functions (callees first) and the
/// structs they reference.
#[derive(Debug, Default)]
pub struct Unit {
    pub functions: Vec<FunctionText>,
    pub structs: StructRegistry,
    pub diagnostics: Vec<Diagnostic>,
}

// ── Public entry points ─────────────────────────────────────────────────────

/// Generate the translation unit for one request. Structs, extra-array
/// names and diagnostics are recorded in `ctx`.
pub fn generate(
    input: &KernelInput<'_>,
    ctx: &mut RequestContext,
) -> Result<GeneratedKernel, CodegenError> {
    input.skeleton.validate()?;
    input.lambda.validate()?;
    for graph in input.nested {
        graph.validate()?;
    }
    input.input.validate()?;
    input.output.validate()?;

    let lambdas: Vec<&Graph> = std::iter::once(input.lambda).chain(input.nested).collect();
    let kernel_name = skeleton::kernel_name(input.skeleton);
    debug!(kernel = %kernel_name, lambda = %input.lambda.name, "generating kernel");

    let mode = Mode::Kernel {
        computation: input.computation,
        sequence: input.sequence,
    };
    let mut gen = CodegenCtx::new(input.skeleton, &lambdas, &ctx.options, mode, Vec::new());
    gen.register_io(input.input, input.output);
    gen.emit_kernel(&kernel_name, input)?;
    let parts = gen.finish();

    ctx.structs.merge(&parts.unit.structs);
    ctx.extra_arrays = parts.extra;
    ctx.diagnostics.extend(parts.unit.diagnostics);
    debug!(
        kernel = %kernel_name,
        structs = ctx.structs.len(),
        functions = parts.unit.functions.len(),
        "kernel generated"
    );

    let mut source = String::with_capacity(4096);
    source.push_str(PRAGMAS);
    source.push('\n');
    let structs = ctx.structs.render_all();
    if !structs.is_empty() {
        source.push_str(&structs);
        source.push('\n');
    }
    for function in &parts.unit.functions {
        source.push_str(function.text.as_str());
        source.push('\n');
    }
    source.push_str(parts.kernel.as_str());
    Ok(GeneratedKernel {
        kernel_name,
        source,
    })
}

/// Lower a single lambda graph (and the lambdas it calls) to functions.
pub fn lower_lambda(
    lambda: &Graph,
    nested: &[Graph],
    options: &GeneratorOptions,
) -> Result<Unit, CodegenError> {
    lambda.validate()?;
    let lambdas: Vec<&Graph> = std::iter::once(lambda).chain(nested).collect();
    lower_function(lambda, &lambdas, options, vec![lambda.name.clone()])
}

/// Name of the generated function for lambda graph `name`.
pub fn function_name(name: &str) -> String {
    let mut out = String::from("lambda_");
    out.extend(
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }),
    );
    out
}

/// 1-based struct position of component `component` of an arity-`arity`
/// tuple accessor.
pub fn accessor_position(arity: usize, component: usize) -> Option<usize> {
    ACCESSORS
        .get(arity)
        .and_then(|row| row.get(component))
        .copied()
        .flatten()
}

const ACCESSORS: [[Option<usize>; MAX_ARITY]; MAX_ARITY + 1] = build_accessors();

const fn build_accessors() -> [[Option<usize>; MAX_ARITY]; MAX_ARITY + 1] {
    let mut table = [[None; MAX_ARITY]; MAX_ARITY + 1];
    let mut arity = 1;
    while arity <= MAX_ARITY {
        let mut component = 0;
        while component < arity {
            table[arity][component] = Some(component + 1);
            component += 1;
        }
        arity += 1;
    }
    table
}

/// OpenCL C literal for a scalar value.
pub fn literal(value: &Value) -> Option<String> {
    Some(match value {
        Value::Byte(v) => format!("(char) {}", v),
        Value::Char(v) => format!("(uchar) {}", v),
        Value::Short(v) => format!("(short) {}", v),
        Value::Int(v) => v.to_string(),
        Value::Long(v) => format!("{}L", v),
        Value::Float(v) => float_literal(*v as f64, format!("{:?}", v), "f"),
        Value::Double(v) => float_literal(*v, format!("{:?}", v), ""),
        Value::Boolean(v) => v.to_string(),
        Value::Tuple(_) => return None,
    })
}

fn float_literal(v: f64, text: String, suffix: &str) -> String {
    if v.is_nan() {
        "NAN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "INFINITY" } else { "(-INFINITY)" }.to_string()
    } else {
        format!("{}{}", text, suffix)
    }
}

// ── Internal context ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Mode<'a> {
    Kernel {
        computation: Computation,
        sequence: Option<&'a SequenceLayout>,
    },
    Function,
}

#[derive(Debug, Clone, Copy)]
struct LoopFrame {
    explicit: bool,
    reduction: bool,
}

struct Parts {
    unit: Unit,
    kernel: Fragment,
    extra: ExtraArrayRegistry,
}

struct CodegenCtx<'a> {
    graph: &'a Graph,
    lambdas: &'a [&'a Graph],
    options: &'a GeneratorOptions,
    mode: Mode<'a>,
    buf: CodeBuffer,
    symbols: SymbolTable,
    structs: StructRegistry,
    extra: ExtraArrayRegistry,
    diagnostics: Vec<Diagnostic>,
    functions: Vec<FunctionText>,
    /// Lambda names currently being lowered, outermost first.
    stack: Vec<String>,
    loops: Vec<LoopFrame>,
    lowered_merges: HashSet<NodeId>,
    /// Local arrays by identifier, with the expression for their length.
    local_arrays: HashMap<String, String>,
    /// Index-metadata base expression of the structure-of-arrays input.
    soa_input: Option<(NodeId, String)>,
    soa_output: Option<NodeId>,
    /// Structure-of-arrays element loads, with the index expression used.
    soa_elements: HashMap<NodeId, String>,
    /// Kernel-side arguments forwarded ahead of the lambda arguments.
    scope_args: Vec<String>,
    param_counter: usize,
}

fn lower_function(
    graph: &Graph,
    lambdas: &[&Graph],
    options: &GeneratorOptions,
    stack: Vec<String>,
) -> Result<Unit, CodegenError> {
    let mut gen = CodegenCtx::new(graph, lambdas, options, Mode::Function, stack);
    let name = function_name(&graph.name);
    gen.emit_function(&name)?;
    let parts = gen.finish();
    let mut unit = parts.unit;
    unit.functions.push(FunctionText {
        name,
        text: parts.kernel,
    });
    Ok(unit)
}

impl<'a> CodegenCtx<'a> {
    fn new(
        graph: &'a Graph,
        lambdas: &'a [&'a Graph],
        options: &'a GeneratorOptions,
        mode: Mode<'a>,
        stack: Vec<String>,
    ) -> Self {
        CodegenCtx {
            graph,
            lambdas,
            options,
            mode,
            buf: CodeBuffer::new(options.comments),
            symbols: SymbolTable::new(),
            structs: StructRegistry::new(),
            extra: ExtraArrayRegistry::new(),
            diagnostics: Vec::new(),
            functions: Vec::new(),
            stack,
            loops: Vec::new(),
            lowered_merges: HashSet::new(),
            local_arrays: HashMap::new(),
            soa_input: None,
            soa_output: None,
            soa_elements: HashMap::new(),
            scope_args: Vec::new(),
            param_counter: 0,
        }
    }

    fn finish(self) -> Parts {
        Parts {
            unit: Unit {
                functions: self.functions,
                structs: self.structs,
                diagnostics: self.diagnostics,
            },
            kernel: self.buf.into_fragment(),
            extra: self.extra,
        }
    }

    fn is_kernel(&self) -> bool {
        matches!(self.mode, Mode::Kernel { .. })
    }

    fn computation(&self) -> Option<Computation> {
        match self.mode {
            Mode::Kernel { computation, .. } => Some(computation),
            Mode::Function => None,
        }
    }

    // ── Diagnostics ──

    fn warn_illegal(&mut self, id: NodeId, what: &str) -> String {
        warn!(node = %id, "{}", what);
        self.diagnostics.push(
            Diagnostic::warning(id, format!("{}; emission suppressed", what))
                .with_code(codes::ILLEGAL_VALUE),
        );
        self.symbols.add(ILLEGAL, id, ValueKind::Illegal);
        ILLEGAL.to_string()
    }

    /// Fallback for nodes without a lowering: a diagnostic comment and a
    /// visible marker in the text, then the value is treated as illegal.
    fn generic(&mut self, id: NodeId, name: &str) -> String {
        self.buf
            .emit_code(&format!("/* #ERROR: no lowering for {} ({}) */", name, id));
        self.buf.emit_code(&format!("// #ERROR: {} ({})", name, id));
        warn!(node = %id, kind = name, "no lowering, generic handler used");
        self.diagnostics.push(
            Diagnostic::warning(id, format!("no lowering for `{}`", name))
                .with_code(codes::GENERIC_HANDLER)
                .with_hint("the kernel is incomplete; run the host fallback"),
        );
        self.symbols.add(ILLEGAL, id, ValueKind::Illegal);
        ILLEGAL.to_string()
    }

    // ── Types ──

    /// OpenCL spelling of a value kind, registering structs on the way.
    fn type_name(&mut self, kind: &ValueKind) -> Option<String> {
        match kind {
            ValueKind::Scalar(k) => Some(k.ocl_name().to_string()),
            ValueKind::Struct(ty) => Some(self.structs.register(ty)),
            ValueKind::Void => Some("void".to_string()),
            ValueKind::Array(_) | ValueKind::Illegal => None,
        }
    }

    /// OpenCL spelling of an array element type.
    fn element_type_name(&mut self, ty: &TypeDescriptor) -> Option<String> {
        let kind = ValueKind::of(ty);
        self.type_name(&kind)
    }

    fn register_io(&mut self, input: &TypeDescriptor, output: &TypeDescriptor) {
        for ty in [input, output] {
            if ty.needs_struct() {
                self.structs.register(ty);
            }
        }
    }

    fn fresh(&mut self, prefix: Prefix) -> String {
        self.symbols.new_variable(prefix)
    }

    /// Emit `T name = expr;` for a fresh identifier and bind it to `id`.
    fn declare(&mut self, id: NodeId, prefix: Prefix, kind: ValueKind, expr: &str) -> String {
        let Some(ty) = self.type_name(&kind) else {
            return self.warn_illegal(id, "value has no OpenCL type");
        };
        let name = self.fresh(prefix);
        self.buf.emit_code(&format!("{} {} = {};", ty, name, expr));
        self.symbols.add(name.clone(), id, kind);
        name
    }

    // ── Signatures ──

    fn emit_kernel(&mut self, kernel_name: &str, input: &KernelInput<'_>) -> Result<(), CodegenError> {
        let graph = self.graph;
        let mut params = Vec::new();
        let mut dims = Vec::new();

        for (id, index, ty) in graph.parameters() {
            match ty {
                ParamType::Array(elem) if elem.needs_struct() && self.options.soa => {
                    self.soa_param(id, index, elem, &mut params, &mut dims)?;
                }
                _ => {
                    let name = self.next_param();
                    self.param_decl(&name, ty, &mut params, &mut dims)?;
                    self.symbols.add(name, id, ty.value_kind());
                }
            }
        }

        let arity = input.computation.lambda_arity();
        let lambda_params = input.lambda.parameters();
        if lambda_params.len() < arity {
            return Err(CodegenError::MissingType(format!(
                "lambda `{}` takes {} parameters, expected at least {}",
                input.lambda.name,
                lambda_params.len(),
                arity
            )));
        }
        let scope_count = lambda_params.len() - arity;
        // Lambda nodes are never looked up here; only the names are forwarded.
        for (_, _, ty) in lambda_params.into_iter().take(scope_count) {
            let name = self.next_param();
            self.param_decl(&name, ty, &mut params, &mut dims)?;
            if ty.is_array() {
                self.scope_args.push(format!("{}, {}_index_data", name, name));
            } else {
                self.scope_args.push(name);
            }
        }
        if self.options.deopt_guards {
            params.push(DEOPT_PARAM.to_string());
        }

        self.buf.emit_code(&format!(
            "__kernel void {}({})",
            kernel_name,
            params.join(", ")
        ));
        self.buf.emit_code("{");
        self.buf.begin_block();
        for dim in &dims {
            self.buf.emit_code(&format!("int {}_dim_1 = 0;", dim));
        }
        self.declare_merge_phis();
        if input.computation == Computation::Map {
            self.buf.emit_code("int gs = get_global_size(0);");
        }
        if self.options.deopt_guards {
            self.buf.emit_code("deoptFlag[0] = 0;");
        }
        let start = graph.start()?;
        self.lower_control(start)?;
        self.buf.end_block();
        self.buf.emit_code("}");
        Ok(())
    }

    fn emit_function(&mut self, name: &str) -> Result<(), CodegenError> {
        let graph = self.graph;
        let ret_kind = graph.return_kind();
        let Some(ret) = self.type_name(&ret_kind) else {
            return Err(CodegenError::MissingType(format!(
                "return type of lambda `{}`",
                graph.name
            )));
        };

        let mut params = Vec::new();
        let mut dims = Vec::new();
        for (id, index, ty) in graph.parameters() {
            let pname = format!("p{}", index);
            self.param_decl(&pname, ty, &mut params, &mut dims)?;
            self.symbols.add(pname, id, ty.value_kind());
        }
        if self.options.deopt_guards {
            params.push(DEOPT_PARAM.to_string());
        }

        self.buf
            .emit_code(&format!("{} {}({})", ret, name, params.join(", ")));
        self.buf.emit_code("{");
        self.buf.begin_block();
        for dim in &dims {
            self.buf.emit_code(&format!("int {}_dim_1 = 0;", dim));
        }
        self.declare_merge_phis();
        let start = graph.start()?;
        self.lower_control(start)?;
        self.buf.end_block();
        self.buf.emit_code("}");
        Ok(())
    }

    fn next_param(&mut self) -> String {
        let name = format!("p{}", self.param_counter);
        self.param_counter += 1;
        name
    }

    /// Declare one parameter. Arrays travel with their index metadata buffer.
    fn param_decl(
        &mut self,
        name: &str,
        ty: &ParamType,
        params: &mut Vec<String>,
        dims: &mut Vec<String>,
    ) -> Result<(), CodegenError> {
        match ty {
            ParamType::Array(elem) => {
                let elem_ty = self
                    .element_type_name(elem)
                    .ok_or_else(|| CodegenError::MissingType(format!("element type {}", elem)))?;
                params.push(format!("__global {} *{}", elem_ty, name));
                params.push(format!("__constant int *{}_index_data", name));
                dims.push(name.to_string());
            }
            ParamType::Scalar(_) | ParamType::Tuple(_) => {
                let kind = ty.value_kind();
                let pty = self
                    .type_name(&kind)
                    .ok_or_else(|| CodegenError::MissingType(format!("parameter {}", name)))?;
                params.push(format!("{} {}", pty, name));
            }
        }
        Ok(())
    }

    /// One pointer per tuple field. The input shares a single index-metadata
    /// buffer named after its last field; outputs carry none.
    fn soa_param(
        &mut self,
        id: NodeId,
        index: usize,
        elem: &TypeDescriptor,
        params: &mut Vec<String>,
        dims: &mut Vec<String>,
    ) -> Result<(), CodegenError> {
        let mut names = Vec::with_capacity(elem.arity());
        for (field, fty) in elem.fields().iter().enumerate() {
            let Some(kind) = fty.scalar_kind() else {
                return Err(CodegenError::MissingType(format!(
                    "structure-of-arrays field {} of {} is not scalar",
                    field, elem
                )));
            };
            let name = self.next_param();
            params.push(format!("__global {} *{}", kind.ocl_name(), name));
            if index == OUTPUT_PARAM {
                self.extra.add_output(name.clone(), field, kind.ocl_name());
            } else {
                self.extra.add_input(name.clone(), field, kind.ocl_name());
            }
            names.push(name);
        }
        let Some(last) = names.last().cloned() else {
            return Err(CodegenError::MissingType(format!("empty tuple {}", elem)));
        };
        if index == OUTPUT_PARAM {
            self.soa_output = Some(id);
            self.symbols.add(names[0].clone(), id, ValueKind::Array(elem.clone()));
        } else {
            params.push(format!("__constant int *{}_index_data", last));
            dims.push(last.clone());
            self.soa_input = Some((id, format!("{}_index_data[{}_dim_1 + 1]", last, last)));
            self.symbols.add(last, id, ValueKind::Array(elem.clone()));
        }
        Ok(())
    }

    /// Phis of forward merges are assigned in both branches, so they are
    /// declared before any control flow.
    fn declare_merge_phis(&mut self) {
        let graph = self.graph;
        for phi in graph.merge_phis() {
            let kind = graph.infer_kind(phi);
            match self.type_name(&kind) {
                Some(ty) if !matches!(kind, ValueKind::Void) => {
                    let name = self.fresh(Prefix::Phi);
                    self.buf.emit_code(&format!("{} {};", ty, name));
                    self.symbols.add(name, phi, kind);
                }
                _ => {
                    self.warn_illegal(phi, "phi of undetermined kind");
                }
            }
        }
    }

    fn in_scope<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, CodegenError>,
    ) -> Result<T, CodegenError> {
        self.symbols.enter_scope();
        let result = f(self);
        self.symbols.exit_scope();
        result
    }

    // ── Control flow ──

    /// Lower a control node and everything after it. Returns the merge the
    /// path ended at, if any, so the enclosing `If` can continue from it.
    fn lower_control(&mut self, id: NodeId) -> Result<Option<NodeId>, CodegenError> {
        let graph = self.graph;
        let kind = graph.kind(id)?;
        trace!(node = %id, kind = kind.name(), "lower control");
        self.buf.emit_comment(&format!("visited {} {}", kind.name(), id));

        match kind {
            NodeKind::Start { next } => self.lower_control(*next),
            NodeKind::Begin { next } => self.in_scope(|s| s.lower_control(*next)),
            NodeKind::End { merge } => {
                let phis = graph.phis_of(*merge);
                let mut assigns = Vec::with_capacity(phis.len());
                for phi in phis {
                    let value = graph.phi_value_at(phi, id)?;
                    let v = self.value(value)?;
                    if let Some(target) = self.symbols.lookup_name(phi) {
                        if v != ILLEGAL && target != ILLEGAL {
                            assigns.push(format!("{} = {};", target, v));
                        }
                    }
                }
                for line in assigns {
                    self.buf.emit_code(&line);
                }
                Ok(Some(*merge))
            }
            NodeKind::Merge { next } => {
                if !self.lowered_merges.insert(id) {
                    return Ok(None);
                }
                self.lower_control(*next)
            }
            NodeKind::If { condition, on_true, on_false } => {
                self.lower_if(id, *condition, *on_true, *on_false)
            }
            NodeKind::LoopBegin { next, bound } => self.lower_loop(id, *next, *bound),
            NodeKind::LoopEnd { loop_begin } => {
                self.lower_loop_end(id, *loop_begin)?;
                Ok(None)
            }
            NodeKind::LoopExit { next, .. } => {
                let flow = self.lower_control(*next)?;
                if self.loops.last().is_some_and(|f| f.explicit) {
                    self.buf.compare_not_return_and_emit("break;");
                }
                Ok(flow)
            }
            NodeKind::StoreIndexed { array, index, value, next } => {
                self.lower_store_indexed(*array, *index, *value)?;
                self.lower_control(*next)
            }
            NodeKind::StoreField { object, field, value, next } => {
                let obj = self.value(*object)?;
                let v = self.value(*value)?;
                if obj != ILLEGAL && v != ILLEGAL {
                    self.buf.emit_code(&format!("{}._{} = {};", obj, field + 1, v));
                }
                self.lower_control(*next)
            }
            NodeKind::FixedGuard { condition, negated, next } => {
                if self.options.deopt_guards {
                    let cond = self.value(*condition)?;
                    if cond != ILLEGAL {
                        let test = if *negated {
                            cond
                        } else {
                            format!("!{}", cond)
                        };
                        self.buf
                            .emit_code(&format!("if ({}) {{ {} }}", test, DEOPT_RAISE));
                    }
                }
                self.lower_control(*next)
            }
            NodeKind::Return { value } => {
                self.lower_return(*value)?;
                Ok(None)
            }
            NodeKind::Deoptimize => {
                self.lower_deoptimize(id);
                Ok(None)
            }
            NodeKind::Unsupported { name, inputs, next } => {
                for input in inputs {
                    self.value(*input)?;
                }
                self.generic(id, name);
                match next {
                    Some(next) => self.lower_control(*next),
                    None => Ok(None),
                }
            }
            NodeKind::Parameter { .. }
            | NodeKind::Constant(_)
            | NodeKind::Unary { .. }
            | NodeKind::Binary { .. }
            | NodeKind::Compare { .. }
            | NodeKind::NormalizeCompare { .. }
            | NodeKind::Conditional { .. }
            | NodeKind::Convert { .. }
            | NodeKind::Passthrough { .. }
            | NodeKind::Math { .. }
            | NodeKind::ArrayLength { .. }
            | NodeKind::LoadIndexed { .. }
            | NodeKind::LoadField { .. }
            | NodeKind::NewInstance { .. }
            | NodeKind::NewArray { .. }
            | NodeKind::Invoke { .. }
            | NodeKind::MapChain { .. }
            | NodeKind::Phi { .. } => Err(graph.misplaced(id)),
        }
    }

    fn lower_if(
        &mut self,
        id: NodeId,
        condition: NodeId,
        on_true: NodeId,
        on_false: NodeId,
    ) -> Result<Option<NodeId>, CodegenError> {
        let cond = self.value(condition)?;
        if cond == ILLEGAL {
            return Err(self.graph.misplaced(id));
        }
        self.buf.emit_code(&format!("if ({}) {{", cond));
        self.buf.begin_block();
        let t = self.lower_control(on_true)?;
        self.buf.end_block();
        self.buf.emit_code("} else {");
        let before = self.buf.len();
        self.buf.begin_block();
        let f = self.lower_control(on_false)?;
        self.buf.end_block();
        if self.buf.len() == before {
            // Empty else: drop the `} else {` line and close the if.
            self.buf.remove_last_lines(1);
        }
        self.buf.emit_code("}");

        match (t, f) {
            (Some(a), Some(b)) if a != b => Err(self.graph.misplaced(b)),
            (Some(m), _) | (None, Some(m)) => self.lower_control(m),
            (None, None) => Ok(None),
        }
    }

    fn lower_loop(
        &mut self,
        id: NodeId,
        next: NodeId,
        bound: Option<NodeId>,
    ) -> Result<Option<NodeId>, CodegenError> {
        let graph = self.graph;
        let outermost = self.loops.is_empty();
        let reduction = outermost && self.computation() == Some(Computation::Reduce);
        let parallel = outermost && self.computation() == Some(Computation::Map);

        let mut reduction_init = None;
        for (n, phi) in graph.phis_of(id).into_iter().enumerate() {
            let NodeKind::Phi { values, .. } = graph.kind(phi)? else {
                return Err(graph.misplaced(phi));
            };
            let first = *values.first().ok_or_else(|| graph.misplaced(phi))?;
            let kind = graph.infer_kind(phi);
            let init = self.value(first)?;
            if reduction && n == 0 {
                self.symbols.add(REDUCTION_INDEX, phi, kind);
                reduction_init = Some(init);
                continue;
            }
            let Some(ty) = self.type_name(&kind) else {
                self.warn_illegal(phi, "loop variable of undetermined kind");
                continue;
            };
            let name = self.fresh(Prefix::Loop);
            let line = if parallel {
                format!("{} {} = get_global_id(0); // Initial value", ty, name)
            } else if self.is_kernel() {
                format!("{} {} = {};", ty, name, init)
            } else {
                format!("{} {} = {}; // LoopBegin", ty, name, init)
            };
            self.buf.emit_code(&line);
            self.symbols.add(name, phi, kind);
        }

        if reduction {
            let bound = bound.ok_or_else(|| graph.misplaced(id))?;
            let max = self.value(bound)?;
            let init = reduction_init.unwrap_or_else(|| "1".to_string());
            self.buf.emit_no_newline(&format!(
                "for (int {idx} = {init} ; {idx} < {max} ; {idx}++)",
                idx = REDUCTION_INDEX,
                init = init,
                max = max
            ));
        } else if !parallel {
            self.buf.emit_no_newline("for ( ; ; )");
        }
        self.buf.emit_code("{");
        self.loops.push(LoopFrame {
            explicit: !parallel,
            reduction,
        });
        self.buf.begin_block();
        let body = self.in_scope(|s| s.lower_control(next));
        self.buf.end_block();
        self.loops.pop();
        self.buf.emit_code("}");
        body.map(|_| None)
    }

    fn lower_loop_end(&mut self, id: NodeId, loop_begin: NodeId) -> Result<(), CodegenError> {
        let Some(frame) = self.loops.last().copied() else {
            return Err(self.graph.misplaced(id));
        };
        if !frame.explicit || frame.reduction {
            return Ok(());
        }
        let graph = self.graph;
        let phis = graph.phis_of(loop_begin);
        let mut updates = Vec::with_capacity(phis.len());
        for phi in phis {
            let value = graph.phi_value_at(phi, id)?;
            let v = self.value(value)?;
            updates.push((phi, v));
        }
        for (phi, v) in updates {
            let Some(target) = self.symbols.lookup_name(phi).map(str::to_string) else {
                continue;
            };
            if v != ILLEGAL && target != ILLEGAL {
                self.buf.emit_code(&format!("{} = {};", target, v));
            }
        }
        Ok(())
    }

    fn lower_return(&mut self, value: Option<NodeId>) -> Result<(), CodegenError> {
        if self.is_kernel() {
            return Ok(());
        }
        match value {
            Some(v) => {
                let name = self.value(v)?;
                if name != ILLEGAL {
                    self.buf.compare_and_emit(&format!("return {};", name));
                }
            }
            None => self.buf.compare_and_emit("return;"),
        }
        Ok(())
    }

    fn lower_deoptimize(&mut self, id: NodeId) {
        self.diagnostics.push(
            Diagnostic::warning(id, "deoptimization point lowered to a flag write")
                .with_code(codes::DEOPT_POINT),
        );
        if self.options.deopt_guards {
            self.buf.emit_code(DEOPT_RAISE);
        }
        if self.is_kernel() {
            self.buf.compare_and_emit("return;");
            return;
        }
        let zero = self
            .graph
            .return_kind()
            .scalar()
            .map(|k| Value::zero(&TypeDescriptor::scalar(k)))
            .and_then(|v| literal(&v));
        if let Some(zero) = zero {
            self.buf.compare_and_emit(&format!("return {};", zero));
        }
    }

    fn lower_store_indexed(
        &mut self,
        array: NodeId,
        index: NodeId,
        value: NodeId,
    ) -> Result<(), CodegenError> {
        let arr = self.value(array)?;
        let idx = self.value(index)?;
        let v = self.value(value)?;
        if arr == ILLEGAL || idx == ILLEGAL || v == ILLEGAL {
            return Ok(());
        }
        if self.soa_output == Some(array) {
            let lines: Vec<String> = self
                .extra
                .outputs()
                .iter()
                .map(|out| format!("{}[{}] = {}._{};", out.name, idx, v, out.field + 1))
                .collect();
            for line in lines {
                self.buf.emit_code(&line);
            }
            return Ok(());
        }
        if let Some((param, base)) = self.soa_input.clone() {
            if param == array {
                let lines: Vec<String> = self
                    .extra
                    .inputs()
                    .iter()
                    .map(|f| format!("{}[{} + {}] = {}._{};", f.name, base, idx, v, f.field + 1))
                    .collect();
                for line in lines {
                    self.buf.emit_code(&line);
                }
                return Ok(());
            }
        }
        let target = self.element_ref(&arr, &idx);
        self.buf.emit_code(&format!("{} = {};", target, v));
        Ok(())
    }

    // ── Values ──

    fn element_ref(&self, arr: &str, idx: &str) -> String {
        if self.local_arrays.contains_key(arr) {
            format!("{}[{}]", arr, idx)
        } else {
            format!("{a}[{a}_index_data[{a}_dim_1 + 1] + {i}]", a = arr, i = idx)
        }
    }

    /// Lower the operands; `None` when any of them is illegal.
    fn operands(&mut self, ids: &[NodeId]) -> Result<Option<Vec<String>>, CodegenError> {
        let mut names = Vec::with_capacity(ids.len());
        for id in ids {
            let name = self.value(*id)?;
            if name == ILLEGAL {
                return Ok(None);
            }
            names.push(name);
        }
        Ok(Some(names))
    }

    /// Identifier holding the value of `id`, lowering it first if needed.
    fn value(&mut self, id: NodeId) -> Result<String, CodegenError> {
        if let Some(name) = self.symbols.lookup_name(id) {
            return Ok(name.to_string());
        }
        let graph = self.graph;
        let kind = graph.kind(id)?;
        trace!(node = %id, kind = kind.name(), "lower value");
        self.buf.emit_comment(&format!("visited {} {}", kind.name(), id));

        let inferred = graph.infer_kind(id);
        let operands = kind.inputs();
        let illegal_operand = |s: &mut Self| s.warn_illegal(id, "operand of undetermined kind");

        match kind {
            NodeKind::Constant(v) => match literal(v) {
                Some(lit) => {
                    self.symbols.add(lit.clone(), id, inferred);
                    Ok(lit)
                }
                None => Ok(self.warn_illegal(id, "constant has no OpenCL literal")),
            },
            NodeKind::Unary { op, .. } => {
                let Some(args) = self.operands(&operands)? else {
                    return Ok(illegal_operand(self));
                };
                let expr = match (op, inferred.scalar()) {
                    (UnaryOp::Neg, _) => format!("-{}", args[0]),
                    (UnaryOp::Not, Some(ScalarKind::Boolean)) => format!("!{}", args[0]),
                    (UnaryOp::Not, _) => format!("~{}", args[0]),
                };
                Ok(self.declare(id, Prefix::Result, inferred, &expr))
            }
            NodeKind::Binary { op, x, .. } => {
                let Some(args) = self.operands(&operands)? else {
                    return Ok(illegal_operand(self));
                };
                let Some(result) = inferred.scalar() else {
                    return Ok(self.warn_illegal(id, "binary operation on non-scalar operands"));
                };
                let expr = binary_expr(*op, result, graph.infer_kind(*x).scalar(), &args[0], &args[1]);
                Ok(self.declare(id, Prefix::Result, inferred, &expr))
            }
            NodeKind::Compare { op, .. } => {
                let Some(args) = self.operands(&operands)? else {
                    return Ok(illegal_operand(self));
                };
                let expr = format!("{} {} {}", args[0], op.symbol(), args[1]);
                Ok(self.declare(id, Prefix::Cond, inferred, &expr))
            }
            NodeKind::NormalizeCompare { .. } => {
                let Some(args) = self.operands(&operands)? else {
                    return Ok(illegal_operand(self));
                };
                let (x, y) = (&args[0], &args[1]);
                let expr = format!("{x} < {y} ? -1 : {x} == {y} ? 0 : 1", x = x, y = y);
                Ok(self.declare(id, Prefix::Cond, inferred, &expr))
            }
            NodeKind::Conditional { .. } => {
                let Some(args) = self.operands(&operands)? else {
                    return Ok(illegal_operand(self));
                };
                let expr = format!("({}) ? {} : {}", args[0], args[1], args[2]);
                Ok(self.declare(id, Prefix::Result, inferred, &expr))
            }
            NodeKind::Convert { to, .. } => {
                let Some(args) = self.operands(&operands)? else {
                    return Ok(illegal_operand(self));
                };
                let expr = format!("({}) {}", to.ocl_name(), args[0]);
                Ok(self.declare(id, Prefix::Cast, inferred, &expr))
            }
            NodeKind::Passthrough { value, .. } => {
                let name = self.value(*value)?;
                if name == ILLEGAL {
                    return Ok(illegal_operand(self));
                }
                self.symbols.alias(id, *value);
                Ok(name)
            }
            NodeKind::Math { op, args: math_args } => {
                if math_args.len() != op.arity() {
                    return Ok(self.warn_illegal(id, "math intrinsic with wrong operand count"));
                }
                let Some(args) = self.operands(&operands)? else {
                    return Ok(illegal_operand(self));
                };
                let Some(result) = inferred.scalar() else {
                    return Ok(self.warn_illegal(id, "math intrinsic on non-scalar operands"));
                };
                let mut rendered = Vec::with_capacity(args.len());
                for (arg_id, arg) in math_args.iter().zip(&args) {
                    let arg_kind = graph.infer_kind(*arg_id).scalar();
                    if arg_kind == Some(result) {
                        rendered.push(arg.clone());
                    } else {
                        rendered.push(format!("({}) {}", result.ocl_name(), arg));
                    }
                }
                let expr = format!("{}({})", op.name(), rendered.join(", "));
                Ok(self.declare(id, Prefix::Result, inferred, &expr))
            }
            NodeKind::ArrayLength { array } => self.lower_array_length(id, *array),
            NodeKind::LoadIndexed { array, index } => self.lower_load_indexed(id, *array, *index),
            NodeKind::LoadField { object, field } => {
                let obj = self.value(*object)?;
                if obj == ILLEGAL || inferred.is_illegal() {
                    return Ok(illegal_operand(self));
                }
                let expr = format!("{}._{}", obj, field + 1);
                Ok(self.declare(id, Prefix::Field, inferred, &expr))
            }
            NodeKind::NewInstance { ty, .. } => self.lower_new_instance(id, ty, &operands),
            NodeKind::NewArray { element, length } => {
                let name = self.fresh(Prefix::Result);
                self.buf
                    .emit_code(&format!("{} {}[{}];", element.ocl_name(), name, length));
                self.local_arrays.insert(name.clone(), length.to_string());
                self.symbols.add(name.clone(), id, inferred);
                Ok(name)
            }
            NodeKind::Invoke { target, .. } => self.lower_invoke(id, target, &operands, inferred),
            NodeKind::MapChain { lambda, array, capacity, element } => {
                self.lower_map_chain(id, lambda, *array, *capacity, element)
            }
            NodeKind::Unsupported { name, inputs, .. } => {
                for input in inputs {
                    self.value(*input)?;
                }
                Ok(self.generic(id, name))
            }
            // Bound by the signature or the enclosing loop/merge.
            NodeKind::Parameter { .. } | NodeKind::Phi { .. } => Err(graph.misplaced(id)),
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
            | NodeKind::Deoptimize => Err(graph.misplaced(id)),
        }
    }

    fn lower_array_length(&mut self, id: NodeId, array: NodeId) -> Result<String, CodegenError> {
        let arr = self.value(array)?;
        if arr == ILLEGAL {
            return Ok(self.warn_illegal(id, "length of an array of undetermined kind"));
        }
        if let Some(len) = self.local_arrays.get(&arr).cloned() {
            self.symbols.add(len.clone(), id, ValueKind::Scalar(ScalarKind::Int));
            return Ok(len);
        }
        let name = format!("{}_len_dim_1", arr);
        if self.symbols.lookup_node(&name).is_none() {
            self.buf.emit_code(&format!(
                "int {} = {}_index_data[{}_dim_1];",
                name, arr, arr
            ));
        }
        self.symbols.add(name.clone(), id, ValueKind::Scalar(ScalarKind::Int));
        Ok(name)
    }

    fn lower_load_indexed(
        &mut self,
        id: NodeId,
        array: NodeId,
        index: NodeId,
    ) -> Result<String, CodegenError> {
        let arr = self.value(array)?;
        let idx = self.value(index)?;
        let kind = self.graph.infer_kind(id);
        if arr == ILLEGAL || idx == ILLEGAL || kind.is_illegal() {
            return Ok(self.warn_illegal(id, "load from an array of undetermined kind"));
        }

        let sequence = match self.mode {
            Mode::Kernel { sequence, .. } => sequence,
            Mode::Function => None,
        };
        let is_input = self.is_input_param(array);

        if let Some((param, base)) = self.soa_input.clone() {
            if param == array {
                let fields: Vec<(String, usize, String)> = self
                    .extra
                    .inputs()
                    .iter()
                    .map(|f| (f.name.clone(), f.field, f.ty.clone()))
                    .collect();
                let mut values = Vec::with_capacity(fields.len());
                for (name, field, ty) in &fields {
                    let v = match sequence {
                        Some(layout) => self.decode_field(id, layout, *field, &idx)?,
                        None => {
                            let v = self.fresh(Prefix::Field);
                            self.buf
                                .emit_code(&format!("{} {} = {}[{} + {}];", ty, v, name, base, idx));
                            v
                        }
                    };
                    values.push(v);
                }
                self.soa_elements.insert(id, idx);
                return Ok(self.assemble_struct(id, kind, &values));
            }
        }
        if self.soa_output == Some(array) {
            let fields: Vec<(String, String)> = self
                .extra
                .outputs()
                .iter()
                .map(|f| (f.name.clone(), f.ty.clone()))
                .collect();
            let mut values = Vec::with_capacity(fields.len());
            for (name, ty) in &fields {
                let v = self.fresh(Prefix::Field);
                self.buf
                    .emit_code(&format!("{} {} = {}[{}];", ty, v, name, idx));
                values.push(v);
            }
            return Ok(self.assemble_struct(id, kind, &values));
        }
        if let (Some(layout), true) = (sequence, is_input) {
            if let Some(elem) = kind.scalar() {
                let v = self.decode_field(id, layout, 0, &idx)?;
                self.symbols.add(v.clone(), id, ValueKind::Scalar(elem));
                return Ok(v);
            }
        }
        let expr = self.element_ref(&arr, &idx);
        Ok(self.declare(id, Prefix::ArrayElement, kind, &expr))
    }

    fn is_input_param(&self, array: NodeId) -> bool {
        matches!(
            self.graph.kind(array),
            Ok(NodeKind::Parameter { index: INPUT_PARAM, .. })
        )
    }

    /// `T s; s._1 = f0; ...` for a tuple read field by field.
    fn assemble_struct(&mut self, id: NodeId, kind: ValueKind, values: &[String]) -> String {
        if !matches!(kind, ValueKind::Struct(_)) {
            return match values.first() {
                Some(v) => {
                    self.symbols.add(v.clone(), id, kind);
                    v.clone()
                }
                None => self.warn_illegal(id, "empty tuple"),
            };
        }
        let Some(ty) = self.type_name(&kind) else {
            return self.warn_illegal(id, "tuple without struct type");
        };
        let name = self.fresh(Prefix::ArrayElement);
        self.buf.emit_code(&format!("{} {};", ty, name));
        for (i, v) in values.iter().enumerate() {
            self.buf.emit_code(&format!("{}._{} = {};", name, i + 1, v));
        }
        self.symbols.add(name.clone(), id, kind);
        name
    }

    /// Element `idx` of sequence-encoded field `field`, computed in place.
    fn decode_field(
        &mut self,
        id: NodeId,
        layout: &SequenceLayout,
        field: usize,
        idx: &str,
    ) -> Result<String, CodegenError> {
        let seq = layout.fields.get(field).ok_or_else(|| {
            CodegenError::MissingType(format!("sequence layout has no field {}", field))
        })?;
        let kind = seq.start.kind().ok_or_else(|| {
            CodegenError::MissingType(format!("sequence field {} start is not scalar", field))
        })?;
        let (Some(start), Some(stride)) = (literal(&seq.start), literal(&seq.stride.cast(kind))) else {
            return Ok(self.warn_illegal(id, "sequence slots without literal form"));
        };
        let name = self.fresh(Prefix::Field);
        match decode_index(seq, idx) {
            Some(m_expr) => {
                let m = self.fresh(Prefix::Thread);
                self.buf.emit_code(&format!("int {} = {};", m, m_expr));
                self.buf.emit_code(&format!(
                    "{} {} = {} + {} * {};",
                    kind.ocl_name(),
                    name,
                    start,
                    stride,
                    m
                ));
            }
            None => {
                self.buf.emit_code(&format!(
                    "{} {} = {} + {} * ({} {});",
                    kind.ocl_name(),
                    name,
                    start,
                    stride,
                    idx,
                    OFFSET_DEVICE
                ));
            }
        }
        Ok(name)
    }

    fn lower_new_instance(
        &mut self,
        id: NodeId,
        ty: &TypeDescriptor,
        fields: &[NodeId],
    ) -> Result<String, CodegenError> {
        let Some(values) = self.operands(fields)? else {
            return Ok(self.warn_illegal(id, "tuple field of undetermined kind"));
        };
        let kind = ValueKind::of(ty);
        if !matches!(kind, ValueKind::Struct(_)) {
            return match values.first() {
                Some(v) => Ok(self.declare(id, Prefix::Result, kind, v)),
                None => Ok(self.warn_illegal(id, "allocation of an empty tuple")),
            };
        }
        let Some(ty_name) = self.type_name(&kind) else {
            return Ok(self.warn_illegal(id, "tuple without struct type"));
        };
        let name = self.fresh(Prefix::Result);
        self.buf.emit_code(&format!("{} {};", ty_name, name));
        for (i, v) in values.iter().enumerate() {
            self.buf.emit_code(&format!("{}._{} = {};", name, i + 1, v));
        }
        self.symbols.add(name.clone(), id, kind);
        Ok(name)
    }

    fn lower_invoke(
        &mut self,
        id: NodeId,
        target: &CallTarget,
        operands: &[NodeId],
        ret: ValueKind,
    ) -> Result<String, CodegenError> {
        match target {
            CallTarget::TupleField { arity, component } => {
                let Some(position) = accessor_position(*arity, *component) else {
                    return Ok(self.warn_illegal(id, "tuple accessor out of range"));
                };
                let Some(&object) = operands.first() else {
                    return Err(self.graph.misplaced(id));
                };
                let obj = self.value(object)?;
                if obj == ILLEGAL {
                    return Ok(self.warn_illegal(id, "field of a tuple of undetermined kind"));
                }
                // Fields of a structure-of-arrays element are read straight
                // from global memory.
                if let Some(idx) = self.soa_elements.get(&object).cloned() {
                    let field = self.extra.input_for_field(position - 1).cloned();
                    if let (Some(field), Some((_, base))) = (field, self.soa_input.clone()) {
                        let expr = format!("{}[{} + {}]", field.name, base, idx);
                        return Ok(self.declare(id, Prefix::Field, ret, &expr));
                    }
                }
                match self.symbols.kind_of(object).cloned() {
                    Some(ValueKind::Struct(_)) => {
                        let expr = format!("{}._{}", obj, position);
                        Ok(self.declare(id, Prefix::Field, ret, &expr))
                    }
                    Some(ValueKind::Scalar(_)) if position == 1 => {
                        self.symbols.alias(id, object);
                        Ok(obj)
                    }
                    _ => Ok(self.warn_illegal(id, "field access on a non-tuple value")),
                }
            }
            CallTarget::Lambda(name) => {
                let function = self.function_for(name, id)?;
                let Some(args) = self.operands(operands)? else {
                    return Ok(self.warn_illegal(id, "lambda argument of undetermined kind"));
                };
                let mut call_args = Vec::new();
                if self.is_kernel() {
                    call_args.extend(self.scope_args.iter().cloned());
                }
                call_args.extend(args);
                if self.options.deopt_guards {
                    call_args.push(DEOPT_ARG.to_string());
                }
                let expr = format!("{}({})", function, call_args.join(", "));
                Ok(self.declare(id, Prefix::FnResult, ret, &expr))
            }
            CallTarget::Builtin(name) => {
                let Some(args) = self.operands(operands)? else {
                    return Ok(self.warn_illegal(id, "call argument of undetermined kind"));
                };
                let expr = format!("{}({})", name, args.join(", "));
                Ok(self.declare(id, Prefix::Result, ret, &expr))
            }
        }
    }

    /// Fused `map` over `array`: the inner lambda becomes a local function
    /// called once per element into a fixed-size local buffer.
    fn lower_map_chain(
        &mut self,
        id: NodeId,
        lambda: &str,
        array: NodeId,
        capacity: usize,
        element: &TypeDescriptor,
    ) -> Result<String, CodegenError> {
        let inner = self
            .lambdas
            .iter()
            .find(|g| g.name == lambda)
            .ok_or_else(|| CodegenError::MissingLambda(lambda.to_string()))?;
        if inner.parameters().len() != 1 {
            return Err(self.graph.misplaced(id));
        }
        let function = self.function_for(lambda, id)?;
        let arr = self.value(array)?;
        let Some(elem_ty) = self.element_type_name(element) else {
            return Ok(self.warn_illegal(id, "fused map without element type"));
        };
        if arr == ILLEGAL {
            return Ok(self.warn_illegal(id, "fused map over an array of undetermined kind"));
        }

        let acc = self.fresh(Prefix::Result);
        let len = format!("{}_len", acc);
        let source_len = match self.local_arrays.get(&arr) {
            Some(l) => l.clone(),
            None => format!("{}_index_data[0]", arr),
        };
        let i = self.fresh(Prefix::Loop);
        let deopt = if self.options.deopt_guards {
            format!(", {}", DEOPT_ARG)
        } else {
            String::new()
        };
        let elem = self.element_ref(&arr, &i);

        self.buf
            .emit_code(&format!("{} {}[{}];", elem_ty, acc, capacity));
        self.buf
            .emit_code(&format!("int {} = min({}, {});", len, source_len, capacity));
        self.buf
            .emit_no_newline(&format!("for (int {i} = 0; {i} < {len}; {i}++)", i = i, len = len));
        self.buf.emit_code("{");
        self.buf.begin_block();
        self.buf
            .emit_code(&format!("{}[{}] = {}({}{});", acc, i, function, elem, deopt));
        self.buf.end_block();
        self.buf.emit_code("}");

        self.local_arrays.insert(acc.clone(), len);
        self.symbols
            .add(acc.clone(), id, ValueKind::Array(element.clone()));
        Ok(acc)
    }

    /// Generate lambda `name` in isolation (once) and return its function name.
    fn function_for(&mut self, name: &str, at: NodeId) -> Result<String, CodegenError> {
        let fname = function_name(name);
        if self.functions.iter().any(|f| f.name == fname) {
            return Ok(fname);
        }
        if self.stack.iter().any(|s| s == name) {
            return Err(CodegenError::UnsupportedNode {
                node: at,
                kind: "Invoke",
            });
        }
        let graph = self
            .lambdas
            .iter()
            .copied()
            .find(|g| g.name == name)
            .ok_or_else(|| CodegenError::MissingLambda(name.to_string()))?;
        let mut stack = self.stack.clone();
        stack.push(name.to_string());

        let unit = lower_function(graph, self.lambdas, self.options, stack)?;
        self.structs.merge(&unit.structs);
        self.diagnostics.extend(unit.diagnostics);
        for f in unit.functions {
            if !self.functions.iter().any(|g| g.name == f.name) {
                self.functions.push(f);
            }
        }
        Ok(fname)
    }
}

// ── Expression helpers ──────────────────────────────────────────────────────

fn binary_expr(op: BinaryOp, result: ScalarKind, lhs: Option<ScalarKind>, x: &str, y: &str) -> String {
    match op {
        BinaryOp::Rem if result.is_floating() => format!("fmod({}, {})", x, y),
        BinaryOp::UShr => {
            let unsigned = match lhs {
                Some(ScalarKind::Long) => "ulong",
                _ => "uint",
            };
            format!("({}) (({}) {} >> {})", result.ocl_name(), unsigned, x, y)
        }
        _ => format!("{} {} {}", x, op.symbol(), y),
    }
}

/// Index expression into the progression for divide/modulo decoding;
/// `None` for linear decoding.
fn decode_index(seq: &FieldSequence, idx: &str) -> Option<String> {
    let aux = seq.aux.as_i64();
    if aux <= 0 {
        return None;
    }
    let pow2 = aux & (aux - 1) == 0;
    let offset = format!("( {} {} )", idx, OFFSET_DEVICE);
    match seq.decode {
        SequenceDecode::Linear => None,
        SequenceDecode::Divide if pow2 => Some(format!("{} >> {}", offset, aux.trailing_zeros())),
        SequenceDecode::Divide => Some(format!("{} / {}", offset, aux)),
        SequenceDecode::Modulo if pow2 => Some(format!("{} & {}", offset, aux - 1)),
        SequenceDecode::Modulo => Some(format!("{} % {}", offset, aux)),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CompareOp, GraphBuilder};

    fn opts() -> GeneratorOptions {
        GeneratorOptions::default()
    }

    /// `x -> x * 2.0` over ints.
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

    /// `x -> x > 0 ? x : 0` written with an if whose else branch is empty.
    fn clamp_lambda() -> Graph {
        let mut b = GraphBuilder::new("clamp");
        let start = b.reserve();
        let iff = b.reserve();
        let t = b.reserve();
        let f = b.reserve();
        let t_end = b.reserve();
        let f_end = b.reserve();
        let merge = b.reserve();
        let x = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
        let zero = b.constant(Value::Int(0));
        let cond = b.compare(CompareOp::Gt, x, zero);
        let doubled = b.binary(BinaryOp::Add, x, x);
        let phi = b.add(NodeKind::Phi { merge, values: vec![doubled, x] });
        let ret = b.add(NodeKind::Return { value: Some(phi) });
        b.set(start, NodeKind::Start { next: iff });
        b.set(iff, NodeKind::If { condition: cond, on_true: t, on_false: f });
        b.set(t, NodeKind::Begin { next: t_end });
        b.set(f, NodeKind::Begin { next: f_end });
        b.set(t_end, NodeKind::End { merge });
        b.set(f_end, NodeKind::End { merge });
        b.set(merge, NodeKind::Merge { next: ret });
        b.finish().unwrap()
    }

    fn function_text(unit: &Unit) -> &str {
        unit.functions.last().map(|f| f.text.as_str()).unwrap_or("")
    }

    #[test]
    fn accessor_table_is_one_based() {
        assert_eq!(accessor_position(2, 0), Some(1));
        assert_eq!(accessor_position(11, 10), Some(11));
        assert_eq!(accessor_position(3, 3), None);
        assert_eq!(accessor_position(12, 0), None);
        assert_eq!(accessor_position(0, 0), None);
    }

    #[test]
    fn literals() {
        assert_eq!(literal(&Value::Float(2.0)).unwrap(), "2.0f");
        assert_eq!(literal(&Value::Double(0.5)).unwrap(), "0.5");
        assert_eq!(literal(&Value::Long(7)).unwrap(), "7L");
        assert_eq!(literal(&Value::Double(f64::NAN)).unwrap(), "NAN");
        assert_eq!(literal(&Value::Float(f32::NEG_INFINITY)).unwrap(), "(-INFINITY)");
        assert!(literal(&Value::Tuple(vec![])).is_none());
    }

    #[test]
    fn function_names_are_identifiers() {
        assert_eq!(function_name("mul"), "lambda_mul");
        assert_eq!(function_name("Main$lambda$0"), "lambda_Main_lambda_0");
    }

    #[test]
    fn scalar_lambda_function() {
        let unit = lower_lambda(&double_lambda(), &[], &opts()).unwrap();
        let text = function_text(&unit);
        assert_eq!(
            text,
            "double lambda_double(int p0, __global int *deoptFlag)\n\
             {\n    \
                 double result_0 = p0 * 2.0;\n    \
                 return result_0;\n\
             }\n"
        );
    }

    #[test]
    fn guards_off_drops_deopt_parameter() {
        let options = GeneratorOptions {
            deopt_guards: false,
            ..opts()
        };
        let unit = lower_lambda(&double_lambda(), &[], &options).unwrap();
        assert!(function_text(&unit).starts_with("double lambda_double(int p0)\n"));
    }

    #[test]
    fn merge_phis_are_assigned_per_branch() {
        let unit = lower_lambda(&clamp_lambda(), &[], &opts()).unwrap();
        let text = function_text(&unit);
        // The false branch only assigns the phi, so it is kept.
        assert!(text.contains("} else {"), "{}", text);
        assert!(text.contains("int phi_0;"), "{}", text);
        assert!(text.contains("return phi_0;"), "{}", text);
    }

    #[test]
    fn else_without_instructions_disappears() {
        // if (x > 0) { guard } else { } return x
        let mut b = GraphBuilder::new("guarded");
        let start = b.reserve();
        let iff = b.reserve();
        let t = b.reserve();
        let f = b.reserve();
        let guard = b.reserve();
        let t_end = b.reserve();
        let f_end = b.reserve();
        let merge = b.reserve();
        let x = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
        let zero = b.constant(Value::Int(0));
        let cond = b.compare(CompareOp::Gt, x, zero);
        let small = b.compare(CompareOp::Lt, x, zero);
        let ret = b.add(NodeKind::Return { value: Some(x) });
        b.set(start, NodeKind::Start { next: iff });
        b.set(iff, NodeKind::If { condition: cond, on_true: t, on_false: f });
        b.set(t, NodeKind::Begin { next: guard });
        b.set(guard, NodeKind::FixedGuard { condition: small, negated: true, next: t_end });
        b.set(f, NodeKind::Begin { next: f_end });
        b.set(t_end, NodeKind::End { merge });
        b.set(f_end, NodeKind::End { merge });
        b.set(merge, NodeKind::Merge { next: ret });
        let g = b.finish().unwrap();

        let unit = lower_lambda(&g, &[], &opts()).unwrap();
        let text = function_text(&unit);
        assert!(!text.contains("else"), "{}", text);
        assert!(
            text.contains("if (cond_1) { deoptFlag[0] = get_global_id(0); }"),
            "{}",
            text
        );
        assert!(text.contains("return p0;"), "{}", text);
    }

    #[test]
    fn unsupported_node_takes_generic_path() {
        let mut b = GraphBuilder::new("odd");
        let start = b.reserve();
        let x = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
        let weird = b.add(NodeKind::Unsupported {
            name: "MonitorEnter".into(),
            inputs: vec![x],
            next: None,
        });
        let ret = b.add(NodeKind::Return { value: Some(x) });
        b.set(start, NodeKind::Start { next: ret });
        let mut g = b.finish().unwrap();
        // Route control through the unsupported node.
        g.nodes[weird.index()].kind = NodeKind::Unsupported {
            name: "MonitorEnter".into(),
            inputs: vec![x],
            next: Some(ret),
        };
        g.nodes[start.index()].kind = NodeKind::Start { next: weird };

        let unit = lower_lambda(&g, &[], &opts()).unwrap();
        let text = function_text(&unit);
        assert!(text.contains("// #ERROR: MonitorEnter (n2)"), "{}", text);
        assert!(text.contains("return p0;"), "{}", text);
        assert_eq!(unit.diagnostics.len(), 1);
        assert_eq!(unit.diagnostics[0].code, Some(codes::GENERIC_HANDLER));
    }

    #[test]
    fn illegal_value_is_suppressed() {
        // A tuple constant has no literal; the store of it disappears while
        // the rest of the function is still generated.
        let mut b = GraphBuilder::new("partial");
        let start = b.reserve();
        let store = b.reserve();
        let arr = b.parameter(0, ParamType::Array(TypeDescriptor::scalar(ScalarKind::Int)));
        let x = b.parameter(1, ParamType::Scalar(ScalarKind::Int));
        let zero = b.constant(Value::Int(0));
        let bad = b.constant(Value::Tuple(vec![Value::Int(1)]));
        let ret = b.add(NodeKind::Return { value: Some(x) });
        b.set(start, NodeKind::Start { next: store });
        b.set(store, NodeKind::StoreIndexed { array: arr, index: zero, value: bad, next: ret });
        let g = b.finish().unwrap();

        let unit = lower_lambda(&g, &[], &opts()).unwrap();
        let text = function_text(&unit);
        assert!(!text.contains("ILLEGAL"), "{}", text);
        assert!(text.contains("return p1;"), "{}", text);
        assert_eq!(unit.diagnostics[0].code, Some(codes::ILLEGAL_VALUE));
    }

    #[test]
    fn decode_index_forms() {
        let seq = |aux: i32, decode| FieldSequence {
            start: Value::Int(0),
            stride: Value::Int(1),
            aux: Value::Int(aux),
            decode,
        };
        assert_eq!(
            decode_index(&seq(8, SequenceDecode::Divide), "i").unwrap(),
            "( i <offsetDevice> ) >> 3"
        );
        assert_eq!(
            decode_index(&seq(6, SequenceDecode::Divide), "i").unwrap(),
            "( i <offsetDevice> ) / 6"
        );
        assert_eq!(
            decode_index(&seq(8, SequenceDecode::Modulo), "i").unwrap(),
            "( i <offsetDevice> ) & 7"
        );
        assert_eq!(
            decode_index(&seq(6, SequenceDecode::Modulo), "i").unwrap(),
            "( i <offsetDevice> ) % 6"
        );
        assert!(decode_index(&seq(6, SequenceDecode::Linear), "i").is_none());
    }

    #[test]
    fn unsigned_shift_casts_through_unsigned() {
        assert_eq!(
            binary_expr(BinaryOp::UShr, ScalarKind::Int, Some(ScalarKind::Int), "a", "b"),
            "(int) ((uint) a >> b)"
        );
        assert_eq!(
            binary_expr(BinaryOp::Rem, ScalarKind::Float, Some(ScalarKind::Float), "a", "b"),
            "fmod(a, b)"
        );
    }

    #[test]
    fn recursive_lambda_is_rejected() {
        let mut b = GraphBuilder::new("loop");
        let start = b.reserve();
        let x = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
        let call = b.add(NodeKind::Invoke {
            target: CallTarget::Lambda("loop".into()),
            args: vec![x],
            ret: TypeDescriptor::scalar(ScalarKind::Int),
        });
        let ret = b.add(NodeKind::Return { value: Some(call) });
        b.set(start, NodeKind::Start { next: ret });
        let g = b.finish().unwrap();
        let err = lower_lambda(&g, &[], &opts()).unwrap_err();
        assert!(matches!(err, CodegenError::UnsupportedNode { kind: "Invoke", .. }));
    }

    #[test]
    fn missing_nested_lambda() {
        let mut b = GraphBuilder::new("outer");
        let start = b.reserve();
        let x = b.parameter(0, ParamType::Scalar(ScalarKind::Int));
        let call = b.add(NodeKind::Invoke {
            target: CallTarget::Lambda("inner".into()),
            args: vec![x],
            ret: TypeDescriptor::scalar(ScalarKind::Int),
        });
        let ret = b.add(NodeKind::Return { value: Some(call) });
        b.set(start, NodeKind::Start { next: ret });
        let g = b.finish().unwrap();
        let err = lower_lambda(&g, &[], &opts()).unwrap_err();
        assert_eq!(err, CodegenError::MissingLambda("inner".into()));
    }
}
