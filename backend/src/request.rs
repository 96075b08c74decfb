// request.rs — Kernel requests, request-scoped state and the offload facade
//
// A `KernelRequest` is everything the front end hands over for one kernel:
// lambda graph(s), type metadata, optionally an explicit skeleton and an
// input sequence layout. The `Offload` facade turns a request into one
// translation unit per device, consulting and updating a `KernelCache`.
//
// All registries live in a `RequestContext` created per request, so
// independent requests never observe each other's structs or extra arrays.
//
// Preconditions: the request's graphs follow the skeleton parameter
//                convention (0 = input array, 1 = output array).
// Postconditions: on success the cache holds one entry per device for the
//                 request id; on failure the cache is unchanged.
// Failure modes: `Error::Codegen` for generation failures,
//                `Error::Request` for malformed JSON.
// Side effects: `Offload::compile` mutates the cache.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::codegen::{self, GeneratedKernel, KernelInput, OFFSET_DEVICE};
use crate::diag::Diagnostic;
use crate::error::{CodegenError, Result};
use crate::ir::Graph;
use crate::options::GeneratorOptions;
use crate::parray::SequenceLayout;
use crate::registry::{ExtraArrayRegistry, StructRegistry};
use crate::skeleton::{self, Computation};
use crate::types::TypeDescriptor;

// ── Request ─────────────────────────────────────────────────────────────────

/// Element types and computation shape of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub input: TypeDescriptor,
    pub output: TypeDescriptor,
    pub computation: Computation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelRequest {
    /// Cache key. Derived from the request contents when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Driver graph. Built from `types` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skeleton: Option<Graph>,
    pub lambda: Graph,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<Graph>,
    pub types: TypeInfo,
    /// Sequence layout of the input array, when it is sequence-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<SequenceLayout>,
    /// Logical input length, used for multi-device offsets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size: Option<usize>,
}

impl KernelRequest {
    pub fn new(lambda: Graph, types: TypeInfo) -> Self {
        KernelRequest {
            id: None,
            skeleton: None,
            lambda,
            nested: Vec::new(),
            types,
            sequence: None,
            total_size: None,
        }
    }

    pub fn with_nested(mut self, nested: Vec<Graph>) -> Self {
        self.nested = nested;
        self
    }

    pub fn with_sequence(mut self, layout: SequenceLayout, total_size: usize) -> Self {
        self.sequence = Some(layout);
        self.total_size = Some(total_size);
        self
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The explicit id, or the SHA-256 of the compact JSON form of the
    /// request without one (64 hex characters).
    pub fn request_id(&self) -> Result<String> {
        if let Some(id) = &self.id {
            return Ok(id.clone());
        }
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        let hash = hasher.finalize();
        let mut s = String::with_capacity(64);
        for b in hash.iter() {
            let _ = write!(s, "{:02x}", b);
        }
        Ok(s)
    }

    /// The driver graph: the supplied one, or the template for the
    /// request's computation.
    pub fn skeleton_graph(&self) -> Result<Cow<'_, Graph>, CodegenError> {
        match &self.skeleton {
            Some(g) => Ok(Cow::Borrowed(g)),
            None => skeleton::build(
                self.types.computation,
                &self.lambda.name,
                &self.types.input,
                &self.types.output,
            )
            .map(Cow::Owned),
        }
    }
}

// ── Request context ─────────────────────────────────────────────────────────

/// Registries and findings of one generation request.
#[derive(Debug, Default)]
pub struct RequestContext {
    pub options: GeneratorOptions,
    pub structs: StructRegistry,
    pub extra_arrays: ExtraArrayRegistry,
    pub diagnostics: Vec<Diagnostic>,
}

impl RequestContext {
    pub fn new(options: GeneratorOptions) -> Self {
        RequestContext {
            options,
            ..Default::default()
        }
    }
}

/// Generate the translation unit for `request` into `ctx`.
pub fn generate(request: &KernelRequest, ctx: &mut RequestContext) -> Result<GeneratedKernel, CodegenError> {
    let skeleton = request.skeleton_graph()?;
    let input = KernelInput {
        skeleton: &skeleton,
        lambda: &request.lambda,
        nested: &request.nested,
        computation: request.types.computation,
        input: &request.types.input,
        output: &request.types.output,
        sequence: request.sequence.as_ref(),
    };
    codegen::generate(&input, ctx)
}

// ── Kernel cache ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKernel {
    pub device: usize,
    pub kernel_name: String,
    pub source: String,
}

/// Generated kernels keyed by `(request id, device index)`.
#[derive(Debug, Default)]
pub struct KernelCache {
    entries: HashMap<(String, usize), DeviceKernel>,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, id: &str, device: usize) -> Option<&DeviceKernel> {
        self.entries.get(&(id.to_string(), device))
    }

    /// All device kernels of `id`, or `None` unless every device is present.
    pub fn lookup_all(&self, id: &str, devices: usize) -> Option<Vec<DeviceKernel>> {
        (0..devices)
            .map(|d| self.lookup(id, d).cloned())
            .collect()
    }

    /// Store the kernels of one request. Callers commit only complete sets.
    pub fn commit(&mut self, id: &str, kernels: Vec<DeviceKernel>) {
        for k in kernels {
            self.entries.insert((id.to_string(), k.device), k);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ── Offload facade ──────────────────────────────────────────────────────────

/// Result of compiling one request for every device.
#[derive(Debug)]
pub struct Compiled {
    pub id: String,
    pub kernels: Vec<DeviceKernel>,
    /// Empty on a cache hit.
    pub diagnostics: Vec<Diagnostic>,
    /// Empty on a cache hit.
    pub extra_arrays: ExtraArrayRegistry,
    pub cached: bool,
}

#[derive(Debug, Default)]
pub struct Offload {
    options: GeneratorOptions,
    cache: KernelCache,
}

impl Offload {
    pub fn new(options: GeneratorOptions) -> Self {
        Offload {
            options,
            cache: KernelCache::new(),
        }
    }

    pub fn options(&self) -> &GeneratorOptions {
        &self.options
    }

    pub fn cache(&self) -> &KernelCache {
        &self.cache
    }

    pub fn compile(&mut self, request: &KernelRequest) -> Result<Compiled> {
        let id = request.request_id()?;
        let devices = self.options.devices.max(1);
        if let Some(kernels) = self.cache.lookup_all(&id, devices) {
            debug!(request = %id, "kernel cache hit");
            return Ok(Compiled {
                id,
                kernels,
                diagnostics: Vec::new(),
                extra_arrays: ExtraArrayRegistry::new(),
                cached: true,
            });
        }

        debug!(request = %id, lambda = %request.lambda.name, devices, "compiling request");
        let mut ctx = RequestContext::new(self.options.clone());
        let generated = generate(request, &mut ctx)?;
        if self.options.print_kernel {
            debug!(request = %id, source = %generated.source, "generated kernel");
        }

        let kernels: Vec<DeviceKernel> = (0..devices)
            .map(|device| DeviceKernel {
                device,
                kernel_name: generated.kernel_name.clone(),
                source: generated
                    .source
                    .replace(OFFSET_DEVICE, &device_offset(device, devices, request.total_size)),
            })
            .collect();
        self.cache.commit(&id, kernels.clone());
        info!(request = %id, kernel = %generated.kernel_name, devices, "kernel committed");

        Ok(Compiled {
            id,
            kernels,
            diagnostics: ctx.diagnostics,
            extra_arrays: ctx.extra_arrays,
            cached: false,
        })
    }
}

/// Text substituted for the index offset placeholder on `device`. The
/// sequence input is split in two halves for multi-device runs.
pub fn device_offset(device: usize, devices: usize, total_size: Option<usize>) -> String {
    if devices <= 1 || device == 0 {
        return String::new();
    }
    format!(" + {}", total_size.unwrap_or(0) / 2)
}
