// registry.rs — Struct and extra-array registries
//
// Both registries are request-scoped: one instance per kernel generation,
// owned by the request context and passed explicitly to the generator.
//
// StructRegistry deduplicates tuple struct declarations by signature and
// renders them in registration order. ExtraArrayRegistry records the extra
// global-memory pointer parameters that stand in for tuple fields under
// structure-of-arrays expansion.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::types::TypeDescriptor;

// ── Struct registry ─────────────────────────────────────────────────────────

/// One synthesized tuple struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDecl {
    pub name: String,
    /// OpenCL type of each field, in `_1.._N` order.
    pub field_types: Vec<String>,
    pub ty: TypeDescriptor,
}

impl StructDecl {
    /// Type of field `_position` (1-based).
    pub fn field_type(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|i| self.field_types.get(i))
            .map(String::as_str)
    }

    /// Name of the inline accessor for field `_position`.
    pub fn accessor(&self, position: usize) -> String {
        format!("_{}{}", self.name, position)
    }

    /// Include-once guarded typedef plus one accessor per field.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "#ifndef {name}_DEFINED\n#define {name}_DEFINED\ntypedef struct {{ ",
            name = self.name
        );
        for (i, ty) in self.field_types.iter().enumerate() {
            let _ = write!(out, "\n\t{} _{}; ", ty, i + 1);
        }
        let _ = writeln!(out, "\n}} {};", self.name);
        for (i, ty) in self.field_types.iter().enumerate() {
            let _ = writeln!(
                out,
                "inline {ty} {acc}({name} p) {{ return p._{pos}; }} ",
                ty = ty,
                acc = self.accessor(i + 1),
                name = self.name,
                pos = i + 1
            );
        }
        out.push_str("#endif\n");
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct StructRegistry {
    decls: Vec<StructDecl>,
    by_name: HashMap<String, usize>,
}

impl StructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `ty` (and any nested composite fields first). Returns the
    /// OpenCL type name; scalars and one-field records need no declaration.
    pub fn register(&mut self, ty: &TypeDescriptor) -> String {
        let name = ty.struct_name();
        if !ty.needs_struct() || self.by_name.contains_key(&name) {
            return name;
        }
        let field_types = ty.fields().iter().map(|f| self.register(f)).collect();
        self.by_name.insert(name.clone(), self.decls.len());
        self.decls.push(StructDecl {
            name: name.clone(),
            field_types,
            ty: ty.clone(),
        });
        name
    }

    pub fn get(&self, name: &str) -> Option<&StructDecl> {
        self.by_name.get(name).map(|&i| &self.decls[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.decls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decls.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StructDecl> {
        self.decls.iter()
    }

    /// Fold in the requirements of a separately generated sub-unit.
    pub fn merge(&mut self, other: &StructRegistry) {
        for decl in &other.decls {
            self.register(&decl.ty);
        }
    }

    /// All declarations, in registration order.
    pub fn render_all(&self) -> String {
        self.decls.iter().map(StructDecl::render).collect()
    }
}

// ── Extra-array registry ────────────────────────────────────────────────────

/// A pointer parameter standing in for one tuple field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraArray {
    pub name: String,
    /// 0-based field index inside the tuple.
    pub field: usize,
    /// OpenCL element type.
    pub ty: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExtraArrayRegistry {
    inputs: Vec<ExtraArray>,
    outputs: Vec<ExtraArray>,
    input_index: HashMap<usize, usize>,
    output_index: HashMap<usize, usize>,
}

impl ExtraArrayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: impl Into<String>, field: usize, ty: impl Into<String>) {
        self.input_index.insert(field, self.inputs.len());
        self.inputs.push(ExtraArray {
            name: name.into(),
            field,
            ty: ty.into(),
        });
    }

    pub fn add_output(&mut self, name: impl Into<String>, field: usize, ty: impl Into<String>) {
        self.output_index.insert(field, self.outputs.len());
        self.outputs.push(ExtraArray {
            name: name.into(),
            field,
            ty: ty.into(),
        });
    }

    pub fn inputs(&self) -> &[ExtraArray] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ExtraArray] {
        &self.outputs
    }

    pub fn input_for_field(&self, field: usize) -> Option<&ExtraArray> {
        self.input_index.get(&field).map(|&i| &self.inputs[i])
    }

    pub fn output_for_field(&self, field: usize) -> Option<&ExtraArray> {
        self.output_index.get(&field).map(|&i| &self.outputs[i])
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub fn clear(&mut self) {
        self.inputs.clear();
        self.outputs.clear();
        self.input_index.clear();
        self.output_index.clear();
    }
}
