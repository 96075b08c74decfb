// symbols.rs — Scoped symbol table for kernel generation
//
// Binds IR value nodes to generated identifiers. Scopes form a stack that
// mirrors the control regions being lowered; a name is visible in its
// defining scope and every scope nested inside it.
//
// Preconditions: `enter_scope`/`exit_scope` calls are paired.
// Postconditions: the root scope is never popped.
// Failure modes: none; lookups of unbound nodes return `None`.
// Side effects: none.

use std::collections::HashMap;
use std::fmt;

use crate::id::NodeId;
use crate::types::{ScalarKind, TypeDescriptor};

/// Identifier emitted for values whose kind could not be determined.
pub const ILLEGAL: &str = "ILLEGAL";

// ── Value kinds ─────────────────────────────────────────────────────────────

/// What a generated identifier holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    Scalar(ScalarKind),
    /// A tuple held by value in a struct.
    Struct(TypeDescriptor),
    /// A global-memory array of the given element type.
    Array(TypeDescriptor),
    Void,
    /// Kind could not be determined; emission for the value is suppressed.
    Illegal,
}

impl ValueKind {
    pub fn of(ty: &TypeDescriptor) -> ValueKind {
        match ty {
            TypeDescriptor::Scalar(k) => ValueKind::Scalar(*k),
            composite if composite.needs_struct() => ValueKind::Struct(composite.clone()),
            composite => match composite.fields().first() {
                Some(inner) => ValueKind::of(inner),
                None => ValueKind::Illegal,
            },
        }
    }

    /// OpenCL C spelling, if the kind has one.
    pub fn ocl_type(&self) -> Option<String> {
        match self {
            ValueKind::Scalar(k) => Some(k.ocl_name().to_string()),
            ValueKind::Struct(ty) => Some(ty.struct_name()),
            ValueKind::Array(ty) => Some(ty.struct_name()),
            ValueKind::Void => Some("void".to_string()),
            ValueKind::Illegal => None,
        }
    }

    pub fn scalar(&self) -> Option<ScalarKind> {
        match self {
            ValueKind::Scalar(k) => Some(*k),
            _ => None,
        }
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self, ValueKind::Illegal)
    }
}

// ── Name prefixes ───────────────────────────────────────────────────────────

/// Prefix of a fresh identifier; the table appends `_<counter>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Loop,
    Cond,
    Cast,
    Phi,
    Result,
    FnResult,
    ArrayElement,
    Param,
    Field,
    Thread,
}

impl Prefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Prefix::Loop => "loop",
            Prefix::Cond => "cond",
            Prefix::Cast => "cast",
            Prefix::Phi => "phi",
            Prefix::Result => "result",
            Prefix::FnResult => "fnresult",
            Prefix::ArrayElement => "array_elem_val",
            Prefix::Param => "param",
            Prefix::Field => "field",
            Prefix::Thread => "thread",
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Symbol table ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Scope {
    node_to_name: HashMap<NodeId, String>,
    name_to_node: HashMap<String, NodeId>,
    name_to_kind: HashMap<String, ValueKind>,
}

#[derive(Debug)]
pub struct SymbolTable {
    scopes: Vec<Scope>,
    counter: usize,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            scopes: vec![Scope::default()],
            counter: 0,
        }
    }

    /// Bind `name` to `node` in the innermost scope. Rebinding an existing
    /// name to another node (passthrough nodes) is allowed.
    pub fn add(&mut self, name: impl Into<String>, node: NodeId, kind: ValueKind) {
        let name = name.into();
        let scope = self.innermost();
        scope.node_to_name.insert(node, name.clone());
        scope.name_to_node.insert(name.clone(), node);
        scope.name_to_kind.insert(name, kind);
    }

    /// Make `node` resolve to the identifier already bound to `source`.
    pub fn alias(&mut self, node: NodeId, source: NodeId) -> bool {
        let Some(name) = self.lookup_name(source).map(str::to_string) else {
            return false;
        };
        let kind = self.lookup_kind(&name).cloned().unwrap_or(ValueKind::Illegal);
        self.add(name, node, kind);
        true
    }

    pub fn enter_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn exit_scope(&mut self) {
        debug_assert!(self.scopes.len() > 1, "exit_scope on root scope");
        if self.scopes.len() > 1 {
            self.scopes.pop();
        }
    }

    /// Number of open scopes, the root included.
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn exists(&self, node: NodeId) -> bool {
        self.lookup_name(node).is_some()
    }

    pub fn lookup_name(&self, node: NodeId) -> Option<&str> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.node_to_name.get(&node))
            .map(String::as_str)
    }

    pub fn lookup_node(&self, name: &str) -> Option<NodeId> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.name_to_node.get(name))
            .copied()
    }

    pub fn lookup_kind(&self, name: &str) -> Option<&ValueKind> {
        self.scopes
            .iter()
            .rev()
            .find_map(|s| s.name_to_kind.get(name))
    }

    /// Kind of the value bound to `node`.
    pub fn kind_of(&self, node: NodeId) -> Option<&ValueKind> {
        self.lookup_name(node).and_then(|n| self.lookup_kind(n))
    }

    /// Fresh identifier `<prefix>_<n>`; the counter never repeats within a table.
    pub fn new_variable(&mut self, prefix: Prefix) -> String {
        let name = format!("{}_{}", prefix, self.counter);
        self.counter += 1;
        name
    }

    fn innermost(&mut self) -> &mut Scope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INT: ValueKind = ValueKind::Scalar(ScalarKind::Int);

    #[test]
    fn fresh_names_are_unique() {
        let mut t = SymbolTable::new();
        assert_eq!(t.new_variable(Prefix::Loop), "loop_0");
        assert_eq!(t.new_variable(Prefix::Cond), "cond_1");
        assert_eq!(t.new_variable(Prefix::FnResult), "fnresult_2");
        assert_eq!(t.new_variable(Prefix::ArrayElement), "array_elem_val_3");
    }

    #[test]
    fn inner_bindings_vanish_on_exit() {
        let mut t = SymbolTable::new();
        t.add("p0", NodeId(0), INT);
        t.enter_scope();
        t.add("result_1", NodeId(1), INT);
        assert_eq!(t.lookup_name(NodeId(0)), Some("p0"));
        assert_eq!(t.lookup_name(NodeId(1)), Some("result_1"));
        t.exit_scope();
        assert!(t.exists(NodeId(0)));
        assert!(!t.exists(NodeId(1)));
        assert_eq!(t.lookup_kind("result_1"), None);
    }

    #[test]
    fn innermost_binding_shadows() {
        let mut t = SymbolTable::new();
        t.add("a", NodeId(0), INT);
        t.enter_scope();
        t.add("b", NodeId(0), ValueKind::Scalar(ScalarKind::Float));
        assert_eq!(t.lookup_name(NodeId(0)), Some("b"));
        assert_eq!(
            t.kind_of(NodeId(0)),
            Some(&ValueKind::Scalar(ScalarKind::Float))
        );
        t.exit_scope();
        assert_eq!(t.lookup_name(NodeId(0)), Some("a"));
    }

    #[test]
    fn alias_reuses_name_and_kind() {
        let mut t = SymbolTable::new();
        t.add("x", NodeId(3), INT);
        assert!(t.alias(NodeId(4), NodeId(3)));
        assert_eq!(t.lookup_name(NodeId(4)), Some("x"));
        assert_eq!(t.kind_of(NodeId(4)), Some(&INT));
        assert!(!t.alias(NodeId(5), NodeId(9)));
    }

    #[test]
    fn root_scope_is_never_popped() {
        let mut t = SymbolTable::new();
        t.enter_scope();
        t.exit_scope();
        assert_eq!(t.depth(), 1);
    }

    #[test]
    fn value_kind_of_single_field_tuple_collapses() {
        let t = TypeDescriptor::uniform(ScalarKind::Long, 1).unwrap();
        assert_eq!(ValueKind::of(&t), ValueKind::Scalar(ScalarKind::Long));
        let pair = TypeDescriptor::uniform(ScalarKind::Long, 2).unwrap();
        assert_eq!(ValueKind::of(&pair).ocl_type().unwrap(), "Tuple_long_long");
        assert_eq!(ValueKind::Illegal.ocl_type(), None);
    }
}
