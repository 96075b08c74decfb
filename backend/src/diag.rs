// diag.rs — Generation diagnostics
//
// Soft findings collected while lowering a graph. They never abort
// generation; fatal problems are `error::CodegenError`.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::id::NodeId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `W0100`).
///
/// Once assigned, a code must never be reassigned to a different meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// A value of undetermined kind was suppressed.
    pub const ILLEGAL_VALUE: DiagCode = DiagCode("W0100");
    /// A node took the generic `#ERROR` path.
    pub const GENERIC_HANDLER: DiagCode = DiagCode("W0101");
    /// A deoptimization point was lowered to a flag write.
    pub const DEOPT_POINT: DiagCode = DiagCode("W0102");
    /// Generation aborted; carried next to the returned error.
    pub const GENERATION_FAILED: DiagCode = DiagCode("E0100");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    /// Node the finding is about, when there is one.
    pub node: Option<NodeId>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, node: Option<NodeId>, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            node,
            message: message.into(),
            hint: None,
        }
    }

    pub fn warning(node: NodeId, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, Some(node), message)
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: ", level, code)?;
        } else {
            write!(f, "{}: ", level)?;
        }
        if let Some(node) = self.node {
            write!(f, "{}: ", node)?;
        }
        write!(f, "{}", self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, None, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code_and_node() {
        let d = Diagnostic::warning(NodeId(12), "value suppressed")
            .with_code(codes::ILLEGAL_VALUE);
        assert_eq!(format!("{d}"), "warning[W0100]: n12: value suppressed");
    }

    #[test]
    fn hint_on_second_line() {
        let d = Diagnostic::warning(NodeId(1), "no handler for Foo")
            .with_code(codes::GENERIC_HANDLER)
            .with_hint("run the host fallback");
        assert_eq!(d.hint.as_deref(), Some("run the host fallback"));
        assert!(format!("{d}").ends_with("\n  hint: run the host fallback"));
    }
}
