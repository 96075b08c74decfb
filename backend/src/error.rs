// error.rs — Fatal error taxonomy
//
// Hard, non-retryable failures. Every variant aborts the call that raised
// it; callers fall back to the host evaluator. Soft degradations (illegal
// values, generic-handler output) are `diag::Diagnostic`s, not errors.

use thiserror::Error;

use crate::id::NodeId;
use crate::storage::StorageMode;
use crate::types::ScalarKind;

/// Errors raised while building or validating element types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    #[error("unsupported element type: {kind} has no backend in {mode} storage mode")]
    UnsupportedType { kind: ScalarKind, mode: StorageMode },

    #[error("unsupported tuple arity {0}; expected 1..=11")]
    UnsupportedArity(usize),

    #[error("malformed type grammar `{input}`: {reason}")]
    MalformedTypeGrammar { input: String, reason: String },
}

/// Errors raised by Portable Array operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParrayError {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("chunk size must be positive")]
    ZeroChunkSize,

    #[error("number of chunks must be positive")]
    ZeroChunkCount,

    #[error("slice [{start}, {start}+{len}) exceeds array size {size}")]
    SliceOutOfRange { start: usize, len: usize, size: usize },

    #[error("field {field} out of range for element arity {arity}")]
    FieldOutOfRange { field: usize, arity: usize },

    #[error("field {0} is itself composite and has no single device buffer")]
    NestedField(usize),

    #[error("{mode} storage has no device buffer")]
    NoDeviceBuffer { mode: StorageMode },

    #[error("buffer of kind {found} cannot replace storage of kind {expected}")]
    BufferMismatch { expected: String, found: String },

    #[error("value `{found}` does not match element type {expected}")]
    ValueMismatch { expected: String, found: String },

    #[error("sequence encoding needs an integral or floating field, found {0}")]
    SequenceKind(ScalarKind),

    #[error("sequence encoding needs per-field storage; boxed tuple arrays have none")]
    BoxedSequence,

    #[error("{what} {value} does not fit the 32-bit index metadata")]
    IndexOverflow { what: &'static str, value: usize },
}

/// Errors that abort kernel generation for one request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodegenError {
    #[error("node {node} ({kind}) cannot be lowered in this position")]
    UnsupportedNode { node: NodeId, kind: &'static str },

    #[error("node {0} is not part of the graph")]
    MissingNode(NodeId),

    #[error("graph `{0}` has no start node")]
    MissingStart(String),

    #[error("missing type metadata: {0}")]
    MissingType(String),

    #[error("nested lambda `{0}` is referenced but not supplied")]
    MissingLambda(String),

    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Top-level error for the facade and the CLI.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Type(#[from] TypeError),

    #[error(transparent)]
    Parray(#[from] ParrayError),

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error("host evaluation failed: {0}")]
    Eval(String),

    #[error("invalid kernel request: {0}")]
    Request(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
