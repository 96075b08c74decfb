// marawacc — OpenCL JIT backend
//
// Library root: portable arrays, the closed kernel IR and the generator that
// lowers map/reduce lambdas to OpenCL C.

pub mod code_buffer;
pub mod codegen;
pub mod diag;
pub mod error;
pub mod id;
pub mod interp;
pub mod ir;
pub mod lexer;
pub mod options;
pub mod parray;
pub mod parser;
pub mod registry;
pub mod request;
pub mod samples;
pub mod skeleton;
pub mod storage;
pub mod symbols;
pub mod types;
