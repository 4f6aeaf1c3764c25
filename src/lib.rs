//! Translator from a stack-based Lisp bytecode to native machine code via
//! libgccjit.
//!
//! The crate consumes one compiled-function object at a time and produces a
//! callable native entry point, to be registered with a host runtime as a
//! primitive subroutine. The hard part is the bytecode-to-IR translator:
//! basic-block discovery over a flat jump-indexed byte stream, a typed
//! operand stack maintained across block joins, and the small set of
//! always-inlined helpers the host's tagged-value ABI requires.
//!
//! Entry point: [`driver::compile_function`].

mod abi;
mod backend;
mod blocks;
mod bytefunction;
mod code_translator;
pub mod driver;
pub mod environ;
mod error;
mod inline_prims;
mod meta_stack;
mod opcodes;
mod value;

pub use bytefunction::{ArgTemplate, CompiledFunctionObject, Constant};
pub use driver::{CompileOptions, CompiledNative, HostLayout, OptimizationLevel};
pub use error::{CompileError, CompileResult};
