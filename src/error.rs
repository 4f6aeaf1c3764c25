//! Crate-wide error type.
//!
//! One variant per error kind this compiler can raise; every variant carries
//! the context needed to render a useful message rather than a bare string,
//! mirroring how the translator this crate is modeled on reports malformed
//! input.

use std::path::PathBuf;

use failure_derive::Fail;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Fail)]
pub enum CompileError {
    #[fail(
        display = "malformed bytecode at pc {}: {}",
        pc, reason
    )]
    BytecodeMalformed { pc: usize, reason: String },

    #[fail(display = "shape violation: {}", reason)]
    ShapeViolation { reason: String },

    #[fail(display = "codegen backend produced no result while compiling {}", function_name)]
    BackendFailure { function_name: String },

    #[fail(display = "unreachable cast requested: {}", detail)]
    UnsupportedCast { detail: String },

    #[fail(display = "could not write assembly dump to {:?}: {}", path, reason)]
    DisassembleIO { path: PathBuf, reason: String },
}

impl CompileError {
    pub fn malformed(pc: usize, reason: impl Into<String>) -> Self {
        CompileError::BytecodeMalformed {
            pc,
            reason: reason.into(),
        }
    }

    pub fn shape(reason: impl Into<String>) -> Self {
        CompileError::ShapeViolation {
            reason: reason.into(),
        }
    }
}
