//! The compilation driver (component 6, SPEC_FULL.md §4.4/§4.4a): the
//! per-function entry point that wires block discovery, the opcode emitter,
//! and the codegen backend together and registers the result with the host.
//!
//! Grounded on `cranelift-wasm/src/module_translator.rs`'s `translate_module`
//! for the shape of a thin driver function sitting above the opcode-level
//! translator, and on `emacs_native_compile`/`compile_f` in the original
//! source for the per-function sequencing this reproduces: verify argument
//! shape → decode argument template → allocate the meta-stack's backing
//! array → emit the prologue → block discovery → emit → backend compile →
//! register.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use gccjit::{Context, FunctionType, OutputKind, ToRValue};
use log::{info, warn};

use crate::abi::RuntimeAbi;
use crate::backend::Backend;
use crate::blocks::discover_blocks;
use crate::bytefunction::CompiledFunctionObject;
use crate::code_translator::FunctionTranslator;
use crate::environ::{HostEnviron, PrimitiveArity};
use crate::error::{CompileError, CompileResult};
use crate::inline_prims::InlinePrimitives;
use crate::meta_stack::MetaStack;

/// The host's C ABI rejects arities above this (mirrors `SUBR_MAX_ARGS`);
/// a compiled-function object asking for more is a shape violation caught
/// here rather than overflowing the fixed-arity parameter list below.
const MAX_NATIVE_ARGS: u8 = 8;

/// Host facts the backend's type/layout construction needs but that
/// [`HostEnviron`] has no business exposing (it is a behavioral contract,
/// not a data one): field offsets, the canonical nil/t words, and the pure
/// memory region bounds. Supplied once by the embedder, typically built
/// from constants the host runtime already exports.
#[derive(Debug, Clone, Copy)]
pub struct HostLayout {
    /// Size in bytes of the host's `sigjmp_buf`, architecture-specific.
    pub jmp_buf_bytes: usize,
    /// Bytes of padding before `m_handlerlist` in the host's thread-state
    /// struct.
    pub thread_state_leading_padding: usize,
    /// Base address of the host's pure (read-only) memory region, as an
    /// integer.
    pub pure_base: i64,
    /// Size in bytes of the pure memory region.
    pub pure_size: i64,
    /// The canonical false value (`Qnil`), as a raw tagged word.
    pub nil_value: i64,
    /// The canonical true value (`Qt`), as a raw tagged word.
    pub t_value: i64,
}

/// Per-call configuration (SPEC_FULL.md §2a "Configuration"): a minimal,
/// explicit surface in place of the original's hidden globals, covering
/// exactly what §6's "Persisted state" paragraph describes (the assembly
/// dump path) plus the backend's optimization level.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub dump_assembly_to: Option<PathBuf>,
    pub optimization_level: OptimizationLevel,
}

/// Mirrors `gccjit::OptimizationLevel`'s four levels without forcing every
/// caller of this crate to depend on `gccjit` directly just to pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationLevel {
    None,
    Limited,
    Standard,
    Aggressive,
}

impl Default for OptimizationLevel {
    fn default() -> Self {
        OptimizationLevel::Standard
    }
}

impl OptimizationLevel {
    fn to_backend(self) -> gccjit::OptimizationLevel {
        match self {
            OptimizationLevel::None => gccjit::OptimizationLevel::None,
            OptimizationLevel::Limited => gccjit::OptimizationLevel::Limited,
            OptimizationLevel::Standard => gccjit::OptimizationLevel::Standard,
            OptimizationLevel::Aggressive => gccjit::OptimizationLevel::Aggressive,
        }
    }
}

/// The result of a successful compilation: a native entry point already
/// registered with the host, plus the disassembly text when
/// `CompileOptions::dump_assembly_to` was set.
pub struct CompiledNative {
    pub name: String,
    pub arity: PrimitiveArity,
    /// Raw function pointer handed back by the codegen backend. Callers
    /// transmute it to the concrete `extern "C" fn(...)` signature implied
    /// by `arity` before invoking it; this crate has no business naming
    /// that signature since it varies with arity.
    pub native_code: *const (),
    pub assembly: Option<String>,
}

/// Only one compilation may be in flight at a time (§5 "Shared resources");
/// this asserts that invariant instead of silently corrupting a shared
/// codegen context. A per-call `Backend`/`Context` (rather than a process
/// singleton, per DESIGN NOTES §9's re-architecture note) makes concurrent
/// compilations merely wasteful rather than unsound, but the original's
/// single-threaded contract is preserved anyway since nothing downstream
/// has been audited against concurrent use.
static COMPILING: AtomicBool = AtomicBool::new(false);

struct ReentrancyGuard;

impl ReentrancyGuard {
    fn acquire() -> CompileResult<Self> {
        if COMPILING.swap(true, Ordering::SeqCst) {
            return Err(CompileError::shape(
                "a compile_function call is already in progress; concurrent compilation is not supported",
            ));
        }
        Ok(ReentrancyGuard)
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        COMPILING.store(false, Ordering::SeqCst);
    }
}

/// RAII pairing of the host's async-timer block/unblock hooks (§4.4a): the
/// idiomatic Rust rendition of the original's manual `block_atimers`/
/// `unblock_atimers` calls around the (non-reentrant-with-signals) backend
/// compile step. Unblocking happens in `Drop`, so it runs on every exit
/// path the block it wraps can take, including an early `?`.
struct TimerBlockGuard<'a> {
    environ: &'a mut dyn HostEnviron,
}

impl<'a> TimerBlockGuard<'a> {
    fn new(environ: &'a mut dyn HostEnviron) -> Self {
        environ.block_async_timers();
        TimerBlockGuard { environ }
    }
}

impl<'a> Drop for TimerBlockGuard<'a> {
    fn drop(&mut self) {
        self.environ.unblock_async_timers();
    }
}

/// Compiles one compiled-function object to native code and registers it
/// with the host. See SPEC_FULL.md §4.4 for the step sequence.
pub fn compile_function(
    obj: &CompiledFunctionObject,
    layout: &HostLayout,
    environ: &mut dyn HostEnviron,
    options: &CompileOptions,
) -> CompileResult<CompiledNative> {
    let _reentrancy = ReentrancyGuard::acquire()?;
    match compile_function_inner(obj, layout, environ, options) {
        Ok(native) => {
            info!("compiled `{}` to native code", obj.name);
            Ok(native)
        }
        Err(err) => {
            warn!("aborting compilation of `{}`: {}", obj.name, err);
            Err(err)
        }
    }
}

fn compile_function_inner(
    obj: &CompiledFunctionObject,
    layout: &HostLayout,
    environ: &mut dyn HostEnviron,
    options: &CompileOptions,
) -> CompileResult<CompiledNative> {
    let arity = obj.arg_template.total_fixed();
    if arity > MAX_NATIVE_ARGS {
        return Err(CompileError::shape(format!(
            "argument count {} exceeds the maximum supported native arity {}",
            arity, MAX_NATIVE_ARGS
        )));
    }
    if obj.max_depth == 0 {
        return Err(CompileError::shape(
            "declared max-stack-depth is zero; every compiled function needs at least one slot",
        ));
    }

    let ctx = Context::default();
    ctx.set_optimization_level(options.optimization_level.to_backend());

    let value_ty = ctx.new_type::<i64>();
    let pointer_ty = value_ty.make_pointer();
    let abi = RuntimeAbi::build(
        &ctx,
        value_ty,
        pointer_ty,
        layout.jmp_buf_bytes,
        layout.thread_state_leading_padding,
    );
    let mut backend = Backend::new(ctx, value_ty, pointer_ty);

    let nil = backend.ctx.new_rvalue_from_long(value_ty, layout.nil_value);
    let t = backend.ctx.new_rvalue_from_long(value_ty, layout.t_value);
    let pure_base = backend.ctx.new_rvalue_from_long(value_ty, layout.pure_base);
    let pure_size = backend.ctx.new_rvalue_from_long(value_ty, layout.pure_size);
    let inline_prims = InlinePrimitives::build(&mut backend, &abi, nil, t, pure_base, pure_size)?;

    // Declare the native entry point: fixed arity, all parameters and the
    // return value are the host's opaque tagged word.
    let params: Vec<_> = (0..arity)
        .map(|i| backend.ctx.new_parameter(None, value_ty, &format!("arg{}", i)))
        .collect();
    let param_refs: Vec<&gccjit::Parameter> = params.iter().collect();
    let func = backend
        .ctx
        .new_function(None, FunctionType::Exported, value_ty, &param_refs, &obj.name, false);

    // Allocate the meta-stack's backing array: one contiguous local of
    // `max_depth` values, each slot addressed via `new_array_access`, per
    // the original's `SAFE_NALLOCA (stack_base, ...)` plus
    // `gcc_jit_context_new_array_access` loop.
    let array_ty = backend.ctx.new_array_type(None, value_ty, obj.max_depth as i32);
    let backing_array = func.new_local(None, array_ty, "meta_stack_slots");
    let int_ty = backend.ctx.new_type::<i32>();
    let backing_lvalues: Vec<gccjit::LValue> = (0..obj.max_depth)
        .map(|i| {
            let index = backend.ctx.new_rvalue_from_int(int_ty, i as i32);
            backend.ctx.new_array_access(None, backing_array.to_rvalue(), index)
        })
        .collect();

    let mut meta_stack = MetaStack::new(backing_lvalues.clone());
    for _ in 0..arity {
        meta_stack.push_plain()?;
    }

    let prologue = func.new_block("prologue");
    for (i, param) in params.iter().enumerate() {
        prologue.add_assignment(None, backing_lvalues[i], param.to_rvalue());
    }

    let block_map = discover_blocks(&obj.bytecode)?;

    let mut translator = FunctionTranslator::new(
        &mut backend,
        &inline_prims,
        &abi,
        environ,
        func,
        &block_map,
        meta_stack,
        &obj.constants,
        nil,
        t,
        usize::from(arity),
    );
    prologue.end_with_jump(None, translator.entry_block());
    translator.run(&obj.bytecode, &block_map)?;

    let native_code = {
        let _timer_guard = TimerBlockGuard::new(environ);
        let result = backend.ctx.compile();
        let code = result
            .get_function(obj.name.as_str())
            .ok_or_else(|| CompileError::BackendFailure {
                function_name: obj.name.clone(),
            })?;

        if let Some(path) = &options.dump_assembly_to {
            backend.ctx.compile_to_file(OutputKind::Assembler, path.to_string_lossy().as_ref());
        }

        code as *const ()
    };

    let assembly = match &options.dump_assembly_to {
        Some(path) => Some(fs::read_to_string(path).map_err(|e| CompileError::DisassembleIO {
            path: path.clone(),
            reason: e.to_string(),
        })?),
        None => None,
    };

    let arity_kind = PrimitiveArity::Fixed(arity);
    environ.register_compiled_subr(&obj.name, arity_kind, native_code)?;

    Ok(CompiledNative {
        name: obj.name.clone(),
        arity: arity_kind,
        native_code,
        assembly,
    })
}
