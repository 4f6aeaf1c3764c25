//! The externalization boundary between this crate and a concrete host
//! runtime. Everything the compiler needs to ask the host (is this symbol
//! bound to a fixed-arity primitive? register this freshly compiled native
//! function) goes through [`HostEnviron`], so the translator core never
//! assumes a particular Lisp implementation is on the other end of the
//! C ABI it emits calls against.

use crate::error::CompileResult;

/// Arity shape of a callable the host exposes, mirroring §6's two
/// declaration shapes (fixed-arity vs. variadic `(nargs, *args)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveArity {
    Fixed(u8),
    Variadic,
}

/// What the host tells us about a symbol's function cell when the
/// call-site specialization of §4.2 asks "is this a primitive subroutine
/// with a fixed arity?".
#[derive(Debug, Clone)]
pub struct SubrHandle {
    /// The C symbol name of the subroutine's entry point, as declared by
    /// the host (not necessarily equal to the Lisp-visible name).
    pub c_function_name: String,
    pub arity: PrimitiveArity,
}

/// Host integration contract. A concrete embedder implements this against
/// its own symbol table and subroutine-registration machinery; this crate
/// ships [`super::DummyHostEnviron`] as a test double.
pub trait HostEnviron {
    /// Name of the Lisp function currently being compiled, used by the
    /// direct-self-call branch of §4.2's call-site specialization.
    fn current_function_name(&self) -> &str;

    /// Looks up whether `symbol_name`'s function cell is presently a
    /// primitive subroutine with a fixed arity, for the specialization's
    /// second branch. Returns `None` when the symbol is unbound, bound to
    /// a non-primitive, or bound to a variadic (`MANY`-arity) primitive —
    /// SPEC_FULL.md §4.2 restricts the fast path to fixed-arity subrs.
    fn lookup_fixed_arity_primitive(&self, symbol_name: &str) -> Option<SubrHandle>;

    /// Registers the freshly compiled native function pointer as a
    /// primitive subroutine callable under `name` with the given arity.
    /// `native_code` is the raw pointer the codegen backend handed back
    /// after compilation; its signature matches `arity`.
    fn register_compiled_subr(
        &mut self,
        name: &str,
        arity: PrimitiveArity,
        native_code: *const (),
    ) -> CompileResult<()>;

    /// Blocks host asynchronous timer delivery for the duration of the
    /// backend's compile step (§5 "Scheduling", §4.4a): the codegen backend
    /// is documented as non-reentrant with signal delivery. Paired with
    /// [`unblock_async_timers`](Self::unblock_async_timers); the driver
    /// calls both through an RAII guard rather than a manual pair so every
    /// exit path unblocks exactly once.
    fn block_async_timers(&mut self) {}

    /// The reverse of [`block_async_timers`](Self::block_async_timers).
    fn unblock_async_timers(&mut self) {}
}
