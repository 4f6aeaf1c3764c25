//! Declarative descriptions of the host's tagged-value layout.
//!
//! These are deliberately data, not emission code: [`backend::Backend`](crate::backend::Backend)
//! reads them to build the `gccjit` struct/field handles it needs for field
//! access, and [`inline_prims`](crate::inline_prims) reads them to build the
//! always-inlined helper functions. Keeping the layout declarative here
//! means a host with a different field order only needs new `RuntimeAbi`
//! data, not new emission logic.

use gccjit::{Context, Field, Struct, Type};

/// Bit-compatible with the host's cons cell: `{ car: Value, cdr: Value }`.
pub struct ConsAbi {
    pub struct_ty: Struct,
    pub car: Field,
    pub cdr: Field,
}

impl ConsAbi {
    pub fn build(ctx: &Context, value_ty: Type) -> Self {
        let car = ctx.new_field(None, value_ty, "car");
        let cdr = ctx.new_field(None, value_ty, "cdr");
        let struct_ty = ctx.new_struct_type(None, "Lisp_Cons", &[car, cdr]);
        ConsAbi { struct_ty, car, cdr }
    }
}

/// Opaque struct accessed by offset for exactly three named fields; all
/// other bytes are padding reproducing the host's real `struct handler`
/// size so that a pointer to one cast from the host is safe to read/write
/// through.
pub struct HandlerAbi {
    pub struct_ty: Struct,
    pub val: Field,
    pub next: Field,
    pub jmp: Field,
}

impl HandlerAbi {
    /// `jmp_buf_bytes` is host- and architecture-specific (the size of a
    /// `sigjmp_buf`); it is passed in rather than hard-coded so this
    /// descriptor stays portable across the hosts that embed this compiler.
    pub fn build(ctx: &Context, value_ty: Type, pointer_ty: Type, jmp_buf_bytes: usize) -> Self {
        let val = ctx.new_field(None, value_ty, "val");
        let next = ctx.new_field(None, pointer_ty, "next");
        let byte_ty = ctx.new_type::<u8>();
        let jmp_array_ty = ctx.new_array_type(None, byte_ty, jmp_buf_bytes as i32);
        let jmp = ctx.new_field(None, jmp_array_ty, "jmp");
        let struct_ty = ctx.new_struct_type(None, "handler", &[val, next, jmp]);
        HandlerAbi {
            struct_ty,
            val,
            next,
            jmp,
        }
    }
}

/// Only `m_handlerlist` is named; everything else is padding reproducing
/// the host's real offset for that field.
pub struct ThreadStateAbi {
    pub struct_ty: Struct,
    pub m_handlerlist: Field,
}

impl ThreadStateAbi {
    pub fn build(ctx: &Context, pointer_ty: Type, leading_padding_bytes: usize) -> Self {
        let byte_ty = ctx.new_type::<u8>();
        let mut fields = Vec::new();
        let padding = if leading_padding_bytes > 0 {
            let pad_ty = ctx.new_array_type(None, byte_ty, leading_padding_bytes as i32);
            Some(ctx.new_field(None, pad_ty, "_padding"))
        } else {
            None
        };
        if let Some(pad) = padding {
            fields.push(pad);
        }
        let m_handlerlist = ctx.new_field(None, pointer_ty, "m_handlerlist");
        fields.push(m_handlerlist);
        let struct_ty = ctx.new_struct_type(None, "thread_state", &fields);
        ThreadStateAbi {
            struct_ty,
            m_handlerlist,
        }
    }
}

/// The declarative bundle passed into [`Backend::new`](crate::backend::Backend::new).
/// Field offsets are host facts, supplied by the embedder rather than
/// guessed by this crate.
pub struct RuntimeAbi {
    pub cons: ConsAbi,
    pub handler: HandlerAbi,
    pub thread_state: ThreadStateAbi,
}

impl RuntimeAbi {
    pub fn build(
        ctx: &Context,
        value_ty: Type,
        pointer_ty: Type,
        jmp_buf_bytes: usize,
        thread_state_leading_padding: usize,
    ) -> Self {
        RuntimeAbi {
            cons: ConsAbi::build(ctx, value_ty),
            handler: HandlerAbi::build(ctx, value_ty, pointer_ty, jmp_buf_bytes),
            thread_state: ThreadStateAbi::build(ctx, pointer_ty, thread_state_leading_padding),
        }
    }
}
