//! Bit-level description of the host's tagged value representation.
//!
//! The host value is a tagged machine word, readable as either an integer
//! (for bit manipulation) or a pointer (for struct access). This module
//! names the constants that arithmetic on that word depends on; it has no
//! codegen-backend dependency of its own; [`backend::Backend`](crate::backend::Backend)
//! is where these constants get turned into emitted comparisons and casts.

/// Number of low bits of a tagged word occupied by the type tag.
pub const INTTYPEBITS: u32 = 2;

/// Number of bits available to a fixnum's magnitude after tagging.
pub const VALBITS: u32 = 60;

/// Tag value identifying a fixnum whose payload is non-negative-biased
/// (mirrors the host's `Lisp_Int0`).
pub const INT0_TAG: i64 = 0;

pub const MOST_POSITIVE_FIXNUM: i64 = (1i64 << (VALBITS - 1)) - 1;
pub const MOST_NEGATIVE_FIXNUM: i64 = -(1i64 << (VALBITS - 1));

/// Packs a machine integer into a tagged fixnum word. Does not check range;
/// callers emitting this as backend code are expected to have already
/// guarded with a fixnum-range test (see the `sub1`/`add1`/`negate` fast
/// paths in `code_translator`).
pub const fn pack_fixnum(n: i64) -> i64 {
    (n << INTTYPEBITS) + INT0_TAG
}

/// Inverse of [`pack_fixnum`]: arithmetic right shift recovers the sign.
pub const fn unpack_fixnum(word: i64) -> i64 {
    word >> INTTYPEBITS
}

/// The subset of tag kinds the meta-stack's constant-tracking cares about.
/// Only `Symbol` currently drives an optimization (§4.2's call-site
/// specialization); the other variants exist so that [`crate::meta_stack::MetaSlot`]
/// can record *some* type even when it isn't exploited yet, matching the
/// host's own `Lisp_Type` enumeration in spirit without reproducing it in
/// full (we only ever need to recognize "known symbol").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Symbol,
    Fixnum,
    Cons,
    Other,
}
