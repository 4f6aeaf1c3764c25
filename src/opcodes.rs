//! The bytecode's opcode set: byte values, immediate-operand widths, and the
//! tables the emitter consults for the regular `CASE_CALL_N` family and the
//! closed set of runtime shims (§6a of SPEC_FULL.md).

/// One recognized opcode, decoded from a raw byte plus however many
/// immediate bytes its width calls for. Variants are grouped the way
/// SPEC_FULL.md §4.2 groups them, not numerically, since the grouping is
/// what the emitter's dispatch mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    StackRef(u8),
    VarRef(u16),
    VarSet(u16),
    VarBind(u16),
    Call(u16),
    Unbind(u16),

    PushCatch(u16),
    PushConditionCase(u16),
    PopHandler,

    Sub1,
    Add1,
    Negate,

    EqlSign,
    Gtr,
    Lss,
    Leq,
    Geq,

    Car,
    Cdr,
    SetCar,
    SetCdr,

    List1,
    List2,
    List3,
    List4,
    ListN(u16),

    Goto(u16),
    GotoIfNil(u16),
    GotoIfNonNil(u16),
    GotoIfNilElsePop(u16),
    GotoIfNonNilElsePop(u16),
    BrGoto(i32),
    BrGotoIfNil(i32),
    BrGotoIfNonNil(i32),
    BrGotoIfNilElsePop(i32),
    BrGotoIfNonNilElsePop(i32),

    Return,

    Discard,
    Dup,
    StackSet(u16),
    StackSet2(u16),
    DiscardN { count: u8, preserve_tos: bool },

    SaveCurrentBuffer,
    SaveExcursion,
    SaveWindowExcursion,
    SaveRestriction,
    UnwindProtect,
    Catch,
    ConditionCase,
    TempOutputBufferSetup,
    TempOutputBufferShow,

    Consp,
    Numberp,
    Integerp,

    Constant(u16),
    Switch,

    /// One of the flat `CASE_CALL_N` primitives; `arity` is looked up from
    /// [`CASE_CALL_N_TABLE`] by name at decode time.
    CaseCallN { name: &'static str, arity: u8 },

    Throw,
}

/// True if `byte` is the `Bswitch` opcode. Used only by the one-opcode
/// lookahead in the `constant`/`constant2` emission arm (§4.2's `Switch`
/// bullet, §9 Open Question #3): a `Bswitch` immediately following a
/// `constant` load is consumed silently instead of being pushed/decoded
/// as its own instruction.
pub fn is_switch_byte(byte: u8) -> bool {
    byte == SWITCH
}

/// `(byte - 128)` displacement decoded for the `BR*` relative family.
/// Per DESIGN.md's Open Question #1 decision, block discovery and emission
/// both resolve this the same way: `pc_after_immediate + displacement`.
pub fn relative_branch_target(pc_after_immediate: usize, displacement_byte: u8) -> isize {
    let displacement = displacement_byte as isize - 128;
    pc_after_immediate as isize + displacement
}

// Byte layout. Families that take a count/index argument reserve three
// consecutive opcode bytes per slot: `BASE+0..=BASE+5` for inline counts
// 0..=5, `BASE+6` for a 1-byte fetched count, `BASE+7` for a 2-byte fetched
// count, mirroring `compute_blocks`'s own fetch-width convention
// (`FETCH`/`FETCH2`).
const STACK_REF_BASE: u8 = 0x00;
const VAR_REF_BASE: u8 = 0x08;
const VAR_SET_BASE: u8 = 0x10;
const VAR_BIND_BASE: u8 = 0x18;
const CALL_BASE: u8 = 0x20;
const UNBIND_BASE: u8 = 0x28;

const POP_HANDLER: u8 = 0x30;
const PUSH_CONDITION_CASE: u8 = 0x31;
const PUSH_CATCH: u8 = 0x32;

const SUB1: u8 = 0x33;
const ADD1: u8 = 0x34;
const NEGATE: u8 = 0x35;
const EQLSIGN: u8 = 0x36;
const GTR: u8 = 0x37;
const LSS: u8 = 0x38;
const LEQ: u8 = 0x39;
const GEQ: u8 = 0x3a;

const CAR: u8 = 0x3b;
const CDR: u8 = 0x3c;
const SETCAR: u8 = 0x3d;
const SETCDR: u8 = 0x3e;

const LIST1: u8 = 0x3f;
const LIST2: u8 = 0x40;
const LIST3: u8 = 0x41;
const LIST4: u8 = 0x42;
const LISTN: u8 = 0x43;

const GOTO: u8 = 0x44;
const GOTO_IF_NIL: u8 = 0x45;
const GOTO_IF_NON_NIL: u8 = 0x46;
const GOTO_IF_NIL_ELSE_POP: u8 = 0x47;
const GOTO_IF_NON_NIL_ELSE_POP: u8 = 0x48;

const BR_GOTO: u8 = 0x49;
const BR_GOTO_IF_NIL: u8 = 0x4a;
const BR_GOTO_IF_NON_NIL: u8 = 0x4b;
const BR_GOTO_IF_NIL_ELSE_POP: u8 = 0x4c;
const BR_GOTO_IF_NON_NIL_ELSE_POP: u8 = 0x4d;

const RETURN: u8 = 0x4e;
const DISCARD: u8 = 0x4f;
const DUP: u8 = 0x50;
const STACK_SET: u8 = 0x51;
const STACK_SET2: u8 = 0x52;
const DISCARD_N: u8 = 0x53;

const SAVE_CURRENT_BUFFER: u8 = 0x54;
const SAVE_EXCURSION: u8 = 0x55;
const SAVE_WINDOW_EXCURSION: u8 = 0x56;
const SAVE_RESTRICTION: u8 = 0x57;
const UNWIND_PROTECT: u8 = 0x58;
const CATCH: u8 = 0x59;
const CONDITION_CASE: u8 = 0x5a;
const TEMP_OUTPUT_BUFFER_SETUP: u8 = 0x5b;
const TEMP_OUTPUT_BUFFER_SHOW: u8 = 0x5c;

const CONSP: u8 = 0x5d;
const NUMBERP: u8 = 0x5e;
const INTEGERP: u8 = 0x5f;

const CONSTANT: u8 = 0x60;
const CONSTANT2: u8 = 0x61;
const SWITCH: u8 = 0x62;
const THROW: u8 = 0x63;

// CASE_CALL_N opcodes start immediately after the fixed table and occupy
// one byte per entry of `CASE_CALL_N_TABLE`, in table order.
const CASE_CALL_N_BASE: u8 = 0x64;

fn fetch1(bytes: &[u8], pc: usize) -> crate::error::CompileResult<(u8, usize)> {
    bytes
        .get(pc)
        .map(|&b| (b, pc + 1))
        .ok_or_else(|| crate::error::CompileError::malformed(pc, "truncated 1-byte immediate"))
}

fn fetch2(bytes: &[u8], pc: usize) -> crate::error::CompileResult<(u16, usize)> {
    let hi = *bytes
        .get(pc + 1)
        .ok_or_else(|| crate::error::CompileError::malformed(pc, "truncated 2-byte immediate"))?;
    let lo = *bytes
        .get(pc)
        .ok_or_else(|| crate::error::CompileError::malformed(pc, "truncated 2-byte immediate"))?;
    Ok((u16::from(lo) | (u16::from(hi) << 8), pc + 2))
}

/// Decodes the count/index argument of an opcode family laid out on the
/// `BASE+0..=BASE+7` convention documented above.
fn fetch_count(bytes: &[u8], pc: usize, opcode_byte: u8, base: u8) -> crate::error::CompileResult<(u16, usize)> {
    let slot = opcode_byte - base;
    match slot {
        0..=5 => Ok((u16::from(slot), pc)),
        6 => {
            let (v, next) = fetch1(bytes, pc)?;
            Ok((u16::from(v), next))
        }
        7 => fetch2(bytes, pc),
        _ => unreachable!("slot is opcode_byte - base, both within the same 8-byte family"),
    }
}

/// Decodes one opcode starting at `pc`. Returns the opcode and the PC of the
/// next instruction. This is the single decoder shared by block discovery
/// and the emitter, so the two passes can never disagree about where an
/// instruction's immediate bytes end (the half of DESIGN.md's Open Question
/// #1 fix that isn't about relative-branch arithmetic).
pub fn decode(bytes: &[u8], pc: usize) -> crate::error::CompileResult<(Opcode, usize)> {
    use crate::error::CompileError;

    let byte = *bytes
        .get(pc)
        .ok_or_else(|| CompileError::malformed(pc, "pc past end of bytecode"))?;
    let next = pc + 1;

    if (STACK_REF_BASE..STACK_REF_BASE + 8).contains(&byte) {
        let (k, next) = fetch_count(bytes, next, byte, STACK_REF_BASE)?;
        return Ok((Opcode::StackRef(k as u8), next));
    }
    if (VAR_REF_BASE..VAR_REF_BASE + 8).contains(&byte) {
        let (k, next) = fetch_count(bytes, next, byte, VAR_REF_BASE)?;
        return Ok((Opcode::VarRef(k), next));
    }
    if (VAR_SET_BASE..VAR_SET_BASE + 8).contains(&byte) {
        let (k, next) = fetch_count(bytes, next, byte, VAR_SET_BASE)?;
        return Ok((Opcode::VarSet(k), next));
    }
    if (VAR_BIND_BASE..VAR_BIND_BASE + 8).contains(&byte) {
        let (k, next) = fetch_count(bytes, next, byte, VAR_BIND_BASE)?;
        return Ok((Opcode::VarBind(k), next));
    }
    if (CALL_BASE..CALL_BASE + 8).contains(&byte) {
        let (k, next) = fetch_count(bytes, next, byte, CALL_BASE)?;
        return Ok((Opcode::Call(k), next));
    }
    if (UNBIND_BASE..UNBIND_BASE + 8).contains(&byte) {
        let (k, next) = fetch_count(bytes, next, byte, UNBIND_BASE)?;
        return Ok((Opcode::Unbind(k), next));
    }

    if byte == POP_HANDLER {
        return Ok((Opcode::PopHandler, next));
    }
    if byte == PUSH_CONDITION_CASE {
        let (target, next) = fetch2(bytes, next)?;
        return Ok((Opcode::PushConditionCase(target), next));
    }
    if byte == PUSH_CATCH {
        let (target, next) = fetch2(bytes, next)?;
        return Ok((Opcode::PushCatch(target), next));
    }

    if byte == SUB1 {
        return Ok((Opcode::Sub1, next));
    }
    if byte == ADD1 {
        return Ok((Opcode::Add1, next));
    }
    if byte == NEGATE {
        return Ok((Opcode::Negate, next));
    }
    if byte == EQLSIGN {
        return Ok((Opcode::EqlSign, next));
    }
    if byte == GTR {
        return Ok((Opcode::Gtr, next));
    }
    if byte == LSS {
        return Ok((Opcode::Lss, next));
    }
    if byte == LEQ {
        return Ok((Opcode::Leq, next));
    }
    if byte == GEQ {
        return Ok((Opcode::Geq, next));
    }

    if byte == CAR {
        return Ok((Opcode::Car, next));
    }
    if byte == CDR {
        return Ok((Opcode::Cdr, next));
    }
    if byte == SETCAR {
        return Ok((Opcode::SetCar, next));
    }
    if byte == SETCDR {
        return Ok((Opcode::SetCdr, next));
    }

    if byte == LIST1 {
        return Ok((Opcode::List1, next));
    }
    if byte == LIST2 {
        return Ok((Opcode::List2, next));
    }
    if byte == LIST3 {
        return Ok((Opcode::List3, next));
    }
    if byte == LIST4 {
        return Ok((Opcode::List4, next));
    }
    if byte == LISTN {
        let (n, next) = fetch2(bytes, next)?;
        return Ok((Opcode::ListN(n), next));
    }

    if byte == GOTO {
        let (target, next) = fetch2(bytes, next)?;
        return Ok((Opcode::Goto(target), next));
    }
    if byte == GOTO_IF_NIL {
        let (target, next) = fetch2(bytes, next)?;
        return Ok((Opcode::GotoIfNil(target), next));
    }
    if byte == GOTO_IF_NON_NIL {
        let (target, next) = fetch2(bytes, next)?;
        return Ok((Opcode::GotoIfNonNil(target), next));
    }
    if byte == GOTO_IF_NIL_ELSE_POP {
        let (target, next) = fetch2(bytes, next)?;
        return Ok((Opcode::GotoIfNilElsePop(target), next));
    }
    if byte == GOTO_IF_NON_NIL_ELSE_POP {
        let (target, next) = fetch2(bytes, next)?;
        return Ok((Opcode::GotoIfNonNilElsePop(target), next));
    }

    if byte == BR_GOTO {
        let (disp, next) = fetch1(bytes, next)?;
        return Ok((Opcode::BrGoto(relative_branch_target(next, disp) as i32), next));
    }
    if byte == BR_GOTO_IF_NIL {
        let (disp, next) = fetch1(bytes, next)?;
        return Ok((Opcode::BrGotoIfNil(relative_branch_target(next, disp) as i32), next));
    }
    if byte == BR_GOTO_IF_NON_NIL {
        let (disp, next) = fetch1(bytes, next)?;
        return Ok((Opcode::BrGotoIfNonNil(relative_branch_target(next, disp) as i32), next));
    }
    if byte == BR_GOTO_IF_NIL_ELSE_POP {
        let (disp, next) = fetch1(bytes, next)?;
        return Ok((
            Opcode::BrGotoIfNilElsePop(relative_branch_target(next, disp) as i32),
            next,
        ));
    }
    if byte == BR_GOTO_IF_NON_NIL_ELSE_POP {
        let (disp, next) = fetch1(bytes, next)?;
        return Ok((
            Opcode::BrGotoIfNonNilElsePop(relative_branch_target(next, disp) as i32),
            next,
        ));
    }

    if byte == RETURN {
        return Ok((Opcode::Return, next));
    }
    if byte == DISCARD {
        return Ok((Opcode::Discard, next));
    }
    if byte == DUP {
        return Ok((Opcode::Dup, next));
    }
    if byte == STACK_SET {
        let (k, next) = fetch1(bytes, next)?;
        return Ok((Opcode::StackSet(u16::from(k)), next));
    }
    if byte == STACK_SET2 {
        let (k, next) = fetch2(bytes, next)?;
        return Ok((Opcode::StackSet2(k), next));
    }
    if byte == DISCARD_N {
        let (raw, next) = fetch1(bytes, next)?;
        return Ok((
            Opcode::DiscardN {
                count: raw & 0x7f,
                preserve_tos: raw & 0x80 != 0,
            },
            next,
        ));
    }

    if byte == SAVE_CURRENT_BUFFER {
        return Ok((Opcode::SaveCurrentBuffer, next));
    }
    if byte == SAVE_EXCURSION {
        return Ok((Opcode::SaveExcursion, next));
    }
    if byte == SAVE_WINDOW_EXCURSION {
        return Ok((Opcode::SaveWindowExcursion, next));
    }
    if byte == SAVE_RESTRICTION {
        return Ok((Opcode::SaveRestriction, next));
    }
    if byte == UNWIND_PROTECT {
        return Ok((Opcode::UnwindProtect, next));
    }
    if byte == CATCH {
        return Ok((Opcode::Catch, next));
    }
    if byte == CONDITION_CASE {
        return Ok((Opcode::ConditionCase, next));
    }
    if byte == TEMP_OUTPUT_BUFFER_SETUP {
        return Ok((Opcode::TempOutputBufferSetup, next));
    }
    if byte == TEMP_OUTPUT_BUFFER_SHOW {
        return Ok((Opcode::TempOutputBufferShow, next));
    }

    if byte == CONSP {
        return Ok((Opcode::Consp, next));
    }
    if byte == NUMBERP {
        return Ok((Opcode::Numberp, next));
    }
    if byte == INTEGERP {
        return Ok((Opcode::Integerp, next));
    }

    if byte == CONSTANT {
        let (k, next) = fetch1(bytes, next)?;
        return Ok((Opcode::Constant(u16::from(k)), next));
    }
    if byte == CONSTANT2 {
        let (k, next) = fetch2(bytes, next)?;
        return Ok((Opcode::Constant(k), next));
    }
    if byte == SWITCH {
        return Ok((Opcode::Switch, next));
    }
    if byte == THROW {
        return Ok((Opcode::Throw, next));
    }

    let case_call_index = byte.checked_sub(CASE_CALL_N_BASE).map(usize::from);
    if let Some(index) = case_call_index {
        if let Some(&(name, arity)) = CASE_CALL_N_TABLE.get(index) {
            return Ok((Opcode::CaseCallN { name, arity }, next));
        }
    }

    Err(CompileError::malformed(pc, format!("unknown opcode byte {:#04x}", byte)))
}

/// The flat `CASE_CALL_N` primitive table (§6): pop `arity` values, call the
/// correspondingly named host `F<name>`, push the result.
pub const CASE_CALL_N_TABLE: &[(&str, u8)] = &[
    ("nth", 1),
    ("symbolp", 1),
    ("stringp", 1),
    ("listp", 1),
    ("not", 1),
    ("length", 1),
    ("symbol_value", 1),
    ("symbol_function", 1),
    ("current_buffer", 1),
    ("eolp", 1),
    ("eobp", 1),
    ("bolp", 1),
    ("bobp", 1),
    ("widen", 1),
    ("current_column", 1),
    ("following_char", 1),
    ("preceding_char", 1),
    ("car_safe", 1),
    ("cdr_safe", 1),
    ("numberp", 1),
    ("integerp", 1),
    ("eq", 2),
    ("memq", 2),
    ("cons", 2),
    ("aref", 2),
    ("set", 2),
    ("fset", 2),
    ("get", 2),
    ("nthcdr", 2),
    ("elt", 2),
    ("member", 2),
    ("assq", 2),
    ("equal", 2),
    ("goto_char", 2),
    ("buffer_substring", 2),
    ("delete_region", 2),
    ("narrow_to_region", 2),
    ("set_buffer", 2),
    ("forward_char", 2),
    ("forward_word", 2),
    ("forward_line", 2),
    ("char_syntax", 2),
    ("end_of_line", 2),
    ("skip_chars_forward", 2),
    ("skip_chars_backward", 2),
    ("rem", 2),
    ("stringeqlsign", 2),
    ("stringlss", 2),
    ("indent_to", 2),
    ("char_after", 2),
    ("upcase", 2),
    ("downcase", 2),
    ("match_beginning", 2),
    ("match_end", 2),
    ("aset", 3),
    ("set_marker", 3),
    ("substring", 3),
];

/// The fixed, closed table of runtime shim functions (§6a): irregular
/// free C functions emitted code calls directly, declared once at
/// compilation start rather than discovered opcode by opcode.
pub const RUNTIME_SHIMS: &[(&str, u8, bool)] = &[
    // (name, arity, is_variadic)
    ("helper_unbind_n", 1, false),
    ("helper_save_window_excursion", 1, false),
    ("helper_unwind_protect", 1, false),
    ("helper_temp_output_buffer_setup", 1, false),
    ("helper_PSEUDOVECTOR_TYPEP_XUNTAG", 2, false),
];

/// Variadic host entry points taking `(nargs, *values)`.
pub const VARIADIC_HOST_FUNCTIONS: &[&str] =
    &["funcall", "concat", "insert", "nconc", "quo", "minus", "plus", "max", "min", "times"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_inline_stack_ref_count() {
        let (op, next) = decode(&[STACK_REF_BASE + 3], 0).unwrap();
        assert_eq!(op, Opcode::StackRef(3));
        assert_eq!(next, 1);
    }

    #[test]
    fn decodes_fetched_1_byte_call_count() {
        let bytes = [CALL_BASE + 6, 9];
        let (op, next) = decode(&bytes, 0).unwrap();
        assert_eq!(op, Opcode::Call(9));
        assert_eq!(next, 2);
    }

    #[test]
    fn decodes_fetched_2_byte_varref_count_little_endian() {
        let bytes = [VAR_REF_BASE + 7, 0x34, 0x12];
        let (op, next) = decode(&bytes, 0).unwrap();
        assert_eq!(op, Opcode::VarRef(0x1234));
        assert_eq!(next, 3);
    }

    #[test]
    fn decodes_two_byte_absolute_branch_target() {
        let bytes = [GOTO, 0x05, 0x00];
        let (op, next) = decode(&bytes, 0).unwrap();
        assert_eq!(op, Opcode::Goto(5));
        assert_eq!(next, 3);
    }

    #[test]
    fn decodes_relative_branch_with_pc_added_after_immediate() {
        // BRgoto, displacement byte 130 => byte-128 == 2; next_pc after the
        // 1-byte immediate is 2, so the target resolves to 4.
        let bytes = [BR_GOTO, 130];
        let (op, next) = decode(&bytes, 0).unwrap();
        assert_eq!(op, Opcode::BrGoto(4));
        assert_eq!(next, 2);
    }

    #[test]
    fn decodes_discard_n_high_bit_as_preserve_flag() {
        let (op, _) = decode(&[DISCARD_N, 0x85], 0).unwrap();
        assert_eq!(
            op,
            Opcode::DiscardN {
                count: 5,
                preserve_tos: true
            }
        );
    }

    #[test]
    fn decodes_case_call_n_family_by_table_order() {
        let (op, _) = decode(&[CASE_CALL_N_BASE], 0).unwrap();
        assert_eq!(op, Opcode::CaseCallN { name: "nth", arity: 1 });
    }

    #[test]
    fn rejects_unknown_opcode_byte() {
        assert!(decode(&[0xfe], 0).is_err());
    }

    #[test]
    fn rejects_truncated_two_byte_immediate() {
        assert!(decode(&[GOTO, 0x00], 0).is_err());
    }
}
