//! This module contains the bulk of the interesting code performing the
//! translation between the Lisp bytecode and the codegen backend's IR.
//!
//! The translation is done in one pass, PC by PC. Two main data structures
//! are used during the walk: the meta-stack, which mimics the execution of
//! the bytecode's stack machine (each instruction's result is pushed, each
//! instruction's arguments are popped), and the block map produced by
//! basic-block discovery, which tells the translator when to switch the
//! backend block it is emitting into.
//!
//! Structurally grounded on `translate_operator` in
//! `cranelift-wasm/src/code_translator.rs`: one big match over the opcode
//! set, family-delimiting banner comments, a small bundle of collaborators
//! (here: backend, inline primitives, host environ, meta-stack) threaded
//! through every arm. Semantically grounded, opcode by opcode, on the
//! `compile_f` switch in the original source.

use gccjit::{Block, ComparisonOp, Function, RValue, ToRValue};
use log::{trace, warn};

use crate::abi::RuntimeAbi;
use crate::backend::Backend;
use crate::blocks::BlockMap;
use crate::bytefunction::Constant;
use crate::environ::{HostEnviron, PrimitiveArity};
use crate::error::{CompileError, CompileResult};
use crate::inline_prims::InlinePrimitives;
use crate::meta_stack::{MetaSlot, MetaStack};
use crate::opcodes::{decode, is_switch_byte, Opcode, CASE_CALL_N_TABLE};
use crate::value::{INT0_TAG, MOST_NEGATIVE_FIXNUM, MOST_POSITIVE_FIXNUM};

/// One backend block plus the bookkeeping Data Model §3 requires: whether
/// a predecessor has already recorded the meta-stack depth expected on
/// entry, and whether this block has already been closed with a
/// terminator (Data Model invariant (iii)).
struct BlockState {
    backend_block: Block,
    entry_stack_depth: Option<usize>,
    terminated: bool,
}

/// Per-function translation state: everything `translate_operator` needs,
/// gathered in one place instead of read off process-wide globals (§9's
/// "Global compilation state" re-architecture note).
pub struct FunctionTranslator<'a> {
    backend: &'a mut Backend,
    inline_prims: &'a InlinePrimitives,
    abi: &'a RuntimeAbi,
    environ: &'a mut dyn HostEnviron,
    func: Function,
    blocks: Vec<BlockState>,
    meta_stack: MetaStack,
    constants: &'a [Constant],
    nil: RValue,
    t: RValue,
}

impl<'a> FunctionTranslator<'a> {
    /// `initial_stack_depth` is the meta-stack depth already live when PC 0
    /// starts executing -- the number of argument slots the driver's
    /// prologue has already written into the backing array (SPEC_FULL.md
    /// §4.4), not zero: arguments occupy the low stack slots directly,
    /// they are not pushed by any bytecode instruction.
    pub fn new(
        backend: &'a mut Backend,
        inline_prims: &'a InlinePrimitives,
        abi: &'a RuntimeAbi,
        environ: &'a mut dyn HostEnviron,
        func: Function,
        block_map: &BlockMap,
        meta_stack: MetaStack,
        constants: &'a [Constant],
        nil: RValue,
        t: RValue,
        initial_stack_depth: usize,
    ) -> Self {
        let blocks = block_map
            .leaders
            .iter()
            .enumerate()
            .map(|(i, _)| BlockState {
                backend_block: func.new_block(&format!("bb{}", i)),
                entry_stack_depth: if i == 0 { Some(initial_stack_depth) } else { None },
                terminated: false,
            })
            .collect();

        FunctionTranslator {
            backend,
            inline_prims,
            abi,
            environ,
            func,
            blocks,
            meta_stack,
            constants,
            nil,
            t,
        }
    }

    /// The backend block for PC 0, i.e. where the driver's prologue jumps
    /// to once it has copied arguments into the meta-stack's backing array.
    pub fn entry_block(&self) -> Block {
        self.blocks[0].backend_block
    }

    /// Walks the whole bytecode in PC order, switching blocks at leaders
    /// and dispatching each opcode. This is the emitter's outer loop;
    /// `translate_operator` below does the per-opcode work.
    pub fn run(&mut self, bytecode: &[u8], block_map: &BlockMap) -> CompileResult<()> {
        let mut pc = 0usize;
        let mut current_block_index = 0usize;

        while pc < bytecode.len() {
            let block_index = block_map.block_of(pc);
            if block_index != current_block_index {
                self.close_with_fallthrough(current_block_index, block_index)?;
                current_block_index = block_index;
            }
            if block_map.is_leader(pc) {
                if let Some(depth) = self.blocks[block_index].entry_stack_depth {
                    self.meta_stack.truncate_to(depth)?;
                }
            }

            let (op, next_pc) = decode(bytecode, pc)?;
            trace!("pc={} op={:?}", pc, op);

            // `Bconstant` followed immediately by `Bswitch` is a single
            // constant-pool-index pattern (SPEC_FULL.md §4.2's `Switch`
            // bullet, §9 Open Question #3): the push is skipped and the
            // `Bswitch` byte is consumed without being decoded as its own
            // instruction, mirroring `bytestr_data[pc] != Bswitch` in the
            // original's `Bconstant` case.
            if let Opcode::Constant(_) = op {
                if bytecode.get(next_pc).map_or(false, |&b| is_switch_byte(b)) {
                    trace!("pc={} constant+switch lookahead: skipping push, consuming switch", pc);
                    pc = next_pc + 1;
                    continue;
                }
            }

            self.translate_operator(op, pc, next_pc, block_map)?;
            pc = next_pc;
        }

        Ok(())
    }

    fn close_with_fallthrough(&mut self, from: usize, to: usize) -> CompileResult<()> {
        if !self.blocks[from].terminated {
            let target = self.blocks[to].backend_block;
            self.blocks[from].backend_block.end_with_jump(None, target);
            self.blocks[from].terminated = true;
        }
        self.record_entry_depth(to, self.meta_stack.depth())
    }

    fn record_entry_depth(&mut self, block_index: usize, depth: usize) -> CompileResult<()> {
        match self.blocks[block_index].entry_stack_depth {
            None => {
                self.blocks[block_index].entry_stack_depth = Some(depth);
                Ok(())
            }
            Some(existing) if existing == depth => Ok(()),
            Some(existing) => Err(CompileError::UnsupportedCast {
                detail: format!(
                    "block {} entered with mismatched meta-stack depths {} and {}",
                    block_index, existing, depth
                ),
            }),
        }
    }

    fn jump_to_block(&mut self, current_block: Block, from_index: usize, target_pc: usize, block_map: &BlockMap) -> CompileResult<()> {
        let target_index = block_map.block_of(target_pc);
        let target_block = self.blocks[target_index].backend_block;
        current_block.end_with_jump(None, target_block);
        self.blocks[from_index].terminated = true;
        self.record_entry_depth(target_index, self.meta_stack.depth())
    }

    fn symbol_name(&self, constant_index: u16) -> CompileResult<Option<&str>> {
        match self.constants.get(usize::from(constant_index)) {
            Some(Constant::Symbol(name)) => Ok(Some(name.as_str())),
            Some(Constant::Opaque) => Ok(None),
            None => Err(CompileError::shape(format!(
                "constant index {} out of range",
                constant_index
            ))),
        }
    }

    /// The big per-opcode dispatch. Families are delimited with banner
    /// comments matching SPEC_FULL.md §4.2's own grouping.
    fn translate_operator(
        &mut self,
        op: Opcode,
        pc: usize,
        next_pc: usize,
        block_map: &BlockMap,
    ) -> CompileResult<()> {
        let block_index = block_map.block_of(pc);
        let block = self.blocks[block_index].backend_block;

        match op {
            /***** Stack reference *****/
            Opcode::StackRef(k) => {
                let source = self.meta_stack.peek_from_top(k as usize)?.lvalue;
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, source.to_rvalue());
            }

            /***** Variable reference / set / bind *****/
            Opcode::VarRef(k) => {
                let sym = self.load_constant_rvalue(block, k)?;
                let result = self.backend.emit_call(
                    "symbol_value",
                    self.backend.value_ty,
                    &[self.backend.value_ty],
                    &[sym],
                    false,
                );
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, result);
            }
            Opcode::VarSet(k) => {
                let sym = self.load_constant_rvalue(block, k)?;
                let value = self.meta_stack.pop1()?.lvalue.to_rvalue();
                let nil = self.nil;
                let set_internal_set = self
                    .backend
                    .ctx
                    .new_rvalue_from_int(self.backend.ctx.new_type::<i32>(), 3); // SET_INTERNAL_SET
                let _ = self.backend.emit_call(
                    "set_internal",
                    self.backend.value_ty,
                    &[
                        self.backend.value_ty,
                        self.backend.value_ty,
                        self.backend.value_ty,
                        self.backend.ctx.new_type::<i32>(),
                    ],
                    &[sym, value, nil, set_internal_set],
                    false,
                );
            }
            Opcode::VarBind(k) => {
                let sym = self.load_constant_rvalue(block, k)?;
                let value = self.meta_stack.pop1()?.lvalue.to_rvalue();
                let _ = self.backend.emit_call(
                    "specbind",
                    self.backend.value_ty,
                    &[self.backend.value_ty, self.backend.value_ty],
                    &[sym, value],
                    false,
                );
            }

            /***** Call *****/
            Opcode::Call(k) => self.translate_call(block, k)?,

            /***** Unbind *****/
            Opcode::Unbind(k) => {
                let ptrdiff_ty = self.backend.ctx.new_type::<i64>();
                let n = self.backend.ctx.new_rvalue_from_long(ptrdiff_ty, i64::from(k));
                let _ = self
                    .backend
                    .emit_call("helper_unbind_n", self.backend.ctx.new_type::<()>(), &[ptrdiff_ty], &[n], false);
            }

            /***** Handler push/pop *****/
            Opcode::PushCatch(target) | Opcode::PushConditionCase(target) => {
                self.translate_push_handler(block, block_index, op, target, next_pc, block_map)?;
            }
            Opcode::PopHandler => {
                let handlerlist_field = self.abi.thread_state.m_handlerlist;
                let current_thread = self.backend.emit_call(
                    "current_thread_ptr",
                    self.backend.pointer_ty,
                    &[],
                    &[],
                    false,
                );
                let handlerlist = current_thread.dereference_field(None, handlerlist_field);
                let handler_ptr = handlerlist.to_rvalue();
                let next_field = self.abi.handler.next;
                let next_handler = handler_ptr.dereference_field(None, next_field);
                block.add_assignment(None, handlerlist, next_handler.to_rvalue());
            }

            /***** Inline arithmetic fast paths *****/
            Opcode::Sub1 => self.translate_incdec(block, block_index, next_pc, block_map, -1, "sub1")?,
            Opcode::Add1 => self.translate_incdec(block, block_index, next_pc, block_map, 1, "add1")?,
            Opcode::Negate => self.translate_negate(block, block_index, next_pc, block_map)?,

            /***** Arithmetic comparisons *****/
            Opcode::EqlSign | Opcode::Gtr | Opcode::Lss | Opcode::Leq | Opcode::Geq => {
                self.translate_arithcompare(block, op)?;
            }

            /***** Cons primitives *****/
            Opcode::Car => self.translate_inline_unary(block, self.inline_prims.car)?,
            Opcode::Cdr => self.translate_inline_unary(block, self.inline_prims.cdr)?,
            Opcode::SetCar => self.translate_inline_binary(block, self.inline_prims.setcar)?,
            Opcode::SetCdr => self.translate_inline_binary(block, self.inline_prims.setcdr)?,

            /***** List construction *****/
            Opcode::List1 => self.translate_list_n(block, 1)?,
            Opcode::List2 => self.translate_list_n(block, 2)?,
            Opcode::List3 => self.translate_list_n(block, 3)?,
            Opcode::List4 => self.translate_list_n(block, 4)?,
            Opcode::ListN(n) => self.translate_list_n(block, n)?,

            /***** Control flow *****/
            Opcode::Goto(target) => {
                self.jump_to_block(block, block_index, target as usize, block_map)?;
            }
            Opcode::GotoIfNil(target) => self.translate_conditional_goto(block, block_index, target as usize, next_pc, block_map, true, false)?,
            Opcode::GotoIfNonNil(target) => self.translate_conditional_goto(block, block_index, target as usize, next_pc, block_map, false, false)?,
            Opcode::GotoIfNilElsePop(target) => self.translate_conditional_goto(block, block_index, target as usize, next_pc, block_map, true, true)?,
            Opcode::GotoIfNonNilElsePop(target) => self.translate_conditional_goto(block, block_index, target as usize, next_pc, block_map, false, true)?,
            Opcode::BrGoto(target) => {
                self.jump_to_block(block, block_index, target as usize, block_map)?;
            }
            Opcode::BrGotoIfNil(target) => self.translate_conditional_goto(block, block_index, target as usize, next_pc, block_map, true, false)?,
            Opcode::BrGotoIfNonNil(target) => self.translate_conditional_goto(block, block_index, target as usize, next_pc, block_map, false, false)?,
            Opcode::BrGotoIfNilElsePop(target) => self.translate_conditional_goto(block, block_index, target as usize, next_pc, block_map, true, true)?,
            Opcode::BrGotoIfNonNilElsePop(target) => self.translate_conditional_goto(block, block_index, target as usize, next_pc, block_map, false, true)?,

            /***** Return *****/
            Opcode::Return => {
                let value = self.meta_stack.pop1()?.lvalue.to_rvalue();
                block.end_with_return(None, value);
                self.blocks[block_index].terminated = true;
            }

            /***** Stack manipulation *****/
            Opcode::Discard => {
                self.meta_stack.pop1()?;
            }
            Opcode::Dup => {
                let top = self.meta_stack.top()?.lvalue.to_rvalue();
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, top);
            }
            Opcode::StackSet(k) => {
                // `stack-set-0` is a plain discard (comp.c only emits the
                // assignment when `op > 0`); `stack_set2` has no such
                // special case, but writing at `k == 0` lands one past the
                // new top and is never read, so it is safe to skip there
                // too.
                let value = self.meta_stack.pop1()?;
                if k > 0 {
                    self.meta_stack.set_relative_to_top(usize::from(k), value)?;
                }
            }
            Opcode::StackSet2(k) => {
                let value = self.meta_stack.pop1()?;
                if k > 0 {
                    self.meta_stack.set_relative_to_top(usize::from(k), value)?;
                }
            }
            Opcode::DiscardN { count, preserve_tos } => {
                if preserve_tos {
                    // comp.c's `BdiscardN` pops TOS, discards `count` more,
                    // then assigns the saved value into `stack - count - 1`
                    // -- that address is the *new* top after the discard,
                    // not a freshly pushed slot, so the net depth change is
                    // `count + 1`, not `count` (the naive "pop, discard,
                    // push back" reading overcounts the final depth by one).
                    let top = self.meta_stack.pop1()?;
                    self.meta_stack.popn(usize::from(count))?;
                    let value = top.lvalue.to_rvalue();
                    let dest = self.meta_stack.replace_top(top)?;
                    block.add_assignment(None, dest, value);
                } else {
                    self.meta_stack.popn(usize::from(count))?;
                }
            }

            /***** Scoped primitives *****/
            // Neither of these touches the meta-stack: the original emits a
            // bare void call with no arguments and falls straight through,
            // no `POP1`/`PUSH_RVAL` around either `Bsave_current_buffer(_1)`
            // or `Bsave_excursion`.
            Opcode::SaveCurrentBuffer => {
                let _ = self.backend.emit_call(
                    "record_unwind_current_buffer",
                    self.backend.value_ty,
                    &[],
                    &[],
                    false,
                );
            }
            Opcode::SaveExcursion => {
                let _ = self.backend.emit_call(
                    "record_unwind_protect_excursion",
                    self.backend.value_ty,
                    &[],
                    &[],
                    false,
                );
            }
            Opcode::SaveWindowExcursion => {
                let arg = self.meta_stack.pop1()?.lvalue.to_rvalue();
                let ptrdiff_ty = self.backend.ctx.new_type::<i64>();
                let _ = ptrdiff_ty;
                let result = self.backend.emit_call(
                    "helper_save_window_excursion",
                    self.backend.value_ty,
                    &[self.backend.value_ty],
                    &[arg],
                    false,
                );
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, result);
            }
            Opcode::SaveRestriction => {
                // `comp.c`'s `Bsave_restriction` emits a bare
                // `record_unwind_protect` void call with no `PUSH_RVAL` --
                // stack-neutral, unlike every other `save_*`/`record_unwind_*`
                // arm above that does push a result.
                let _ = self.backend.emit_call(
                    "record_unwind_protect_void",
                    self.backend.ctx.new_type::<()>(),
                    &[],
                    &[],
                    false,
                );
            }
            Opcode::UnwindProtect => {
                let arg = self.meta_stack.pop1()?.lvalue.to_rvalue();
                let _ = self.backend.emit_call(
                    "helper_unwind_protect",
                    self.backend.ctx.new_type::<()>(),
                    &[self.backend.value_ty],
                    &[arg],
                    false,
                );
            }
            Opcode::Catch => {
                // `comp.c`'s `Bcatch`: `POP2` gives `(tag, body)`; the
                // callee's middle argument is not a stack value but the
                // address of the host's `eval_sub` entry point, spliced in
                // between `tag` and `body`. No result is pushed.
                let (tag, body) = self.meta_stack.pop2()?;
                let eval_sub = self.backend.declare_function(
                    "eval_sub",
                    self.backend.value_ty,
                    &[self.backend.value_ty],
                    false,
                );
                let eval_sub_ptr = eval_sub.get_address(None);
                let eval_sub_value = self.backend.cast_pointer_to_int(self.func, block, eval_sub_ptr)?;
                let _ = self.backend.emit_call(
                    "internal_catch",
                    self.backend.pointer_ty,
                    &[self.backend.value_ty, self.backend.value_ty, self.backend.value_ty],
                    &[tag.lvalue.to_rvalue(), eval_sub_value, body.lvalue.to_rvalue()],
                    false,
                );
            }
            Opcode::ConditionCase => {
                // `comp.c`'s `Bcondition_case`: `POP3` feeds all three
                // popped values straight through to the callee in order;
                // no result is pushed.
                let popped = self.meta_stack.popn(3)?;
                let args: Vec<RValue> = popped.iter().map(|slot| slot.lvalue.to_rvalue()).collect();
                let _ = self.backend.emit_call(
                    "internal_lisp_condition_case",
                    self.backend.value_ty,
                    &[self.backend.value_ty; 3],
                    &args,
                    false,
                );
            }
            Opcode::TempOutputBufferSetup => {
                let arg = self.meta_stack.pop1()?.lvalue.to_rvalue();
                let result = self.backend.emit_call(
                    "helper_temp_output_buffer_setup",
                    self.backend.value_ty,
                    &[self.backend.value_ty],
                    &[arg],
                    false,
                );
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, result);
            }
            Opcode::TempOutputBufferShow => {
                // `comp.c`'s `Btemp_output_buffer_show`: `POP2` gives
                // `(a, b)` with `b` the top; `temp_output_buffer_show` is
                // called on `b` alone and discarded, `a` is pushed back as
                // the net result of the pop-2/push-1, and `helper_unbind_n`
                // is then called on that same `a` value (also discarded).
                let (a, b) = self.meta_stack.pop2()?;
                let _ = self.backend.emit_call(
                    "temp_output_buffer_show",
                    self.backend.ctx.new_type::<()>(),
                    &[self.backend.value_ty],
                    &[b.lvalue.to_rvalue()],
                    false,
                );
                let a_value = a.lvalue.to_rvalue();
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, a_value);
                let _ = self.backend.emit_call(
                    "helper_unbind_n",
                    self.backend.value_ty,
                    &[self.backend.value_ty],
                    &[a_value],
                    false,
                );
            }

            /***** Predicate -> bool -> value *****/
            Opcode::Consp => {
                let obj = self.meta_stack.pop1()?.lvalue.to_rvalue();
                let bool_ty = self.backend.ctx.new_type::<bool>();
                let consp = self.backend.emit_call("consp", bool_ty, &[self.backend.value_ty], &[obj], false);
                let result = self.backend.ctx.new_call(None, self.inline_prims.bool_to_lisp_obj, &[consp]);
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, result);
            }
            Opcode::Numberp | Opcode::Integerp => {
                let name = if op == Opcode::Numberp { "numberp" } else { "integerp" };
                let obj = self.meta_stack.pop1()?.lvalue.to_rvalue();
                let bool_ty = self.backend.ctx.new_type::<bool>();
                let is_a = self.backend.emit_call(name, bool_ty, &[self.backend.value_ty], &[obj], false);
                let result = self.backend.ctx.new_call(None, self.inline_prims.bool_to_lisp_obj, &[is_a]);
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, result);
            }

            /***** Constant *****/
            Opcode::Constant(k) => {
                let value = self.load_constant_rvalue(block, k)?;
                let dest_lvalue = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest_lvalue, value);
                if let Some(name) = self.symbol_name(k)? {
                    self.meta_stack.mark_top_constant_symbol(name);
                }
            }

            /***** Switch *****/
            Opcode::Switch => {
                return Err(CompileError::malformed(
                    pc,
                    "Bswitch encountered outside the constant-pool lookahead pattern",
                ));
            }

            /***** Throw (non-local exit through the handler chain) *****/
            Opcode::Throw => {
                let (value, tag) = self.meta_stack.pop2()?;
                let _ = self.backend.emit_call(
                    "Fthrow",
                    self.backend.value_ty,
                    &[self.backend.value_ty, self.backend.value_ty],
                    &[tag.lvalue.to_rvalue(), value.lvalue.to_rvalue()],
                    false,
                );
            }

            /***** Flat CASE_CALL_N primitives *****/
            Opcode::CaseCallN { name, arity } => {
                let args = self.meta_stack.popn(usize::from(arity))?;
                let arg_rvalues: Vec<RValue> = args.iter().map(|slot| slot.lvalue.to_rvalue()).collect();
                let param_tys = vec![self.backend.value_ty; usize::from(arity)];
                let c_name = format!("F{}", name);
                let result = self.backend.emit_call(&c_name, self.backend.value_ty, &param_tys, &arg_rvalues, false);
                let dest = self.meta_stack.push_plain()?.clone();
                block.add_assignment(None, dest, result);
            }
        }

        Ok(())
    }

    fn load_constant_rvalue(&mut self, _block: Block, index: u16) -> CompileResult<RValue> {
        let _ = self.constants.get(usize::from(index)).ok_or_else(|| {
            CompileError::shape(format!("constant index {} out of range", index))
        })?;
        // The constants vector itself is host-owned memory (read-only to
        // us); we model "load constant k" as a call into a host accessor
        // rather than inventing a constant-pool representation of our own.
        let idx_ty = self.backend.ctx.new_type::<i64>();
        let idx = self.backend.ctx.new_rvalue_from_long(idx_ty, i64::from(index));
        Ok(self
            .backend
            .emit_call("compiled_function_constant", self.backend.value_ty, &[idx_ty], &[idx], false))
    }

    fn translate_call(&mut self, block: Block, k: u16) -> CompileResult<()> {
        let mut args = self.meta_stack.popn(usize::from(k) + 1)?;
        let func_slot = args.remove(0);

        if func_slot.const_set {
            if let Some(symbol_name) = &func_slot.symbol_name {
                if symbol_name == self.environ.current_function_name() {
                    trace!("direct self-call to `{}`", symbol_name);
                    let arg_rvalues: Vec<RValue> = args.iter().map(|s| s.lvalue.to_rvalue()).collect();
                    let param_tys = vec![self.backend.value_ty; args.len()];
                    let result = self.backend.emit_call(
                        symbol_name,
                        self.backend.value_ty,
                        &param_tys,
                        &arg_rvalues,
                        false,
                    );
                    let dest = self.meta_stack.push_plain()?.clone();
                    block.add_assignment(None, dest, result);
                    return Ok(());
                }
                if let Some(subr) = self.environ.lookup_fixed_arity_primitive(symbol_name) {
                    if let PrimitiveArity::Fixed(arity) = subr.arity {
                        if usize::from(arity) == args.len() {
                            trace!("direct primitive dispatch to `{}`", subr.c_function_name);
                            let arg_rvalues: Vec<RValue> = args.iter().map(|s| s.lvalue.to_rvalue()).collect();
                            let param_tys = vec![self.backend.value_ty; args.len()];
                            let result = self.backend.emit_call(
                                &subr.c_function_name,
                                self.backend.value_ty,
                                &param_tys,
                                &arg_rvalues,
                                false,
                            );
                            let dest = self.meta_stack.push_plain()?.clone();
                            block.add_assignment(None, dest, result);
                            return Ok(());
                        }
                    }
                }
            }
        }
        warn!("call-site specialization did not fire; falling back to funcall");

        // `func_slot` and `args` are contiguous elements of the meta-stack's
        // backing array (popped in order from the same backing storage the
        // driver allocated, SPEC_FULL.md §4.4), so the address of the
        // function slot is exactly `&stack_base[...]` the way the original's
        // `emit_call_n_ref ("Ffuncall", nargs, stack->gcc_lval)` uses it --
        // no separate argument-marshalling array is needed.
        let ptrdiff_ty = self.backend.ctx.new_type::<i64>();
        let nargs = self
            .backend
            .ctx
            .new_rvalue_from_long(ptrdiff_ty, args.len() as i64 + 1);
        let args_base = func_slot.lvalue.get_address(None);
        let result = self.backend.emit_call(
            "funcall",
            self.backend.value_ty,
            &[ptrdiff_ty, self.backend.pointer_ty],
            &[nargs, args_base],
            true,
        );
        let dest = self.meta_stack.push_plain()?.clone();
        block.add_assignment(None, dest, result);
        Ok(())
    }

    fn translate_push_handler(
        &mut self,
        block: Block,
        block_index: usize,
        op: Opcode,
        target: u16,
        next_pc: usize,
        block_map: &BlockMap,
    ) -> CompileResult<()> {
        let tag = self.meta_stack.pop1()?.lvalue.to_rvalue();
        let kind_value = match op {
            Opcode::PushCatch(_) => 0,
            Opcode::PushConditionCase(_) => 1,
            _ => unreachable!("only called for PushCatch/PushConditionCase"),
        };
        let kind = self.backend.ctx.new_rvalue_from_int(self.backend.ctx.new_type::<i32>(), kind_value);
        let handler = self.backend.emit_call(
            "push_handler",
            self.backend.pointer_ty,
            &[self.backend.value_ty, self.backend.ctx.new_type::<i32>()],
            &[tag, kind],
            false,
        );

        let setjmp_ty = self.backend.ctx.new_type::<i32>();
        let jmp_field_ptr = handler.dereference_field(None, self.abi.handler.jmp);
        let setjmp_result = self.backend.emit_call(
            "setjmp",
            setjmp_ty,
            &[self.backend.pointer_ty],
            &[jmp_field_ptr.to_rvalue()],
            false,
        );

        // Normal-continuation path: stack unchanged, falls through to the
        // instruction immediately after pushcatch/pushconditioncase. Block
        // discovery always marks that PC a leader (§4.1(c)), so its backend
        // block already exists in `self.blocks` -- reusing it here (instead
        // of allocating a fresh block `run`'s outer loop would never visit)
        // is what keeps every block libgccjit knows about reachable and
        // terminated.
        let continue_index = block_map.block_of(next_pc);
        let continue_block = self.blocks[continue_index].backend_block;
        let entry_block = self.func.new_block("handler_entry");

        let zero = self.backend.ctx.new_rvalue_from_int(setjmp_ty, 0);
        let is_normal = self
            .backend
            .ctx
            .new_comparison(None, ComparisonOp::Equals, setjmp_result, zero);
        block.end_with_conditional(None, is_normal, continue_block, entry_block);
        self.blocks[block_index].terminated = true;
        self.record_entry_depth(continue_index, self.meta_stack.depth())?;

        // Handler-entry path: m_handlerlist = c->next; push(c->val); jump
        // to the two-byte immediate's target PC.
        let current_thread = self.backend.emit_call("current_thread_ptr", self.backend.pointer_ty, &[], &[], false);
        let handlerlist_field_ref = current_thread.dereference_field(None, self.abi.thread_state.m_handlerlist);
        let next_handler = handler.dereference_field(None, self.abi.handler.next).to_rvalue();
        entry_block.add_assignment(None, handlerlist_field_ref, next_handler);

        let thrown_value = handler.dereference_field(None, self.abi.handler.val).to_rvalue();
        let dest = self.meta_stack.push_plain()?.clone();
        entry_block.add_assignment(None, dest, thrown_value);

        let target_index = block_map.block_of(target as usize);
        let target_block = self.blocks[target_index].backend_block;
        entry_block.end_with_jump(None, target_block);
        self.record_entry_depth(target_index, self.meta_stack.depth())?;

        Ok(())
    }

    fn translate_incdec(
        &mut self,
        block: Block,
        block_index: usize,
        next_pc: usize,
        block_map: &BlockMap,
        delta: i64,
        slow_path_name: &str,
    ) -> CompileResult<()> {
        let operand = self.meta_stack.top()?.lvalue.to_rvalue();
        let bool_ty = self.backend.ctx.new_type::<bool>();
        let is_fixnum = self.backend.is_fixnum(operand, 0, 0b11, INT0_TAG);
        let unpacked = self.backend.unpack_fixnum(operand);
        let int_ty = self.backend.ctx.new_type::<i64>();
        let boundary = if delta > 0 {
            self.backend.ctx.new_rvalue_from_long(int_ty, MOST_POSITIVE_FIXNUM)
        } else {
            self.backend.ctx.new_rvalue_from_long(int_ty, MOST_NEGATIVE_FIXNUM)
        };
        let at_boundary = self
            .backend
            .ctx
            .new_comparison(None, ComparisonOp::Equals, unpacked, boundary);
        let not_at_boundary = self.backend.ctx.new_unary_op(None, gccjit::UnaryOp::LogicalNegate, bool_ty, at_boundary);
        let takes_fast_path = self
            .backend
            .ctx
            .new_binary_op(None, gccjit::BinaryOp::LogicalAnd, bool_ty, is_fixnum, not_at_boundary);

        let fast_block = self.func.new_block(&format!("{}_fast", slow_path_name));
        let slow_block = self.func.new_block(&format!("{}_slow", slow_path_name));
        // `forces_successor_leader` (§4.1(d)) always marks `next_pc` a block
        // leader for exactly this opcode family, so its backend block is
        // already allocated -- reuse it as the join point instead of
        // allocating one `run`'s outer loop would never reach.
        let join_index = block_map.block_of(next_pc);
        let join_block = self.blocks[join_index].backend_block;

        block.end_with_conditional(None, takes_fast_path, fast_block, slow_block);
        self.blocks[block_index].terminated = true;

        let one = self.backend.ctx.new_rvalue_from_long(int_ty, delta);
        let new_int = self.backend.ctx.new_binary_op(None, gccjit::BinaryOp::Plus, int_ty, unpacked, one);
        let packed = self.backend.pack_fixnum(new_int, INT0_TAG);
        let dest = self.meta_stack.top()?.lvalue;
        fast_block.add_assignment(None, dest, packed);
        fast_block.end_with_jump(None, join_block);

        let slow_result = self.backend.emit_call(slow_path_name, self.backend.value_ty, &[self.backend.value_ty], &[operand], false);
        slow_block.add_assignment(None, dest, slow_result);
        slow_block.end_with_jump(None, join_block);

        self.record_entry_depth(join_index, self.meta_stack.depth())?;
        Ok(())
    }

    /// `(FIXNUMP(TOP) && XFIXNUM(TOP) != MOST_NEGATIVE_FIXNUM ? make_fixnum(-XFIXNUM(TOP)) : Fminus(1, &TOP))`.
    /// Structurally the same two-sibling-block shape as `translate_incdec`,
    /// but the fast path is a unary negation rather than an offset add, and
    /// the only fixnum value that can't be negated in place is the negative
    /// boundary (negating it would overflow), not the positive one.
    fn translate_negate(&mut self, block: Block, block_index: usize, next_pc: usize, block_map: &BlockMap) -> CompileResult<()> {
        let operand = self.meta_stack.top()?.lvalue.to_rvalue();
        let bool_ty = self.backend.ctx.new_type::<bool>();
        let is_fixnum = self.backend.is_fixnum(operand, 0, 0b11, INT0_TAG);
        let unpacked = self.backend.unpack_fixnum(operand);
        let int_ty = self.backend.ctx.new_type::<i64>();
        let boundary = self.backend.ctx.new_rvalue_from_long(int_ty, MOST_NEGATIVE_FIXNUM);
        let at_boundary = self
            .backend
            .ctx
            .new_comparison(None, ComparisonOp::Equals, unpacked, boundary);
        let not_at_boundary = self.backend.ctx.new_unary_op(None, gccjit::UnaryOp::LogicalNegate, bool_ty, at_boundary);
        let takes_fast_path = self
            .backend
            .ctx
            .new_binary_op(None, gccjit::BinaryOp::LogicalAnd, bool_ty, is_fixnum, not_at_boundary);

        let fast_block = self.func.new_block("negate_fast");
        let slow_block = self.func.new_block("negate_slow");
        // `forces_successor_leader` (§4.1(d)) always marks `next_pc` a block
        // leader for exactly this opcode family, so its backend block is
        // already allocated -- reuse it as the join point instead of
        // allocating one `run`'s outer loop would never reach.
        let join_index = block_map.block_of(next_pc);
        let join_block = self.blocks[join_index].backend_block;

        block.end_with_conditional(None, takes_fast_path, fast_block, slow_block);
        self.blocks[block_index].terminated = true;

        let negated = self.backend.ctx.new_unary_op(None, gccjit::UnaryOp::Minus, int_ty, unpacked);
        let packed = self.backend.pack_fixnum(negated, INT0_TAG);
        let dest = self.meta_stack.top()?.lvalue;
        fast_block.add_assignment(None, dest, packed);
        fast_block.end_with_jump(None, join_block);

        let slow_result = self.backend.emit_call("minus", self.backend.value_ty, &[self.backend.value_ty], &[operand], false);
        slow_block.add_assignment(None, dest, slow_result);
        slow_block.end_with_jump(None, join_block);

        self.record_entry_depth(join_index, self.meta_stack.depth())?;
        Ok(())
    }

    fn translate_arithcompare(&mut self, block: Block, op: Opcode) -> CompileResult<()> {
        let (a, b) = self.meta_stack.pop2()?;
        let kind_value: i32 = match op {
            Opcode::EqlSign => 0,
            Opcode::Gtr => 1,
            Opcode::Lss => 2,
            Opcode::Leq => 3,
            Opcode::Geq => 4,
            _ => unreachable!("translate_arithcompare only called for comparison opcodes"),
        };
        let kind = self.backend.ctx.new_rvalue_from_int(self.backend.ctx.new_type::<i32>(), kind_value);
        let result = self.backend.emit_call(
            "arithcompare",
            self.backend.value_ty,
            &[self.backend.value_ty, self.backend.value_ty, self.backend.ctx.new_type::<i32>()],
            &[a.lvalue.to_rvalue(), b.lvalue.to_rvalue(), kind],
            false,
        );
        let dest = self.meta_stack.push_plain()?.clone();
        block.add_assignment(None, dest, result);
        Ok(())
    }

    fn translate_inline_unary(&mut self, block: Block, func: Function) -> CompileResult<()> {
        let arg = self.meta_stack.pop1()?.lvalue.to_rvalue();
        let result = self.backend.ctx.new_call(None, func, &[arg]);
        let dest = self.meta_stack.push_plain()?.clone();
        block.add_assignment(None, dest, result);
        Ok(())
    }

    fn translate_inline_binary(&mut self, block: Block, func: Function) -> CompileResult<()> {
        let (a, b) = self.meta_stack.pop2()?;
        let result = self.backend.ctx.new_call(None, func, &[a.lvalue.to_rvalue(), b.lvalue.to_rvalue()]);
        let dest = self.meta_stack.push_plain()?.clone();
        block.add_assignment(None, dest, result);
        Ok(())
    }

    fn translate_list_n(&mut self, block: Block, n: u16) -> CompileResult<()> {
        let args = self.meta_stack.popn(usize::from(n))?;
        let mut acc = self.nil;
        for slot in args.into_iter().rev() {
            acc = self.backend.emit_call(
                "Fcons",
                self.backend.value_ty,
                &[self.backend.value_ty, self.backend.value_ty],
                &[slot.lvalue.to_rvalue(), acc],
                false,
            );
        }
        let dest = self.meta_stack.push_plain()?.clone();
        block.add_assignment(None, dest, acc);
        Ok(())
    }

    fn translate_conditional_goto(
        &mut self,
        block: Block,
        block_index: usize,
        target_pc: usize,
        next_pc: usize,
        block_map: &BlockMap,
        branch_on_nil: bool,
        else_pop: bool,
    ) -> CompileResult<()> {
        let tos = if else_pop {
            self.meta_stack.top()?.lvalue.to_rvalue()
        } else {
            self.meta_stack.pop1()?.lvalue.to_rvalue()
        };

        let is_nil = self
            .backend
            .ctx
            .new_comparison(None, ComparisonOp::Equals, tos, self.nil);
        let taken = if branch_on_nil { is_nil } else {
            let bool_ty = self.backend.ctx.new_type::<bool>();
            self.backend.ctx.new_unary_op(None, gccjit::UnaryOp::LogicalNegate, bool_ty, is_nil)
        };

        let target_index = block_map.block_of(target_pc);
        let target_block = self.blocks[target_index].backend_block;
        let fallthrough_index = block_map.block_of(next_pc);

        if else_pop {
            // Taking the branch leaves TOS on the stack (it was only
            // peeked); falling through pops it.
            let pop_block = self.func.new_block("elsepop_fallthrough");
            block.end_with_conditional(None, taken, target_block, pop_block);
            self.blocks[block_index].terminated = true;
            self.record_entry_depth(target_index, self.meta_stack.depth())?;

            self.meta_stack.pop1()?;
            let fallthrough_block = self.blocks[fallthrough_index].backend_block;
            pop_block.end_with_jump(None, fallthrough_block);
            self.record_entry_depth(fallthrough_index, self.meta_stack.depth())?;
        } else {
            let fallthrough_block = self.blocks[fallthrough_index].backend_block;
            block.end_with_conditional(None, taken, target_block, fallthrough_block);
            self.blocks[block_index].terminated = true;
            self.record_entry_depth(target_index, self.meta_stack.depth())?;
            self.record_entry_depth(fallthrough_index, self.meta_stack.depth())?;
        }

        Ok(())
    }
}

#[allow(dead_code)]
fn assert_case_call_n_table_nonempty() {
    debug_assert!(!CASE_CALL_N_TABLE.is_empty());
}
