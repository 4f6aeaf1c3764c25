//! The compile-time operand stack (Data Model §3's "Meta-stack slot").
//!
//! Mirrors the small push/pop/peek vocabulary every opcode arm in the
//! translator this crate is grounded on reaches for against its own
//! value stack, extended with the `type`/`const_value` annotations
//! SPEC_FULL.md's meta-stack slot requires for call-site specialization.

use gccjit::LValue;

use crate::value::TagKind;

/// One slot of the meta-stack: which backend lvalue holds the runtime
/// value, plus the optional constant-tracking annotation populated only
/// immediately after a `constant`/`constant2` load and cleared by any other
/// assignment.
#[derive(Clone)]
pub struct MetaSlot {
    pub lvalue: LValue,
    pub const_set: bool,
    pub tag: Option<TagKind>,
    /// The constant's symbol name, when `tag == Some(TagKind::Symbol)`.
    /// Carried directly rather than re-reading it out of a `gccjit::RValue`
    /// because the only use of this data is a name comparison against the
    /// function currently being compiled (§4.2's call-site specialization).
    pub symbol_name: Option<String>,
}

impl MetaSlot {
    pub fn plain(lvalue: LValue) -> Self {
        MetaSlot {
            lvalue,
            const_set: false,
            tag: None,
            symbol_name: None,
        }
    }

    pub fn constant_symbol(lvalue: LValue, symbol_name: impl Into<String>) -> Self {
        MetaSlot {
            lvalue,
            const_set: true,
            tag: Some(TagKind::Symbol),
            symbol_name: Some(symbol_name.into()),
        }
    }
}

/// The operand stack itself. Backed by a fixed array of lvalues allocated
/// once in the function prologue (`max_depth` slots, per SPEC_FULL.md
/// §4.4); `depth` tracks how many of those slots currently hold a live
/// value. Truncating to fewer slots on a block join (Data Model invariant
/// (ii)) is therefore just forgetting annotations, not deallocating
/// anything — the backing lvalues are reused by subsequent pushes.
pub struct MetaStack {
    slots: Vec<MetaSlot>,
    max_depth: usize,
    live: usize,
}

impl MetaStack {
    pub fn new(backing_lvalues: Vec<LValue>) -> Self {
        let max_depth = backing_lvalues.len();
        MetaStack {
            slots: backing_lvalues.into_iter().map(MetaSlot::plain).collect(),
            max_depth,
            live: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.live
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn push(&mut self, slot: MetaSlot) -> crate::error::CompileResult<()> {
        if self.live >= self.max_depth {
            return Err(crate::error::CompileError::shape(format!(
                "meta-stack overflow: depth {} exceeds declared max_depth {}",
                self.live + 1,
                self.max_depth
            )));
        }
        self.slots[self.live] = slot;
        self.live += 1;
        Ok(())
    }

    /// Pushes a fresh, unannotated slot that simply aliases the backing
    /// lvalue at the new top of stack. Used by opcodes that write a value
    /// into the current top slot and advance depth (the common case).
    pub fn push_plain(&mut self) -> crate::error::CompileResult<&LValue> {
        if self.live >= self.max_depth {
            return Err(crate::error::CompileError::shape(format!(
                "meta-stack overflow: depth {} exceeds declared max_depth {}",
                self.live + 1,
                self.max_depth
            )));
        }
        let lvalue = self.slots[self.live].lvalue.clone();
        self.slots[self.live] = MetaSlot::plain(lvalue);
        self.live += 1;
        Ok(&self.slots[self.live - 1].lvalue)
    }

    /// Annotates the current top-of-stack slot as holding a known constant
    /// symbol, without disturbing its backing lvalue. Called immediately
    /// after `constant`/`constant2` loads a symbol value (§4.2); any later
    /// opcode that re-pushes into this slot clears the annotation simply by
    /// calling [`push_plain`](Self::push_plain) again, which always resets
    /// `const_set`.
    pub fn mark_top_constant_symbol(&mut self, symbol_name: impl Into<String>) {
        if let Some(top) = self.slots[..self.live].last_mut() {
            top.const_set = true;
            top.tag = Some(TagKind::Symbol);
            top.symbol_name = Some(symbol_name.into());
        }
    }

    pub fn pop1(&mut self) -> crate::error::CompileResult<MetaSlot> {
        if self.live == 0 {
            return Err(crate::error::CompileError::shape("meta-stack underflow"));
        }
        self.live -= 1;
        Ok(self.slots[self.live].clone())
    }

    pub fn pop2(&mut self) -> crate::error::CompileResult<(MetaSlot, MetaSlot)> {
        let b = self.pop1()?;
        let a = self.pop1()?;
        Ok((a, b))
    }

    pub fn popn(&mut self, n: usize) -> crate::error::CompileResult<Vec<MetaSlot>> {
        if self.live < n {
            return Err(crate::error::CompileError::shape("meta-stack underflow"));
        }
        let start = self.live - n;
        let popped = self.slots[start..self.live].to_vec();
        self.live = start;
        Ok(popped)
    }

    /// Reads the slot `k` positions below the top without removing it
    /// (`stack_ref`'s semantics).
    pub fn peek_from_top(&self, k: usize) -> crate::error::CompileResult<&MetaSlot> {
        if k >= self.live {
            return Err(crate::error::CompileError::shape("stack_ref index out of range"));
        }
        Ok(&self.slots[self.live - 1 - k])
    }

    /// Writes a new slot `k` positions below the *current* top (i.e. after
    /// the `stack_set`/`stack_set2` opcode has already popped its operand),
    /// matching `emit_assign_to_stack_slot(comp.block, stack - op, ...)` in
    /// the original: `stack` there is already the post-pop depth, and `op`
    /// counts down from it, not up from the bottom of the array. `k == 0`
    /// addresses the just-freed slot one past the new top, which is never
    /// read again before something else overwrites it -- equivalent to a
    /// plain discard, and callers should skip the write entirely for that
    /// case rather than relying on it being a harmless no-op.
    pub fn set_relative_to_top(&mut self, k: usize, slot: MetaSlot) -> crate::error::CompileResult<()> {
        if k > self.live {
            return Err(crate::error::CompileError::shape("stack_set index out of range"));
        }
        self.slots[self.live - k] = slot;
        Ok(())
    }

    pub fn top(&self) -> crate::error::CompileResult<&MetaSlot> {
        self.peek_from_top(0)
    }

    /// Carries `preserved`'s annotations onto the slot that is already the
    /// current top (after the caller's own pop/discard sequence), without
    /// changing `depth()`. Returns the physical backing lvalue the caller
    /// must emit an assignment into, since `preserved` lived in a different
    /// array slot before the discard and its value needs physically moving,
    /// not just the bookkeeping. Used by `discardN`'s preserve-TOS form
    /// (SPEC_FULL.md §4.2), which replaces the exposed top in place rather
    /// than pushing a new slot.
    pub fn replace_top(&mut self, preserved: MetaSlot) -> crate::error::CompileResult<LValue> {
        if self.live == 0 {
            return Err(crate::error::CompileError::shape(
                "discardN preserve-tos: nothing left to preserve into",
            ));
        }
        let idx = self.live - 1;
        let dest_lvalue = self.slots[idx].lvalue.clone();
        self.slots[idx] = MetaSlot {
            lvalue: dest_lvalue.clone(),
            const_set: preserved.const_set,
            tag: preserved.tag,
            symbol_name: preserved.symbol_name,
        };
        Ok(dest_lvalue)
    }

    /// Truncates to a previously recorded entry depth, per Data Model
    /// invariant (ii): on entry to a block reached by a jump, the
    /// meta-stack is restored to the depth recorded when that edge was
    /// created.
    pub fn truncate_to(&mut self, depth: usize) -> crate::error::CompileResult<()> {
        if depth > self.live {
            return Err(crate::error::CompileError::shape(format!(
                "cannot grow meta-stack on block entry: have {}, want {}",
                self.live, depth
            )));
        }
        self.live = depth;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gccjit::{Context, FunctionType};

    /// Builds a throwaway function with `depth` locals to use as the
    /// meta-stack's backing array -- enough to exercise the bookkeeping in
    /// this module without a full compilation driving it.
    fn backing_lvalues(ctx: &Context, depth: usize) -> Vec<LValue> {
        let value_ty = ctx.new_type::<i64>();
        let func = ctx.new_function(None, FunctionType::Internal, value_ty, &[], "scratch", false);
        (0..depth).map(|i| func.new_local(None, value_ty, &format!("slot{}", i))).collect()
    }

    #[test]
    fn push_pop_tracks_depth() {
        let ctx = Context::default();
        let mut stack = MetaStack::new(backing_lvalues(&ctx, 4));
        assert_eq!(stack.depth(), 0);
        stack.push_plain().unwrap();
        stack.push_plain().unwrap();
        assert_eq!(stack.depth(), 2);
        stack.pop1().unwrap();
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn push_beyond_max_depth_overflows() {
        let ctx = Context::default();
        let mut stack = MetaStack::new(backing_lvalues(&ctx, 1));
        stack.push_plain().unwrap();
        assert!(stack.push_plain().is_err());
    }

    #[test]
    fn pop_from_empty_stack_underflows() {
        let ctx = Context::default();
        let mut stack = MetaStack::new(backing_lvalues(&ctx, 2));
        assert!(stack.pop1().is_err());
    }

    #[test]
    fn peek_from_top_addresses_relative_to_top() {
        let ctx = Context::default();
        let mut stack = MetaStack::new(backing_lvalues(&ctx, 4));
        stack.push_plain().unwrap();
        stack.push_plain().unwrap();
        stack.push_plain().unwrap();
        assert!(stack.peek_from_top(0).is_ok());
        assert!(stack.peek_from_top(2).is_ok());
        assert!(stack.peek_from_top(3).is_err());
    }

    #[test]
    fn truncate_to_cannot_grow_the_stack() {
        let ctx = Context::default();
        let mut stack = MetaStack::new(backing_lvalues(&ctx, 4));
        stack.push_plain().unwrap();
        assert!(stack.truncate_to(2).is_err());
        stack.push_plain().unwrap();
        stack.truncate_to(1).unwrap();
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn mark_top_constant_symbol_annotates_only_the_top_slot() {
        let ctx = Context::default();
        let mut stack = MetaStack::new(backing_lvalues(&ctx, 2));
        stack.push_plain().unwrap();
        stack.mark_top_constant_symbol("my-func");
        let top = stack.top().unwrap();
        assert!(top.const_set);
        assert_eq!(top.symbol_name.as_deref(), Some("my-func"));
    }

    #[test]
    fn set_relative_to_top_addresses_the_post_pop_depth() {
        // Matches `emit_assign_to_stack_slot(comp.block, stack - op, ...)`
        // in comp.c: `stack` there is already the post-pop depth, so `k`
        // counts down from the new top, not up from the array's bottom.
        // Slots are tagged with distinct symbol names (rather than
        // compared by backing lvalue) purely so this test can tell them
        // apart after the rewrite.
        let ctx = Context::default();
        let lvalues = backing_lvalues(&ctx, 4);
        let mut stack = MetaStack::new(lvalues.clone());
        stack.push(MetaSlot::constant_symbol(lvalues[0].clone(), "a")).unwrap();
        stack.push(MetaSlot::constant_symbol(lvalues[1].clone(), "b")).unwrap();
        stack.push(MetaSlot::constant_symbol(lvalues[2].clone(), "c")).unwrap();

        // stack_set 1: pop TOS ("c"), then write into the slot 1 below the
        // new (post-pop) top -- i.e. the slot currently holding "a".
        let popped = stack.pop1().unwrap();
        assert_eq!(popped.symbol_name.as_deref(), Some("c"));
        stack.set_relative_to_top(1, popped).unwrap();

        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.peek_from_top(1).unwrap().symbol_name.as_deref(), Some("c"));
        assert_eq!(stack.peek_from_top(0).unwrap().symbol_name.as_deref(), Some("b"));
    }

    #[test]
    fn replace_top_overwrites_the_post_discard_top_without_growing_depth() {
        let ctx = Context::default();
        let lvalues = backing_lvalues(&ctx, 4);
        let mut stack = MetaStack::new(lvalues.clone());
        stack.push(MetaSlot::constant_symbol(lvalues[0].clone(), "a")).unwrap();
        stack.push(MetaSlot::constant_symbol(lvalues[1].clone(), "b")).unwrap();
        stack.push(MetaSlot::constant_symbol(lvalues[2].clone(), "c")).unwrap();

        // discardN count=1, preserve_tos=true starting from depth 3:
        // pop TOS ("c", depth 2), discard 1 more ("b", depth 1), then the
        // saved value replaces the new top in place -- final depth stays
        // 1, not 2, and the surviving slot now holds "c".
        let preserved = stack.pop1().unwrap();
        stack.popn(1).unwrap();
        stack.replace_top(preserved).unwrap();

        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top().unwrap().symbol_name.as_deref(), Some("c"));
    }
}
