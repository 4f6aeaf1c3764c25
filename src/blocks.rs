//! Basic-block discovery (SPEC_FULL.md §4.1): a single forward linear scan
//! over the bytecode that identifies block-leader PCs, followed by a
//! sort/dedup/sweep pass assigning every PC to the most recent leader.
//!
//! Grounded on `compute_blocks` in the original source. See DESIGN.md's
//! Open Question #1 decision for why this crate's relative-branch target
//! arithmetic agrees with the emitter's instead of reproducing the
//! original's discovery/emission discrepancy.

use log::debug;

use crate::error::CompileResult;
use crate::opcodes::{decode, Opcode};

/// Result of discovery: a PC→block-index map plus the sorted, deduplicated
/// leader list (block `i` begins at `leaders[i]`).
pub struct BlockMap {
    pub leaders: Vec<usize>,
    pc_to_block: Vec<usize>,
}

impl BlockMap {
    pub fn block_of(&self, pc: usize) -> usize {
        self.pc_to_block[pc]
    }

    pub fn is_leader(&self, pc: usize) -> bool {
        self.leaders.binary_search(&pc).is_ok()
    }
}

/// Opcodes that invalidate the compile-time operand stack's known-value
/// tracking and so force a fresh block boundary after them, per §4.1(d).
fn forces_successor_leader(op: &Opcode) -> bool {
    matches!(op, Opcode::Sub1 | Opcode::Add1 | Opcode::Negate | Opcode::Return)
}

pub fn discover_blocks(bytecode: &[u8]) -> CompileResult<BlockMap> {
    let mut leaders: Vec<usize> = vec![0];
    let mut pc = 0usize;

    while pc < bytecode.len() {
        let (op, next_pc) = decode(bytecode, pc)?;

        match op {
            Opcode::Goto(target)
            | Opcode::GotoIfNil(target)
            | Opcode::GotoIfNonNil(target)
            | Opcode::GotoIfNilElsePop(target)
            | Opcode::GotoIfNonNilElsePop(target)
            | Opcode::PushCatch(target)
            | Opcode::PushConditionCase(target) => {
                leaders.push(target as usize);
                leaders.push(next_pc);
            }
            Opcode::BrGoto(target)
            | Opcode::BrGotoIfNil(target)
            | Opcode::BrGotoIfNonNil(target)
            | Opcode::BrGotoIfNilElsePop(target)
            | Opcode::BrGotoIfNonNilElsePop(target) => {
                if target < 0 || target as usize > bytecode.len() {
                    return Err(crate::error::CompileError::malformed(
                        pc,
                        format!("relative branch target {} out of range", target),
                    ));
                }
                leaders.push(target as usize);
                leaders.push(next_pc);
            }
            _ if forces_successor_leader(&op) => {
                leaders.push(next_pc);
            }
            _ => {}
        }

        pc = next_pc;
    }

    leaders.retain(|&pc| pc <= bytecode.len());
    leaders.sort_unstable();
    leaders.dedup();

    debug!("discovered {} block leaders: {:?}", leaders.len(), leaders);

    // Sized to `bytecode.len() + 1`, not `bytecode.len()`: branch targets
    // are looked up by PC-past-the-last-instruction when a branch is the
    // final opcode in the stream (e.g. a `pushcatch`'s fall-through when
    // nothing follows it but its own handler block), so `block_of` must
    // stay in bounds at that sentinel index too.
    let mut pc_to_block = vec![0usize; bytecode.len() + 1];
    let mut block_index = 0usize;
    for pc in 0..=bytecode.len() {
        if block_index + 1 < leaders.len() && leaders[block_index + 1] == pc {
            block_index += 1;
        }
        pc_to_block[pc] = block_index;
    }

    Ok(BlockMap { leaders, pc_to_block })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_block_with_no_branches() {
        // constant 0 ; return
        let bytecode = [0x60, 0x00, 0x4e];
        let map = discover_blocks(&bytecode).unwrap();
        assert_eq!(map.leaders, vec![0]);
    }

    #[test]
    fn goto_creates_a_leader_at_its_target_and_successor() {
        // goto 5 ; add1 ; return ; constant 0 ; return
        let bytecode = [0x44, 0x05, 0x00, 0x34, 0x4e, 0x60, 0x00, 0x4e];
        let map = discover_blocks(&bytecode).unwrap();
        assert!(map.is_leader(0));
        assert!(map.is_leader(3)); // instruction after goto
        assert!(map.is_leader(5)); // goto's target
    }

    #[test]
    fn relative_branch_target_matches_emission_arithmetic() {
        // BRgoto +2 ; constant 0 ; return ; constant 1 ; return
        // displacement byte 130 => byte-128 == 2, target = pc_after_immediate + 2
        let bytecode = [0x49, 130, 0x60, 0x00, 0x4e, 0x60, 0x01, 0x4e];
        let map = discover_blocks(&bytecode).unwrap();
        // pc_after_immediate for the BrGoto at pc=0 is 2; target = 2 + 2 = 4
        assert!(map.is_leader(4));
    }

    #[test]
    fn sub1_add1_negate_return_force_a_successor_leader() {
        // dup ; add1 ; return
        let bytecode = [0x50, 0x34, 0x4e];
        let map = discover_blocks(&bytecode).unwrap();
        assert!(map.is_leader(2)); // pc after add1
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let bytecode = [0xff];
        assert!(discover_blocks(&bytecode).is_err());
    }
}
