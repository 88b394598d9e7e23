//! Control-flow graph reconstruction
//!
//! Splits a flat instruction stream into basic blocks. A block starts at
//! offset 0, at every jump target and right after every instruction that
//! ends a block. The resulting [`BlockMap`] keeps blocks in fall-through
//! order and is generic over the block handle so it can be built without a
//! backend.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use xpy_bytecode::{CodeUnit, INSTRUCTION_SIZE, Opcode, Operand};

use crate::error::{JitError, Result};
use crate::translator::is_supported_opcode;

/// Whether `opcode` ends its basic block.
pub fn is_block_terminator(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::ReturnValue
            | Opcode::JumpAbsolute
            | Opcode::JumpForward
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::SetupLoop
            | Opcode::BreakLoop
    )
}

/// Collect every jump target, checking that each opcode has a handler and
/// each target lands on an instruction.
pub fn jump_targets(code: &CodeUnit) -> Result<BTreeSet<u32>> {
    let code_len = code.code_len();
    let mut targets = BTreeSet::new();
    for instruction in &code.instructions {
        if !is_supported_opcode(instruction.opcode) {
            return Err(JitError::UnsupportedInstruction {
                offset: instruction.offset,
                opcode: instruction.opcode,
            });
        }
        let target = match (instruction.jump_target(), &instruction.operand) {
            (Some(target), _) => target,
            (None, Operand::Delta(delta)) => instruction.offset.saturating_add(*delta),
            (None, _) => continue,
        };
        if code.instruction_at(target).is_none() {
            return Err(JitError::InvalidJumpTarget {
                offset: instruction.offset,
                target,
                code_len,
            });
        }
        targets.insert(target);
    }
    Ok(targets)
}

/// Ordered mapping from block start offset to block handle.
#[derive(Debug, Clone)]
pub struct BlockMap<B> {
    blocks: IndexMap<u32, B>,
}

impl<B> Default for BlockMap<B> {
    fn default() -> Self {
        Self {
            blocks: IndexMap::new(),
        }
    }
}

impl<B: Copy> BlockMap<B> {
    /// Block starting at `offset`
    pub fn get(&self, offset: u32) -> Option<B> {
        self.blocks.get(&offset).copied()
    }

    /// Whether a block starts at `offset`
    pub fn starts_block(&self, offset: u32) -> bool {
        self.blocks.contains_key(&offset)
    }

    /// Block at position `index` in fall-through order
    pub fn at(&self, index: usize) -> Option<(u32, B)> {
        self.blocks.get_index(index).map(|(offset, block)| (*offset, *block))
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether there are no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block start offsets in fall-through order
    pub fn offsets(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks.keys().copied()
    }

    /// Forward-only cursor positioned on the first block
    pub fn cursor(&self) -> BlockCursor {
        BlockCursor { next: 0 }
    }
}

/// Single forward pass over a [`BlockMap`]; no block is visited twice.
#[derive(Debug, Default)]
pub struct BlockCursor {
    next: usize,
}

impl BlockCursor {
    /// Take the next block, or `None` once every block was consumed
    pub fn next_block<B: Copy>(&mut self, map: &BlockMap<B>) -> Option<(u32, B)> {
        let block = map.at(self.next)?;
        self.next += 1;
        Some(block)
    }

    /// Number of blocks consumed so far
    pub fn consumed(&self) -> usize {
        self.next
    }
}

/// Partition `code` into blocks, creating each handle with `make_block`.
pub fn build_block_map<B>(
    code: &CodeUnit,
    mut make_block: impl FnMut(u32) -> B,
) -> Result<BlockMap<B>> {
    let targets = jump_targets(code)?;
    let mut blocks = IndexMap::new();
    blocks.insert(0, make_block(0));

    let mut previous: Option<Opcode> = None;
    for instruction in &code.instructions {
        let offset = instruction.offset;
        let opens = targets.contains(&offset) || previous.is_some_and(is_block_terminator);
        if opens && !blocks.contains_key(&offset) {
            blocks.insert(offset, make_block(offset));
        }
        previous = Some(instruction.opcode);
    }

    debug_assert!(blocks.keys().all(|offset| offset % INSTRUCTION_SIZE == 0));
    Ok(BlockMap { blocks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use xpy_bytecode::assemble;

    fn offsets(code: &CodeUnit) -> Vec<u32> {
        build_block_map(code, |offset| offset)
            .unwrap()
            .offsets()
            .collect()
    }

    #[test]
    fn test_straight_line_is_one_block() {
        let code = assemble("f", "LOAD_CONST 1\nLOAD_CONST 2\nBINARY_ADD\nRETURN_VALUE").unwrap();
        assert_eq!(offsets(&code), vec![0]);
    }

    #[test]
    fn test_if_else() {
        let code = assemble(
            "f",
            "
            .args a
                LOAD_FAST a
                POP_JUMP_IF_FALSE else
                LOAD_CONST 1
                RETURN_VALUE
            else:
                LOAD_CONST 2
                RETURN_VALUE
            ",
        )
        .unwrap();
        assert_eq!(offsets(&code), vec![0, 4, 8]);
    }

    #[test]
    fn test_target_and_post_terminator_share_a_block() {
        let code = assemble(
            "f",
            "
                JUMP_FORWARD next
            next:
                LOAD_CONST None
                RETURN_VALUE
            ",
        )
        .unwrap();
        assert_eq!(offsets(&code), vec![0, 2]);
    }

    #[test]
    fn test_loop_blocks() {
        let code = assemble(
            "f",
            "
            .args n
                SETUP_LOOP done
            top:
                LOAD_FAST n
                POP_JUMP_IF_FALSE out
                BREAK_LOOP
                JUMP_ABSOLUTE top
            out:
                POP_BLOCK
            done:
                LOAD_FAST n
                RETURN_VALUE
            ",
        )
        .unwrap();
        // 0 entry, 2 loop head, 6 after the conditional, 8 after BREAK_LOOP,
        // 10 exit of the condition, 12 loop exit
        assert_eq!(offsets(&code), vec![0, 2, 6, 8, 10, 12]);
    }

    #[test]
    fn test_unsupported_opcode() {
        let code = assemble("f", "LOAD_CONST 1\nUNARY_NEGATIVE\nRETURN_VALUE").unwrap();
        let err = build_block_map(&code, |o| o).unwrap_err();
        assert!(matches!(
            err,
            JitError::UnsupportedInstruction {
                offset: 2,
                opcode: Opcode::UnaryNegative
            }
        ));
    }

    #[test]
    fn test_invalid_jump_target() {
        let code = CodeUnit::builder("f")
            .instruction(Opcode::JumpAbsolute, Operand::Target(3))
            .op(Opcode::ReturnValue)
            .build();
        let err = build_block_map(&code, |o| o).unwrap_err();
        assert!(matches!(
            err,
            JitError::InvalidJumpTarget {
                offset: 0,
                target: 3,
                code_len: 4
            }
        ));

        let past_end = CodeUnit::builder("f")
            .instruction(Opcode::JumpAbsolute, Operand::Target(4))
            .op(Opcode::ReturnValue)
            .build();
        assert!(build_block_map(&past_end, |o| o).is_err());

        let wrapping = CodeUnit::builder("f")
            .op(Opcode::Nop)
            .instruction(Opcode::JumpForward, Operand::Delta(u32::MAX))
            .op(Opcode::ReturnValue)
            .build();
        let err = build_block_map(&wrapping, |o| o).unwrap_err();
        assert!(matches!(
            err,
            JitError::InvalidJumpTarget {
                offset: 2,
                target: u32::MAX,
                code_len: 6
            }
        ));
    }

    #[test]
    fn test_cursor_is_forward_only() {
        let code = assemble(
            "f",
            "LOAD_CONST 1\nPOP_JUMP_IF_TRUE t\nLOAD_CONST 2\nRETURN_VALUE\nt:\nLOAD_CONST 3\nRETURN_VALUE",
        )
        .unwrap();
        let map = build_block_map(&code, |o| o).unwrap();
        let mut cursor = map.cursor();
        assert_eq!(cursor.next_block(&map), Some((0, 0)));
        assert_eq!(cursor.next_block(&map), Some((4, 4)));
        assert_eq!(cursor.next_block(&map), Some((8, 8)));
        assert_eq!(cursor.next_block(&map), None);
        assert_eq!(cursor.consumed(), 3);
    }

    fn arbitrary_code() -> impl Strategy<Value = CodeUnit> {
        (1usize..40)
            .prop_flat_map(|len| proptest::collection::vec((0u8..6, 0..len), len))
            .prop_map(|ops| {
                let mut builder = CodeUnit::builder("p");
                for (i, (op, target)) in ops.into_iter().enumerate() {
                    let target = target as u32 * INSTRUCTION_SIZE;
                    let offset = i as u32 * INSTRUCTION_SIZE;
                    let (opcode, operand) = match op {
                        0 => (Opcode::Nop, Operand::None),
                        1 => (Opcode::ReturnValue, Operand::None),
                        2 => (Opcode::JumpAbsolute, Operand::Target(target)),
                        3 => (Opcode::PopJumpIfFalse, Operand::Target(target)),
                        4 if target > offset => {
                            (Opcode::JumpForward, Operand::Delta(target - offset))
                        }
                        _ => (Opcode::PopTop, Operand::None),
                    };
                    builder = builder.instruction(opcode, operand);
                }
                builder.build()
            })
    }

    proptest! {
        #[test]
        fn prop_block_count(code in arbitrary_code()) {
            let targets = jump_targets(&code).unwrap();
            let mut post_terminator = BTreeSet::new();
            for pair in code.instructions.windows(2) {
                if is_block_terminator(pair[0].opcode) {
                    post_terminator.insert(pair[1].offset);
                }
            }
            let mut starts: BTreeSet<u32> = targets.clone();
            starts.insert(0);
            let extra = post_terminator.difference(&starts).count();

            let expected = 1 + targets.iter().filter(|t| **t != 0).count() + extra;
            let map = build_block_map(&code, |o| o).unwrap();
            prop_assert_eq!(map.len(), expected);

            let listed: Vec<u32> = map.offsets().collect();
            let mut sorted = listed.clone();
            sorted.sort_unstable();
            prop_assert_eq!(listed, sorted);
        }
    }
}
