//! The fallthrough reifier (§4.2).
//!
//! The allocator is about to relocate blocks arbitrarily, so implicit
//! "control falls into the next address" semantics must be made explicit
//! before layout. This mirrors `cranelift-codegen`'s own
//! `binemit::relaxation::fallthroughs` pass, which runs immediately before
//! branch relaxation for the same reason — except here the transform runs
//! in the opposite direction: cranelift turns `jump succ` into an implicit
//! fallthrough once it knows the final layout, while this pass turns an
//! implicit fallthrough into an explicit `jump succ` before the layout is
//! known, because the upcoming reordering would otherwise sever it.

use crate::address::SymbolicAddress;
use crate::block::{LayoutPair, Status, SymbolicBlock};
use crate::error::RewriteError;
use crate::isa::IsaProvider;
use log::trace;
use std::collections::HashMap;

/// Maps each symbolic block to its program-order successor, built from the
/// client-supplied iteration order over all new symbolic blocks (modified
/// and unmodified alike — a block's successor may not itself be modified).
struct ProgramOrderIndex {
    successor: HashMap<SymbolicAddress, SymbolicAddress>,
}

impl ProgramOrderIndex {
    fn build<'a, I: 'a>(all_new_blocks: impl Iterator<Item = &'a SymbolicBlock<I>>) -> Self {
        let mut successor = HashMap::new();
        let mut prev: Option<SymbolicAddress> = None;
        for block in all_new_blocks {
            if let Some(p) = prev {
                successor.insert(p, block.symbolic_address());
            }
            prev = Some(block.symbolic_address());
        }
        ProgramOrderIndex { successor }
    }

    fn successor_of(&self, addr: SymbolicAddress) -> Option<SymbolicAddress> {
        self.successor.get(&addr).copied()
    }
}

/// Append an explicit unconditional jump to every modified block whose
/// terminator isn't already unconditional.
///
/// `all_new_blocks_in_order` must be the full, client-ordered sequence of
/// every new symbolic block (modified and unmodified) — it is used only to
/// build the program-order successor index, per the public-contract Open
/// Question in §9: "the source's 'program order' for fallthrough successors
/// uses the iteration order of the input container."
pub fn reify_fallthroughs<I, Isa: IsaProvider<Insn = I>>(
    isa: &Isa,
    modified_pairs: &mut [LayoutPair<I, SymbolicBlock<I>>],
    all_new_blocks_in_order: &[SymbolicBlock<I>],
) -> Result<(), RewriteError> {
    let index = ProgramOrderIndex::build(all_new_blocks_in_order.iter());

    for pair in modified_pairs.iter_mut() {
        debug_assert_eq!(pair.status, Status::Modified);
        let needs_fallthrough = {
            let last = pair
                .new
                .instructions()
                .last()
                .expect("a basic block is never empty");
            !isa.tagged_jump_type(last).is_unconditional()
        };

        if !needs_fallthrough {
            continue;
        }

        let successor = index.successor_of(pair.new.symbolic_address()).ok_or(
            RewriteError::MissingSuccessor(pair.new.original_address()),
        )?;

        trace!(
            "block originally at {} falls through; appending jump to successor",
            pair.new.original_address()
        );

        for jump_insn in isa.make_symbolic_jump(successor) {
            pair.new.push(jump_insn);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{ConcreteAddress, SymbolicInfo};
    use crate::block::BasicBlock;
    use crate::isa::tests::{StubInsn, StubIsa};
    use crate::isa::{Cond, TaggedInsn};

    fn symblock(sym: u32, orig: u64, insns: Vec<TaggedInsn<StubInsn>>) -> SymbolicBlock<StubInsn> {
        BasicBlock::new(
            SymbolicInfo {
                symbolic: crate::address::SymbolicAddress::new(sym as usize),
                original: ConcreteAddress::new(orig),
            },
            insns,
        )
    }

    fn nop() -> TaggedInsn<StubInsn> {
        TaggedInsn {
            encoded: StubInsn::Nop,
            target: None,
        }
    }

    #[test]
    fn appends_jump_when_block_falls_through() {
        let isa = StubIsa::default();
        let b0 = symblock(0, 0x100, vec![nop()]);
        let b1 = symblock(1, 0x110, vec![nop()]);
        let all = vec![
            symblock(0, 0x100, vec![nop()]),
            symblock(1, 0x110, vec![nop()]),
        ];
        let mut modified = vec![LayoutPair {
            original: BasicBlock::new(ConcreteAddress::new(0x100), vec![StubInsn::Nop]),
            new: b0,
            status: Status::Modified,
        }];
        let _ = b1;

        reify_fallthroughs(&isa, &mut modified, &all).unwrap();

        let last = modified[0].new.instructions().last().unwrap();
        assert!(isa.tagged_jump_type(last).is_unconditional());
        assert_eq!(
            isa.tagged_jump_type(last),
            crate::isa::JumpType::RelativeJump {
                cond: Cond::Unconditional,
                target: crate::address::SymbolicAddress::new(1),
                offset: 0,
            }
        );
    }

    #[test]
    fn leaves_unconditional_terminator_untouched() {
        let isa = StubIsa::default();
        let ret = TaggedInsn {
            encoded: StubInsn::Ret {
                cond: Cond::Unconditional,
            },
            target: None,
        };
        let b0 = symblock(0, 0x100, vec![ret.clone()]);
        let all = vec![symblock(0, 0x100, vec![ret.clone()])];
        let mut modified = vec![LayoutPair {
            original: BasicBlock::new(ConcreteAddress::new(0x100), vec![StubInsn::Ret {
                cond: Cond::Unconditional,
            }]),
            new: b0,
            status: Status::Modified,
        }];

        reify_fallthroughs(&isa, &mut modified, &all).unwrap();
        assert_eq!(modified[0].new.instructions().len(), 1);
    }

    #[test]
    fn missing_successor_is_fatal() {
        let isa = StubIsa::default();
        let b0 = symblock(0, 0x100, vec![nop()]);
        let all = vec![symblock(0, 0x100, vec![nop()])];
        let mut modified = vec![LayoutPair {
            original: BasicBlock::new(ConcreteAddress::new(0x100), vec![StubInsn::Nop]),
            new: b0,
            status: Status::Modified,
        }];

        let err = reify_fallthroughs(&isa, &mut modified, &all).unwrap_err();
        assert_eq!(err, RewriteError::MissingSuccessor(ConcreteAddress::new(0x100)));
    }
}
