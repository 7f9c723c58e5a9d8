//! The redirector (§4.6): turns a [`Layout`] into concrete bytes — the
//! relocated replacement blocks, the jump-plus-padding patches that
//! overwrite each redirected original block, and the client's injected
//! blobs and padding carried through unchanged.

use crate::address::{ConcreteAddress, SymbolicAddress};
use crate::block::{ConcreteBlock, Layout};
use crate::context::RewriterCtx;
use crate::error::{Diagnostic, RewriteFailure};
use crate::isa::{IsaProvider, Memory};
use log::warn;
use std::collections::HashMap;

/// The fully concretized output of one rewrite: every byte region the
/// client needs to splice into the final image.
pub struct RedirectedProgram<I> {
    /// The client's replacement blocks, concretized and placed at their
    /// assigned address (includes blocks the client left unmodified, which
    /// keep their original address and content).
    pub relocated_blocks: Vec<ConcreteBlock<I>>,
    /// The jump-plus-padding patch overwriting each successfully redirected
    /// original block, keyed by the original block's own (unchanged)
    /// address.
    pub redirect_patches: Vec<ConcreteBlock<I>>,
    /// Padding blocks materializing heap slack nothing ended up reusing.
    pub padding_blocks: Vec<ConcreteBlock<I>>,
    /// Client-supplied code blobs at their assigned address.
    pub injected_blocks: Vec<(ConcreteAddress, Vec<u8>)>,
}

/// Resolve a [`Layout`] into concrete bytes (§4.6).
///
/// For every modified pair, builds a relative jump from the original
/// address to the assigned one; if the original block is too small to hold
/// it, the pair is reported via [`Diagnostic::BlockTooSmallForRedirection`]
/// and left unredirected rather than aborting the whole run — the
/// replacement block still gets placed and concretized, it's simply
/// unreachable until some other collaborator patches the call site some
/// other way.
pub fn redirect<I, Isa, M>(
    ctx: &mut RewriterCtx<'_, Isa, M>,
    layout: Layout<I>,
) -> Result<RedirectedProgram<I>, RewriteFailure>
where
    Isa: IsaProvider<Insn = I>,
    M: Memory,
{
    let mut resolve_map: HashMap<SymbolicAddress, ConcreteAddress> = HashMap::new();
    for pair in &layout.program_block_layout {
        resolve_map.insert(pair.new.block.symbolic_address(), pair.new.assigned);
    }
    for (sym, addr, _) in &layout.injected_block_layout {
        resolve_map.insert(*sym, *addr);
    }
    let resolve = |sym: SymbolicAddress| -> ConcreteAddress {
        *resolve_map
            .get(&sym)
            .expect("every symbolic target was assigned a concrete address during layout")
    };

    let mut relocated_blocks = Vec::with_capacity(layout.program_block_layout.len());
    let mut redirect_patches = Vec::new();

    for pair in layout.program_block_layout {
        let assigned = pair.new.assigned;
        let concretized: Vec<I> = pair
            .new
            .block
            .instructions()
            .iter()
            .map(|tagged| ctx.isa.concretize(ctx.memory, assigned, tagged, &resolve))
            .collect();
        relocated_blocks.push(ConcreteBlock::new(assigned, concretized));

        if !pair.status.is_modified() {
            continue;
        }

        let orig_addr = pair.original.address();
        let orig_size = pair.original.size(ctx.isa);

        let jmp_insns = match ctx.isa.make_relative_jump_to(orig_addr, assigned) {
            Ok(insns) => insns,
            Err(_) => {
                warn!(
                    "block at {} could not be redirected to {}: architecture refused the jump",
                    orig_addr, assigned
                );
                ctx.add_unrelocatable_term();
                continue;
            }
        };

        let jmp_size: u32 = jmp_insns.iter().map(|i| ctx.isa.instruction_size(i)).sum();
        if jmp_size > orig_size {
            ctx.tell(Diagnostic::BlockTooSmallForRedirection {
                orig_size,
                jmp_size,
                orig_addr,
                description: format!(
                    "original block at {} is {} bytes, too small for a {}-byte redirection jump",
                    orig_addr, orig_size, jmp_size
                ),
            });
            continue;
        }

        let mut patch_insns = jmp_insns;
        patch_insns.extend(ctx.isa.make_padding(orig_size - jmp_size));
        redirect_patches.push(ConcreteBlock::new(orig_addr, patch_insns));
        ctx.record_mapping(orig_addr, assigned);
    }

    Ok(RedirectedProgram {
        relocated_blocks,
        redirect_patches,
        padding_blocks: layout.layout_padding_blocks,
        injected_blocks: layout
            .injected_block_layout
            .into_iter()
            .map(|(_, addr, bytes)| (addr, bytes))
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SymbolicInfo;
    use crate::block::{AddressAssignedBlock, BasicBlock, LayoutPair, Status, SymbolicBlock};
    use crate::context::SymbolMap;
    use crate::isa::tests::{StubInsn, StubIsa, StubMemory};
    use crate::isa::{Cond, TaggedInsn};

    fn symblock(sym: u32, orig: u64, insns: Vec<TaggedInsn<StubInsn>>) -> SymbolicBlock<StubInsn> {
        BasicBlock::new(
            SymbolicInfo {
                symbolic: SymbolicAddress::new(sym as usize),
                original: ConcreteAddress::new(orig),
            },
            insns,
        )
    }

    fn ret() -> TaggedInsn<StubInsn> {
        TaggedInsn {
            encoded: StubInsn::Ret {
                cond: Cond::Unconditional,
            },
            target: None,
        }
    }

    fn layout_of(orig_addr: u64, orig_size_nops: usize, assigned: u64) -> Layout<StubInsn> {
        let original = BasicBlock::new(
            ConcreteAddress::new(orig_addr),
            (0..orig_size_nops).map(|_| StubInsn::Nop).collect(),
        );
        let new = symblock(0, orig_addr, vec![ret()]);
        Layout {
            program_block_layout: vec![LayoutPair {
                original,
                new: AddressAssignedBlock {
                    block: new,
                    assigned: ConcreteAddress::new(assigned),
                },
                status: Status::Modified,
            }],
            layout_padding_blocks: Vec::new(),
            injected_block_layout: Vec::new(),
        }
    }

    #[test]
    fn successful_redirection_pads_to_original_size() {
        let isa = StubIsa::default();
        let memory = StubMemory::default();
        let symbols = SymbolMap::new();
        let mut ctx = RewriterCtx::new(&isa, &memory, &symbols);

        let layout = layout_of(0x1000, 20, 0x5000);
        let program = redirect(&mut ctx, layout).unwrap();

        assert_eq!(program.redirect_patches.len(), 1);
        let patch = &program.redirect_patches[0];
        assert_eq!(patch.address(), ConcreteAddress::new(0x1000));
        // jmp (5 bytes) + 15 bytes of padding = original 20-byte size.
        assert_eq!(patch.size(&isa), 20);
        assert_eq!(
            ctx.block_mapping(),
            &[(ConcreteAddress::new(0x1000), ConcreteAddress::new(0x5000))]
        );
    }

    #[test]
    fn too_small_original_is_reported_and_left_unredirected() {
        let isa = StubIsa::default();
        let memory = StubMemory::default();
        let symbols = SymbolMap::new();
        let mut ctx = RewriterCtx::new(&isa, &memory, &symbols);

        // Original block is only 2 bytes (2 NOPs) but the redirection jump
        // needs 5.
        let layout = layout_of(0x1000, 2, 0x5000);
        let program = redirect(&mut ctx, layout).unwrap();

        assert!(program.redirect_patches.is_empty());
        assert_eq!(ctx.small_block_count(), 1);
        assert!(ctx.block_mapping().is_empty());
        // The replacement block is still placed and concretized.
        assert_eq!(program.relocated_blocks.len(), 1);
    }

    #[test]
    fn unmodified_pairs_are_never_patched() {
        let isa = StubIsa::default();
        let memory = StubMemory::default();
        let symbols = SymbolMap::new();
        let mut ctx = RewriterCtx::new(&isa, &memory, &symbols);

        let mut layout = layout_of(0x1000, 20, 0x1000);
        layout.program_block_layout[0].status = Status::Unmodified;
        let program = redirect(&mut ctx, layout).unwrap();

        assert!(program.redirect_patches.is_empty());
        assert_eq!(program.relocated_blocks.len(), 1);
    }
}
