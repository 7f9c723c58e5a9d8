//! The layout driver (§4.3–§4.5): loop-aware grouping, allocation, and
//! final [`Layout`] assembly.
//!
//! `compact_layout` is the one public entry point that ties every other
//! module together, the same role `Context::compile` plays for
//! `cranelift-codegen`'s own pass pipeline (`regalloc/context.rs`): a fixed
//! sequence of passes run in order over one mutable [`RewriterCtx`].

use crate::address::{ConcreteAddress, SymbolicAddress};
use crate::block::{
    AddressAssignedBlock, ConcreteBlock, InjectedCode, Layout, LayoutPair, Status, SymbolicBlock,
};
use crate::context::RewriterCtx;
use crate::error::{Diagnostic, RewriteError};
use crate::fallthrough::reify_fallthroughs;
use crate::heap::{AddressHeap, Allocator};
use crate::isa::{IsaProvider, Memory};
use crate::loop_cluster::{compute_loop_classes, SymbolicCfg};
use log::debug;
use std::collections::{HashMap, HashSet};

/// Whether blocks sharing a loop should be kept contiguous (§4.3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoopStrategy {
    /// Relocate every unmodified block that shares a loop with a modified
    /// one, so the whole loop body lays out contiguously.
    KeepLoopBlocksTogether,
    /// Each modified block is its own group regardless of loop membership.
    IgnoreLoops,
}

/// Ordering applied to groups competing for the fresh region and the
/// address heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortOrder {
    /// Largest group first, ties broken by lowest original address.
    Sorted,
    /// Shuffled by a client-supplied seed — see [`XorShiftRng`] below for
    /// why this isn't `rand::seq::SliceRandom::shuffle`.
    Random(Vec<u32>),
}

/// The overall placement strategy (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutStrategy {
    /// Ignore all existing slack and place every group in the fresh region,
    /// in the order groups were formed. Afterwards every byte of slack from
    /// every redirected original block becomes a padding block — nothing is
    /// reused, trading code density for avoiding any dependency between a
    /// new block's placement and where its sibling's original bytes were.
    Parallel(LoopStrategy),
    /// Reuse heap slack from redirected blocks preferentially, trying
    /// groups in the given order.
    Compact(SortOrder, LoopStrategy),
}

impl LayoutStrategy {
    fn loop_strategy(&self) -> LoopStrategy {
        match self {
            LayoutStrategy::Parallel(l) | LayoutStrategy::Compact(_, l) => *l,
        }
    }
}

/// A small deterministic xorshift128+ generator seeded from a client-
/// supplied `Vec<u32>`.
///
/// The source's shuffle pulls in a full PRNG crate; this core has no other
/// use for `rand`, and `cranelift-codegen` itself reaches for a hand-rolled
/// generator rather than a dependency wherever a pass needs one (see its
/// `bforest` node-id recycling). One xorshift step and a seed-folding loop
/// is the whole requirement here, so it gets the same treatment.
struct XorShiftRng {
    state: [u64; 2],
}

impl XorShiftRng {
    fn from_seed(seed: &[u32]) -> Self {
        let mut lanes = [0x9E37_79B9_7F4A_7C15u64, 0xBF58_476D_1CE4_E5B9u64];
        for (i, &word) in seed.iter().enumerate() {
            let lane = &mut lanes[i % 2];
            *lane ^= u64::from(word);
            *lane = lane.wrapping_mul(0x2545_F491_4F6C_DD1D);
        }
        if lanes[0] == 0 && lanes[1] == 0 {
            lanes[0] = 0x9E37_79B9_7F4A_7C15;
        }
        XorShiftRng { state: lanes }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state[0];
        let y = self.state[1];
        self.state[0] = y;
        x ^= x << 23;
        x ^= x >> 17;
        x ^= y ^ (y >> 26);
        self.state[1] = x;
        x.wrapping_add(y)
    }

    /// A value in `0..bound`. `bound` must be nonzero.
    fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

fn fisher_yates_shuffle<T>(items: &mut [T], seed: &[u32]) {
    if items.len() < 2 {
        return;
    }
    let mut rng = XorShiftRng::from_seed(seed);
    for i in (1..items.len()).rev() {
        let j = rng.below(i + 1);
        items.swap(i, j);
    }
}

/// One contiguous run of blocks that must be placed back-to-back: either a
/// single modified block, or a whole loop's worth once loop-clustering has
/// pulled its members together.
struct Group<I> {
    /// Members in the order they'll be laid out, each still owning its
    /// original `LayoutPair`.
    members: Vec<LayoutPair<I, SymbolicBlock<I>>>,
    total_size: u32,
    /// Lowest original address among members — used only to make `Sorted`
    /// ordering's tie-break deterministic.
    min_original_addr: ConcreteAddress,
}

fn build_groups<I, Isa: IsaProvider<Insn = I>>(
    isa: &Isa,
    pairs: Vec<LayoutPair<I, SymbolicBlock<I>>>,
    strategy: &LayoutStrategy,
    cfgs: &[&dyn SymbolicCfg],
    refused_by_incomplete_function: &HashSet<ConcreteAddress>,
) -> (Vec<Group<I>>, Vec<LayoutPair<I, SymbolicBlock<I>>>) {
    let (mut modified, mut unmodified): (Vec<_>, Vec<_>) =
        pairs.into_iter().partition(|p| p.status.is_modified());

    if strategy.loop_strategy() == LoopStrategy::KeepLoopBlocksTogether && !cfgs.is_empty() {
        let classes = compute_loop_classes(cfgs.iter().copied());

        let modified_reps: HashSet<ConcreteAddress> = modified
            .iter()
            .map(|p| classes.representative_of(p.original.address()))
            .collect();

        let mut still_unmodified = Vec::with_capacity(unmodified.len());
        for pair in unmodified.into_iter() {
            let rep = classes.representative_of(pair.original.address());
            let refused = refused_by_incomplete_function.contains(&pair.original.address());
            if modified_reps.contains(&rep) && !refused {
                debug!(
                    "pulling unmodified block at {} into its modified loop's relocation group",
                    pair.original.address()
                );
                let mut promoted = pair;
                promoted.status = Status::Modified;
                modified.push(promoted);
            } else {
                if refused && modified_reps.contains(&rep) {
                    debug!(
                        "not pulling block at {} into its loop's relocation group: refused as an incomplete function",
                        pair.original.address()
                    );
                }
                still_unmodified.push(pair);
            }
        }
        unmodified = still_unmodified;

        let mut by_rep: HashMap<ConcreteAddress, Vec<LayoutPair<I, SymbolicBlock<I>>>> =
            HashMap::new();
        for pair in modified.into_iter() {
            let rep = classes.representative_of(pair.original.address());
            by_rep.entry(rep).or_default().push(pair);
        }

        let groups = by_rep
            .into_values()
            .map(|mut members| {
                members.sort_by_key(|p| p.original.address());
                group_from_members(isa, members)
            })
            .collect();
        (groups, unmodified)
    } else {
        let groups = modified
            .into_iter()
            .map(|pair| group_from_members(isa, vec![pair]))
            .collect();
        (groups, unmodified)
    }
}

fn group_from_members<I, Isa: IsaProvider<Insn = I>>(
    isa: &Isa,
    members: Vec<LayoutPair<I, SymbolicBlock<I>>>,
) -> Group<I> {
    let total_size: u32 = members.iter().map(|p| p.new.size(isa)).sum();
    let min_original_addr = members
        .iter()
        .map(|p| p.original.address())
        .min()
        .expect("a group always has at least one member");
    Group {
        members,
        total_size,
        min_original_addr,
    }
}

fn order_groups<I>(groups: &mut Vec<Group<I>>, strategy: &LayoutStrategy) {
    match strategy {
        LayoutStrategy::Parallel(_) => {}
        LayoutStrategy::Compact(SortOrder::Sorted, _) => {
            groups.sort_by(|a, b| {
                b.total_size
                    .cmp(&a.total_size)
                    .then_with(|| a.min_original_addr.cmp(&b.min_original_addr))
            });
        }
        LayoutStrategy::Compact(SortOrder::Random(seed), _) => {
            fisher_yates_shuffle(groups, seed);
        }
    }
}

/// Lay out every modified block (plus, if requested, its unmodified loop
/// siblings) and every injected code blob, preferring reused slack from
/// redirected original blocks over the fresh region (§4.4, §4.5).
///
/// `cfgs` is only consulted when `strategy` asks to keep loop blocks
/// together; it may be empty otherwise.
pub fn compact_layout<I, Isa, M>(
    ctx: &mut RewriterCtx<'_, Isa, M>,
    start_addr: ConcreteAddress,
    strategy: LayoutStrategy,
    mut pairs: Vec<LayoutPair<I, SymbolicBlock<I>>>,
    injected_code: Vec<InjectedCode>,
    cfgs: &[&dyn SymbolicCfg],
    is_incomplete_function: &dyn Fn(ConcreteAddress) -> bool,
) -> Result<Layout<I>, crate::error::RewriteFailure>
where
    Isa: IsaProvider<Insn = I>,
    M: Memory,
{
    let mut refused_by_incomplete_function: HashSet<ConcreteAddress> = HashSet::new();
    for pair in pairs.iter_mut() {
        if pair.status.is_modified() && is_incomplete_function(pair.original.address()) {
            ctx.tell(Diagnostic::IncompleteFunctionSkipped {
                addr: pair.original.address(),
            });
            pair.status = Status::Unmodified;
            refused_by_incomplete_function.insert(pair.original.address());
        }
    }

    let all_new_blocks_in_order: Vec<SymbolicBlock<I>> =
        pairs.iter().map(|p| p.new.clone()).collect();

    let (mut modified_pairs, unmodified_pairs): (Vec<_>, Vec<_>) =
        pairs.into_iter().partition(|p| p.status.is_modified());

    reify_fallthroughs(ctx.isa, &mut modified_pairs, &all_new_blocks_in_order)
        .map_err(|e| ctx.fail(e))?;

    let mut all_pairs = modified_pairs;
    all_pairs.extend(unmodified_pairs);
    let (mut groups, leftover_unmodified) = build_groups(
        ctx.isa,
        all_pairs,
        &strategy,
        cfgs,
        &refused_by_incomplete_function,
    );

    order_groups(&mut groups, &strategy);

    let heap = match &strategy {
        LayoutStrategy::Parallel(_) => AddressHeap::new(),
        LayoutStrategy::Compact(..) => build_slack_heap(ctx.isa, &groups),
    };

    let mut allocator = Allocator::new(start_addr, heap);
    let mut assigned: HashMap<SymbolicAddress, ConcreteAddress> = HashMap::new();

    for group in &groups {
        let placement = allocator.allocate_group(group.total_size);
        let mut cursor = placement.base;
        for member in &group.members {
            assigned.insert(member.new.symbolic_address(), cursor);
            cursor = cursor
                .offset(i64::from(member.new.size(ctx.isa)))
                .expect("group placement reserved exactly total_size bytes");
        }
    }

    let mut injected_block_layout = Vec::with_capacity(injected_code.len());
    for blob in injected_code {
        let placement = allocator.allocate_group(blob.bytes.len() as u32);
        injected_block_layout.push((blob.symbolic, placement.base, blob.bytes));
    }

    ctx.add_reused_bytes(allocator.reused_bytes());

    let remaining_heap = match &strategy {
        LayoutStrategy::Parallel(_) => build_slack_heap(ctx.isa, &groups),
        LayoutStrategy::Compact(..) => allocator.into_remaining_heap(),
    };

    let mut layout_padding_blocks = Vec::new();
    for (size, addr) in remaining_heap.drain() {
        let padding_insns = ctx.isa.make_padding(size);
        if !padding_insns.is_empty() {
            layout_padding_blocks.push(ConcreteBlock::new(addr, padding_insns));
        }
    }

    let mut program_block_layout = Vec::with_capacity(groups.iter().map(|g| g.members.len()).sum::<usize>() + leftover_unmodified.len());
    for group in groups {
        for member in group.members {
            let addr = *assigned
                .get(&member.new.symbolic_address())
                .ok_or_else(|| ctx.fail(RewriteError::UnassignedSymbolicBlock(member.original.address())))?;
            program_block_layout.push(LayoutPair {
                original: member.original,
                new: AddressAssignedBlock {
                    block: member.new,
                    assigned: addr,
                },
                status: Status::Modified,
            });
        }
    }
    for pair in leftover_unmodified {
        let addr = pair.original.address();
        program_block_layout.push(LayoutPair {
            original: pair.original,
            new: AddressAssignedBlock {
                block: pair.new,
                assigned: addr,
            },
            status: Status::Unmodified,
        });
    }

    Ok(Layout {
        program_block_layout,
        layout_padding_blocks,
        injected_block_layout,
    })
}

/// Build the heap of slack recovered from every group's members' original
/// blocks: `orig_size - redirect_jump_size` bytes starting right after
/// where the redirection jump will land, for every member whose original
/// block is large enough to hold that jump at all (too-small blocks are
/// handled later by the redirector, §4.6, which reports them and leaves
/// them unredirected rather than contributing slack here).
fn build_slack_heap<I, Isa: IsaProvider<Insn = I>>(isa: &Isa, groups: &[Group<I>]) -> AddressHeap {
    let jmp_size = isa.redirect_jump_size();
    let mut heap = AddressHeap::new();
    for group in groups {
        for member in &group.members {
            let orig_size = member.original.size(isa);
            if orig_size > jmp_size {
                let slack_addr = member
                    .original
                    .address()
                    .offset(i64::from(jmp_size))
                    .expect("original block fits in the address space");
                heap.insert(orig_size - jmp_size, slack_addr);
            }
        }
    }
    heap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::SymbolicInfo;
    use crate::block::BasicBlock;
    use crate::context::SymbolMap;
    use crate::isa::tests::{StubInsn, StubIsa, StubMemory};
    use crate::isa::{Cond, TaggedInsn};

    fn nop() -> StubInsn {
        StubInsn::Nop
    }

    fn tagged_nop() -> TaggedInsn<StubInsn> {
        TaggedInsn {
            encoded: StubInsn::Nop,
            target: None,
        }
    }

    fn modified_pair(sym: u32, orig: u64, orig_size_insns: usize) -> LayoutPair<StubInsn, SymbolicBlock<StubInsn>> {
        let original = BasicBlock::new(
            ConcreteAddress::new(orig),
            (0..orig_size_insns).map(|_| nop()).collect(),
        );
        let new = BasicBlock::new(
            SymbolicInfo {
                symbolic: SymbolicAddress::new(sym as usize),
                original: ConcreteAddress::new(orig),
            },
            vec![TaggedInsn {
                encoded: StubInsn::Ret {
                    cond: Cond::Unconditional,
                },
                target: None,
            }],
        );
        LayoutPair {
            original,
            new,
            status: Status::Modified,
        }
    }

    #[test]
    fn scenario_s2_parallel_places_blocks_in_fresh_region_only() {
        let isa = StubIsa::default();
        let memory = StubMemory::default();
        let symbols = SymbolMap::new();
        let mut ctx = RewriterCtx::new(&isa, &memory, &symbols);

        // Three independent blocks, each with plenty of slack that a
        // Parallel strategy must ignore.
        let pairs = vec![
            modified_pair(0, 0x100, 20),
            modified_pair(1, 0x200, 20),
            modified_pair(2, 0x300, 20),
        ];

        let layout = compact_layout(
            &mut ctx,
            ConcreteAddress::new(0x10000),
            LayoutStrategy::Parallel(LoopStrategy::IgnoreLoops),
            pairs,
            Vec::new(),
            &[],
            &|_| false,
        )
        .unwrap();

        assert_eq!(layout.program_block_layout.len(), 3);
        assert_eq!(ctx.reused_byte_count(), 0);
        // Every block's original slack (20-byte block minus the 5-byte
        // redirect jump that would overwrite its head) becomes padding.
        let total_padding: u32 = layout.layout_padding_blocks.iter().map(|b| b.size(&isa)).sum();
        assert_eq!(total_padding, 3 * 15);
    }

    #[test]
    fn compact_reuses_slack_before_advancing_fresh_region() {
        let isa = StubIsa::default();
        let memory = StubMemory::default();
        let symbols = SymbolMap::new();
        let mut ctx = RewriterCtx::new(&isa, &memory, &symbols);

        // Original block is 20 bytes; the new one's single Ret is 1 byte, so
        // it fits entirely inside the recovered slack.
        let pairs = vec![modified_pair(0, 0x1000, 20)];

        let layout = compact_layout(
            &mut ctx,
            ConcreteAddress::new(0x10000),
            LayoutStrategy::Compact(SortOrder::Sorted, LoopStrategy::IgnoreLoops),
            pairs,
            Vec::new(),
            &[],
            &|_| false,
        )
        .unwrap();

        let assigned = layout.program_block_layout[0].new.assigned;
        // redirect_jump_size is 5, so slack starts at 0x1005 and the new
        // 1-byte block lands there rather than at the fresh-region start.
        assert_eq!(assigned, ConcreteAddress::new(0x1005));
        assert!(ctx.reused_byte_count() > 0);
    }

    #[test]
    fn incomplete_functions_are_skipped_not_relocated() {
        let isa = StubIsa::default();
        let memory = StubMemory::default();
        let symbols = SymbolMap::new();
        let mut ctx = RewriterCtx::new(&isa, &memory, &symbols);

        let pairs = vec![modified_pair(0, 0x1000, 20)];

        let layout = compact_layout(
            &mut ctx,
            ConcreteAddress::new(0x10000),
            LayoutStrategy::Compact(SortOrder::Sorted, LoopStrategy::IgnoreLoops),
            pairs,
            Vec::new(),
            &[],
            &|addr| addr == ConcreteAddress::new(0x1000),
        )
        .unwrap();

        assert_eq!(ctx.incomplete_block_count(), 1);
        assert_eq!(layout.program_block_layout[0].status, Status::Unmodified);
        assert_eq!(
            layout.program_block_layout[0].new.assigned,
            ConcreteAddress::new(0x1000)
        );
    }

    #[test]
    fn fisher_yates_is_deterministic_for_a_given_seed() {
        let mut a = vec![1, 2, 3, 4, 5];
        let mut b = a.clone();
        fisher_yates_shuffle(&mut a, &[7, 11]);
        fisher_yates_shuffle(&mut b, &[7, 11]);
        assert_eq!(a, b);
    }

    #[test]
    fn fisher_yates_leaves_short_slices_untouched() {
        let mut one = vec![42];
        fisher_yates_shuffle(&mut one, &[1, 2, 3]);
        assert_eq!(one, vec![42]);
    }

    #[test]
    fn loop_clustering_pulls_in_unmodified_sibling() {
        struct LoopCfg {
            succs: HashMap<ConcreteAddress, Vec<ConcreteAddress>>,
            order: Vec<ConcreteAddress>,
        }
        impl SymbolicCfg for LoopCfg {
            fn successors(&self, block: ConcreteAddress) -> &[ConcreteAddress] {
                self.succs.get(&block).map(|v| v.as_slice()).unwrap_or(&[])
            }
            fn blocks(&self) -> &[ConcreteAddress] {
                &self.order
            }
        }

        let isa = StubIsa::default();
        let memory = StubMemory::default();
        let symbols = SymbolMap::new();
        let mut ctx = RewriterCtx::new(&isa, &memory, &symbols);

        let modified_a = modified_pair(0, 0x100, 20);
        let mut unmodified_b = modified_pair(1, 0x200, 20);
        unmodified_b.status = Status::Unmodified;

        let cfg = LoopCfg {
            succs: HashMap::from([
                (ConcreteAddress::new(0x100), vec![ConcreteAddress::new(0x200)]),
                (ConcreteAddress::new(0x200), vec![ConcreteAddress::new(0x100)]),
            ]),
            order: vec![ConcreteAddress::new(0x100), ConcreteAddress::new(0x200)],
        };
        let layout = compact_layout(
            &mut ctx,
            ConcreteAddress::new(0x10000),
            LayoutStrategy::Compact(SortOrder::Sorted, LoopStrategy::KeepLoopBlocksTogether),
            vec![modified_a, unmodified_b],
            Vec::new(),
            &[&cfg as &dyn SymbolicCfg],
            &|_| false,
        )
        .unwrap();

        assert!(layout
            .program_block_layout
            .iter()
            .all(|pair| pair.status == Status::Modified));
    }
}
