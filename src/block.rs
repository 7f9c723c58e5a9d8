//! Basic blocks and the pairs the pipeline threads through its stages (§3).

use crate::address::{ConcreteAddress, SymbolicAddress, SymbolicInfo};
use crate::isa::{IsaProvider, TaggedInsn};

/// An ordered, non-empty sequence of instructions starting at `address`.
///
/// Invariants upheld by construction: a `BasicBlock` is never empty, and
/// `size(isa)` always equals the sum of each instruction's reported size —
/// there is no way to construct one whose instructions straddle its
/// reported end, because the end is derived from the instructions rather
/// than stored independently.
#[derive(Clone)]
pub struct BasicBlock<Addr, Insn> {
    address: Addr,
    instructions: Vec<Insn>,
}

impl<Addr: Copy, Insn> BasicBlock<Addr, Insn> {
    /// Construct a basic block. Panics if `instructions` is empty — callers
    /// (discovery, the client rewrite pass, the fallthrough reifier) are
    /// expected to never produce an empty block.
    pub fn new(address: Addr, instructions: Vec<Insn>) -> Self {
        assert!(
            !instructions.is_empty(),
            "a basic block must contain at least one instruction"
        );
        BasicBlock {
            address,
            instructions,
        }
    }

    /// The block's starting address.
    pub fn address(&self) -> Addr {
        self.address
    }

    /// The block's instructions, in order.
    pub fn instructions(&self) -> &[Insn] {
        &self.instructions
    }

    /// Append an instruction (used by the fallthrough reifier to make an
    /// implicit fallthrough explicit).
    pub fn push(&mut self, insn: Insn) {
        self.instructions.push(insn);
    }
}

/// A basic block whose address is a real machine address and whose
/// instructions carry no symbolic annotation.
pub type ConcreteBlock<I> = BasicBlock<ConcreteAddress, I>;

impl<I> ConcreteBlock<I> {
    /// Total size in bytes, as reported by the ISA provider.
    pub fn size<Isa: IsaProvider<Insn = I>>(&self, isa: &Isa) -> u32 {
        self.instructions()
            .iter()
            .map(|i| isa.instruction_size(i))
            .sum()
    }

    /// The address immediately past the block's last byte.
    pub fn end<Isa: IsaProvider<Insn = I>>(&self, isa: &Isa) -> ConcreteAddress {
        self.address()
            .offset(i64::from(self.size(isa)))
            .expect("block size fits in the address space")
    }
}

/// A basic block whose jumps are tagged with opaque symbolic targets
/// instead of addresses, paired with enough information to later resolve
/// both the block itself and its provenance.
pub type SymbolicBlock<I> = BasicBlock<SymbolicInfo, TaggedInsn<I>>;

impl<I> SymbolicBlock<I> {
    /// This block's own symbolic address.
    pub fn symbolic_address(&self) -> SymbolicAddress {
        self.address().symbolic
    }

    /// The address of the original block this one was rewritten from.
    pub fn original_address(&self) -> ConcreteAddress {
        self.address().original
    }

    /// Total size in bytes once concretized, as reported by the ISA
    /// provider. This already accounts for any fallthrough jump the
    /// reifier appended (§4.4: "a group's size ... accounts for the final
    /// unconditional fallthrough jump already appended").
    pub fn size<Isa: IsaProvider<Insn = I>>(&self, isa: &Isa) -> u32 {
        self.instructions()
            .iter()
            .map(|i| isa.tagged_instruction_size(i))
            .sum()
    }
}

/// A [`SymbolicBlock`] paired with the concrete address it has been
/// assigned by the allocator.
pub struct AddressAssignedBlock<I> {
    /// The symbolic block.
    pub block: SymbolicBlock<I>,
    /// The concrete address the allocator placed it at.
    pub assigned: ConcreteAddress,
}

/// Whether a pair was touched by the client's rewrite pass.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// The client produced a new version of this block; it must be
    /// relocated and the original redirected to it.
    Modified,
    /// The client left this block alone; it is never redirected or
    /// relocated, and its slack is never reused.
    Unmodified,
}

impl Status {
    /// True for [`Status::Modified`].
    pub fn is_modified(self) -> bool {
        self == Status::Modified
    }
}

/// The fundamental unit processed by the engine: an original block, the
/// client's (possibly identical) replacement, and whether the replacement
/// actually differs.
///
/// Passes through the pipeline as `LayoutPair<SymbolicBlock<I>>` →
/// `LayoutPair<AddressAssignedBlock<I>>` → `LayoutPair<ConcreteBlock<I>>`
/// (the last produced by the redirector, §4.6).
pub struct LayoutPair<I, B> {
    /// The original, untouched block.
    pub original: ConcreteBlock<I>,
    /// The client's replacement.
    pub new: B,
    /// Whether `new` differs from `original`.
    pub status: Status,
}

/// A client-supplied byte blob placed into the output by the allocator and
/// addressable only through a [`SymbolicAddress`].
pub struct InjectedCode {
    /// The symbolic address other blocks may reference this blob by.
    pub symbolic: SymbolicAddress,
    /// Raw bytes to place verbatim.
    pub bytes: Vec<u8>,
}

/// The final output of [`crate::layout::compact_layout`].
pub struct Layout<I> {
    /// Every input pair, now with a concrete address for its replacement
    /// (modified pairs get the assigned address; unmodified pairs keep
    /// their original address, since they never move).
    pub program_block_layout: Vec<LayoutPair<I, AddressAssignedBlock<I>>>,
    /// Padding blocks materialising slack that was never reused.
    pub layout_padding_blocks: Vec<ConcreteBlock<I>>,
    /// Client-supplied code blobs, placed by the allocator.
    pub injected_block_layout: Vec<(SymbolicAddress, ConcreteAddress, Vec<u8>)>,
}
