//! The rewriter context: the single mutable environment threaded through
//! every pass (§4.7).
//!
//! The source threads reader + state + writer + error through a monad
//! transformer (§9 Design Notes). In Rust, a plain struct passed by `&mut`
//! reference — with `tell`, `fail`, and counter-mutating methods — is the
//! clearer equivalent, the same shape as `cranelift-codegen`'s
//! `regalloc::Context` or its `verifier::VerifierErrors` accumulator: one
//! object threaded sequentially through a fixed sequence of passes rather
//! than tuples of accumulators returned and re-merged by hand.

use crate::address::{ConcreteAddress, SymbolicAddressAllocator};
use crate::error::{Diagnostic, RewriteError, RewriteFailure};
use crate::isa::{IsaProvider, Memory};
use log::{debug, warn};
use std::collections::HashMap;

/// Optional human-readable names for concrete addresses, used only to
/// enrich diagnostic text; entirely absent from the algorithm itself.
pub type SymbolMap = HashMap<ConcreteAddress, String>;

/// The shared, read-only environment plus the mutable counters and
/// diagnostic log every pass contributes to.
pub struct RewriterCtx<'a, Isa: IsaProvider, M: Memory> {
    /// The architecture facts collaborator.
    pub isa: &'a Isa,
    /// The image's bytes.
    pub memory: &'a M,
    /// Optional debug names for concrete addresses.
    pub symbol_map: &'a SymbolMap,

    new_symbols: SymbolicAddressAllocator,
    unrelocatable_term_count: u32,
    small_block_count: u32,
    reused_byte_count: u64,
    incomplete_block_count: u32,
    block_mapping: Vec<(ConcreteAddress, ConcreteAddress)>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a, Isa: IsaProvider, M: Memory> RewriterCtx<'a, Isa, M> {
    /// Create a fresh context for one `compact_layout` call.
    pub fn new(isa: &'a Isa, memory: &'a M, symbol_map: &'a SymbolMap) -> Self {
        RewriterCtx {
            isa,
            memory,
            symbol_map,
            new_symbols: SymbolicAddressAllocator::new(),
            unrelocatable_term_count: 0,
            small_block_count: 0,
            reused_byte_count: 0,
            incomplete_block_count: 0,
            block_mapping: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Allocate a fresh symbolic address.
    pub fn alloc_symbol(&mut self) -> crate::address::SymbolicAddress {
        self.new_symbols.alloc()
    }

    /// Append a non-fatal diagnostic to the log, also mirroring it through
    /// `log` so it's visible even to callers that never inspect the
    /// returned log.
    pub fn tell(&mut self, diag: Diagnostic) {
        match &diag {
            Diagnostic::BlockTooSmallForRedirection {
                orig_addr,
                orig_size,
                jmp_size,
                ..
            } => {
                self.small_block_count += 1;
                warn!(
                    "block at {} too small for redirection ({} < {} bytes)",
                    orig_addr, orig_size, jmp_size
                );
            }
            Diagnostic::IncompleteFunctionSkipped { addr } => {
                self.incomplete_block_count += 1;
                debug!("skipping block at {} (incomplete function)", addr);
            }
        }
        self.diagnostics.push(diag);
    }

    /// Abort the current pipeline. The accumulated diagnostic log is
    /// preserved and returned alongside the error, never discarded.
    pub fn fail(&self, error: RewriteError) -> RewriteFailure {
        RewriteFailure {
            error,
            diagnostics: self.diagnostics.clone(),
        }
    }

    /// Record a successful `original -> redirected` translation in the
    /// public block-mapping table.
    pub fn record_mapping(&mut self, original: ConcreteAddress, redirected: ConcreteAddress) {
        self.block_mapping.push((original, redirected));
    }

    /// Count `n` bytes of heap slack as having been reused by a placed
    /// block.
    pub fn add_reused_bytes(&mut self, n: u64) {
        self.reused_byte_count += n;
    }

    /// Count a block whose terminator could not be relocated at all (kept
    /// distinct from `small_block_count`: this is for blocks refused before
    /// redirection is even attempted, e.g. incomplete functions).
    pub fn add_unrelocatable_term(&mut self) {
        self.unrelocatable_term_count += 1;
    }

    /// Number of blocks refused redirection for being too small.
    pub fn small_block_count(&self) -> u32 {
        self.small_block_count
    }

    /// Number of blocks skipped because they belong to an incomplete
    /// function.
    pub fn incomplete_block_count(&self) -> u32 {
        self.incomplete_block_count
    }

    /// Number of terminators that could not be relocated at all.
    pub fn unrelocatable_term_count(&self) -> u32 {
        self.unrelocatable_term_count
    }

    /// Total bytes reused from the address heap by placed blocks.
    pub fn reused_byte_count(&self) -> u64 {
        self.reused_byte_count
    }

    /// The public `original -> redirected` translation table, in the
    /// deterministic order entries were recorded.
    pub fn block_mapping(&self) -> &[(ConcreteAddress, ConcreteAddress)] {
        &self.block_mapping
    }

    /// The diagnostic log accumulated so far, in emission order.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}
