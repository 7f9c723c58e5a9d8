//! Error taxonomy and non-fatal diagnostics.
//!
//! [`RewriteError`] covers everything in §7 of the specification that
//! aborts a run; [`Diagnostic`] covers the non-fatal counterpart that is
//! merely logged and returned alongside a successful (or failed) result.

use crate::address::ConcreteAddress;
use thiserror::Error;

/// A fatal error. Propagating one of these short-circuits the remainder of
/// the pipeline; no partial `Layout` is produced. The diagnostics
/// accumulated before the failure are preserved by
/// [`crate::error::RewriteFailure`], not discarded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// A decoded instruction straddled the block end reported by discovery.
    #[error("instruction at {insn_addr} extends past the reported block end (next block at {next_addr}, block ends at {stop_addr})")]
    OverlappingBlocks {
        /// Address of the offending instruction.
        insn_addr: ConcreteAddress,
        /// Address discovery reported for the next block.
        next_addr: ConcreteAddress,
        /// Address at which the current block was reported to end.
        stop_addr: ConcreteAddress,
    },

    /// Discovery pointed at memory with no corresponding bytes.
    #[error("no byte region backs address {0}")]
    NoByteRegionAtAddress(ConcreteAddress),

    /// The fallthrough reifier could not find a program-order successor for
    /// a block that falls through.
    #[error("block at {0} needs an implicit fallthrough successor, but none exists in program order")]
    MissingSuccessor(ConcreteAddress),

    /// The allocator's invariant that every symbolic block is assigned
    /// exactly one concrete address was violated.
    #[error("symbolic block originally at {0} was never assigned a concrete address")]
    UnassignedSymbolicBlock(ConcreteAddress),

    /// Offset arithmetic on a [`ConcreteAddress`] over/underflowed.
    #[error("address {base} + {delta} does not fit in the address space")]
    AddressOverflow {
        /// The base address.
        base: ConcreteAddress,
        /// The delta that overflowed it.
        delta: i64,
    },

    /// The underlying memory reader failed.
    #[error("memory read failed: {0}")]
    MemoryError(String),
}

/// A non-fatal diagnostic. Pairs survive in the output even after one is
/// emitted; the corresponding counter on [`crate::context::RewriterCtx`] is
/// updated regardless of which code path produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// An original block was too small to hold a relative redirection jump.
    /// The pair passes through unredirected.
    BlockTooSmallForRedirection {
        /// Size in bytes of the original block.
        orig_size: u32,
        /// Size in bytes the redirection jump would have required.
        jmp_size: u32,
        /// Address of the original block.
        orig_addr: ConcreteAddress,
        /// Human-readable detail for logs.
        description: String,
    },
    /// A block belonging to a function discovery could not fully resolve
    /// was skipped rather than rewritten.
    IncompleteFunctionSkipped {
        /// Address of the skipped block.
        addr: ConcreteAddress,
    },
}

/// The error value returned by [`crate::layout::compact_layout`] on
/// failure: the fatal error plus every diagnostic logged before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteFailure {
    /// The error that aborted the pipeline.
    pub error: RewriteError,
    /// Diagnostics accumulated before the failure.
    pub diagnostics: Vec<Diagnostic>,
}

impl std::fmt::Display for RewriteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for RewriteFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
