//! Basic-block redirection and layout engine for binary rewriting.
//!
//! Given a set of basic blocks a client has decided to replace, this crate
//! decides where the replacements go, reuses the original blocks' bytes as
//! slack space where it can, and produces the concrete jump patches that
//! redirect control from the old location to the new one. It knows nothing
//! about instruction encoding itself — that's supplied by an
//! [`isa::IsaProvider`] implementation per architecture.
//!
//! The pipeline, in order:
//!  1. [`fallthrough::reify_fallthroughs`] — make every implicit fallthrough
//!     explicit before anything moves.
//!  2. [`loop_cluster::compute_loop_classes`] — optionally, work out which
//!     blocks share a loop so they can be kept contiguous.
//!  3. [`layout::compact_layout`] — group, order, and assign addresses.
//!  4. [`redirect::redirect`] — concretize the result and build the
//!     original-block patches.

#![deny(missing_docs, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use crate::address::{ConcreteAddress, SymbolicAddress, SymbolicAddressAllocator, SymbolicInfo};
pub use crate::block::{
    AddressAssignedBlock, BasicBlock, ConcreteBlock, InjectedCode, Layout, LayoutPair,
    SymbolicBlock, Status,
};
pub use crate::context::{RewriterCtx, SymbolMap};
pub use crate::error::{Diagnostic, RewriteError, RewriteFailure};
pub use crate::isa::{Cond, IsaProvider, JumpType, Memory, TaggedInsn};
pub use crate::layout::{compact_layout, LayoutStrategy, LoopStrategy, SortOrder};
pub use crate::loop_cluster::{compute_loop_classes, LoopClasses, SymbolicCfg};
pub use crate::redirect::{redirect, RedirectedProgram};

pub mod address;
pub mod block;
pub mod context;
pub mod error;
pub mod fallthrough;
pub mod heap;
pub mod isa;
pub mod layout;
pub mod loop_cluster;
pub mod redirect;

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
