//! Concrete and symbolic addresses.
//!
//! A [`ConcreteAddress`] names a real byte offset in the image being
//! rewritten. A [`SymbolicAddress`] names "the final address of some block
//! that has not yet been placed" — it carries no numeric meaning of its own
//! until the allocator binds it in a [`crate::context::RewriterCtx`].

use crate::error::RewriteError;
use cranelift_entity::{entity_impl, EntityRef};
use std::fmt;

/// An absolute code address in the image being rewritten.
///
/// Offset arithmetic never silently wraps: [`ConcreteAddress::offset`]
/// returns a [`RewriteError::AddressOverflow`] rather than producing a
/// wrapped address, and [`ConcreteAddress::diff`] panics on overflow of the
/// resulting `i64` (the two addresses come from the same image and can
/// never be father apart than fits in 64 bits).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConcreteAddress(u64);

impl ConcreteAddress {
    /// Construct a concrete address from a raw byte offset.
    pub fn new(raw: u64) -> Self {
        ConcreteAddress(raw)
    }

    /// The raw byte offset.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// `self + delta`, failing rather than wrapping on overflow.
    pub fn offset(self, delta: i64) -> Result<ConcreteAddress, RewriteError> {
        let signed = self.0 as i128 + delta as i128;
        if signed < 0 || signed > u64::MAX as i128 {
            return Err(RewriteError::AddressOverflow {
                base: self,
                delta,
            });
        }
        Ok(ConcreteAddress(signed as u64))
    }

    /// `self - other`, as a signed byte distance.
    pub fn diff(self, other: ConcreteAddress) -> i64 {
        let signed = self.0 as i128 - other.0 as i128;
        i64::try_from(signed).expect("addresses within one image never differ by more than i64")
    }
}

impl fmt::Display for ConcreteAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// An opaque identifier naming a block (or injected blob) that has not yet
/// been assigned a [`ConcreteAddress`].
///
/// Equality only — symbolic addresses are never ordered or compared to a
/// concrete address directly; they're looked up in the allocator's
/// assignment table instead. Allocated monotonically by
/// [`SymbolicAddressAllocator`] and never reused.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicAddress(u32);
entity_impl!(SymbolicAddress, "sym");

/// Monotonic allocator for [`SymbolicAddress`] values.
///
/// One instance is owned by the [`crate::context::RewriterCtx`] for the
/// duration of a single `compact_layout` call; a fresh id is never reused
/// once handed out, matching the lifecycle rule in the data model (§3).
#[derive(Default)]
pub struct SymbolicAddressAllocator {
    next: u32,
}

impl SymbolicAddressAllocator {
    /// Create an allocator starting at symbolic id 0.
    pub fn new() -> Self {
        SymbolicAddressAllocator { next: 0 }
    }

    /// Hand out the next unused symbolic address.
    pub fn alloc(&mut self) -> SymbolicAddress {
        let id = self.next;
        self.next = self
            .next
            .checked_add(1)
            .expect("exhausted 32-bit symbolic address space");
        SymbolicAddress::new(id as usize)
    }
}

/// A symbolic block's address: the block's own not-yet-placed identity
/// together with the concrete address it originally occupied, so later
/// passes can both find successors (by symbolic address) and report source
/// provenance (by original concrete address).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SymbolicInfo {
    /// The block's own symbolic identity.
    pub symbolic: SymbolicAddress,
    /// The concrete address of the original block this one was rewritten
    /// from.
    pub original: ConcreteAddress,
}

impl fmt::Debug for SymbolicInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}@{}", self.symbolic, self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_roundtrips() {
        let a = ConcreteAddress::new(0x1000);
        let b = a.offset(0x10).unwrap();
        assert_eq!(b.raw(), 0x1010);
        assert_eq!(b.diff(a), 0x10);
        assert_eq!(a.diff(b), -0x10);
    }

    #[test]
    fn offset_rejects_negative_wrap() {
        let a = ConcreteAddress::new(0x10);
        assert!(a.offset(-0x20).is_err());
    }

    #[test]
    fn offset_rejects_positive_overflow() {
        let a = ConcreteAddress::new(u64::MAX - 2);
        assert!(a.offset(10).is_err());
    }

    #[test]
    fn symbolic_addresses_are_monotonic_and_unique() {
        let mut alloc = SymbolicAddressAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert_ne!(a, b);
    }
}
