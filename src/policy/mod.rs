//! One module per placement policy (spec.md §4.3–§4.7), each a self
//! contained [`crate::allocator::KernelAllocator`] implementation with
//! its own page layout. Gated individually so a caller can build only
//! the policies it ships.

#[cfg(feature = "policy-rm")]
pub mod rm;

#[cfg(feature = "policy-p2fl")]
pub mod p2fl;

#[cfg(feature = "policy-mck2")]
pub mod mck2;

#[cfg(feature = "policy-bud")]
pub mod bud;

#[cfg(feature = "policy-lzbud")]
pub mod lzbud;
