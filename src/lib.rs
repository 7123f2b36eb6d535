#![cfg_attr(not(feature = "std"), no_std)]

//! Page-backed kernel memory allocator with pluggable placement policies
//! (spec.md §2). The core is [`allocator::KernelAllocator`], a trait every
//! policy in [`policy`] implements against a caller-supplied
//! [`page::PageProvider`]; nothing is shared between policies beyond that
//! contract, since each one lays pages out incompatibly (spec.md §9
//! Design Notes).

pub mod allocator;
#[macro_use]
pub mod bug;
pub mod bitmap;
pub mod classifier;
pub mod config;
pub mod error;
pub mod page;
pub mod policy;

#[cfg(test)]
mod testing;

pub use allocator::KernelAllocator;
pub use error::{Error, Result};
pub use page::{PageProvider, RawPage};

#[cfg(feature = "policy-rm")]
pub use policy::rm::RmAllocator;
#[cfg(feature = "policy-p2fl")]
pub use policy::p2fl::P2flAllocator;
#[cfg(feature = "policy-mck2")]
pub use policy::mck2::Mck2Allocator;
#[cfg(feature = "policy-bud")]
pub use policy::bud::BudAllocator;
#[cfg(feature = "policy-lzbud")]
pub use policy::lzbud::LzbudAllocator;
