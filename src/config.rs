//! Build-time constants. There are no runtime flags or environment
//! variables in the core (spec.md §6): the page size and the size-class
//! grain are fixed at compile time.

use static_assertions::const_assert;

/// Size, in bytes, of a page obtained from the page provider. Must be a
/// power of two; the reference value is 8 KiB.
pub const PAGESIZE: usize = 8192;

/// Word size used for the "aligned to word size" guarantee (spec.md §1
/// Non-goals: "No alignment guarantee beyond word alignment").
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Grain of the BUD/LZBUD bitmap (spec.md Glossary: MINBUFSIZE).
pub const MINBUFSIZE: usize = 32;

const_assert!(PAGESIZE.is_power_of_two());
const_assert!(MINBUFSIZE.is_power_of_two());
const_assert!(PAGESIZE > MINBUFSIZE);

/// Rounds `addr` down to the start of the `PAGESIZE`-aligned page that
/// contains it (spec.md invariant 1: `address AND ~(PAGESIZE-1)`).
#[inline]
pub const fn page_base(addr: usize) -> usize {
    addr & !(PAGESIZE - 1)
}

/// Rounds `n` up to the next multiple of `WORD_SIZE`.
#[inline]
pub const fn round_to_word(n: usize) -> usize {
    (n + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}
