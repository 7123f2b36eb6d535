//! The external contract (spec.md §6): every policy implements this same
//! capability set and nothing more is shared between them — the memory
//! layouts differ incompatibly per page, so policies are not unified
//! behind a vtable or runtime switch (spec.md §9 Design Notes).

use core::ptr::NonNull;

pub trait KernelAllocator {
    /// Returns `None` on [`Error::OversizeRequest`](crate::error::Error::OversizeRequest),
    /// [`Error::InitializationFailure`](crate::error::Error::InitializationFailure) or
    /// page-provider exhaustion (spec.md §7).
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// `size` must equal, or round to the same class as, the value
    /// passed to the matching `alloc` (spec.md §6). Violating this is
    /// undefined behavior, not a reported error.
    fn free(&mut self, ptr: NonNull<u8>, size: usize);

    /// Number of pages currently held from the page provider. Used by
    /// the testable property "after every free that reduces global
    /// outstanding to zero, no pages are held" (spec.md §8 invariant 4).
    fn live_page_count(&self) -> usize;
}
