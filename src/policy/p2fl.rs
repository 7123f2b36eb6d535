//! Power-of-Two Free List policy (spec.md §4.4). Global state — one
//! free-list head per class plus a bump pointer into the most recently
//! acquired page's unused tail — lives on the anchor page only (spec.md
//! §4.2); later pages are threaded into a ring purely so that "release
//! every page when `bytes_used` hits zero" (spec.md §4.4 "Free") has
//! somewhere to walk.
//!
//! Every page, anchor or not, reserves the same `PAGE_HEADER_SIZE`
//! region right after its handle — mirroring `kma_p2fl.c`, which carves a
//! full `kflHeader_t` out of every page even though only the
//! most-recently-acquired one is live global state.

use core::ptr::NonNull;

use crate::allocator::KernelAllocator;
use crate::classifier::{p2_class_of, p2_class_size, P2_NUM_CLASSES};
use crate::config::{page_base, round_to_word, PAGESIZE};
use crate::page::{read_handle, write_handle, PageProvider, HANDLE_SIZE};

#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

const BUFFER_HEADER_SIZE: usize = round_to_word(core::mem::size_of::<FreeNode>());

/// Global state, installed at `HANDLE_SIZE` inside the anchor page; every
/// other page reserves the same number of bytes (see module docs) even
/// though only `next_page` of a non-anchor page's reservation is ever
/// touched.
#[repr(C)]
struct GlobalState {
    /// Ring of all live pages, oldest-acquired last; `next_page` of the
    /// most-recently-linked page, threaded through every page's own
    /// reservation at the same offset.
    next_page: *mut u8,
    free_lists: [*mut FreeNode; P2_NUM_CLASSES],
    bump_ptr: *mut u8,
    bump_remaining: usize,
    bytes_used: usize,
}

const PAGE_HEADER_SIZE: usize = round_to_word(core::mem::size_of::<GlobalState>());

/// Largest single-buffer payload obtainable without the large-allocation
/// bypass (spec.md Glossary "MAXSPACE").
const MAXSPACE: usize = PAGESIZE - HANDLE_SIZE - PAGE_HEADER_SIZE - BUFFER_HEADER_SIZE;

const BUMP_AREA_SIZE: usize = PAGESIZE - HANDLE_SIZE - PAGE_HEADER_SIZE;

pub struct P2flAllocator<P: PageProvider> {
    provider: P,
    anchor: Option<NonNull<u8>>,
    live_pages: usize,
}

impl<P: PageProvider> P2flAllocator<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            anchor: None,
            live_pages: 0,
        }
    }

    #[inline]
    unsafe fn global(&self) -> *mut GlobalState {
        self.anchor.unwrap().as_ptr().add(HANDLE_SIZE) as *mut GlobalState
    }

    #[inline]
    unsafe fn next_page_link(page_base_addr: usize) -> *mut *mut u8 {
        (page_base_addr + HANDLE_SIZE) as *mut *mut u8
    }

    fn ensure_init(&mut self) -> Option<()> {
        if self.anchor.is_some() {
            return Some(());
        }
        let page = self.provider.get_page()?;
        unsafe {
            write_handle(&page);
            let global = page.ptr.as_ptr().add(HANDLE_SIZE) as *mut GlobalState;
            (*global) = GlobalState {
                next_page: core::ptr::null_mut(),
                free_lists: [core::ptr::null_mut(); P2_NUM_CLASSES],
                bump_ptr: page.ptr.as_ptr().add(HANDLE_SIZE + PAGE_HEADER_SIZE),
                bump_remaining: BUMP_AREA_SIZE,
                bytes_used: 0,
            };
        }
        self.anchor = Some(page.ptr);
        self.live_pages = 1;
        Some(())
    }

    /// Pushes whatever remains of the current bump region into
    /// progressively smaller free lists before the page is abandoned
    /// (spec.md §4.4 step 4; `kma_p2fl.c::allocSpaceLeft`).
    unsafe fn scavenge_tail(&mut self, start_index: usize) {
        let global = self.global();
        let mut index = start_index as isize;
        while index >= 0 {
            let idx = index as usize;
            let class_size = p2_class_size(idx, MAXSPACE);
            while (*global).bump_remaining >= class_size {
                let node = (*global).bump_ptr as *mut FreeNode;
                (*node).next = (*global).free_lists[idx];
                (*global).free_lists[idx] = node;
                (*global).bump_ptr = (*global).bump_ptr.add(class_size);
                (*global).bump_remaining -= class_size;
            }
            index -= 1;
        }
    }

    unsafe fn link_new_page(&mut self, page_ptr: *mut u8) {
        let global = self.global();
        *Self::next_page_link(page_ptr as usize) = (*global).next_page;
        (*global).next_page = page_ptr;
        (*global).bump_ptr = page_ptr.add(HANDLE_SIZE + PAGE_HEADER_SIZE);
        (*global).bump_remaining = BUMP_AREA_SIZE;
    }

    fn class_for(size: usize) -> Option<(usize, usize)> {
        let padded = size + BUFFER_HEADER_SIZE;
        let index = p2_class_of(padded, MAXSPACE)?;
        Some((index, p2_class_size(index, MAXSPACE)))
    }
}

impl<P: PageProvider> KernelAllocator for P2flAllocator<P> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size + HANDLE_SIZE > PAGESIZE {
            log::warn!("kma::p2fl: oversize request {size}");
            return None;
        }

        // Large-allocation bypass (spec.md §4.4 "Large allocations").
        if size > MAXSPACE / 2 {
            let page = self.provider.get_page()?;
            self.live_pages += 1;
            unsafe {
                write_handle(&page);
                return Some(NonNull::new_unchecked(page.ptr.as_ptr().add(HANDLE_SIZE)));
            }
        }

        self.ensure_init()?;
        let (index, class_size) = Self::class_for(size)?;

        loop {
            unsafe {
                let global = self.global();
                if !(*global).free_lists[index].is_null() {
                    let node = (*global).free_lists[index];
                    (*global).free_lists[index] = (*node).next;
                    (*global).bytes_used += class_size;
                    return Some(NonNull::new_unchecked(
                        (node as *mut u8).add(BUFFER_HEADER_SIZE),
                    ));
                }

                if (*global).bump_remaining >= class_size {
                    let chunk = (*global).bump_ptr;
                    (*global).bump_ptr = chunk.add(class_size);
                    (*global).bump_remaining -= class_size;
                    (*global).bytes_used += class_size;
                    return Some(NonNull::new_unchecked(chunk.add(BUFFER_HEADER_SIZE)));
                }

                self.scavenge_tail(index.saturating_sub(1));
            }

            let page = self.provider.get_page()?;
            unsafe {
                write_handle(&page);
                self.link_new_page(page.ptr.as_ptr());
            }
            self.live_pages += 1;
        }
    }

    fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        let addr = ptr.as_ptr() as usize;

        // Large-bypass allocations are recognizable because the user
        // pointer sits exactly `HANDLE_SIZE` bytes into its page and the
        // requested size exceeds the bypass threshold.
        if size > MAXSPACE / 2 {
            let page = unsafe { read_handle(addr) };
            self.provider.free_page(page);
            self.live_pages -= 1;
            log::debug!("kma::p2fl: released bypass page at {:#x}", page_base(addr));
            return;
        }

        let (index, class_size) = match Self::class_for(size) {
            Some(v) => v,
            None => crate::bug!("free size exceeds MAXSPACE"),
        };

        unsafe {
            let node = ptr.as_ptr().sub(BUFFER_HEADER_SIZE) as *mut FreeNode;
            let global = self.global();
            (*node).next = (*global).free_lists[index];
            (*global).free_lists[index] = node;
            (*global).bytes_used -= class_size;

            if (*global).bytes_used == 0 {
                self.release_all_pages();
            }
        }
    }

    fn live_page_count(&self) -> usize {
        self.live_pages
    }
}

impl<P: PageProvider> P2flAllocator<P> {
    /// Releases every page in the ring, including the anchor, and clears
    /// global state back to `uninitialized` (spec.md §4.4 "Free": "When
    /// `bytes_used == 0`, release every page").
    unsafe fn release_all_pages(&mut self) {
        let anchor = self.anchor.take().unwrap();
        let mut cursor = (*self.global_raw(anchor)).next_page;
        self.provider.free_page(read_handle(anchor.as_ptr() as usize));
        self.live_pages -= 1;
        log::debug!("kma::p2fl: released anchor page");
        while !cursor.is_null() {
            let next = *Self::next_page_link(cursor as usize);
            self.provider.free_page(read_handle(cursor as usize));
            self.live_pages -= 1;
            log::debug!("kma::p2fl: released page at {:#x}", cursor as usize);
            cursor = next;
        }
    }

    #[inline]
    unsafe fn global_raw(&self, anchor: NonNull<u8>) -> *mut GlobalState {
        anchor.as_ptr().add(HANDLE_SIZE) as *mut GlobalState
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPageProvider;

    fn new_allocator() -> P2flAllocator<TestPageProvider> {
        P2flAllocator::new(TestPageProvider::new())
    }

    #[test]
    fn alloc_then_free_releases_page() {
        let mut a = new_allocator();
        let p1 = a.alloc(100).unwrap();
        let p2 = a.alloc(100).unwrap();
        assert_ne!(p1, p2);
        a.free(p1, 100);
        a.free(p2, 100);
        assert_eq!(a.live_page_count(), 0);
    }

    #[test]
    fn large_allocations_use_dedicated_pages() {
        let mut a = new_allocator();
        let p1 = a.alloc(5000).unwrap();
        let p2 = a.alloc(5000).unwrap();
        assert_eq!(a.live_page_count(), 2);
        a.free(p1, 5000);
        a.free(p2, 5000);
        assert_eq!(a.live_page_count(), 0);
    }

    #[test]
    fn many_small_allocations_reuse_one_page() {
        let mut a = new_allocator();
        let mut ptrs = std::vec::Vec::new();
        for _ in 0..100 {
            ptrs.push(a.alloc(32).unwrap());
        }
        assert!(a.live_page_count() <= 2);
        for p in ptrs {
            a.free(p, 32);
        }
        assert_eq!(a.live_page_count(), 0);
    }

    #[test]
    fn free_list_reuse_does_not_grow_page_count() {
        let mut a = new_allocator();
        for _ in 0..500 {
            let p = a.alloc(40).unwrap();
            a.free(p, 40);
        }
        assert_eq!(a.live_page_count(), 0);
    }
}
