//! Resource Map policy (spec.md §4.3). Free memory is one address-ordered
//! doubly linked list of variable-size runs. Each run's header
//! `{size, base, prev, next}` lives in-band, directly before the bytes it
//! describes, mirroring `kma_rm.c`'s `bufhead`.
//!
//! Unlike the other four policies this free list is ordered by address
//! rather than pushed/popped at one end, so it is hand-rolled (raw
//! `prev`/`next` pointers centralized behind [`Run`]'s methods) rather
//! than built on `intrusive_collections::LinkedList` — the same choice
//! `kma_rm.c` makes over the buddy family's simpler free-list shape.

use core::ptr::NonNull;

use crate::allocator::KernelAllocator;
use crate::config::{page_base, round_to_word, PAGESIZE};
use crate::page::{read_handle, write_handle, PageProvider, HANDLE_SIZE};

/// Global state, installed at `HANDLE_SIZE` inside the anchor page only
/// (spec.md §4.2). Every page, anchor or not, reserves this many bytes
/// right after its handle so that the free-run size formula
/// (`PAGESIZE - sizeof(page-header) - sizeof(run-header)`) is uniform —
/// exactly as `kma_rm.c`'s `pagehead` struct is carved out of every page
/// even though only the anchor's `freelist` field is ever read.
#[repr(C)]
struct PageHeader {
    free_list_head: *mut Run,
}

const PAGE_HEADER_SIZE: usize = round_to_word(core::mem::size_of::<PageHeader>());
const RUN_HEADER_SIZE: usize = round_to_word(core::mem::size_of::<Run>());

/// Bytes of payload a fresh page contributes as one run.
const FRESH_RUN_SIZE: usize = PAGESIZE - HANDLE_SIZE - PAGE_HEADER_SIZE - RUN_HEADER_SIZE;

#[repr(C)]
struct Run {
    size: usize,
    prev: *mut Run,
    next: *mut Run,
}

impl Run {
    #[inline]
    unsafe fn base(&self) -> *mut u8 {
        (self as *const Run as *mut u8).add(RUN_HEADER_SIZE)
    }

    #[inline]
    unsafe fn end(&self) -> usize {
        self.base() as usize + self.size
    }

    #[inline]
    unsafe fn from_base(base: *mut u8) -> *mut Run {
        base.sub(RUN_HEADER_SIZE) as *mut Run
    }
}

pub struct RmAllocator<P: PageProvider> {
    provider: P,
    anchor: Option<NonNull<u8>>,
    live_pages: usize,
}

impl<P: PageProvider> RmAllocator<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            anchor: None,
            live_pages: 0,
        }
    }

    unsafe fn header_of(&self, anchor: NonNull<u8>) -> *mut PageHeader {
        anchor.as_ptr().add(HANDLE_SIZE) as *mut PageHeader
    }

    /// Lazily installs the anchor page and its global free-list head on
    /// first use (spec.md §4.2 "init").
    fn ensure_init(&mut self) -> Option<()> {
        if self.anchor.is_some() {
            return Some(());
        }
        let page = self.provider.get_page()?;
        unsafe {
            write_handle(&page);
            let header = self.header_of(NonNull::new_unchecked(page.ptr.as_ptr()));
            let run = page.ptr.as_ptr().add(HANDLE_SIZE + PAGE_HEADER_SIZE) as *mut Run;
            (*run) = Run {
                size: FRESH_RUN_SIZE,
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
            };
            (*header).free_list_head = run;
        }
        self.anchor = Some(page.ptr);
        self.live_pages = 1;
        Some(())
    }

    unsafe fn free_list_head(&self) -> *mut Run {
        let anchor = self.anchor.unwrap();
        (*self.header_of(anchor)).free_list_head
    }

    unsafe fn set_free_list_head(&mut self, run: *mut Run) {
        let anchor = self.anchor.unwrap();
        (*self.header_of(anchor)).free_list_head = run;
    }

    /// First-fit search; splits the run if it has room for a remainder
    /// run, otherwise returns the whole run (spec.md §4.3 "Allocate").
    unsafe fn take(&mut self, run: *mut Run, size: usize) -> NonNull<u8> {
        if (*run).size > size + RUN_HEADER_SIZE {
            let remainder = (*run).base().add(size) as *mut Run;
            (*remainder) = Run {
                size: (*run).size - size - RUN_HEADER_SIZE,
                prev: (*run).prev,
                next: (*run).next,
            };
            self.relink_replacing(run, remainder);
            (*run).size = size;
        } else {
            self.unlink(run);
        }
        NonNull::new_unchecked((*run).base())
    }

    unsafe fn relink_replacing(&mut self, old: *mut Run, new: *mut Run) {
        if !(*new).prev.is_null() {
            (*(*new).prev).next = new;
        } else {
            self.set_free_list_head(new);
        }
        if !(*new).next.is_null() {
            (*(*new).next).prev = new;
        }
    }

    unsafe fn unlink(&mut self, run: *mut Run) {
        let (prev, next) = ((*run).prev, (*run).next);
        if prev.is_null() {
            self.set_free_list_head(next);
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
    }

    /// Address-ordered insert (spec.md §4.3 "Free"). Mirrors
    /// `kma_rm.c::giveback`.
    unsafe fn insert_ordered(&mut self, run: *mut Run) {
        let mut cursor = self.free_list_head();
        let mut prev: *mut Run = core::ptr::null_mut();
        while !cursor.is_null() && (cursor as usize) < (run as usize) {
            prev = cursor;
            cursor = (*cursor).next;
        }
        (*run).prev = prev;
        (*run).next = cursor;
        if prev.is_null() {
            self.set_free_list_head(run);
        } else {
            (*prev).next = run;
        }
        if !cursor.is_null() {
            (*cursor).prev = run;
        }
    }

    /// Merges `run` with an address-adjacent predecessor/successor,
    /// never crossing a page boundary (spec.md invariant 6).
    unsafe fn coalesce(&mut self, run: *mut Run) {
        let next = (*run).next;
        if !next.is_null() && same_page(run as usize, next as usize) && (*run).end() == next as usize {
            (*run).size += RUN_HEADER_SIZE + (*next).size;
            (*run).next = (*next).next;
            if !(*run).next.is_null() {
                (*(*run).next).prev = run;
            }
        }

        let prev = (*run).prev;
        if !prev.is_null() && same_page(prev as usize, run as usize) && (*prev).end() == run as usize {
            (*prev).size += RUN_HEADER_SIZE + (*run).size;
            (*prev).next = (*run).next;
            if !(*prev).next.is_null() {
                (*(*prev).next).prev = prev;
            }
        }
    }

    /// Walks from the free-list tail, reclaiming pages whose tail run
    /// covers their entire post-header area, recursing once a page is
    /// released (spec.md §4.3 "Reclamation"; spec.md §9 preserves this
    /// tail-only behavior rather than scanning for any empty page).
    fn reclaim(&mut self) {
        loop {
            let rear = unsafe {
                let mut cursor = self.free_list_head();
                if cursor.is_null() {
                    return;
                }
                while !(*cursor).next.is_null() {
                    cursor = (*cursor).next;
                }
                cursor
            };

            let is_whole_page = unsafe { (*rear).size == FRESH_RUN_SIZE };
            if !is_whole_page {
                return;
            }

            unsafe { self.unlink(rear) };

            let page_base_addr = page_base(rear as usize);
            let page = unsafe { read_handle(page_base_addr) };
            let is_anchor = self.anchor.map(|a| a.as_ptr() as usize) == Some(page_base_addr);

            self.provider.free_page(page);
            self.live_pages -= 1;
            log::debug!("kma::rm: released page at {page_base_addr:#x}");

            if is_anchor {
                self.anchor = None;
                return;
            }
            // Non-anchor page released; loop to see if the new tail is
            // also a whole, now-empty page (matches `fpage`'s recursion).
        }
    }
}

#[inline]
fn same_page(a: usize, b: usize) -> bool {
    page_base(a) == page_base(b)
}

impl<P: PageProvider> KernelAllocator for RmAllocator<P> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size + RUN_HEADER_SIZE + PAGE_HEADER_SIZE + HANDLE_SIZE > PAGESIZE {
            log::warn!("kma::rm: oversize request {size}");
            return None;
        }
        self.ensure_init()?;

        unsafe {
            let mut cursor = self.free_list_head();
            while !cursor.is_null() && (*cursor).size < size {
                cursor = (*cursor).next;
            }
            if !cursor.is_null() {
                return Some(self.take(cursor, size));
            }
        }

        let page = self.provider.get_page()?;
        self.live_pages += 1;
        unsafe {
            write_handle(&page);
            let run = page.ptr.as_ptr().add(HANDLE_SIZE + PAGE_HEADER_SIZE) as *mut Run;
            (*run) = Run {
                size: FRESH_RUN_SIZE,
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
            };
            self.insert_ordered(run);
            Some(self.take(run, size))
        }
    }

    fn free(&mut self, ptr: NonNull<u8>, _size: usize) {
        unsafe {
            let run = Run::from_base(ptr.as_ptr());
            self.insert_ordered(run);
            self.coalesce(run);
        }
        self.reclaim();
    }

    fn live_page_count(&self) -> usize {
        self.live_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPageProvider;

    fn new_allocator() -> RmAllocator<TestPageProvider> {
        RmAllocator::new(TestPageProvider::new())
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
    fn oversize_large_allocations_use_dedicated_pages() {
        let mut a = new_allocator();
        let p1 = a.alloc(5000).unwrap();
        let p2 = a.alloc(5000).unwrap();
        assert_eq!(a.live_page_count(), 2);
        a.free(p1, 5000);
        a.free(p2, 5000);
        assert_eq!(a.live_page_count(), 0);
    }

    #[test]
    fn free_in_reverse_address_order_coalesces_to_full_page() {
        let mut a = new_allocator();
        let p = a.alloc(300).unwrap();
        let q = a.alloc(300).unwrap();
        let r = a.alloc(300).unwrap();
        a.free(q, 300);
        a.free(p, 300);
        a.free(r, 300);
        assert_eq!(a.live_page_count(), 0);
    }

    #[test]
    fn disjoint_allocations() {
        use rand::{seq::SliceRandom, thread_rng};

        let mut a = new_allocator();
        let mut ptrs = std::vec::Vec::new();
        for _ in 0..20 {
            ptrs.push(a.alloc(64).unwrap());
        }
        ptrs.shuffle(&mut thread_rng());
        for i in 0..ptrs.len() {
            for j in (i + 1)..ptrs.len() {
                let (pi, pj) = (ptrs[i].as_ptr() as usize, ptrs[j].as_ptr() as usize);
                assert!(pi + 64 <= pj || pj + 64 <= pi);
            }
        }
        for p in ptrs {
            a.free(p, 64);
        }
        assert_eq!(a.live_page_count(), 0);
    }
}
