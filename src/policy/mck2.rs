//! McKusick–Karels policy (spec.md §4.5). Same nine-class table as P2FL,
//! but each page is "typed" to exactly one class for its whole lifetime
//! (spec.md §9 Open Questions: the historical bug where a page's class
//! stuck to whatever the first requester asked for is not reproduced —
//! every page is explicitly typed at acquisition).
//!
//! Pages thread into a circular ring sentinelled by the anchor page; a
//! new page is always linked in immediately after the anchor, so walking
//! `ring_next` from the anchor visits pages most-recently-acquired first
//! (spec.md §4.5 "Allocate": "Scan page ring from most-recent").
//! Unlike P2FL/BUD/LZBUD, spec.md §3 explicitly excludes MCK2 (and RM)
//! from the "anchor retained until last" rule: any page, anchor included,
//! is released the moment its own `bytes_used` reaches zero.

use core::ptr::NonNull;

use crate::allocator::KernelAllocator;
use crate::classifier::{p2_class_of, p2_class_size};
use crate::config::{page_base, round_to_word, PAGESIZE};
use crate::page::{read_handle, write_handle, PageProvider, HANDLE_SIZE};

#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

#[repr(C)]
struct PageHeader {
    ring_prev: *mut u8,
    ring_next: *mut u8,
    class: usize,
    bytes_used: usize,
    free_list_head: *mut FreeNode,
}

const PAGE_HEADER_SIZE: usize = round_to_word(core::mem::size_of::<PageHeader>());
const MAXSPACE: usize = PAGESIZE - HANDLE_SIZE - PAGE_HEADER_SIZE;

pub struct Mck2Allocator<P: PageProvider> {
    provider: P,
    anchor: Option<NonNull<u8>>,
    live_pages: usize,
}

impl<P: PageProvider> Mck2Allocator<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            anchor: None,
            live_pages: 0,
        }
    }

    #[inline]
    unsafe fn header_of(page_base_addr: usize) -> *mut PageHeader {
        (page_base_addr + HANDLE_SIZE) as *mut PageHeader
    }

    /// Carves the maximum whole number of `class_index`-sized buffers out
    /// of a fresh page's post-header area and chains them as its free
    /// list (spec.md §4.5 "Allocate", miss path).
    unsafe fn carve_free_list(page_ptr: *mut u8, class_index: usize) -> *mut FreeNode {
        let class_size = p2_class_size(class_index, MAXSPACE);
        let mut head: *mut FreeNode = core::ptr::null_mut();
        let mut cursor = page_ptr.add(HANDLE_SIZE + PAGE_HEADER_SIZE);
        let mut remaining = MAXSPACE;
        while remaining >= class_size {
            let node = cursor as *mut FreeNode;
            (*node).next = head;
            head = node;
            cursor = cursor.add(class_size);
            remaining -= class_size;
        }
        head
    }

    /// Installs the anchor page on first use, already typed to
    /// `class_index` — the anchor is a fully participating ring member
    /// from the start, not a dedicated bookkeeping-only page (spec.md
    /// §4.2 "init" generalized to MCK2's per-page typing).
    fn ensure_init(&mut self, class_index: usize) -> Option<()> {
        if self.anchor.is_some() {
            return Some(());
        }
        let page = self.provider.get_page()?;
        unsafe {
            write_handle(&page);
            let head = Self::carve_free_list(page.ptr.as_ptr(), class_index);
            let header = Self::header_of(page.ptr.as_ptr() as usize);
            (*header) = PageHeader {
                ring_prev: page.ptr.as_ptr(),
                ring_next: page.ptr.as_ptr(),
                class: class_index,
                bytes_used: 0,
                free_list_head: head,
            };
        }
        self.anchor = Some(page.ptr);
        self.live_pages = 1;
        Some(())
    }

    /// Types a freshly acquired non-anchor page to `class_index` and
    /// links it into the ring immediately after the anchor (spec.md
    /// §4.5 "Allocate", miss path).
    unsafe fn seed_page(&mut self, page_ptr: *mut u8, class_index: usize) {
        let head = Self::carve_free_list(page_ptr, class_index);
        let header = Self::header_of(page_ptr as usize);
        (*header) = PageHeader {
            ring_prev: page_ptr,
            ring_next: page_ptr,
            class: class_index,
            bytes_used: 0,
            free_list_head: head,
        };

        let anchor = self.anchor.unwrap().as_ptr();
        let anchor_header = Self::header_of(anchor as usize);
        (*header).ring_prev = anchor;
        (*header).ring_next = (*anchor_header).ring_next;
        (*Self::header_of((*anchor_header).ring_next as usize)).ring_prev = page_ptr;
        (*anchor_header).ring_next = page_ptr;
    }

    unsafe fn unlink_from_ring(page_ptr: *mut u8) {
        let header = Self::header_of(page_ptr as usize);
        let (prev, next) = ((*header).ring_prev, (*header).ring_next);
        (*Self::header_of(prev as usize)).ring_next = next;
        (*Self::header_of(next as usize)).ring_prev = prev;
    }
}

impl<P: PageProvider> KernelAllocator for Mck2Allocator<P> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size + HANDLE_SIZE > PAGESIZE {
            log::warn!("kma::mck2: oversize request {size}");
            return None;
        }

        if size > MAXSPACE / 2 {
            let page = self.provider.get_page()?;
            self.live_pages += 1;
            unsafe {
                write_handle(&page);
                return Some(NonNull::new_unchecked(page.ptr.as_ptr().add(HANDLE_SIZE)));
            }
        }

        let class_index = p2_class_of(size, MAXSPACE)?;
        self.ensure_init(class_index)?;
        let class_size = p2_class_size(class_index, MAXSPACE);

        loop {
            let anchor = self.anchor.unwrap().as_ptr();
            unsafe {
                let mut cursor = anchor;
                loop {
                    let header = Self::header_of(cursor as usize);
                    if (*header).class == class_index && !(*header).free_list_head.is_null() {
                        let node = (*header).free_list_head;
                        (*header).free_list_head = (*node).next;
                        (*header).bytes_used += class_size;
                        return Some(NonNull::new_unchecked(node as *mut u8));
                    }
                    cursor = (*header).ring_next;
                    if cursor == anchor {
                        break;
                    }
                }
            }

            let page = self.provider.get_page()?;
            unsafe {
                write_handle(&page);
                self.seed_page(page.ptr.as_ptr(), class_index);
            }
            self.live_pages += 1;
        }
    }

    fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        let addr = ptr.as_ptr() as usize;

        if size > MAXSPACE / 2 {
            let page = unsafe { read_handle(addr) };
            self.provider.free_page(page);
            self.live_pages -= 1;
            log::debug!("kma::mck2: released bypass page at {:#x}", page_base(addr));
            return;
        }

        let base = page_base(addr);
        unsafe {
            let header = Self::header_of(base);
            let class_size = p2_class_size((*header).class, MAXSPACE);

            let node = ptr.as_ptr() as *mut FreeNode;
            (*node).next = (*header).free_list_head;
            (*header).free_list_head = node;
            (*header).bytes_used -= class_size;

            if (*header).bytes_used != 0 {
                return;
            }

            let is_anchor = self.anchor.map(|a| a.as_ptr() as usize) == Some(base);
            if is_anchor && (*header).ring_next as usize == base {
                // Only page left, and it is the anchor: ring is empty.
                let raw = read_handle(base);
                self.provider.free_page(raw);
                self.anchor = None;
                self.live_pages -= 1;
                log::debug!("kma::mck2: released last page at {base:#x}");
                return;
            }

            let survivor = (*header).ring_next;
            Self::unlink_from_ring(base as *mut u8);
            let raw = read_handle(base);
            self.provider.free_page(raw);
            self.live_pages -= 1;
            log::debug!("kma::mck2: released page at {base:#x}");

            if is_anchor {
                // Other ring members are still live; repoint the anchor
                // rather than dropping it, or the surviving ring becomes
                // unreachable from `ensure_init`'s next lookup.
                self.anchor = Some(NonNull::new_unchecked(survivor));
            }
        }
    }

    fn live_page_count(&self) -> usize {
        self.live_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPageProvider;

    fn new_allocator() -> Mck2Allocator<TestPageProvider> {
        Mck2Allocator::new(TestPageProvider::new())
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
    fn pages_never_mix_classes() {
        let mut a = new_allocator();
        let small = a.alloc(16).unwrap();
        let big = a.alloc(2000).unwrap();
        // Forces at least two live pages since the two sizes round to
        // different classes and a page only ever carries one class.
        assert!(a.live_page_count() >= 1);
        a.free(small, 16);
        a.free(big, 2000);
        assert_eq!(a.live_page_count(), 0);
    }

    #[test]
    fn no_wholly_empty_pages_linger() {
        let mut a = new_allocator();
        let mut ptrs = std::vec::Vec::new();
        for _ in 0..50 {
            ptrs.push(a.alloc(64).unwrap());
        }
        let before = a.live_page_count();
        for p in ptrs.drain(..40) {
            a.free(p, 64);
        }
        assert!(a.live_page_count() <= before);
        for p in ptrs {
            a.free(p, 64);
        }
        assert_eq!(a.live_page_count(), 0);
    }
}
