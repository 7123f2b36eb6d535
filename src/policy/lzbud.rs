//! Lazy Buddy policy (spec.md §4.7): the same split/coalesce skeleton as
//! [`super::bud`], plus per-class `active`/`locally_free` counters whose
//! difference (`slack`) chooses one of three free-time behaviors — Lazy,
//! Reclaiming, or Accelerated — so that a rapid alloc/free cycle on the
//! same class amortizes to O(1) instead of paying a coalesce every time.
//!
//! Free lists are double-ended per class (front holds *delayed* buffers
//! whose bitmap bit is deliberately left stale; back holds buffers whose
//! bitmap has been brought up to date), so each `FreeNode` is doubly
//! linked here — unlike [`super::bud`]'s singly-linked stack — to give
//! O(1) push-front/push-back/unlink once a buddy has been located.
//! Locating a buddy by address is still a linear scan of its class list,
//! same as BUD (spec.md §9 Design Notes: "free lists... Model as an
//! intrusive collection with unsafe but centralized push/pop").

use core::ptr::NonNull;

use crate::allocator::KernelAllocator;
use crate::bitmap::{cell_index_of, Bitmap, BITMAP_BYTES};
use crate::classifier::{bud_class_of, bud_class_size, BUD_NUM_CLASSES};
use crate::config::{page_base, round_to_word, MINBUFSIZE, PAGESIZE};
use crate::page::{read_handle, write_handle, PageProvider, HANDLE_SIZE};
use static_assertions::const_assert;

#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
    prev: *mut FreeNode,
    delayed: bool,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct ClassList {
    head: *mut FreeNode,
    tail: *mut FreeNode,
}

const EMPTY_LIST: ClassList = ClassList {
    head: core::ptr::null_mut(),
    tail: core::ptr::null_mut(),
};

#[repr(C)]
struct PageHeader {
    bytes_used: usize,
    /// Global per-class state; live only on the anchor page (see module
    /// docs and [`super::bud`]'s equivalent `free_lists`).
    lists: [ClassList; BUD_NUM_CLASSES],
    active: [usize; BUD_NUM_CLASSES],
    locally_free: [usize; BUD_NUM_CLASSES],
    bitmap_bytes: [u8; BITMAP_BYTES],
}

const PAGE_HEADER_SIZE: usize = round_to_word(core::mem::size_of::<PageHeader>());
const USABLE_BASE_OFFSET: usize = PAGESIZE / 2;

const_assert!(HANDLE_SIZE + PAGE_HEADER_SIZE <= USABLE_BASE_OFFSET);

pub struct LzbudAllocator<P: PageProvider> {
    provider: P,
    anchor: Option<NonNull<u8>>,
    live_pages: usize,
}

impl<P: PageProvider> LzbudAllocator<P> {
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

    #[inline]
    unsafe fn anchor_header(&self) -> *mut PageHeader {
        Self::header_of(self.anchor.unwrap().as_ptr() as usize)
    }

    #[inline]
    unsafe fn bitmap_of<'a>(header: *mut PageHeader) -> Bitmap<'a> {
        Bitmap::new(&mut (*header).bitmap_bytes)
    }

    fn init_header(header: *mut PageHeader) {
        unsafe {
            (*header).bytes_used = 0;
            (*header).lists = [EMPTY_LIST; BUD_NUM_CLASSES];
            (*header).active = [0; BUD_NUM_CLASSES];
            (*header).locally_free = [0; BUD_NUM_CLASSES];
            Self::bitmap_of(header).clear();
        }
    }

    fn ensure_init(&mut self) -> Option<()> {
        if self.anchor.is_some() {
            return Some(());
        }
        let page = self.provider.get_page()?;
        unsafe {
            write_handle(&page);
            Self::init_header(Self::header_of(page.ptr.as_ptr() as usize));
        }
        self.anchor = Some(page.ptr);
        self.live_pages = 1;
        unsafe {
            let whole = page.ptr.as_ptr().add(USABLE_BASE_OFFSET) as *mut FreeNode;
            Self::push_back(self.anchor_header(), 0, whole, false);
        }
        Some(())
    }

    unsafe fn seed_page(&mut self, page_ptr: *mut u8) {
        Self::init_header(Self::header_of(page_ptr as usize));
        let whole = page_ptr.add(USABLE_BASE_OFFSET) as *mut FreeNode;
        Self::push_back(self.anchor_header(), 0, whole, false);
    }

    unsafe fn push_front(anchor_header: *mut PageHeader, class: usize, node: *mut FreeNode, delayed: bool) {
        (*node).delayed = delayed;
        (*node).prev = core::ptr::null_mut();
        (*node).next = (*anchor_header).lists[class].head;
        if !(*anchor_header).lists[class].head.is_null() {
            (*(*anchor_header).lists[class].head).prev = node;
        } else {
            (*anchor_header).lists[class].tail = node;
        }
        (*anchor_header).lists[class].head = node;
    }

    unsafe fn push_back(anchor_header: *mut PageHeader, class: usize, node: *mut FreeNode, delayed: bool) {
        (*node).delayed = delayed;
        (*node).next = core::ptr::null_mut();
        (*node).prev = (*anchor_header).lists[class].tail;
        if !(*anchor_header).lists[class].tail.is_null() {
            (*(*anchor_header).lists[class].tail).next = node;
        } else {
            (*anchor_header).lists[class].head = node;
        }
        (*anchor_header).lists[class].tail = node;
    }

    unsafe fn pop_front(anchor_header: *mut PageHeader, class: usize) -> Option<*mut FreeNode> {
        let node = (*anchor_header).lists[class].head;
        if node.is_null() {
            return None;
        }
        Self::unlink(anchor_header, class, node);
        Some(node)
    }

    unsafe fn unlink(anchor_header: *mut PageHeader, class: usize, node: *mut FreeNode) {
        if !(*node).prev.is_null() {
            (*(*node).prev).next = (*node).next;
        } else {
            (*anchor_header).lists[class].head = (*node).next;
        }
        if !(*node).next.is_null() {
            (*(*node).next).prev = (*node).prev;
        } else {
            (*anchor_header).lists[class].tail = (*node).prev;
        }
    }

    /// Scans class `class`'s list for a node at `addr` with the given
    /// delayed flag (spec.md §4.7 Reclaiming/Accelerated).
    unsafe fn find(anchor_header: *mut PageHeader, class: usize, addr: usize, want_delayed: bool) -> Option<*mut FreeNode> {
        let mut cursor = (*anchor_header).lists[class].head;
        while !cursor.is_null() {
            if cursor as usize == addr && (*cursor).delayed == want_delayed {
                return Some(cursor);
            }
            cursor = (*cursor).next;
        }
        None
    }

    /// Removes every free-list entry belonging to `page_base_addr` before
    /// it is released, regardless of which lazy state put it there
    /// (spec.md invariant 3).
    unsafe fn purge_page(&mut self, page_base_addr: usize) {
        let anchor_header = self.anchor_header();
        for class in 0..BUD_NUM_CLASSES {
            let mut cursor = (*anchor_header).lists[class].head;
            while !cursor.is_null() {
                let next = (*cursor).next;
                if page_base(cursor as usize) == page_base_addr {
                    let delayed = (*cursor).delayed;
                    Self::unlink(anchor_header, class, cursor);
                    if delayed {
                        (*anchor_header).locally_free[class] -= 1;
                    }
                }
                cursor = next;
            }
        }
    }

    fn maybe_release(&mut self, page_base_addr: usize) {
        unsafe {
            let owner_header = Self::header_of(page_base_addr);
            if (*owner_header).bytes_used != 0 {
                return;
            }
            let is_anchor = self.anchor.map(|a| a.as_ptr() as usize) == Some(page_base_addr);
            if is_anchor && self.live_pages != 1 {
                return;
            }
            self.purge_page(page_base_addr);
            let raw = read_handle(page_base_addr);
            self.provider.free_page(raw);
            self.live_pages -= 1;
            log::debug!("kma::lzbud: released page at {page_base_addr:#x}");
            if is_anchor {
                self.anchor = None;
            }
        }
    }
}

impl<P: PageProvider> KernelAllocator for LzbudAllocator<P> {
    fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let class_index = match bud_class_of(size) {
            Some(c) => c,
            None => {
                log::warn!("kma::lzbud: oversize request {size}");
                return None;
            }
        };
        self.ensure_init()?;

        loop {
            let found_level = unsafe {
                let anchor_header = self.anchor_header();
                let mut level = class_index as isize;
                let mut found = None;
                while level >= 0 {
                    if !(*anchor_header).lists[level as usize].head.is_null() {
                        found = Some(level as usize);
                        break;
                    }
                    level -= 1;
                }
                found
            };

            if let Some(found_level) = found_level {
                let class_size = bud_class_size(class_index);
                let ptr = unsafe {
                    let anchor_header = self.anchor_header();
                    let node = Self::pop_front(anchor_header, found_level).unwrap();
                    let delayed = (*node).delayed;
                    if delayed {
                        (*anchor_header).locally_free[found_level] -= 1;
                    }

                    let block_addr = node as usize;
                    let owner_base = page_base(block_addr);
                    let owner_header = Self::header_of(owner_base);

                    if found_level == class_index {
                        if !delayed {
                            let cell = cell_index_of(block_addr - owner_base);
                            Self::bitmap_of(owner_header).mark_used(cell, class_size / MINBUFSIZE);
                        }
                    } else {
                        // Reset the whole source span to FREE — this also
                        // clears any stale USED bits left by a delayed
                        // free that never touched the bitmap.
                        let source_size = bud_class_size(found_level);
                        let cell0 = cell_index_of(block_addr - owner_base);
                        Self::bitmap_of(owner_header).mark_free(cell0, source_size / MINBUFSIZE);

                        let mut level = found_level;
                        while level < class_index {
                            level += 1;
                            let buddy_addr = block_addr ^ bud_class_size(level);
                            Self::push_back(anchor_header, level, buddy_addr as *mut FreeNode, false);
                        }

                        let cell = cell_index_of(block_addr - owner_base);
                        Self::bitmap_of(owner_header).mark_used(cell, class_size / MINBUFSIZE);
                    }

                    (*anchor_header).active[class_index] += 1;
                    (*owner_header).bytes_used += class_size;
                    NonNull::new_unchecked(block_addr as *mut u8)
                };
                return Some(ptr);
            }

            let page = self.provider.get_page()?;
            unsafe {
                write_handle(&page);
                self.seed_page(page.ptr.as_ptr());
            }
            self.live_pages += 1;
        }
    }

    fn free(&mut self, ptr: NonNull<u8>, size: usize) {
        let class0 = match bud_class_of(size) {
            Some(c) => c,
            None => crate::bug!("free size exceeds half page"),
        };
        let class_size0 = bud_class_size(class0);
        let addr0 = ptr.as_ptr() as usize;
        let page_base_addr = page_base(addr0);

        unsafe {
            let anchor_header = self.anchor_header();
            (*anchor_header).active[class0] -= 1;

            let mut class = class0;
            let mut addr = addr0;
            loop {
                let active = (*anchor_header).active[class] as isize;
                let locally_free = (*anchor_header).locally_free[class] as isize;
                let slack = active - locally_free;

                if slack > 1 {
                    // Lazy: O(1), bitmap left untouched.
                    Self::push_front(anchor_header, class, addr as *mut FreeNode, true);
                    (*anchor_header).locally_free[class] += 1;
                    break;
                }

                if slack == 1 {
                    // Reclaiming: bring the bitmap up to date and try one
                    // coalesce against a genuinely-free (non-delayed) buddy.
                    let owner_header = Self::header_of(page_base(addr));
                    let cell = cell_index_of(addr - page_base(addr));
                    Self::bitmap_of(owner_header).mark_free(cell, bud_class_size(class) / MINBUFSIZE);

                    if class == 0 {
                        Self::push_back(anchor_header, class, addr as *mut FreeNode, false);
                        break;
                    }
                    let buddy_addr = addr ^ bud_class_size(class);
                    if let Some(buddy) = Self::find(anchor_header, class, buddy_addr, false) {
                        Self::unlink(anchor_header, class, buddy);
                        addr = addr.min(buddy_addr);
                        class -= 1;
                        continue;
                    }
                    Self::push_back(anchor_header, class, addr as *mut FreeNode, false);
                    break;
                }

                // Accelerated: bitmap untouched; try to merge with a
                // delayed buddy instead.
                if class == 0 {
                    Self::push_front(anchor_header, class, addr as *mut FreeNode, true);
                    (*anchor_header).locally_free[class] += 1;
                    break;
                }
                let buddy_addr = addr ^ bud_class_size(class);
                if let Some(buddy) = Self::find(anchor_header, class, buddy_addr, true) {
                    Self::unlink(anchor_header, class, buddy);
                    (*anchor_header).locally_free[class] -= 1;
                    addr = addr.min(buddy_addr);
                    class -= 1;
                    continue;
                }
                Self::push_front(anchor_header, class, addr as *mut FreeNode, true);
                (*anchor_header).locally_free[class] += 1;
                break;
            }

            let owner_header = Self::header_of(page_base_addr);
            (*owner_header).bytes_used -= class_size0;
        }

        self.maybe_release(page_base_addr);
    }

    fn live_page_count(&self) -> usize {
        self.live_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPageProvider;

    fn new_allocator() -> LzbudAllocator<TestPageProvider> {
        LzbudAllocator::new(TestPageProvider::new())
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
    fn oversize_request_is_rejected() {
        let mut a = new_allocator();
        assert!(a.alloc(PAGESIZE).is_none());
    }

    #[test]
    fn alternating_alloc_free_reuses_one_page() {
        let mut a = new_allocator();
        for _ in 0..10_000 {
            let p = a.alloc(40).unwrap();
            a.free(p, 40);
        }
        assert_eq!(a.live_page_count(), 0);
    }

    #[test]
    fn lazy_then_accelerated_pairs_still_converge_to_zero_pages() {
        let mut a = new_allocator();
        let mut ptrs = std::vec::Vec::new();
        for _ in 0..64 {
            ptrs.push(a.alloc(64).unwrap());
        }
        for (i, p) in ptrs.into_iter().enumerate() {
            if i % 2 == 0 {
                a.free(p, 64);
            } else {
                a.free(p, 64);
            }
        }
        assert_eq!(a.live_page_count(), 0);
    }
}
