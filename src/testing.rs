//! A minimal [`PageProvider`] backed by `std::alloc`, standing in for the
//! external trace-driven test harness (spec.md §1: the harness itself is
//! external and out of scope — this is just enough of a provider to drive
//! the policies under test).

extern crate std;

use std::alloc::{alloc, dealloc, Layout};
use std::collections::HashSet;
use std::ptr::NonNull;

use crate::config::PAGESIZE;
use crate::page::{PageProvider, RawPage};

pub struct TestPageProvider {
    next_id: u64,
    layout: Layout,
    live: HashSet<usize>,
}

impl TestPageProvider {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            layout: Layout::from_size_align(PAGESIZE, PAGESIZE).unwrap(),
            live: HashSet::new(),
        }
    }

    pub fn pages_outstanding(&self) -> usize {
        self.live.len()
    }
}

impl Default for TestPageProvider {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl PageProvider for TestPageProvider {
    fn get_page(&mut self) -> Option<RawPage> {
        let raw = unsafe { alloc(self.layout) };
        let ptr = NonNull::new(raw)?;
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(ptr.as_ptr() as usize);
        Some(RawPage {
            ptr,
            size: PAGESIZE,
            id,
        })
    }

    fn free_page(&mut self, page: RawPage) {
        let key = page.ptr.as_ptr() as usize;
        assert!(
            self.live.remove(&key),
            "freeing a page not owned by this provider"
        );
        unsafe { dealloc(page.ptr.as_ptr(), self.layout) };
    }
}

impl Drop for TestPageProvider {
    fn drop(&mut self) {
        assert!(
            self.live.is_empty(),
            "{} page(s) leaked by allocator under test",
            self.live.len()
        );
    }
}
