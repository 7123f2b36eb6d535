//! The Page Manager's external collaborator (spec.md §4.2, §6): a page
//! provider handing out fixed `PAGESIZE` regions and taking them back.

use core::ptr::NonNull;

use crate::config::PAGESIZE;

/// A page handle as returned by [`PageProvider::get_page`]. The core
/// stores a copy of this value at the very start of every page it owns
/// (spec.md §3, "Page Header"), so that the originating page can always
/// be handed back to `free_page` without the provider keeping its own
/// bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct RawPage {
    pub ptr: NonNull<u8>,
    pub size: usize,
    /// Monotonically increasing tag; `id == 0` identifies the first page
    /// ever issued (spec.md §6, used by the RM reclamation path).
    pub id: u64,
}

impl RawPage {
    #[inline]
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

/// Consumed capability: obtain and release `PAGESIZE`-byte regions.
///
/// # Safety
///
/// Implementations must hand back a `PAGESIZE`-byte region aligned to
/// `PAGESIZE`, unique for as long as it has not been passed back to
/// `free_page`.
pub unsafe trait PageProvider {
    /// Returns `None` on provider exhaustion; `get_page` is assumed fast
    /// and synchronous (spec.md §5).
    fn get_page(&mut self) -> Option<RawPage>;

    fn free_page(&mut self, page: RawPage);
}

/// Recovers the handle word stored at the start of the page containing
/// `addr`.
///
/// # Safety
///
/// `addr` must point strictly inside a page that this allocator
/// installed a handle into via [`write_handle`].
#[inline]
pub unsafe fn read_handle(addr: usize) -> RawPage {
    let base = crate::config::page_base(addr);
    core::ptr::read(base as *const RawPage)
}

/// Writes `page`'s handle into the first word(s) of its own memory.
///
/// # Safety
///
/// `page` must not yet be in use for anything else; this clobbers the
/// first `size_of::<RawPage>()` bytes.
#[inline]
pub unsafe fn write_handle(page: &RawPage) {
    core::ptr::write(page.ptr.as_ptr() as *mut RawPage, *page);
}

/// Byte offset of the first usable address after the stored handle.
pub const HANDLE_SIZE: usize = crate::config::round_to_word(core::mem::size_of::<RawPage>());

static_assertions::const_assert!(HANDLE_SIZE < PAGESIZE);
