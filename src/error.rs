//! Error conditions the allocator can *report*. Everything else the core
//! is asked not to validate (double-free, wrong-size free, foreign
//! pointers) is a precondition violation of the caller and panics via
//! [`bug!`](crate::bug) instead of flowing through this type.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `size` exceeds what a single page can ever carry.
    OversizeRequest { requested: usize, page_size: usize },
    /// The page provider handed back a page too small to hold even the
    /// minimum page header plus one byte of payload.
    InitializationFailure { reason: &'static str },
    /// The page provider refused to hand out a page.
    OutOfPages,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::OversizeRequest {
                requested,
                page_size,
            } => write!(
                f,
                "requested size {requested} exceeds page size {page_size}"
            ),
            Error::InitializationFailure { reason } => {
                write!(f, "allocator initialization failed: {reason}")
            }
            Error::OutOfPages => write!(f, "page provider is out of pages"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
