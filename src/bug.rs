/// Like the `panic!` macro, but used to flag an invariant that the core
/// promises to uphold internally (as opposed to a caller-facing [`Error`](crate::error::Error)).
#[macro_export]
macro_rules! bug {
    ($($arg:tt)*) => (panic!("{}", format_args!($($arg)*)));
}
