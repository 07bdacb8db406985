//! Formatting helpers.

use std::fmt;

/// Wrapper to format a type's `Display` impl through `Debug`, so debug
/// structs can show human-readable hashes.
pub struct DisplayToDebug<T>(pub T);

impl<T> fmt::Debug for DisplayToDebug<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
