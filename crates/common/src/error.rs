//! Error handling helpers and primitives.

use std::error::Error as StdError;

/// Chain creates a string from an error's source chain, innermost last.
pub fn chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(e) = source {
        parts.push(e.to_string());
        source = e.source();
    }
    parts.join(": ")
}
