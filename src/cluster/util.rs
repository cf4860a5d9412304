//! Numeric coercion for counters and location identifiers.

use std::any::Any;
use std::fmt::Display;

/// Convert an opaque value to a `u64`.
///
/// A value already typed as `u64` is returned as is. Anything else is
/// parsed from its string form as a base-10 `i64` and cast.
///
/// # Panics
///
/// Panics if the string form does not parse. Counters and locations are
/// written by this crate, so a malformed one means corrupted internal state.
pub fn to_u64<T: Any + Display>(v: &T) -> u64 {
    if let Some(vu) = (v as &dyn Any).downcast_ref::<u64>() {
        return *vu;
    }

    match v.to_string().parse::<i64>() {
        Ok(parsed) => parsed as u64,
        Err(e) => panic!("Cannot convert {:?} to u64: {}", v.to_string(), e),
    }
}
