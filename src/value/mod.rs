//! Boxed64: the 64-bit tagged/NaN-boxed value word (§3.1, §4.1).

mod boxed64;

pub use boxed64::Boxed64;
