//! decoded image handling: decode, cache, prefetch
pub mod cache;
pub mod decode;
pub mod prefetch;
pub mod stats;
