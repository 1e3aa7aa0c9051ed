//! Core rate types and the seams between fetching, caching and publishing

pub mod cache;
pub mod config;
pub mod log;
pub mod rate;
pub mod source;

// Re-export main types for cleaner imports
pub use cache::{CacheError, RateCache};
pub use rate::{RateReading, RateUpdate, ReadingOrigin};
pub use source::{FetchError, RateSource};
