//! Client side: cached sleep/wake votes and the write API.

pub mod cache;
pub mod client;

pub use cache::{CacheEntry, DeferredTarget, FlushOutcome, WriteBackCache, UNSET};
pub use client::RpmhClient;
