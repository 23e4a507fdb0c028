//! Reference query cache the sequencer runs against

pub mod client;
pub mod key;

pub use client::{query_fn, CacheObserver, QueryClient, QueryFn};
pub use key::{QueryKey, QueryState, QueryStatus};
