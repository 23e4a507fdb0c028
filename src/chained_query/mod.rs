//! Strict one-at-a-time execution of cache-backed queries
//!
//! Queries registered through a [`ChainedQueryProvider`] run in the order
//! they were declared. Only the head of the queue is allowed to fetch; the
//! next one is granted once the head settles or leaves the queue.

pub mod hook;
pub mod provider;
pub mod queue;
pub mod sequencer;

pub use hook::{ChainedQuery, ChainedQueryOptions, QueryResult, SettledFn};
pub use provider::{use_chained_query, ChainedQueryProvider};
pub use queue::{GrantFn, QueryQueue, QueueEntry};
pub use sequencer::Sequencer;
