// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod cache;         // Reference query cache
pub mod chained_query; // Declaration-order query sequencing
pub mod mutation;      // Chained mutations

// Re-exports for convenience
pub use crate::core::config::{SequencerConfig, SequencerConfigBuilder};
pub use crate::core::errors::{ChainedQueryError, Result};

pub use cache::{query_fn, CacheObserver, QueryClient, QueryFn, QueryKey, QueryState, QueryStatus};
pub use chained_query::{
    use_chained_query, ChainedQuery, ChainedQueryOptions, ChainedQueryProvider, QueryResult,
    Sequencer,
};
pub use mutation::{
    ChainOutcome, ChainedMutations, ComputeVariablesFn, MultiMutation, Mutation, MutationHandle,
    MutationStatus,
};
