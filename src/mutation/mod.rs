//! Write-side sequencing: mutations run one after another, each fed by the
//! previous one's result

pub mod chain;
pub mod handle;
pub mod multi;

pub use chain::{ChainOutcome, ChainedMutations, ComputeVariablesFn, RetryableMutation};
pub use handle::{MutateFn, Mutation, MutationHandle, MutationState, MutationStatus};
pub use multi::MultiMutation;
