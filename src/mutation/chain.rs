//! Sequential execution of mutations
//!
//! [`ChainedMutations`] invokes its mutations one after another. The input
//! of each step is computed from the data of the step before it. The chain
//! does not own completion: it moves forward when [`ChainedMutations::advance`]
//! observes that the current step succeeded, and [`ChainedMutations::run`]
//! simply calls `advance` on every state change.

use futures::future::select_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::handle::{Mutation, MutationStatus};
use crate::core::errors::{ChainedQueryError, Result};

/// Computes a mutation's input from the previous mutation's data
/// (`None` for the first mutation)
pub type ComputeVariablesFn = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// Where a chain stands after a re-evaluation
#[derive(Clone, Debug, PartialEq)]
pub enum ChainOutcome {
    /// `mutate` has not been called
    Idle,
    /// Waiting on the mutation at `step`
    Running { step: usize },
    /// Every mutation succeeded
    Completed,
    /// The mutation at `step` failed; use its retry to resume
    Halted {
        step: usize,
        key: String,
        error: Option<String>,
    },
}

impl ChainOutcome {
    /// Turn a halted chain into [`ChainedQueryError::MutationFailed`]
    pub fn into_result(self) -> Result<()> {
        match self {
            ChainOutcome::Halted { key, error, .. } => Err(ChainedQueryError::mutation_failed(
                key,
                error.unwrap_or_else(|| "mutation failed".to_string()),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Progress {
    Idle,
    Armed(usize),
    Completed,
    Halted(usize),
}

struct ChainInner {
    mutations: Vec<Arc<dyn Mutation>>,
    compute_variables_for_next: HashMap<String, ComputeVariablesFn>,
    progress: Mutex<Progress>,
}

#[derive(Clone)]
pub struct ChainedMutations {
    inner: Arc<ChainInner>,
}

impl ChainedMutations {
    /// `compute_variables_for_next` is keyed by the mutation whose input the
    /// function produces. Mutations without an entry receive `Value::Null`.
    pub fn new(
        mutations: Vec<Arc<dyn Mutation>>,
        compute_variables_for_next: HashMap<String, ComputeVariablesFn>,
    ) -> Self {
        Self {
            inner: Arc::new(ChainInner {
                mutations,
                compute_variables_for_next,
                progress: Mutex::new(Progress::Idle),
            }),
        }
    }

    /// Start the chain by invoking the first mutation
    pub fn mutate(&self) {
        let mut progress = self.inner.progress.lock();
        if self.inner.mutations.is_empty() {
            *progress = Progress::Completed;
            return;
        }
        self.inner.invoke(&mut progress, 0);
    }

    /// Re-evaluate the current step and invoke the next one if it succeeded
    pub fn advance(&self) -> ChainOutcome {
        let mut progress = self.inner.progress.lock();
        loop {
            let Progress::Armed(step) = *progress else {
                return self.inner.outcome(*progress);
            };
            let mutation = &self.inner.mutations[step];
            match mutation.status() {
                MutationStatus::Idle | MutationStatus::Loading => {
                    return ChainOutcome::Running { step };
                }
                MutationStatus::Error => {
                    warn!(key = mutation.key(), step, "Mutation failed, chain halted");
                    *progress = Progress::Halted(step);
                }
                MutationStatus::Success => {
                    let next = step + 1;
                    if next == self.inner.mutations.len() {
                        info!(steps = next, "Mutation chain completed");
                        *progress = Progress::Completed;
                    } else {
                        self.inner.invoke(&mut progress, next);
                    }
                }
            }
        }
    }

    /// Current outcome without re-evaluating
    pub fn outcome(&self) -> ChainOutcome {
        let progress = *self.inner.progress.lock();
        self.inner.outcome(progress)
    }

    /// Keep advancing on every mutation change until the chain completes,
    /// halts, or was never started
    pub async fn run(&self) -> ChainOutcome {
        let mut receivers: Vec<watch::Receiver<u64>> =
            self.inner.mutations.iter().map(|m| m.changes()).collect();
        loop {
            for receiver in receivers.iter_mut() {
                receiver.borrow_and_update();
            }
            match self.advance() {
                ChainOutcome::Running { .. } => {}
                outcome => return outcome,
            }
            let (changed, _, _) =
                select_all(receivers.iter_mut().map(|r| Box::pin(r.changed()))).await;
            if changed.is_err() {
                return self.outcome();
            }
        }
    }

    /// Mirror of the mutation list whose `retry` recomputes the input from
    /// the previous mutation's current data and resumes the chain there
    pub fn mutations_with_retry(&self) -> Vec<RetryableMutation> {
        (0..self.inner.mutations.len())
            .map(|index| RetryableMutation {
                index,
                chain: self.inner.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.mutations.is_empty()
    }
}

impl ChainInner {
    fn input_for(&self, index: usize) -> Value {
        let previous = index
            .checked_sub(1)
            .and_then(|prev| self.mutations[prev].data());
        let key = self.mutations[index].key();
        match self.compute_variables_for_next.get(key) {
            Some(compute) => compute(previous.as_ref()),
            None => Value::Null,
        }
    }

    fn invoke(&self, progress: &mut Progress, index: usize) {
        let input = self.input_for(index);
        let mutation = &self.mutations[index];
        debug!(key = mutation.key(), step = index, "Invoking mutation");
        *progress = Progress::Armed(index);
        mutation.mutate(input);
    }

    fn outcome(&self, progress: Progress) -> ChainOutcome {
        match progress {
            Progress::Idle => ChainOutcome::Idle,
            Progress::Armed(step) => ChainOutcome::Running { step },
            Progress::Completed => ChainOutcome::Completed,
            Progress::Halted(step) => {
                let mutation = &self.mutations[step];
                ChainOutcome::Halted {
                    step,
                    key: mutation.key().to_string(),
                    error: mutation.error(),
                }
            }
        }
    }
}

/// One mutation of a chain, with a chain-aware retry
#[derive(Clone)]
pub struct RetryableMutation {
    index: usize,
    chain: Arc<ChainInner>,
}

impl RetryableMutation {
    pub fn index(&self) -> usize {
        self.index
    }

    fn inner(&self) -> &Arc<dyn Mutation> {
        &self.chain.mutations[self.index]
    }
}

impl Mutation for RetryableMutation {
    fn key(&self) -> &str {
        self.inner().key()
    }

    fn mutate(&self, input: Value) {
        self.inner().mutate(input);
    }

    fn status(&self) -> MutationStatus {
        self.inner().status()
    }

    fn data(&self) -> Option<Value> {
        self.inner().data()
    }

    fn error(&self) -> Option<String> {
        self.inner().error()
    }

    fn retry(&self) {
        let mut progress = self.chain.progress.lock();
        debug!(key = self.key(), step = self.index, "Retrying mutation");
        self.chain.invoke(&mut progress, self.index);
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.inner().changes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::handle::MutationHandle;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mutation whose state is set by hand, like a mock
    struct ManualMutation {
        key: String,
        calls: Mutex<Vec<Value>>,
        status: Mutex<MutationStatus>,
        data: Mutex<Option<Value>>,
        revision: watch::Sender<u64>,
    }

    impl ManualMutation {
        fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                calls: Mutex::new(Vec::new()),
                status: Mutex::new(MutationStatus::Idle),
                data: Mutex::new(None),
                revision: watch::channel(0).0,
            })
        }

        fn settle(&self, status: MutationStatus, data: Option<Value>) {
            *self.status.lock() = status;
            *self.data.lock() = data;
            self.revision.send_modify(|r| *r += 1);
        }
    }

    impl Mutation for ManualMutation {
        fn key(&self) -> &str {
            &self.key
        }
        fn mutate(&self, input: Value) {
            self.calls.lock().push(input);
            *self.status.lock() = MutationStatus::Loading;
        }
        fn status(&self) -> MutationStatus {
            *self.status.lock()
        }
        fn data(&self) -> Option<Value> {
            self.data.lock().clone()
        }
        fn retry(&self) {}
        fn changes(&self) -> watch::Receiver<u64> {
            self.revision.subscribe()
        }
    }

    fn compute() -> HashMap<String, ComputeVariablesFn> {
        let mut compute: HashMap<String, ComputeVariablesFn> = HashMap::new();
        compute.insert("m1".into(), Arc::new(|_: Option<&Value>| json!({"start": true})));
        compute.insert(
            "m2".into(),
            Arc::new(|prev: Option<&Value>| {
                json!({"from": prev.cloned().unwrap_or(Value::Null)})
            }),
        );
        compute
    }

    #[test]
    fn test_second_waits_for_first() {
        let (m1, m2) = (ManualMutation::new("m1"), ManualMutation::new("m2"));
        let chain = ChainedMutations::new(
            vec![m1.clone() as Arc<dyn Mutation>, m2.clone()],
            compute(),
        );

        chain.mutate();
        assert_eq!(*m1.calls.lock(), vec![json!({"start": true})]);
        assert!(m2.calls.lock().is_empty());
        assert_eq!(chain.advance(), ChainOutcome::Running { step: 0 });
        assert!(m2.calls.lock().is_empty());

        m1.settle(MutationStatus::Success, Some(json!([1, 2, 3])));
        assert_eq!(chain.advance(), ChainOutcome::Running { step: 1 });
        assert_eq!(*m2.calls.lock(), vec![json!({"from": [1, 2, 3]})]);

        m2.settle(MutationStatus::Success, Some(json!("ok")));
        assert_eq!(chain.advance(), ChainOutcome::Completed);
    }

    #[test]
    fn test_failure_halts_and_retry_resumes() {
        let (m1, m2) = (ManualMutation::new("m1"), ManualMutation::new("m2"));
        let chain = ChainedMutations::new(
            vec![m1.clone() as Arc<dyn Mutation>, m2.clone()],
            compute(),
        );

        chain.mutate();
        m1.settle(MutationStatus::Error, None);
        assert!(matches!(
            chain.advance(),
            ChainOutcome::Halted { step: 0, ref key, .. } if key == "m1"
        ));
        assert!(m2.calls.lock().is_empty());

        let retryable = chain.mutations_with_retry();
        assert_eq!(retryable.len(), 2);
        retryable[0].retry();
        assert_eq!(m1.calls.lock().len(), 2);
        assert_eq!(chain.outcome(), ChainOutcome::Running { step: 0 });

        m1.settle(MutationStatus::Success, Some(json!(7)));
        chain.advance();
        assert_eq!(*m2.calls.lock(), vec![json!({"from": 7})]);
    }

    #[test]
    fn test_halted_outcome_into_error() {
        let halted = ChainOutcome::Halted {
            step: 1,
            key: "m2".to_string(),
            error: Some("rejected".to_string()),
        };
        let err = halted.into_result().unwrap_err();
        assert_eq!(err.to_string(), "Mutation m2 failed: rejected");
        assert!(err.is_recoverable());
        assert!(ChainOutcome::Completed.into_result().is_ok());
    }

    #[test]
    fn test_retry_recomputes_from_previous_data() {
        let (m1, m2) = (ManualMutation::new("m1"), ManualMutation::new("m2"));
        let chain = ChainedMutations::new(
            vec![m1.clone() as Arc<dyn Mutation>, m2.clone()],
            compute(),
        );
        m1.settle(MutationStatus::Success, Some(json!("fresh")));

        chain.mutations_with_retry()[1].retry();
        assert!(m1.calls.lock().is_empty());
        assert_eq!(*m2.calls.lock(), vec![json!({"from": "fresh"})]);
    }

    #[test]
    fn test_missing_compute_gives_null_input() {
        let m1 = ManualMutation::new("unmapped");
        let chain = ChainedMutations::new(vec![m1.clone() as Arc<dyn Mutation>], HashMap::new());
        chain.mutate();
        assert_eq!(*m1.calls.lock(), vec![Value::Null]);
    }

    #[test]
    fn test_empty_chain() {
        let chain = ChainedMutations::new(Vec::new(), HashMap::new());
        assert_eq!(chain.outcome(), ChainOutcome::Idle);
        chain.mutate();
        assert_eq!(chain.outcome(), ChainOutcome::Completed);
    }

    #[tokio::test]
    async fn test_run_drives_handles_to_completion() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let m1 = MutationHandle::new("m1", |_| async { Ok(json!(10)) });
        let m2 = MutationHandle::new("m2", move |input: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(input) }
        });
        let chain = ChainedMutations::new(
            vec![Arc::new(m1) as Arc<dyn Mutation>, Arc::new(m2.clone())],
            compute(),
        );

        assert_eq!(chain.run().await, ChainOutcome::Idle);
        chain.mutate();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(chain.run().await, ChainOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(m2.data(), Some(json!({"from": 10})));
    }
}
