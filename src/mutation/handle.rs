//! Async mutation with observable status
//!
//! [`MutationHandle`] is the write-side counterpart of the query cache: it
//! runs a user function on demand and exposes status, data and error.

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Mutation function: variables in, data out
pub type MutateFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Idle,
    Loading,
    Success,
    Error,
}

impl MutationStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, MutationStatus::Success | MutationStatus::Error)
    }
}

/// Snapshot of a mutation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationState {
    pub status: MutationStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
    /// Variables of the latest submission
    pub variables: Option<Value>,
    pub submitted_count: u32,
}

impl Default for MutationState {
    fn default() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
            submitted_count: 0,
        }
    }
}

/// A write operation as seen by [`ChainedMutations`](crate::mutation::ChainedMutations).
///
/// `mutate` and `retry` must start the work without blocking and must not
/// call back into the chain.
pub trait Mutation: Send + Sync {
    fn key(&self) -> &str;

    fn mutate(&self, input: Value);

    fn status(&self) -> MutationStatus;

    fn data(&self) -> Option<Value>;

    fn error(&self) -> Option<String> {
        None
    }

    /// Re-run the latest submission
    fn retry(&self);

    /// Revision counter bumped whenever the state changes
    fn changes(&self) -> watch::Receiver<u64>;
}

#[derive(Clone)]
pub struct MutationHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    key: String,
    mutate_fn: MutateFn,
    state: Mutex<HandleState>,
    revision: watch::Sender<u64>,
}

#[derive(Default)]
struct HandleState {
    snapshot: MutationState,
    // Id of the latest submission; older ones settle silently
    current_run: u64,
}

impl MutationHandle {
    pub fn new<F, Fut>(key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let mutate_fn: MutateFn = Arc::new(move |input| f(input).boxed());
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(HandleInner {
                key: key.into(),
                mutate_fn,
                state: Mutex::new(HandleState::default()),
                revision,
            }),
        }
    }

    pub fn state(&self) -> MutationState {
        self.inner.state.lock().snapshot.clone()
    }

    /// Back to idle, forgetting data and error
    pub fn reset(&self) {
        {
            let mut state = self.inner.state.lock();
            state.current_run += 1;
            state.snapshot = MutationState {
                submitted_count: state.snapshot.submitted_count,
                ..MutationState::default()
            };
        }
        self.bump();
    }

    /// Wait until the latest submission settles
    pub async fn settled(&self) -> MutationState {
        let mut changes = self.changes();
        loop {
            changes.borrow_and_update();
            let state = self.state();
            if state.status.is_settled() {
                return state;
            }
            if changes.changed().await.is_err() {
                return self.state();
            }
        }
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|revision| *revision += 1);
    }

    fn submit(&self, input: Value) {
        let run = {
            let mut state = self.inner.state.lock();
            state.current_run += 1;
            state.snapshot.status = MutationStatus::Loading;
            state.snapshot.error = None;
            state.snapshot.variables = Some(input.clone());
            state.snapshot.submitted_count += 1;
            state.current_run
        };
        debug!(key = %self.inner.key, run, "Mutation submitted");
        self.bump();

        let future = (self.inner.mutate_fn)(input);
        let handle = self.clone();
        tokio::spawn(async move {
            let outcome = future.await;
            handle.finish(run, outcome);
        });
    }

    fn finish(&self, run: u64, outcome: anyhow::Result<Value>) {
        {
            let mut state = self.inner.state.lock();
            if state.current_run != run {
                trace!(key = %self.inner.key, run, "Superseded mutation settled, ignoring");
                return;
            }
            match outcome {
                Ok(data) => {
                    state.snapshot.status = MutationStatus::Success;
                    state.snapshot.data = Some(data);
                }
                Err(err) => {
                    state.snapshot.status = MutationStatus::Error;
                    state.snapshot.error = Some(err.to_string());
                }
            }
            debug!(key = %self.inner.key, status = ?state.snapshot.status, "Mutation settled");
        }
        self.bump();
    }
}

impl Mutation for MutationHandle {
    fn key(&self) -> &str {
        &self.inner.key
    }

    fn mutate(&self, input: Value) {
        self.submit(input);
    }

    fn status(&self) -> MutationStatus {
        self.inner.state.lock().snapshot.status
    }

    fn data(&self) -> Option<Value> {
        self.inner.state.lock().snapshot.data.clone()
    }

    fn error(&self) -> Option<String> {
        self.inner.state.lock().snapshot.error.clone()
    }

    fn retry(&self) {
        let variables = self.inner.state.lock().snapshot.variables.clone();
        self.submit(variables.unwrap_or(Value::Null));
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }
}

impl fmt::Debug for MutationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mutation_success() {
        let handle = MutationHandle::new("double", |input: Value| async move {
            let n = input.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });

        handle.mutate(json!(21));
        assert_eq!(handle.status(), MutationStatus::Loading);

        let state = handle.settled().await;
        assert_eq!(state.status, MutationStatus::Success);
        assert_eq!(state.data, Some(json!(42)));
        assert_eq!(state.variables, Some(json!(21)));
        assert_eq!(state.submitted_count, 1);
    }

    #[tokio::test]
    async fn test_mutation_error_then_retry() {
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = attempts.clone();
        let handle = MutationHandle::new("flaky", move |input: Value| {
            let attempt = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    anyhow::bail!("first attempt fails");
                }
                Ok(input)
            }
        });

        handle.mutate(json!("payload"));
        let state = handle.settled().await;
        assert_eq!(state.status, MutationStatus::Error);
        assert_eq!(handle.error().as_deref(), Some("first attempt fails"));

        handle.retry();
        let state = handle.settled().await;
        assert_eq!(state.status, MutationStatus::Success);
        assert_eq!(state.data, Some(json!("payload")));
        assert_eq!(state.submitted_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_submission_wins() {
        let handle = MutationHandle::new("echo", |input: Value| async move {
            let delay = input.as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(input)
        });

        handle.mutate(json!(500));
        handle.mutate(json!(100));
        let state = handle.settled().await;
        assert_eq!(state.data, Some(json!(100)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.data(), Some(json!(100)));
    }

    #[tokio::test]
    async fn test_reset() {
        let handle = MutationHandle::new("noop", |_| async { Ok(Value::Null) });
        handle.mutate(Value::Null);
        handle.settled().await;
        handle.reset();
        assert_eq!(handle.status(), MutationStatus::Idle);
        assert_eq!(handle.data(), None);
        assert_eq!(handle.state().submitted_count, 1);
    }
}
