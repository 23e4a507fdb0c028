//! Per call-site registration with the sequencer
//!
//! A [`ChainedQuery`] is one activation of a call site. It queues itself on
//! creation, keeps its fetch disabled until the sequencer grants it, and
//! leaves the queue on settlement or when dropped.

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::cache::{query_fn, QueryClient, QueryFn, QueryKey, QueryState, QueryStatus};
use crate::chained_query::queue::QueueEntry;
use crate::chained_query::sequencer::Sequencer;
use crate::core::errors::{ChainedQueryError, Result};

/// Called once the operation settles with its data or error message
pub type SettledFn = Arc<dyn Fn(Option<&Value>, Option<&str>) + Send + Sync>;

/// Declaration of one chained query
#[derive(Clone)]
pub struct ChainedQueryOptions {
    pub query_key: QueryKey,
    pub query_fn: QueryFn,
    /// Caller-side enable condition, combined with the grant by AND
    pub enabled: Option<bool>,
    pub on_settled: Option<SettledFn>,
}

impl ChainedQueryOptions {
    pub fn new<F, Fut>(query_key: impl Into<QueryKey>, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            query_key: query_key.into(),
            query_fn: query_fn(fetch),
            enabled: None,
            on_settled: None,
        }
    }

    /// Build options around an existing [`QueryFn`]
    pub fn from_query_fn(query_key: impl Into<QueryKey>, query_fn: QueryFn) -> Self {
        Self {
            query_key: query_key.into(),
            query_fn,
            enabled: None,
            on_settled: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn on_settled<F>(mut self, callback: F) -> Self
    where
        F: Fn(Option<&Value>, Option<&str>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ChainedQueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedQueryOptions")
            .field("query_key", &self.query_key)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// What a call site sees of its operation
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryResult {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl QueryResult {
    fn from_state(state: Option<QueryState>) -> Self {
        match state {
            Some(state) => Self {
                status: state.status,
                data: state.data,
                error: state.error,
            },
            None => Self {
                status: QueryStatus::Idle,
                data: None,
                error: None,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }
}

/// Handle for one activation of a chained query.
///
/// Dropping it removes the entry from the queue. A fetch that already
/// started keeps running in the cache.
pub struct ChainedQuery {
    query_key: QueryKey,
    entry_id: Option<Uuid>,
    sequencer: Sequencer,
    enabled: watch::Sender<bool>,
    granted: watch::Receiver<bool>,
    gate: Option<JoinHandle<()>>,
}

impl ChainedQuery {
    pub(crate) fn activate(sequencer: &Sequencer, options: ChainedQueryOptions) -> Self {
        let client = sequencer.client().clone();
        let ChainedQueryOptions {
            query_key,
            query_fn,
            enabled,
            on_settled,
        } = options;
        let (enabled_tx, enabled_rx) = watch::channel(enabled.unwrap_or(true));

        let resolved = client
            .find(&query_key)
            .is_some_and(|state| state.status.is_terminal());
        if resolved {
            debug!(key = %query_key, "Already resolved in cache, not queueing");
            let (_, granted_rx) = watch::channel(false);
            return Self {
                query_key,
                entry_id: None,
                sequencer: sequencer.clone(),
                enabled: enabled_tx,
                granted: granted_rx,
                gate: None,
            };
        }

        client.ensure(&query_key);
        let entry_id = Uuid::new_v4();
        let (granted_tx, granted_rx) = watch::channel(false);

        let gate = tokio::spawn(run_gate(Gate {
            query_key: query_key.clone(),
            entry_id,
            client,
            sequencer: sequencer.clone(),
            query_fn,
            on_settled,
            granted: granted_rx.clone(),
            enabled: enabled_rx,
        }));

        sequencer.push(QueueEntry::new(query_key.clone(), entry_id, move || {
            granted_tx.send_if_modified(|granted| !std::mem::replace(granted, true));
        }));

        Self {
            query_key,
            entry_id: Some(entry_id),
            sequencer: sequencer.clone(),
            enabled: enabled_tx,
            granted: granted_rx,
            gate: Some(gate),
        }
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    /// Queue entry id, `None` when the result came straight from the cache
    pub fn entry_id(&self) -> Option<Uuid> {
        self.entry_id
    }

    pub fn is_queued(&self) -> bool {
        self.entry_id.is_some_and(|id| self.sequencer.contains(id))
    }

    pub fn is_granted(&self) -> bool {
        *self.granted.borrow()
    }

    /// Change the caller-side enable condition
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.send_replace(enabled);
    }

    pub fn result(&self) -> QueryResult {
        QueryResult::from_state(self.sequencer.client().find(&self.query_key))
    }

    pub fn status(&self) -> QueryStatus {
        self.result().status
    }

    pub fn data(&self) -> Option<Value> {
        self.result().data
    }

    pub fn error(&self) -> Option<String> {
        self.result().error
    }

    /// Wait until the cached status for this key equals `status`
    pub async fn wait_for_status(&self, status: QueryStatus) -> QueryResult {
        let state = self
            .sequencer
            .client()
            .wait_for(&self.query_key, |state| {
                state.map_or(QueryStatus::Idle, |s| s.status) == status
            })
            .await;
        QueryResult::from_state(state)
    }

    /// Wait for the key to settle and return its data.
    ///
    /// An error status becomes [`ChainedQueryError::QueryFailed`], as does a
    /// key removed from the cache before it settled. Success without data
    /// yields `Value::Null`.
    pub async fn settled(&self) -> Result<Value> {
        let state = self
            .sequencer
            .client()
            .wait_for(&self.query_key, |state| {
                state.map_or(true, |s| s.status.is_terminal())
            })
            .await;
        match state {
            Some(state) if state.status == QueryStatus::Success => {
                Ok(state.data.unwrap_or(Value::Null))
            }
            Some(state) => Err(ChainedQueryError::query_failed(
                self.query_key.to_string(),
                state.error.unwrap_or_else(|| "query failed".to_string()),
            )),
            None => Err(ChainedQueryError::query_failed(
                self.query_key.to_string(),
                "removed from the cache before settling",
            )),
        }
    }

    /// Leave the queue now. Same as dropping the handle.
    pub fn teardown(self) {
        drop(self);
    }
}

impl Drop for ChainedQuery {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.abort();
        }
        if let Some(entry_id) = self.entry_id {
            if self.sequencer.remove(entry_id) {
                trace!(key = %self.query_key, entry_id = %entry_id, "Torn down while queued");
            }
        }
    }
}

impl fmt::Debug for ChainedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedQuery")
            .field("query_key", &self.query_key)
            .field("entry_id", &self.entry_id)
            .field("granted", &self.is_granted())
            .finish_non_exhaustive()
    }
}

struct Gate {
    query_key: QueryKey,
    entry_id: Uuid,
    client: QueryClient,
    sequencer: Sequencer,
    query_fn: QueryFn,
    on_settled: Option<SettledFn>,
    granted: watch::Receiver<bool>,
    enabled: watch::Receiver<bool>,
}

async fn run_gate(mut gate: Gate) {
    // Cleared when the sequencer shifts the entry out without granting it,
    // which happens once the key settled through another caller
    let mut queued = true;
    loop {
        let granted = *gate.granted.borrow_and_update();
        let enabled = *gate.enabled.borrow_and_update();
        if granted && enabled {
            break;
        }
        tokio::select! {
            res = gate.granted.changed() => {
                if res.is_err() {
                    trace!(
                        key = %gate.query_key,
                        entry_id = %gate.entry_id,
                        "Shifted out before grant"
                    );
                    queued = false;
                    break;
                }
            }
            res = gate.enabled.changed() => {
                if res.is_err() {
                    return;
                }
            }
        }
    }

    // Another caller may have resolved the same key in the meantime
    let resolved = gate
        .client
        .status(&gate.query_key)
        .is_some_and(QueryStatus::is_terminal);
    if queued && !resolved {
        debug!(key = %gate.query_key, entry_id = %gate.entry_id, "Granted, fetching");
        gate.client.fetch(&gate.query_key, gate.query_fn.clone());
    }

    let settled = gate
        .client
        .wait_for(&gate.query_key, |state| {
            state.map_or(true, |s| s.status.is_terminal())
        })
        .await;

    if let (Some(callback), Some(state)) = (&gate.on_settled, &settled) {
        callback(state.data.as_ref(), state.error.as_deref());
    }
    gate.sequencer.remove(gate.entry_id);
}
