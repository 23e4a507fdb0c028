//! In-memory query cache
//!
//! Holds per-key state, deduplicates concurrent fetches of the same key and
//! reports every status change to synchronous observers and to a watch
//! revision for async waiters.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::key::{QueryKey, QueryState, QueryStatus};

/// Fetch function stored by the cache and by chained queries
pub type QueryFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`QueryFn`]
pub fn query_fn<F, Fut>(f: F) -> QueryFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Receives status changes synchronously.
///
/// Called after the cache has released its own locks, so implementations
/// may read the cache. They must not block.
pub trait CacheObserver: Send + Sync {
    fn on_status_changed(&self, key: &QueryKey, status: Option<QueryStatus>);
}

#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    queries: DashMap<QueryKey, QueryState>,
    observers: RwLock<Vec<Weak<dyn CacheObserver>>>,
    revision: watch::Sender<u64>,
}

impl QueryClient {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(ClientInner {
                queries: DashMap::new(),
                observers: RwLock::new(Vec::new()),
                revision,
            }),
        }
    }

    /// Current status of a key, `None` if the key is unknown
    pub fn status(&self, key: &QueryKey) -> Option<QueryStatus> {
        self.inner.queries.get(key).map(|state| state.status)
    }

    /// Snapshot of a key's state
    pub fn find(&self, key: &QueryKey) -> Option<QueryState> {
        self.inner.queries.get(key).map(|state| state.clone())
    }

    /// Create an idle entry for `key` if there is none yet
    pub fn ensure(&self, key: &QueryKey) -> QueryStatus {
        let (status, inserted) = {
            let mut inserted = false;
            let entry = self.inner.queries.entry(key.clone()).or_insert_with(|| {
                inserted = true;
                QueryState::default()
            });
            (entry.status, inserted)
        };
        if inserted {
            trace!(key = %key, "Query created");
            self.notify(key, Some(status));
        }
        status
    }

    /// Start fetching `key` unless a fetch for it is already in flight.
    ///
    /// `fetch` is invoked before this returns; the future it produces runs
    /// on the tokio runtime and is never cancelled by the cache. Returns
    /// `false` when the call was deduplicated.
    pub fn fetch(&self, key: &QueryKey, fetch: QueryFn) -> bool {
        let started = {
            let mut entry = self.inner.queries.entry(key.clone()).or_default();
            if entry.status == QueryStatus::Loading {
                false
            } else {
                entry.status = QueryStatus::Loading;
                entry.error = None;
                entry.fetch_count += 1;
                true
            }
        };
        if !started {
            debug!(key = %key, "Fetch already in flight, deduplicated");
            return false;
        }

        debug!(key = %key, "Fetch started");
        self.notify(key, Some(QueryStatus::Loading));

        let future = fetch();
        let client = self.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let outcome = future.await;
            client.settle(&key, outcome);
        });
        true
    }

    fn settle(&self, key: &QueryKey, outcome: anyhow::Result<Value>) {
        let status = {
            let Some(mut entry) = self.inner.queries.get_mut(key) else {
                debug!(key = %key, "Fetch settled for a removed query, dropping result");
                return;
            };
            match outcome {
                Ok(data) => {
                    entry.status = QueryStatus::Success;
                    entry.data = Some(data);
                    entry.error = None;
                }
                Err(err) => {
                    entry.status = QueryStatus::Error;
                    entry.error = Some(err.to_string());
                }
            }
            entry.status
        };
        debug!(key = %key, status = %status, "Fetch settled");
        self.notify(key, Some(status));
    }

    /// Store `data` for `key` as a successful result
    pub fn set_query_data(&self, key: &QueryKey, data: Value) {
        {
            let mut entry = self.inner.queries.entry(key.clone()).or_default();
            entry.status = QueryStatus::Success;
            entry.data = Some(data);
            entry.error = None;
        }
        self.notify(key, Some(QueryStatus::Success));
    }

    pub fn remove(&self, key: &QueryKey) -> Option<QueryState> {
        let removed = self.inner.queries.remove(key).map(|(_, state)| state);
        if removed.is_some() {
            self.notify(key, None);
        }
        removed
    }

    /// Drop every cached query
    pub fn clear(&self) {
        let keys: Vec<QueryKey> = self.inner.queries.iter().map(|e| e.key().clone()).collect();
        self.inner.queries.clear();
        for key in &keys {
            self.notify(key, None);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queries.is_empty()
    }

    /// Register a synchronous observer. Dropped observers are pruned.
    pub fn subscribe(&self, observer: Weak<dyn CacheObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Revision counter bumped on every change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    /// Wait until `predicate` holds for the key's current state
    pub async fn wait_for<P>(&self, key: &QueryKey, predicate: P) -> Option<QueryState>
    where
        P: Fn(Option<&QueryState>) -> bool,
    {
        let mut changes = self.changes();
        loop {
            changes.borrow_and_update();
            let state = self.find(key);
            if predicate(state.as_ref()) {
                return state;
            }
            if changes.changed().await.is_err() {
                return self.find(key);
            }
        }
    }

    // Observers run before async waiters are woken, so a waiter never sees
    // a status the sequencer has not reacted to yet
    fn notify(&self, key: &QueryKey, status: Option<QueryStatus>) {
        let live: Vec<Arc<dyn CacheObserver>> = {
            let mut observers = self.inner.observers.write();
            observers.retain(|observer| observer.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in live {
            observer.on_status_changed(key, status);
        }

        self.inner.revision.send_modify(|revision| *revision += 1);
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}
