//! Sequencer - decides which registered operation may run
//!
//! The queue head is the only entry ever granted. The sequencer re-runs its
//! decision whenever the queue changes or the cache reports a status change,
//! always under the queue lock so each decision sees one consistent snapshot.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::cache::{CacheObserver, QueryClient, QueryKey, QueryStatus};
use crate::chained_query::queue::{QueryQueue, QueueEntry};
use crate::core::config::SequencerConfig;
use crate::core::errors::Result;

/// Head-of-line coordinator for chained queries
#[derive(Clone)]
pub struct Sequencer {
    inner: Arc<SequencerInner>,
}

struct SequencerInner {
    client: QueryClient,
    config: SequencerConfig,
    state: Mutex<SequencerState>,
}

#[derive(Default)]
struct SequencerState {
    queue: QueryQueue,
    // Head entry last seen loading, and since when
    loading_since: Option<(Uuid, Instant)>,
}

impl Sequencer {
    /// Create a sequencer observing `client`
    pub fn new(client: QueryClient, config: SequencerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(client, config))
    }

    /// Create a sequencer with [`SequencerConfig::default`]
    pub fn with_default_config(client: QueryClient) -> Self {
        Self::build(client, SequencerConfig::default())
    }

    fn build(client: QueryClient, config: SequencerConfig) -> Self {
        let inner = Arc::new(SequencerInner {
            client,
            config,
            state: Mutex::new(SequencerState::default()),
        });
        let observer: Arc<dyn CacheObserver> = inner.clone();
        inner.client.subscribe(Arc::downgrade(&observer));
        Self { inner }
    }

    /// Append an entry and re-evaluate
    pub fn push(&self, entry: QueueEntry) {
        debug!(key = %entry.query_key, entry_id = %entry.entry_id, "Queued");
        self.inner.state.lock().queue.push(entry);
        self.inner.evaluate();
    }

    /// Remove an entry by id wherever it sits. Returns whether it was queued.
    pub fn remove(&self, entry_id: Uuid) -> bool {
        let removed = self.inner.state.lock().queue.remove(entry_id);
        match removed {
            Some(entry) => {
                debug!(key = %entry.query_key, entry_id = %entry_id, "Unqueued");
                drop(entry);
                self.inner.evaluate();
                true
            }
            None => false,
        }
    }

    /// Run the decision procedure against the current snapshot
    pub fn evaluate(&self) {
        self.inner.evaluate();
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().queue.is_empty()
    }

    pub fn contains(&self, entry_id: Uuid) -> bool {
        self.inner.state.lock().queue.contains(entry_id)
    }

    /// Queued entry ids, head first
    pub fn queued_ids(&self) -> Vec<Uuid> {
        self.inner.state.lock().queue.ids()
    }

    pub fn head_key(&self) -> Option<QueryKey> {
        self.inner.state.lock().queue.head().map(|entry| entry.query_key.clone())
    }

    pub fn client(&self) -> &QueryClient {
        &self.inner.client
    }

    pub fn config(&self) -> &SequencerConfig {
        &self.inner.config
    }

    /// Start the stall monitor if a stall timeout is configured.
    ///
    /// The task ends on its own once every handle to this sequencer is gone.
    pub fn spawn_stall_monitor(&self) -> Option<JoinHandle<()>> {
        let timeout = self.inner.config.stall_timeout?;
        let period = self.inner.config.stall_check_interval;
        let weak = Arc::downgrade(&self.inner);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    trace!("Sequencer dropped, stopping stall monitor");
                    break;
                };
                inner.evict_stalled_head(timeout);
            }
        }))
    }

    /// Evict the head if it has been loading for at least `timeout`
    pub fn evict_stalled_head(&self, timeout: Duration) -> Option<Uuid> {
        self.inner.evict_stalled_head(timeout)
    }
}

impl SequencerInner {
    fn evaluate(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        loop {
            let Some(head) = state.queue.head() else {
                state.loading_since = None;
                return;
            };
            let head_id = head.entry_id;
            match self.client.status(&head.query_key) {
                Some(QueryStatus::Idle) => {
                    trace!(key = %head.query_key, entry_id = %head_id, "Granting head");
                    head.grant();
                    return;
                }
                Some(QueryStatus::Loading) => {
                    if state.loading_since.map(|(id, _)| id) != Some(head_id) {
                        state.loading_since = Some((head_id, Instant::now()));
                    }
                    return;
                }
                status => {
                    if let Some(entry) = state.queue.shift() {
                        debug!(
                            key = %entry.query_key,
                            entry_id = %entry.entry_id,
                            status = ?status,
                            "Head finished, advancing"
                        );
                    }
                }
            }
        }
    }

    fn evict_stalled_head(&self, timeout: Duration) -> Option<Uuid> {
        let evicted = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let (Some(head), Some((loading_id, since))) = (state.queue.head(), state.loading_since)
            else {
                return None;
            };
            if head.entry_id != loading_id
                || since.elapsed() < timeout
                || self.client.status(&head.query_key) != Some(QueryStatus::Loading)
            {
                return None;
            }
            state.loading_since = None;
            state.queue.shift()
        }?;

        warn!(
            key = %evicted.query_key,
            entry_id = %evicted.entry_id,
            timeout_ms = timeout.as_millis() as u64,
            "Head stalled while loading, evicting"
        );
        self.evaluate();
        Some(evicted.entry_id)
    }
}

impl CacheObserver for SequencerInner {
    fn on_status_changed(&self, _key: &QueryKey, _status: Option<QueryStatus>) {
        self.evaluate();
    }
}
