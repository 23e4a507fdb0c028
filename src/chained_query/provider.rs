//! Provider scope for chained queries
//!
//! One provider owns one sequencer. Code running inside
//! [`ChainedQueryProvider::scope`] can register queries through
//! [`use_chained_query`] without passing the provider around.

use std::future::Future;
use tracing::debug;

use crate::cache::QueryClient;
use crate::chained_query::hook::{ChainedQuery, ChainedQueryOptions};
use crate::chained_query::sequencer::Sequencer;
use crate::core::config::SequencerConfig;
use crate::core::errors::{ChainedQueryError, Result};

tokio::task_local! {
    static CURRENT_PROVIDER: ChainedQueryProvider;
}

#[derive(Clone)]
pub struct ChainedQueryProvider {
    sequencer: Sequencer,
}

impl ChainedQueryProvider {
    /// Provider with the default configuration
    pub fn new(client: QueryClient) -> Self {
        Self {
            sequencer: Sequencer::with_default_config(client),
        }
    }

    /// Provider with a custom configuration. Starts the stall monitor when a
    /// stall timeout is set, so this must run inside a tokio runtime in that
    /// case.
    pub fn with_config(client: QueryClient, config: SequencerConfig) -> Result<Self> {
        let sequencer = Sequencer::new(client, config)?;
        if sequencer.spawn_stall_monitor().is_some() {
            debug!("Stall monitor started");
        }
        Ok(Self { sequencer })
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn client(&self) -> &QueryClient {
        self.sequencer.client()
    }

    /// Register a query with this provider's sequencer
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime, since a queued query
    /// spawns the task that waits for its grant.
    pub fn register(&self, options: ChainedQueryOptions) -> ChainedQuery {
        ChainedQuery::activate(&self.sequencer, options)
    }

    /// Run `future` with this provider as the current one
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        CURRENT_PROVIDER.scope(self.clone(), future).await
    }

    /// Run `f` with this provider as the current one
    pub fn sync_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT_PROVIDER.sync_scope(self.clone(), f)
    }

    /// The provider of the enclosing scope
    pub fn current() -> Result<Self> {
        CURRENT_PROVIDER
            .try_with(|provider| provider.clone())
            .map_err(|_| ChainedQueryError::MissingProvider)
    }
}

/// Register a query with the provider of the enclosing scope.
///
/// Fails with [`ChainedQueryError::MissingProvider`] outside a provider
/// scope.
///
/// # Panics
///
/// Panics when called outside a tokio runtime, like
/// [`ChainedQueryProvider::register`].
pub fn use_chained_query(options: ChainedQueryOptions) -> Result<ChainedQuery> {
    let provider = ChainedQueryProvider::current()?;
    Ok(provider.register(options))
}
