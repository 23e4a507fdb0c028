//! Collects mutations reported by per-item call sites

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use super::chain::{ChainedMutations, ComputeVariablesFn};
use super::handle::Mutation;

/// Gathers one mutation per item until the expected number has reported in.
///
/// Reporting a key twice replaces the earlier mutation and keeps its slot.
pub struct MultiMutation {
    expected_total: usize,
    mutations: RwLock<Vec<Arc<dyn Mutation>>>,
}

impl MultiMutation {
    /// Expect one mutation per item
    pub fn new(item_count: usize) -> Self {
        Self::with_expected_total(item_count)
    }

    pub fn with_expected_total(expected_total: usize) -> Self {
        Self {
            expected_total,
            mutations: RwLock::new(Vec::new()),
        }
    }

    pub fn handle_mutation_ready(&self, mutation: Arc<dyn Mutation>) {
        let mut mutations = self.mutations.write();
        match mutations.iter().position(|m| m.key() == mutation.key()) {
            Some(slot) => mutations[slot] = mutation,
            None => mutations.push(mutation),
        }
        trace!(ready = mutations.len(), expected = self.expected_total, "Mutation ready");
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Mutation>> {
        self.mutations.read().iter().find(|m| m.key() == key).cloned()
    }

    /// Collected mutations in the order they first reported
    pub fn mutations(&self) -> Vec<Arc<dyn Mutation>> {
        self.mutations.read().clone()
    }

    pub fn len(&self) -> usize {
        self.mutations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.read().is_empty()
    }

    pub fn expected_total(&self) -> usize {
        self.expected_total
    }

    pub fn is_all_mutations_ready(&self) -> bool {
        self.expected_total == 0 || self.len() >= self.expected_total
    }

    /// Chain the collected mutations in reporting order
    pub fn chain(
        &self,
        compute_variables_for_next: HashMap<String, ComputeVariablesFn>,
    ) -> ChainedMutations {
        ChainedMutations::new(self.mutations(), compute_variables_for_next)
    }
}
