//! Pair registry: every live connection pair

use crate::error::{ForwardError, ForwardResult};
use crate::pair::{ConnectionPair, PairId};
use std::collections::HashMap;

/// Live pairs indexed by id
#[derive(Debug, Default)]
pub struct PairRegistry {
    pairs: HashMap<PairId, ConnectionPair>,
}

impl PairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pair: ConnectionPair) -> ForwardResult<()> {
        self.pairs
            .try_reserve(1)
            .map_err(|_| ForwardError::OutOfMemory)?;
        self.pairs.insert(pair.id(), pair);
        Ok(())
    }

    /// Take a pair out; `None` if it was already removed
    pub fn remove(&mut self, id: PairId) -> Option<ConnectionPair> {
        self.pairs.remove(&id)
    }

    pub fn get(&self, id: PairId) -> Option<&ConnectionPair> {
        self.pairs.get(&id)
    }

    pub fn get_mut(&mut self, id: PairId) -> Option<&mut ConnectionPair> {
        self.pairs.get_mut(&id)
    }

    pub fn contains(&self, id: PairId) -> bool {
        self.pairs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionPair> {
        self.pairs.values()
    }

    /// Ids of the pairs created for `label`
    pub fn ids_for(&self, label: &str) -> Vec<PairId> {
        let mut ids: Vec<PairId> = self
            .pairs
            .values()
            .filter(|p| p.label() == label)
            .map(|p| p.id())
            .collect();
        ids.sort();
        ids
    }

    /// Remove every pair
    pub fn drain(&mut self) -> Vec<ConnectionPair> {
        self.pairs.drain().map(|(_, pair)| pair).collect()
    }
}
