use gqlws_core::{OperationId, SubscriptionHandle};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// One running operation.
#[derive(Debug)]
pub struct OperationEntry {
    /// Distinguishes this run from earlier runs that reused the same id.
    pub generation: u64,
    pub token: CancellationToken,
    /// Set once the executor's subscribe step has succeeded.
    pub handle: Option<SubscriptionHandle>,
}

/// Registry of the operations running on one connection.
///
/// Only the connection's own loop touches it; operation tasks report back
/// through events instead of mutating it.
#[derive(Debug, Default)]
pub struct ConnectionContext {
    operations: HashMap<OperationId, OperationEntry>,
    next_generation: u64,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh entry for `id` and returns its generation and token.
    ///
    /// Callers stop any previous entry for the id first.
    pub fn register(&mut self, id: OperationId) -> (u64, CancellationToken) {
        self.next_generation += 1;
        let generation = self.next_generation;
        let token = CancellationToken::new();
        self.operations.insert(
            id,
            OperationEntry {
                generation,
                token: token.clone(),
                handle: None,
            },
        );
        (generation, token)
    }

    pub fn is_current(&self, id: &OperationId, generation: u64) -> bool {
        self.operations
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.operations.contains_key(id)
    }

    pub fn record_handle(
        &mut self,
        id: &OperationId,
        generation: u64,
        handle: SubscriptionHandle,
    ) -> bool {
        match self.operations.get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.handle = Some(handle);
                true
            }
            _ => false,
        }
    }

    pub fn handle(&self, id: &OperationId) -> Option<SubscriptionHandle> {
        self.operations.get(id).and_then(|entry| entry.handle)
    }

    /// Cancels and removes the entry for `id`, if any.
    pub fn cancel(&mut self, id: &OperationId) -> Option<OperationEntry> {
        let entry = self.operations.remove(id)?;
        entry.token.cancel();
        Some(entry)
    }

    /// Removes the entry for one generation without cancelling it.
    pub fn retire(&mut self, id: &OperationId, generation: u64) -> Option<OperationEntry> {
        if self.is_current(id, generation) {
            self.operations.remove(id)
        } else {
            None
        }
    }

    /// Cancels every entry. Returns how many were running.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.operations.len();
        for (_, entry) in self.operations.drain() {
            entry.token.cancel();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
