//! Request coalescing for find-by-id.
//!
//! Finds issued before a flush are queued as [`FetchTicket`]s. A flush takes
//! the queue as [`FetchBatch`]es, one per resource type (split at the
//! configured batch size), so N finds of one type cost one adapter call.
//!
//! Guarantees:
//!
//! - at most one outstanding ticket per `(type, id)`; later finds join it
//! - each ticket settles independently, so one missing id never fails its
//!   siblings
//! - a reload bumps the key's generation; results for older generations are
//!   reported stale and must not be applied
//! - a stale ticket is deferred and settles with its replacement's result

use resmodel_core::{ResourceKey, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

type FetchKey = (String, String);

/// Pending or settled result of one find.
#[derive(Debug)]
pub struct FetchTicket {
    type_name: String,
    id: String,
    generation: u64,
    result: RwLock<Option<Result<ResourceKey>>>,
}

impl FetchTicket {
    fn new(type_name: &str, id: &str, generation: u64) -> Self {
        Self {
            type_name: type_name.to_string(),
            id: id.to_string(),
            generation,
            result: RwLock::new(None),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_settled(&self) -> bool {
        self.result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Settled result, or `None` while pending.
    pub fn result(&self) -> Option<Result<ResourceKey>> {
        self.result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn settle(&self, result: Result<ResourceKey>) -> bool {
        let mut slot = self.result.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        true
    }
}

/// Ids of one type fetched together.
#[derive(Debug)]
pub struct FetchBatch {
    pub type_name: String,
    pub ids: Vec<String>,
    pub tickets: Vec<Arc<FetchTicket>>,
}

impl FetchBatch {
    /// Ticket waiting for `id` in this batch.
    pub fn ticket(&self, id: &str) -> Option<&Arc<FetchTicket>> {
        self.tickets.iter().find(|t| t.id() == id)
    }
}

/// Deduplicating batcher for find-by-id requests.
#[derive(Debug, Default)]
pub struct FindCoalescer {
    queued: Vec<Arc<FetchTicket>>,
    /// Current unsettled ticket per key, queued or in flight.
    outstanding: HashMap<FetchKey, Arc<FetchTicket>>,
    generations: HashMap<FetchKey, u64>,
    /// Stale tickets waiting on the outstanding ticket for their key.
    superseded: HashMap<FetchKey, Vec<Arc<FetchTicket>>>,
}

impl FindCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    fn fetch_key(type_name: &str, id: &str) -> FetchKey {
        (type_name.to_string(), id.to_string())
    }

    /// Queue a find, joining an outstanding ticket for the same `(type, id)`.
    pub fn find(&mut self, type_name: &str, id: &str) -> Arc<FetchTicket> {
        let key = Self::fetch_key(type_name, id);
        if let Some(ticket) = self.outstanding.get(&key) {
            if !ticket.is_settled() {
                tracing::trace!(type_name, id, "Joined outstanding find");
                return Arc::clone(ticket);
            }
        }
        let generation = self.generations.get(&key).copied().unwrap_or(0);
        self.enqueue(key, generation)
    }

    /// Queue a find that supersedes any in-flight fetch of the same key.
    ///
    /// A ticket that is still queued is reused, since it has not been sent.
    pub fn reload(&mut self, type_name: &str, id: &str) -> Arc<FetchTicket> {
        let key = Self::fetch_key(type_name, id);
        if let Some(queued) = self
            .queued
            .iter()
            .find(|t| t.type_name == type_name && t.id == id)
        {
            return Arc::clone(queued);
        }
        let generation = self.generations.entry(key.clone()).or_insert(0);
        *generation += 1;
        let generation = *generation;
        tracing::debug!(type_name, id, generation, "Superseding in-flight find");
        self.enqueue(key, generation)
    }

    fn enqueue(&mut self, key: FetchKey, generation: u64) -> Arc<FetchTicket> {
        let ticket = Arc::new(FetchTicket::new(&key.0, &key.1, generation));
        self.queued.push(Arc::clone(&ticket));
        self.outstanding.insert(key, Arc::clone(&ticket));
        ticket
    }

    /// Number of queued (not yet dispatched) tickets.
    pub fn pending(&self) -> usize {
        self.queued.len()
    }

    /// Number of unsettled tickets, queued or in flight.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Drain the queue into per-type batches of at most `max_batch_size` ids,
    /// in first-queued order.
    pub fn take_batches(&mut self, max_batch_size: usize) -> Vec<FetchBatch> {
        let max_batch_size = max_batch_size.max(1);
        let mut order: Vec<String> = Vec::new();
        let mut by_type: HashMap<String, Vec<Arc<FetchTicket>>> = HashMap::new();
        for ticket in self.queued.drain(..) {
            if !by_type.contains_key(ticket.type_name()) {
                order.push(ticket.type_name().to_string());
            }
            by_type
                .entry(ticket.type_name().to_string())
                .or_default()
                .push(ticket);
        }

        let mut batches = Vec::new();
        for type_name in order {
            let tickets = by_type.remove(&type_name).unwrap_or_default();
            for chunk in tickets.chunks(max_batch_size) {
                batches.push(FetchBatch {
                    type_name: type_name.clone(),
                    ids: chunk.iter().map(|t| t.id().to_string()).collect(),
                    tickets: chunk.to_vec(),
                });
            }
        }
        if !batches.is_empty() {
            tracing::debug!(batches = batches.len(), "Dispatching coalesced finds");
        }
        batches
    }

    /// Whether a ticket's result may still be applied.
    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        let key = Self::fetch_key(ticket.type_name(), ticket.id());
        self.generations.get(&key).copied().unwrap_or(0) == ticket.generation()
    }

    /// Park a stale ticket until the outstanding ticket for its key settles.
    ///
    /// Returns false when nothing is outstanding, i.e. the replacement has
    /// already settled; the caller then settles the ticket itself.
    pub fn defer(&mut self, ticket: &Arc<FetchTicket>) -> bool {
        let key = Self::fetch_key(ticket.type_name(), ticket.id());
        let replaced = self
            .outstanding
            .get(&key)
            .is_some_and(|current| !Arc::ptr_eq(current, ticket) && !current.is_settled());
        if replaced {
            tracing::trace!(type_name = ticket.type_name(), id = ticket.id(), "Deferred stale find");
            self.superseded.entry(key).or_default().push(Arc::clone(ticket));
        }
        replaced
    }

    /// Resolve or reject a ticket and release its `(type, id)` slot.
    ///
    /// Settling the outstanding ticket also settles the stale tickets deferred
    /// behind it.
    pub fn settle(&mut self, ticket: &Arc<FetchTicket>, result: Result<ResourceKey>) -> bool {
        let key = Self::fetch_key(ticket.type_name(), ticket.id());
        if self
            .outstanding
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, ticket))
        {
            self.outstanding.remove(&key);
            for waiter in self.superseded.remove(&key).unwrap_or_default() {
                waiter.settle(result.clone());
            }
        }
        ticket.settle(result)
    }
}
