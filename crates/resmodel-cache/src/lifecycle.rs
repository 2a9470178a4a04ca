//! Record lifecycle state machine.
//!
//! Each resource key moves through a finite set of states:
//!
//! ```text
//! Empty ── load ──▶ Loading ── loaded ──▶ Loaded.Saved
//! Empty ── create ─▶ Loaded.Created.Uncommitted
//! Loaded.Saved ── dirty ──▶ Loaded.Updated.Uncommitted ── willCommit ──▶ *.InFlight
//! *.InFlight ── didCommit ──▶ Loaded.Saved
//!            ── becameInvalid ──▶ *.Invalid
//!            ── becameError ──▶ Error
//! Loaded.* ── delete ──▶ Deleted.Uncommitted ──▶ Deleted.InFlight ──▶ Deleted.Saved
//! ```
//!
//! Transitions not listed in [`RecordState::next`] are rejected with
//! [`Error::InvalidState`].

use resmodel_core::{Error, ResourceKey, Result, StateError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Sub-state of a loaded, dirty record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CommitPhase {
    Uncommitted,
    InFlight,
    Invalid,
}

/// Sub-state of a deleted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeletePhase {
    Uncommitted,
    InFlight,
    Saved,
}

/// Operation that failed when a record entered the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorPhase {
    Loading,
    Created,
    Updated,
    Deleted,
}

/// Lifecycle state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordState {
    Empty,
    Loading,
    LoadedSaved,
    LoadedCreated(CommitPhase),
    LoadedUpdated(CommitPhase),
    Deleted(DeletePhase),
    Error(ErrorPhase),
}

/// Events that drive [`RecordState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// A fetch for the record started.
    StartLoading,
    /// Canonical data arrived (push or fetch result).
    Loaded,
    /// A fetch failed.
    LoadFailed,
    /// The record was created locally.
    Create,
    /// A local write left the overlay non-empty.
    BecomeDirty,
    /// A local write emptied the overlay.
    BecomeClean,
    /// A commit was handed to the adapter.
    WillCommit,
    /// The adapter accepted the commit.
    DidCommit,
    /// The adapter reported validation errors.
    BecameInvalid,
    /// The adapter reported a non-validation failure.
    BecameError,
    /// Every validation error was cleared.
    BecameValid,
    /// The record was marked for deletion.
    Delete,
    /// Local changes were discarded.
    Rollback,
    /// The record is being removed from the store.
    Unload,
}

impl LifecycleEvent {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::StartLoading => "startLoading",
            LifecycleEvent::Loaded => "loaded",
            LifecycleEvent::LoadFailed => "loadFailed",
            LifecycleEvent::Create => "create",
            LifecycleEvent::BecomeDirty => "becomeDirty",
            LifecycleEvent::BecomeClean => "becomeClean",
            LifecycleEvent::WillCommit => "willCommit",
            LifecycleEvent::DidCommit => "didCommit",
            LifecycleEvent::BecameInvalid => "becameInvalid",
            LifecycleEvent::BecameError => "becameError",
            LifecycleEvent::BecameValid => "becameValid",
            LifecycleEvent::Delete => "deleteRecord",
            LifecycleEvent::Rollback => "rollback",
            LifecycleEvent::Unload => "unloadRecord",
        }
    }
}

impl RecordState {
    /// Dotted state path, e.g. `loaded.updated.inFlight`.
    pub const fn as_str(&self) -> &'static str {
        use CommitPhase as C;
        match self {
            RecordState::Empty => "empty",
            RecordState::Loading => "loading",
            RecordState::LoadedSaved => "loaded.saved",
            RecordState::LoadedCreated(C::Uncommitted) => "loaded.created.uncommitted",
            RecordState::LoadedCreated(C::InFlight) => "loaded.created.inFlight",
            RecordState::LoadedCreated(C::Invalid) => "loaded.created.invalid",
            RecordState::LoadedUpdated(C::Uncommitted) => "loaded.updated.uncommitted",
            RecordState::LoadedUpdated(C::InFlight) => "loaded.updated.inFlight",
            RecordState::LoadedUpdated(C::Invalid) => "loaded.updated.invalid",
            RecordState::Deleted(DeletePhase::Uncommitted) => "deleted.uncommitted",
            RecordState::Deleted(DeletePhase::InFlight) => "deleted.inFlight",
            RecordState::Deleted(DeletePhase::Saved) => "deleted.saved",
            RecordState::Error(_) => "error",
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, RecordState::Empty)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, RecordState::Loading)
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, RecordState::Empty | RecordState::Loading)
    }

    pub fn is_dirty(&self) -> bool {
        matches!(
            self,
            RecordState::LoadedCreated(_)
                | RecordState::LoadedUpdated(_)
                | RecordState::Deleted(DeletePhase::Uncommitted | DeletePhase::InFlight)
        ) || matches!(
            self,
            RecordState::Error(ErrorPhase::Created | ErrorPhase::Updated | ErrorPhase::Deleted)
        )
    }

    pub fn is_saving(&self) -> bool {
        matches!(
            self,
            RecordState::LoadedCreated(CommitPhase::InFlight)
                | RecordState::LoadedUpdated(CommitPhase::InFlight)
                | RecordState::Deleted(DeletePhase::InFlight)
        )
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, RecordState::Deleted(_))
    }

    pub fn is_new(&self) -> bool {
        matches!(
            self,
            RecordState::LoadedCreated(_) | RecordState::Error(ErrorPhase::Created)
        )
    }

    pub fn is_valid(&self) -> bool {
        !matches!(
            self,
            RecordState::LoadedCreated(CommitPhase::Invalid)
                | RecordState::LoadedUpdated(CommitPhase::Invalid)
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RecordState::Error(_))
    }

    /// State reached by applying `event`, or `None` if the event is illegal.
    pub fn next(self, event: LifecycleEvent) -> Option<RecordState> {
        use CommitPhase as C;
        use LifecycleEvent as E;
        use RecordState as S;

        let next = match (self, event) {
            (S::Empty, E::StartLoading) => S::Loading,
            (S::Empty | S::Loading, E::Loaded) => S::LoadedSaved,
            (S::Empty, E::Create) => S::LoadedCreated(C::Uncommitted),
            (S::Empty | S::Loading, E::Unload) => S::Empty,
            (S::Loading, E::StartLoading) => S::Loading,
            (S::Loading, E::LoadFailed) => S::Error(ErrorPhase::Loading),

            (S::LoadedSaved, E::StartLoading | E::Loaded | E::BecomeClean | E::Rollback) => {
                S::LoadedSaved
            }
            (S::LoadedSaved, E::LoadFailed) => S::LoadedSaved,
            (S::LoadedSaved, E::BecomeDirty) => S::LoadedUpdated(C::Uncommitted),
            (S::LoadedSaved, E::Delete) => S::Deleted(DeletePhase::Uncommitted),
            (S::LoadedSaved, E::Unload) => S::Empty,

            // Created records stay dirty until the server accepts them.
            (S::LoadedCreated(phase), E::BecomeDirty | E::BecomeClean | E::Loaded) => {
                S::LoadedCreated(phase)
            }
            (S::LoadedCreated(C::Uncommitted | C::Invalid), E::WillCommit) => {
                S::LoadedCreated(C::InFlight)
            }
            (S::LoadedCreated(C::InFlight), E::DidCommit) => S::LoadedSaved,
            (S::LoadedCreated(C::InFlight), E::BecameInvalid) => S::LoadedCreated(C::Invalid),
            (S::LoadedCreated(C::InFlight), E::BecameError) => S::Error(ErrorPhase::Created),
            (S::LoadedCreated(C::Invalid), E::BecameValid) => S::LoadedCreated(C::Uncommitted),
            (S::LoadedCreated(_), E::Rollback) => S::Empty,
            (S::LoadedCreated(C::Uncommitted | C::Invalid), E::Delete) => {
                S::Deleted(DeletePhase::Saved)
            }

            (S::LoadedUpdated(C::Uncommitted), E::BecomeDirty | E::Loaded) => {
                S::LoadedUpdated(C::Uncommitted)
            }
            (S::LoadedUpdated(C::Uncommitted), E::BecomeClean) => S::LoadedSaved,
            (S::LoadedUpdated(C::Uncommitted | C::Invalid), E::WillCommit) => {
                S::LoadedUpdated(C::InFlight)
            }
            (S::LoadedUpdated(C::InFlight), E::BecomeDirty | E::BecomeClean | E::Loaded) => {
                S::LoadedUpdated(C::InFlight)
            }
            (S::LoadedUpdated(C::InFlight), E::DidCommit) => S::LoadedSaved,
            (S::LoadedUpdated(C::InFlight), E::BecameInvalid) => S::LoadedUpdated(C::Invalid),
            (S::LoadedUpdated(C::InFlight), E::BecameError) => S::Error(ErrorPhase::Updated),
            (S::LoadedUpdated(C::Invalid), E::BecomeDirty | E::BecomeClean | E::Loaded) => {
                S::LoadedUpdated(C::Invalid)
            }
            (S::LoadedUpdated(C::Invalid), E::BecameValid) => S::LoadedUpdated(C::Uncommitted),
            (S::LoadedUpdated(_), E::Rollback) => S::LoadedSaved,
            (S::LoadedUpdated(C::Uncommitted | C::Invalid), E::Delete) => {
                S::Deleted(DeletePhase::Uncommitted)
            }

            (S::Deleted(DeletePhase::Uncommitted), E::WillCommit) => {
                S::Deleted(DeletePhase::InFlight)
            }
            (S::Deleted(DeletePhase::InFlight), E::DidCommit) => S::Deleted(DeletePhase::Saved),
            (S::Deleted(DeletePhase::InFlight), E::BecameInvalid | E::BecameError) => {
                S::Error(ErrorPhase::Deleted)
            }
            (S::Deleted(DeletePhase::Uncommitted | DeletePhase::InFlight), E::Rollback) => {
                S::LoadedSaved
            }
            (S::Deleted(phase), E::Loaded | E::BecomeDirty | E::BecomeClean) => S::Deleted(phase),
            (S::Deleted(DeletePhase::Saved), E::Unload) => S::Empty,

            (S::Error(ErrorPhase::Loading), E::StartLoading) => S::Loading,
            (S::Error(ErrorPhase::Loading), E::Loaded) => S::LoadedSaved,
            (S::Error(ErrorPhase::Loading) | S::Error(ErrorPhase::Created), E::Unload) => {
                S::Empty
            }
            (S::Error(ErrorPhase::Created), E::WillCommit) => S::LoadedCreated(C::InFlight),
            (S::Error(ErrorPhase::Updated), E::WillCommit) => S::LoadedUpdated(C::InFlight),
            (S::Error(ErrorPhase::Deleted), E::WillCommit) => S::Deleted(DeletePhase::InFlight),
            (S::Error(ErrorPhase::Created), E::Rollback) => S::Empty,
            (S::Error(ErrorPhase::Updated | ErrorPhase::Deleted), E::Rollback) => S::LoadedSaved,
            (S::Error(phase), E::BecomeDirty | E::BecomeClean | E::Loaded) => S::Error(phase),

            _ => return None,
        };
        Some(next)
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states for every known key. Unknown keys are `Empty`.
#[derive(Debug, Default)]
pub struct LifecycleTable {
    states: HashMap<ResourceKey, RecordState>,
}

impl LifecycleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, key: &ResourceKey) -> RecordState {
        self.states.get(key).copied().unwrap_or(RecordState::Empty)
    }

    /// Apply `event` to the key's state.
    pub fn send(&mut self, key: &ResourceKey, event: LifecycleEvent) -> Result<RecordState> {
        let current = self.state(key);
        let Some(next) = current.next(event) else {
            return Err(Error::InvalidState(StateError {
                lid: key.lid().to_string(),
                state: current.as_str().to_string(),
                event: event.as_str().to_string(),
                message: illegal_transition_hint(current, event).to_string(),
            }));
        };
        if next != current {
            tracing::trace!(
                lid = key.lid(),
                from = current.as_str(),
                to = next.as_str(),
                event = event.as_str(),
                "Record state transition"
            );
        }
        self.states.insert(key.clone(), next);
        Ok(next)
    }

    /// Force a state without validation; used when a merge transfers state.
    pub fn set(&mut self, key: &ResourceKey, state: RecordState) {
        self.states.insert(key.clone(), state);
    }

    pub fn remove(&mut self, key: &ResourceKey) -> RecordState {
        self.states.remove(key).unwrap_or(RecordState::Empty)
    }

    /// Number of keys in each state path.
    pub fn counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for state in self.states.values() {
            *counts.entry(state.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

fn illegal_transition_hint(state: RecordState, event: LifecycleEvent) -> &'static str {
    match (state, event) {
        (_, LifecycleEvent::Unload) if state.is_dirty() => {
            "rollback or delete and commit the record before unloading it"
        }
        (RecordState::Deleted(_), _) => "the record has been deleted",
        (_, LifecycleEvent::WillCommit) if state.is_saving() => "a commit is already in flight",
        _ => "transition is not allowed",
    }
}
