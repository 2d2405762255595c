//! Applies relay frames to the local document store.
//!
//! Every store mutation made here happens inside one
//! `merge_remote_changes` scope with the echo gate raised, so the outbound
//! publisher never sees it as a local edit. Apply failures are logged and
//! swallowed: a bad frame costs one update, never the connection.

use std::sync::{Arc, Mutex, PoisonError};

use crate::gate::EchoGate;
use crate::protocol::{ChangeSet, RecordMap, ServerMessage};
use crate::store::{DocumentStore, MergeBody, StoreError};

/// What applying a frame did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The frame carried nothing to apply.
    Skipped,
    /// Number of record ids written or deleted.
    Applied(usize),
    /// The frame was rejected or the store refused it.
    Failed,
}

/// Result of handling one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inbound {
    pub outcome: ApplyOutcome,
    /// Presence count to forward to the UI, if the frame carried one.
    pub user_count: Option<u64>,
}

impl Inbound {
    fn ignored() -> Self {
        Self {
            outcome: ApplyOutcome::Skipped,
            user_count: None,
        }
    }
}

/// Applies decoded relay frames to a shared store under the echo gate.
pub struct InboundHandler<S> {
    store: Arc<Mutex<S>>,
    gate: EchoGate,
}

impl<S> Clone for InboundHandler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            gate: self.gate.clone(),
        }
    }
}

impl<S: DocumentStore> InboundHandler<S> {
    pub fn new(store: Arc<Mutex<S>>, gate: EchoGate) -> Self {
        Self { store, gate }
    }

    /// Route one decoded frame.
    pub fn handle(&self, msg: ServerMessage) -> Inbound {
        match msg {
            ServerMessage::Init {
                snapshot,
                user_count,
            } => {
                let outcome = match snapshot {
                    Some(records) if !records.is_empty() => {
                        Self::outcome("snapshot", self.apply_snapshot(records))
                    }
                    _ => ApplyOutcome::Skipped,
                };
                Inbound {
                    outcome,
                    user_count,
                }
            }
            ServerMessage::Update { changes } => {
                let outcome = match changes.validate() {
                    Ok(()) => Self::outcome("update", self.apply_changes(changes)),
                    Err(e) => {
                        log::warn!("Dropping update frame: {e}");
                        ApplyOutcome::Failed
                    }
                };
                Inbound {
                    outcome,
                    user_count: None,
                }
            }
            ServerMessage::UserCount { count } => Inbound {
                outcome: ApplyOutcome::Skipped,
                user_count: Some(count),
            },
            ServerMessage::Other => {
                log::debug!("Ignoring frame of unknown type");
                Inbound::ignored()
            }
        }
    }

    fn outcome(kind: &str, result: Result<usize, StoreError>) -> ApplyOutcome {
        match result {
            Ok(0) => ApplyOutcome::Skipped,
            Ok(n) => {
                log::debug!("Applied remote {kind}: {n} records");
                ApplyOutcome::Applied(n)
            }
            Err(e) => {
                log::warn!("Failed to apply remote {kind}: {e}");
                ApplyOutcome::Failed
            }
        }
    }

    /// Bulk upsert of a full snapshot. Records missing from the snapshot are
    /// left untouched.
    pub fn apply_snapshot(&self, records: RecordMap) -> Result<usize, StoreError> {
        let count = records.len();
        if count == 0 {
            return Ok(0);
        }
        let mut records = records;
        self.apply_remote(&mut |store| store.put(std::mem::take(&mut records)))?;
        Ok(count)
    }

    /// Apply one change set as a single remote batch: upsert `added` and the
    /// new half of `updated`, then delete `removed`.
    pub fn apply_changes(&self, changes: ChangeSet) -> Result<usize, StoreError> {
        let count = changes.len();
        if count == 0 {
            return Ok(0);
        }
        let mut upserts = changes.upserts();
        let removed = changes.removed_ids();
        self.apply_remote(&mut |store| {
            if !upserts.is_empty() {
                store.put(std::mem::take(&mut upserts))?;
            }
            if !removed.is_empty() {
                store.remove(&removed)?;
            }
            Ok(())
        })?;
        Ok(count)
    }

    fn apply_remote(&self, body: &mut MergeBody<'_>) -> Result<(), StoreError> {
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        // Raised after taking the lock (so no local edit can observe it) and
        // before the mutation (so listeners do). Dropped before the lock.
        let _remote = self.gate.enter_remote();
        store.merge_remote_changes(body)
    }
}
