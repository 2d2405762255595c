//! Document-store boundary consumed by the sync client.
//!
//! The editing engine owns the real record store; this module only names the
//! operations the sync layer needs from it ([`DocumentStore`]) and ships an
//! in-memory implementation ([`MemoryStore`]) for headless use and tests.
//!
//! ```text
//!   local edit ──► put/remove ──► StoreEvent { source: User }   ──► listeners
//!   merge_remote_changes(body) ──► StoreEvent { source: Remote } ──► listeners
//! ```
//!
//! Listeners are called synchronously from inside the mutating call, with
//! the post-change state of the whole store.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::protocol::{ChangeSet, Record, RecordId, RecordMap};

/// Who caused a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeSource {
    /// Direct local action (or anything the store tags as such).
    User,
    /// Applied inside [`DocumentStore::merge_remote_changes`].
    Remote,
}

/// Which part of the store a mutation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeScope {
    /// Shared document content: shapes, pages, bindings, assets.
    Document,
    /// Per-session UI state: camera, selection, pointer.
    Session,
    /// Ephemeral presence records.
    Presence,
}

impl ChangeScope {
    /// Classify a record by the type prefix of its id (`"camera:page1"` →
    /// session).
    pub fn of_record(id: &str) -> Self {
        let type_name = id.split(':').next().unwrap_or(id);
        match type_name {
            "instance" | "instance_page_state" | "camera" | "pointer" => Self::Session,
            "instance_presence" => Self::Presence,
            _ => Self::Document,
        }
    }
}

/// Which events a listener wants. `None` matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenFilter {
    pub source: Option<ChangeSource>,
    pub scope: Option<ChangeScope>,
}

impl ListenFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Only local, document-scoped edits.
    pub fn user_document() -> Self {
        Self {
            source: Some(ChangeSource::User),
            scope: Some(ChangeScope::Document),
        }
    }

    pub fn matches(&self, event: &StoreEvent) -> bool {
        self.source.map_or(true, |s| s == event.source)
            && self.scope.map_or(true, |s| s == event.scope)
    }
}

/// One batch of changes delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub changes: ChangeSet,
    pub source: ChangeSource,
    pub scope: ChangeScope,
}

/// Handle returned by [`DocumentStore::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Store change callback: the event, then the full post-change state.
pub type StoreListener = Box<dyn FnMut(&StoreEvent, &RecordMap) + Send>;

/// Remote-merge body passed to [`DocumentStore::merge_remote_changes`].
pub type MergeBody<'a> = dyn FnMut(&mut dyn DocumentStore) -> Result<(), StoreError> + 'a;

/// Store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid record {id}: {reason}")]
    InvalidRecord { id: RecordId, reason: String },
    #[error("Remote merge already in progress")]
    NestedMerge,
}

/// Operations the sync layer needs from the editing engine's record store.
pub trait DocumentStore: Send {
    /// Upsert records. Last write wins per record.
    fn put(&mut self, records: RecordMap) -> Result<(), StoreError>;

    /// Delete records. Unknown ids are ignored.
    fn remove(&mut self, ids: &[RecordId]) -> Result<(), StoreError>;

    /// Full current state.
    fn serialize(&self) -> RecordMap;

    fn listen(&mut self, filter: ListenFilter, listener: StoreListener) -> ListenerId;

    /// Returns `false` if the listener was not registered.
    fn unlisten(&mut self, id: ListenerId) -> bool;

    /// Run `body` so that every mutation it performs reaches listeners tagged
    /// [`ChangeSource::Remote`].
    fn merge_remote_changes(&mut self, body: &mut MergeBody<'_>) -> Result<(), StoreError>;
}

struct Subscription {
    id: ListenerId,
    filter: ListenFilter,
    callback: StoreListener,
}

/// In-memory record store.
///
/// Mutations outside a remote merge are delivered immediately as
/// [`ChangeSource::User`]. Mutations inside a remote merge are collected and
/// delivered once, as a single [`ChangeSource::Remote`] batch, when the merge
/// body returns. A batch touching several scopes is split into one event per
/// scope.
pub struct MemoryStore {
    records: RecordMap,
    listeners: Vec<Subscription>,
    next_listener: u64,
    /// Pre-merge value of every id touched by the running remote merge.
    pending_remote: Option<BTreeMap<RecordId, Option<Record>>>,
    classify: fn(&str) -> ChangeScope,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RecordMap::new(),
            listeners: Vec::new(),
            next_listener: 0,
            pending_remote: None,
            classify: ChangeScope::of_record,
        }
    }

    /// Seed the store without notifying anyone.
    pub fn with_records(records: RecordMap) -> Self {
        Self {
            records,
            ..Self::new()
        }
    }

    /// Replace the id → scope classification.
    pub fn with_classifier(mut self, classify: fn(&str) -> ChangeScope) -> Self {
        self.classify = classify;
        self
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn validate(id: &str, record: &Record) -> Result<(), StoreError> {
        let invalid = |reason: &str| StoreError::InvalidRecord {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        let Value::Object(fields) = record else {
            return Err(invalid("record is not an object"));
        };
        match fields.get("id") {
            None => Ok(()),
            Some(Value::String(inner)) if inner == id => Ok(()),
            Some(_) => Err(invalid("embedded id does not match key")),
        }
    }

    /// Route touched ids either into the running merge or straight to
    /// listeners.
    fn commit(&mut self, touched: BTreeMap<RecordId, Option<Record>>) {
        match self.pending_remote.as_mut() {
            Some(pending) => {
                for (id, before) in touched {
                    pending.entry(id).or_insert(before);
                }
            }
            None => {
                let changes = self.diff(touched);
                self.emit(changes, ChangeSource::User);
            }
        }
    }

    fn diff(&self, touched: BTreeMap<RecordId, Option<Record>>) -> ChangeSet {
        let mut changes = ChangeSet::new();
        for (id, before) in touched {
            match (before, self.records.get(&id)) {
                (None, Some(now)) => {
                    changes.add(id, now.clone());
                }
                (Some(old), Some(now)) if old != *now => {
                    changes.update(id, old, now.clone());
                }
                (Some(_), None) => {
                    changes.remove(id);
                }
                _ => {}
            }
        }
        changes
    }

    fn emit(&mut self, changes: ChangeSet, source: ChangeSource) {
        if changes.is_empty() {
            return;
        }
        for (scope, part) in changes.partition(self.classify) {
            let event = StoreEvent {
                changes: part,
                source,
                scope,
            };
            for sub in self.listeners.iter_mut() {
                if sub.filter.matches(&event) {
                    (sub.callback)(&event, &self.records);
                }
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn put(&mut self, records: RecordMap) -> Result<(), StoreError> {
        for (id, record) in &records {
            Self::validate(id, record)?;
        }

        let mut touched = BTreeMap::new();
        for (id, record) in records {
            let before = self.records.insert(id.clone(), record);
            touched.entry(id).or_insert(before);
        }
        self.commit(touched);
        Ok(())
    }

    fn remove(&mut self, ids: &[RecordId]) -> Result<(), StoreError> {
        let mut touched = BTreeMap::new();
        for id in ids {
            if let Some(before) = self.records.remove(id) {
                touched.entry(id.clone()).or_insert(Some(before));
            }
        }
        self.commit(touched);
        Ok(())
    }

    fn serialize(&self) -> RecordMap {
        self.records.clone()
    }

    fn listen(&mut self, filter: ListenFilter, listener: StoreListener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push(Subscription {
            id,
            filter,
            callback: listener,
        });
        id
    }

    fn unlisten(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|sub| sub.id != id);
        self.listeners.len() != before
    }

    fn merge_remote_changes(&mut self, body: &mut MergeBody<'_>) -> Result<(), StoreError> {
        if self.pending_remote.is_some() {
            return Err(StoreError::NestedMerge);
        }
        self.pending_remote = Some(BTreeMap::new());

        let result = body(self);

        // Whatever the body managed to apply is still reported.
        let touched = self.pending_remote.take().unwrap_or_default();
        let changes = self.diff(touched);
        self.emit(changes, ChangeSource::Remote);
        result
    }
}
