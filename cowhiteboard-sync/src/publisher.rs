//! Turns local document edits into outbound `update` frames.

use crate::gate::{EchoGate, Origin};
use crate::protocol::{ClientMessage, RecordMap};
use crate::store::{
    ChangeScope, ChangeSource, DocumentStore, ListenFilter, ListenerId, StoreEvent,
};
use crate::transport::{Connection, LiveConnection};

/// Publishing policy: only user-sourced, document-scoped changes made while
/// no remote change is being applied.
///
/// The store's own source tag and the echo gate are both required; the store
/// tags some derived changes as user-sourced.
pub fn should_publish(source: ChangeSource, scope: ChangeScope, origin: Origin) -> bool {
    source == ChangeSource::User && scope == ChangeScope::Document && origin == Origin::User
}

/// Store listener that forwards local document edits to the live connection.
pub struct Publisher<K> {
    gate: EchoGate,
    live: LiveConnection<K>,
}

impl<K: Connection> Publisher<K> {
    pub fn new(gate: EchoGate, live: LiveConnection<K>) -> Self {
        Self { gate, live }
    }

    /// Send one store event if policy allows. Returns whether a frame went
    /// out on an open connection.
    pub fn publish(&self, event: &StoreEvent, state: &RecordMap) -> bool {
        if !should_publish(event.source, event.scope, self.gate.origin()) {
            return false;
        }
        if event.changes.is_empty() {
            return false;
        }
        let frame = ClientMessage::update(event.changes.clone(), state.clone());
        self.live.send(&frame)
    }

    /// Subscribe to `store` and publish every qualifying change.
    pub fn register<S: DocumentStore + ?Sized>(self, store: &mut S) -> ListenerId {
        store.listen(
            ListenFilter::user_document(),
            Box::new(move |event, state| {
                self.publish(event, state);
            }),
        )
    }
}
