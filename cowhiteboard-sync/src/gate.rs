//! Echo suppression for remote-origin store mutations.
//!
//! One flag per client, shared between the inbound apply path and the
//! outbound publisher. The flag is only ever raised through [`RemoteScope`],
//! whose `Drop` lowers it again, so a failing apply cannot leave it stuck.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Where the mutation currently being applied came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    Remote,
}

/// Shared "a remote change is being applied" marker.
#[derive(Debug, Clone, Default)]
pub struct EchoGate {
    remote: Arc<AtomicBool>,
}

impl EchoGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag until the returned guard is dropped.
    ///
    /// Must be called before the store mutation whose listeners should see
    /// the flag.
    pub fn enter_remote(&self) -> RemoteScope<'_> {
        let was_open = self.remote.swap(true, Ordering::SeqCst);
        debug_assert!(!was_open, "remote scope entered twice");
        RemoteScope { gate: self }
    }

    pub fn is_open(&self) -> bool {
        self.remote.load(Ordering::SeqCst)
    }

    pub fn origin(&self) -> Origin {
        if self.is_open() {
            Origin::Remote
        } else {
            Origin::User
        }
    }
}

/// Guard returned by [`EchoGate::enter_remote`].
#[must_use = "the gate closes as soon as the scope is dropped"]
pub struct RemoteScope<'a> {
    gate: &'a EchoGate,
}

impl Drop for RemoteScope<'_> {
    fn drop(&mut self) {
        self.gate.remote.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_starts_closed() {
        let gate = EchoGate::new();
        assert!(!gate.is_open());
        assert_eq!(gate.origin(), Origin::User);
    }

    #[test]
    fn test_scope_opens_and_closes() {
        let gate = EchoGate::new();
        {
            let _scope = gate.enter_remote();
            assert!(gate.is_open());
            assert_eq!(gate.origin(), Origin::Remote);
        }
        assert!(!gate.is_open());
    }

    #[test]
    fn test_clones_share_flag() {
        let gate = EchoGate::new();
        let observer = gate.clone();
        let scope = gate.enter_remote();
        assert!(observer.is_open());
        drop(scope);
        assert!(!observer.is_open());
    }

    #[test]
    fn test_scope_released_on_error_path() {
        fn failing_apply(gate: &EchoGate) -> Result<(), String> {
            let _scope = gate.enter_remote();
            Err("store rejected".into())
        }

        let gate = EchoGate::new();
        assert!(failing_apply(&gate).is_err());
        assert!(!gate.is_open());
    }

    #[test]
    fn test_scope_released_on_panic() {
        let gate = EchoGate::new();
        let inner = gate.clone();
        let result = std::panic::catch_unwind(move || {
            let _scope = inner.enter_remote();
            panic!("apply blew up");
        });
        assert!(result.is_err());
        assert!(!gate.is_open());
    }
}
